// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Types for calculating the internet checksum.
//!
//! The [`Checksum`] type provides a rolling one's complement sum,
//! allowing one to build up (or incrementally update) a sum before
//! finalizing it into a [`HeaderChecksum`], which is the value stored
//! in the actual header bytes.
//!
//! A note on endianness: the checksum field is not a logical `u16`,
//! it is a pair of bytes. Both the field and the bytes being summed
//! are treated as native 16-bit integers; because the summed bytes
//! are in network order, the finalized sum lands in network order
//! too. Never byte-swap a checksum. See RFC 1071 §1.B.
//!
//! Relevant RFCs:
//!
//! * 1071 Computing the Internet Checksum
//!
//! * 1624 Computation of the Internet Checksum via Incremental Update

/// The checksum value as it is contained in a network header.
///
/// Notably, it holds the bytes with one's complement applied.
pub struct HeaderChecksum {
    inner: [u8; 2],
}

impl HeaderChecksum {
    /// Return the bytes of this header checksum.
    pub fn bytes(&self) -> [u8; 2] {
        self.inner
    }

    /// Wrap a pair of header bytes which represent a checksum --
    /// i.e., the one's complement of a one's complement sum.
    pub fn wrap(hc: [u8; 2]) -> Self {
        Self { inner: hc }
    }
}

impl From<Checksum> for HeaderChecksum {
    /// Finalize the rolling checksum and put it into header form by
    /// performing one's complement.
    fn from(mut csum: Checksum) -> HeaderChecksum {
        // See the module-level comment about why it's important to
        // convert using native-endian.
        Self { inner: (!csum.finalize()).to_ne_bytes() }
    }
}

/// A rolling one's complement checksum calculation.
///
/// Summing carries is delayed until the finalized sum is needed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    /// Creates a new checksum counter.
    pub fn new() -> Self {
        Self::from(0)
    }

    /// Update the sum by adding the contents of `bytes`.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.inner = csum_add(self.inner, bytes);
    }

    /// Create a new rolling checksum, starting with the passed in
    /// `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        Self { inner: csum_add(0, bytes) }
    }

    /// Update the sum by subtracting the contents of `bytes`.
    ///
    /// This is useful for incrementally updating an existing checksum
    /// where only a portion of the bytes are being rewritten.
    pub fn sub_bytes(&mut self, bytes: &[u8]) {
        self.inner = csum_sub(self.inner, bytes);
    }

    /// Finalize the sum by adding up all the accumulated carries and
    /// returning the resulting value as a `u16`.
    pub fn finalize(&mut self) -> u16 {
        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        (self.inner & 0xFFFF) as u16
    }
}

impl From<HeaderChecksum> for Checksum {
    // Convert a header's checksum bytes into a rolling checksum.
    fn from(hc: HeaderChecksum) -> Self {
        // See the module-level comment about why it's important to
        // convert using native-endian.
        Self { inner: (!u16::from_ne_bytes(hc.bytes())) as u32 }
    }
}

impl From<u32> for Checksum {
    fn from(csum: u32) -> Self {
        Self { inner: csum }
    }
}

fn csum_add(mut csum: u32, bytes: &[u8]) -> u32 {
    let mut len = bytes.len();
    let mut pos = 0;

    while len > 1 {
        // See the module-level comment about why it's important to
        // convert using native-endian.
        csum += (u16::from_ne_bytes([bytes[pos], bytes[pos + 1]])) as u32;
        pos += 2;
        len -= 2;
    }

    if len == 1 {
        csum += bytes[pos] as u32;
    }

    csum
}

fn csum_sub(mut csum: u32, bytes: &[u8]) -> u32 {
    let mut len = bytes.len();
    let mut pos = 0;

    while len > 1 {
        let sub = (!u16::from_ne_bytes([bytes[pos], bytes[pos + 1]])) as u32;
        csum += sub;
        pos += 2;
        len -= 2;
    }

    if len == 1 {
        csum += (!bytes[pos]) as u32;
    }

    csum
}

/// Incrementally repair a header checksum after a 16-bit length field
/// changed from `old_len` to `new_len`.
///
/// This is the subtract-old/add-new/fold method of RFC 1624, used by
/// the dispatch engine to fix the IPv4 header checksum after a proxy
/// reports a payload length delta.
pub fn len_fixup(hc: [u8; 2], old_len: u16, new_len: u16) -> [u8; 2] {
    let mut csum = Checksum::from(HeaderChecksum::wrap(hc));
    csum.sub_bytes(&old_len.to_be_bytes());
    csum.add_bytes(&new_len.to_be_bytes());
    HeaderChecksum::from(csum).bytes()
}

/// Compute an IPv4 header checksum over `hdr`, ignoring the stored
/// checksum field (bytes 10 and 11).
///
/// `hdr` must be the complete header, options included.
pub fn ipv4_hdr_csum(hdr: &[u8]) -> [u8; 2] {
    let mut csum = Checksum::compute(&hdr[..10]);
    csum.add_bytes(&hdr[12..]);
    HeaderChecksum::from(csum).bytes()
}

/// Compute a TCP or UDP checksum.
///
/// `l4` is the transport header plus payload; the checksum field
/// within it is skipped. The pseudo-header is derived from
/// `src`/`dst`/`proto` and the length of `l4`.
///
/// Panics if `proto` is not TCP or UDP; nothing else carries a ULP
/// checksum the engine knows how to locate.
pub fn ulp_csum(src: [u8; 4], dst: [u8; 4], proto: u8, l4: &[u8]) -> [u8; 2] {
    let csum_off = match proto {
        6 => 16,
        17 => 6,
        _ => panic!("no ULP checksum for protocol {}", proto),
    };

    let mut csum = Checksum::new();
    csum.add_bytes(&src);
    csum.add_bytes(&dst);
    csum.add_bytes(&[0, proto]);
    csum.add_bytes(&(l4.len() as u16).to_be_bytes());
    // The checksum field itself counts as zero. The leading slice is
    // always of even length, so 16-bit alignment of the sum holds.
    csum.add_bytes(&l4[..csum_off]);
    csum.add_bytes(&l4[csum_off + 2..]);
    HeaderChecksum::from(csum).bytes()
}
