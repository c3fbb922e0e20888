// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A mutable view over a single packet.
//!
//! [`PktView`] is the engine's window onto one contiguous IPv4 packet
//! buffer, L3 header first. The owning packet-buffer subsystem sits
//! outside this crate; the view can read and rewrite header fields and
//! payload bytes in place, but growing or shrinking the underlying
//! buffer is signaled (via the hook's byte delta) rather than
//! performed here.
//!
//! Every offset into the buffer is derived from an
//! attacker-controlled length field somewhere, so every accessor is a
//! checked slice operation returning [`ReadErr`] on any
//! inconsistency.

use super::ip4::IPV4_VERSION;
use super::ip4::Ipv4HdrRaw;
use super::tcp::TcpHdrRaw;
use super::udp::UdpHdrRaw;
use crate::api::Direction;
use crate::api::Protocol;
use bitflags::bitflags;
use core::fmt;
use zerocopy::FromBytes;

/// An error reading or locating part of the packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadErr {
    /// A declared length points past the end of the buffer, or the
    /// buffer is too short to hold the requested header.
    NotEnoughBytes,
    /// A header is internally inconsistent (bad version, impossible
    /// header length, unexpected protocol).
    BadLayout,
}

impl fmt::Display for ReadErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

bitflags! {
    /// Flags set on the packet by earlier layers of the forwarding
    /// path.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PktFlags: u8 {
        /// An earlier layer found the packet malformed/truncated.
        const MALFORMED = 1 << 0;
        /// The packet is an IP fragment.
        const FRAGMENT = 1 << 1;
        /// The packet has been coalesced into a single contiguous
        /// buffer.
        const COALESCED = 1 << 2;
        /// An upstream layer (e.g. hardware offload) already
        /// verified the ULP checksum.
        const CSUM_VERIFIED = 1 << 3;
    }
}

/// A mutable view over one contiguous IPv4 packet.
#[derive(Debug)]
pub struct PktView<'a> {
    dir: Direction,
    flags: PktFlags,
    bytes: &'a mut [u8],
}

impl<'a> PktView<'a> {
    /// Wrap a packet buffer. The buffer is presumed contiguous, so
    /// the view starts out coalesced; callers modeling a fragmented
    /// arrival clear [`PktFlags::COALESCED`] themselves.
    pub fn new(dir: Direction, bytes: &'a mut [u8]) -> Self {
        Self { dir, flags: PktFlags::COALESCED, bytes }
    }

    pub fn dir(&self) -> Direction {
        self.dir
    }

    pub fn flags(&self) -> PktFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: PktFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: PktFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: PktFlags) {
        self.flags.remove(flag);
    }

    /// Request that the packet be coalesced into a single contiguous
    /// view. This view is already contiguous, so the request succeeds
    /// trivially unless the packet is an uncoalesced fragment -- a
    /// lone fragment cannot be completed from here.
    pub fn coalesce(&mut self) -> Result<(), ReadErr> {
        if self.flags.contains(PktFlags::FRAGMENT)
            && !self.flags.contains(PktFlags::COALESCED)
        {
            return Err(ReadErr::NotEnoughBytes);
        }

        self.flags.insert(PktFlags::COALESCED);
        Ok(())
    }

    pub fn ip4(&self) -> Result<&Ipv4HdrRaw, ReadErr> {
        let (hdr, _) = Ipv4HdrRaw::ref_from_prefix(&*self.bytes)
            .map_err(|_| ReadErr::NotEnoughBytes)?;

        if hdr.version() != IPV4_VERSION {
            return Err(ReadErr::BadLayout);
        }

        if hdr.hdr_len() < Ipv4HdrRaw::BASE_SIZE
            || hdr.hdr_len() > self.bytes.len()
        {
            return Err(ReadErr::BadLayout);
        }

        Ok(hdr)
    }

    pub fn ip4_mut(&mut self) -> Result<&mut Ipv4HdrRaw, ReadErr> {
        // Run the read-side validation first.
        self.ip4()?;
        let (hdr, _) = Ipv4HdrRaw::mut_from_prefix(&mut *self.bytes)
            .map_err(|_| ReadErr::NotEnoughBytes)?;
        Ok(hdr)
    }

    /// The offset of the L4 header, i.e. the IP header length.
    pub fn l4_offset(&self) -> Result<usize, ReadErr> {
        Ok(self.ip4()?.hdr_len())
    }

    pub fn l4_proto(&self) -> Result<u8, ReadErr> {
        Ok(self.ip4()?.proto)
    }

    /// The packet's total length as declared by the IP header,
    /// validated against the actual buffer.
    pub fn total_len(&self) -> Result<usize, ReadErr> {
        let decl = self.ip4()?.total_len.get() as usize;
        if decl < self.ip4()?.hdr_len() || decl > self.bytes.len() {
            return Err(ReadErr::NotEnoughBytes);
        }
        Ok(decl)
    }

    /// Rewrite the IP header's total length field. The header
    /// checksum is not touched; the caller repairs it.
    pub fn set_total_len(&mut self, len: u16) -> Result<(), ReadErr> {
        self.ip4_mut()?.total_len.set(len);
        Ok(())
    }

    pub fn tcp(&self) -> Result<&TcpHdrRaw, ReadErr> {
        if self.l4_proto()? != Protocol::Tcp as u8 {
            return Err(ReadErr::BadLayout);
        }

        let off = self.l4_offset()?;
        let end = self.total_len()?;
        let (hdr, _) = TcpHdrRaw::ref_from_prefix(&self.bytes[off..end])
            .map_err(|_| ReadErr::NotEnoughBytes)?;

        if hdr.hdr_len() < TcpHdrRaw::BASE_SIZE
            || off + hdr.hdr_len() > end
        {
            return Err(ReadErr::BadLayout);
        }

        Ok(hdr)
    }

    pub fn tcp_mut(&mut self) -> Result<&mut TcpHdrRaw, ReadErr> {
        self.tcp()?;
        let off = self.l4_offset()?;
        let (hdr, _) = TcpHdrRaw::mut_from_prefix(&mut self.bytes[off..])
            .map_err(|_| ReadErr::NotEnoughBytes)?;
        Ok(hdr)
    }

    pub fn udp(&self) -> Result<&UdpHdrRaw, ReadErr> {
        if self.l4_proto()? != Protocol::Udp as u8 {
            return Err(ReadErr::BadLayout);
        }

        let off = self.l4_offset()?;
        let end = self.total_len()?;
        let (hdr, _) = UdpHdrRaw::ref_from_prefix(&self.bytes[off..end])
            .map_err(|_| ReadErr::NotEnoughBytes)?;
        Ok(hdr)
    }

    pub fn udp_mut(&mut self) -> Result<&mut UdpHdrRaw, ReadErr> {
        self.udp()?;
        let off = self.l4_offset()?;
        let (hdr, _) = UdpHdrRaw::mut_from_prefix(&mut self.bytes[off..])
            .map_err(|_| ReadErr::NotEnoughBytes)?;
        Ok(hdr)
    }

    /// The offset of the ULP payload.
    pub fn payload_offset(&self) -> Result<usize, ReadErr> {
        let off = self.l4_offset()?;
        match Protocol::try_from(self.l4_proto()?) {
            Ok(Protocol::Tcp) => Ok(off + self.tcp()?.hdr_len()),
            Ok(Protocol::Udp) => Ok(off + UdpHdrRaw::SIZE),
            _ => Err(ReadErr::BadLayout),
        }
    }

    pub fn payload(&self) -> Result<&[u8], ReadErr> {
        let start = self.payload_offset()?;
        let end = self.total_len()?;
        if start > end {
            return Err(ReadErr::NotEnoughBytes);
        }
        Ok(&self.bytes[start..end])
    }

    pub fn payload_mut(&mut self) -> Result<&mut [u8], ReadErr> {
        let start = self.payload_offset()?;
        let end = self.total_len()?;
        if start > end {
            return Err(ReadErr::NotEnoughBytes);
        }
        Ok(&mut self.bytes[start..end])
    }

    pub fn payload_len(&self) -> Result<usize, ReadErr> {
        Ok(self.total_len()? - self.payload_offset()?)
    }

    /// The L4 header plus payload, as bounded by the IP total length.
    pub fn ulp_slice(&self) -> Result<&[u8], ReadErr> {
        let off = self.l4_offset()?;
        let end = self.total_len()?;
        Ok(&self.bytes[off..end])
    }

    /// Write `csum` into the L4 checksum field.
    pub fn set_ulp_csum(&mut self, csum: [u8; 2]) -> Result<(), ReadErr> {
        match Protocol::try_from(self.l4_proto()?) {
            Ok(Protocol::Tcp) => self.tcp_mut()?.csum = csum,
            Ok(Protocol::Udp) => self.udp_mut()?.csum = csum,
            _ => return Err(ReadErr::BadLayout),
        }
        Ok(())
    }
}
