// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 headers.

use core::mem::size_of;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::network_endian::U16;

pub const IPV4_HDR_VER_MASK: u8 = 0xF0;
pub const IPV4_HDR_LEN_MASK: u8 = 0x0F;
pub const IPV4_VERSION: u8 = 4;

/// Note: For now we keep this unaligned to be safe.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Ipv4HdrRaw {
    pub ver_hdr_len: u8,
    pub dscp_ecn: u8,
    pub total_len: U16,
    pub ident: U16,
    pub frag_and_flags: U16,
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl Ipv4HdrRaw {
    pub const BASE_SIZE: usize = size_of::<Self>();

    /// The header length in bytes, options included, as declared by
    /// the IHL field.
    pub fn hdr_len(&self) -> usize {
        ((self.ver_hdr_len & IPV4_HDR_LEN_MASK) as usize) * 4
    }

    pub fn version(&self) -> u8 {
        (self.ver_hdr_len & IPV4_HDR_VER_MASK) >> 4
    }
}
