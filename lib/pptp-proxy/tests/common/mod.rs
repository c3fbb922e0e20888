// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routines shared among integration tests: building fully
//! checksummed packets and PPTP control frames.

use alp::engine::checksum::ipv4_hdr_csum;
use alp::engine::checksum::ulp_csum;
use pptp_proxy::framing::MSG_TYPE_CONTROL;
use pptp_proxy::framing::PPTP_MAGIC;
use std::net::Ipv4Addr;

/// Build a complete IPv4+TCP packet with valid header and transport
/// checksums.
#[allow(clippy::too_many_arguments)]
pub fn tcp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let total = 40 + payload.len();
    let mut pkt = Vec::with_capacity(total);
    pkt.extend_from_slice(&[0x45, 0x00]);
    pkt.extend_from_slice(&(total as u16).to_be_bytes());
    pkt.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x40, 0x06, 0, 0]);
    pkt.extend_from_slice(&src.octets());
    pkt.extend_from_slice(&dst.octets());
    let csum = ipv4_hdr_csum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&csum);

    pkt.extend_from_slice(&sport.to_be_bytes());
    pkt.extend_from_slice(&dport.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&ack.to_be_bytes());
    pkt.extend_from_slice(&[0x50, flags]);
    pkt.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
    pkt.extend_from_slice(payload);
    let csum = ulp_csum(src.octets(), dst.octets(), 6, &pkt[20..]);
    pkt[36..38].copy_from_slice(&csum);
    pkt
}

/// Build a PPTP frame with an arbitrary message type: fixed header
/// followed by `body`.
pub fn typed_frame(msg_type: u16, body: &[u8]) -> Vec<u8> {
    let len = (8 + body.len()) as u16;
    let mut v = Vec::new();
    v.extend_from_slice(&len.to_be_bytes());
    v.extend_from_slice(&msg_type.to_be_bytes());
    v.extend_from_slice(&PPTP_MAGIC.to_be_bytes());
    v.extend_from_slice(body);
    v
}

/// Build a PPTP control frame: fixed header, subtype, reserved,
/// `extra` body bytes.
pub fn ctl_frame(subtype: u16, extra: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&subtype.to_be_bytes());
    body.extend_from_slice(&[0, 0]);
    body.extend_from_slice(extra);
    typed_frame(MSG_TYPE_CONTROL, &body)
}

/// A call-reply body fragment: the sender's call ID followed by the
/// peer's echoed one, at frame offsets 12 and 14.
pub fn call_id_pair(call_id: u16, peer_call_id: u16) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&call_id.to_be_bytes());
    v.extend_from_slice(&peer_call_id.to_be_bytes());
    v
}
