// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-packet dispatch into a bound proxy.
//!
//! [`on_packet`] is the single entry point the forwarding path calls
//! for every packet of a proxied connection, in both directions. It
//! validates the packet, runs the proxy's packet hook, and repairs
//! whatever the hook's edits broke: the IP total length and header
//! checksum when the payload length changed, TCP sequence/ack numbers
//! across the edit boundary, and the transport checksum. It never
//! allocates; all rewrites happen in place.

use crate::api::Direction;
use crate::api::Protocol;
use crate::engine::checksum::len_fixup;
use crate::engine::checksum::ulp_csum;
use crate::engine::nat::NatMapping;
use crate::engine::packet::PktFlags;
use crate::engine::packet::PktView;
use crate::engine::packet::ReadErr;
use crate::engine::registry::ProxyCaps;
use crate::engine::registry::ProxyCtx;
use crate::engine::registry::ProxyRegistry;
use crate::engine::session::Session;
use crate::engine::tcp::TcpFlags;

/// What the dispatch engine did with the packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchResult {
    /// No proxy session is bound to this flow; the forwarding path
    /// carries on without us.
    NotHandled,
    /// The packet was processed (and possibly rewritten) and may
    /// continue on its way.
    Handled,
    /// The packet must not be forwarded.
    Dropped,
}

/// A proxy packet hook's verdict on one packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookVerdict {
    /// Forward the packet. `delta` is the net change the hook made to
    /// the payload length, zero when nothing was resized.
    Pass { delta: i32 },
    /// Drop the packet, keep the session.
    Drop,
    /// Drop the packet and tear the session down; the proxied
    /// protocol has ended.
    Terminate,
}

/// Verify the transport checksum, where one applies. A zero UDP
/// checksum means "not computed" and passes; protocols without a
/// checksum the engine knows pass trivially.
fn ulp_csum_ok(pkt: &PktView) -> Result<bool, ReadErr> {
    let proto = pkt.l4_proto()?;
    let stored = match Protocol::try_from(proto) {
        Ok(Protocol::Tcp) => pkt.tcp()?.csum,
        Ok(Protocol::Udp) => {
            let csum = pkt.udp()?.csum;
            if csum == [0, 0] {
                return Ok(true);
            }
            csum
        }
        _ => return Ok(true),
    };

    let (src, dst) = {
        let ip = pkt.ip4()?;
        (ip.src, ip.dst)
    };
    Ok(stored == ulp_csum(src, dst, proto, pkt.ulp_slice()?))
}

/// Repair the packet after the hook ran: length fields, seq/ack,
/// checksums. Returns the packet's wire length for accounting.
fn apply_rewrites(
    pkt: &mut PktView,
    session: &mut Session,
    delta: i32,
) -> Result<usize, ReadErr> {
    if delta != 0 {
        let old_len = pkt.total_len()? as u16;
        let new_len = (old_len as i32 + delta) as u16;
        pkt.set_total_len(new_len)?;
        let hdr = pkt.ip4_mut()?;
        hdr.csum = len_fixup(hdr.csum, old_len, new_len);
    }

    let proto = Protocol::try_from(pkt.l4_proto()?)
        .map_err(|_| ReadErr::BadLayout)?;

    match proto {
        Protocol::Tcp => {
            // The payload length enters the seq/ack bookkeeping
            // post-edit, so it is read after the length rewrite.
            let payload_len = pkt.payload_len()? as u32;
            let (seq, ack) = {
                let tcp = pkt.tcp()?;
                (tcp.seq.get(), tcp.ack.get())
            };

            let fix =
                session.seqack().fixup(pkt.dir(), seq, ack, payload_len, delta);
            if let Some(seq) = fix.seq {
                pkt.tcp_mut()?.seq.set(seq);
            }
            if let Some(ack) = fix.ack {
                pkt.tcp_mut()?.ack.set(ack);
            }

            // Recompute rather than patch: the hook may have edited
            // payload bytes without telling us.
            let (src, dst) = {
                let ip = pkt.ip4()?;
                (ip.src, ip.dst)
            };
            let csum =
                ulp_csum(src, dst, Protocol::Tcp as u8, pkt.ulp_slice()?);
            pkt.set_ulp_csum(csum)?;
        }
        Protocol::Udp => {
            if pkt.udp()?.csum != [0, 0] {
                let (src, dst) = {
                    let ip = pkt.ip4()?;
                    (ip.src, ip.dst)
                };
                let csum =
                    ulp_csum(src, dst, Protocol::Udp as u8, pkt.ulp_slice()?);
                pkt.set_ulp_csum(csum)?;
            }
        }
        Protocol::Gre => {}
    }

    pkt.total_len()
}

/// Run one packet of a (possibly) proxied flow through its session.
pub fn on_packet(
    registry: &ProxyRegistry,
    pkt: &mut PktView,
    mapping: &mut NatMapping,
    ctx: &mut ProxyCtx,
) -> DispatchResult {
    if pkt.has_flag(PktFlags::MALFORMED) {
        return DispatchResult::Dropped;
    }

    if !pkt.has_flag(PktFlags::CSUM_VERIFIED) {
        match ulp_csum_ok(pkt) {
            Ok(true) => (),
            Ok(false) => {
                crate::err!("{} bad ULP checksum, dropped", pkt.dir());
                return DispatchResult::Dropped;
            }
            Err(_) => return DispatchResult::Dropped,
        }
    }

    // The mapping's session slot is taken for the duration of the
    // hook so the hook can be handed the mapping and the session as
    // separate borrows. Every exit below restores it, except
    // termination.
    let Some(mut session) = mapping.session.take() else {
        return DispatchResult::NotHandled;
    };

    let proto_matches = pkt
        .l4_proto()
        .map(|p| p == session.proto() as u8)
        .unwrap_or(false);
    if !proto_matches {
        mapping.session = Some(session);
        return DispatchResult::NotHandled;
    }

    if pkt.has_flag(PktFlags::FRAGMENT)
        && !pkt.has_flag(PktFlags::COALESCED)
        && pkt.coalesce().is_err()
    {
        mapping.session = Some(session);
        return DispatchResult::Dropped;
    }

    // A RST carries no payload worth parsing and the connection is
    // done either way; skip the hook but still fix the packet up and
    // account for it.
    let is_rst =
        matches!(pkt.tcp(), Ok(tcp) if tcp.has_flag(TcpFlags::RST));

    let verdict = if is_rst {
        HookVerdict::Pass { delta: 0 }
    } else {
        let handler = session.proxy().handler().clone();
        let dir_cap = match pkt.dir() {
            Direction::In => ProxyCaps::INBOUND,
            Direction::Out => ProxyCaps::OUTBOUND,
        };
        if handler.caps().contains(dir_cap) {
            handler.packet(pkt.dir(), pkt, &mut session, mapping, ctx)
        } else {
            HookVerdict::Pass { delta: 0 }
        }
    };

    match verdict {
        HookVerdict::Pass { delta } => {
            match apply_rewrites(pkt, &mut session, delta) {
                Ok(wire_len) => {
                    session.account(pkt.dir(), wire_len as u64);
                    mapping.session = Some(session);
                    DispatchResult::Handled
                }
                Err(_) => {
                    mapping.session = Some(session);
                    DispatchResult::Dropped
                }
            }
        }

        HookVerdict::Drop => {
            mapping.session = Some(session);
            DispatchResult::Dropped
        }

        HookVerdict::Terminate => {
            session.destroy(registry, ctx);
            DispatchResult::Dropped
        }
    }
}
