// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The PPTP control-channel proxy.
//!
//! PPTP negotiates its GRE data channel over a TCP control
//! connection on port 1723: each end assigns itself a call ID in the
//! call setup messages, and the subsequent GRE packets carry those
//! IDs where a NAT would expect ports. This proxy reads the control
//! conversation as it is forwarded and, when a call is answered,
//! plants a GRE mapping and a state entry so the data channel flows
//! through the translation the moment it starts.
//!
//! The proxy never modifies payload bytes; its packet hook always
//! reports a zero delta. A stream it cannot parse is refused;
//! frames it parses but does not recognize pass through without
//! effect.

use crate::framing::CtlMessage;
use crate::framing::Frame;
use crate::framing::FrameError;
use crate::framing::FramingBuffer;
use crate::framing::MSG_TYPE_CONTROL;
use crate::framing::call_ids;
use crate::framing::msg_type;
use crate::framing::reassemble;
use crate::framing::subtype;
use alp::api::Direction;
use alp::api::Protocol;
use alp::engine::dispatch::HookVerdict;
use alp::engine::nat::FlowId;
use alp::engine::nat::NatError;
use alp::engine::nat::NatMapping;
use alp::engine::nat::NatRule;
use alp::engine::packet::PktView;
use alp::engine::registry::HookError;
use alp::engine::registry::ProxyCaps;
use alp::engine::registry::ProxyCtx;
use alp::engine::registry::ProxyDescriptor;
use alp::engine::registry::ProxyHandler;
use alp::engine::session::ProxySession;
use alp::engine::session::Session;
use alp::engine::state::Ttl;
use alp::engine::tcp::TcpFlags;
use core::any::Any;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub const PPTP_NAME: &str = "pptp";
pub const PPTP_PORT: u16 = 1723;

/// TTL given to a freshly created (or refreshed) GRE state entry.
/// The data channel refreshes it by its own traffic thereafter.
pub const GRE_STATE_TTL: Ttl = Ttl::new_seconds(120);

/// Build the registry descriptor for this proxy.
pub fn descriptor() -> Arc<ProxyDescriptor> {
    ProxyDescriptor::new(PPTP_NAME, Protocol::Tcp, Arc::new(PptpProxy))
}

/// Per-connection proxy state: one reassembly buffer and one
/// last-accepted-message slot per side, plus the GRE flow this
/// session has planted, if any.
pub struct PptpSession {
    sides: [FramingBuffer; 2],
    last_msg: [Option<CtlMessage>; 2],
    gre_flow: Option<FlowId>,
    gre_rule: Arc<NatRule>,
}

impl ProxySession for PptpSession {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl PptpSession {
    pub fn gre_flow(&self) -> Option<&FlowId> {
        self.gre_flow.as_ref()
    }
}

/// The addresses of the control connection, copied out of the parent
/// mapping for the classifier.
#[derive(Clone, Copy)]
struct ParentFlow {
    inside_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
}

enum FrameAction {
    Continue,
    Terminate,
}

/// Classify one reassembled control frame and apply its effect.
///
/// Replies are only acted on when the matching request from the
/// other side is on record; a reply out of thin air, like a frame
/// the classifier does not recognize at all, passes through without
/// touching the transition state. The two call-reply messages
/// additionally carry the negotiated call-ID pair and trigger
/// creation of the GRE secondary flow.
fn classify_frame(
    dir: Direction,
    frame: &[u8],
    last_msg: &mut [Option<CtlMessage>; 2],
    gre_flow: &mut Option<FlowId>,
    parent: ParentFlow,
    rule: &Arc<NatRule>,
    ctx: &mut ProxyCtx,
) -> Result<FrameAction, FrameError> {
    // Only control frames carry a subtype; management frames share
    // the wire format but are none of our business.
    if msg_type(frame) != Some(MSG_TYPE_CONTROL) {
        return Ok(FrameAction::Continue);
    }

    let Some(st) = subtype(frame) else {
        return Ok(FrameAction::Continue);
    };
    let Ok(msg) = CtlMessage::try_from(st) else {
        return Ok(FrameAction::Continue);
    };

    use CtlMessage::*;
    let precursor = match msg {
        StartReply => Some(StartRequest),
        StopReply => Some(StopRequest),
        EchoReply => Some(EchoRequest),
        OutCallReply => Some(OutCallRequest),
        InCallReply => Some(InCallRequest),
        InCallConnected => Some(InCallReply),
        _ => None,
    };

    if let Some(required) = precursor
        && last_msg[dir.flip().index()] != Some(required)
    {
        return Ok(FrameAction::Continue);
    }

    last_msg[dir.index()] = Some(msg);

    match msg {
        OutCallReply | InCallReply => {
            if let Some((call_id, peer_call_id)) = call_ids(frame) {
                establish_secondary_flow(
                    dir,
                    call_id,
                    peer_call_id,
                    parent,
                    rule,
                    gre_flow,
                    ctx,
                )?;
            }
        }
        StopReply => return Ok(FrameAction::Terminate),
        _ => (),
    }

    Ok(FrameAction::Continue)
}

/// Create (or refresh) the GRE mapping and state entry for an
/// answered call.
///
/// `call_id` is the ID the sender of the reply assigned to itself;
/// `peer_call_id` echoes the one from the request. The flow key is
/// oriented onto the inside host, so which is which depends on the
/// direction the reply traveled.
fn establish_secondary_flow(
    dir: Direction,
    call_id: u16,
    peer_call_id: u16,
    parent: ParentFlow,
    rule: &Arc<NatRule>,
    gre_flow: &mut Option<FlowId>,
    ctx: &mut ProxyCtx,
) -> Result<(), FrameError> {
    let (inside_id, remote_id) = match dir {
        Direction::In => (peer_call_id, call_id),
        Direction::Out => (call_id, peer_call_id),
    };

    let flow = FlowId {
        proto: Protocol::Gre,
        src_ip: parent.inside_ip,
        src_id: inside_id,
        dst_ip: parent.remote_ip,
        dst_id: remote_id,
    };

    let now = ctx.state.now_millis();
    if ctx.nat.lookup(&flow).is_some() {
        // A retransmitted reply for a call we already plumbed.
        if let Some(entry) = ctx.state.lookup(&flow) {
            entry.refresh(now, GRE_STATE_TTL);
        }
    } else {
        let mapping = NatMapping {
            dir: rule.dir,
            proto: Protocol::Gre,
            inside_ip: parent.inside_ip,
            inside_id,
            outside_ip: rule.outside_ip,
            outside_id: inside_id,
            remote_ip: parent.remote_ip,
            remote_id,
            rule: rule.clone(),
            session: None,
        };
        ctx.nat.add(mapping).map_err(|e| match e {
            NatError::MaxCapacity(_) | NatError::Exists => {
                FrameError::Resource
            }
        })?;
        ctx.state.insert(flow, GRE_STATE_TTL);
    }

    *gre_flow = Some(flow);
    Ok(())
}

pub struct PptpProxy;

impl ProxyHandler for PptpProxy {
    fn caps(&self) -> ProxyCaps {
        ProxyCaps::NEW
            | ProxyCaps::DELETE
            | ProxyCaps::INBOUND
            | ProxyCaps::OUTBOUND
            | ProxyCaps::MATCH
    }

    fn matches(&self, pkt: &PktView, _mapping: &NatMapping) -> bool {
        matches!(
            pkt.tcp(),
            Ok(tcp) if tcp.dst_port.get() == PPTP_PORT
                || tcp.src_port.get() == PPTP_PORT
        )
    }

    fn new_session(
        &self,
        _pkt: &PktView,
        mapping: &mut NatMapping,
        ctx: &mut ProxyCtx,
    ) -> Result<Option<Box<dyn ProxySession>>, HookError> {
        // GRE carries no port numbers, so only one data channel per
        // host pair can be told apart. A second control connection
        // between the same hosts cannot be serviced while the first
        // still owns a GRE mapping.
        let dup = ctx.nat.iter().any(|m| {
            m.proto == Protocol::Gre
                && m.inside_ip == mapping.inside_ip
                && m.remote_ip == mapping.remote_ip
        });
        if dup {
            return Err(HookError("gre channel already mapped"));
        }

        let gre_rule = Arc::new(NatRule {
            proto: Protocol::Gre,
            dir: mapping.rule.dir,
            ifname: mapping.rule.ifname.clone(),
            outside_ip: mapping.rule.outside_ip,
        });

        Ok(Some(Box::new(PptpSession {
            sides: Default::default(),
            last_msg: [None; 2],
            gre_flow: None,
            gre_rule,
        })))
    }

    fn delete_session(&self, session: &mut Session, ctx: &mut ProxyCtx) {
        let Some(state) = session.state_as::<PptpSession>() else {
            return;
        };
        let Some(flow) = state.gre_flow else {
            return;
        };

        // The mapping stays so in-flight GRE packets still translate,
        // but its clock runs out shortly.
        let now = ctx.state.now_millis();
        if let Some(entry) = ctx.state.lookup(&flow) {
            entry.mark_imminent(now);
        }
    }

    fn packet(
        &self,
        dir: Direction,
        pkt: &mut PktView,
        session: &mut Session,
        mapping: &mut NatMapping,
        ctx: &mut ProxyCtx,
    ) -> HookVerdict {
        let Ok(tcp) = pkt.tcp() else {
            return HookVerdict::Drop;
        };
        let (seq, ack, flags) = (tcp.seq.get(), tcp.ack.get(), tcp.flags);

        let Some(state) = session.state_as_mut::<PptpSession>() else {
            return HookVerdict::Drop;
        };

        // The handshake pins down both reassembly cursors. A session
        // bound mid-connection never sees one, and its payload is
        // refused below until the connection is re-established.
        if flags & TcpFlags::SYN != 0 {
            state.sides[dir.index()].sync(seq.wrapping_add(1));
            if flags & TcpFlags::ACK != 0 {
                state.sides[dir.flip().index()].sync(ack);
            }
            return HookVerdict::Pass { delta: 0 };
        }

        let Ok(payload) = pkt.payload() else {
            return HookVerdict::Drop;
        };
        if payload.is_empty() {
            return HookVerdict::Pass { delta: 0 };
        }

        let parent = ParentFlow {
            inside_ip: mapping.inside_ip,
            remote_ip: mapping.remote_ip,
        };

        let PptpSession { sides, last_msg, gre_flow, gre_rule } = state;
        let fb = &mut sides[dir.index()];
        let mut terminate = false;
        let res = reassemble(fb, seq, payload, |frame: Frame| {
            if let FrameAction::Terminate = classify_frame(
                dir,
                &frame,
                &mut *last_msg,
                &mut *gre_flow,
                parent,
                gre_rule,
                &mut *ctx,
            )? {
                terminate = true;
            }
            Ok(())
        });

        match res {
            Ok(()) if terminate => HookVerdict::Terminate,
            Ok(()) => HookVerdict::Pass { delta: 0 },
            Err(e) => {
                alp::err!("pptp {}: {}", dir, e);
                HookVerdict::Drop
            }
        }
    }
}
