// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The per-connection proxy session.
//!
//! A session binds one NAT mapping to one proxy for the life of the
//! connection. It owns the proxy's per-connection protocol state
//! (opaque to the engine, downcast by the proxy itself) and the
//! seq/ack rewrite state, and counts the traffic it has seen.

use crate::api::Direction;
use crate::api::Protocol;
use crate::engine::nat::NatMapping;
use crate::engine::packet::PktView;
use crate::engine::registry::HookError;
use crate::engine::registry::ProxyCaps;
use crate::engine::registry::ProxyCtx;
use crate::engine::registry::ProxyDescriptor;
use crate::engine::registry::ProxyRegistry;
use crate::engine::registry::RegistryError;
use crate::engine::seqack::SeqAckState;
use core::any::Any;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;

/// Per-connection state a proxy hangs off the session. The engine
/// never looks inside; the proxy downcasts through `Any`.
pub trait ProxySession: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SessionStats {
    pkts: [u64; 2],
    bytes: [u64; 2],
}

impl SessionStats {
    pub fn pkts(&self, dir: Direction) -> u64 {
        self.pkts[dir.index()]
    }

    pub fn bytes(&self, dir: Direction) -> u64 {
        self.bytes[dir.index()]
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionError {
    Registry(RegistryError),
    NoMatch,
    Hook(HookError),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::Registry(e) => write!(f, "registry: {e}"),
            SessionError::NoMatch => write!(f, "proxy declined the flow"),
            SessionError::Hook(e) => write!(f, "new-session hook: {e}"),
        }
    }
}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        SessionError::Registry(e)
    }
}

pub struct Session {
    proto: Protocol,
    proxy: Arc<ProxyDescriptor>,
    state: Option<Box<dyn ProxySession>>,
    seqack: SeqAckState,
    stats: SessionStats,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("proto", &self.proto)
            .field("proxy", &self.proxy.name())
            .field("has_state", &self.state.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Session {
    /// Create a session for `mapping` bound to the named proxy.
    ///
    /// The descriptor reference taken here is held for the session's
    /// lifetime and dropped by [`Session::destroy`]; an unregistered
    /// proxy with live sessions therefore stays allocated until the
    /// last of them is destroyed.
    pub fn new(
        registry: &ProxyRegistry,
        proto: Protocol,
        name: &str,
        pkt: &PktView,
        mapping: &mut NatMapping,
        ctx: &mut ProxyCtx,
    ) -> Result<Session, SessionError> {
        let proxy = registry.lookup(proto, name)?;
        let handler = proxy.handler().clone();
        let caps = handler.caps();

        if caps.contains(ProxyCaps::MATCH) && !handler.matches(pkt, mapping) {
            registry.release(&proxy);
            return Err(SessionError::NoMatch);
        }

        let state = if caps.contains(ProxyCaps::NEW) {
            match handler.new_session(pkt, mapping, ctx) {
                Ok(state) => state,
                Err(e) => {
                    registry.release(&proxy);
                    return Err(SessionError::Hook(e));
                }
            }
        } else {
            None
        };

        Ok(Session {
            proto,
            proxy,
            state,
            seqack: SeqAckState::new(),
            stats: SessionStats::default(),
        })
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn proxy(&self) -> &Arc<ProxyDescriptor> {
        &self.proxy
    }

    pub fn seqack(&mut self) -> &mut SeqAckState {
        &mut self.seqack
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn account(&mut self, dir: Direction, bytes: u64) {
        self.stats.pkts[dir.index()] += 1;
        self.stats.bytes[dir.index()] += bytes;
    }

    /// Downcast the protocol state to the proxy's concrete type.
    pub fn state_as<T: 'static>(&self) -> Option<&T> {
        self.state.as_ref()?.as_any().downcast_ref()
    }

    pub fn state_as_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.as_any_mut().downcast_mut()
    }

    /// Tear the session down: run the proxy's delete hook and drop
    /// the descriptor reference.
    pub fn destroy(mut self, registry: &ProxyRegistry, ctx: &mut ProxyCtx) {
        let proxy = self.proxy.clone();
        let handler = proxy.handler().clone();
        if handler.caps().contains(ProxyCaps::DELETE) {
            handler.delete_session(&mut self, ctx);
        }
        registry.release(&proxy);
    }

    pub fn dump(&self) -> SessionDump {
        SessionDump {
            proto: self.proto,
            proxy: self.proxy.name().to_string(),
            pkts_in: self.stats.pkts(Direction::In),
            pkts_out: self.stats.pkts(Direction::Out),
            bytes_in: self.stats.bytes(Direction::In),
            bytes_out: self.stats.bytes(Direction::Out),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionDump {
    pub proto: Protocol,
    pub proxy: String,
    pub pkts_in: u64,
    pub pkts_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::nat::NatRule;
    use crate::engine::nat::NatTable;
    use crate::engine::registry::ProxyHandler;
    use crate::engine::state::StateTable;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering::SeqCst;

    struct CounterState {
        frames: u32,
    }

    impl ProxySession for CounterState {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct CounterProxy {
        accept: bool,
        deleted: AtomicBool,
    }

    impl ProxyHandler for CounterProxy {
        fn caps(&self) -> ProxyCaps {
            ProxyCaps::NEW | ProxyCaps::DELETE | ProxyCaps::MATCH
        }

        fn new_session(
            &self,
            _pkt: &PktView,
            _mapping: &mut NatMapping,
            _ctx: &mut ProxyCtx,
        ) -> Result<Option<Box<dyn ProxySession>>, HookError> {
            Ok(Some(Box::new(CounterState { frames: 0 })))
        }

        fn delete_session(&self, _session: &mut Session, _ctx: &mut ProxyCtx) {
            self.deleted.store(true, SeqCst);
        }

        fn matches(&self, _pkt: &PktView, _mapping: &NatMapping) -> bool {
            self.accept
        }
    }

    fn test_packet() -> Vec<u8> {
        #[rustfmt::skip]
        let bytes = vec![
            0x45, 0x00, 0x00, 0x28, 0x00, 0x01, 0x00, 0x00,
            0x40, 0x06, 0x00, 0x00,
            10, 0, 0, 5,
            203, 0, 113, 9,
            // TCP
            0xC0, 0x02, 0x06, 0xB3,
            0x00, 0x00, 0x10, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x50, 0x02, 0xFB, 0xB4,
            0x00, 0x00, 0x00, 0x00,
        ];
        bytes
    }

    fn test_mapping() -> NatMapping {
        NatMapping {
            dir: Direction::Out,
            proto: Protocol::Tcp,
            inside_ip: Ipv4Addr::new(10, 0, 0, 5),
            inside_id: 49154,
            outside_ip: Ipv4Addr::new(198, 51, 100, 2),
            outside_id: 49154,
            remote_ip: Ipv4Addr::new(203, 0, 113, 9),
            remote_id: 1723,
            rule: Arc::new(NatRule {
                proto: Protocol::Tcp,
                dir: Direction::Out,
                ifname: "net0".to_string(),
                outside_ip: Ipv4Addr::new(198, 51, 100, 2),
            }),
            session: None,
        }
    }

    fn registry_with(handler: Arc<CounterProxy>) -> ProxyRegistry {
        ProxyRegistry::new(vec![ProxyDescriptor::new(
            "counter",
            Protocol::Tcp,
            handler,
        )])
    }

    #[test]
    fn lifecycle_and_downcast() {
        let handler =
            Arc::new(CounterProxy { accept: true, deleted: AtomicBool::new(false) });
        let reg = registry_with(handler.clone());
        let mut nat = NatTable::default();
        let mut state = StateTable::new();
        let mut ctx = ProxyCtx { nat: &mut nat, state: &mut state };
        let mut mapping = test_mapping();

        let mut bytes = test_packet();
        let pkt = PktView::new(Direction::Out, &mut bytes);

        let mut sess = Session::new(
            &reg,
            Protocol::Tcp,
            "counter",
            &pkt,
            &mut mapping,
            &mut ctx,
        )
        .unwrap();
        assert_eq!(sess.proxy().refcnt(), 1);

        sess.state_as_mut::<CounterState>().unwrap().frames += 1;
        assert_eq!(sess.state_as::<CounterState>().unwrap().frames, 1);

        sess.account(Direction::Out, 40);
        assert_eq!(sess.stats().pkts(Direction::Out), 1);
        assert_eq!(sess.stats().bytes(Direction::Out), 40);
        assert_eq!(sess.stats().pkts(Direction::In), 0);

        let proxy = sess.proxy().clone();
        sess.destroy(&reg, &mut ctx);
        assert!(handler.deleted.load(SeqCst));
        assert_eq!(proxy.refcnt(), 0);
    }

    #[test]
    fn declined_flow_leaves_no_reference() {
        let handler =
            Arc::new(CounterProxy { accept: false, deleted: AtomicBool::new(false) });
        let reg = registry_with(handler);
        let mut nat = NatTable::default();
        let mut state = StateTable::new();
        let mut ctx = ProxyCtx { nat: &mut nat, state: &mut state };
        let mut mapping = test_mapping();

        let mut bytes = test_packet();
        let pkt = PktView::new(Direction::Out, &mut bytes);

        let res = Session::new(
            &reg,
            Protocol::Tcp,
            "counter",
            &pkt,
            &mut mapping,
            &mut ctx,
        );
        assert_eq!(res.unwrap_err(), SessionError::NoMatch);

        let desc = reg.lookup(Protocol::Tcp, "counter").unwrap();
        assert_eq!(desc.refcnt(), 1);
        reg.release(&desc);
    }
}
