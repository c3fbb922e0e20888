// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The proxy registry.
//!
//! Proxies are small protocol engines identified by `(protocol,
//! name)`. A fixed set of builtins is installed at startup and
//! further proxies may register and unregister at runtime. Lookups
//! vastly outnumber registration changes, so the registry sits behind
//! a read-mostly lock; the per-descriptor reference count and
//! pending-delete flag are atomics so they can be touched under the
//! shared lock.

use crate::api::Direction;
use crate::api::Protocol;
use crate::engine::dispatch::HookVerdict;
use crate::engine::nat::NatMapping;
use crate::engine::nat::NatTable;
use crate::engine::packet::PktView;
use crate::engine::session::ProxySession;
use crate::engine::session::Session;
use crate::engine::state::StateTable;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;

bitflags::bitflags! {
    /// The hooks a proxy implements. A missing capability means the
    /// corresponding hook is never called.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ProxyCaps: u16 {
        const INIT = 1 << 0;
        const FINI = 1 << 1;
        const NEW = 1 << 2;
        const DELETE = 1 << 3;
        const INBOUND = 1 << 4;
        const OUTBOUND = 1 << 5;
        const MATCH = 1 << 6;
        const CONTROL = 1 << 7;
    }
}

/// An error returned by a proxy hook. Carries a static reason string
/// for the log; hooks have no one to report rich errors to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HookError(pub &'static str);

impl Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The mutable collaborator state handed to every hook: the
/// secondary NAT mapping table and the connection state table.
pub struct ProxyCtx<'a> {
    pub nat: &'a mut NatTable,
    pub state: &'a mut StateTable,
}

/// An opaque control request addressed to one proxy.
#[derive(Clone, Debug)]
pub struct ProxyCtl {
    pub proto: Protocol,
    pub name: String,
    pub data: Vec<u8>,
}

/// The hook surface a proxy provides. Every hook has a default so a
/// proxy implements only what its `caps()` advertise.
pub trait ProxyHandler: Send + Sync {
    fn caps(&self) -> ProxyCaps;

    /// One-time setup at registration.
    fn init(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Teardown at unregistration or shutdown.
    fn fini(&self) {}

    /// A mapping matching this proxy has been created; return the
    /// per-session protocol state, if the proxy keeps any.
    fn new_session(
        &self,
        _pkt: &PktView,
        _mapping: &mut NatMapping,
        _ctx: &mut ProxyCtx,
    ) -> Result<Option<Box<dyn ProxySession>>, HookError> {
        Ok(None)
    }

    /// The session is being destroyed.
    fn delete_session(&self, _session: &mut Session, _ctx: &mut ProxyCtx) {}

    /// Examine (and possibly rewrite) one packet of the proxied
    /// connection. `mapping` arrives with the session slot taken; the
    /// session is passed separately.
    fn packet(
        &self,
        _dir: Direction,
        _pkt: &mut PktView,
        _session: &mut Session,
        _mapping: &mut NatMapping,
        _ctx: &mut ProxyCtx,
    ) -> HookVerdict {
        HookVerdict::Pass { delta: 0 }
    }

    /// Finer-grained match beyond `(proto, name)`, consulted at
    /// session creation.
    fn matches(&self, _pkt: &PktView, _mapping: &NatMapping) -> bool {
        true
    }

    /// Handle an administrative control request.
    fn control(&self, _ctl: &ProxyCtl) -> Result<Vec<u8>, HookError> {
        Err(HookError("control not supported"))
    }
}

/// One registered proxy.
pub struct ProxyDescriptor {
    name: &'static str,
    proto: Protocol,
    refcnt: AtomicU32,
    pending_delete: AtomicBool,
    handler: Arc<dyn ProxyHandler>,
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProxyDescriptor")
            .field("name", &self.name)
            .field("proto", &self.proto)
            .field("refcnt", &self.refcnt.load(SeqCst))
            .field("pending_delete", &self.pending_delete.load(SeqCst))
            .finish()
    }
}

impl ProxyDescriptor {
    pub fn new(
        name: &'static str,
        proto: Protocol,
        handler: Arc<dyn ProxyHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            proto,
            refcnt: AtomicU32::new(0),
            pending_delete: AtomicBool::new(false),
            handler,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn handler(&self) -> &Arc<dyn ProxyHandler> {
        &self.handler
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(SeqCst)
    }

    pub fn pending_delete(&self) -> bool {
        self.pending_delete.load(SeqCst)
    }

    fn matches_key(&self, proto: Protocol, name: &str) -> bool {
        self.proto == proto && self.name == name
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistryError {
    Duplicate,
    NotFound,
    NoCapability,
    Hook(HookError),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryError::Duplicate => write!(f, "already registered"),
            RegistryError::NotFound => write!(f, "no such proxy"),
            RegistryError::NoCapability => {
                write!(f, "proxy lacks the capability")
            }
            RegistryError::Hook(e) => write!(f, "hook failed: {e}"),
        }
    }
}

/// The outcome of the `init` hook at registration. A failed init
/// leaves the descriptor registered but excluded from lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitStatus {
    Ok,
    Failed,
}

/// The outcome of unregistration. `Orphaned` means sessions were
/// still bound; the descriptor is unlinked from the registry but
/// lives on until the last holder drops its reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Unregistered {
    Removed,
    Orphaned,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProxyInfo {
    pub name: String,
    pub proto: Protocol,
    pub refcnt: u32,
    pub pending_delete: bool,
    pub builtin: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegistryDump {
    pub proxies: Vec<ProxyInfo>,
}

#[derive(Default)]
struct RegistryInner {
    builtins: Vec<Arc<ProxyDescriptor>>,
    dynamic: Vec<Arc<ProxyDescriptor>>,
}

impl RegistryInner {
    fn contains(&self, proto: Protocol, name: &str) -> bool {
        self.builtins
            .iter()
            .chain(self.dynamic.iter())
            .any(|d| d.matches_key(proto, name))
    }
}

pub struct ProxyRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProxyRegistry {
    /// Build the registry around the builtin proxy set, running each
    /// builtin's `init` hook. A failed init is logged and the
    /// descriptor excluded from lookup rather than failing startup.
    pub fn new(builtins: Vec<Arc<ProxyDescriptor>>) -> Self {
        for desc in &builtins {
            if Self::run_init(desc) == InitStatus::Failed {
                crate::err!("proxy {} init failed, disabled", desc.name());
            }
        }

        Self {
            inner: RwLock::new(RegistryInner { builtins, dynamic: Vec::new() }),
        }
    }

    fn run_init(desc: &Arc<ProxyDescriptor>) -> InitStatus {
        if !desc.handler.caps().contains(ProxyCaps::INIT) {
            return InitStatus::Ok;
        }

        match desc.handler.init() {
            Ok(()) => InitStatus::Ok,
            Err(_) => {
                desc.pending_delete.store(true, SeqCst);
                InitStatus::Failed
            }
        }
    }

    /// Register a proxy at runtime. Registration completes
    /// structurally even when the `init` hook fails; the status tells
    /// the caller which happened.
    pub fn register(
        &self,
        desc: Arc<ProxyDescriptor>,
    ) -> Result<InitStatus, RegistryError> {
        let mut inner = self.inner.write().unwrap();
        if inner.contains(desc.proto(), desc.name()) {
            return Err(RegistryError::Duplicate);
        }

        let status = Self::run_init(&desc);
        inner.dynamic.push(desc);
        Ok(status)
    }

    /// Unregister a dynamic proxy. Builtins cannot be unregistered.
    pub fn unregister(
        &self,
        proto: Protocol,
        name: &str,
    ) -> Result<Unregistered, RegistryError> {
        let mut inner = self.inner.write().unwrap();
        let pos = inner
            .dynamic
            .iter()
            .position(|d| d.matches_key(proto, name))
            .ok_or(RegistryError::NotFound)?;

        let desc = inner.dynamic.remove(pos);
        desc.pending_delete.store(true, SeqCst);

        if desc.refcnt.load(SeqCst) == 0 {
            if desc.handler.caps().contains(ProxyCaps::FINI) {
                desc.handler.fini();
            }
            Ok(Unregistered::Removed)
        } else {
            // Sessions still hold the descriptor; the last release
            // runs fini.
            Ok(Unregistered::Orphaned)
        }
    }

    /// Find a proxy and take a reference on it. The caller owns one
    /// count and must pair this with [`ProxyRegistry::release`].
    pub fn lookup(
        &self,
        proto: Protocol,
        name: &str,
    ) -> Result<Arc<ProxyDescriptor>, RegistryError> {
        let inner = self.inner.read().unwrap();
        let desc = inner
            .builtins
            .iter()
            .chain(inner.dynamic.iter())
            .find(|d| d.matches_key(proto, name) && !d.pending_delete())
            .ok_or(RegistryError::NotFound)?;

        desc.refcnt.fetch_add(1, SeqCst);
        Ok(desc.clone())
    }

    /// Drop a reference taken by [`ProxyRegistry::lookup`]. If the
    /// descriptor was orphaned by unregistration and this was the
    /// last reference, its `fini` hook runs now.
    pub fn release(&self, desc: &Arc<ProxyDescriptor>) {
        let prev = desc.refcnt.fetch_sub(1, SeqCst);
        debug_assert!(prev > 0, "proxy refcnt underflow: {}", desc.name());

        if prev == 1
            && desc.pending_delete()
            && desc.handler.caps().contains(ProxyCaps::FINI)
        {
            desc.handler.fini();
        }
    }

    /// Route a control request to the named proxy.
    pub fn dispatch_control(
        &self,
        ctl: &ProxyCtl,
    ) -> Result<Vec<u8>, RegistryError> {
        let desc = self.lookup(ctl.proto, &ctl.name)?;
        let res = if desc.handler.caps().contains(ProxyCaps::CONTROL) {
            desc.handler.control(ctl).map_err(RegistryError::Hook)
        } else {
            Err(RegistryError::NoCapability)
        };
        self.release(&desc);
        res
    }

    /// Run every proxy's `fini` hook and empty the registry. Dynamic
    /// descriptor memory is owned by the registrants' `Arc`s; the
    /// last drop frees it.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write().unwrap();
        for desc in inner.builtins.iter().chain(inner.dynamic.iter()) {
            if desc.handler.caps().contains(ProxyCaps::FINI) {
                desc.handler.fini();
            }
        }
        inner.builtins.clear();
        inner.dynamic.clear();
    }

    pub fn dump(&self) -> RegistryDump {
        let inner = self.inner.read().unwrap();
        let info = |d: &Arc<ProxyDescriptor>, builtin: bool| ProxyInfo {
            name: d.name().to_string(),
            proto: d.proto(),
            refcnt: d.refcnt(),
            pending_delete: d.pending_delete(),
            builtin,
        };

        RegistryDump {
            proxies: inner
                .builtins
                .iter()
                .map(|d| info(d, true))
                .chain(inner.dynamic.iter().map(|d| info(d, false)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct TestProxy {
        caps: ProxyCaps,
        init_ok: bool,
        inited: AtomicBool,
        finied: AtomicBool,
    }

    impl TestProxy {
        fn new(caps: ProxyCaps, init_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                caps,
                init_ok,
                inited: AtomicBool::new(false),
                finied: AtomicBool::new(false),
            })
        }
    }

    impl ProxyHandler for TestProxy {
        fn caps(&self) -> ProxyCaps {
            self.caps
        }

        fn init(&self) -> Result<(), HookError> {
            self.inited.store(true, SeqCst);
            if self.init_ok { Ok(()) } else { Err(HookError("init boom")) }
        }

        fn fini(&self) {
            self.finied.store(true, SeqCst);
        }

        fn control(&self, ctl: &ProxyCtl) -> Result<Vec<u8>, HookError> {
            let mut out = ctl.data.clone();
            out.reverse();
            Ok(out)
        }
    }

    const ALL: ProxyCaps = ProxyCaps::all();

    #[test]
    fn builtin_lookup_and_refcnt() {
        let handler = TestProxy::new(ALL, true);
        let reg = ProxyRegistry::new(vec![ProxyDescriptor::new(
            "pptp",
            Protocol::Tcp,
            handler.clone(),
        )]);
        assert!(handler.inited.load(SeqCst));

        let desc = reg.lookup(Protocol::Tcp, "pptp").unwrap();
        assert_eq!(desc.refcnt(), 1);
        assert_eq!(
            reg.lookup(Protocol::Udp, "pptp").unwrap_err(),
            RegistryError::NotFound
        );
        assert_eq!(
            reg.lookup(Protocol::Tcp, "ftp").unwrap_err(),
            RegistryError::NotFound
        );

        reg.release(&desc);
        assert_eq!(desc.refcnt(), 0);
    }

    #[test]
    fn register_unregister_lifecycle() {
        let reg = ProxyRegistry::new(vec![]);
        let handler = TestProxy::new(ALL, true);
        let desc = ProxyDescriptor::new("tftp", Protocol::Udp, handler.clone());

        assert_eq!(reg.register(desc.clone()).unwrap(), InitStatus::Ok);
        assert_eq!(
            reg.register(desc.clone()).unwrap_err(),
            RegistryError::Duplicate
        );

        assert!(reg.lookup(Protocol::Udp, "tftp").is_ok());
        let held = reg.lookup(Protocol::Udp, "tftp").unwrap();
        reg.release(&held);
        let held = reg.lookup(Protocol::Udp, "tftp").unwrap();
        reg.release(&held);

        assert_eq!(
            reg.unregister(Protocol::Udp, "tftp").unwrap(),
            Unregistered::Removed
        );
        assert!(handler.finied.load(SeqCst));
        assert_eq!(
            reg.unregister(Protocol::Udp, "tftp").unwrap_err(),
            RegistryError::NotFound
        );
    }

    #[test]
    fn orphaned_unregister_defers_fini() {
        let reg = ProxyRegistry::new(vec![]);
        let handler = TestProxy::new(ALL, true);
        reg.register(ProxyDescriptor::new("tftp", Protocol::Udp, handler.clone()))
            .unwrap();

        // A session holds the descriptor across unregistration.
        let held = reg.lookup(Protocol::Udp, "tftp").unwrap();
        assert_eq!(
            reg.unregister(Protocol::Udp, "tftp").unwrap(),
            Unregistered::Orphaned
        );
        assert!(!handler.finied.load(SeqCst));

        // The orphan is invisible to new lookups.
        assert_eq!(
            reg.lookup(Protocol::Udp, "tftp").unwrap_err(),
            RegistryError::NotFound
        );

        // The last release runs fini.
        reg.release(&held);
        assert!(handler.finied.load(SeqCst));
    }

    #[test]
    fn failed_init_is_registered_but_disabled() {
        let reg = ProxyRegistry::new(vec![]);
        let handler = TestProxy::new(ALL, false);
        let status = reg
            .register(ProxyDescriptor::new("rcmd", Protocol::Tcp, handler))
            .unwrap();
        assert_eq!(status, InitStatus::Failed);
        assert_eq!(
            reg.lookup(Protocol::Tcp, "rcmd").unwrap_err(),
            RegistryError::NotFound
        );
        // Still present structurally.
        assert_eq!(reg.dump().proxies.len(), 1);
        assert!(reg.dump().proxies[0].pending_delete);
    }

    #[test]
    fn control_routing() {
        let reg = ProxyRegistry::new(vec![ProxyDescriptor::new(
            "pptp",
            Protocol::Tcp,
            TestProxy::new(ALL, true),
        )]);

        let ctl = ProxyCtl {
            proto: Protocol::Tcp,
            name: "pptp".to_string(),
            data: vec![1, 2, 3],
        };
        assert_eq!(reg.dispatch_control(&ctl).unwrap(), vec![3, 2, 1]);

        let no_cap = ProxyDescriptor::new(
            "mute",
            Protocol::Udp,
            TestProxy::new(ProxyCaps::empty(), true),
        );
        reg.register(no_cap).unwrap();
        let ctl = ProxyCtl {
            proto: Protocol::Udp,
            name: "mute".to_string(),
            data: vec![],
        };
        assert_eq!(
            reg.dispatch_control(&ctl).unwrap_err(),
            RegistryError::NoCapability
        );
    }

    #[test]
    fn shutdown_runs_fini_and_empties() {
        let builtin = TestProxy::new(ALL, true);
        let dynamic = TestProxy::new(ALL, true);
        let reg = ProxyRegistry::new(vec![ProxyDescriptor::new(
            "pptp",
            Protocol::Tcp,
            builtin.clone(),
        )]);
        reg.register(ProxyDescriptor::new("tftp", Protocol::Udp, dynamic.clone()))
            .unwrap();

        reg.shutdown();
        assert!(builtin.finied.load(SeqCst));
        assert!(dynamic.finied.load(SeqCst));
        assert!(reg.dump().proxies.is_empty());
    }
}
