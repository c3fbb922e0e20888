// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection state tracking for proxy-created flows.
//!
//! Proxies that negotiate secondary data channels (PPTP's GRE channel)
//! pre-create state entries so the first data packet is accepted
//! without a rule walk. Entries carry their own expiry deadline;
//! the expiry sweep may run concurrently with the proxy that created
//! an entry, so the mutable fields are atomics.

use crate::engine::nat::FlowId;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Instant;

/// The deadline applied by [`StateEntry::mark_imminent`]. An entry
/// whose owning session is gone is given one more second to drain
/// in-flight packets rather than being ripped out from under them.
pub const IMMINENT_EXPIRE_MILLIS: u64 = 1_000;

/// A time-to-live expressed in milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ttl(u64);

impl Ttl {
    pub const fn new_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn new_seconds(seconds: u64) -> Self {
        Self(seconds * 1_000)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

/// One tracked flow.
#[derive(Debug)]
pub struct StateEntry {
    flow: FlowId,
    expire_at: AtomicU64,
    owner_detached: AtomicBool,
}

impl StateEntry {
    pub fn flow(&self) -> &FlowId {
        &self.flow
    }

    pub fn expire_at(&self) -> u64 {
        self.expire_at.load(SeqCst)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expire_at.load(SeqCst)
    }

    /// Push the deadline out by `ttl` from `now`.
    pub fn refresh(&self, now: u64, ttl: Ttl) {
        self.expire_at.store(now + ttl.as_millis(), SeqCst);
        self.owner_detached.store(false, SeqCst);
    }

    /// The owning session is going away. The entry is not removed,
    /// only given an imminent deadline, so packets already in flight
    /// on the secondary channel still match it.
    pub fn mark_imminent(&self, now: u64) {
        self.owner_detached.store(true, SeqCst);
        self.expire_at.store(now + IMMINENT_EXPIRE_MILLIS, SeqCst);
    }

    pub fn owner_detached(&self) -> bool {
        self.owner_detached.load(SeqCst)
    }
}

/// The table of tracked flows. Entries are handed out as `Arc` so a
/// proxy session can hold one across packets while the sweep runs.
#[derive(Debug)]
pub struct StateTable {
    start: Instant,
    entries: Vec<Arc<StateEntry>>,
}

impl Default for StateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTable {
    pub fn new() -> Self {
        Self { start: Instant::now(), entries: Vec::new() }
    }

    /// Milliseconds since the table was created. All deadlines in the
    /// table are on this clock.
    pub fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn insert(&mut self, flow: FlowId, ttl: Ttl) -> Arc<StateEntry> {
        let now = self.now_millis();
        let entry = Arc::new(StateEntry {
            flow,
            expire_at: AtomicU64::new(now + ttl.as_millis()),
            owner_detached: AtomicBool::new(false),
        });
        self.entries.push(entry.clone());
        entry
    }

    pub fn lookup(&self, flow: &FlowId) -> Option<&Arc<StateEntry>> {
        self.entries.iter().find(|e| e.flow() == flow)
    }

    /// Remove every entry whose deadline has passed. Returns the
    /// number removed.
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_expired(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
