// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! NAT mappings and the secondary-mapping table.
//!
//! The engine does not translate addresses itself; it rides along on
//! mappings owned by the NAT layer. A mapping carries the single
//! proxy-session slot, and a proxy may spawn additional mappings for
//! the secondary flows its protocol negotiates (PPTP's GRE data
//! channel). Those secondary mappings live in [`NatTable`].

use crate::api::Direction;
use crate::api::Protocol;
use crate::engine::session::Session;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// The 5-tuple identifying one direction of a flow. For GRE the id
/// fields carry the call IDs rather than ports.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct FlowId {
    pub proto: Protocol,
    pub src_ip: Ipv4Addr,
    pub src_id: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_id: u16,
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{},{}:{}",
            self.proto, self.src_ip, self.src_id, self.dst_ip, self.dst_id,
        )
    }
}

/// A rule template a proxy holds on to so it can later create
/// secondary mappings consistent with the mapping that spawned its
/// session.
#[derive(Clone, Debug)]
pub struct NatRule {
    pub proto: Protocol,
    pub dir: Direction,
    pub ifname: String,
    pub outside_ip: Ipv4Addr,
}

/// One active NAT mapping. `inside` is the host behind the NAT,
/// `outside` its translated identity, `remote` the peer.
#[derive(Debug)]
pub struct NatMapping {
    pub dir: Direction,
    pub proto: Protocol,
    pub inside_ip: Ipv4Addr,
    pub inside_id: u16,
    pub outside_ip: Ipv4Addr,
    pub outside_id: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_id: u16,
    pub rule: Arc<NatRule>,
    /// The proxy session bound to this mapping, if any. One slot; a
    /// mapping is serviced by at most one proxy.
    pub session: Option<Session>,
}

impl NatMapping {
    /// The flow key on the inside of the translation, oriented in the
    /// mapping's own direction.
    pub fn flow(&self) -> FlowId {
        FlowId {
            proto: self.proto,
            src_ip: self.inside_ip,
            src_id: self.inside_id,
            dst_ip: self.remote_ip,
            dst_id: self.remote_id,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NatError {
    Exists,
    MaxCapacity(u32),
}

impl Display for NatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NatError::Exists => write!(f, "mapping already exists"),
            NatError::MaxCapacity(limit) => {
                write!(f, "table at max capacity: {limit}")
            }
        }
    }
}

pub const NAT_TABLE_MAX_CAPACITY: u32 = 8192;

/// The table of proxy-created secondary mappings, keyed by inside
/// flow. The primary mapping a session is bound to is owned by the
/// NAT layer proper and never lives here.
#[derive(Debug)]
pub struct NatTable {
    limit: u32,
    map: BTreeMap<FlowId, NatMapping>,
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new(NAT_TABLE_MAX_CAPACITY)
    }
}

impl NatTable {
    pub fn new(limit: u32) -> Self {
        Self { limit, map: BTreeMap::new() }
    }

    pub fn add(&mut self, mapping: NatMapping) -> Result<(), NatError> {
        if self.map.len() as u32 >= self.limit {
            return Err(NatError::MaxCapacity(self.limit));
        }

        let flow = mapping.flow();
        if self.map.contains_key(&flow) {
            return Err(NatError::Exists);
        }

        self.map.insert(flow, mapping);
        Ok(())
    }

    pub fn lookup(&self, flow: &FlowId) -> Option<&NatMapping> {
        self.map.get(flow)
    }

    pub fn lookup_mut(&mut self, flow: &FlowId) -> Option<&mut NatMapping> {
        self.map.get_mut(flow)
    }

    pub fn remove(&mut self, flow: &FlowId) -> Option<NatMapping> {
        self.map.remove(flow)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NatMapping> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rule() -> Arc<NatRule> {
        Arc::new(NatRule {
            proto: Protocol::Tcp,
            dir: Direction::Out,
            ifname: "net0".to_string(),
            outside_ip: Ipv4Addr::new(198, 51, 100, 2),
        })
    }

    fn gre_mapping(call_in: u16, call_out: u16) -> NatMapping {
        NatMapping {
            dir: Direction::Out,
            proto: Protocol::Gre,
            inside_ip: Ipv4Addr::new(10, 0, 0, 5),
            inside_id: call_in,
            outside_ip: Ipv4Addr::new(198, 51, 100, 2),
            outside_id: call_in,
            remote_ip: Ipv4Addr::new(203, 0, 113, 9),
            remote_id: call_out,
            rule: rule(),
            session: None,
        }
    }

    #[test]
    fn add_lookup_remove() {
        let mut table = NatTable::new(4);
        let m = gre_mapping(0x4001, 0x9d07);
        let flow = m.flow();
        table.add(m).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(&flow).unwrap().remote_id, 0x9d07);
        assert!(table.remove(&flow).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_rejected() {
        let mut table = NatTable::new(4);
        table.add(gre_mapping(0x4001, 0x9d07)).unwrap();
        assert_eq!(
            table.add(gre_mapping(0x4001, 0x9d07)),
            Err(NatError::Exists)
        );
    }

    #[test]
    fn capacity_enforced() {
        let mut table = NatTable::new(2);
        table.add(gre_mapping(1, 1)).unwrap();
        table.add(gre_mapping(2, 2)).unwrap();
        assert_eq!(
            table.add(gre_mapping(3, 3)),
            Err(NatError::MaxCapacity(2))
        );
    }
}
