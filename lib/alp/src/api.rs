// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! API types shared between the engine and its consumers.

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The direction of a packet relative to the filtering host.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Direction {
    /// The packet is entering the host from the network.
    In,
    /// The packet is leaving the host for the network.
    Out,
}

impl Direction {
    /// Return the opposite direction.
    pub fn flip(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }

    /// Return a stable array index for this direction.
    ///
    /// Used by the per-direction state kept in sessions; the mapping
    /// is part of no wire format and may not be relied upon outside
    /// this crate.
    pub fn index(self) -> usize {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

/// The transport protocols the engine concerns itself with.
///
/// TCP and UDP carry proxied control channels; GRE exists only as the
/// secondary protocol spawned by control-channel proxies (PPTP
/// negotiates a GRE data channel over its TCP control connection).
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 6,
    Udp = 17,
    Gre = 47,
}

impl TryFrom<u8> for Protocol {
    type Error = u8;

    fn try_from(proto: u8) -> Result<Self, Self::Error> {
        match proto {
            6 => Ok(Protocol::Tcp),
            17 => Ok(Protocol::Udp),
            47 => Ok(Protocol::Gre),
            _ => Err(proto),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Gre => write!(f, "GRE"),
        }
    }
}
