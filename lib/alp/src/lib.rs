// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ALP: an in-line application-layer proxy engine.
//!
//! ALP provides the generic machinery needed to run protocol-aware
//! proxies on a packet-forwarding path: a process-wide registry of
//! proxy implementations, a per-connection session object bound to a
//! NAT mapping, a dispatch engine that runs the per-packet proxy
//! hooks, and a sequence/ack rewriter that keeps a TCP connection
//! consistent after a proxy has changed the length of in-flight
//! payload.
//!
//! The engine itself is protocol-agnostic. A protocol implementation
//! (e.g. the PPTP control-channel proxy) supplies a
//! [`engine::registry::ProxyHandler`] and whatever per-session state
//! it needs; everything else -- checksum repair, seq/ack translation,
//! session lifecycle -- is handled here.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod api;
pub mod engine;

/// Return value with `bit` set.
pub const fn bit_on(bit: u8) -> u8 {
    0x1 << bit
}

#[macro_export]
macro_rules! dbg_macro {
    ($s:tt) => {
        println!($s);
    };
    ($s:tt, $($arg:tt)*) => {
        println!($s, $($arg)*);
    };
}

#[macro_export]
macro_rules! err_macro {
    ($s:tt) => {
        println!(concat!("ERROR: ", $s));
    };
    ($s:tt, $($arg:tt)*) => {
        println!(concat!("ERROR: ", $s), $($arg)*);
    };
}

pub use dbg_macro as dbg;
pub use err_macro as err;
