// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! PPTP control-channel proxy for the ALP engine.
//!
//! See [`proxy`] for the proxy itself and [`framing`] for the
//! control-frame reassembly it is built on. The usual way in is
//! [`proxy::descriptor`], which yields a descriptor ready to hand to
//! `alp::engine::registry::ProxyRegistry`.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod framing;
pub mod proxy;
