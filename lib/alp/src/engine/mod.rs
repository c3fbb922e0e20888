// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The proxy engine.
//!
//! The hot path enters at [`dispatch::on_packet`]. Everything the
//! dispatch engine touches -- the packet view, the session bound to
//! the NAT mapping, the seq/ack rewriter -- lives under this
//! namespace. The [`registry`] is the administrative surface through
//! which proxy implementations are added and removed.

pub mod checksum;
pub mod dispatch;
pub mod ip4;
pub mod nat;
pub mod packet;
pub mod registry;
pub mod seqack;
pub mod session;
pub mod state;
pub mod tcp;
pub mod udp;
