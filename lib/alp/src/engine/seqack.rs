// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP sequence/ack rewriting across a payload-editing boundary.
//!
//! When a proxy inserts or removes bytes from a TCP stream, every
//! sequence number the sender emits after the edit point is shifted
//! relative to what the receiver expects, and every acknowledgment
//! the receiver emits refers to the shifted space. This module tracks
//! the cumulative byte offset a proxy's edits have introduced into
//! each direction of a connection and translates seq/ack values as
//! packets cross the boundary.
//!
//! Offsets are kept as two "generations" per direction. A
//! length-changing edit defines a boundary in sequence space; a
//! retransmission may still arrive referencing space from *before*
//! the most recent edit, in which case the older generation's offset
//! is the applicable one. A new edit is therefore recorded into the
//! inactive generation slot, leaving the previous boundary in force
//! until traffic moves past the new one and
//! [`SideState::maybe_switch_generation`] flips the selector.
//!
//! The choice of wrapping the recorded minimum in `Option` might seem
//! odd. A fresh generation has no edit boundary yet, and 0 is a valid
//! sequence number, so a zero sentinel would misbehave for
//! connections whose ISN lands in the upper half of the space. Using
//! `Option` means we know for sure whether a boundary has actually
//! been recorded.

use crate::api::Direction;

/// `true` if `a` is strictly greater than `b` in TCP serial-number
/// space.
///
/// All sequence arithmetic is modulo 2^32; a naive unsigned compare
/// misorders values that straddle the wrap point.
pub fn seq_gt(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < (1 << 31)
}

/// `true` if `a` is greater than or equal to `b` in serial-number
/// space.
pub fn seq_ge(a: u32, b: u32) -> bool {
    !seq_gt(b, a)
}

/// One generation of edit bookkeeping: the upper edge of the sequence
/// range the recording edit applied to (in post-edit space), and the
/// cumulative byte offset in force for values past that edge.
#[derive(Clone, Copy, Debug, Default)]
pub struct Generation {
    min: Option<u32>,
    off: i32,
}

impl Generation {
    /// Construct a generation with a known boundary; used by tests to
    /// exercise the switch policy directly.
    pub fn new(min: Option<u32>, off: i32) -> Self {
        Self { min, off }
    }

    pub fn offset(&self) -> i32 {
        self.off
    }

    /// The sender-space edge of this generation's edit. The boundary
    /// is recorded in post-edit space; undoing the offset gives the
    /// last byte the sender numbered before the edit took effect.
    fn edge(&self) -> Option<u32> {
        Some(self.min?.wrapping_sub(self.off as u32))
    }
}

/// Which TCP field a value came from. The offset recorded for a
/// direction is *added* to that direction's sequence numbers and
/// *subtracted* from the acknowledgments that answer them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    Seq,
    Ack,
}

/// The edit bookkeeping for one direction of the connection: two
/// generations plus the active selector.
#[derive(Clone, Copy, Debug, Default)]
pub struct SideState {
    gens: [Generation; 2],
    sel: usize,
}

impl SideState {
    /// Construct a side with both generations populated; used by
    /// tests to exercise the switch policy directly.
    pub fn new(gens: [Generation; 2], sel: usize) -> Self {
        Self { gens, sel }
    }

    fn active(&self) -> &Generation {
        &self.gens[self.sel]
    }

    fn alternate(&self) -> &Generation {
        &self.gens[1 - self.sel]
    }

    /// Switch the active selector to the alternate generation if the
    /// alternate is both newer (its boundary is past the active
    /// one's) and applicable to this packet (the incoming value is
    /// past the alternate's edit point).
    pub fn maybe_switch_generation(&mut self, value: u32) {
        let (Some(alt_min), Some(cur_min)) =
            (self.alternate().min, self.active().min)
        else {
            return;
        };

        let alt_edge = alt_min.wrapping_sub(self.alternate().off as u32);
        if seq_gt(alt_min, cur_min) && seq_gt(value, alt_edge) {
            self.sel = 1 - self.sel;
        }
    }

    /// Translate `value` across the edit boundary, if it lies past
    /// it. Returns the rewritten value, or `None` if no rewrite
    /// applies.
    pub fn translate(&self, kind: FieldKind, value: u32) -> Option<u32> {
        let cur = self.active();
        let edge = cur.edge()?;

        if cur.off == 0 {
            return None;
        }

        if !seq_gt(value, edge) {
            return None;
        }

        match kind {
            FieldKind::Seq => Some(value.wrapping_add(cur.off as u32)),
            FieldKind::Ack => Some(value.wrapping_sub(cur.off as u32)),
        }
    }

    /// Record a new length-changing edit made by this packet. `value`
    /// is the sequence number after any translation above was
    /// applied, `payload_len` the packet's payload length after the
    /// edit.
    ///
    /// The first edit on a side defines the active generation. Each
    /// subsequent edit is written into the inactive slot carrying the
    /// accumulated offset, so the previous boundary stays available
    /// for retransmissions until [`Self::maybe_switch_generation`]
    /// moves the selector past it.
    pub fn record_edit(&mut self, value: u32, payload_len: u32, delta: i32) {
        if delta == 0 {
            return;
        }

        let new_min = value.wrapping_add(payload_len).wrapping_sub(1);

        let Some(cur_min) = self.active().min else {
            self.gens[self.sel] = Generation { min: Some(new_min), off: delta };
            return;
        };

        // An edit claimed against sequence space either generation
        // has already covered is a retransmission of an
        // already-recorded edit.
        if !seq_gt(value, cur_min) {
            return;
        }
        if let Some(alt_min) = self.alternate().min
            && !seq_gt(value, alt_min)
        {
            return;
        }

        let off = self.active().off + delta;
        self.gens[1 - self.sel] = Generation { min: Some(new_min), off };
    }
}

/// The result of running a packet's seq and ack fields through the
/// rewriter: the values to write back, where a rewrite applied.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SeqAckFixup {
    pub seq: Option<u32>,
    pub ack: Option<u32>,
}

impl SeqAckFixup {
    pub fn changed(&self) -> bool {
        self.seq.is_some() || self.ack.is_some()
    }
}

/// Per-session seq/ack rewrite state, one [`SideState`] per
/// direction.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeqAckState {
    sides: [SideState; 2],
}

impl SeqAckState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one packet through the rewriter.
    ///
    /// The packet's sequence field is translated against (and any new
    /// edit recorded into) the state for the packet's own direction;
    /// the acknowledgment field answers sequence space the peer
    /// emitted, so it is translated against the opposite direction's
    /// state, with the offset applied in reverse.
    ///
    /// `payload_len` and `delta` describe this packet's proxy edit;
    /// `payload_len` is the length after the edit was applied.
    pub fn fixup(
        &mut self,
        dir: Direction,
        seq: u32,
        ack: u32,
        payload_len: u32,
        delta: i32,
    ) -> SeqAckFixup {
        let mut res = SeqAckFixup::default();

        let side = &mut self.sides[dir.index()];
        side.maybe_switch_generation(seq);
        res.seq = side.translate(FieldKind::Seq, seq);
        // Boundaries live in post-edit space, so a new edit is
        // recorded at the translated position.
        side.record_edit(res.seq.unwrap_or(seq), payload_len, delta);

        let peer = &mut self.sides[dir.flip().index()];
        peer.maybe_switch_generation(ack);
        res.ack = peer.translate(FieldKind::Ack, ack);

        res
    }

    pub fn side(&self, dir: Direction) -> &SideState {
        &self.sides[dir.index()]
    }
}
