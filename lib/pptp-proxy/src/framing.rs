// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Reassembly of PPTP control frames from a TCP byte stream.
//!
//! PPTP control messages are length-prefixed frames riding a TCP
//! connection, and TCP is free to split or batch them arbitrarily:
//! one frame may span several segments, one segment may carry several
//! frames, and segments may be retransmitted. [`reassemble`] consumes
//! a segment's payload at its sequence position and hands each
//! completed frame to the caller.
//!
//! Each side of the connection keeps its own [`FramingBuffer`]. The
//! buffer is a fixed 512 bytes; a frame whose declared length exceeds
//! it is stepped over by sequence arithmetic without ever being
//! buffered, so a peer cannot make us accumulate unbounded state.

use alp::engine::seqack::seq_ge;
use alp::engine::seqack::seq_gt;
use core::fmt;
use core::fmt::Display;
use core::mem::size_of;
use heapless::Vec;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::byteorder::network_endian::U32;

/// The magic cookie carried by every PPTP control frame.
pub const PPTP_MAGIC: u32 = 0x1a2b_3c4d;

/// The message-type field value for control frames.
pub const MSG_TYPE_CONTROL: u16 = 1;

/// Capacity of the per-side accumulation buffer. Every control
/// message the proxy needs to inspect fits well within this.
pub const SIDE_BUF_CAP: usize = 512;

/// A completed control frame, header included.
pub type Frame = Vec<u8, SIDE_BUF_CAP>;

/// The fixed frame header: total length (header included), message
/// type, magic cookie.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PptpHdrRaw {
    pub len: U16,
    pub msg_type: U16,
    pub magic: U32,
}

impl PptpHdrRaw {
    pub const SIZE: usize = size_of::<Self>();
}

/// The control-message subtypes of RFC 2637.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum CtlMessage {
    StartRequest = 1,
    StartReply = 2,
    StopRequest = 3,
    StopReply = 4,
    EchoRequest = 5,
    EchoReply = 6,
    OutCallRequest = 7,
    OutCallReply = 8,
    InCallRequest = 9,
    InCallReply = 10,
    InCallConnected = 11,
    CallClearRequest = 12,
    CallDisconnectNotify = 13,
    WanErrorNotify = 14,
    SetLinkInfo = 15,
}

impl TryFrom<u16> for CtlMessage {
    type Error = u16;

    fn try_from(subtype: u16) -> Result<Self, Self::Error> {
        use CtlMessage::*;
        Ok(match subtype {
            1 => StartRequest,
            2 => StartReply,
            3 => StopRequest,
            4 => StopReply,
            5 => EchoRequest,
            6 => EchoReply,
            7 => OutCallRequest,
            8 => OutCallReply,
            9 => InCallRequest,
            10 => InCallReply,
            11 => InCallConnected,
            12 => CallClearRequest,
            13 => CallDisconnectNotify,
            14 => WanErrorNotify,
            15 => SetLinkInfo,
            other => return Err(other),
        })
    }
}

/// The frame's message-type field, at frame offset 2.
pub fn msg_type(frame: &[u8]) -> Option<u16> {
    let bytes = frame.get(2..4)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// The control-message subtype, at frame offset 8.
pub fn subtype(frame: &[u8]) -> Option<u16> {
    let bytes = frame.get(8..10)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// The call-ID pair carried by the call-reply messages, at frame
/// offsets 12 and 14.
pub fn call_ids(frame: &[u8]) -> Option<(u16, u16)> {
    let bytes = frame.get(12..16)?;
    Some((
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    ))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameError {
    /// No reassembly cursor yet; the connection's SYN has not been
    /// observed.
    NotSynchronized,
    /// The segment leaves a gap ahead of the cursor.
    OutOfOrder,
    /// The frame header's magic cookie is wrong.
    BadMagic,
    /// The declared frame length is smaller than the header.
    BadLength,
    /// A collaborator table was full.
    Resource,
    /// Internal accumulation overflow.
    Overflow,
}

impl Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            FrameError::NotSynchronized => "stream not synchronized",
            FrameError::OutOfOrder => "segment out of order",
            FrameError::BadMagic => "bad magic cookie",
            FrameError::BadLength => "impossible frame length",
            FrameError::Resource => "out of table space",
            FrameError::Overflow => "frame buffer overflow",
        };
        write!(f, "{msg}")
    }
}

/// Per-side frame reassembly state.
#[derive(Debug, Default)]
pub struct FramingBuffer {
    /// The sequence number of the next payload byte to consume, or
    /// `None` before the stream has been synchronized from the
    /// handshake.
    next: Option<u32>,
    /// The sequence number of the first byte of the frame currently
    /// being accumulated (or skipped).
    hdr_start: u32,
    buf: Frame,
    have_hdr: bool,
    declared_len: u16,
}

impl FramingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reassembly cursor, discarding any partial frame. Called
    /// with the first data sequence number when the handshake is
    /// observed.
    pub fn sync(&mut self, seq: u32) {
        self.next = Some(seq);
        self.hdr_start = seq;
        self.buf.clear();
        self.have_hdr = false;
        self.declared_len = 0;
    }

    pub fn is_synced(&self) -> bool {
        self.next.is_some()
    }

    /// Back the cursor up to the start of the current frame so a
    /// retransmission gets a second look.
    fn rewind(&mut self) {
        self.next = Some(self.hdr_start);
        self.buf.clear();
        self.have_hdr = false;
    }
}

/// Consume one TCP segment's payload at sequence position `seq`,
/// delivering each completed frame to `deliver`.
///
/// Data below the cursor has been consumed already and is skipped;
/// a wholly-old segment is a retransmission and a no-op. Data beyond
/// the cursor means a hole in the stream and fails. A frame too large
/// for the buffer advances the cursor over the frame by arithmetic
/// alone; the skipped bytes are never inspected.
pub fn reassemble<F>(
    fb: &mut FramingBuffer,
    seq: u32,
    payload: &[u8],
    mut deliver: F,
) -> Result<(), FrameError>
where
    F: FnMut(Frame) -> Result<(), FrameError>,
{
    let Some(cursor) = fb.next else {
        return Err(FrameError::NotSynchronized);
    };

    if payload.is_empty() {
        return Ok(());
    }

    let end = seq.wrapping_add(payload.len() as u32);

    // A pure retransmission of already-consumed bytes.
    if seq_ge(cursor, end) {
        return Ok(());
    }

    // Bytes missing between the cursor and this segment.
    if seq_gt(seq, cursor) {
        return Err(FrameError::OutOfOrder);
    }

    let mut next = cursor;

    loop {
        // Hand off a completed frame before touching the payload, so
        // a frame that ended exactly at a segment boundary is not
        // held back until more data arrives.
        if fb.have_hdr && fb.buf.len() == fb.declared_len as usize {
            let frame = core::mem::take(&mut fb.buf);
            fb.have_hdr = false;
            fb.hdr_start = next;
            fb.next = Some(next);
            deliver(frame)?;
            continue;
        }

        let off = next.wrapping_sub(seq) as usize;
        if off >= payload.len() {
            break;
        }
        let avail = &payload[off..];

        if !fb.have_hdr {
            let want = PptpHdrRaw::SIZE - fb.buf.len();
            let take = want.min(avail.len());
            fb.buf
                .extend_from_slice(&avail[..take])
                .map_err(|()| FrameError::Overflow)?;
            next = next.wrapping_add(take as u32);
            if fb.buf.len() < PptpHdrRaw::SIZE {
                break;
            }

            let Ok((hdr, _)) = PptpHdrRaw::ref_from_prefix(&fb.buf) else {
                return Err(FrameError::BadLength);
            };
            let declared = hdr.len.get();

            if hdr.magic.get() != PPTP_MAGIC {
                fb.rewind();
                return Err(FrameError::BadMagic);
            }

            if (declared as usize) < PptpHdrRaw::SIZE {
                fb.rewind();
                return Err(FrameError::BadLength);
            }

            if declared as usize > SIDE_BUF_CAP {
                // Step over the frame without buffering it. The skip
                // target may land inside this same segment, in which
                // case the loop picks back up there.
                let skip_to = fb.hdr_start.wrapping_add(declared as u32);
                fb.buf.clear();
                fb.have_hdr = false;
                fb.hdr_start = skip_to;
                next = skip_to;
                continue;
            }

            fb.declared_len = declared;
            fb.have_hdr = true;
            continue;
        }

        let want = fb.declared_len as usize - fb.buf.len();
        let take = want.min(avail.len());
        fb.buf
            .extend_from_slice(&avail[..take])
            .map_err(|()| FrameError::Overflow)?;
        next = next.wrapping_add(take as u32);
    }

    fb.next = Some(next);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use rand::rng;

    // A control frame: fixed header, subtype, reserved, `extra` body
    // bytes.
    fn ctl_frame(subtype: u16, extra: &[u8]) -> std::vec::Vec<u8> {
        let len = (12 + extra.len()) as u16;
        let mut v = std::vec::Vec::new();
        v.extend_from_slice(&len.to_be_bytes());
        v.extend_from_slice(&MSG_TYPE_CONTROL.to_be_bytes());
        v.extend_from_slice(&PPTP_MAGIC.to_be_bytes());
        v.extend_from_slice(&subtype.to_be_bytes());
        v.extend_from_slice(&[0, 0]);
        v.extend_from_slice(extra);
        v
    }

    // A raw frame with an arbitrary declared length, padded with
    // zeros to `wire_len` actual bytes on the wire.
    fn raw_frame(declared: u16, wire_len: usize) -> std::vec::Vec<u8> {
        let mut v = std::vec::Vec::new();
        v.extend_from_slice(&declared.to_be_bytes());
        v.extend_from_slice(&MSG_TYPE_CONTROL.to_be_bytes());
        v.extend_from_slice(&PPTP_MAGIC.to_be_bytes());
        v.resize(wire_len, 0);
        v
    }

    fn collect(
        fb: &mut FramingBuffer,
        seq: u32,
        payload: &[u8],
    ) -> Result<std::vec::Vec<std::vec::Vec<u8>>, FrameError> {
        let mut got = std::vec::Vec::new();
        reassemble(fb, seq, payload, |f| {
            got.push(f.to_vec());
            Ok(())
        })?;
        Ok(got)
    }

    #[test]
    fn whole_frame_in_one_segment() {
        let mut fb = FramingBuffer::new();
        fb.sync(100);
        let frame = ctl_frame(1, &[0xab; 20]);
        let got = collect(&mut fb, 100, &frame).unwrap();
        assert_eq!(got, vec![frame]);
    }

    #[test]
    fn frame_split_byte_by_byte() {
        let mut fb = FramingBuffer::new();
        fb.sync(0);
        let frame = ctl_frame(5, &[1, 2, 3, 4]);
        let mut got = std::vec::Vec::new();
        for (i, b) in frame.iter().enumerate() {
            got.extend(collect(&mut fb, i as u32, &[*b]).unwrap());
        }
        assert_eq!(got, vec![frame]);
    }

    #[test]
    fn several_frames_in_one_segment() {
        let mut fb = FramingBuffer::new();
        fb.sync(42);
        let a = ctl_frame(1, &[0; 4]);
        let b = ctl_frame(5, &[]);
        let c = ctl_frame(6, &[9; 30]);
        let mut payload = std::vec::Vec::new();
        payload.extend_from_slice(&a);
        payload.extend_from_slice(&b);
        payload.extend_from_slice(&c);

        let got = collect(&mut fb, 42, &payload).unwrap();
        assert_eq!(got, vec![a, b, c]);
    }

    #[test]
    fn header_only_frame_at_segment_end() {
        let mut fb = FramingBuffer::new();
        fb.sync(7);
        // Declared length of exactly the header: legal at this layer,
        // delivered with no body even though the segment ends here.
        let frame = raw_frame(8, 8);
        let got = collect(&mut fb, 7, &frame).unwrap();
        assert_eq!(got, vec![frame.clone()]);

        // The stream continues cleanly after it.
        let nextf = ctl_frame(5, &[]);
        let got = collect(&mut fb, 7 + 8, &nextf).unwrap();
        assert_eq!(got, vec![nextf]);
    }

    #[test]
    fn retransmission_is_a_noop() {
        let mut fb = FramingBuffer::new();
        fb.sync(1000);
        let frame = ctl_frame(1, &[0; 8]);
        assert_eq!(collect(&mut fb, 1000, &frame).unwrap().len(), 1);
        assert_eq!(collect(&mut fb, 1000, &frame).unwrap().len(), 0);
    }

    #[test]
    fn overlapping_retransmission_consumes_new_tail() {
        let mut fb = FramingBuffer::new();
        fb.sync(0);
        let a = ctl_frame(1, &[0; 4]);
        let b = ctl_frame(2, &[0; 4]);
        let mut stream = std::vec::Vec::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);

        // First segment carries frame a plus half of b; the
        // retransmission re-sends all of it.
        let cut = a.len() + b.len() / 2;
        let got = collect(&mut fb, 0, &stream[..cut]).unwrap();
        assert_eq!(got, vec![a]);
        let got = collect(&mut fb, 0, &stream).unwrap();
        assert_eq!(got, vec![b]);
    }

    #[test]
    fn gap_is_rejected() {
        let mut fb = FramingBuffer::new();
        fb.sync(0);
        let frame = ctl_frame(1, &[]);
        assert_eq!(
            collect(&mut fb, 100, &frame).unwrap_err(),
            FrameError::OutOfOrder
        );
    }

    #[test]
    fn unsynchronized_is_rejected() {
        let mut fb = FramingBuffer::new();
        let frame = ctl_frame(1, &[]);
        assert_eq!(
            collect(&mut fb, 0, &frame).unwrap_err(),
            FrameError::NotSynchronized
        );
    }

    #[test]
    fn bad_magic_rewinds_for_retry() {
        let mut fb = FramingBuffer::new();
        fb.sync(0);
        let good = ctl_frame(1, &[]);
        let mut bad = good.clone();
        bad[4] ^= 0xff;

        assert_eq!(
            collect(&mut fb, 0, &bad).unwrap_err(),
            FrameError::BadMagic
        );
        // A corrected retransmission at the same position succeeds.
        assert_eq!(collect(&mut fb, 0, &good).unwrap(), vec![good]);
    }

    #[test]
    fn short_declared_length_is_rejected() {
        let mut fb = FramingBuffer::new();
        fb.sync(0);
        let frame = raw_frame(4, 8);
        assert_eq!(
            collect(&mut fb, 0, &frame).unwrap_err(),
            FrameError::BadLength
        );
    }

    #[test]
    fn oversized_frame_is_stepped_over() {
        let mut fb = FramingBuffer::new();
        fb.sync(0);

        // The oversized frame's first bytes arrive; the cursor jumps
        // to its declared end.
        let big = raw_frame(2000, 100);
        assert!(collect(&mut fb, 0, &big).unwrap().is_empty());

        // The middle of the skipped frame is old data now.
        assert!(collect(&mut fb, 500, &[0u8; 400]).unwrap().is_empty());

        // The next frame, at the skip target, is delivered.
        let after = ctl_frame(5, &[]);
        assert_eq!(collect(&mut fb, 2000, &after).unwrap(), vec![after]);
    }

    #[test]
    fn oversized_frame_skip_within_segment() {
        let mut fb = FramingBuffer::new();
        fb.sync(0);

        // An oversized frame carried in full, followed by a normal
        // one in the same segment.
        let big = raw_frame(600, 600);
        let after = ctl_frame(6, &[7; 16]);
        let mut payload = big;
        payload.extend_from_slice(&after);

        let got = collect(&mut fb, 0, &payload).unwrap();
        assert_eq!(got, vec![after]);
    }

    #[test]
    fn fuzzed_declared_lengths() {
        let mut rng = rng();

        for _ in 0..50 {
            let mut stream = std::vec::Vec::new();
            let mut expect = std::vec::Vec::new();

            for _ in 0..20 {
                let declared: u16 = rng.random_range(8..=2048);
                stream.extend_from_slice(&raw_frame(
                    declared,
                    declared as usize,
                ));
                if declared as usize <= SIDE_BUF_CAP {
                    expect.push(declared as usize);
                }
            }

            // Feed the stream in random-sized segments.
            let mut fb = FramingBuffer::new();
            fb.sync(0);
            let mut got = std::vec::Vec::new();
            let mut pos = 0usize;
            while pos < stream.len() {
                let take = rng.random_range(1..=300).min(stream.len() - pos);
                let frames =
                    collect(&mut fb, pos as u32, &stream[pos..pos + take])
                        .unwrap();
                got.extend(frames.iter().map(|f| f.len()));
                pos += take;
            }

            assert_eq!(got, expect);
        }
    }
}
