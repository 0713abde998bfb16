//! Datagram header and frame numbering
//!
//! Header layout (6 bytes):
//!
//! ```text
//! 0      2     3                 6
//! ├──────┼─────┼─────────────────┤
//! │ rsvd │ seq │ frame no (BE24) │ payload ...
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::constants::{FRAME_COUNTER_BITS, HEADER_SIZE};

const FRAME_COUNTER_PERIOD: i64 = 1 << FRAME_COUNTER_BITS;
const FRAME_COUNTER_MASK: u32 = (1 << FRAME_COUNTER_BITS) - 1;

/// Fields of a datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Position of the packet in its frame, starting at 1
    pub sequence: u8,
    /// Frame number modulo 2^24
    pub frame_no: u32,
}

impl PacketHeader {
    pub fn new(sequence: u8, frame_no: u32) -> Self {
        Self {
            sequence,
            frame_no: frame_no & FRAME_COUNTER_MASK,
        }
    }

    /// Read the header at the start of `packet`
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < HEADER_SIZE {
            return None;
        }
        let mut buf = &packet[..HEADER_SIZE];
        buf.advance(2);
        let sequence = buf.get_u8();
        let frame_no = buf.get_uint(3) as u32;
        Some(Self { sequence, frame_no })
    }

    /// Append the encoded header to `buf`
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(0);
        buf.put_u8(self.sequence);
        buf.put_uint(self.frame_no as u64, 3);
    }
}

/// Extends wrapping 24-bit frame numbers to a monotonic count
///
/// Each number is mapped to the candidate `raw + k * 2^24` closest to the
/// highest frame seen so far, so a wrap from `2^24 - 1` to `0` continues at
/// `2^24` and a late packet from before the wrap keeps its old value.
#[derive(Debug, Clone, Default)]
pub struct FrameCounter {
    highest: Option<i64>,
    wraps: u32,
}

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the history; called at the start of every acquisition
    pub fn reset(&mut self) {
        self.highest = None;
        self.wraps = 0;
    }

    pub fn resolve(&mut self, raw: u32) -> i64 {
        let raw = (raw & FRAME_COUNTER_MASK) as i64;
        let Some(highest) = self.highest else {
            self.highest = Some(raw);
            return raw;
        };

        let base = highest - highest.rem_euclid(FRAME_COUNTER_PERIOD);
        let frame_no = [base - FRAME_COUNTER_PERIOD, base, base + FRAME_COUNTER_PERIOD]
            .into_iter()
            .map(|start| start + raw)
            .min_by_key(|candidate| (candidate - highest).abs())
            .unwrap_or(base + raw);

        if frame_no > highest {
            if frame_no / FRAME_COUNTER_PERIOD > highest / FRAME_COUNTER_PERIOD {
                self.wraps += 1;
                tracing::debug!("Frame counter wrapped ({} times)", self.wraps);
            }
            self.highest = Some(frame_no);
        }
        frame_no
    }

    /// Rollovers seen since the last reset
    pub fn wraps(&self) -> u32 {
        self.wraps
    }
}

bitflags! {
    /// Problems detected while assembling a single-link frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// Fewer bytes arrived than the frame holds
        const SHORT = 1;
        /// First body byte is not the frame marker
        const BAD_MARKER = 2;
        /// A datagram carried more bytes than the frame had left
        const OVERRUN = 4;
    }
}

impl FrameFlags {
    /// Error code stored with the frame
    pub fn error_code(&self) -> i32 {
        self.bits() as i32
    }
}
