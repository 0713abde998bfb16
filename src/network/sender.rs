//! Packetizers producing the detector's wire formats
//!
//! Used by the simulator binary and by tests to feed the receivers exactly
//! what the hardware would send.

use bytes::{BufMut, Bytes, BytesMut};

use super::header::PacketHeader;
use crate::constants::{FRAME_MARKER, HEADER_SIZE};

/// Splits raw frames into datagrams
#[derive(Debug)]
pub struct Packetizer {
    packet_size: usize,
    marker: u8,
    buf: BytesMut,
}

impl Packetizer {
    /// # Panics
    /// Panics if `packet_size` does not leave room for a payload.
    pub fn new(packet_size: usize) -> Self {
        assert!(packet_size > HEADER_SIZE, "packet size must exceed the header");
        Self {
            packet_size,
            marker: FRAME_MARKER,
            buf: BytesMut::new(),
        }
    }

    /// Marker written in front of single-link frame bodies
    pub fn with_marker(mut self, marker: u8) -> Self {
        self.marker = marker;
        self
    }

    pub fn payload_size(&self) -> usize {
        self.packet_size - HEADER_SIZE
    }

    /// Packets needed for a multi-link frame of `frame_len` bytes
    pub fn packets_per_frame(&self, frame_len: usize) -> usize {
        frame_len.div_ceil(self.payload_size())
    }

    /// Multi-link datagrams: every packet has a header, sequence starts at 1
    pub fn multi_link(&mut self, frame: &[u8], frame_no: u32) -> Vec<Bytes> {
        let payload = self.payload_size();
        self.buf.reserve(frame.len() + frame.len().div_ceil(payload) * HEADER_SIZE);

        frame
            .chunks(payload)
            .enumerate()
            .map(|(i, chunk)| {
                PacketHeader::new((i + 1) as u8, frame_no).write(&mut self.buf);
                self.buf.put_slice(chunk);
                self.buf.split().freeze()
            })
            .collect()
    }

    /// Single-link frame body: marker byte followed by the raw frame
    pub fn body(&mut self, frame: &[u8]) -> Bytes {
        self.buf.reserve(frame.len() + 1);
        self.buf.put_u8(self.marker);
        self.buf.put_slice(frame);
        self.buf.split().freeze()
    }

    /// Single-link datagrams: the first one is a bare slice of the body,
    /// the rest carry a header in front of their slice
    pub fn single_link(&mut self, frame: &[u8], frame_no: u32) -> Vec<Bytes> {
        let body = self.body(frame);
        let first = self.packet_size.min(body.len());
        let mut datagrams = vec![body.slice(..first)];

        let rest = &body[first..];
        for (i, chunk) in rest.chunks(self.payload_size()).enumerate() {
            PacketHeader::new((i + 2) as u8, frame_no).write(&mut self.buf);
            self.buf.put_slice(chunk);
            datagrams.push(self.buf.split().freeze());
        }
        datagrams
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::udp::assemble_frame;
    use crate::network::{FrameFlags, ReceiveStatus};
    use crate::pool::PacketLayout;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[test]
    fn test_multi_link_offsets() {
        let frame: Vec<u8> = (0..25).collect();
        let mut packetizer = Packetizer::new(16);
        let packets = packetizer.multi_link(&frame, 42);
        let layout = PacketLayout::for_frame(frame.len(), 16, HEADER_SIZE);
        assert_eq!(packets.len(), layout.packets_per_frame as usize);

        let mut rebuilt = vec![0u8; frame.len()];
        for packet in &packets {
            let header = PacketHeader::parse(packet).unwrap();
            assert_eq!(header.frame_no, 42);
            let offset = layout.offset_of(header.sequence as u32).unwrap();
            let payload = &packet[HEADER_SIZE..];
            rebuilt[offset..offset + payload.len()].copy_from_slice(payload);
        }
        assert_eq!(rebuilt, frame);
    }

    #[test]
    fn test_single_link_reassembles() {
        let frame: Vec<u8> = (0..40).collect();
        let mut packetizer = Packetizer::new(16);
        let datagrams = packetizer.single_link(&frame, 1);
        assert_eq!(datagrams[0].len(), 16);
        assert_eq!(datagrams[0][0], FRAME_MARKER);

        let mut queue: VecDeque<Bytes> = datagrams.into();
        let recv = |out: &mut [u8]| {
            Ok(queue.pop_front().map(|d| {
                out[..d.len()].copy_from_slice(&d);
                d.len()
            }))
        };
        let mut body = vec![0u8; frame.len() + 1];
        let mut scratch = [0u8; 64];
        let status = assemble_frame(recv, &mut body, &mut scratch, Duration::from_millis(5)).unwrap();
        assert_eq!(
            status,
            ReceiveStatus::Complete {
                flags: FrameFlags::empty(),
                bytes: 41
            }
        );
        assert_eq!(&body[1..], &frame[..]);
    }
}
