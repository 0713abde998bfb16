//! Packet accumulation state for multi-link reception
//!
//! Several receiver tasks write packets of the same frame stream into one
//! pool. The tracker remembers how far each of them has progressed so the
//! monitor task can decide when the oldest unfinished frame is done.

/// Monitor value of a receiver task that has not stored anything yet
pub const NO_FRAME: i64 = -1;

/// How a raw frame is split into datagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    /// Full datagram size including the header
    pub packet_size: usize,
    /// Transport header stripped from every datagram
    pub header_size: usize,
    /// Packets needed to complete one frame
    pub packets_per_frame: u32,
}

impl PacketLayout {
    /// Layout for frames of `frame_bytes` carried in `packet_size` datagrams
    pub fn for_frame(frame_bytes: usize, packet_size: usize, header_size: usize) -> Self {
        let payload = packet_size.saturating_sub(header_size).max(1);
        Self {
            packet_size,
            header_size,
            packets_per_frame: frame_bytes.div_ceil(payload) as u32,
        }
    }

    /// Payload bytes carried by a full-sized packet
    pub fn payload_size(&self) -> usize {
        self.packet_size.saturating_sub(self.header_size)
    }

    /// Offset inside the frame of packet `sequence` (1-based)
    pub fn offset_of(&self, sequence: u32) -> Option<usize> {
        if sequence == 0 || sequence > self.packets_per_frame {
            return None;
        }
        Some((sequence as usize - 1) * self.payload_size())
    }
}

impl Default for PacketLayout {
    fn default() -> Self {
        Self {
            packet_size: 0,
            header_size: 0,
            packets_per_frame: 1,
        }
    }
}

/// Per-acquisition progress of the packet writers
#[derive(Debug, Clone)]
pub(crate) struct PacketTracker {
    pub layout: PacketLayout,
    /// Highest frame number stored by each receiver task
    monitors: Vec<i64>,
    /// Oldest frame not yet handed to readers
    pub last_unfinished: i64,
    pub first_frame_no: i64,
    pub started: bool,
}

impl PacketTracker {
    pub fn new(layout: PacketLayout, tasks: usize) -> Self {
        Self {
            layout,
            monitors: vec![NO_FRAME; tasks.max(1)],
            last_unfinished: 0,
            first_frame_no: 0,
            started: false,
        }
    }

    pub fn configure(&mut self, layout: PacketLayout, tasks: usize) {
        self.layout = layout;
        self.monitors = vec![NO_FRAME; tasks.max(1)];
        self.reset();
    }

    pub fn reset(&mut self) {
        self.monitors.iter_mut().for_each(|m| *m = NO_FRAME);
        self.last_unfinished = 0;
        self.first_frame_no = 0;
        self.started = false;
    }

    /// First packet of the acquisition fixes the frame numbering origin
    pub fn start(&mut self, frame_no: i64) {
        self.started = true;
        self.first_frame_no = frame_no;
        self.last_unfinished = frame_no;
    }

    /// Move the origin back to an earlier frame
    ///
    /// Links start on their own, so the first packet seen may belong to a
    /// later frame than another link's first packet. Only valid while no
    /// frame has been published.
    pub fn rewind(&mut self, frame_no: i64) {
        self.first_frame_no = frame_no;
        self.last_unfinished = self.last_unfinished.min(frame_no);
    }

    /// Highest frame stored by any receiver task
    pub fn highest(&self) -> Option<i64> {
        self.monitors.iter().copied().filter(|&m| m != NO_FRAME).max()
    }

    pub fn observe(&mut self, task_id: usize, frame_no: i64) {
        if let Some(monitor) = self.monitors.get_mut(task_id) {
            *monitor = (*monitor).max(frame_no);
        }
    }

    pub fn monitor(&self, task_id: usize) -> Option<i64> {
        self.monitors.get(task_id).copied()
    }

    pub fn task_count(&self) -> usize {
        self.monitors.len()
    }

    /// True when every receiver that has stored anything is at least two
    /// frames past `frame_no`.
    ///
    /// Timing heuristic for multi-link UDP: a receiver this far ahead is not
    /// expected to deliver more packets for `frame_no`, but nothing proves it.
    pub fn all_advanced_past(&self, frame_no: i64) -> bool {
        let mut active = self.monitors.iter().filter(|&&m| m != NO_FRAME).peekable();
        if active.peek().is_none() {
            return false;
        }
        active.all(|&m| m >= frame_no + 2)
    }
}
