//! Receiver tasks writing detector data into the raw frame pool

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::header::{FrameCounter, FrameFlags, PacketHeader};
use super::tcp::StreamAssembler;
use super::transport::{ReceiveStatus, Transport};
use crate::constants::{FRAME_MARKER, WRITE_RETRY_SLEEP};
use crate::error::NetworkError;
use crate::pool::{FramePool, SharedFramePool};
use crate::scheduler::{Priority, ReceptionThrottle, Step, Task, TaskControl};

/// Datagrams handled per step before checking the task state again
const PACKET_BURST: usize = 64;

const MIN_STREAM_CHUNK: usize = 64 * 1024;
const MAX_STREAM_CHUNK: usize = 4 * 1024 * 1024;

/// Counters of one receiver task
#[derive(Debug, Default)]
pub struct LinkCounters {
    packets: AtomicU64,
    frames: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of [`LinkCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Datagrams or stream reads taken off the transport
    pub packets: u64,
    /// Whole frames stored (single-link modes)
    pub frames: u64,
    /// Packets or frames the pool refused
    pub rejected: u64,
    /// Datagrams too short to carry a header
    pub malformed: u64,
    /// Transport errors
    pub errors: u64,
}

impl LinkCounters {
    pub fn snapshot(&self) -> LinkStats {
        LinkStats {
            packets: self.packets.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [&self.packets, &self.frames, &self.rejected, &self.malformed, &self.errors] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Connection handling shared by all receivers
struct Link {
    transport: Box<dyn Transport>,
    counters: Arc<LinkCounters>,
    /// Set after the first error of an acquisition so a dead link logs once
    failing: bool,
}

impl Link {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            counters: Arc::new(LinkCounters::default()),
            failing: false,
        }
    }

    /// Reconnect if needed and drop whatever arrived while paused
    fn resume(&mut self) {
        self.failing = false;
        if !self.transport.is_live() {
            if let Err(e) = self.transport.connect() {
                warn!("Cannot reopen {}: {}", self.transport.describe(), e);
                return;
            }
        }
        let stale = self.transport.clear_data_in_socket();
        if stale > 0 {
            debug!("{}: dropped {} bytes from before the start", self.transport.describe(), stale);
        }
    }

    fn failed(&mut self, e: NetworkError) -> Step {
        LinkCounters::bump(&self.counters.errors);
        if !self.failing {
            warn!("{}: {}", self.transport.describe(), e);
            self.failing = true;
        }
        Step::Idle
    }
}

/// One link of a multi-link acquisition
///
/// Every datagram carries its frame number and sequence number, so each
/// packet goes straight to its place in the frame regardless of which link
/// delivered it.
pub struct MultiLinkReceiver {
    name: String,
    id: usize,
    link: Link,
    pool: SharedFramePool<u8>,
    counter: FrameCounter,
    buf: Vec<u8>,
}

impl MultiLinkReceiver {
    /// `id` indexes the pool's task monitor and must be below the task
    /// count given to `configure_packets`
    pub fn new(id: usize, transport: Box<dyn Transport>, pool: SharedFramePool<u8>, packet_size: usize) -> Self {
        Self {
            name: format!("multi-link-{}", id),
            id,
            link: Link::new(transport),
            pool,
            counter: FrameCounter::new(),
            buf: vec![0u8; packet_size.max(1)],
        }
    }

    pub fn counters(&self) -> Arc<LinkCounters> {
        self.link.counters.clone()
    }
}

impl Task for MultiLinkReceiver {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn on_start(&mut self) {
        self.link.resume();
        self.counter.reset();
    }

    fn step(&mut self, control: &TaskControl) -> Step {
        let mut received = 0;
        while received < PACKET_BURST && control.is_running() {
            let len = match self.link.transport.receive_packet(&mut self.buf) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => return self.link.failed(e),
            };
            received += 1;
            LinkCounters::bump(&self.link.counters.packets);

            let packet = &self.buf[..len];
            let Some(header) = PacketHeader::parse(packet) else {
                LinkCounters::bump(&self.link.counters.malformed);
                continue;
            };
            let frame_no = self.counter.resolve(header.frame_no);
            if !self.pool.set_packet(packet, frame_no, 0, self.id, header.sequence as u32) {
                trace!("{}: packet {} of frame {} rejected", self.name, header.sequence, frame_no);
                LinkCounters::bump(&self.link.counters.rejected);
            }
        }

        if received > 0 {
            Step::Busy
        } else {
            Step::Idle
        }
    }

    fn on_exit(&mut self) {
        self.link.transport.disconnect();
    }
}

fn report(throttle: &Option<ReceptionThrottle>, pool: &FramePool<u8>) {
    if let Some(throttle) = throttle {
        throttle.observe(pool.total_received_frames(), pool.free_slots());
    }
}

/// Publishes multi-link frames once they are complete or given up on
pub struct PacketMonitor {
    pool: SharedFramePool<u8>,
    throttle: Option<ReceptionThrottle>,
    published: u64,
}

impl PacketMonitor {
    pub fn new(pool: SharedFramePool<u8>, throttle: Option<ReceptionThrottle>) -> Self {
        Self {
            pool,
            throttle,
            published: 0,
        }
    }
}

impl Task for PacketMonitor {
    fn name(&self) -> &str {
        "packet-monitor"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn on_start(&mut self) {
        self.published = 0;
    }

    fn step(&mut self, _control: &TaskControl) -> Step {
        let mut finished = 0;
        while self.pool.is_image_finished() {
            finished += 1;
        }
        // a full pool stalls the links, so this runs on idle steps too
        report(&self.throttle, &self.pool);
        if finished == 0 {
            return Step::Idle;
        }

        self.published += finished;
        Step::Busy
    }

    fn on_exit(&mut self) {
        debug!("Packet monitor published {} frames", self.published);
    }
}

/// Single UDP stream, one frame after another
///
/// The detector does not number frames in this mode; frames are numbered
/// 1, 2, ... in arrival order.
pub struct SingleLinkUdpReceiver {
    link: Link,
    pool: SharedFramePool<u8>,
    throttle: Option<ReceptionThrottle>,
    body: Vec<u8>,
    next_frame_no: i64,
}

impl SingleLinkUdpReceiver {
    /// `frame_len` is the raw frame size, without the marker byte
    pub fn new(
        transport: Box<dyn Transport>,
        pool: SharedFramePool<u8>,
        frame_len: usize,
        throttle: Option<ReceptionThrottle>,
    ) -> Self {
        Self {
            link: Link::new(transport),
            pool,
            throttle,
            body: vec![0u8; frame_len + 1],
            next_frame_no: 1,
        }
    }

    pub fn counters(&self) -> Arc<LinkCounters> {
        self.link.counters.clone()
    }
}

impl Task for SingleLinkUdpReceiver {
    fn name(&self) -> &str {
        "single-link-udp"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn on_start(&mut self) {
        self.link.resume();
        self.next_frame_no = 1;
    }

    fn step(&mut self, control: &TaskControl) -> Step {
        let flags = match self.link.transport.receive_data(&mut self.body) {
            Ok(ReceiveStatus::NoData) => return Step::Idle,
            Ok(ReceiveStatus::Complete { flags, .. }) => flags,
            Err(e) => return self.link.failed(e),
        };
        LinkCounters::bump(&self.link.counters.packets);
        if !flags.is_empty() {
            debug!("Frame {} arrived with {:?}", self.next_frame_no, flags);
        }

        let (pool, throttle) = (&self.pool, &self.throttle);
        let (image, frame_no) = (&self.body[1..], self.next_frame_no);
        let stored = control.retry_until(WRITE_RETRY_SLEEP, || {
            let stored = pool.set_image(image, frame_no, flags.error_code());
            report(throttle, pool);
            stored
        });
        if stored {
            self.next_frame_no += 1;
            LinkCounters::bump(&self.link.counters.frames);
        } else {
            LinkCounters::bump(&self.link.counters.rejected);
        }
        Step::Busy
    }

    fn on_exit(&mut self) {
        self.link.transport.disconnect();
    }
}

/// Single TCP stream of frame bodies
///
/// Reads are cut into frames by a [`StreamAssembler`]; a frame boundary may
/// fall anywhere inside a read.
pub struct SingleLinkTcpReceiver {
    link: Link,
    pool: SharedFramePool<u8>,
    throttle: Option<ReceptionThrottle>,
    assembler: StreamAssembler,
    chunk: Vec<u8>,
    next_frame_no: i64,
}

impl SingleLinkTcpReceiver {
    /// `frame_len` is the raw frame size, without the marker byte
    pub fn new(
        transport: Box<dyn Transport>,
        pool: SharedFramePool<u8>,
        frame_len: usize,
        throttle: Option<ReceptionThrottle>,
    ) -> Self {
        let chunk = (frame_len + 1).clamp(MIN_STREAM_CHUNK, MAX_STREAM_CHUNK);
        Self {
            link: Link::new(transport),
            pool,
            throttle,
            assembler: StreamAssembler::new(frame_len + 1),
            chunk: vec![0u8; chunk],
            next_frame_no: 1,
        }
    }

    pub fn counters(&self) -> Arc<LinkCounters> {
        self.link.counters.clone()
    }
}

impl Task for SingleLinkTcpReceiver {
    fn name(&self) -> &str {
        "single-link-tcp"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn on_start(&mut self) {
        self.link.resume();
        self.assembler.reset();
        self.next_frame_no = 1;
    }

    fn step(&mut self, control: &TaskControl) -> Step {
        let len = match self.link.transport.receive_range(&mut self.chunk, 1) {
            Ok(0) => return Step::Idle,
            Ok(len) => len,
            Err(e) => return self.link.failed(e),
        };
        LinkCounters::bump(&self.link.counters.packets);

        let (pool, throttle) = (&self.pool, &self.throttle);
        let counters = &self.link.counters;
        let next_frame_no = &mut self.next_frame_no;
        self.assembler.push(&self.chunk[..len], |body| {
            let flags = if body[0] == FRAME_MARKER {
                FrameFlags::empty()
            } else {
                FrameFlags::BAD_MARKER
            };
            let frame_no = *next_frame_no;
            let stored = control.retry_until(WRITE_RETRY_SLEEP, || {
                let stored = pool.set_image(&body[1..], frame_no, flags.error_code());
                report(throttle, pool);
                stored
            });
            if stored {
                *next_frame_no += 1;
                LinkCounters::bump(&counters.frames);
            } else {
                LinkCounters::bump(&counters.rejected);
            }
        });
        Step::Busy
    }

    fn on_exit(&mut self) {
        if self.assembler.pending() > 0 {
            info!("TCP receiver exits with {} bytes of a partial frame", self.assembler.pending());
        }
        self.link.transport.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::sender::Packetizer;
    use crate::network::transport::mock::Script;
    use crate::pool::{FramePool, PacketLayout, FRAME_COMPLETE, FRAME_INCOMPLETE};
    use crate::constants::HEADER_SIZE;

    fn running() -> TaskControl {
        let control = TaskControl::new("test");
        control.start();
        control
    }

    fn drain(pool: &FramePool<u8>) -> Vec<(i64, i32, Vec<u8>)> {
        std::iter::from_fn(|| pool.next_frame())
            .map(|(info, data)| (info.frame_no, info.error_code, data.to_vec()))
            .collect()
    }

    #[test]
    fn test_single_link_bad_marker_still_stored() {
        let frame: Vec<u8> = (0..50).collect();
        let pool = Arc::new(FramePool::<u8>::new("raw", 8, frame.len(), 1));
        let script = Script::default();
        let mut receiver = SingleLinkUdpReceiver::new(Box::new(script.transport()), pool.clone(), frame.len(), None);
        let control = running();
        receiver.on_start();

        let mut packetizer = Packetizer::new(20).with_marker(0x55);
        for datagram in packetizer.single_link(&frame, 1) {
            script.push(datagram.to_vec());
        }
        assert_eq!(receiver.step(&control), Step::Busy);
        assert_eq!(receiver.step(&control), Step::Idle);

        let frames = drain(&pool);
        assert_eq!(frames.len(), 1);
        let (frame_no, error_code, data) = &frames[0];
        assert_eq!(*frame_no, 1);
        assert_ne!(error_code & FrameFlags::BAD_MARKER.error_code(), 0);
        assert_eq!(data, &frame);
        assert_eq!(receiver.counters().snapshot().frames, 1);
    }

    #[test]
    fn test_single_link_numbers_frames_in_arrival_order() {
        let pool = Arc::new(FramePool::<u8>::new("raw", 8, 10, 1));
        let script = Script::default();
        let mut receiver = SingleLinkUdpReceiver::new(Box::new(script.transport()), pool.clone(), 10, None);
        let control = running();

        script.push(vec![1, 2, 3]);
        receiver.on_start();
        assert_eq!(*script.cleared.lock(), 1);

        let mut packetizer = Packetizer::new(64);
        for n in 0..3u8 {
            for datagram in packetizer.single_link(&[n; 10], 900 + n as u32) {
                script.push(datagram.to_vec());
            }
            receiver.step(&control);
        }
        let numbers: Vec<i64> = drain(&pool).iter().map(|f| f.0).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_multi_link_loss_and_completion() {
        let frame_len = 20;
        let packet_size = 16;
        let pool = Arc::new(FramePool::<u8>::new("raw", 16, frame_len, 2));
        pool.configure_packets(PacketLayout::for_frame(frame_len, packet_size, HEADER_SIZE), 2);

        let scripts = [Script::default(), Script::default()];
        let mut receivers: Vec<MultiLinkReceiver> = scripts
            .iter()
            .enumerate()
            .map(|(id, s)| MultiLinkReceiver::new(id, Box::new(s.transport()), pool.clone(), packet_size))
            .collect();
        let mut monitor = PacketMonitor::new(pool.clone(), None);
        let control = running();
        receivers.iter_mut().for_each(|r| r.on_start());

        let mut packetizer = Packetizer::new(packet_size);
        for frame_no in 1..=4u32 {
            let packets = packetizer.multi_link(&vec![frame_no as u8; frame_len], frame_no);
            assert_eq!(packets.len(), 2);
            for (i, packet) in packets.into_iter().enumerate() {
                if frame_no == 2 && i == 1 {
                    continue;
                }
                scripts[i].push(packet.to_vec());
            }
        }
        for receiver in &mut receivers {
            assert_eq!(receiver.step(&control), Step::Busy);
        }
        assert_eq!(monitor.step(&control), Step::Busy);

        let frames = drain(&pool);
        let codes: Vec<(i64, i32)> = frames.iter().map(|f| (f.0, f.1)).collect();
        assert_eq!(
            codes,
            vec![(1, FRAME_COMPLETE), (2, FRAME_INCOMPLETE), (3, FRAME_COMPLETE), (4, FRAME_COMPLETE)]
        );
        assert_eq!(frames[1].2[..10], [2u8; 10]);
        assert_eq!(frames[1].2[10..], [0u8; 10]);
        assert_eq!(frames[3].2, vec![4u8; frame_len]);
    }

    #[test]
    fn test_multi_link_rollover() {
        let top = (1u32 << 24) - 1;
        let pool = Arc::new(FramePool::<u8>::new("raw", 16, 10, 2));
        pool.configure_packets(PacketLayout::for_frame(10, 16, HEADER_SIZE), 1);
        let script = Script::default();
        let mut receiver = MultiLinkReceiver::new(0, Box::new(script.transport()), pool.clone(), 16);
        let mut monitor = PacketMonitor::new(pool.clone(), None);
        let control = running();
        receiver.on_start();

        let mut packetizer = Packetizer::new(16);
        for raw in [top - 1, top, 0, 1] {
            for packet in packetizer.multi_link(&[7; 10], raw) {
                script.push(packet.to_vec());
            }
        }
        receiver.step(&control);
        monitor.step(&control);

        let numbers: Vec<i64> = drain(&pool).iter().map(|f| f.0).collect();
        let top = top as i64;
        assert_eq!(numbers, vec![top - 1, top, top + 1, top + 2]);
    }

    #[test]
    fn test_malformed_datagram_counted() {
        let pool = Arc::new(FramePool::<u8>::new("raw", 8, 10, 1));
        pool.configure_packets(PacketLayout::for_frame(10, 16, HEADER_SIZE), 1);
        let script = Script::default();
        let mut receiver = MultiLinkReceiver::new(0, Box::new(script.transport()), pool, 16);
        receiver.on_start();
        script.push(vec![0, 0, 1]);
        receiver.step(&running());
        assert_eq!(receiver.counters().snapshot().malformed, 1);
    }

    #[test]
    fn test_tcp_frames_across_reads() {
        let frame_len = 6;
        let pool = Arc::new(FramePool::<u8>::new("raw", 8, frame_len, 1));
        let script = Script::default();
        let throttle = ReceptionThrottle::new(Default::default());
        throttle.engage(3);
        let mut receiver = SingleLinkTcpReceiver::new(
            Box::new(script.transport()),
            pool.clone(),
            frame_len,
            Some(throttle.clone()),
        );
        let control = running();
        receiver.on_start();

        let mut packetizer = Packetizer::new(64);
        let stream: Vec<u8> = (1..=3u8)
            .flat_map(|n| packetizer.body(&[n; 6]).to_vec())
            .collect();
        // reads split inside frame bodies, the last one holds two frames
        for chunk in [&stream[..4], &stream[4..9], &stream[9..]] {
            script.push(chunk.to_vec());
            receiver.step(&control);
        }

        let frames = drain(&pool);
        assert_eq!(frames.len(), 3);
        for (i, (frame_no, error_code, data)) in frames.iter().enumerate() {
            assert_eq!(*frame_no, i as i64 + 1);
            assert_eq!(*error_code, 0);
            assert_eq!(data, &vec![i as u8 + 1; 6]);
        }
        assert!(!throttle.is_engaged());
    }
}
