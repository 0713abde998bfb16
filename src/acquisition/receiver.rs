//! Acquisition orchestrator
//!
//! `DataReceiver` owns the pools and the task scheduler, wires receivers
//! and decode tasks together according to a [`ReceiverConfig`], and is the
//! consumer-facing API of the crate.

use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::decode_task::{
    DecodeTask12, DecodeTask24, DecodedSink, FrameOrigin, OutputSettings, SharedOutputSettings,
};
use crate::codec::compression::MAX_LEVEL;
use crate::codec::{ChipGeometry, ImageDecoder};
use crate::config::{AcquisitionMode, BitDepth, CompressionSettings, ReceiverConfig};
use crate::constants::HEADER_SIZE;
use crate::correction::{DistortionMethod, DistortionTables, Pixel};
use crate::error::{CodecError, ConfigError, DecodeError, Error, Result};
use crate::network::{
    LinkCounters, LinkStats, MultiLinkReceiver, PacketMonitor, SingleLinkTcpReceiver, SingleLinkUdpReceiver,
    TcpTransport, Transport, UdpTransport,
};
use crate::pool::{FrameGuard, FrameInfo, FramePool, LiveFrame, LiveView, PacketLayout, SharedFramePool};
use crate::scheduler::{ReceptionThrottle, TaskControl, TaskScheduler};

/// Time given to tasks to park after `stop`
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest packet sequence number the header can carry
const MAX_PACKETS_PER_FRAME: u32 = u8::MAX as u32;

/// Counters of a running or finished acquisition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionStats {
    /// Images asked for with `set_requested_images`, 0 when open-ended
    pub requested: u64,
    pub raw_received: u64,
    pub decoded_received: u64,
    /// Decoded images waiting for the consumer
    pub queue_depth: usize,
    /// Raw frames that still fit before reception has to drop data
    pub free_buffer: usize,
    pub links: Vec<LinkStats>,
}

impl AcquisitionStats {
    /// Packets and frames refused by the raw pool, over all links
    pub fn rejected(&self) -> u64 {
        self.links.iter().map(|l| l.rejected).sum()
    }
}

/// Decoded output, typed by counter depth
enum Output {
    Short(SharedOutputSettings<i16>),
    Int(SharedOutputSettings<i32>),
}

/// Upper bound of a compressed image of `bytes` input bytes for every codec
fn compressed_bound(bytes: usize) -> usize {
    bytes + bytes / 8 + 1024
}

/// Acquisition pipeline for one detector
pub struct DataReceiver {
    config: ReceiverConfig,
    geometry: ChipGeometry,
    scheduler: TaskScheduler,
    raw: SharedFramePool<u8>,
    output: Output,
    origin: Arc<FrameOrigin>,
    throttle: Option<ReceptionThrottle>,
    links: Vec<Arc<LinkCounters>>,
    addrs: Vec<SocketAddr>,
    receivers: Vec<Arc<TaskControl>>,
    decoders: Vec<Arc<TaskControl>>,
    compression: Option<CompressionSettings>,
    distortion: Option<Arc<DistortionTables>>,
    requested: u64,
    running: bool,
}

impl DataReceiver {
    /// Open the configured links and set up the pipeline
    ///
    /// Fails when a link cannot be bound or connected.
    pub fn init(config: ReceiverConfig) -> Result<Self> {
        config.validate()?;
        let transports = Self::open_links(&config);
        Self::with_transports(config, transports)
    }

    fn open_links(config: &ReceiverConfig) -> Vec<Box<dyn Transport>> {
        let net = &config.network;
        net.links
            .iter()
            .map(|&addr| -> Box<dyn Transport> {
                match net.mode {
                    AcquisitionMode::MultiLinkUdp | AcquisitionMode::SingleLinkUdp => Box::new(
                        UdpTransport::new(addr)
                            .with_timeouts(net.receive_timeout(), net.frame_timeout())
                            .with_recv_buffer(net.recv_buffer_bytes),
                    ),
                    AcquisitionMode::SingleLinkTcp => Box::new(
                        TcpTransport::new(addr)
                            .with_timeouts(net.receive_timeout(), net.frame_timeout())
                            .with_recv_buffer(net.recv_buffer_bytes),
                    ),
                }
            })
            .collect()
    }

    /// Set up the pipeline on caller-supplied transports, one per link
    pub fn with_transports(config: ReceiverConfig, mut transports: Vec<Box<dyn Transport>>) -> Result<Self> {
        config.validate()?;
        if transports.len() != config.network.links.len() {
            return Err(ConfigError::Invalid(format!(
                "{} transports for {} links",
                transports.len(),
                config.network.links.len()
            ))
            .into());
        }

        let geometry = ChipGeometry::new(&config.detector.chips)?;
        let frame_bytes = geometry.raw_frame_bytes();
        let layout = PacketLayout::for_frame(frame_bytes, config.network.packet_size, HEADER_SIZE);
        if config.network.mode == AcquisitionMode::MultiLinkUdp && layout.packets_per_frame > MAX_PACKETS_PER_FRAME {
            return Err(ConfigError::Invalid(format!(
                "{} packets per frame, the header numbers at most {}",
                layout.packets_per_frame, MAX_PACKETS_PER_FRAME
            ))
            .into());
        }

        for transport in transports.iter_mut() {
            transport.connect()?;
        }
        let addrs = transports
            .iter()
            .zip(&config.network.links)
            .map(|(transport, &configured)| transport.local_addr().unwrap_or(configured))
            .collect();

        let buffers = &config.buffers;
        let raw = Arc::new(FramePool::<u8>::new(
            "raw",
            buffers.raw_pool_size,
            frame_bytes,
            buffers.safety_margin,
        ));

        let mut scheduler = TaskScheduler::new(config.worker_threads())?;
        let throttle = config
            .decoding
            .throttle_reception
            .then(|| ReceptionThrottle::for_pool(scheduler.gate(), raw.free_slots()));

        let mut links = Vec::new();
        let mut receivers = Vec::new();
        match config.network.mode {
            AcquisitionMode::MultiLinkUdp => {
                raw.configure_packets(layout, transports.len());
                for (id, transport) in transports.into_iter().enumerate() {
                    let task = MultiLinkReceiver::new(id, transport, raw.clone(), config.network.packet_size);
                    links.push(task.counters());
                    receivers.push(scheduler.spawn(Box::new(task)));
                }
                let monitor = PacketMonitor::new(raw.clone(), throttle.clone());
                receivers.push(scheduler.spawn(Box::new(monitor)));
            }
            AcquisitionMode::SingleLinkUdp => {
                for transport in transports {
                    let task = SingleLinkUdpReceiver::new(transport, raw.clone(), frame_bytes, throttle.clone());
                    links.push(task.counters());
                    receivers.push(scheduler.spawn(Box::new(task)));
                }
            }
            AcquisitionMode::SingleLinkTcp => {
                for transport in transports {
                    let task = SingleLinkTcpReceiver::new(transport, raw.clone(), frame_bytes, throttle.clone());
                    links.push(task.counters());
                    receivers.push(scheduler.spawn(Box::new(task)));
                }
            }
        }

        let distortion = config
            .decoding
            .distortion
            .map(|method| Arc::new(DistortionTables::standard(&geometry, method)));
        let compression = config.decoding.compression;
        if let Some(settings) = &compression {
            settings.method.codec()?;
        }

        let origin = Arc::new(FrameOrigin::new());
        let fps = config.decoding.live_view_fps;
        let mut decoders = Vec::new();
        let output = match config.detector.bit_depth {
            BitDepth::Twelve => {
                let settings = Arc::new(RwLock::new(Self::output_settings::<i16>(
                    &config,
                    &geometry,
                    distortion.clone(),
                    compression,
                    Arc::new(LiveView::new(fps)),
                )));
                for id in 0..config.decoding.decode_tasks {
                    let decoder = ImageDecoder::new(geometry.clone());
                    let task = DecodeTask12::new(id, raw.clone(), decoder, settings.clone(), origin.clone());
                    decoders.push(scheduler.spawn(Box::new(task)));
                }
                Output::Short(settings)
            }
            BitDepth::TwentyFour => {
                let settings = Arc::new(RwLock::new(Self::output_settings::<i32>(
                    &config,
                    &geometry,
                    distortion.clone(),
                    compression,
                    Arc::new(LiveView::new(fps)),
                )));
                for id in 0..config.decoding.decode_tasks {
                    let decoder = ImageDecoder::new(geometry.clone());
                    let task = DecodeTask24::new(id, raw.clone(), decoder, settings.clone(), origin.clone());
                    decoders.push(scheduler.spawn(Box::new(task)));
                }
                Output::Int(settings)
            }
        };

        info!(
            "Receiver ready: {:?}, {} link(s), {} chip(s), {} bit, {} decode task(s) on {} threads",
            config.network.mode,
            links.len(),
            geometry.chip_count(),
            config.detector.bit_depth.bits(),
            decoders.len(),
            scheduler.thread_count()
        );

        Ok(Self {
            config,
            geometry,
            scheduler,
            raw,
            output,
            origin,
            throttle,
            links,
            addrs,
            receivers,
            decoders,
            compression,
            distortion,
            requested: 0,
            running: false,
        })
    }

    fn output_settings<T: Pixel>(
        config: &ReceiverConfig,
        geometry: &ChipGeometry,
        distortion: Option<Arc<DistortionTables>>,
        compression: Option<CompressionSettings>,
        live: Arc<LiveView<T>>,
    ) -> OutputSettings<T> {
        let pixels = distortion
            .as_ref()
            .map_or(geometry.pixel_count(), |tables| tables.pixel_count());
        let buffers = &config.buffers;
        let sink = match compression {
            Some(_) => DecodedSink::Compressed(Arc::new(FramePool::new(
                "compressed",
                buffers.decoded_pool_size,
                compressed_bound(pixels * std::mem::size_of::<T>()),
                buffers.safety_margin,
            ))),
            None => DecodedSink::Pixels(Arc::new(FramePool::new(
                "decoded",
                buffers.decoded_pool_size,
                pixels,
                buffers.safety_margin,
            ))),
        };
        OutputSettings {
            sink,
            distortion,
            compression,
            live,
        }
    }

    /// Rebuild the decoded pool after an output setting changed
    fn rebuild_output(&mut self) {
        let (config, geometry) = (&self.config, &self.geometry);
        match &self.output {
            Output::Short(settings) => {
                let live = settings.read().live.clone();
                live.clear();
                *settings.write() =
                    Self::output_settings(config, geometry, self.distortion.clone(), self.compression, live);
            }
            Output::Int(settings) => {
                let live = settings.read().live.clone();
                live.clear();
                *settings.write() =
                    Self::output_settings(config, geometry, self.distortion.clone(), self.compression, live);
            }
        }
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.running {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Compress decoded images from the next acquisition on; `None` turns
    /// compression off
    pub fn enable_compression(&mut self, settings: Option<CompressionSettings>) -> Result<()> {
        self.ensure_stopped()?;
        if let Some(s) = &settings {
            if s.level > MAX_LEVEL {
                return Err(CodecError::InvalidLevel(s.level).into());
            }
            s.method.codec()?;
        }
        self.compression = settings;
        self.rebuild_output();
        info!("Compression set to {:?}", settings);
        Ok(())
    }

    /// Correct decoded images with the standard tables of this chip set
    pub fn enable_distortion_correction(&mut self, method: Option<DistortionMethod>) -> Result<()> {
        self.ensure_stopped()?;
        self.distortion = method.map(|m| Arc::new(DistortionTables::standard(&self.geometry, m)));
        self.rebuild_output();
        info!("Distortion correction set to {:?}", method);
        Ok(())
    }

    /// Correct decoded images with externally computed tables
    pub fn set_distortion_tables(&mut self, tables: DistortionTables) -> Result<()> {
        self.ensure_stopped()?;
        if tables.source_len() != self.geometry.pixel_count() {
            return Err(DecodeError::DistortionTable(format!(
                "tables read {} pixels, images have {}",
                tables.source_len(),
                self.geometry.pixel_count()
            ))
            .into());
        }
        self.distortion = Some(Arc::new(tables));
        self.rebuild_output();
        Ok(())
    }

    /// Images expected in the next acquisition, 0 for open-ended
    ///
    /// With reception throttling on, decode tasks stay on hold until this
    /// many images worth of raw frames arrived.
    pub fn set_requested_images(&mut self, images: u64) {
        self.requested = images;
        if self.running {
            self.engage_throttle();
        }
    }

    fn engage_throttle(&self) {
        if let Some(throttle) = &self.throttle {
            throttle.engage(self.requested * self.config.detector.bit_depth.raw_frames_per_image());
        }
    }

    /// Begin an acquisition
    ///
    /// Pools are emptied, links drop whatever arrived while idle, and frame
    /// numbering starts over.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }

        self.raw.reset();
        self.origin.clear();
        match &self.output {
            Output::Short(settings) => {
                let settings = settings.read();
                settings.sink.reset();
                settings.live.clear();
            }
            Output::Int(settings) => {
                let settings = settings.read();
                settings.sink.reset();
                settings.live.clear();
            }
        }
        self.links.iter().for_each(|l| l.reset());
        self.engage_throttle();

        self.decoders.iter().for_each(|c| c.start());
        self.receivers.iter().for_each(|c| c.start());
        // links are listening and cleared once every receiver ran its start
        for control in &self.receivers {
            if !control.wait_started(STOP_TIMEOUT) {
                warn!("Task '{}' did not start within {:?}", control.name(), STOP_TIMEOUT);
            }
        }
        self.running = true;
        info!("Acquisition started, {} images requested", self.requested);
        Ok(())
    }

    /// Pause every task; the pipeline can be started again
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.receivers.iter().for_each(|c| c.stop());
        self.decoders.iter().for_each(|c| c.stop());
        if !self.scheduler.wait_idle(STOP_TIMEOUT) {
            warn!("Tasks still busy {:?} after stop", STOP_TIMEOUT);
        }
        if let Some(throttle) = &self.throttle {
            throttle.release();
        }
        self.running = false;

        let stats = self.stats();
        info!(
            "Acquisition stopped: {} raw frames, {} images decoded, {} rejected",
            stats.raw_received,
            stats.decoded_received,
            stats.rejected()
        );
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn geometry(&self) -> &ChipGeometry {
        &self.geometry
    }

    /// Width and height of delivered images
    pub fn image_size(&self) -> (usize, usize) {
        match &self.distortion {
            Some(tables) => tables.size(),
            None => (self.geometry.width(), self.geometry.height()),
        }
    }

    /// Local socket address of every link, as bound at setup
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    fn with_sink<R>(&self, short: impl FnOnce(&DecodedSink<i16>) -> R, int: impl FnOnce(&DecodedSink<i32>) -> R) -> R {
        match &self.output {
            Output::Short(settings) => short(&settings.read().sink),
            Output::Int(settings) => int(&settings.read().sink),
        }
    }

    /// Raw frames that can still be buffered
    pub fn free_buffer_size(&self) -> usize {
        self.raw.free_slots()
    }

    /// Decoded images waiting to be read
    pub fn queue_depth(&self) -> usize {
        self.with_sink(|s| s.stored_images(), |s| s.stored_images())
    }

    pub fn received_raw_images(&self) -> u64 {
        self.raw.total_received_frames()
    }

    pub fn received_decoded_images(&self) -> u64 {
        self.with_sink(|s| s.total_received_frames(), |s| s.total_received_frames())
    }

    /// Next 12-bit image, if uncompressed 12-bit output is configured
    pub fn decoded_image_short(&self) -> Option<(FrameInfo, FrameGuard<i16>)> {
        let Output::Short(settings) = &self.output else {
            return None;
        };
        let pool = match &settings.read().sink {
            DecodedSink::Pixels(pool) => pool.clone(),
            DecodedSink::Compressed(_) => return None,
        };
        pool.next_frame()
    }

    /// Next 24-bit image, if uncompressed 24-bit output is configured
    pub fn decoded_image_int(&self) -> Option<(FrameInfo, FrameGuard<i32>)> {
        let Output::Int(settings) = &self.output else {
            return None;
        };
        let pool = match &settings.read().sink {
            DecodedSink::Pixels(pool) => pool.clone(),
            DecodedSink::Compressed(_) => return None,
        };
        pool.next_frame()
    }

    /// Next compressed image, if compression is on
    ///
    /// The payload is the compressed native-endian pixel array, `i16` for
    /// 12-bit and `i32` for 24-bit images.
    pub fn compressed_data(&self) -> Option<(FrameInfo, FrameGuard<u8>)> {
        let pool = self.with_sink(
            |s| match s {
                DecodedSink::Compressed(pool) => Some(pool.clone()),
                DecodedSink::Pixels(_) => None,
            },
            |s| match s {
                DecodedSink::Compressed(pool) => Some(pool.clone()),
                DecodedSink::Pixels(_) => None,
            },
        )?;
        pool.next_frame()
    }

    /// Latest live-view snapshot of 12-bit output
    pub fn current_image_short(&self) -> Option<LiveFrame<i16>> {
        match &self.output {
            Output::Short(settings) => settings.read().live.current(),
            Output::Int(_) => None,
        }
    }

    /// Latest live-view snapshot of 24-bit output
    pub fn current_image_int(&self) -> Option<LiveFrame<i32>> {
        match &self.output {
            Output::Int(settings) => settings.read().live.current(),
            Output::Short(_) => None,
        }
    }

    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            requested: self.requested,
            raw_received: self.received_raw_images(),
            decoded_received: self.received_decoded_images(),
            queue_depth: self.queue_depth(),
            free_buffer: self.free_buffer_size(),
            links: self.links.iter().map(|l| l.snapshot()).collect(),
        }
    }
}

impl Drop for DataReceiver {
    fn drop(&mut self) {
        self.stop();
        self.scheduler.shutdown();
        debug!("Receiver shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CompressionMethod, ImageEncoder};
    use crate::network::transport::mock::Script;
    use crate::network::Packetizer;
    use std::thread;
    use std::time::Instant;

    fn config(mode: AcquisitionMode, links: usize, chips: &[u8]) -> ReceiverConfig {
        let mut config = ReceiverConfig::default();
        config.detector.chips = chips.to_vec();
        config.network.mode = mode;
        config.network.links = (0..links)
            .map(|i| std::net::SocketAddr::from(([127, 0, 0, 1], 9000 + i as u16)))
            .collect();
        config.buffers.raw_pool_size = 16;
        config.buffers.decoded_pool_size = 16;
        config.buffers.safety_margin = 2;
        config.decoding.decode_tasks = 2;
        config
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn image(pixels: usize, seed: u16) -> Vec<u16> {
        (0..pixels).map(|i| (i as u16 ^ seed.wrapping_mul(31)) % 4096).collect()
    }

    #[test]
    fn test_single_link_udp_pipeline() {
        let config = config(AcquisitionMode::SingleLinkUdp, 1, &[1]);
        let script = Script::default();
        let mut receiver = DataReceiver::with_transports(config, vec![Box::new(script.transport())]).unwrap();
        receiver.start().unwrap();

        let mut encoder = ImageEncoder::for_chips(&[1]).unwrap();
        let mut packetizer = Packetizer::new(8198);
        let images: Vec<Vec<u16>> = (0..4).map(|n| image(256 * 256, n)).collect();
        for (n, img) in images.iter().enumerate() {
            for datagram in packetizer.single_link(&encoder.encode(img).unwrap(), n as u32) {
                script.push(datagram.to_vec());
            }
        }

        let mut seen = Vec::new();
        assert!(wait_for(|| {
            while let Some((info, data)) = receiver.decoded_image_short() {
                let expected: Vec<i16> = images[seen.len()].iter().map(|&v| v as i16).collect();
                assert_eq!(&*data, expected.as_slice());
                seen.push((info.frame_no, info.error_code));
            }
            seen.len() == 4
        }));
        assert_eq!(seen, vec![(1, 0), (2, 0), (3, 0), (4, 0)]);
        assert!(receiver.current_image_short().is_some());

        receiver.stop();
        let stats = receiver.stats();
        assert_eq!(stats.raw_received, 4);
        assert_eq!(stats.decoded_received, 4);
        assert_eq!(stats.links[0].frames, 4);
    }

    #[test]
    fn test_throttled_request_larger_than_raw_pool() {
        let mut config = config(AcquisitionMode::SingleLinkUdp, 1, &[1]);
        config.buffers.raw_pool_size = 8;
        config.decoding.throttle_reception = true;
        let script = Script::default();
        let mut receiver = DataReceiver::with_transports(config, vec![Box::new(script.transport())]).unwrap();
        receiver.set_requested_images(20);
        receiver.start().unwrap();

        let mut encoder = ImageEncoder::for_chips(&[1]).unwrap();
        let mut packetizer = Packetizer::new(8198);
        for n in 0..20u16 {
            for datagram in packetizer.single_link(&encoder.encode(&image(256 * 256, n)).unwrap(), n as u32) {
                script.push(datagram.to_vec());
            }
        }

        // the receiver stalls on the full raw pool until decoders are let in
        let mut seen = Vec::new();
        assert!(wait_for(|| {
            while let Some((info, _)) = receiver.decoded_image_short() {
                seen.push(info.frame_no);
            }
            seen.len() == 20
        }));
        assert_eq!(seen, (1..=20).collect::<Vec<i64>>());

        receiver.stop();
        assert_eq!(receiver.stats().raw_received, 20);
    }

    #[test]
    fn test_multi_link_24_bit_with_compression() {
        let mut config = config(AcquisitionMode::MultiLinkUdp, 2, &[1, 2]);
        config.detector.bit_depth = BitDepth::TwentyFour;
        config.decoding.compression = Some(CompressionSettings {
            method: CompressionMethod::Lz4,
            level: 0,
        });
        let scripts = [Script::default(), Script::default()];
        let transports: Vec<Box<dyn Transport>> =
            scripts.iter().map(|s| Box::new(s.transport()) as Box<dyn Transport>).collect();
        let mut receiver = DataReceiver::with_transports(config, transports).unwrap();
        receiver.start().unwrap();

        let mut encoder = ImageEncoder::for_chips(&[1, 2]).unwrap();
        let mut packetizer = Packetizer::new(8198);
        let counts: Vec<Vec<u32>> = (0..3u32)
            .map(|n| (0..512 * 256u32).map(|i| (i * 37 + n * 4099) % (1 << 24)).collect())
            .collect();
        let mut frame_no = 100u32;
        for image in &counts {
            let (low, high) = encoder.encode_24(image).unwrap();
            for raw in [low, high] {
                // alternate packets between the links
                for (i, packet) in packetizer.multi_link(&raw, frame_no).into_iter().enumerate() {
                    scripts[i % 2].push(packet.to_vec());
                }
                frame_no += 1;
            }
        }

        // the monitor publishes a complete frame as soon as its last packet is in
        let mut seen = Vec::new();
        let codec = CompressionMethod::Lz4.codec().unwrap();
        assert!(wait_for(|| {
            while let Some((info, data)) = receiver.compressed_data() {
                let mut bytes = Vec::new();
                codec.decompress(&data, &mut bytes).unwrap();
                let pixels: Vec<i32> = bytes
                    .chunks_exact(4)
                    .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                let expected = &counts[seen.len()];
                assert!(pixels.iter().zip(expected).all(|(&p, &c)| p == c as i32));
                seen.push(info.frame_no);
            }
            seen.len() == 3
        }));
        assert_eq!(seen, vec![100, 101, 102]);
        assert!(receiver.decoded_image_int().is_none());
    }

    #[test]
    fn test_reconfigure_only_while_stopped() {
        let config = config(AcquisitionMode::SingleLinkUdp, 1, &[1, 2]);
        let script = Script::default();
        let mut receiver = DataReceiver::with_transports(config, vec![Box::new(script.transport())]).unwrap();
        assert_eq!(receiver.image_size(), (512, 256));

        receiver.enable_distortion_correction(Some(DistortionMethod::Divide)).unwrap();
        assert_eq!(receiver.image_size(), (516, 256));

        let bad = CompressionSettings {
            method: CompressionMethod::Lz4,
            level: 12,
        };
        assert!(receiver.enable_compression(Some(bad)).is_err());

        receiver.start().unwrap();
        assert!(matches!(
            receiver.enable_distortion_correction(None),
            Err(Error::Busy)
        ));
        receiver.stop();
        receiver.enable_distortion_correction(None).unwrap();
        assert_eq!(receiver.image_size(), (512, 256));
    }

    #[test]
    fn test_external_tables_checked_against_geometry() {
        let config = config(AcquisitionMode::SingleLinkUdp, 1, &[1]);
        let script = Script::default();
        let mut receiver = DataReceiver::with_transports(config, vec![Box::new(script.transport())]).unwrap();
        let wrong = DistortionTables::new(vec![0; 4], vec![1; 4], 2, 2, 10).unwrap();
        assert!(receiver.set_distortion_tables(wrong).is_err());
        let flip = DistortionTables::new(
            (0..256 * 256u32).rev().collect(),
            vec![1; 256 * 256],
            256,
            256,
            256 * 256,
        )
        .unwrap();
        receiver.set_distortion_tables(flip).unwrap();
    }

    #[test]
    fn test_transport_count_must_match_links() {
        let config = config(AcquisitionMode::MultiLinkUdp, 2, &[1]);
        let script = Script::default();
        let result = DataReceiver::with_transports(config, vec![Box::new(script.transport())]);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
