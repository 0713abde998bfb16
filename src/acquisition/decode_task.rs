//! Decode tasks: raw pool in, images out
//!
//! Each task pops raw frames, decodes them and pushes the result through
//! the output stage (distortion correction, compression, live view) into
//! the decoded pool. Decoded images land at the slot of their frame number,
//! so several decode tasks may finish out of order without reordering the
//! stream the consumer sees.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::{Codec, ImageDecoder};
use crate::config::CompressionSettings;
use crate::constants::WRITE_RETRY_SLEEP;
use crate::correction::{DistortionCorrector, DistortionTables, Pixel};
use crate::error::CodecError;
use crate::pool::{FrameInfo, LiveView, SharedFramePool, FRAME_COMPLETE, FRAME_INCOMPLETE};
use crate::scheduler::{Priority, Step, Task, TaskControl};

/// Destination of decoded images
pub enum DecodedSink<T> {
    /// Uncompressed pixels
    Pixels(SharedFramePool<T>),
    /// Compressed pixel bytes
    Compressed(SharedFramePool<u8>),
}

impl<T> Clone for DecodedSink<T> {
    fn clone(&self) -> Self {
        match self {
            DecodedSink::Pixels(pool) => DecodedSink::Pixels(pool.clone()),
            DecodedSink::Compressed(pool) => DecodedSink::Compressed(pool.clone()),
        }
    }
}

macro_rules! on_pool {
    ($sink:expr, $pool:ident => $body:expr) => {
        match $sink {
            DecodedSink::Pixels($pool) => $body,
            DecodedSink::Compressed($pool) => $body,
        }
    };
}

impl<T: Pixel> DecodedSink<T> {
    pub fn is_full(&self) -> bool {
        on_pool!(self, pool => pool.is_full())
    }

    pub fn stored_images(&self) -> usize {
        on_pool!(self, pool => pool.stored_images())
    }

    pub fn free_slots(&self) -> usize {
        on_pool!(self, pool => pool.free_slots())
    }

    pub fn total_received_frames(&self) -> u64 {
        on_pool!(self, pool => pool.total_received_frames())
    }

    pub fn set_first_frame_no(&self, frame_no: i64) {
        on_pool!(self, pool => pool.set_first_frame_no(frame_no))
    }

    pub fn reset(&self) {
        on_pool!(self, pool => pool.reset())
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, DecodedSink::Compressed(_))
    }
}

/// Output settings shared by the decode tasks of one receiver
///
/// Tasks take a snapshot when they are started, so changes apply from the
/// next acquisition on.
pub struct OutputSettings<T> {
    pub sink: DecodedSink<T>,
    pub distortion: Option<Arc<DistortionTables>>,
    pub compression: Option<CompressionSettings>,
    pub live: Arc<LiveView<T>>,
}

impl<T> Clone for OutputSettings<T> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            distortion: self.distortion.clone(),
            compression: self.compression,
            live: self.live.clone(),
        }
    }
}

pub type SharedOutputSettings<T> = Arc<RwLock<OutputSettings<T>>>;

/// Numbering origin of the decoded pool, fixed once per acquisition
///
/// The first decode task to get a frame sets it; the others must not move
/// the pool's head once frames were written.
#[derive(Debug, Default)]
pub struct FrameOrigin {
    origin: Mutex<Option<i64>>,
}

impl FrameOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        *self.origin.lock() = None;
    }

    pub fn get(&self) -> Option<i64> {
        *self.origin.lock()
    }

    fn fix<T: Pixel>(&self, sink: &DecodedSink<T>, origin: i64) {
        let mut current = self.origin.lock();
        if current.is_none() {
            sink.set_first_frame_no(origin);
            *current = Some(origin);
            debug!("Decoded frames numbered from {}", origin);
        }
    }
}

/// Per-task instance of the output settings
struct OutputStage<T: Pixel> {
    sink: DecodedSink<T>,
    corrector: Option<DistortionCorrector<T>>,
    codec: Option<(Box<dyn Codec>, u32)>,
    compressed: Vec<u8>,
    live: Arc<LiveView<T>>,
}

impl<T: Pixel> OutputStage<T> {
    fn new(settings: &OutputSettings<T>) -> Result<Self, CodecError> {
        let codec = match &settings.compression {
            Some(c) => Some((c.method.codec()?, c.level)),
            None => None,
        };
        Ok(Self {
            sink: settings.sink.clone(),
            corrector: settings.distortion.clone().map(DistortionCorrector::new),
            codec,
            compressed: Vec::new(),
            live: settings.live.clone(),
        })
    }

    /// Correct, compress and store one image, retrying while the pool
    /// has no room for it
    fn deliver(&mut self, image: &[T], frame_no: i64, error_code: i32, control: &TaskControl) -> bool {
        let Self {
            sink,
            corrector,
            codec,
            compressed,
            live,
        } = self;

        let image = match corrector.as_mut().map(|c| c.correct(image)) {
            None => image,
            Some(Ok(corrected)) => corrected,
            Some(Err(e)) => {
                warn!("Frame {}: distortion correction failed: {}", frame_no, e);
                return Self::store(sink, &[], &[], frame_no, FRAME_INCOMPLETE, control);
            }
        };

        let mut error_code = error_code;
        if let Some((codec, level)) = codec {
            if let Err(e) = codec.compress(bytemuck::cast_slice(image), *level, compressed) {
                warn!("Frame {}: {} compression failed: {}", frame_no, codec.name(), e);
                compressed.clear();
                error_code = FRAME_INCOMPLETE;
            }
        }

        let stored = Self::store(sink, image, compressed, frame_no, error_code, control);
        if stored {
            live.offer(frame_no, error_code, image);
        }
        stored
    }

    fn store(
        sink: &DecodedSink<T>,
        image: &[T],
        compressed: &[u8],
        frame_no: i64,
        error_code: i32,
        control: &TaskControl,
    ) -> bool {
        match sink {
            DecodedSink::Pixels(pool) => {
                control.retry_until(WRITE_RETRY_SLEEP, || pool.set_image_at(image, frame_no, error_code, 0))
            }
            DecodedSink::Compressed(pool) => {
                let (payload, error_code) = if compressed.len() > pool.element_size() {
                    warn!(
                        "Frame {}: {} compressed bytes exceed the slot size {}",
                        frame_no,
                        compressed.len(),
                        pool.element_size()
                    );
                    (&[][..], FRAME_INCOMPLETE)
                } else {
                    (compressed, error_code)
                };
                control.retry_until(WRITE_RETRY_SLEEP, || pool.set_image_at(payload, frame_no, error_code, 0))
            }
        }
    }
}

/// State shared by both decode task flavours
struct DecodeCore<T: Pixel> {
    name: String,
    raw: SharedFramePool<u8>,
    decoder: ImageDecoder,
    settings: SharedOutputSettings<T>,
    origin: Arc<FrameOrigin>,
    stage: Option<OutputStage<T>>,
    origin_fixed: bool,
    delivered: u64,
}

impl<T: Pixel> DecodeCore<T> {
    fn new(
        name: String,
        raw: SharedFramePool<u8>,
        decoder: ImageDecoder,
        settings: SharedOutputSettings<T>,
        origin: Arc<FrameOrigin>,
    ) -> Self {
        Self {
            name,
            raw,
            decoder,
            settings,
            origin,
            stage: None,
            origin_fixed: false,
            delivered: 0,
        }
    }

    fn start(&mut self) {
        self.origin_fixed = false;
        self.delivered = 0;
        self.stage = match OutputStage::new(&self.settings.read()) {
            Ok(stage) => Some(stage),
            Err(e) => {
                warn!("{}: output stage unavailable: {}", self.name, e);
                None
            }
        };
    }

    /// Output pool can take a frame and a stage exists
    fn ready(&self) -> bool {
        self.stage.as_ref().is_some_and(|stage| !stage.sink.is_full())
    }

    fn fix_origin(&mut self, fallback: i64) -> i64 {
        let origin = self.raw.first_frame_no().unwrap_or(fallback);
        if !self.origin_fixed {
            if let Some(stage) = &self.stage {
                self.origin.fix(&stage.sink, origin);
            }
            self.origin_fixed = true;
        }
        origin
    }

    fn exit(&self) {
        let stats = self.decoder.stats();
        debug!(
            "{} exits: {} images delivered, {} frames and {} pairs decoded",
            self.name, self.delivered, stats.frames_decoded, stats.pairs_decoded
        );
    }
}

/// First non-zero error code of a raw frame pair
fn pair_error(low: &FrameInfo, high: &FrameInfo) -> i32 {
    if low.error_code != FRAME_COMPLETE {
        low.error_code
    } else {
        high.error_code
    }
}

/// Decodes 12-bit frames, one raw frame per image
pub struct DecodeTask12 {
    core: DecodeCore<i16>,
}

impl DecodeTask12 {
    pub fn new(
        id: usize,
        raw: SharedFramePool<u8>,
        decoder: ImageDecoder,
        settings: SharedOutputSettings<i16>,
        origin: Arc<FrameOrigin>,
    ) -> Self {
        Self {
            core: DecodeCore::new(format!("decode-12-{}", id), raw, decoder, settings, origin),
        }
    }
}

impl Task for DecodeTask12 {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    fn on_start(&mut self) {
        self.core.start();
    }

    fn step(&mut self, control: &TaskControl) -> Step {
        if !self.core.ready() {
            return Step::Idle;
        }
        let Some(info) = self.core.raw.get_image() else {
            return Step::Idle;
        };
        self.core.fix_origin(info.frame_no);

        let core = &mut self.core;
        let Some(stage) = core.stage.as_mut() else {
            return Step::Idle;
        };
        let raw = core.raw.read(&info.handle);
        let decoded = match raw.as_deref() {
            Some(raw) => match core.decoder.decode_12(raw) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!("{}: frame {} not decoded: {}", core.name, info.frame_no, e);
                    None
                }
            },
            None => {
                warn!("{}: frame {} overwritten before decoding", core.name, info.frame_no);
                None
            }
        };

        drop(raw);

        let stored = match decoded {
            Some(image) => stage.deliver(image, info.frame_no, info.error_code, control),
            None => OutputStage::store(&stage.sink, &[], &[], info.frame_no, FRAME_INCOMPLETE, control),
        };
        if stored {
            core.delivered += 1;
        }
        Step::Busy
    }

    fn on_exit(&mut self) {
        self.core.exit();
    }
}

/// Decodes 24-bit images from pairs of raw frames
///
/// The low counter frame comes first. Pairs start at an even distance from
/// the acquisition's first raw frame; image `k` is numbered
/// `first + k`.
pub struct DecodeTask24 {
    core: DecodeCore<i32>,
}

impl DecodeTask24 {
    pub fn new(
        id: usize,
        raw: SharedFramePool<u8>,
        decoder: ImageDecoder,
        settings: SharedOutputSettings<i32>,
        origin: Arc<FrameOrigin>,
    ) -> Self {
        Self {
            core: DecodeCore::new(format!("decode-24-{}", id), raw, decoder, settings, origin),
        }
    }
}

impl Task for DecodeTask24 {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    fn on_start(&mut self) {
        self.core.start();
    }

    fn step(&mut self, control: &TaskControl) -> Step {
        if !self.core.ready() {
            return Step::Idle;
        }
        let Some((low, high)) = self.core.raw.get_2_images() else {
            return Step::Idle;
        };
        let first = self.core.fix_origin(low.frame_no);
        let frame_no = first + (low.frame_no - first) / 2;
        let error_code = pair_error(&low, &high);

        let core = &mut self.core;
        let Some(stage) = core.stage.as_mut() else {
            return Step::Idle;
        };
        let low_data = core.raw.read(&low.handle);
        let high_data = core.raw.read(&high.handle);
        let decoded = match (low_data.as_deref(), high_data.as_deref()) {
            (Some(l), Some(h)) => match core.decoder.decode_24(l, h) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!("{}: pair {} not decoded: {}", core.name, low.frame_no, e);
                    None
                }
            },
            _ => {
                warn!("{}: pair {} overwritten before decoding", core.name, low.frame_no);
                None
            }
        };

        drop((low_data, high_data));

        let stored = match decoded {
            Some(image) => stage.deliver(image, frame_no, error_code, control),
            None => OutputStage::store(&stage.sink, &[], &[], frame_no, FRAME_INCOMPLETE, control),
        };
        if stored {
            core.delivered += 1;
        }
        Step::Busy
    }

    fn on_exit(&mut self) {
        self.core.exit();
    }
}
