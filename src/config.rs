//! Receiver configuration
//!
//! Loaded from a TOML file; every field has a default so a file only needs
//! the settings it changes:
//!
//! ```toml
//! [detector]
//! chips = [1, 2, 3, 4, 5, 6]
//! bit_depth = 24
//!
//! [network]
//! mode = "multi_link_udp"
//! links = ["0.0.0.0:8000", "0.0.0.0:8001"]
//!
//! [decoding]
//! decode_tasks = 4
//! compression = { method = "lz4", level = 1 }
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::CompressionMethod;
use crate::constants::*;
use crate::correction::DistortionMethod;
use crate::error::ConfigError;

/// How frames travel from the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Several UDP links deliver packets of the same frame stream
    MultiLinkUdp,
    /// One UDP stream, frames sent as consecutive datagrams
    SingleLinkUdp,
    /// One TCP stream, frames back to back
    SingleLinkTcp,
}

impl AcquisitionMode {
    pub fn is_single_link(&self) -> bool {
        !matches!(self, AcquisitionMode::MultiLinkUdp)
    }
}

/// Counter depth of the delivered images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BitDepth {
    /// One raw frame per image, 16-bit output
    Twelve,
    /// Two raw frames (low, high counter) per image, 32-bit output
    TwentyFour,
}

impl BitDepth {
    pub fn bits(&self) -> u32 {
        match self {
            BitDepth::Twelve => 12,
            BitDepth::TwentyFour => 24,
        }
    }

    /// Raw frames consumed per output image
    pub fn raw_frames_per_image(&self) -> u64 {
        match self {
            BitDepth::Twelve => 1,
            BitDepth::TwentyFour => 2,
        }
    }
}

impl TryFrom<u32> for BitDepth {
    type Error = String;

    fn try_from(bits: u32) -> std::result::Result<Self, Self::Error> {
        match bits {
            12 => Ok(BitDepth::Twelve),
            24 => Ok(BitDepth::TwentyFour),
            other => Err(format!("unsupported bit depth {}, expected 12 or 24", other)),
        }
    }
}

impl From<BitDepth> for u32 {
    fn from(depth: BitDepth) -> u32 {
        depth.bits()
    }
}

/// Detector layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Active chip ids (1..=12) in the order they appear in the raw stream
    pub chips: Vec<u8>,
    pub bit_depth: BitDepth,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            chips: (1..=MAX_CHIPS as u8).collect(),
            bit_depth: BitDepth::Twelve,
        }
    }
}

/// Data links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: AcquisitionMode,
    /// Local bind addresses for UDP, detector addresses for TCP
    pub links: Vec<SocketAddr>,
    /// Datagram size including the header
    pub packet_size: usize,
    pub receive_timeout_us: u64,
    /// Time a single-link frame may take to arrive completely
    pub frame_timeout_ms: u64,
    /// Requested kernel receive buffer per socket
    pub recv_buffer_bytes: usize,
}

impl NetworkConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_micros(self.receive_timeout_us)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::MultiLinkUdp,
            links: vec![SocketAddr::from(([0, 0, 0, 0], DEFAULT_UDP_PORT))],
            packet_size: DEFAULT_PACKET_SIZE,
            receive_timeout_us: RECEIVE_TIMEOUT.as_micros() as u64,
            frame_timeout_ms: FRAME_TIMEOUT.as_millis() as u64,
            recv_buffer_bytes: SOCKET_RECV_BUFFER,
        }
    }
}

/// Frame pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub raw_pool_size: usize,
    pub decoded_pool_size: usize,
    pub safety_margin: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            raw_pool_size: DEFAULT_RAW_POOL_SIZE,
            decoded_pool_size: DEFAULT_DECODED_POOL_SIZE,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }
}

/// Compression applied to decoded images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionSettings {
    pub method: CompressionMethod,
    #[serde(default = "default_compression_level")]
    pub level: u32,
}

fn default_compression_level() -> u32 {
    2
}

/// Decode pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingConfig {
    pub decode_tasks: usize,
    /// Worker threads; 0 runs every task on its own thread
    pub worker_threads: usize,
    /// Live view refresh rate; 0 disables it
    pub live_view_fps: f64,
    /// Hold decoders back while frames are still arriving
    pub throttle_reception: bool,
    pub compression: Option<CompressionSettings>,
    pub distortion: Option<DistortionMethod>,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            decode_tasks: 2,
            worker_threads: 0,
            live_view_fps: DEFAULT_LIVE_VIEW_FPS,
            throttle_reception: false,
            compression: None,
            distortion: None,
        }
    }
}

/// Complete receiver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub detector: DetectorConfig,
    pub network: NetworkConfig,
    pub buffers: BufferConfig,
    pub decoding: DecodingConfig,
}

impl ReceiverConfig {
    /// Read and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: ReceiverConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Per-user configuration file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "pixel-detector", "pixel-acquisition")
            .map(|dirs| dirs.config_dir().join("receiver.toml"))
    }

    /// Tasks the scheduler has to run concurrently
    pub fn task_count(&self) -> usize {
        let receivers = match self.network.mode {
            AcquisitionMode::MultiLinkUdp => self.network.links.len() + 1,
            _ => 1,
        };
        receivers + self.decoding.decode_tasks
    }

    pub fn worker_threads(&self) -> usize {
        match self.decoding.worker_threads {
            0 => self.task_count(),
            n => n,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.detector.chips.is_empty() {
            return invalid("detector.chips is empty".into());
        }
        let mut seen = HashSet::new();
        for &chip in &self.detector.chips {
            if chip == 0 || chip as usize > MAX_CHIPS {
                return invalid(format!("chip id {} outside 1..={}", chip, MAX_CHIPS));
            }
            if !seen.insert(chip) {
                return invalid(format!("chip id {} listed twice", chip));
            }
        }

        if self.network.links.is_empty() {
            return invalid("network.links is empty".into());
        }
        if self.network.mode.is_single_link() && self.network.links.len() != 1 {
            return invalid(format!(
                "{:?} takes exactly one link, got {}",
                self.network.mode,
                self.network.links.len()
            ));
        }
        if self.network.packet_size <= HEADER_SIZE {
            return invalid(format!(
                "packet_size {} must exceed the {} byte header",
                self.network.packet_size, HEADER_SIZE
            ));
        }
        if self.network.packet_size > u16::MAX as usize {
            return invalid(format!("packet_size {} exceeds a UDP datagram", self.network.packet_size));
        }
        if self.network.receive_timeout_us == 0 {
            return invalid("receive_timeout_us must be greater than 0".into());
        }

        let margin = self.buffers.safety_margin;
        if margin >= self.buffers.raw_pool_size || margin >= self.buffers.decoded_pool_size {
            return invalid(format!("safety_margin {} leaves no usable slots", margin));
        }
        if self.detector.bit_depth == BitDepth::TwentyFour && self.buffers.raw_pool_size - margin < 2 {
            return invalid("24-bit mode needs at least two usable raw slots".into());
        }

        if self.decoding.decode_tasks == 0 {
            return invalid("decode_tasks must be at least 1".into());
        }
        if !self.decoding.live_view_fps.is_finite() || self.decoding.live_view_fps < 0.0 {
            return invalid(format!("live_view_fps {} is not a rate", self.decoding.live_view_fps));
        }
        if let Some(compression) = &self.decoding.compression {
            if compression.level > 9 {
                return invalid(format!("compression level {} outside 0..=9", compression.level));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReceiverConfig::default();
        config.validate().unwrap();
        assert_eq!(config.detector.chips.len(), 12);
        assert_eq!(config.task_count(), 2 + 2);
        assert_eq!(config.worker_threads(), 4);
    }

    #[test]
    fn test_partial_file() {
        let config = ReceiverConfig::from_toml(
            r#"
            [detector]
            chips = [1, 2, 3]
            bit_depth = 24

            [network]
            mode = "single_link_tcp"
            links = ["10.0.0.2:8010"]

            [decoding]
            decode_tasks = 3
            compression = { method = "lz4" }
            distortion = "divide"
            "#,
        )
        .unwrap();

        assert_eq!(config.detector.bit_depth, BitDepth::TwentyFour);
        assert_eq!(config.network.mode, AcquisitionMode::SingleLinkTcp);
        assert_eq!(config.network.packet_size, DEFAULT_PACKET_SIZE);
        assert_eq!(
            config.decoding.compression,
            Some(CompressionSettings {
                method: CompressionMethod::Lz4,
                level: 2
            })
        );
        assert_eq!(config.decoding.distortion, Some(DistortionMethod::Divide));
        assert_eq!(config.task_count(), 4);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = ReceiverConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(ReceiverConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad = [
            "[detector]\nchips = []",
            "[detector]\nchips = [0]",
            "[detector]\nchips = [1, 1]",
            "[detector]\nbit_depth = 16",
            "[network]\npacket_size = 6",
            "[network]\nmode = \"single_link_udp\"\nlinks = [\"0.0.0.0:1\", \"0.0.0.0:2\"]",
            "[buffers]\nraw_pool_size = 8\nsafety_margin = 8",
            "[decoding]\ndecode_tasks = 0",
            "[decoding]\ncompression = { method = \"lz4\", level = 10 }",
        ];
        for text in bad {
            assert!(ReceiverConfig::from_toml(text).is_err(), "accepted: {}", text);
        }
    }

    #[test]
    fn test_missing_file() {
        let err = ReceiverConfig::load("/nonexistent/receiver.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
