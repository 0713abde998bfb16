//! Error types for the acquisition core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Acquisition is running; stop it before reconfiguring")]
    Busy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport is not connected")]
    NotConnected,
}

/// Image decoding and geometry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid chip id {0}, expected 1..=12")]
    InvalidChip(u8),

    #[error("Chip {0} listed twice")]
    DuplicateChip(u8),

    #[error("No chips configured")]
    NoChips,

    #[error("Raw frame is {actual} bytes, expected {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("Output buffer holds {actual} pixels, expected {expected}")]
    OutputSize { expected: usize, actual: usize },

    #[error("Distortion table invalid: {0}")]
    DistortionTable(String),
}

/// Compression codec errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Compression level {0} outside 0..=9")]
    InvalidLevel(u32),

    #[error("Compression failed: {0}")]
    CompressFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressFailed(String),

    #[error("Codec {0} not available in this build")]
    Unavailable(&'static str),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
