//! Raw frame codec
//!
//! Decoding of the chips' bit-packed readout into images, the matching
//! encoder, and compression of decoded images.

pub mod compression;
pub mod decoder;
pub mod encoder;
pub mod geometry;
pub mod lfsr;

pub use compression::{Codec, CompressionMethod, Lz4Codec};
#[cfg(feature = "zstd")]
pub use compression::ZstdCodec;
pub use decoder::{DecoderStats, ImageDecoder};
pub use encoder::ImageEncoder;
pub use geometry::{ChipGeometry, ChipPlacement};
pub use lfsr::CounterTables;
