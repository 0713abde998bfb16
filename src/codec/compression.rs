//! Compression of decoded images
//!
//! Levels run from 0 (fastest) to 9 (smallest) for every codec; a codec
//! without tunable levels still validates the argument.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Highest accepted compression level
pub const MAX_LEVEL: u32 = 9;

/// Available compression codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// zstd frames; needs the `zstd` feature
    Zstd,
    /// LZ4 block with the uncompressed size prepended
    Lz4,
}

impl CompressionMethod {
    /// Instantiate the codec, if this build has it
    pub fn codec(&self) -> Result<Box<dyn Codec>, CodecError> {
        match self {
            #[cfg(feature = "zstd")]
            CompressionMethod::Zstd => Ok(Box::new(ZstdCodec)),
            #[cfg(not(feature = "zstd"))]
            CompressionMethod::Zstd => Err(CodecError::Unavailable("zstd")),
            CompressionMethod::Lz4 => Ok(Box::new(Lz4Codec)),
        }
    }
}

/// Byte-oriented compression codec
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replace `dst` with the compressed form of `src`
    ///
    /// `dst` is left untouched on error.
    fn compress(&self, src: &[u8], level: u32, dst: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Replace `dst` with the decompressed form of `src`
    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<(), CodecError>;
}

fn check_level(level: u32) -> Result<(), CodecError> {
    if level > MAX_LEVEL {
        return Err(CodecError::InvalidLevel(level));
    }
    Ok(())
}

/// zstd codec; level `n` maps to zstd level `n + 1`
#[cfg(feature = "zstd")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdCodec;

#[cfg(feature = "zstd")]
impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, src: &[u8], level: u32, dst: &mut Vec<u8>) -> Result<(), CodecError> {
        check_level(level)?;
        let compressed =
            zstd::encode_all(src, level as i32 + 1).map_err(|e| CodecError::CompressFailed(e.to_string()))?;
        *dst = compressed;
        Ok(())
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<(), CodecError> {
        let decompressed = zstd::decode_all(src).map_err(|e| CodecError::DecompressFailed(e.to_string()))?;
        *dst = decompressed;
        Ok(())
    }
}

/// LZ4 block codec; the level is validated but has no effect
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, src: &[u8], level: u32, dst: &mut Vec<u8>) -> Result<(), CodecError> {
        check_level(level)?;
        *dst = lz4_flex::compress_prepend_size(src);
        Ok(())
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<(), CodecError> {
        let decompressed = lz4_flex::decompress_size_prepended(src)
            .map_err(|e| CodecError::DecompressFailed(format!("LZ4: {e}")))?;
        *dst = decompressed;
        Ok(())
    }
}
