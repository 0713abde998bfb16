//! Raw frame encoder
//!
//! Exact inverse of [`ImageDecoder`](super::ImageDecoder): produces the byte
//! stream a detector with the given chip set would send for an image. The
//! simulator streams its output and tests use it for round trips.

use super::geometry::ChipGeometry;
use super::lfsr::CounterTables;
use crate::constants::{BLOCK_BYTES, CHIP_BYTES, CHIP_ROW_BYTES, CHIP_SIZE, COUNTER_BITS, COUNTER_MAX};
use crate::error::DecodeError;

/// Converts images into raw frames
pub struct ImageEncoder {
    geometry: ChipGeometry,
    tables: CounterTables,
    /// Per-chip bit planes before interleaving
    planes: Vec<u8>,
}

impl ImageEncoder {
    pub fn new(geometry: ChipGeometry) -> Self {
        Self {
            planes: vec![0u8; geometry.chip_count() * CHIP_BYTES],
            tables: CounterTables::new(),
            geometry,
        }
    }

    pub fn for_chips(chip_ids: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::new(ChipGeometry::new(chip_ids)?))
    }

    pub fn geometry(&self) -> &ChipGeometry {
        &self.geometry
    }

    pub fn raw_frame_bytes(&self) -> usize {
        self.geometry.raw_frame_bytes()
    }

    fn check(&self, image_len: usize, out_len: usize) -> Result<(), DecodeError> {
        if image_len != self.geometry.pixel_count() {
            return Err(DecodeError::OutputSize {
                expected: self.geometry.pixel_count(),
                actual: image_len,
            });
        }
        if out_len != self.raw_frame_bytes() {
            return Err(DecodeError::FrameSize {
                expected: self.raw_frame_bytes(),
                actual: out_len,
            });
        }
        Ok(())
    }

    /// Encode a 12-bit image; counts above 4095 are truncated to 12 bits
    pub fn encode_into(&mut self, image: &[u16], out: &mut [u8]) -> Result<(), DecodeError> {
        self.check(image.len(), out.len())?;
        self.encode_with(|i| image[i], out);
        Ok(())
    }

    pub fn encode(&mut self, image: &[u16]) -> Result<Vec<u8>, DecodeError> {
        let mut out = vec![0u8; self.raw_frame_bytes()];
        self.encode_into(image, &mut out)?;
        Ok(out)
    }

    /// Encode a 24-bit image as its low and high counter frames
    pub fn encode_24(&mut self, image: &[u32]) -> Result<(Vec<u8>, Vec<u8>), DecodeError> {
        let mut low = vec![0u8; self.raw_frame_bytes()];
        let mut high = vec![0u8; self.raw_frame_bytes()];
        self.check(image.len(), low.len())?;
        self.encode_with(|i| (image[i] & COUNTER_MAX as u32) as u16, &mut low);
        self.encode_with(|i| ((image[i] >> COUNTER_BITS) & COUNTER_MAX as u32) as u16, &mut high);
        Ok((low, high))
    }

    fn encode_with<F: Fn(usize) -> u16>(&mut self, count_at: F, out: &mut [u8]) {
        let width = self.geometry.width();
        self.planes.fill(0);

        // Mosaic extraction and bit planes
        for (placement, chip) in self
            .geometry
            .chips()
            .iter()
            .zip(self.planes.chunks_exact_mut(CHIP_BYTES))
        {
            for (row, row_bytes) in chip.chunks_exact_mut(CHIP_ROW_BYTES).enumerate() {
                for col in 0..CHIP_SIZE {
                    let (x, y) = placement.image_xy(row, col);
                    let code = self.tables.encode(count_at(y * width + x));
                    let (byte, bit) = (col / 8, col % 8);
                    for plane in 0..COUNTER_BITS {
                        let value = (code >> (COUNTER_BITS - 1 - plane)) & 1;
                        row_bytes[plane * (CHIP_SIZE / 8) + byte] |= (value as u8) << bit;
                    }
                }
            }
        }

        // Interleave 32-byte blocks across chips
        let chips = self.geometry.chip_count();
        for (block, bytes) in out.chunks_exact_mut(BLOCK_BYTES).enumerate() {
            let start = (block % chips) * CHIP_BYTES + (block / chips) * BLOCK_BYTES;
            bytes.copy_from_slice(&self.planes[start..start + BLOCK_BYTES]);
        }
    }
}
