//! Raw frame decoder
//!
//! Undoes the readout format of the chips:
//!
//! 1. **reorder**: the raw stream cycles through the chips in 32-byte
//!    blocks; blocks are gathered into one contiguous region per chip
//! 2. **reshuffle**: each chip row is 12 bit planes of 32 bytes, most
//!    significant plane first; bit `k` of byte `q` belongs to pixel `8q + k`
//! 3. **mosaic**: chip blocks are placed into the image, rotated chips
//!    walked backwards
//! 4. **counter decode**: counter codes are mapped to counts
//!
//! All scratch memory belongs to the decoder, so decoding a frame does not
//! allocate.

use super::geometry::ChipGeometry;
use super::lfsr::CounterTables;
use crate::constants::{BLOCK_BYTES, CHIP_BYTES, CHIP_ROW_BYTES, CHIP_SIZE, COUNTER_BITS};
use crate::error::DecodeError;

const CHIP_PIXELS: usize = CHIP_SIZE * CHIP_SIZE;
const PLANE_BYTES: usize = CHIP_SIZE / 8;
/// Four pixels per 64-bit word
const ROW_WORDS: usize = CHIP_SIZE / 4;

/// Nibble to four 16-bit lanes: lane `m` holds bit `m` of the nibble
pub(crate) const fn nibble_lut() -> [u64; 16] {
    let mut lut = [0u64; 16];
    let mut n = 0;
    while n < 16 {
        let mut m = 0;
        while m < 4 {
            lut[n] |= (((n >> m) & 1) as u64) << (16 * m);
            m += 1;
        }
        n += 1;
    }
    lut
}

const NIBBLE_LUT: [u64; 16] = nibble_lut();

/// Gather the interleaved 32-byte blocks into per-chip regions
pub(crate) fn reorder(raw: &[u8], chips: usize, out: &mut [u8]) {
    for (block, bytes) in raw.chunks_exact(BLOCK_BYTES).enumerate() {
        let (chip, part) = (block % chips, block / chips);
        let start = chip * CHIP_BYTES + part * BLOCK_BYTES;
        out[start..start + BLOCK_BYTES].copy_from_slice(bytes);
    }
}

/// Turn the bit planes of one chip into per-pixel counter codes
pub(crate) fn reshuffle(chip: &[u8], out: &mut [u16]) {
    for (row_bytes, row_out) in chip.chunks_exact(CHIP_ROW_BYTES).zip(out.chunks_exact_mut(CHIP_SIZE)) {
        let mut words = [0u64; ROW_WORDS];

        // Realign to the row start for every plane
        for (plane, plane_bytes) in row_bytes.chunks_exact(PLANE_BYTES).enumerate() {
            let shift = COUNTER_BITS - 1 - plane;
            for (q, &byte) in plane_bytes.iter().enumerate() {
                words[2 * q] |= NIBBLE_LUT[(byte & 0x0F) as usize] << shift;
                words[2 * q + 1] |= NIBBLE_LUT[(byte >> 4) as usize] << shift;
            }
        }

        for (word, pixels) in words.iter().zip(row_out.chunks_exact_mut(4)) {
            for (lane, pixel) in pixels.iter_mut().enumerate() {
                *pixel = (word >> (16 * lane)) as u16;
            }
        }
    }
}

/// Place decoded counts of every chip into the image through `put`
pub(crate) fn mosaic<F: FnMut(usize, u16)>(
    geometry: &ChipGeometry,
    codes: &[u16],
    tables: &CounterTables,
    mut put: F,
) {
    let width = geometry.width();
    for (placement, chip) in geometry.chips().iter().zip(codes.chunks_exact(CHIP_PIXELS)) {
        for (row, row_codes) in chip.chunks_exact(CHIP_SIZE).enumerate() {
            let (x0, y) = placement.image_xy(row, 0);
            let base = y * width + x0;
            if placement.rotated {
                for (col, &code) in row_codes.iter().enumerate() {
                    put(base - col, tables.decode(code));
                }
            } else {
                for (col, &code) in row_codes.iter().enumerate() {
                    put(base + col, tables.decode(code));
                }
            }
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub pairs_decoded: u64,
}

/// Converts raw frames of a fixed chip set into images
pub struct ImageDecoder {
    geometry: ChipGeometry,
    tables: CounterTables,
    /// Per-chip raw bytes after reorder
    reordered: Vec<u8>,
    /// Per-chip counter codes after reshuffle
    codes: Vec<u16>,
    image12: Vec<i16>,
    image24: Vec<i32>,
    stats: DecoderStats,
}

impl ImageDecoder {
    pub fn new(geometry: ChipGeometry) -> Self {
        let chips = geometry.chip_count();
        let pixels = geometry.pixel_count();
        Self {
            tables: CounterTables::new(),
            reordered: vec![0u8; chips * CHIP_BYTES],
            codes: vec![0u16; chips * CHIP_PIXELS],
            image12: vec![0i16; pixels],
            image24: vec![0i32; pixels],
            stats: DecoderStats::default(),
            geometry,
        }
    }

    /// Decoder for an ordered list of chip ids
    pub fn for_chips(chip_ids: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self::new(ChipGeometry::new(chip_ids)?))
    }

    pub fn geometry(&self) -> &ChipGeometry {
        &self.geometry
    }

    /// Width and height of decoded images, before distortion correction
    pub fn decoded_image_size(&self) -> (usize, usize) {
        (self.geometry.width(), self.geometry.height())
    }

    pub fn raw_frame_bytes(&self) -> usize {
        self.geometry.raw_frame_bytes()
    }

    fn check_frame(&self, raw: &[u8]) -> Result<(), DecodeError> {
        let expected = self.raw_frame_bytes();
        if raw.len() != expected {
            return Err(DecodeError::FrameSize {
                expected,
                actual: raw.len(),
            });
        }
        Ok(())
    }

    /// Reorder and reshuffle into `self.codes`
    fn unpack(&mut self, raw: &[u8]) {
        reorder(raw, self.geometry.chip_count(), &mut self.reordered);
        for (chip, codes) in self
            .reordered
            .chunks_exact(CHIP_BYTES)
            .zip(self.codes.chunks_exact_mut(CHIP_PIXELS))
        {
            reshuffle(chip, codes);
        }
    }

    /// Decode one 12-bit frame
    pub fn decode_12(&mut self, raw: &[u8]) -> Result<&[i16], DecodeError> {
        self.check_frame(raw)?;
        self.unpack(raw);

        let image = &mut self.image12;
        mosaic(&self.geometry, &self.codes, &self.tables, |i, count| image[i] = count as i16);

        self.stats.frames_decoded += 1;
        Ok(&self.image12)
    }

    /// Decode the low and high counter frames of a 24-bit exposure
    pub fn decode_24(&mut self, low: &[u8], high: &[u8]) -> Result<&[i32], DecodeError> {
        self.check_frame(low)?;
        self.check_frame(high)?;

        self.unpack(low);
        let image = &mut self.image24;
        mosaic(&self.geometry, &self.codes, &self.tables, |i, count| image[i] = count as i32);

        self.unpack(high);
        let image = &mut self.image24;
        mosaic(&self.geometry, &self.codes, &self.tables, |i, count| {
            image[i] += (count as i32) << COUNTER_BITS
        });

        self.stats.pairs_decoded += 1;
        Ok(&self.image24)
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::lfsr::next_state;

    /// Raw frame built bit by bit, independent of the encoder
    fn reference_frame(chip_ids: &[u8], count: impl Fn(u8, usize, usize) -> u16) -> Vec<u8> {
        let mut codes = vec![0u16; 4096];
        let mut state = 0;
        for code in codes.iter_mut() {
            *code = state;
            state = next_state(state);
        }

        let n = chip_ids.len();
        let mut raw = vec![0u8; n * CHIP_BYTES];
        for (c, &chip) in chip_ids.iter().enumerate() {
            for row in 0..CHIP_SIZE {
                for col in 0..CHIP_SIZE {
                    let code = codes[count(chip, row, col) as usize];
                    for plane in 0..12 {
                        if (code >> (11 - plane)) & 1 == 0 {
                            continue;
                        }
                        let offset = row * CHIP_ROW_BYTES + plane * 32 + col / 8;
                        let block = (offset / 32) * n + c;
                        raw[block * 32 + offset % 32] |= 1 << (col % 8);
                    }
                }
            }
        }
        raw
    }

    fn pattern(chip: u8, row: usize, col: usize) -> u16 {
        ((chip as usize * 331 + row * 17 + col * 5) % 4096) as u16
    }

    #[test]
    fn test_nibble_lut() {
        assert_eq!(NIBBLE_LUT[0], 0);
        assert_eq!(NIBBLE_LUT[1], 1);
        assert_eq!(NIBBLE_LUT[0b1010], (1 << 16) | (1 << 48));
        assert_eq!(NIBBLE_LUT[15], 0x0001_0001_0001_0001);
    }

    #[test]
    fn test_full_module_matches_reference() {
        let ids: Vec<u8> = (1..=12).collect();
        let raw = reference_frame(&ids, pattern);
        let mut decoder = ImageDecoder::for_chips(&ids).unwrap();
        assert_eq!(decoder.decoded_image_size(), (1536, 512));
        let image = decoder.decode_12(&raw).unwrap();

        for y in 0..512 {
            for x in 0..1536 {
                // top row chips 1..=6 upright, bottom row chips 12..=7 rotated
                let (chip, row, col) = if y < 256 {
                    ((x / 256 + 1) as u8, y, x % 256)
                } else {
                    ((12 - x / 256) as u8, 511 - y, 255 - x % 256)
                };
                assert_eq!(image[y * 1536 + x], pattern(chip, row, col) as i16, "pixel ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_stream_order_follows_configuration() {
        let raw = reference_frame(&[3, 1], pattern);
        let mut decoder = ImageDecoder::for_chips(&[3, 1]).unwrap();
        assert_eq!(decoder.decoded_image_size(), (768, 256));
        let image = decoder.decode_12(&raw).unwrap();
        assert_eq!(image[0], pattern(1, 0, 0) as i16);
        assert_eq!(image[512 + 7], pattern(3, 0, 7) as i16);
        // chip 2 is not configured
        assert_eq!(image[255 * 768 + 300], 0);
    }

    #[test]
    fn test_24_bit_combines_counters() {
        let ids = [1u8];
        let low = reference_frame(&ids, |_, row, col| ((row + col) % 4096) as u16);
        let high = reference_frame(&ids, |_, row, _| row as u16);
        let mut decoder = ImageDecoder::for_chips(&ids).unwrap();
        let image = decoder.decode_24(&low, &high).unwrap();
        assert_eq!(image[3 * 256 + 4], 7 + (3 << 12));
        assert_eq!(image[255 * 256 + 255], 510 + (255 << 12));
        assert_eq!(decoder.stats().pairs_decoded, 1);
    }

    #[test]
    fn test_wrong_frame_size() {
        let mut decoder = ImageDecoder::for_chips(&[1]).unwrap();
        assert_eq!(
            decoder.decode_12(&[0u8; 10]).unwrap_err(),
            DecodeError::FrameSize {
                expected: CHIP_BYTES,
                actual: 10
            }
        );
    }
}
