//! Chip placement on the sensor module
//!
//! The full module is two rows of six chips. The top row (chips 1-6) reads
//! left to right; the bottom row (chips 7-12) is mounted upside down, so
//! those chips are rotated by 180° and chip 7 sits on the right.
//!
//! ```text
//!  x:  0     256   512   768   1024  1280
//!     ┌─────┬─────┬─────┬─────┬─────┬─────┐
//!     │  1  │  2  │  3  │  4  │  5  │  6  │  y = 0
//!     ├─────┼─────┼─────┼─────┼─────┼─────┤
//!     │ 12  │ 11  │ 10  │  9  │  8  │  7  │  y = 256, rotated
//!     └─────┴─────┴─────┴─────┴─────┴─────┘
//! ```

use crate::constants::{CHIP_BYTES, CHIP_SIZE, MAX_CHIPS};
use crate::error::DecodeError;

const CHIPS_PER_ROW: usize = MAX_CHIPS / 2;

/// Where one chip lands in the decoded image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipPlacement {
    pub chip: u8,
    pub x: usize,
    pub y: usize,
    pub rotated: bool,
}

impl ChipPlacement {
    /// Position of `chip` on the full module
    pub fn standard(chip: u8) -> Result<Self, DecodeError> {
        let n = chip as usize;
        match n {
            1..=CHIPS_PER_ROW => Ok(Self {
                chip,
                x: (n - 1) * CHIP_SIZE,
                y: 0,
                rotated: false,
            }),
            7..=MAX_CHIPS => Ok(Self {
                chip,
                x: (MAX_CHIPS - n) * CHIP_SIZE,
                y: CHIP_SIZE,
                rotated: true,
            }),
            _ => Err(DecodeError::InvalidChip(chip)),
        }
    }

    /// Image coordinates of the chip-local pixel (`row`, `col`)
    #[inline]
    pub fn image_xy(&self, row: usize, col: usize) -> (usize, usize) {
        if self.rotated {
            (self.x + CHIP_SIZE - 1 - col, self.y + CHIP_SIZE - 1 - row)
        } else {
            (self.x + col, self.y + row)
        }
    }
}

/// Placement of the configured chips
///
/// Chips are kept in raw stream order. The image is the bounding box of the
/// configured chips, so a single bottom-row chip still yields a 256x256
/// image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipGeometry {
    chips: Vec<ChipPlacement>,
    width: usize,
    height: usize,
}

impl ChipGeometry {
    pub fn new(chip_ids: &[u8]) -> Result<Self, DecodeError> {
        if chip_ids.is_empty() {
            return Err(DecodeError::NoChips);
        }

        let mut chips = Vec::with_capacity(chip_ids.len());
        for &id in chip_ids {
            if chips.iter().any(|c: &ChipPlacement| c.chip == id) {
                return Err(DecodeError::DuplicateChip(id));
            }
            chips.push(ChipPlacement::standard(id)?);
        }

        Ok(Self::from_placements(chips))
    }

    /// All twelve chips in id order
    pub fn full_module() -> Self {
        let chips = (1..=MAX_CHIPS as u8)
            .filter_map(|id| ChipPlacement::standard(id).ok())
            .collect();
        Self::from_placements(chips)
    }

    fn from_placements(mut chips: Vec<ChipPlacement>) -> Self {
        // Shift to the bounding box of the configured chips
        let min_x = chips.iter().map(|c| c.x).min().unwrap_or(0);
        let min_y = chips.iter().map(|c| c.y).min().unwrap_or(0);
        for chip in &mut chips {
            chip.x -= min_x;
            chip.y -= min_y;
        }
        let width = chips.iter().map(|c| c.x).max().unwrap_or(0) + CHIP_SIZE;
        let height = chips.iter().map(|c| c.y).max().unwrap_or(0) + CHIP_SIZE;
        Self { chips, width, height }
    }

    pub fn chips(&self) -> &[ChipPlacement] {
        &self.chips
    }

    pub fn chip_count(&self) -> usize {
        self.chips.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Bytes of one raw frame
    pub fn raw_frame_bytes(&self) -> usize {
        self.chips.len() * CHIP_BYTES
    }

    /// Chip covering image pixel (`x`, `y`), if any
    pub fn chip_at(&self, x: usize, y: usize) -> Option<&ChipPlacement> {
        self.chips
            .iter()
            .find(|c| (c.x..c.x + CHIP_SIZE).contains(&x) && (c.y..c.y + CHIP_SIZE).contains(&y))
    }
}
