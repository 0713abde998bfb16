//! Distortion correction tables
//!
//! Chip edge pixels facing a neighbouring chip are three times as wide as
//! the others, so an undistorted image needs two extra pixels per edge
//! pixel. The tables map every corrected pixel to a source pixel plus a
//! nominator:
//!
//! - `nominator <= 0`: the pixel is blank and set to the nominator
//! - `nominator == 1`: copy the source pixel
//! - `nominator > 1`: divide the source pixel by the nominator

use serde::{Deserialize, Serialize};

use crate::codec::ChipGeometry;
use crate::constants::CHIP_SIZE;
use crate::error::DecodeError;

/// Extra pixels a wide edge pixel expands into
const EDGE_SPAN: usize = 3;

/// How a wide pixel's count is spread over the pixels it covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistortionMethod {
    /// Every covered pixel gets the count divided by the span
    Divide,
    /// Every covered pixel repeats the count
    Copy,
}

/// Validated index and nominator tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistortionTables {
    index: Vec<u32>,
    nominator: Vec<i32>,
    width: usize,
    height: usize,
    source_len: usize,
}

impl DistortionTables {
    /// Tables supplied by the caller for a `width` x `height` output built
    /// from images of `source_len` pixels
    pub fn new(
        index: Vec<u32>,
        nominator: Vec<i32>,
        width: usize,
        height: usize,
        source_len: usize,
    ) -> Result<Self, DecodeError> {
        let pixels = width * height;
        if index.len() != pixels || nominator.len() != pixels {
            return Err(DecodeError::DistortionTable(format!(
                "{} index and {} nominator entries for a {}x{} image",
                index.len(),
                nominator.len(),
                width,
                height
            )));
        }
        if let Some(j) = index
            .iter()
            .zip(&nominator)
            .position(|(&i, &n)| n > 0 && i as usize >= source_len)
        {
            return Err(DecodeError::DistortionTable(format!(
                "entry {} reads pixel {} of a {} pixel image",
                j, index[j], source_len
            )));
        }

        Ok(Self {
            index,
            nominator,
            width,
            height,
            source_len,
        })
    }

    /// Tables for the standard module layout of `geometry`
    pub fn standard(geometry: &ChipGeometry, method: DistortionMethod) -> Self {
        let (src_x, span_x) = expand_axis(geometry.width());
        let (src_y, span_y) = expand_axis(geometry.height());
        let (width, height) = (src_x.len(), src_y.len());

        let mut index = Vec::with_capacity(width * height);
        let mut nominator = Vec::with_capacity(width * height);
        for (&sy, &hy) in src_y.iter().zip(&span_y) {
            for (&sx, &hx) in src_x.iter().zip(&span_x) {
                index.push((sy * geometry.width() + sx) as u32);
                let value = match (geometry.chip_at(sx, sy), method) {
                    (None, _) => 0,
                    (Some(_), DistortionMethod::Copy) => 1,
                    (Some(_), DistortionMethod::Divide) => (hx * hy) as i32,
                };
                nominator.push(value);
            }
        }

        Self {
            index,
            nominator,
            width,
            height,
            source_len: geometry.pixel_count(),
        }
    }

    pub fn index(&self) -> &[u32] {
        &self.index
    }

    pub fn nominator(&self) -> &[i32] {
        &self.nominator
    }

    /// Corrected image dimensions
    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.index.len()
    }

    /// Pixels of the images the tables apply to
    pub fn source_len(&self) -> usize {
        self.source_len
    }
}

/// Whether source coordinate `c` on an axis of `len` pixels is a wide edge
fn is_wide(c: usize, len: usize) -> bool {
    let offset = c % CHIP_SIZE;
    (offset == CHIP_SIZE - 1 && c + 1 < len) || (offset == 0 && c > 0)
}

/// For every output coordinate: its source coordinate and the span of that
/// source pixel
fn expand_axis(len: usize) -> (Vec<usize>, Vec<usize>) {
    let mut source = Vec::with_capacity(len + len / CHIP_SIZE * 2 * (EDGE_SPAN - 1));
    let mut span = Vec::with_capacity(source.capacity());
    for c in 0..len {
        let width = if is_wide(c, len) { EDGE_SPAN } else { 1 };
        source.extend(std::iter::repeat(c).take(width));
        span.extend(std::iter::repeat(width).take(width));
    }
    (source, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_module_size() {
        let tables = DistortionTables::standard(&ChipGeometry::full_module(), DistortionMethod::Divide);
        assert_eq!(tables.size(), (1556, 516));
        assert_eq!(tables.source_len(), 1536 * 512);

        let (w, _) = tables.size();
        // chip 1 corner pixel is plain, the pixel next to chip 2 covers 3 columns
        assert_eq!(tables.nominator()[0], 1);
        assert_eq!(tables.index()[255], 255);
        assert_eq!(&tables.nominator()[255..258], &[3, 3, 3]);
        assert_eq!(&tables.index()[255..258], &[255, 255, 255]);
        assert_eq!(tables.index()[258], 256);
        // both edges: 3 x 3
        assert_eq!(tables.nominator()[255 * w + 255], 9);
    }

    #[test]
    fn test_single_chip_is_identity() {
        let geometry = ChipGeometry::new(&[4]).unwrap();
        let tables = DistortionTables::standard(&geometry, DistortionMethod::Divide);
        assert_eq!(tables.size(), (256, 256));
        assert!(tables.nominator().iter().all(|&n| n == 1));
        assert!(tables.index().iter().enumerate().all(|(j, &i)| i as usize == j));
    }

    #[test]
    fn test_copy_method_and_holes() {
        let geometry = ChipGeometry::new(&[1, 3]).unwrap();
        let tables = DistortionTables::standard(&geometry, DistortionMethod::Copy);
        assert_eq!(tables.size(), (768 + 8, 256));
        // chip 2 area is blank
        assert_eq!(tables.nominator()[400], 0);
        assert_eq!(tables.nominator()[256], 1);
    }

    #[test]
    fn test_custom_tables_validated() {
        assert!(DistortionTables::new(vec![0, 1], vec![1, 1], 2, 1, 2).is_ok());
        assert!(DistortionTables::new(vec![0], vec![1, 1], 2, 1, 2).is_err());
        assert!(DistortionTables::new(vec![0, 5], vec![1, 1], 2, 1, 2).is_err());
        // blank entries may point anywhere
        assert!(DistortionTables::new(vec![0, 5], vec![1, -3], 2, 1, 2).is_ok());
    }
}
