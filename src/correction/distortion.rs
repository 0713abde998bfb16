//! Per-pixel distortion correction

use std::sync::Arc;

use super::tables::DistortionTables;
use crate::error::DecodeError;

/// Pixel types of decoded images
pub trait Pixel: bytemuck::Pod + Default + PartialEq + Send + Sync + 'static {
    /// Value of a saturated counter, never divided
    const SATURATION: Self;

    /// Blank value for a non-positive nominator
    fn from_nominator(nominator: i32) -> Self;

    /// `self / nominator`, rounded to nearest
    fn divide_round(self, nominator: i32) -> Self;
}

impl Pixel for i16 {
    const SATURATION: i16 = 4095;

    fn from_nominator(nominator: i32) -> Self {
        nominator.clamp(i16::MIN as i32, 0) as i16
    }

    fn divide_round(self, nominator: i32) -> Self {
        (self as f64 / nominator as f64).round() as i16
    }
}

impl Pixel for i32 {
    const SATURATION: i32 = (1 << 24) - 1;

    fn from_nominator(nominator: i32) -> Self {
        nominator
    }

    fn divide_round(self, nominator: i32) -> Self {
        (self as f64 / nominator as f64).round() as i32
    }
}

/// Applies [`DistortionTables`] to images, reusing its output buffer
pub struct DistortionCorrector<T> {
    tables: Arc<DistortionTables>,
    output: Vec<T>,
}

impl<T: Pixel> DistortionCorrector<T> {
    pub fn new(tables: Arc<DistortionTables>) -> Self {
        Self {
            output: vec![T::default(); tables.pixel_count()],
            tables,
        }
    }

    pub fn tables(&self) -> &DistortionTables {
        &self.tables
    }

    /// Corrected image size
    pub fn size(&self) -> (usize, usize) {
        self.tables.size()
    }

    pub fn correct(&mut self, input: &[T]) -> Result<&[T], DecodeError> {
        if input.len() != self.tables.source_len() {
            return Err(DecodeError::OutputSize {
                expected: self.tables.source_len(),
                actual: input.len(),
            });
        }

        let tables = &self.tables;
        for ((out, &index), &nominator) in self
            .output
            .iter_mut()
            .zip(tables.index())
            .zip(tables.nominator())
        {
            *out = match nominator {
                1 => input[index as usize],
                n if n <= 0 => T::from_nominator(n),
                n => {
                    let value = input[index as usize];
                    if value == T::SATURATION {
                        value
                    } else {
                        value.divide_round(n)
                    }
                }
            };
        }
        Ok(&self.output)
    }
}
