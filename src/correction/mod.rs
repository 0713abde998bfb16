//! Geometric distortion correction of decoded images

pub mod distortion;
pub mod tables;

pub use distortion::{DistortionCorrector, Pixel};
pub use tables::{DistortionMethod, DistortionTables};
