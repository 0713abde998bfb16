//! Acquisition pipeline: decode tasks and the orchestrating receiver

pub mod decode_task;
pub mod receiver;

pub use decode_task::{DecodeTask12, DecodeTask24, DecodedSink, FrameOrigin, OutputSettings};
pub use receiver::{AcquisitionStats, DataReceiver};
