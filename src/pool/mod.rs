//! Frame storage shared between receivers, decoders and the consumer

pub mod frame_pool;
pub mod live;
pub mod tracker;

pub use frame_pool::{
    FrameGuard, FrameHandle, FrameInfo, FramePool, SharedFramePool, EMPTY_FRAME, FRAME_COMPLETE,
    FRAME_INCOMPLETE,
};
pub use live::{LiveFrame, LiveView};
pub use tracker::{PacketLayout, NO_FRAME};
