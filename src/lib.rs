//! # Pixel Acquisition
//!
//! Frame acquisition core for Medipix-style pixel detectors.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              DETECTOR                                   │
//! │        link 0            link 1            ...           link N         │
//! └──────────┬─────────────────┬──────────────────────────────┬─────────────┘
//!            │ UDP / TCP       │                              │
//!            ▼                 ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    TaskScheduler (scheduler::pool)                      │
//! │  ┌──────────────┐  ┌──────────────┐      ┌──────────────┐  ┌─────────┐  │
//! │  │  Receiver 0  │  │  Receiver 1  │ ...  │  Receiver N  │  │ Monitor │  │
//! │  │  (HIGH)      │  │  (HIGH)      │      │  (HIGH)      │  │ (HIGH)  │  │
//! │  └──────┬───────┘  └──────┬───────┘      └──────┬───────┘  └────┬────┘  │
//! │         │ set_packet / set_image                │    is_image_finished  │
//! │         ▼                 ▼                     ▼               ▼       │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │                 Raw FramePool<u8> (pool::frame_pool)              │  │
//! │  └───────────────────────────────┬───────────────────────────────────┘  │
//! │                                  │ get_image / get_2_images              │
//! │         ┌────────────────────────┼────────────────────────┐             │
//! │         ▼                        ▼                        ▼             │
//! │  ┌──────────────┐         ┌──────────────┐         ┌──────────────┐     │
//! │  │ DecodeTask 0 │         │ DecodeTask 1 │   ...   │ DecodeTask M │     │
//! │  │ decode       │         │ decode       │         │ decode       │     │
//! │  │ distortion   │         │ distortion   │         │ distortion   │     │
//! │  │ compression  │         │ compression  │         │ compression  │     │
//! │  └──────┬───────┘         └──────┬───────┘         └──────┬───────┘     │
//! │         │ set_image_at           │                        │             │
//! │         ▼                        ▼                        ▼             │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │         Decoded FramePool<i16 | i32 | u8>      LiveView           │  │
//! │  └───────────────────────────────┬───────────────────────────────────┘  │
//! └──────────────────────────────────┼──────────────────────────────────────┘
//!                                    ▼
//!                     DataReceiver (acquisition::receiver)
//! ```

pub mod acquisition;
pub mod codec;
pub mod config;
pub mod correction;
pub mod error;
pub mod network;
pub mod pool;
pub mod scheduler;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Side length of one chip in pixels
    pub const CHIP_SIZE: usize = 256;

    /// Bits per pixel counter
    pub const COUNTER_BITS: usize = 12;

    /// Largest counter value, also the saturation value of 12-bit images
    pub const COUNTER_MAX: u16 = (1 << COUNTER_BITS) - 1;

    /// Raw bytes of one chip row (256 pixels x 12 bits)
    pub const CHIP_ROW_BYTES: usize = CHIP_SIZE * COUNTER_BITS / 8;

    /// Raw bytes of one chip
    pub const CHIP_BYTES: usize = CHIP_ROW_BYTES * CHIP_SIZE;

    /// Interleaving unit of the raw stream
    pub const BLOCK_BYTES: usize = 32;

    /// Chip positions on the largest module
    pub const MAX_CHIPS: usize = 12;

    /// Transport header carried by multi-link and follow-up single-link datagrams
    pub const HEADER_SIZE: usize = 6;

    /// First byte of every single-link frame body
    pub const FRAME_MARKER: u8 = 0xA0;

    /// Frame numbers on the wire are 24 bit
    pub const FRAME_COUNTER_BITS: u32 = 24;

    /// Default datagram size including header
    pub const DEFAULT_PACKET_SIZE: usize = 8198;

    /// Default UDP port of the first link
    pub const DEFAULT_UDP_PORT: u16 = 8000;

    /// OS-level receive timeout of data sockets
    pub const RECEIVE_TIMEOUT: Duration = Duration::from_micros(500);

    /// Time a single-link frame may take to arrive completely
    pub const FRAME_TIMEOUT: Duration = Duration::from_millis(100);

    /// Socket receive buffer requested for data links
    pub const SOCKET_RECV_BUFFER: usize = 32 * 1024 * 1024;

    /// Raw frame pool slots
    pub const DEFAULT_RAW_POOL_SIZE: usize = 512;

    /// Decoded frame pool slots
    pub const DEFAULT_DECODED_POOL_SIZE: usize = 512;

    /// Slots kept free so handed-out frames stay readable
    pub const DEFAULT_SAFETY_MARGIN: usize = 32;

    /// Back-off of a task with nothing to do
    pub const TASK_IDLE_SLEEP: Duration = Duration::from_micros(100);

    /// Back-off of a task held back by the priority gate
    pub const TASK_THROTTLE_SLEEP: Duration = Duration::from_millis(1);

    /// Retry interval of a decode task waiting for room in the output pool
    pub const WRITE_RETRY_SLEEP: Duration = Duration::from_micros(200);

    /// Default live view refresh rate
    pub const DEFAULT_LIVE_VIEW_FPS: f64 = 25.0;
}
