//! Throttled snapshot of the most recent decoded frame

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Copy of a decoded frame for display
#[derive(Debug, Clone, PartialEq)]
pub struct LiveFrame<T> {
    pub frame_no: i64,
    pub error_code: i32,
    pub pixels: Vec<T>,
}

struct LiveState<T> {
    frame: Option<LiveFrame<T>>,
    last_update: Option<Instant>,
}

/// Latest-frame holder refreshed at a bounded rate
pub struct LiveView<T> {
    state: Mutex<LiveState<T>>,
    min_interval: Duration,
}

impl<T: Copy + Default> LiveView<T> {
    /// `fps` of 0 disables the snapshot
    pub fn new(fps: f64) -> Self {
        let min_interval = if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::MAX
        };
        Self {
            state: Mutex::new(LiveState {
                frame: None,
                last_update: None,
            }),
            min_interval,
        }
    }

    /// Offer a decoded frame; returns true if the snapshot was refreshed
    pub fn offer(&self, frame_no: i64, error_code: i32, pixels: &[T]) -> bool {
        if self.min_interval == Duration::MAX {
            return false;
        }
        // another decoder is refreshing right now
        let Some(mut state) = self.state.try_lock() else {
            return false;
        };
        let now = Instant::now();
        if let Some(last) = state.last_update {
            if now.duration_since(last) < self.min_interval {
                return false;
            }
        }
        state.last_update = Some(now);

        match state.frame.as_mut() {
            Some(frame) => {
                frame.frame_no = frame_no;
                frame.error_code = error_code;
                frame.pixels.clear();
                frame.pixels.extend_from_slice(pixels);
            }
            None => {
                state.frame = Some(LiveFrame {
                    frame_no,
                    error_code,
                    pixels: pixels.to_vec(),
                });
            }
        }
        true
    }

    /// Most recent snapshot, if any frame was offered yet
    pub fn current(&self) -> Option<LiveFrame<T>> {
        self.state.lock().frame.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.frame = None;
        state.last_update = None;
    }
}
