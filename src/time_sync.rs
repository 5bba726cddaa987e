//! Frame-advantage averaging between peers.
//!
//! Each peer periodically reports how far ahead it believes the other side
//! is. Those reports are noisy; `TimeSync` keeps a sliding window of local
//! and remote frame advantages and exposes a smoothed average, which the
//! engine publishes as the `remote_frame_advantage` gauge.

use crate::Frame;

/// Number of frames averaged when calculating frame advantage
/// (half a second at 60 FPS).
const FRAME_WINDOW_SIZE: usize = 30;

/// Sliding-window frame advantage tracker.
#[derive(Debug)]
pub struct TimeSync {
    local: Vec<i32>,
    remote: Vec<i32>,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSync {
    /// Creates a tracker with an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            local: vec![0; FRAME_WINDOW_SIZE],
            remote: vec![0; FRAME_WINDOW_SIZE],
        }
    }

    /// Records the local and remote frame advantages observed at `frame`.
    ///
    /// Null or negative frames are skipped; they can occur transiently
    /// around initialization.
    pub fn advance_frame(&mut self, frame: Frame, local_advantage: i32, remote_advantage: i32) {
        let Some(index) = frame.buffer_index(FRAME_WINDOW_SIZE) else {
            return;
        };
        self.local[index] = local_advantage;
        self.remote[index] = remote_advantage;
    }

    /// The smoothed frame advantage of the remote side over the local side.
    ///
    /// Positive means the remote peer is ahead; the two sides meet in the
    /// middle.
    #[must_use]
    pub fn average_frame_advantage(&self) -> i32 {
        let local_sum: i32 = self.local.iter().sum();
        let local_avg = local_sum as f32 / self.local.len() as f32;
        let remote_sum: i32 = self.remote.iter().sum();
        let remote_avg = remote_sum as f32 / self.remote.len() as f32;

        ((remote_avg - local_avg) / 2.0) as i32
    }
}

// #########
// # TESTS #
// #########
