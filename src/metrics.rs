//! Rollback metrics, readable from outside the engine.
//!
//! The engine is the only writer. A viewer (an overlay, a debugger) reads
//! through [`MetricsCell::snapshot`], which copies the whole value under a
//! short lock; no references into engine-owned storage are ever handed out.

use parking_lot::Mutex;
use std::sync::Arc;

/// A point-in-time copy of the session's rollback metrics.
///
/// `rollback_frames`, `total_rollbacks` and `max_rollback_frames` are
/// monotonic for the lifetime of a connection; the remaining fields are
/// gauges.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RollbackMetrics {
    /// Total number of frames re-simulated across all rollbacks.
    pub rollback_frames: u32,
    /// Total number of rollback events.
    pub total_rollbacks: u32,
    /// Current speculation depth: frames executed on predicted input.
    pub predicted_frames: u32,
    /// Largest single rollback, in frames.
    pub max_rollback_frames: u32,
    /// Mean rollback depth: `rollback_frames / max(1, total_rollbacks)`.
    pub avg_rollback_frames: f32,
    /// Round-trip time to the slowest peer, in milliseconds.
    pub ping_ms: u32,
    /// Smoothed frame advantage of the remote side. Positive means the
    /// remote peer runs ahead. A gauge, never a control input.
    pub remote_frame_advantage: i32,
}

impl RollbackMetrics {
    /// Folds one rollback of `depth` frames into the counters.
    pub fn record_rollback(&mut self, depth: u32) {
        self.rollback_frames += depth;
        self.total_rollbacks += 1;
        self.max_rollback_frames = self.max_rollback_frames.max(depth);
        self.avg_rollback_frames =
            self.rollback_frames as f32 / self.total_rollbacks.max(1) as f32;
    }

    /// Resets all counters and gauges, as happens when a peer connects or
    /// disconnects.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Shared handle to the engine's metrics.
///
/// Cloning is cheap; all clones observe the same underlying value.
#[derive(Debug, Clone, Default)]
pub struct MetricsCell(Arc<Mutex<RollbackMetrics>>);

impl MetricsCell {
    /// Creates a cell holding zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> RollbackMetrics {
        *self.0.lock()
    }

    /// Runs `f` with mutable access to the metrics. Engine-side only; the
    /// lock is held just for the duration of the closure.
    pub fn update<R>(&self, f: impl FnOnce(&mut RollbackMetrics) -> R) -> R {
        f(&mut self.0.lock())
    }
}

// #########
// # TESTS #
// #########
