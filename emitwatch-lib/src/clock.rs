//! Wall-clock source for record timestamps and retention cutoffs.
//!
//! Record timestamps are epoch milliseconds, but every timer in the pipeline
//! runs on `tokio::time`. [`SystemClock`] anchors the epoch once and advances
//! with the tokio clock afterwards, so a paused test runtime moves both in
//! lockstep.

use tokio::time::Instant;

/// Source of epoch-millisecond timestamps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> i64;
}

/// Epoch clock anchored to the tokio monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    anchor_ms: i64,
    anchor: Instant,
}

impl SystemClock {
    /// Anchor at the current UTC time.
    pub fn new() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp_millis())
    }

    /// Anchor at an explicit epoch time (tests use this with a paused runtime).
    pub fn starting_at(epoch_ms: i64) -> Self {
        Self {
            anchor_ms: epoch_ms,
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_ms.saturating_add(elapsed)
    }
}
