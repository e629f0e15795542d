//! Clock abstractions used by the caches and the rolling-window predictor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Thread-safe time source abstraction.
///
/// Implementers must document whether the origin is wall-clock or monotonic
/// process time. The return value is milliseconds since that origin. Calls
/// must be safe concurrently (`Send + Sync`).
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds relative to the implementer's origin.
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `tokio::time::Instant::now()`.
///
/// Clones share the same epoch (instant captured at creation). Using the
/// tokio instant means readings advance with virtual time inside a paused
/// test runtime, so time-dependent cache logic and timers stay in agreement.
/// Resets on process restart.
#[derive(Debug, Clone)]
pub struct TokioClock {
    start: tokio::time::Instant,
}

impl TokioClock {
    /// Create a new clock starting at `tokio::time::Instant::now()`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self { start: tokio::time::Instant::now() }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    /// Returns milliseconds elapsed since this instance's epoch.
    ///
    /// On the theoretical overflow (>584 million years), saturates to `u64::MAX`.
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying counter, so a test can hold one handle
/// while the cache under test holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock reading 0 ms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
