//! The prefetching token caches.
//!
//! Two coexisting designs of the same core, implemented side by side because
//! the trade-off between them is part of the design:
//!
//! - [`WindowedCache`](windowed::WindowedCache) sizes prefetches from a
//!   rolling window of recently observed traffic and uses its mode only to
//!   suppress prefetches after a short grant.
//! - [`AdaptiveCache`](adaptive::AdaptiveCache) carries no window; it adapts
//!   the prefetch amount multiplicatively (doubling under sustained demand,
//!   shrinking on shortfall, idleness, or expiration) and lets the mode gate
//!   the admission path itself.
//!
//! Both share the data model: a FIFO of token batches consumed head-first,
//! optimistic reservations reconciled against asynchronous grants, and
//! per-batch expiration. All state lives behind a single mutex; grant
//! completions and expiration timers re-enter through it.

pub mod adaptive;
pub mod windowed;

use crate::stats::CacheStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Grant-health mode of a cache.
///
/// OPEN means the authority fully satisfied the last prefetch and optimistic
/// reservations are permitted; CLOSE means the last grant came up short and
/// prefetches are suppressed or the admission path is gated, depending on
/// the design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Open,
    Close,
}

/// Common admission interface implemented by both cache designs, so proxies
/// and drivers can select a variant at runtime.
pub trait TokenCache: Send + Sync {
    /// Admit or reject a single request. Synchronous: consumes one token
    /// from the local reservoir and may trigger a background prefetch, but
    /// never waits for the authority.
    fn check(&self) -> bool;

    /// Snapshot of the accounting counters.
    fn stats(&self) -> CacheStats;

    /// Tokens currently available across all queued batches.
    fn available(&self) -> u64;
}

/// Process-wide cache id sequence, for telling caches apart in logs when
/// several front the same authority.
pub(crate) fn next_cache_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
