//! Counters tracked by the caches.

use serde::Serialize;

/// Snapshot of a cache's accounting counters.
///
/// The live counters sit inside the cache state and are mutated only under
/// the cache mutex; `stats()` hands out a copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Prefetch calls issued to the allocator.
    pub prefetch_calls: u64,
    /// Sum of token amounts requested across all prefetches.
    pub prefetch_tokens: u64,
    /// Tokens consumed optimistically that no grant ultimately covered.
    pub over_used: u64,
    /// Tokens still unspent in a batch when its expiration fired.
    pub expired: u64,
}
