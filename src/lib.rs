#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Farecard 🎫
//!
//! A client-side predictive token cache for distributed rate limiting: each
//! proxy holds a local reservoir of tokens prefetched in batches from a
//! central authority, admits or rejects requests synchronously from that
//! reservoir, and hides the authority's round-trip latency behind
//! predictive, optimistically-reconciled prefetching.
//!
//! ## Features
//!
//! - **Two cache designs** behind one trait: rolling-window predictive
//!   sizing ([`WindowedCache`]) and multiplicative adaptation
//!   ([`AdaptiveCache`])
//! - **Optimistic reservations** reconciled against late grants, with
//!   over-use bounded and counted rather than prevented
//! - **Per-batch expiration** so unused tokens return to the books
//! - **Pluggable authority** via the async [`Allocator`] trait, with a
//!   simulated token-bucket authority included
//! - **Injectable clocks** for deterministic tests of time-driven policy
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use farecard::{AdaptiveCache, SimulatedAllocator, SimulatedAllocatorConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let authority = Arc::new(SimulatedAllocator::new(SimulatedAllocatorConfig::default()));
//!     let cache = AdaptiveCache::new(authority);
//!
//!     // Admission is synchronous; the prefetch that backs it is not.
//!     assert!(cache.check());
//! }
//! ```

pub mod allocator;
pub mod cache;
pub mod clock;
pub mod error;
pub mod proxy;
pub mod queue;
pub mod stats;
pub mod window;

// Re-exports
pub use allocator::{Allocator, Grant, SimulatedAllocator, SimulatedAllocatorConfig};
pub use cache::adaptive::{AdaptiveCache, AdaptiveCacheConfig};
pub use cache::windowed::{WindowedCache, WindowedCacheConfig};
pub use cache::{Mode, TokenCache};
pub use clock::{Clock, ManualClock, TokioClock};
pub use error::Error;
pub use proxy::{Proxy, ProxyStats};
pub use queue::{BatchQueue, Node, NodeId};
pub use stats::CacheStats;
pub use window::RollingWindow;
