//! Error types.
//!
//! The cache core itself has no unrecoverable errors: shortfalls, expirations,
//! and starvation are counted, not raised. What remains fallible is handing a
//! request to a worker whose channel has closed.

/// Errors surfaced by the submission paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The proxy's worker task is gone and its request channel is closed.
    #[error("proxy request channel is closed")]
    ProxyClosed,
}
