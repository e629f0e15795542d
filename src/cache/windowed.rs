//! Rolling-window predictive cache (the first of the two designs).
//!
//! Prefetch sizing follows observed traffic: a sliding window counts the
//! admission attempts of the last second and the cache keeps roughly that
//! many tokens on hand, topping up whenever the reservoir drops below half
//! of the desired level. The mode is a prefetch-suppression signal only;
//! admission itself always just consumes from the queue.

use crate::allocator::{Allocator, Grant};
use crate::cache::{next_cache_id, Mode, TokenCache};
use crate::clock::{Clock, TokioClock};
use crate::queue::{BatchQueue, Node, NodeId, NodeIdSource};
use crate::stats::CacheStats;
use crate::window::RollingWindow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tuning for [`WindowedCache`].
#[derive(Debug, Clone, Copy)]
pub struct WindowedCacheConfig {
    /// Horizon over which admission attempts are counted to size prefetches.
    pub predict_window: Duration,
    /// How long CLOSE mode suppresses further prefetches after a short
    /// grant; most would come back short again.
    pub close_wait_window: Duration,
    /// Floor on the requested batch size.
    pub min_prefetch_amount: u64,
}

impl Default for WindowedCacheConfig {
    fn default() -> Self {
        Self {
            predict_window: Duration::from_secs(1),
            close_wait_window: Duration::from_millis(500),
            min_prefetch_amount: 10,
        }
    }
}

struct WindowedState {
    queue: BatchQueue,
    mode: Mode,
    last_prefetch: Option<u64>,
    window: RollingWindow,
    ids: NodeIdSource,
    stats: CacheStats,
}

/// Rolling-window predictive token cache.
///
/// Clones share state. All operations, including grant completions and
/// expiration timers, serialize on one internal mutex.
#[derive(Clone)]
pub struct WindowedCache {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<WindowedState>,
    allocator: Arc<dyn Allocator>,
    clock: Arc<dyn Clock>,
    config: WindowedCacheConfig,
    id: u64,
}

impl WindowedCache {
    /// Create a cache fronting `allocator` with default tuning.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self::with_parts(allocator, Arc::new(TokioClock::new()), WindowedCacheConfig::default())
    }

    /// Create a cache with an explicit clock and tuning; the clock injection
    /// is what makes the time-dependent policy testable.
    pub fn with_parts(
        allocator: Arc<dyn Allocator>,
        clock: Arc<dyn Clock>,
        config: WindowedCacheConfig,
    ) -> Self {
        let state = WindowedState {
            queue: BatchQueue::new(),
            mode: Mode::Close,
            last_prefetch: None,
            window: RollingWindow::new(config.predict_window, Arc::clone(&clock)),
            ids: NodeIdSource::new(),
            stats: CacheStats::default(),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                allocator,
                clock,
                config,
                id: next_cache_id(),
            }),
        }
    }

    /// Admit or reject one request.
    ///
    /// Synchronous: records the attempt in the window, possibly launches a
    /// background prefetch, and consumes one token from the head batch.
    pub fn check(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();

        self.try_prefetch(&mut state);
        state.window.inc();
        let admitted = state.queue.take(1) == 0;
        if !admitted {
            tracing::trace!(cache_id = self.shared.id, "request rejected");
        }
        admitted
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().unwrap().stats
    }

    /// Tokens currently available across queued batches.
    pub fn available(&self) -> u64 {
        self.shared.state.lock().unwrap().queue.total_available()
    }

    /// Launch a prefetch when the reservoir runs below half of the demand
    /// observed over the predict window.
    fn try_prefetch(&self, state: &mut WindowedState) {
        // A short grant means the authority is drained; asking again right
        // away would most likely come back empty too.
        if state.mode == Mode::Close {
            if let Some(last) = state.last_prefetch {
                let close_wait = duration_millis(self.shared.config.close_wait_window);
                if self.shared.clock.now_millis().saturating_sub(last) < close_wait {
                    return;
                }
            }
        }

        let available = state.queue.total_available();
        let observed = state.window.count();
        let desired = observed.max(self.shared.config.min_prefetch_amount);
        tracing::trace!(
            cache_id = self.shared.id,
            available,
            observed,
            desired,
            "prefetch considered"
        );

        if available < desired / 2 {
            // Only draw on unconfirmed tokens when the reservoir is dry and
            // the authority has been granting in full; this keeps the first
            // request after a quiet stretch from bouncing while the prefetch
            // is still on the wire.
            let optimistic = available == 0 && state.mode == Mode::Open;
            self.prefetch(state, desired, optimistic);
        }
    }

    fn prefetch(&self, state: &mut WindowedState, amount: u64, optimistic: bool) {
        let node_id = if optimistic {
            let id = state.ids.next();
            state.queue.push(Node::new(id, amount));
            id
        } else {
            NodeId::NONE
        };

        tracing::debug!(
            cache_id = self.shared.id,
            node_id = %node_id,
            amount,
            optimistic,
            "prefetch requested"
        );
        state.stats.prefetch_calls += 1;
        state.stats.prefetch_tokens += amount;
        state.last_prefetch = Some(self.shared.clock.now_millis());

        let cache = self.clone();
        let allocator = Arc::clone(&self.shared.allocator);
        tokio::spawn(async move {
            let grant = allocator.alloc(amount).await;
            cache.on_grant(node_id, amount, grant);
        });
    }

    /// Grant completion: reconcile the batch against what was actually
    /// granted, update the mode, and arm the expiration timer.
    fn on_grant(&self, node_id: NodeId, requested: u64, grant: Grant) {
        let mut state = self.shared.state.lock().unwrap();
        let mut node_id = node_id;

        if node_id.is_optimistic() {
            // The requested amount is already in the queue and may be partly
            // spent; a short grant has to be clawed back.
            if grant.amount < requested {
                let mut shortfall = requested - grant.amount;
                if let Some(node) = state.queue.find_mut(node_id) {
                    shortfall -= node.drain(shortfall);
                }
                if shortfall > 0 {
                    let over = state.queue.take(shortfall);
                    if over > 0 {
                        state.stats.over_used += over;
                        tracing::warn!(
                            cache_id = self.shared.id,
                            node_id = %node_id,
                            over,
                            "tokens consumed beyond the grant"
                        );
                    }
                }
            }
        } else if grant.amount > 0 {
            node_id = state.ids.next();
            state.queue.push(Node::new(node_id, grant.amount));
        }

        tracing::debug!(
            cache_id = self.shared.id,
            node_id = %node_id,
            granted = grant.amount,
            requested,
            "prefetch granted"
        );

        if grant.amount == requested {
            if state.mode != Mode::Open {
                state.mode = Mode::Open;
                tracing::info!(cache_id = self.shared.id, "mode → open");
            }
        } else if state.mode != Mode::Close {
            state.mode = Mode::Close;
            tracing::info!(cache_id = self.shared.id, "mode → close");
        }

        let has_balance = state.queue.find_mut(node_id).is_some_and(|n| n.available() > 0);
        if has_balance {
            tracing::debug!(
                cache_id = self.shared.id,
                node_id = %node_id,
                expire = ?grant.expire,
                "expiration armed"
            );
            let cache = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grant.expire).await;
                cache.on_expire(node_id);
            });
        }
    }

    /// Expiration: whatever is left of the batch is forfeited. Idempotent;
    /// a batch already drained or gone is a no-op.
    fn on_expire(&self, node_id: NodeId) {
        let mut state = self.shared.state.lock().unwrap();
        let balance = match state.queue.find_mut(node_id) {
            Some(node) => node.clear(),
            None => return,
        };
        if balance > 0 {
            state.stats.expired += balance;
            tracing::info!(
                cache_id = self.shared.id,
                node_id = %node_id,
                balance,
                "unused tokens expired"
            );
        }
    }

    #[cfg(test)]
    fn mode(&self) -> Mode {
        self.shared.state.lock().unwrap().mode
    }
}

impl TokenCache for WindowedCache {
    fn check(&self) -> bool {
        WindowedCache::check(self)
    }

    fn stats(&self) -> CacheStats {
        WindowedCache::stats(self)
    }

    fn available(&self) -> u64 {
        WindowedCache::available(self)
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
