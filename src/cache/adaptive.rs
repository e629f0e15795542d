//! Adaptive-doubling cache (the second of the two designs).
//!
//! No traffic window: the prefetch amount itself is the prediction. It
//! doubles while demand keeps arriving faster than the prefetch horizon and
//! the authority keeps granting in full, and it shrinks on shortfall, long
//! idle stretches, or expired batches. The mode gates the admission path:
//! with a drained reservoir and a short-granting authority, requests are
//! rejected outright instead of piling up prefetches.

use crate::allocator::{Allocator, Grant};
use crate::cache::{next_cache_id, Mode, TokenCache};
use crate::clock::{Clock, TokioClock};
use crate::queue::{BatchQueue, Node, NodeId, NodeIdSource};
use crate::stats::CacheStats;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tuning for [`AdaptiveCache`].
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveCacheConfig {
    /// Pace horizon for the multiplicative adjustment: demand recurring
    /// inside one horizon grows the prefetch amount, demand spread across
    /// many horizons shrinks it.
    pub prefetch_window: Duration,
}

impl Default for AdaptiveCacheConfig {
    fn default() -> Self {
        Self { prefetch_window: Duration::from_secs(1) }
    }
}

struct AdaptiveState {
    queue: BatchQueue,
    mode: Mode,
    last_prefetch: Option<u64>,
    prefetch_amount: u64,
    ids: NodeIdSource,
    stats: CacheStats,
}

/// Adaptive-doubling token cache.
///
/// Clones share state. All operations, including grant completions and
/// expiration timers, serialize on one internal mutex.
#[derive(Clone)]
pub struct AdaptiveCache {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<AdaptiveState>,
    allocator: Arc<dyn Allocator>,
    clock: Arc<dyn Clock>,
    config: AdaptiveCacheConfig,
    id: u64,
}

impl AdaptiveCache {
    /// Create a cache fronting `allocator` with default tuning.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self::with_parts(allocator, Arc::new(TokioClock::new()), AdaptiveCacheConfig::default())
    }

    /// Create a cache with an explicit clock and tuning.
    pub fn with_parts(
        allocator: Arc<dyn Allocator>,
        clock: Arc<dyn Clock>,
        config: AdaptiveCacheConfig,
    ) -> Self {
        let state = AdaptiveState {
            queue: BatchQueue::new(),
            mode: Mode::Open,
            last_prefetch: None,
            prefetch_amount: 1,
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
    /// A token in the reservoir settles it immediately. Otherwise the pace
    /// of demand against the prefetch horizon decides whether the amount
    /// grows, shrinks, or stays, whether a prefetch goes out, and whether
    /// the triggering request rides along optimistically.
    pub fn check(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();

        if state.queue.take(1) == 0 {
            return true;
        }

        let now = self.shared.clock.now_millis();
        let Some(last) = state.last_prefetch else {
            return self.prefetch(&mut state, now);
        };

        let elapsed = now.saturating_sub(last);
        let window = duration_millis(self.shared.config.prefetch_window);
        let double_window = window.saturating_mul(2);
        if elapsed > double_window {
            // Long idle: demand has been arriving slower than the horizon,
            // scale the amount down proportionally before asking again.
            let divisor = elapsed / double_window;
            state.prefetch_amount = (state.prefetch_amount / divisor).max(1);
            tracing::debug!(
                cache_id = self.shared.id,
                prefetch_amount = state.prefetch_amount,
                "prefetch amount shrunk after idle"
            );
            self.prefetch(&mut state, now)
        } else if elapsed > window {
            self.prefetch(&mut state, now)
        } else if state.mode == Mode::Open {
            // Demand outran the last batch inside one horizon and the
            // authority has been granting in full: ask for twice as much.
            state.prefetch_amount = state.prefetch_amount.saturating_mul(2);
            tracing::debug!(
                cache_id = self.shared.id,
                prefetch_amount = state.prefetch_amount,
                "prefetch amount doubled"
            );
            self.prefetch(&mut state, now)
        } else {
            tracing::trace!(cache_id = self.shared.id, "request rejected");
            false
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().unwrap().stats
    }

    /// Tokens currently available across queued batches.
    pub fn available(&self) -> u64 {
        self.shared.state.lock().unwrap().queue.total_available()
    }

    /// Issue a prefetch of the current amount; returns whether the
    /// triggering request was admitted optimistically.
    ///
    /// In OPEN mode the batch is spendable before the grant arrives: an
    /// amount of 1 is consumed in-line under the reserved id without ever
    /// entering the queue, larger amounts are enqueued in full and the
    /// triggering request takes the first token. CLOSE mode enqueues
    /// nothing until the grant lands, and the request is rejected.
    fn prefetch(&self, state: &mut AdaptiveState, now: u64) -> bool {
        let amount = state.prefetch_amount;
        let optimistic = state.mode == Mode::Open;
        let node_id = if !optimistic {
            NodeId::NONE
        } else if amount == 1 {
            NodeId::INLINE
        } else {
            let id = state.ids.next();
            state.queue.push(Node::new(id, amount));
            // The reservoir was empty of spendable tokens, so this lands on
            // the batch just pushed.
            let unmet = state.queue.take(1);
            debug_assert_eq!(unmet, 0);
            id
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
        state.last_prefetch = Some(now);

        let cache = self.clone();
        let allocator = Arc::clone(&self.shared.allocator);
        tokio::spawn(async move {
            let grant = allocator.alloc(amount).await;
            cache.on_grant(node_id, amount, grant);
        });

        optimistic
    }

    /// Grant completion: reconcile, adapt the amount, update the mode, arm
    /// the expiration timer.
    fn on_grant(&self, node_id: NodeId, requested: u64, grant: Grant) {
        let mut state = self.shared.state.lock().unwrap();
        let mut node_id = node_id;

        if node_id.is_optimistic() {
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
        } else {
            let shortfall = requested - grant.amount;
            state.prefetch_amount = state.prefetch_amount.saturating_sub(shortfall).max(1);
            if state.mode != Mode::Close {
                state.mode = Mode::Close;
                tracing::info!(cache_id = self.shared.id, "mode → close");
            }
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

    /// Expiration: forfeit the remaining balance, scale the prefetch amount
    /// back by what went unused, and reopen the mode. Idempotent.
    fn on_expire(&self, node_id: NodeId) {
        let mut state = self.shared.state.lock().unwrap();
        let balance = match state.queue.find_mut(node_id) {
            Some(node) => node.clear(),
            None => return,
        };
        if balance == 0 {
            return;
        }

        state.stats.expired += balance;
        state.prefetch_amount = state.prefetch_amount.saturating_sub(balance).max(1);
        if state.mode != Mode::Open {
            state.mode = Mode::Open;
            tracing::info!(cache_id = self.shared.id, "mode → open");
        }
        tracing::info!(
            cache_id = self.shared.id,
            node_id = %node_id,
            balance,
            prefetch_amount = state.prefetch_amount,
            "unused tokens expired"
        );
    }

    #[cfg(test)]
    fn mode(&self) -> Mode {
        self.shared.state.lock().unwrap().mode
    }

    #[cfg(test)]
    fn prefetch_amount(&self) -> u64 {
        self.shared.state.lock().unwrap().prefetch_amount
    }
}

impl TokenCache for AdaptiveCache {
    fn check(&self) -> bool {
        AdaptiveCache::check(self)
    }

    fn stats(&self) -> CacheStats {
        AdaptiveCache::stats(self)
    }

    fn available(&self) -> u64 {
        AdaptiveCache::available(self)
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;

    #[derive(Debug, Default)]
    struct PendingAllocator {
        requests: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Allocator for PendingAllocator {
        async fn alloc(&self, amount: u64) -> Grant {
            self.requests.lock().unwrap().push(amount);
            futures::future::pending().await
        }
    }

    fn cache_with_clock() -> (AdaptiveCache, Arc<PendingAllocator>, ManualClock) {
        let allocator = Arc::new(PendingAllocator::default());
        let clock = ManualClock::new();
        let cache = AdaptiveCache::with_parts(
            allocator.clone() as Arc<dyn Allocator>,
            Arc::new(clock.clone()),
            AdaptiveCacheConfig::default(),
        );
        (cache, allocator, clock)
    }

    fn grant(amount: u64) -> Grant {
        Grant { amount, expire: Duration::from_secs(60) }
    }

    async fn recorded(allocator: &PendingAllocator) -> Vec<u64> {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        allocator.requests.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn cold_start_admits_optimistically_in_line() {
        let (cache, allocator, _clock) = cache_with_clock();
        // Empty queue, never prefetched, starts OPEN with amount 1: the
        // request rides the in-line reservation.
        assert!(cache.check());
        assert_eq!(recorded(&allocator).await, vec![1]);
        assert_eq!(cache.available(), 0, "an in-line batch never enters the queue");
        let stats = cache.stats();
        assert_eq!(stats.prefetch_calls, 1);
        assert_eq!(stats.prefetch_tokens, 1);
    }

    #[tokio::test]
    async fn full_grant_of_in_line_batch_settles_cleanly() {
        let (cache, _allocator, _clock) = cache_with_clock();
        assert!(cache.check());
        cache.on_grant(NodeId::INLINE, 1, grant(1));
        let stats = cache.stats();
        assert_eq!(stats.over_used, 0);
        assert_eq!(cache.mode(), Mode::Open);
        assert_eq!(cache.prefetch_amount(), 1);
    }

    #[tokio::test]
    async fn amount_doubles_under_sustained_demand_in_open_mode() {
        let (cache, allocator, _clock) = cache_with_clock();
        assert!(cache.check()); // amount 1, in-line
        assert!(cache.check()); // doubles to 2, enqueued, 1 consumed
        assert_eq!(cache.prefetch_amount(), 2);
        assert_eq!(cache.available(), 1);
        assert!(cache.check()); // spends the queued token, no prefetch
        assert!(cache.check()); // doubles to 4
        assert_eq!(cache.prefetch_amount(), 4);
        assert_eq!(recorded(&allocator).await, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn close_mode_rejects_within_the_horizon() {
        let (cache, allocator, clock) = cache_with_clock();
        assert!(cache.check());
        cache.on_grant(NodeId::INLINE, 1, grant(0));
        assert_eq!(cache.mode(), Mode::Close);

        // Inside the horizon, a drained reservoir in CLOSE mode is a flat
        // rejection with no new prefetch.
        clock.advance(500);
        assert!(!cache.check());
        assert_eq!(recorded(&allocator).await.len(), 1);
    }

    #[tokio::test]
    async fn past_the_horizon_close_mode_prefetches_pessimistically() {
        let (cache, allocator, clock) = cache_with_clock();
        assert!(cache.check());
        cache.on_grant(NodeId::INLINE, 1, grant(0));

        clock.advance(1_500);
        assert!(!cache.check(), "pessimistic prefetch cannot admit the trigger");
        assert_eq!(recorded(&allocator).await.len(), 2);
        assert_eq!(cache.available(), 0);
    }

    #[tokio::test]
    async fn long_idle_shrinks_the_amount_proportionally() {
        let (cache, _allocator, clock) = cache_with_clock();
        assert!(cache.check()); // amount 1, in-line
        assert!(cache.check()); // doubles to 2
        assert!(cache.check()); // spends the queued token
        assert!(cache.check()); // doubles to 4
        assert!(cache.check());
        assert!(cache.check());
        assert!(cache.check()); // queue dry again
        assert!(cache.check()); // doubles to 8
        assert_eq!(cache.prefetch_amount(), 8);

        // Queue still holds tokens; drain them so the next check reaches
        // the pacing branch.
        while cache.available() > 0 {
            assert!(cache.check());
        }

        // 8 seconds idle = 4 double-horizons: amount divides by 4.
        clock.advance(8_000);
        assert!(cache.check());
        assert_eq!(cache.prefetch_amount(), 2);
    }

    #[tokio::test]
    async fn shortfall_shrinks_the_amount_and_closes_the_mode() {
        let (cache, _allocator, _clock) = cache_with_clock();
        assert!(cache.check()); // amount 1, in-line
        assert!(cache.check()); // amount 2, batch of 2 enqueued, 1 spent
        assert!(cache.check()); // spends the remaining token
        assert!(cache.check()); // amount 4, batch of 4 enqueued, 1 spent
        assert_eq!(cache.prefetch_amount(), 4);
        assert_eq!(cache.available(), 3);

        // Batch id 3 advertised 4, authority covers 1: the 3 unspent absorb
        // what they can of the shortfall, amount drops by it, mode closes.
        cache.on_grant(NodeId::from_raw(3), 4, grant(1));
        assert_eq!(cache.available(), 0);
        assert_eq!(cache.stats().over_used, 0);
        assert_eq!(cache.prefetch_amount(), 1);
        assert_eq!(cache.mode(), Mode::Close);
    }

    #[tokio::test]
    async fn uncoverable_shortfall_is_counted_as_over_use() {
        let (cache, _allocator, _clock) = cache_with_clock();
        assert!(cache.check()); // in-line batch of 1
        // Nothing queued to claw back; the consumed token goes uncovered.
        cache.on_grant(NodeId::INLINE, 1, grant(0));
        assert_eq!(cache.stats().over_used, 1);
        assert_eq!(cache.mode(), Mode::Close);
    }

    #[tokio::test]
    async fn expiration_shrinks_the_amount_and_reopens_the_mode() {
        let (cache, _allocator, _clock) = cache_with_clock();
        assert!(cache.check()); // amount 1
        assert!(cache.check()); // amount 2, batch id 2 enqueued, 1 spent
        cache.on_grant(NodeId::from_raw(2), 2, grant(1));
        assert_eq!(cache.mode(), Mode::Close);
        assert_eq!(cache.available(), 0);

        // The grant shrank the amount to 1 and closed the mode; a check
        // inside the horizon with a dry reservoir is a flat rejection.
        assert!(!cache.check());

        // A fresh pessimistic grant puts a batch in the queue.
        cache.on_grant(NodeId::NONE, 4, grant(4));
        assert_eq!(cache.mode(), Mode::Open);
        assert_eq!(cache.available(), 4);

        cache.on_expire(NodeId::from_raw(3));
        let stats = cache.stats();
        assert_eq!(stats.expired, 4);
        assert_eq!(cache.available(), 0);
        assert_eq!(cache.mode(), Mode::Open);
        assert_eq!(cache.prefetch_amount(), 1);

        // Idempotent: firing again changes nothing.
        cache.on_expire(NodeId::from_raw(3));
        assert_eq!(cache.stats().expired, 4);
    }

    #[tokio::test]
    async fn amount_never_drops_below_one() {
        let (cache, _allocator, clock) = cache_with_clock();
        assert!(cache.check());
        cache.on_grant(NodeId::INLINE, 1, grant(0));
        assert_eq!(cache.prefetch_amount(), 1);

        clock.advance(100_000);
        cache.check();
        assert_eq!(cache.prefetch_amount(), 1);
    }
}
