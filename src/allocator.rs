//! The upstream token authority, as seen by a cache.
//!
//! [`Allocator`] is the interface a cache consumes: ask for a batch of
//! tokens, get back a grant some latency later. A real deployment would put
//! an RPC stub behind this trait; [`SimulatedAllocator`] is the in-process
//! stand-in, a continuous token bucket with configurable artificial latency.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Requests queued ahead of the authority; sized so bursts never block the
/// caches issuing prefetches.
const CHANNEL_CAPACITY: usize = 10_000;

/// The authority's answer to one allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Tokens granted, in `[0, requested]`. Zero is a valid answer and is
    /// the only encoding of failure.
    pub amount: u64,
    /// How long the granted batch stays spendable.
    pub expire: Duration,
}

/// Asynchronous source of rate-limit tokens.
///
/// Exactly one grant comes back per call, after some latency. The call never
/// fails: an authority that cannot serve answers with a zero grant.
/// Completions contend with `check()` calls for the cache mutex.
#[async_trait]
pub trait Allocator: Send + Sync {
    /// Request `amount` tokens from the authority.
    async fn alloc(&self, amount: u64) -> Grant;
}

/// Tuning for [`SimulatedAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct SimulatedAllocatorConfig {
    /// Tokens replenished per window.
    pub rate: u64,
    /// The authority's accounting window.
    pub window: Duration,
    /// Artificial latency injected before each grant is delivered.
    pub latency: Duration,
}

impl Default for SimulatedAllocatorConfig {
    fn default() -> Self {
        Self { rate: 100, window: Duration::from_secs(60), latency: Duration::from_millis(200) }
    }
}

enum Msg {
    Alloc { amount: u64, reply: oneshot::Sender<Grant> },
    Reset,
}

/// In-process authority: a FIFO queue in front of a continuously refilled
/// token bucket, with a delay stage between decision and delivery.
///
/// Requests are served strictly in arrival order; the allowance refills at
/// `rate / window` per second and is capped at `rate`. Each decision is
/// dispatched on its own delay task, so a slow delivery never holds up the
/// queue.
pub struct SimulatedAllocator {
    tx: mpsc::Sender<Msg>,
    in_flight: Arc<AtomicUsize>,
    granted_total: Arc<AtomicU64>,
    config: SimulatedAllocatorConfig,
}

impl SimulatedAllocator {
    /// Spawn the authority task. Must be called inside a tokio runtime.
    pub fn new(config: SimulatedAllocatorConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<Msg>(CHANNEL_CAPACITY);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let granted_total = Arc::new(AtomicU64::new(0));

        let worker_in_flight = Arc::clone(&in_flight);
        let worker_granted = Arc::clone(&granted_total);
        tokio::spawn(async move {
            let rate = config.rate as f64;
            let window_secs = config.window.as_secs_f64();
            tracing::info!(
                rate = config.rate,
                window = ?config.window,
                latency = ?config.latency,
                "authority started"
            );

            let mut allowance = rate;
            let mut last_check = tokio::time::Instant::now();
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::Alloc { amount, reply } => {
                        let now = tokio::time::Instant::now();
                        allowance += (now - last_check).as_secs_f64() * (rate / window_secs);
                        last_check = now;
                        if allowance > rate {
                            allowance = rate; // throttle
                        }
                        let granted = (amount as f64).min(allowance);
                        allowance -= granted;
                        let granted = granted as u64;
                        worker_granted.fetch_add(granted, Ordering::SeqCst);

                        let grant = Grant { amount: granted, expire: config.window };
                        let in_flight = Arc::clone(&worker_in_flight);
                        tokio::spawn(async move {
                            tokio::time::sleep(config.latency).await;
                            let _ = reply.send(grant);
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Msg::Reset => {
                        allowance = 0.0;
                        let now = tokio::time::Instant::now();
                        last_check = now.checked_sub(Duration::from_secs(1)).unwrap_or(now);
                    }
                }
            }
        });

        Self { tx, in_flight, granted_total, config }
    }

    /// Drain the allowance. The bucket restarts empty, backdated so one
    /// second's worth of refill is pending.
    pub async fn reset(&self) {
        let _ = self.tx.send(Msg::Reset).await;
    }

    /// Requests accepted but not yet answered. Zero means quiescent up to
    /// completions already in delivery.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Total tokens granted across all requests so far.
    pub fn granted_total(&self) -> u64 {
        self.granted_total.load(Ordering::SeqCst)
    }

    fn zero_grant(&self) -> Grant {
        Grant { amount: 0, expire: self.config.window }
    }
}

#[async_trait]
impl Allocator for SimulatedAllocator {
    async fn alloc(&self, amount: u64) -> Grant {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Msg::Alloc { amount, reply: reply_tx }).await.is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            tracing::error!("authority task is gone; answering with a zero grant");
            return self.zero_grant();
        }
        match reply_rx.await {
            Ok(grant) => grant,
            Err(_) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                tracing::error!("authority dropped a request; answering with a zero grant");
                self.zero_grant()
            }
        }
    }
}
