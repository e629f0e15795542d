//! The proxy front: serializes incoming requests onto a cache.

use crate::cache::TokenCache;
use crate::error::Error;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Requests buffered ahead of the worker.
const CHANNEL_CAPACITY: usize = 10_000;

/// Per-proxy admission tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
    pub req_num: u64,
    pub ok_num: u64,
    pub fail_num: u64,
}

#[derive(Default)]
struct Counters {
    req: AtomicU64,
    ok: AtomicU64,
    fail: AtomicU64,
    submitted: AtomicU64,
    processed: AtomicU64,
}

/// A proxy in front of one cache: requests land on a bounded channel and a
/// single worker task checks them against the cache in arrival order.
///
/// Clones share the channel and the tallies.
#[derive(Clone)]
pub struct Proxy {
    tx: mpsc::Sender<()>,
    counters: Arc<Counters>,
}

impl Proxy {
    /// Spawn the worker task. Must be called inside a tokio runtime.
    pub fn new(cache: Arc<dyn TokenCache>) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(CHANNEL_CAPACITY);
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        tracing::info!("proxy worker started");
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                worker_counters.req.fetch_add(1, Ordering::SeqCst);
                if cache.check() {
                    worker_counters.ok.fetch_add(1, Ordering::SeqCst);
                } else {
                    worker_counters.fail.fetch_add(1, Ordering::SeqCst);
                }
                worker_counters.processed.fetch_add(1, Ordering::SeqCst);
            }
        });

        Self { tx, counters }
    }

    /// Hand one request to the worker.
    pub async fn submit(&self) -> Result<(), Error> {
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(()).await.is_err() {
            self.counters.submitted.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ProxyClosed);
        }
        Ok(())
    }

    /// Emit `n` requests evenly spaced over `duration`, on a background
    /// feeder task. Returns immediately.
    pub fn send(&self, n: u64, duration: Duration) {
        if n == 0 {
            return;
        }
        let spacing = duration / u32::try_from(n).unwrap_or(u32::MAX);
        tracing::debug!(n, ?duration, ?spacing, "sending request burst");

        let proxy = self.clone();
        tokio::spawn(async move {
            for _ in 0..n {
                if proxy.submit().await.is_err() {
                    tracing::warn!("proxy closed; feeder stopping early");
                    break;
                }
                tokio::time::sleep(spacing).await;
            }
        });
    }

    /// Admission tallies so far.
    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            req_num: self.counters.req.load(Ordering::SeqCst),
            ok_num: self.counters.ok.load(Ordering::SeqCst),
            fail_num: self.counters.fail.load(Ordering::SeqCst),
        }
    }

    /// Requests submitted but not yet checked against the cache.
    pub fn pending(&self) -> u64 {
        let submitted = self.counters.submitted.load(Ordering::SeqCst);
        let processed = self.counters.processed.load(Ordering::SeqCst);
        submitted.saturating_sub(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::CacheStats;
    use std::sync::atomic::AtomicBool;

    /// Admits or rejects everything according to a switch; no allocator.
    #[derive(Debug, Default)]
    struct FixedCache {
        admit: AtomicBool,
    }

    impl FixedCache {
        fn admitting(admit: bool) -> Arc<Self> {
            Arc::new(Self { admit: AtomicBool::new(admit) })
        }
    }

    impl TokenCache for FixedCache {
        fn check(&self) -> bool {
            self.admit.load(Ordering::SeqCst)
        }

        fn stats(&self) -> CacheStats {
            CacheStats::default()
        }

        fn available(&self) -> u64 {
            0
        }
    }

    async fn drain(proxy: &Proxy) {
        while proxy.pending() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn tallies_admissions_and_rejections() {
        let proxy = Proxy::new(FixedCache::admitting(true));
        for _ in 0..5 {
            proxy.submit().await.unwrap();
        }
        drain(&proxy).await;
        assert_eq!(proxy.stats(), ProxyStats { req_num: 5, ok_num: 5, fail_num: 0 });

        let proxy = Proxy::new(FixedCache::admitting(false));
        for _ in 0..3 {
            proxy.submit().await.unwrap();
        }
        drain(&proxy).await;
        assert_eq!(proxy.stats(), ProxyStats { req_num: 3, ok_num: 0, fail_num: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn send_paces_requests_over_the_duration() {
        let proxy = Proxy::new(FixedCache::admitting(true));
        proxy.send(10, Duration::from_secs(10));

        // Half the duration in: roughly half the burst has gone through.
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        let mid = proxy.stats().req_num;
        assert!(mid >= 4 && mid <= 6, "got {mid} requests at the midpoint");

        tokio::time::sleep(Duration::from_secs(10)).await;
        drain(&proxy).await;
        assert_eq!(proxy.stats().req_num, 10);
    }

    #[tokio::test]
    async fn pending_settles_to_zero() {
        let proxy = Proxy::new(FixedCache::admitting(true));
        proxy.submit().await.unwrap();
        proxy.submit().await.unwrap();
        drain(&proxy).await;
        assert_eq!(proxy.pending(), 0);
        assert_eq!(proxy.stats().req_num, 2);
    }
}
