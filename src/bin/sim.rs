//! Simulation driver.
//!
//! Wires two proxies onto one simulated authority and replays interactive
//! rounds: each stdin line `n1 n2 d` sends `n1` and `n2` requests to the
//! proxies evenly spaced over `d` seconds, waits for the system to drain,
//! and reports per-proxy and per-cache stats as JSON lines.

use clap::{Parser, ValueEnum};
use farecard::{
    AdaptiveCache, Allocator, CacheStats, Proxy, ProxyStats, SimulatedAllocator,
    SimulatedAllocatorConfig, TokenCache, WindowedCache,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "farecard-sim")]
#[command(about = "Two proxies sharing one rate-limit authority", long_about = None)]
struct Args {
    /// Tokens the authority replenishes per window.
    #[arg(long, default_value_t = 100)]
    rate: u64,

    /// The authority's window, in seconds.
    #[arg(long, default_value_t = 60)]
    window: u64,

    /// Artificial latency on authority calls, in milliseconds.
    #[arg(long, default_value_t = 200)]
    latency: u64,

    /// Which cache design fronts each proxy.
    #[arg(long, value_enum, default_value = "windowed")]
    strategy: Strategy,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    /// Rolling-window predictive sizing.
    Windowed,
    /// Multiplicative adaptation of the prefetch amount.
    Adaptive,
}

#[derive(Serialize)]
struct Report {
    proxy: usize,
    #[serde(flatten)]
    stats: ProxyStats,
    cache: CacheStats,
}

fn build_cache(strategy: Strategy, authority: &Arc<SimulatedAllocator>) -> Arc<dyn TokenCache> {
    let authority = Arc::clone(authority) as Arc<dyn Allocator>;
    match strategy {
        Strategy::Windowed => Arc::new(WindowedCache::new(authority)),
        Strategy::Adaptive => Arc::new(AdaptiveCache::new(authority)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("farecard=info"));
    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let args = Args::parse();
    let authority = Arc::new(SimulatedAllocator::new(SimulatedAllocatorConfig {
        rate: args.rate,
        window: Duration::from_secs(args.window),
        latency: Duration::from_millis(args.latency),
    }));

    let caches =
        [build_cache(args.strategy, &authority), build_cache(args.strategy, &authority)];
    let proxies = [Proxy::new(Arc::clone(&caches[0])), Proxy::new(Arc::clone(&caches[1]))];

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("Enter request number for proxy1, proxy2, duration in seconds:");
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let fields: Vec<u64> = line.split_whitespace().filter_map(|f| f.parse().ok()).collect();
        let &[n1, n2, d] = fields.as_slice() else {
            tracing::warn!(%line, "expected three integers: n1 n2 d");
            continue;
        };

        let duration = Duration::from_secs(d);
        proxies[0].send(n1, duration);
        proxies[1].send(n2, duration);
        tokio::time::sleep(duration).await;

        tracing::info!("done sending, waiting for the system to drain");
        while proxies.iter().any(|p| p.pending() > 0) || authority.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for (i, (proxy, cache)) in proxies.iter().zip(caches.iter()).enumerate() {
            let report =
                Report { proxy: i + 1, stats: proxy.stats(), cache: cache.stats() };
            println!("{}", serde_json::to_string(&report)?);
        }
        tracing::info!(granted_total = authority.granted_total(), "round complete");
    }

    Ok(())
}
