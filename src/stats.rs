use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::info;

/// Lock-free counters for the query pipeline, dumped periodically.
#[derive(Debug)]
pub struct StatsCollector {
    total_queries: AtomicU64,
    blocked_queries: AtomicU64,
    rewritten_queries: AtomicU64,
    failed_queries: AtomicU64,
    cache_hits: AtomicU64,

    // Upstream latency as (total ms, count) pairs for a cheap average.
    upstream_total_ms: AtomicU64,
    upstream_count: AtomicU64,

    log_interval: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_queries: u64,
    pub blocked_queries: u64,
    pub rewritten_queries: u64,
    pub failed_queries: u64,
    pub cache_hits: u64,
    pub avg_upstream_ms: f64,
}

impl StatsCollector {
    pub fn new(log_interval_secs: u64) -> Arc<Self> {
        let stats = Arc::new(Self {
            total_queries: AtomicU64::new(0),
            blocked_queries: AtomicU64::new(0),
            rewritten_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            upstream_total_ms: AtomicU64::new(0),
            upstream_count: AtomicU64::new(0),
            log_interval: Duration::from_secs(log_interval_secs),
        });

        let stats_clone = stats.clone();
        tokio::spawn(async move {
            stats_clone.run_logger().await;
        });

        stats
    }

    pub fn inc_queries(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked(&self) {
        self.blocked_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rewritten(&self) {
        self.rewritten_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_latency(&self, ms: u64) {
        self.upstream_total_ms.fetch_add(ms, Ordering::Relaxed);
        self.upstream_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let count = self.upstream_count.load(Ordering::Relaxed);
        let total_ms = self.upstream_total_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            blocked_queries: self.blocked_queries.load(Ordering::Relaxed),
            rewritten_queries: self.rewritten_queries.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            avg_upstream_ms: if count > 0 {
                total_ms as f64 / count as f64
            } else {
                0.0
            },
        }
    }

    async fn run_logger(&self) {
        let mut interval = time::interval(self.log_interval);
        // First tick fires immediately; skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            let s = self.snapshot();
            info!(
                "Stats: {} queries ({} blocked, {} rewritten, {} failed), {} cache hits, avg upstream {:.1}ms",
                s.total_queries,
                s.blocked_queries,
                s.rewritten_queries,
                s.failed_queries,
                s.cache_hits,
                s.avg_upstream_ms
            );
        }
    }
}
