//! In-process request metrics.
//!
//! Plain atomic counters, snapshotted as JSON for the admin surface. Staleness
//! and cross-process aggregation are out of scope; each process reports its own.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub streams_opened: AtomicU64,
    pub streams_completed: AtomicU64,
    pub unary_completed: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub upstream_timeouts: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub usage_commits: AtomicU64,
    pub usage_dedup_skips: AtomicU64,
    pub queued_default_overflow: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "requests_rejected": self.requests_rejected.load(Ordering::Relaxed),
            "streams_opened": self.streams_opened.load(Ordering::Relaxed),
            "streams_completed": self.streams_completed.load(Ordering::Relaxed),
            "unary_completed": self.unary_completed.load(Ordering::Relaxed),
            "upstream_errors": self.upstream_errors.load(Ordering::Relaxed),
            "upstream_timeouts": self.upstream_timeouts.load(Ordering::Relaxed),
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
            "cache_misses": self.cache_misses.load(Ordering::Relaxed),
            "usage_commits": self.usage_commits.load(Ordering::Relaxed),
            "usage_dedup_skips": self.usage_dedup_skips.load(Ordering::Relaxed),
            "queued_default_overflow": self.queued_default_overflow.load(Ordering::Relaxed),
        })
    }
}
