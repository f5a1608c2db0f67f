use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimal counters for operational visibility.
#[derive(Clone, Default)]
pub struct Counters {
    pub batches: Arc<AtomicU64>,
    pub batches_empty: Arc<AtomicU64>,

    // job outcomes
    pub jobs_claimed: Arc<AtomicU64>,
    pub jobs_completed: Arc<AtomicU64>,
    pub jobs_failed: Arc<AtomicU64>,
    pub jobs_dead_lettered: Arc<AtomicU64>,
    pub jobs_limit_exceeded: Arc<AtomicU64>,
    pub jobs_errored: Arc<AtomicU64>,
    pub stale_recovered: Arc<AtomicU64>,
    pub claims_lost: Arc<AtomicU64>,

    // platform outcomes
    pub platform_sent: Arc<AtomicU64>,
    pub platform_skipped: Arc<AtomicU64>,
    pub platform_failed: Arc<AtomicU64>,
    pub platform_short_circuited: Arc<AtomicU64>,

    // side channels
    pub billing_releases: Arc<AtomicU64>,
    pub billing_release_errors: Arc<AtomicU64>,
    pub audit_dropped: Arc<AtomicU64>,
    pub audit_write_errors: Arc<AtomicU64>,
    pub bulk_write_fallbacks: Arc<AtomicU64>,
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

pub fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
