//! Per-process counters, the load-bearing subset of a real statistics ring.
//! Incremented from the session handlers at the points named in spec §8's
//! scenario list (cache_hitpass on hit-for-pass, etc).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    pub sess_closed: AtomicU64,
    pub cache_hit: AtomicU64,
    pub cache_miss: AtomicU64,
    pub cache_hitpass: AtomicU64,
    pub backend_fetch: AtomicU64,
    pub backend_fail: AtomicU64,
    pub restarts: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sess_closed: self.sess_closed.load(Ordering::Relaxed),
            cache_hit: self.cache_hit.load(Ordering::Relaxed),
            cache_miss: self.cache_miss.load(Ordering::Relaxed),
            cache_hitpass: self.cache_hitpass.load(Ordering::Relaxed),
            backend_fetch: self.backend_fetch.load(Ordering::Relaxed),
            backend_fail: self.backend_fail.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub sess_closed: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
    pub cache_hitpass: u64,
    pub backend_fetch: u64,
    pub backend_fail: u64,
    pub restarts: u64,
}
