//! Expiry/LRU bookkeeping: `touch`, `insert`, `clr` from spec §6, plus the
//! `lru_timeout`-gated touch throttling `prepresp` and `streambody` call
//! out to explicitly. Grounded in the sweep-on-tick style of the teacher's
//! connection-timeout pass (a `retain` over a map of deadlines).

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct ExpRecord {
    pub entered: Instant,
    pub ttl: Duration,
    pub grace: Duration,
    pub keep: Duration,
}

impl ExpRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.entered) > self.ttl + self.grace
    }
}

#[derive(Debug)]
struct Entry {
    exp: ExpRecord,
    last_lru: Instant,
    last_use: Instant,
}

#[derive(Debug, Default)]
pub struct ExpiryEngine {
    entries: HashMap<[u8; 32], Entry>,
}

impl ExpiryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, digest: [u8; 32], exp: ExpRecord) {
        let now = Instant::now();
        self.entries.insert(
            digest,
            Entry {
                exp,
                last_lru: now,
                last_use: now,
            },
        );
    }

    pub fn clr(&mut self, digest: &[u8; 32]) {
        self.entries.remove(digest);
    }

    /// Update `last_use` unconditionally, and `last_lru` only if
    /// `lru_timeout` has elapsed since the last touch — the throttling
    /// `prepresp` is required to apply before touching the LRU list.
    pub fn touch(&mut self, digest: &[u8; 32], lru_timeout: Duration) -> bool {
        let now = Instant::now();
        let Some(entry) = self.entries.get_mut(digest) else {
            return false;
        };
        entry.last_use = now;
        if now.duration_since(entry.last_lru) >= lru_timeout {
            entry.last_lru = now;
            true
        } else {
            false
        }
    }

    pub fn is_expired(&self, digest: &[u8; 32]) -> bool {
        match self.entries.get(digest) {
            Some(entry) => entry.exp.is_expired(Instant::now()),
            None => true,
        }
    }

    /// Drops every expired entry from this engine's own bookkeeping and
    /// hands back their digests, so the caller can also evict the matching
    /// `Cache` entry and release its `Storage` reservation — this engine
    /// tracks expiry deadlines only, it has no view of the object table.
    pub fn sweep_expired(&mut self) -> Vec<[u8; 32]> {
        let now = Instant::now();
        let expired: Vec<[u8; 32]> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.exp.is_expired(now))
            .map(|(digest, _)| *digest)
            .collect();
        for digest in &expired {
            self.entries.remove(digest);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_throttles_lru_update() {
        let mut engine = ExpiryEngine::new();
        let digest = [1u8; 32];
        engine.insert(
            digest,
            ExpRecord {
                entered: Instant::now(),
                ttl: Duration::from_secs(60),
                grace: Duration::ZERO,
                keep: Duration::ZERO,
            },
        );
        assert!(engine.touch(&digest, Duration::from_secs(0)));
        assert!(!engine.touch(&digest, Duration::from_secs(3600)));
    }

    #[test]
    fn expired_entries_are_swept() {
        let mut engine = ExpiryEngine::new();
        let digest = [2u8; 32];
        engine.insert(
            digest,
            ExpRecord {
                entered: Instant::now() - Duration::from_secs(120),
                ttl: Duration::from_secs(1),
                grace: Duration::ZERO,
                keep: Duration::ZERO,
            },
        );
        engine.sweep_expired();
        assert!(engine.is_expired(&digest));
    }
}
