//! Bounded, TTL'd dedupe cache.
//!
//! Collapses duplicate inbound deliveries and backs idempotency keys for
//! chat-send requests. A periodic sweep (driven by the server's background
//! task, independent of request traffic) purges expired entries first, then
//! evicts oldest-first until the cache is back under its cap.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const DEFAULT_DEDUPE_TTL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_DEDUPE_MAX_ENTRIES: usize = 2000;

pub struct DedupeCache {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupeCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Whether `key` was remembered within the TTL window.
    pub fn seen(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(inserted) => inserted.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Record `key` as seen now. Re-remembering refreshes the timestamp.
    pub fn remember(&self, key: &str) {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), Instant::now());
        // Opportunistic hard cap between sweeps: a burst of unique keys must
        // not grow the map unboundedly while waiting for the timer.
        if entries.len() > self.max_entries * 2 {
            Self::evict_oldest(&mut entries, self.max_entries);
        }
    }

    /// TTL purge, then oldest-first eviction down to the cap.
    pub fn sweep(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|_, inserted| inserted.elapsed() < self.ttl);
        if entries.len() > self.max_entries {
            Self::evict_oldest(&mut entries, self.max_entries);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn evict_oldest(entries: &mut HashMap<String, Instant>, target: usize) {
        let excess = entries.len().saturating_sub(target);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<(String, Instant)> = entries
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        by_age.sort_by_key(|(_, inserted)| *inserted);
        for (key, _) in by_age.into_iter().take(excess) {
            entries.remove(&key);
        }
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_DEDUPE_TTL_MS),
            DEFAULT_DEDUPE_MAX_ENTRIES,
        )
    }
}
