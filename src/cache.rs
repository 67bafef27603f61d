//! A short-TTL, single-value-per-key read cache used to damp hot reads
//! during fetch/scan bursts (spec §4.D, §5). Purely an optimization:
//! correctness of the center or the pool never depends on a hit or a miss
//! here — on a miss the caller simply re-reads the store.
//!
//! Generalizes the teacher's per-purpose `SampleCacheStore`/`ResponseCacher`
//! pair into one keyed cache, since this crate needs the same staleness
//! check (`saved_at + ttl > now`) for more than one kind of value
//! (`keys_matching` results in the center, `zrange` results in the pool).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    saved_at: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Returns a cached value if present and not yet stale as of `now`.
    pub fn get(&self, key: &K, now: Instant) -> Option<V> {
        self.entries.get(key).and_then(|entry| {
            if now.checked_duration_since(entry.saved_at).unwrap_or_default() < self.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(key, Entry { value, saved_at: now });
    }
}
