// Result Cache
// Bounded ContentKey -> ScoreResult memo. One instance per content kind.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::models::{ContentKey, ScoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict the earliest-inserted entry regardless of reads.
    #[default]
    Fifo,
    /// Evict the least recently read or written entry.
    Lru,
}

impl EvictionPolicy {
    pub fn from_str(val: &str) -> Self {
        match val.trim().to_lowercase().as_str() {
            "lru" => Self::Lru,
            _ => Self::Fifo,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct Slot {
    result: ScoreResult,
    tick: u64,
}

/// Eviction order is kept as a tick -> key index so both policies share one path:
/// FIFO stamps a tick on insert only, LRU restamps on every hit.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    policy: EvictionPolicy,
    entries: HashMap<ContentKey, Slot>,
    order: BTreeMap<u64, ContentKey>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ResultCache {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity,
            policy,
            entries: HashMap::with_capacity(capacity.min(4096)),
            order: BTreeMap::new(),
            next_tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &ContentKey) -> Option<ScoreResult> {
        let tick = self.next_tick;
        let Some(slot) = self.entries.get_mut(key) else {
            self.misses += 1;
            return None;
        };
        self.hits += 1;
        if self.policy == EvictionPolicy::Lru {
            self.order.remove(&slot.tick);
            self.order.insert(tick, key.clone());
            slot.tick = tick;
            self.next_tick += 1;
        }
        Some(slot.result.clone())
    }

    /// Last writer wins for an existing key. Under FIFO the original insertion
    /// position is kept.
    pub fn put(&mut self, key: ContentKey, result: ScoreResult) {
        if self.capacity == 0 {
            return;
        }

        if let Some(slot) = self.entries.get_mut(&key) {
            slot.result = result;
            if self.policy == EvictionPolicy::Lru {
                self.order.remove(&slot.tick);
                self.order.insert(self.next_tick, key);
                slot.tick = self.next_tick;
                self.next_tick += 1;
            }
            return;
        }

        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.evictions += 1;
            tracing::trace!("[CACHE] evicted key={}", oldest);
        }

        let tick = self.next_tick;
        self.next_tick += 1;
        self.order.insert(tick, key.clone());
        self.entries.insert(key, Slot { result, tick });
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            size: self.entries.len(),
            capacity: self.capacity,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeatureVector, ScoreSource};

    fn key(n: usize) -> ContentKey {
        ContentKey::for_text(&format!("paragraph number {} with some filler words", n))
    }

    fn result(score: f64) -> ScoreResult {
        ScoreResult {
            score,
            confidence: 0.8,
            features: FeatureVector::new(),
            source: ScoreSource::Local,
        }
    }

    #[test]
    fn test_round_trip() {
        let mut cache = ResultCache::new(4, EvictionPolicy::Fifo);
        cache.put(key(1), result(0.4));
        assert_eq!(cache.get(&key(1)), Some(result(0.4)));
        assert_eq!(cache.get(&key(2)), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fifo_evicts_first_inserted_after_capacity_plus_one() {
        let capacity = 5;
        let mut cache = ResultCache::new(capacity, EvictionPolicy::Fifo);
        for n in 0..=capacity {
            cache.put(key(n), result(0.1));
            // reads must not protect an entry under FIFO
            cache.get(&key(0));
        }
        assert_eq!(cache.len(), capacity);
        assert!(!cache.contains(&key(0)));
        assert!(cache.contains(&key(capacity)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lru_keeps_recently_read_entry() {
        let mut cache = ResultCache::new(3, EvictionPolicy::Lru);
        cache.put(key(0), result(0.1));
        cache.put(key(1), result(0.2));
        cache.put(key(2), result(0.3));
        assert!(cache.get(&key(0)).is_some());
        cache.put(key(3), result(0.4));
        assert!(cache.contains(&key(0)));
        assert!(!cache.contains(&key(1)));
    }

    #[test]
    fn test_overwrite_is_last_writer_wins() {
        let mut cache = ResultCache::new(2, EvictionPolicy::Fifo);
        cache.put(key(0), result(0.1));
        cache.put(key(0), result(0.9));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key(0)).map(|r| r.score), Some(0.9));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut cache = ResultCache::new(0, EvictionPolicy::from_str("lru"));
        cache.put(key(0), result(0.1));
        assert!(cache.is_empty());
    }
}
