// =============================================================================
// Bounded concurrent cache with size and TTL eviction
// =============================================================================
//
// Backs the precision memoisation in the exchange connector. Eviction is
// two-stage: expired entries are dropped first; if the map is still over
// capacity, the oldest entries go. Eviction runs inline when an insert would
// exceed capacity, so the map never grows unbounded.
// =============================================================================

use std::time::{Duration, Instant};

use dashmap::DashMap;

pub struct BoundedTtlCache<V: Clone> {
    capacity: usize,
    ttl: Duration,
    entries: DashMap<String, (V, Instant)>,
}

impl<V: Clone> BoundedTtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key)?;
        let (value, at) = entry.value();
        if at.elapsed() < self.ttl {
            Some(value.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }

    pub fn insert(&self, key: String, value: V) {
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.insert(key, (value, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, then the oldest until 10 % headroom exists.
    fn evict(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (_, at)| at.elapsed() < ttl);

        let target = self.capacity - self.capacity / 10;
        if self.entries.len() <= target {
            return;
        }

        let mut stamps: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().1))
            .collect();
        stamps.sort_by_key(|(_, at)| *at);
        let excess = stamps.len().saturating_sub(target);
        for (key, _) in stamps.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }
}

impl<V: Clone> std::fmt::Debug for BoundedTtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedTtlCache")
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_inserted_value_until_expiry() {
        let cache: BoundedTtlCache<f64> = BoundedTtlCache::new(10, Duration::from_millis(10));
        cache.insert("k".into(), 1.25);
        assert_eq!(cache.get("k"), Some(1.25));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let cache: BoundedTtlCache<u32> = BoundedTtlCache::new(20, Duration::from_secs(60));
        for i in 0..100 {
            cache.insert(format!("k{i}"), i);
        }
        assert!(cache.len() <= 20, "len={} exceeds capacity", cache.len());
    }
}
