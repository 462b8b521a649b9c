// =============================================================================
// TTL map + advisory lock table
// =============================================================================
//
// `TtlMap` replaces ad-hoc "insert into a set, spawn a delayed task to remove"
// dedup patterns: entries expire by timestamp and are purged lazily on access
// plus by an optional background sweep.
//
// `LockTable` provides symbol-scoped advisory locks with a TTL, used by the
// reconciler to serialise orphan reconciliation against stream-driven updates.
// =============================================================================

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A concurrent set of keys that expire after a fixed TTL.
pub struct TtlMap {
    ttl: Duration,
    entries: DashMap<String, Instant>,
}

impl TtlMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Insert `key`, returning `true` if it was absent (or expired).
    /// Returning `false` means the key is a recent duplicate.
    pub fn insert(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut fresh = true;
        self.entries
            .entry(key.to_string())
            .and_modify(|at| {
                if now.duration_since(*at) < self.ttl {
                    fresh = false;
                } else {
                    *at = now;
                }
            })
            .or_insert(now);
        fresh
    }

    /// Whether `key` is present and unexpired.
    pub fn contains(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every expired entry. Called by the owner's periodic sweep.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, at| at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for TtlMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlMap")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Advisory locks
// ---------------------------------------------------------------------------

/// Symbol-scoped advisory locks with expiry. Non-blocking: `try_acquire`
/// either takes the lock or reports the holder.
pub struct LockTable {
    ttl: Duration,
    locks: DashMap<String, (String, Instant)>,
}

impl LockTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            locks: DashMap::new(),
        }
    }

    /// Try to take the lock on `key` for `holder`. An expired lock is stolen.
    pub fn try_acquire(&self, key: &str, holder: &str) -> Result<(), String> {
        let now = Instant::now();
        let mut taken = Ok(());
        self.locks
            .entry(key.to_string())
            .and_modify(|(owner, at)| {
                if now.duration_since(*at) < self.ttl && owner != holder {
                    taken = Err(owner.clone());
                } else {
                    *owner = holder.to_string();
                    *at = now;
                }
            })
            .or_insert_with(|| (holder.to_string(), now));
        taken
    }

    /// Release the lock if `holder` still owns it.
    pub fn release(&self, key: &str, holder: &str) {
        self.locks
            .remove_if(key, |_, (owner, _)| owner == holder);
    }

    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        self.locks.retain(|_, (_, at)| at.elapsed() < ttl);
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("ttl", &self.ttl)
            .field("held", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_ttl_is_rejected() {
        let map = TtlMap::new(Duration::from_secs(30));
        assert!(map.insert("order-1"));
        assert!(!map.insert("order-1"));
        assert!(map.contains("order-1"));
        assert!(map.insert("order-2"));
    }

    #[test]
    fn expired_entries_are_reusable_and_evictable() {
        let map = TtlMap::new(Duration::from_millis(5));
        assert!(map.insert("k"));
        std::thread::sleep(Duration::from_millis(10));
        assert!(!map.contains("k"));
        assert!(map.insert("k"));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(map.evict_expired(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let locks = LockTable::new(Duration::from_secs(30));
        assert!(locks.try_acquire("BTC/USDT:USDT", "cycle-a").is_ok());
        assert_eq!(
            locks.try_acquire("BTC/USDT:USDT", "cycle-b"),
            Err("cycle-a".to_string())
        );
        // Re-entrant for the same holder.
        assert!(locks.try_acquire("BTC/USDT:USDT", "cycle-a").is_ok());
        locks.release("BTC/USDT:USDT", "cycle-a");
        assert!(locks.try_acquire("BTC/USDT:USDT", "cycle-b").is_ok());
    }

    #[test]
    fn expired_lock_is_stolen() {
        let locks = LockTable::new(Duration::from_millis(5));
        assert!(locks.try_acquire("sym", "a").is_ok());
        std::thread::sleep(Duration::from_millis(10));
        assert!(locks.try_acquire("sym", "b").is_ok());
    }
}
