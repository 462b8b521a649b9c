// =============================================================================
// Price Cache & Event Bus — live top-of-book and mark prices, per-symbol pub/sub
// =============================================================================
//
// Single-writer (the exchange connector), many-reader. Readers tolerate stale
// values; staleness is answered from a monotonic clock. Emission is throttled
// per symbol: subscribers never see more than one tick per 50 ms for the same
// symbol. Timestamps are not comparable across symbols.
// =============================================================================

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

/// Minimum gap between two `price` events for one symbol.
const EMIT_INTERVAL: Duration = Duration::from_millis(50);
/// Per-symbol fan-out queue depth. Laggards lose the oldest ticks.
const CHANNEL_CAPACITY: usize = 64;

/// A published price event. Carries the whole snapshot so consumers pick the
/// fields they care about (engines use mark, chases use bid/ask).
#[derive(Debug, Clone, Serialize)]
pub struct PriceTick {
    pub symbol: String,
    pub mark: f64,
    pub bid: f64,
    pub ask: f64,
    pub ts_ms: i64,
}

/// Latest known prices for one symbol.
#[derive(Debug, Clone)]
pub struct PriceSnapshot {
    pub mark: f64,
    pub bid: f64,
    pub ask: f64,
    pub last_tick: Instant,
    pub last_tick_ms: i64,
    last_emit: Option<Instant>,
    last_cache_write: Option<Instant>,
}

impl PriceSnapshot {
    fn new() -> Self {
        Self {
            mark: 0.0,
            bid: 0.0,
            ask: 0.0,
            last_tick: Instant::now(),
            last_tick_ms: crate::types::now_ms(),
            last_emit: None,
            last_cache_write: None,
        }
    }
}

/// Process-wide symbol → snapshot map plus per-symbol broadcast channels.
pub struct PriceCache {
    snapshots: DashMap<String, PriceSnapshot>,
    channels: DashMap<String, broadcast::Sender<PriceTick>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            snapshots: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Writer side (connector only)
    // -------------------------------------------------------------------------

    /// Ingest a mark-price update.
    pub fn ingest_mark(&self, symbol: &str, mark: f64) {
        if mark <= 0.0 {
            warn!(symbol, mark, "discarding non-positive mark price");
            return;
        }
        self.ingest(symbol, |s| s.mark = mark);
    }

    /// Ingest a top-of-book update.
    pub fn ingest_book(&self, symbol: &str, bid: f64, ask: f64) {
        if bid <= 0.0 || ask <= 0.0 || bid > ask {
            warn!(symbol, bid, ask, "discarding inconsistent book tick");
            return;
        }
        self.ingest(symbol, |s| {
            s.bid = bid;
            s.ask = ask;
        });
    }

    fn ingest(&self, symbol: &str, apply: impl FnOnce(&mut PriceSnapshot)) {
        let now = Instant::now();
        let mut entry = self
            .snapshots
            .entry(symbol.to_string())
            .or_insert_with(PriceSnapshot::new);
        apply(&mut entry);
        entry.last_tick = now;
        entry.last_tick_ms = crate::types::now_ms();

        // Emit throttle: one event per symbol per EMIT_INTERVAL.
        let due = match entry.last_emit {
            Some(prev) => now.duration_since(prev) >= EMIT_INTERVAL,
            None => true,
        };
        if !due {
            return;
        }

        let tick = PriceTick {
            symbol: symbol.to_string(),
            mark: entry.mark,
            bid: entry.bid,
            ask: entry.ask,
            ts_ms: entry.last_tick_ms,
        };
        entry.last_emit = Some(now);
        drop(entry);

        if let Some(tx) = self.channels.get(symbol) {
            // Lagging receivers drop oldest ticks; that is fine for prices.
            let _ = tx.send(tick);
        }
    }

    /// Whether the throttled external-cache write for `symbol` is due, arming
    /// the timer when it is.
    pub fn external_write_due(&self, symbol: &str, interval: Duration) -> bool {
        let mut entry = match self.snapshots.get_mut(symbol) {
            Some(e) => e,
            None => return false,
        };
        let now = Instant::now();
        let due = match entry.last_cache_write {
            Some(prev) => now.duration_since(prev) >= interval,
            None => true,
        };
        if due {
            entry.last_cache_write = Some(now);
        }
        due
    }

    // -------------------------------------------------------------------------
    // Reader side
    // -------------------------------------------------------------------------

    /// Subscribe to price events for one symbol.
    pub fn subscribe(&self, symbol: &str) -> broadcast::Receiver<PriceTick> {
        self.channels
            .entry(symbol.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Best bid/ask, if both sides are known.
    pub fn quote(&self, symbol: &str) -> Option<(f64, f64)> {
        let s = self.snapshots.get(symbol)?;
        if s.bid > 0.0 && s.ask > 0.0 {
            Some((s.bid, s.ask))
        } else {
            None
        }
    }

    /// Latest mark price, if known.
    pub fn mark(&self, symbol: &str) -> Option<f64> {
        let s = self.snapshots.get(symbol)?;
        if s.mark > 0.0 {
            Some(s.mark)
        } else {
            None
        }
    }

    /// Age of the last tick for `symbol`.
    pub fn tick_age(&self, symbol: &str) -> Option<Duration> {
        self.snapshots.get(symbol).map(|s| s.last_tick.elapsed())
    }

    /// JSON payload written to the external price cache.
    pub fn snapshot_json(&self, symbol: &str) -> Option<serde_json::Value> {
        let s = self.snapshots.get(symbol)?;
        Some(serde_json::json!({
            "symbol": symbol,
            "mark": s.mark,
            "bid": s.bid,
            "ask": s.ask,
            "ts": s.last_tick_ms,
        }))
    }

    /// Drop channels nobody listens to any more.
    pub fn prune_idle_channels(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceCache")
            .field("symbols", &self.snapshots.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_requires_both_sides() {
        let cache = PriceCache::new();
        assert_eq!(cache.quote("BTC/USDT:USDT"), None);
        cache.ingest_book("BTC/USDT:USDT", 100.0, 100.02);
        assert_eq!(cache.quote("BTC/USDT:USDT"), Some((100.0, 100.02)));
    }

    #[test]
    fn inconsistent_book_is_discarded() {
        let cache = PriceCache::new();
        cache.ingest_book("X/USDT:USDT", 101.0, 100.0); // crossed
        assert_eq!(cache.quote("X/USDT:USDT"), None);
        cache.ingest_mark("X/USDT:USDT", -5.0);
        assert_eq!(cache.mark("X/USDT:USDT"), None);
    }

    #[tokio::test]
    async fn emission_is_throttled_per_symbol() {
        let cache = PriceCache::new();
        let mut rx = cache.subscribe("ETH/USDT:USDT");

        // Burst of updates inside one throttle window -> exactly one event.
        for i in 0..10 {
            cache.ingest_mark("ETH/USDT:USDT", 2000.0 + i as f64);
        }
        let first = rx.try_recv().expect("first tick should be emitted");
        assert_eq!(first.mark, 2000.0);
        assert!(rx.try_recv().is_err(), "second tick inside 50 ms window");

        // After the window, the next update emits again.
        std::thread::sleep(Duration::from_millis(60));
        cache.ingest_mark("ETH/USDT:USDT", 2100.0);
        let second = rx.try_recv().expect("tick after throttle window");
        assert_eq!(second.mark, 2100.0);
    }

    #[test]
    fn external_write_throttle_arms_on_success() {
        let cache = PriceCache::new();
        cache.ingest_mark("S/USDT:USDT", 1.0);
        assert!(cache.external_write_due("S/USDT:USDT", Duration::from_millis(500)));
        assert!(!cache.external_write_due("S/USDT:USDT", Duration::from_millis(500)));
    }
}
