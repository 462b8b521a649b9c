// =============================================================================
// Symbol metadata — canonical/raw maps, precision, filters
// =============================================================================
//
// Canonical form is `BASE/QUOTE:SETTLE` (e.g. `BTC/USDT:USDT`); raw form is
// the exchange's concatenated symbol (`BTCUSDT`). Both directions are needed:
// engines speak canonical, the wire speaks raw.
//
// Precision rounding is memoised in a bounded TTL cache: repeated chase
// reprices round the same handful of values thousands of times per minute.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::types::RoundMode;
use crate::util::cache::BoundedTtlCache;

/// Precision cache sizing.
const PRECISION_CACHE_CAPACITY: usize = 6000;
const PRECISION_CACHE_TTL: Duration = Duration::from_secs(120);

/// Static and dynamic trading constraints for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolMeta {
    pub canonical: String,
    pub raw: String,
    /// LOT_SIZE step.
    pub amount_step: f64,
    /// PRICE_FILTER tick.
    pub price_tick: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub min_notional: f64,
    /// PERCENT_PRICE bounds around mark price.
    pub multiplier_up: f64,
    pub multiplier_down: f64,
}

/// Bidirectional symbol table with precision helpers.
pub struct SymbolTable {
    by_canonical: DashMap<String, SymbolMeta>,
    raw_to_canonical: DashMap<String, String>,
    precision_cache: BoundedTtlCache<f64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            by_canonical: DashMap::new(),
            raw_to_canonical: DashMap::new(),
            precision_cache: BoundedTtlCache::new(PRECISION_CACHE_CAPACITY, PRECISION_CACHE_TTL),
        }
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Rebuild the table from an exchangeInfo payload. Returns the number of
    /// perpetual symbols loaded.
    pub fn load_exchange_info(&self, info: &serde_json::Value) -> Result<usize> {
        let symbols = info["symbols"]
            .as_array()
            .context("exchangeInfo missing 'symbols' array")?;

        let mut loaded = 0;
        for entry in symbols {
            if entry["contractType"].as_str() != Some("PERPETUAL") {
                continue;
            }
            if entry["status"].as_str() != Some("TRADING") {
                continue;
            }
            let Some(meta) = Self::parse_symbol(entry) else {
                debug!(symbol = ?entry["symbol"], "skipping malformed symbol entry");
                continue;
            };
            self.raw_to_canonical
                .insert(meta.raw.clone(), meta.canonical.clone());
            self.by_canonical.insert(meta.canonical.clone(), meta);
            loaded += 1;
        }

        info!(symbols = loaded, "symbol table loaded");
        Ok(loaded)
    }

    fn parse_symbol(entry: &serde_json::Value) -> Option<SymbolMeta> {
        let raw = entry["symbol"].as_str()?.to_string();
        let base = entry["baseAsset"].as_str()?;
        let quote = entry["quoteAsset"].as_str()?;
        let settle = entry["marginAsset"].as_str().unwrap_or(quote);
        let canonical = format!("{base}/{quote}:{settle}");

        let mut meta = SymbolMeta {
            canonical,
            raw,
            amount_step: 0.0,
            price_tick: 0.0,
            min_qty: 0.0,
            max_qty: f64::MAX,
            min_price: 0.0,
            max_price: f64::MAX,
            min_notional: 5.0,
            multiplier_up: 0.0,
            multiplier_down: 0.0,
        };

        for filter in entry["filters"].as_array()? {
            match filter["filterType"].as_str() {
                Some("PRICE_FILTER") => {
                    meta.price_tick = str_f64(&filter["tickSize"])?;
                    meta.min_price = str_f64(&filter["minPrice"])?;
                    meta.max_price = str_f64(&filter["maxPrice"])?;
                }
                Some("LOT_SIZE") => {
                    meta.amount_step = str_f64(&filter["stepSize"])?;
                    meta.min_qty = str_f64(&filter["minQty"])?;
                    meta.max_qty = str_f64(&filter["maxQty"])?;
                }
                Some("MIN_NOTIONAL") => {
                    if let Some(n) = str_f64(&filter["notional"]) {
                        meta.min_notional = n;
                    }
                }
                Some("PERCENT_PRICE") => {
                    meta.multiplier_up = str_f64(&filter["multiplierUp"]).unwrap_or(0.0);
                    meta.multiplier_down = str_f64(&filter["multiplierDown"]).unwrap_or(0.0);
                }
                _ => {}
            }
        }

        if meta.amount_step <= 0.0 || meta.price_tick <= 0.0 {
            return None;
        }
        Some(meta)
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn meta(&self, canonical: &str) -> Option<SymbolMeta> {
        self.by_canonical.get(canonical).map(|m| m.clone())
    }

    pub fn to_raw(&self, canonical: &str) -> Option<String> {
        self.by_canonical.get(canonical).map(|m| m.raw.clone())
    }

    pub fn to_canonical(&self, raw: &str) -> Option<String> {
        self.raw_to_canonical.get(raw).map(|c| c.clone())
    }

    pub fn len(&self) -> usize {
        self.by_canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_canonical.is_empty()
    }

    // -------------------------------------------------------------------------
    // Precision
    // -------------------------------------------------------------------------

    /// Round an amount to the symbol's lot step.
    pub fn amount_to_precision(&self, canonical: &str, x: f64, mode: RoundMode) -> Option<f64> {
        let key = format!("a:{canonical}:{x:.12}:{mode:?}");
        if let Some(v) = self.precision_cache.get(&key) {
            return Some(v);
        }
        let meta = self.by_canonical.get(canonical)?;
        let rounded = round_to_step(x, meta.amount_step, mode);
        self.precision_cache.insert(key, rounded);
        Some(rounded)
    }

    /// Round a price to the symbol's tick.
    pub fn price_to_precision(&self, canonical: &str, x: f64, mode: RoundMode) -> Option<f64> {
        let key = format!("p:{canonical}:{x:.12}:{mode:?}");
        if let Some(v) = self.precision_cache.get(&key) {
            return Some(v);
        }
        let meta = self.by_canonical.get(canonical)?;
        let rounded = round_to_step(x, meta.price_tick, mode);
        self.precision_cache.insert(key, rounded);
        Some(rounded)
    }

    /// Clamp a price to the static PRICE_FILTER band and, when a mark price is
    /// available, the dynamic PERCENT_PRICE band around it.
    pub fn clamp_price(&self, canonical: &str, price: f64, mark: Option<f64>) -> Option<f64> {
        let meta = self.by_canonical.get(canonical)?;
        let mut clamped = price.clamp(meta.min_price, meta.max_price);
        if let Some(mark) = mark {
            if mark > 0.0 && meta.multiplier_down > 0.0 && meta.multiplier_up > 0.0 {
                clamped = clamped.clamp(mark * meta.multiplier_down, mark * meta.multiplier_up);
            }
        }
        Some(clamped)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable")
            .field("symbols", &self.by_canonical.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Rounding helpers
// ---------------------------------------------------------------------------

/// Round `x` to a multiple of `step`, normalising float artifacts to the
/// step's decimal places.
pub fn round_to_step(x: f64, step: f64, mode: RoundMode) -> f64 {
    if step <= 0.0 {
        return x;
    }
    // A hair of tolerance so 0.07/0.01 = 6.999999... floors to 7, not 6.
    let units = x / step;
    let eps: f64 = 1e-9;
    let n = match mode {
        RoundMode::Nearest => (units + eps.copysign(units)).round(),
        RoundMode::Floor => (units + eps).floor(),
        RoundMode::Ceil => (units - eps).ceil(),
    };
    let raw = n * step;
    let decimals = step_decimals(step);
    let factor = 10f64.powi(decimals as i32);
    (raw * factor).round() / factor
}

/// Number of decimal places needed to represent `step` exactly (capped at 12).
fn step_decimals(step: f64) -> u32 {
    for d in 0..=12u32 {
        let scaled = step * 10f64.powi(d as i32);
        if (scaled - scaled.round()).abs() < 1e-9 {
            return d;
        }
    }
    12
}

fn str_f64(v: &serde_json::Value) -> Option<f64> {
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_f64()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> serde_json::Value {
        serde_json::json!({
            "symbols": [{
                "symbol": "BTCUSDT",
                "baseAsset": "BTC",
                "quoteAsset": "USDT",
                "marginAsset": "USDT",
                "contractType": "PERPETUAL",
                "status": "TRADING",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80", "maxPrice": "4529764"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                    {"filterType": "MIN_NOTIONAL", "notional": "5"},
                    {"filterType": "PERCENT_PRICE", "multiplierUp": "1.05", "multiplierDown": "0.95"}
                ]
            }, {
                "symbol": "DOGEUSDT",
                "baseAsset": "DOGE",
                "quoteAsset": "USDT",
                "marginAsset": "USDT",
                "contractType": "PERPETUAL",
                "status": "TRADING",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.000010", "minPrice": "0.000200", "maxPrice": "30"},
                    {"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1", "maxQty": "10000000"},
                    {"filterType": "MIN_NOTIONAL", "notional": "5"}
                ]
            }]
        })
    }

    #[test]
    fn loads_maps_in_both_directions() {
        let table = SymbolTable::new();
        assert_eq!(table.load_exchange_info(&sample_info()).unwrap(), 2);
        assert_eq!(table.to_raw("BTC/USDT:USDT"), Some("BTCUSDT".to_string()));
        assert_eq!(table.to_canonical("BTCUSDT"), Some("BTC/USDT:USDT".to_string()));
        assert_eq!(table.to_canonical("NOPEUSDT"), None);
        let meta = table.meta("BTC/USDT:USDT").unwrap();
        assert_eq!(meta.min_notional, 5.0);
        assert_eq!(meta.multiplier_up, 1.05);
    }

    #[test]
    fn rounding_modes_respect_the_step() {
        assert_eq!(round_to_step(100.017, 0.01, RoundMode::Nearest), 100.02);
        assert_eq!(round_to_step(100.017, 0.01, RoundMode::Floor), 100.01);
        assert_eq!(round_to_step(100.011, 0.01, RoundMode::Ceil), 100.02);
        // Exact multiples are untouched in every mode.
        assert_eq!(round_to_step(0.07, 0.01, RoundMode::Floor), 0.07);
        assert_eq!(round_to_step(0.07, 0.01, RoundMode::Ceil), 0.07);
        // Integer steps.
        assert_eq!(round_to_step(17.6, 1.0, RoundMode::Floor), 17.0);
    }

    #[test]
    fn precision_ops_round_and_cache() {
        let table = SymbolTable::new();
        table.load_exchange_info(&sample_info()).unwrap();
        assert_eq!(
            table.amount_to_precision("BTC/USDT:USDT", 0.0014, RoundMode::Floor),
            Some(0.001)
        );
        // Second call hits the cache and must agree.
        assert_eq!(
            table.amount_to_precision("BTC/USDT:USDT", 0.0014, RoundMode::Floor),
            Some(0.001)
        );
        assert_eq!(
            table.price_to_precision("BTC/USDT:USDT", 50000.17, RoundMode::Nearest),
            Some(50000.2)
        );
        assert_eq!(
            table.price_to_precision("DOGE/USDT:USDT", 0.0712345, RoundMode::Floor),
            Some(0.07123)
        );
    }

    #[test]
    fn clamp_applies_static_and_dynamic_bands() {
        let table = SymbolTable::new();
        table.load_exchange_info(&sample_info()).unwrap();
        // Static floor.
        assert_eq!(
            table.clamp_price("BTC/USDT:USDT", 100.0, None),
            Some(556.80)
        );
        // Dynamic band around mark.
        assert_eq!(
            table.clamp_price("BTC/USDT:USDT", 60000.0, Some(50000.0)),
            Some(52500.0)
        );
        assert_eq!(
            table.clamp_price("BTC/USDT:USDT", 40000.0, Some(50000.0)),
            Some(47500.0)
        );
    }
}
