// =============================================================================
// REST usage meter — stay under the exchange's weight and order-rate caps
// =============================================================================
//
// Two budgets bind on the futures API: request weight per minute, and order
// submissions per 10 s and per minute. They are metered differently:
//
//   - Weight is whatever the exchange last reported in the
//     X-MBX-USED-WEIGHT-1M response header. A reading ages out with the
//     one-minute window it describes, so a quiet connection recovers its
//     budget without any reset timer.
//   - Order submissions are logged locally as a deque of send timestamps;
//     both caps are answered by counting the window in the log. Entries
//     older than the longest window are trimmed on every touch.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Self-imposed weight ceiling; the exchange allows 2400 per minute.
const WEIGHT_CEILING: u32 = 2000;
/// Fraction of the ceiling at which a warning is logged.
const WEIGHT_WARN_FRACTION: f64 = 0.8;
/// Lifetime of a weight reading (the exchange's reporting window).
const WEIGHT_WINDOW: Duration = Duration::from_secs(60);
/// Order submission caps per sliding window.
const ORDER_CAP_10S: usize = 300;
const ORDER_CAP_1M: usize = 1200;
const ORDER_WINDOW_SHORT: Duration = Duration::from_secs(10);
const ORDER_WINDOW_LONG: Duration = Duration::from_secs(60);

/// The last weight figure the exchange reported, and when.
struct WeightReading {
    used: u32,
    as_of: Instant,
}

/// Shared usage meter, one per REST client.
pub struct UsageMeter {
    weight_ceiling: u32,
    order_cap_10s: usize,
    order_cap_1m: usize,
    weight: Mutex<Option<WeightReading>>,
    /// Send instants of recent orders, oldest first.
    order_log: Mutex<VecDeque<Instant>>,
}

/// Point-in-time usage numbers for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub weight_used_1m: u32,
    pub orders_last_10s: usize,
    pub orders_last_minute: usize,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::with_caps(WEIGHT_CEILING, ORDER_CAP_10S, ORDER_CAP_1M)
    }

    fn with_caps(weight_ceiling: u32, order_cap_10s: usize, order_cap_1m: usize) -> Self {
        Self {
            weight_ceiling,
            order_cap_10s,
            order_cap_1m,
            weight: Mutex::new(None),
            order_log: Mutex::new(VecDeque::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Weight budget
    // -------------------------------------------------------------------------

    /// Absorb the usage headers of a response.
    pub fn observe_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(used) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };

        let warn_at = (self.weight_ceiling as f64 * WEIGHT_WARN_FRACTION) as u32;
        let mut reading = self.weight.lock();
        let previous = reading.as_ref().map(|r| r.used).unwrap_or(0);
        if used >= warn_at && previous < warn_at {
            warn!(used, ceiling = self.weight_ceiling, "request weight running hot");
        }
        *reading = Some(WeightReading {
            used,
            as_of: Instant::now(),
        });
    }

    /// Whether `cost` more weight fits under the ceiling. A reading older
    /// than the exchange's window no longer binds.
    pub fn weight_allows(&self, cost: u32) -> bool {
        let reading = self.weight.lock();
        let used = match reading.as_ref() {
            Some(r) if r.as_of.elapsed() < WEIGHT_WINDOW => r.used,
            _ => 0,
        };
        if used.saturating_add(cost) > self.weight_ceiling {
            warn!(used, cost, ceiling = self.weight_ceiling, "holding request at weight ceiling");
            return false;
        }
        true
    }

    // -------------------------------------------------------------------------
    // Order budget
    // -------------------------------------------------------------------------

    /// Whether another order submission fits both sliding windows.
    pub fn order_allows(&self) -> bool {
        let now = Instant::now();
        let mut log = self.order_log.lock();
        Self::trim(&mut log, now);

        let in_short_window = log
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= ORDER_WINDOW_SHORT)
            .count();
        if in_short_window >= self.order_cap_10s {
            warn!(sent = in_short_window, cap = self.order_cap_10s, "order budget exhausted (10 s window)");
            return false;
        }
        if log.len() >= self.order_cap_1m {
            warn!(sent = log.len(), cap = self.order_cap_1m, "order budget exhausted (1 m window)");
            return false;
        }
        true
    }

    /// Log one order send.
    pub fn note_order_sent(&self) {
        let now = Instant::now();
        let mut log = self.order_log.lock();
        Self::trim(&mut log, now);
        log.push_back(now);
    }

    fn trim(log: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = log.front() {
            if now.duration_since(*oldest) > ORDER_WINDOW_LONG {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------------

    pub fn usage(&self) -> UsageReport {
        let now = Instant::now();
        let weight_used_1m = match self.weight.lock().as_ref() {
            Some(r) if r.as_of.elapsed() < WEIGHT_WINDOW => r.used,
            _ => 0,
        };
        let log = self.order_log.lock();
        let orders_last_minute = log
            .iter()
            .filter(|t| now.duration_since(**t) <= ORDER_WINDOW_LONG)
            .count();
        let orders_last_10s = log
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= ORDER_WINDOW_SHORT)
            .count();
        UsageReport {
            weight_used_1m,
            orders_last_10s,
            orders_last_minute,
        }
    }
}

impl Default for UsageMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UsageMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let report = self.usage();
        f.debug_struct("UsageMeter")
            .field("weight_used_1m", &report.weight_used_1m)
            .field("orders_last_10s", &report.orders_last_10s)
            .field("orders_last_minute", &report.orders_last_minute)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers_with_weight(weight: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_str(weight).unwrap());
        headers
    }

    #[test]
    fn weight_binds_on_the_last_header_reading() {
        let meter = UsageMeter::with_caps(100, 10, 20);
        // No reading yet: everything under the ceiling goes through.
        assert!(meter.weight_allows(100));
        assert!(!meter.weight_allows(101));

        meter.observe_headers(&headers_with_weight("95"));
        assert!(meter.weight_allows(5));
        assert!(!meter.weight_allows(6));

        // A lower follow-up reading reopens the budget.
        meter.observe_headers(&headers_with_weight("10"));
        assert!(meter.weight_allows(80));
    }

    #[test]
    fn malformed_weight_headers_are_ignored() {
        let meter = UsageMeter::with_caps(100, 10, 20);
        meter.observe_headers(&headers_with_weight("not-a-number"));
        assert_eq!(meter.usage().weight_used_1m, 0);
        meter.observe_headers(&HeaderMap::new());
        assert!(meter.weight_allows(100));
    }

    #[test]
    fn order_budget_counts_the_sliding_window() {
        let meter = UsageMeter::with_caps(2000, 3, 5);
        for _ in 0..3 {
            assert!(meter.order_allows());
            meter.note_order_sent();
        }
        // Three sends inside 10 s exhaust the short window.
        assert!(!meter.order_allows());
        assert_eq!(meter.usage().orders_last_10s, 3);
        assert_eq!(meter.usage().orders_last_minute, 3);
    }

    #[test]
    fn long_window_cap_binds_independently() {
        let meter = UsageMeter::with_caps(2000, 1000, 4);
        for _ in 0..4 {
            meter.note_order_sent();
        }
        // The 10 s cap is far away; the 1 m cap is what refuses.
        assert!(!meter.order_allows());
    }
}
