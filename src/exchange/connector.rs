// =============================================================================
// Exchange Connector — the only component that touches the exchange
// =============================================================================
//
// Facade over the signed REST client, the symbol table, and the market-data
// streams. Adds the order-path concurrency controls:
//
//   - an order-slot semaphore (10 in-flight order operations), held RAII
//     across every order REST call;
//   - a circuit breaker on order placement only: five consecutive failures
//     open it for 30 s; the next success closes it. Reads and cancels are
//     never gated (cancels must work while the breaker is open).
//
// Price fanout: every stream tick updates the price cache (which throttles
// emission to 50 ms per symbol) and, at most every 500 ms per symbol, writes
// the latest snapshot into the external price cache.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::errors::{GatewayError, GatewayResult};
use crate::exchange::client::{OrderRequest, RestClient};
use crate::exchange::meta::SymbolTable;
use crate::exchange::streams::{MarketDataSink, StreamManager};
use crate::price_cache::PriceCache;
use crate::snapshots::SnapshotStore;
use crate::types::RoundMode;

/// Maximum concurrent in-flight order operations.
const ORDER_SLOTS: usize = 10;
/// Consecutive order failures that open the breaker.
const BREAKER_THRESHOLD: u32 = 5;
/// How long an open breaker rejects order submissions.
const BREAKER_OPEN_FOR: Duration = Duration::from_secs(30);
/// Bootstrap retry backoff bounds.
const BOOTSTRAP_BACKOFF_FLOOR: Duration = Duration::from_secs(5);
const BOOTSTRAP_BACKOFF_CEILING: Duration = Duration::from_secs(30 * 60);
/// Throttle for external price-cache writes, per symbol.
const EXTERNAL_CACHE_INTERVAL: Duration = Duration::from_millis(500);
/// TTL on external price-cache entries.
const EXTERNAL_CACHE_TTL_SECS: i64 = 60;

/// Optional transaction-cost-analysis sink, injected after init.
pub trait TcaSink: Send + Sync {
    fn record_execution(&self, symbol: &str, side: &str, intended_price: f64, fill_price: f64, qty: f64);
}

// ---------------------------------------------------------------------------
// Circuit breaker (order placement only)
// ---------------------------------------------------------------------------

struct OrderCircuitBreaker {
    consecutive_failures: AtomicU32,
    open_until: Mutex<Option<Instant>>,
}

impl OrderCircuitBreaker {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            open_until: Mutex::new(None),
        }
    }

    fn check(&self) -> GatewayResult<()> {
        if let Some(until) = *self.open_until.lock() {
            if Instant::now() < until {
                return Err(GatewayError::CircuitOpen);
            }
        }
        Ok(())
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.open_until.lock() = None;
    }

    fn record_failure(&self) {
        let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= BREAKER_THRESHOLD {
            warn!(failures = n, "order circuit breaker opened");
            *self.open_until.lock() = Some(Instant::now() + BREAKER_OPEN_FOR);
        }
    }

    fn is_open(&self) -> bool {
        self.check().is_err()
    }
}

// ---------------------------------------------------------------------------
// Market-data sink: streams -> price cache -> external cache
// ---------------------------------------------------------------------------

struct ConnectorSink {
    meta: Arc<SymbolTable>,
    prices: Arc<PriceCache>,
    external: SnapshotStore,
}

impl ConnectorSink {
    fn maybe_write_external(&self, canonical: &str) {
        if !self
            .prices
            .external_write_due(canonical, EXTERNAL_CACHE_INTERVAL)
        {
            return;
        }
        let Some(json) = self.prices.snapshot_json(canonical) else {
            return;
        };
        let store = self.external.clone();
        let key = format!("price:{canonical}");
        tokio::spawn(async move {
            if let Err(e) = store.set(&key, &json.to_string(), EXTERNAL_CACHE_TTL_SECS).await {
                // Non-fatal: the external cache is best-effort.
                debug!(key = %key, error = %e, "external price-cache write failed");
            }
        });
    }
}

impl MarketDataSink for ConnectorSink {
    fn on_mark(&self, raw_symbol: &str, mark: f64) {
        let Some(canonical) = self.meta.to_canonical(raw_symbol) else {
            return;
        };
        self.prices.ingest_mark(&canonical, mark);
        self.maybe_write_external(&canonical);
    }

    fn on_book(&self, raw_symbol: &str, bid: f64, ask: f64) {
        let Some(canonical) = self.meta.to_canonical(raw_symbol) else {
            return;
        };
        self.prices.ingest_book(&canonical, bid, ask);
        self.maybe_write_external(&canonical);
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct ExchangeConnector {
    client: RestClient,
    pub meta: Arc<SymbolTable>,
    streams: StreamManager,
    prices: Arc<PriceCache>,
    order_slots: Arc<Semaphore>,
    breaker: OrderCircuitBreaker,
    ready: AtomicBool,
    tca: Mutex<Option<Arc<dyn TcaSink>>>,
}

impl ExchangeConnector {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        rest_base: impl Into<String>,
        ws_base: impl Into<String>,
        prices: Arc<PriceCache>,
        external: SnapshotStore,
    ) -> Self {
        let meta = Arc::new(SymbolTable::new());
        let sink = Arc::new(ConnectorSink {
            meta: meta.clone(),
            prices: prices.clone(),
            external,
        });
        Self {
            client: RestClient::new(api_key, api_secret, rest_base),
            meta,
            streams: StreamManager::new(ws_base, sink),
            prices,
            order_slots: Arc::new(Semaphore::new(ORDER_SLOTS)),
            breaker: OrderCircuitBreaker::new(),
            ready: AtomicBool::new(false),
            tca: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    /// Fetch market metadata and build the symbol maps, retrying forever with
    /// capped exponential backoff while degraded. A ban error schedules the
    /// retry for ban expiry + 5 s.
    pub async fn bootstrap(&self) {
        let mut attempt: u32 = 0;
        loop {
            match self.client.exchange_info().await {
                Ok(info) => match self.meta.load_exchange_info(&info) {
                    Ok(count) => {
                        self.ready.store(true, Ordering::SeqCst);
                        info!(symbols = count, "exchange connector ready");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "exchangeInfo payload unusable");
                    }
                },
                Err(GatewayError::ExchangeBanned { until_ms }) => {
                    let wait = (until_ms - crate::types::now_ms()).max(0) as u64 + 5000;
                    warn!(until_ms, wait_ms = wait, "banned — retrying bootstrap after ban expiry");
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    continue;
                }
                Err(e) => {
                    warn!(code = e.code(), error = %e, "bootstrap metadata fetch failed");
                }
            }

            let delay = BOOTSTRAP_BACKOFF_FLOOR
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(BOOTSTRAP_BACKOFF_CEILING);
            attempt = attempt.saturating_add(1);
            debug!(attempt, delay_s = delay.as_secs(), "bootstrap retrying in degraded mode");
            tokio::time::sleep(delay).await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Inject the optional transaction-cost sink.
    pub fn set_tca_sink(&self, sink: Arc<dyn TcaSink>) {
        *self.tca.lock() = Some(sink);
    }

    /// Report an execution to the TCA sink, if one is installed.
    pub fn report_execution(
        &self,
        symbol: &str,
        side: &str,
        intended_price: f64,
        fill_price: f64,
        qty: f64,
    ) {
        if let Some(sink) = self.tca.lock().as_ref() {
            sink.record_execution(symbol, side, intended_price, fill_price, qty);
        }
    }

    // -------------------------------------------------------------------------
    // Order path (slot-gated; placement also breaker-gated)
    // -------------------------------------------------------------------------

    fn raw(&self, canonical: &str) -> GatewayResult<String> {
        self.meta
            .to_raw(canonical)
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown symbol {canonical}")))
    }

    async fn order_slot(&self) -> GatewayResult<tokio::sync::OwnedSemaphorePermit> {
        self.order_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::ExchangeRejected("order slots closed".into()))
    }

    /// Place a limit order. `side` is the exchange order side ("BUY"/"SELL").
    pub async fn place_limit(
        &self,
        canonical: &str,
        side: &str,
        qty: f64,
        price: f64,
        reduce_only: bool,
        client_order_id: Option<String>,
    ) -> GatewayResult<serde_json::Value> {
        self.breaker.check()?;
        let raw = self.raw(canonical)?;
        let _slot = self.order_slot().await?;

        let req = OrderRequest {
            symbol: raw,
            side: side.to_string(),
            order_type: "LIMIT".to_string(),
            quantity: qty,
            price: Some(price),
            reduce_only,
            client_order_id,
        };
        let result = self.client.place_order(&req).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    /// Place a market order.
    pub async fn place_market(
        &self,
        canonical: &str,
        side: &str,
        qty: f64,
        reduce_only: bool,
    ) -> GatewayResult<serde_json::Value> {
        self.breaker.check()?;
        let raw = self.raw(canonical)?;
        let _slot = self.order_slot().await?;

        let req = OrderRequest {
            symbol: raw,
            side: side.to_string(),
            order_type: "MARKET".to_string(),
            quantity: qty,
            price: None,
            reduce_only,
            client_order_id: None,
        };
        let result = self.client.place_order(&req).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    /// Native batch of limit orders on one symbol (≤5). Per-order results are
    /// positional. The breaker counts the whole batch as one outcome: success
    /// if any sub-order was accepted.
    pub async fn place_batch_limits(
        &self,
        canonical: &str,
        orders: &[(String, f64, f64, bool)], // (side, qty, price, reduce_only)
    ) -> GatewayResult<Vec<GatewayResult<serde_json::Value>>> {
        self.breaker.check()?;
        let raw = self.raw(canonical)?;
        let _slot = self.order_slot().await?;

        let requests: Vec<OrderRequest> = orders
            .iter()
            .map(|(side, qty, price, reduce_only)| OrderRequest {
                symbol: raw.clone(),
                side: side.clone(),
                order_type: "LIMIT".to_string(),
                quantity: *qty,
                price: Some(*price),
                reduce_only: *reduce_only,
                client_order_id: None,
            })
            .collect();

        let results = self.client.place_batch_orders(&requests).await;
        match &results {
            Ok(entries) => {
                if entries.iter().any(|r| r.is_ok()) {
                    self.breaker.record_success();
                } else {
                    self.breaker.record_failure();
                }
            }
            Err(_) => self.breaker.record_failure(),
        }
        results
    }

    /// Cancel an order. Slot-gated but never breaker-gated: cancels must keep
    /// working while the breaker is open.
    pub async fn cancel_order(
        &self,
        canonical: &str,
        order_id: u64,
    ) -> GatewayResult<serde_json::Value> {
        let raw = self.raw(canonical)?;
        let _slot = self.order_slot().await?;
        self.client.cancel_order(&raw, order_id).await
    }

    /// Native batch cancel on one symbol (≤10 ids). Never breaker-gated.
    pub async fn cancel_batch_orders(
        &self,
        canonical: &str,
        order_ids: &[u64],
    ) -> GatewayResult<Vec<GatewayResult<serde_json::Value>>> {
        let raw = self.raw(canonical)?;
        let _slot = self.order_slot().await?;
        self.client.cancel_batch_orders(&raw, order_ids).await
    }

    // -------------------------------------------------------------------------
    // Reads (never gated)
    // -------------------------------------------------------------------------

    pub async fn query_order(
        &self,
        canonical: &str,
        order_id: u64,
    ) -> GatewayResult<serde_json::Value> {
        let raw = self.raw(canonical)?;
        self.client.query_order(&raw, order_id).await
    }

    pub async fn open_orders(&self, canonical: Option<&str>) -> GatewayResult<Vec<serde_json::Value>> {
        let raw = match canonical {
            Some(c) => Some(self.raw(c)?),
            None => None,
        };
        self.client.open_orders(raw.as_deref()).await
    }

    pub async fn all_orders_since(
        &self,
        canonical: &str,
        since_ms: i64,
    ) -> GatewayResult<Vec<serde_json::Value>> {
        let raw = self.raw(canonical)?;
        self.client.all_orders_since(&raw, since_ms).await
    }

    pub async fn user_trades(
        &self,
        canonical: &str,
        since_ms: i64,
    ) -> GatewayResult<Vec<serde_json::Value>> {
        let raw = self.raw(canonical)?;
        self.client.user_trades(&raw, since_ms).await
    }

    pub async fn position_risk(&self) -> GatewayResult<Vec<serde_json::Value>> {
        self.client.position_risk().await
    }

    pub async fn balance(&self) -> GatewayResult<Vec<serde_json::Value>> {
        self.client.balance().await
    }

    pub async fn ticker_24h(&self, canonical: Option<&str>) -> GatewayResult<serde_json::Value> {
        let raw = match canonical {
            Some(c) => Some(self.raw(c)?),
            None => None,
        };
        self.client.ticker_24h(raw.as_deref()).await
    }

    /// Mark price via REST (fallback when the stream has no tick yet).
    pub async fn premium_index_mark(&self, canonical: &str) -> GatewayResult<f64> {
        let raw = self.raw(canonical)?;
        let body = self.client.premium_index(&raw).await?;
        body["markPrice"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| GatewayError::ExchangeRejected("premiumIndex missing markPrice".into()))
    }

    // -------------------------------------------------------------------------
    // Precision (delegates to the symbol table's cached ops)
    // -------------------------------------------------------------------------

    pub fn amount_to_precision(&self, canonical: &str, x: f64, mode: RoundMode) -> Option<f64> {
        self.meta.amount_to_precision(canonical, x, mode)
    }

    pub fn price_to_precision(&self, canonical: &str, x: f64, mode: RoundMode) -> Option<f64> {
        self.meta.price_to_precision(canonical, x, mode)
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    /// Refcounted subscription for canonical symbols. Unknown symbols are
    /// skipped with a warning.
    pub fn subscribe(&self, canonicals: &[String]) {
        let raws: Vec<String> = canonicals
            .iter()
            .filter_map(|c| {
                let raw = self.meta.to_raw(c);
                if raw.is_none() {
                    warn!(symbol = %c, "subscribe skipped: unknown symbol");
                }
                raw
            })
            .collect();
        if !raws.is_empty() {
            self.streams.subscribe(&raws);
        }
    }

    pub fn unsubscribe(&self, canonicals: &[String]) {
        let raws: Vec<String> = canonicals.iter().filter_map(|c| self.meta.to_raw(c)).collect();
        if !raws.is_empty() {
            self.streams.unsubscribe(&raws);
        }
    }

    /// Subscribed symbols whose last tick is older than `threshold`.
    pub fn stale_symbols(&self, threshold: Duration) -> Vec<String> {
        self.streams
            .subscribed_symbols()
            .into_iter()
            .filter_map(|raw| self.meta.to_canonical(&raw))
            .filter(|canonical| match self.prices.tick_age(canonical) {
                Some(age) => age > threshold,
                None => true, // never ticked at all
            })
            .collect()
    }

    /// Tear down and rebuild the stream group carrying `canonical`.
    pub fn force_resubscribe(&self, canonical: &str) {
        if let Some(raw) = self.meta.to_raw(canonical) {
            self.streams.force_resubscribe(&raw);
        }
    }

    /// Reclaim fully-unreferenced stream groups. Run every 60 s.
    pub fn stream_idle_sweep(&self) {
        self.streams.idle_sweep();
        self.prices.prune_idle_channels();
    }

    /// Close all stream groups (process shutdown).
    pub fn shutdown_streams(&self) {
        self.streams.shutdown_all();
    }

    /// Current REST usage numbers (weight + order windows).
    pub fn rest_usage(&self) -> crate::exchange::rate_limit::UsageReport {
        self.client.usage.usage()
    }

    /// Wait (bounded) for every in-flight order operation to settle by
    /// draining the whole slot pool.
    pub async fn drain_order_slots(&self, timeout: Duration) {
        match tokio::time::timeout(
            timeout,
            self.order_slots.clone().acquire_many_owned(ORDER_SLOTS as u32),
        )
        .await
        {
            Ok(Ok(_permits)) => info!("in-flight order operations settled"),
            _ => warn!("timed out waiting for in-flight order operations"),
        }
    }

    // -------------------------------------------------------------------------
    // Price reads
    // -------------------------------------------------------------------------

    pub fn quote(&self, canonical: &str) -> Option<(f64, f64)> {
        self.prices.quote(canonical)
    }

    pub fn mark(&self, canonical: &str) -> Option<f64> {
        self.prices.mark(canonical)
    }
}

impl std::fmt::Debug for ExchangeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConnector")
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .field("symbols", &self.meta.len())
            .field("breaker_open", &self.breaker.is_open())
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
    fn breaker_opens_after_five_consecutive_failures() {
        let breaker = OrderCircuitBreaker::new();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.check(), Err(GatewayError::CircuitOpen));
    }

    #[test]
    fn success_closes_the_breaker() {
        let breaker = OrderCircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        breaker.record_success();
        assert!(breaker.check().is_ok());
        // Counter reset: four more failures do not re-open it.
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn a_failure_streak_interrupted_by_success_never_opens() {
        let breaker = OrderCircuitBreaker::new();
        for _ in 0..3 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert!(breaker.check().is_ok());
    }

    #[test]
    fn rest_usage_starts_idle() {
        let connector = ExchangeConnector::new(
            "",
            "",
            "https://localhost.invalid",
            "wss://localhost.invalid",
            Arc::new(crate::price_cache::PriceCache::new()),
            crate::snapshots::SnapshotStore::open_in_memory().unwrap(),
        );
        let usage = connector.rest_usage();
        assert_eq!(usage.weight_used_1m, 0);
        assert_eq!(usage.orders_last_10s, 0);
        assert_eq!(usage.orders_last_minute, 0);
    }
}
