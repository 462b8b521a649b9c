// =============================================================================
// Chase Engine — per-order state machines glued to the inside of the book
// =============================================================================
//
// Each chase owns an Arc'd runtime entry in a concurrent map; there is no
// global engine lock. The hot-path flags (`dead`, `repricing`) are atomics
// checked after every await so cancellation can land at any suspension point
// without leaving an orphan order behind.
//
// A fill can be observed from three sources, fastest first: the user-stream
// event routed by the reconciler, the per-chase 5 s probe, and the engine's
// 30 s sweep. The `processed` TTL set debounces double-processing.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::{
    compute_target, distance_breached, distance_pct, should_reprice, tracked_quote,
    within_epsilon, ChaseOutcome, ChaseSpec, ChaseState, ChaseStatus,
};
use crate::errors::{GatewayError, GatewayResult};
use crate::events::{EventBroadcaster, GatewayEvent};
use crate::exchange::connector::ExchangeConnector;
use crate::ledger::LedgerStore;
use crate::price_cache::PriceCache;
use crate::reconciler::{ChaseFillReport, Reconciler};
use crate::snapshots::SnapshotStore;
use crate::types::{now_ms, OrderStatus, RoundMode};
use crate::util::throttle::Throttle;
use crate::util::ttl_map::TtlMap;

/// Reprice attempts per chase are spaced at least this far apart.
const REPRICE_THROTTLE_MS: u64 = 500;
/// Snapshot write throttle per chase.
const SNAPSHOT_THROTTLE_MS: u64 = 1000;
/// Progress broadcast throttle per chase.
const PROGRESS_THROTTLE_MS: u64 = 1000;
/// In-chase fill probe cadence.
const FILL_PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// Fill double-processing debounce.
const PROCESSED_TTL: Duration = Duration::from_secs(30);
/// Snapshot TTL (restart recovery window).
const SNAPSHOT_TTL_SECS: i64 = 24 * 3600;
/// Batch cap mirrors the exchange's native batch endpoint.
const BATCH_LIMIT: usize = 5;

/// One entry of a batch-start result.
#[derive(Debug, Clone)]
pub struct BatchChaseEntry {
    pub chase_id: Option<String>,
    pub error: Option<String>,
}

/// Runtime wrapper around the snapshotted state.
pub struct ChaseRuntime {
    state: Mutex<ChaseState>,
    /// Cancel fast path: any in-flight reprice aborts when this is set.
    dead: AtomicBool,
    /// At most one reprice in flight per chase.
    repricing: AtomicBool,
    outcome_tx: Option<mpsc::UnboundedSender<ChaseOutcome>>,
    reprice_throttle: Throttle,
    snapshot_throttle: Throttle,
    progress_throttle: Throttle,
    tick_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    probe_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChaseRuntime {
    fn new(state: ChaseState, outcome_tx: Option<mpsc::UnboundedSender<ChaseOutcome>>) -> Self {
        Self {
            state: Mutex::new(state),
            dead: AtomicBool::new(false),
            repricing: AtomicBool::new(false),
            outcome_tx,
            reprice_throttle: Throttle::from_millis(REPRICE_THROTTLE_MS),
            snapshot_throttle: Throttle::from_millis(SNAPSHOT_THROTTLE_MS),
            progress_throttle: Throttle::from_millis(PROGRESS_THROTTLE_MS),
            tick_task: Mutex::new(None),
            probe_task: Mutex::new(None),
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.lock().status.is_terminal()
    }

    pub fn snapshot_state(&self) -> ChaseState {
        self.state.lock().clone()
    }
}

pub struct ChaseEngine {
    connector: Arc<ExchangeConnector>,
    prices: Arc<PriceCache>,
    ledger: LedgerStore,
    snapshots: SnapshotStore,
    events: EventBroadcaster,
    reconciler: Arc<Reconciler>,
    chases: DashMap<String, Arc<ChaseRuntime>>,
    processed: TtlMap,
    max_active: usize,
}

impl ChaseEngine {
    pub fn new(
        connector: Arc<ExchangeConnector>,
        prices: Arc<PriceCache>,
        ledger: LedgerStore,
        snapshots: SnapshotStore,
        events: EventBroadcaster,
        reconciler: Arc<Reconciler>,
        max_active: usize,
    ) -> Self {
        Self {
            connector,
            prices,
            ledger,
            snapshots,
            events,
            reconciler,
            chases: DashMap::new(),
            processed: TtlMap::new(PROCESSED_TTL),
            max_active,
        }
    }

    pub fn active_count(&self) -> usize {
        self.chases.len()
    }

    pub fn get_state(&self, id: &str) -> Option<ChaseState> {
        self.chases.get(id).map(|rt| rt.snapshot_state())
    }

    // -------------------------------------------------------------------------
    // start / cancel
    // -------------------------------------------------------------------------

    /// Validate, place the initial limit, and register the chase.
    pub async fn start(self: &Arc<Self>, spec: ChaseSpec) -> GatewayResult<String> {
        spec.validate()?;
        if self.chases.len() >= self.max_active {
            return Err(GatewayError::CapacityExceeded(format!(
                "chase cap {} reached",
                self.max_active
            )));
        }

        let server_quote = self
            .prices
            .quote(&spec.symbol)
            .ok_or_else(|| GatewayError::PriceUnavailable(spec.symbol.clone()))?;
        let (bid, ask) = spec.effective_quote(server_quote);

        let target = self.rounded_clamped_target(&spec.symbol, spec.side, bid, ask, spec.stalk_mode, spec.stalk_offset_pct)?;

        let body = self
            .connector
            .place_limit(
                &spec.symbol,
                spec.side.open_order_side(),
                spec.quantity,
                target,
                spec.reduce_only,
                None,
            )
            .await?;
        let exchange_order_id = body["orderId"].as_u64();

        let pending = self
            .ledger
            .create_pending_order(
                &spec.sub_account,
                &spec.symbol,
                spec.side,
                spec.order_kind,
                target,
                spec.quantity,
                spec.leverage,
                exchange_order_id,
            )
            .await
            .map_err(|e| {
                error!(error = %e, "pending order write failed after placement");
                GatewayError::ExchangeRejected("ledger write failed".into())
            })?;

        let id = self
            .register(
                &spec,
                tracked_quote(spec.side, bid, ask),
                target,
                exchange_order_id,
                Some(pending.id),
            )
            .await;
        Ok(id)
    }

    /// Compute, round, and clamp a target price.
    fn rounded_clamped_target(
        &self,
        symbol: &str,
        side: crate::types::Side,
        bid: f64,
        ask: f64,
        mode: crate::types::StalkMode,
        offset_pct: f64,
    ) -> GatewayResult<f64> {
        let raw = compute_target(side, bid, ask, mode, offset_pct);
        let mark = self.connector.mark(symbol);
        let clamped = self
            .connector
            .meta
            .clamp_price(symbol, raw, mark)
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown symbol {symbol}")))?;
        self.connector
            .price_to_precision(symbol, clamped, RoundMode::Nearest)
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown symbol {symbol}")))
    }

    /// Register the runtime, subscribe to price events, start the probes.
    async fn register(
        self: &Arc<Self>,
        spec: &ChaseSpec,
        initial_quote: f64,
        target: f64,
        exchange_order_id: Option<u64>,
        pending_order_id: Option<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let state = ChaseState {
            id: id.clone(),
            sub_account: spec.sub_account.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            quantity: spec.quantity,
            leverage: spec.leverage,
            stalk_offset_pct: spec.stalk_offset_pct,
            stalk_mode: spec.stalk_mode,
            max_distance_pct: spec.max_distance_pct,
            reduce_only: spec.reduce_only,
            internal: spec.internal,
            parent_scalper_id: spec.parent_scalper_id.clone(),
            order_kind: spec.order_kind,
            pending_order_id,
            current_exchange_order_id: exchange_order_id,
            initial_price: initial_quote,
            last_order_price: target,
            reprice_count: 0,
            status: ChaseStatus::Active,
            started_at: now_ms(),
        };

        info!(
            chase_id = %id,
            symbol = %spec.symbol,
            side = %spec.side,
            quantity = spec.quantity,
            stalk_mode = %spec.stalk_mode,
            target,
            "chase started"
        );

        self.events.publish(GatewayEvent::OrderPlaced {
            sub_account_id: spec.sub_account.clone(),
            order_id: id.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side.as_str().to_string(),
            order_kind: spec.order_kind.as_str().to_string(),
            price: target,
            quantity: spec.quantity,
        });

        let rt = Arc::new(ChaseRuntime::new(state, spec.outcome_tx.clone()));
        self.chases.insert(id.clone(), rt.clone());
        self.write_snapshot(&rt, true).await;
        self.spawn_tick_task(rt.clone());
        self.spawn_probe_task(rt);
        id
    }

    /// Cancel a chase: flips the dead flag so any in-flight reprice aborts,
    /// then cancels the resting exchange order.
    pub async fn cancel(&self, id: &str, reason: &str) -> GatewayResult<()> {
        let rt = self
            .chases
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown chase {id}")))?;

        rt.dead.store(true, Ordering::SeqCst);
        let (proceed, symbol, sub_account, xid, pending_order_id) = {
            let mut st = rt.state.lock();
            if st.status.is_terminal() {
                (false, String::new(), String::new(), None, None)
            } else {
                st.status = ChaseStatus::Cancelled;
                (
                    true,
                    st.symbol.clone(),
                    st.sub_account.clone(),
                    st.current_exchange_order_id,
                    st.pending_order_id.clone(),
                )
            }
        };
        if !proceed {
            return Ok(());
        }

        if let Some(xid) = xid {
            match self.connector.cancel_order(&symbol, xid).await {
                Ok(_) | Err(GatewayError::ExchangeUnknownOrder) => {}
                Err(e) => warn!(chase_id = id, error = %e, "exchange cancel failed"),
            }
        }
        if let Some(poid) = pending_order_id {
            if let Err(e) = self.ledger.update_order_status(&poid, OrderStatus::Cancelled).await {
                warn!(chase_id = id, error = %e, "pending order cancel write failed");
            }
        }

        self.events.publish(GatewayEvent::ChaseCancelled {
            sub_account_id: sub_account,
            chase_id: id.to_string(),
            symbol,
            reason: reason.to_string(),
        });
        if let Some(tx) = &rt.outcome_tx {
            let _ = tx.send(ChaseOutcome::Cancelled {
                chase_id: id.to_string(),
                reason: reason.to_string(),
            });
        }

        info!(chase_id = id, reason, "chase cancelled");
        self.remove(id, &rt, true).await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Batch start
    // -------------------------------------------------------------------------

    /// Start up to 5 chases on one symbol with a single native batch order.
    /// Failed sub-orders yield `{chase_id: None, error}` entries positionally.
    pub async fn start_batch(self: &Arc<Self>, specs: Vec<ChaseSpec>) -> GatewayResult<Vec<BatchChaseEntry>> {
        if specs.is_empty() || specs.len() > BATCH_LIMIT {
            return Err(GatewayError::InvalidInput(format!(
                "batch size must be 1..={BATCH_LIMIT}"
            )));
        }
        let symbol = specs[0].symbol.clone();
        if specs.iter().any(|s| s.symbol != symbol) {
            return Err(GatewayError::InvalidInput(
                "batch specs must share one symbol".into(),
            ));
        }
        for spec in &specs {
            spec.validate()?;
        }
        if self.chases.len() + specs.len() > self.max_active {
            return Err(GatewayError::CapacityExceeded(format!(
                "chase cap {} reached",
                self.max_active
            )));
        }

        let server_quote = self
            .prices
            .quote(&symbol)
            .ok_or_else(|| GatewayError::PriceUnavailable(symbol.clone()))?;

        let mut orders = Vec::with_capacity(specs.len());
        let mut targets = Vec::with_capacity(specs.len());
        for spec in &specs {
            let (bid, ask) = spec.effective_quote(server_quote);
            let target = self.rounded_clamped_target(&symbol, spec.side, bid, ask, spec.stalk_mode, spec.stalk_offset_pct)?;
            targets.push((tracked_quote(spec.side, bid, ask), target));
            orders.push((
                spec.side.open_order_side().to_string(),
                spec.quantity,
                target,
                spec.reduce_only,
            ));
        }

        let results = self.connector.place_batch_limits(&symbol, &orders).await?;

        let mut entries = Vec::with_capacity(specs.len());
        for ((spec, result), (initial_quote, target)) in
            specs.iter().zip(results.into_iter()).zip(targets.into_iter())
        {
            match result {
                Ok(body) => {
                    let xid = body["orderId"].as_u64();
                    let id = self.register(spec, initial_quote, target, xid, None).await;

                    // DB write runs concurrently post-registration.
                    let engine = self.clone();
                    let spec = spec.clone();
                    let chase_id = id.clone();
                    tokio::spawn(async move {
                        match engine
                            .ledger
                            .create_pending_order(
                                &spec.sub_account,
                                &spec.symbol,
                                spec.side,
                                spec.order_kind,
                                target,
                                spec.quantity,
                                spec.leverage,
                                xid,
                            )
                            .await
                        {
                            Ok(pending) => {
                                if let Some(rt) = engine.chases.get(&chase_id) {
                                    rt.state.lock().pending_order_id = Some(pending.id);
                                }
                            }
                            Err(e) => {
                                warn!(chase_id = %chase_id, error = %e, "batch pending-order write failed")
                            }
                        }
                    });

                    entries.push(BatchChaseEntry {
                        chase_id: Some(id),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(symbol = %symbol, code = e.code(), "batch sub-order rejected");
                    entries.push(BatchChaseEntry {
                        chase_id: None,
                        error: Some(e.code().to_string()),
                    });
                }
            }
        }
        Ok(entries)
    }

    // -------------------------------------------------------------------------
    // Tick handling
    // -------------------------------------------------------------------------

    fn spawn_tick_task(self: &Arc<Self>, rt: Arc<ChaseRuntime>) {
        let engine = self.clone();
        let symbol = rt.state.lock().symbol.clone();
        let mut rx = self.prices.subscribe(&symbol);
        let rt_for_task = rt.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(_tick) => {
                        if rt_for_task.is_terminal() || rt_for_task.dead.load(Ordering::SeqCst) {
                            break;
                        }
                        engine.on_tick(&rt_for_task).await;
                        if rt_for_task.is_terminal() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(symbol = %symbol, skipped, "chase tick receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *rt.tick_task.lock() = Some(handle);
    }

    /// Gate and run one reprice attempt. The throttle is consumed whether or
    /// not a reprice ultimately occurs.
    pub async fn on_tick(&self, rt: &Arc<ChaseRuntime>) {
        if rt.is_terminal() || rt.dead.load(Ordering::SeqCst) {
            return;
        }
        if !rt.reprice_throttle.try_fire() {
            return;
        }
        if rt
            .repricing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.reprice(rt).await;
        rt.repricing.store(false, Ordering::SeqCst);
    }

    async fn reprice(&self, rt: &Arc<ChaseRuntime>) {
        let (id, symbol, side, mode, offset, max_dist, reduce_only, quantity, initial_price, last_price, current_xid) = {
            let st = rt.state.lock();
            (
                st.id.clone(),
                st.symbol.clone(),
                st.side,
                st.stalk_mode,
                st.stalk_offset_pct,
                st.max_distance_pct,
                st.reduce_only,
                st.quantity,
                st.initial_price,
                st.last_order_price,
                st.current_exchange_order_id,
            )
        };

        let Some((bid, ask)) = self.prices.quote(&symbol) else {
            return;
        };
        let quote = tracked_quote(side, bid, ask);

        if distance_breached(quote, initial_price, max_dist) {
            self.finish_distance_breached(rt).await;
            return;
        }

        let Ok(target) = self.rounded_clamped_target(&symbol, side, bid, ask, mode, offset) else {
            return;
        };
        if within_epsilon(target, last_price) {
            return;
        }
        if !should_reprice(mode, side, target, last_price) {
            self.broadcast_progress(rt, quote);
            return;
        }

        // ── Cancel the resting order ────────────────────────────────────
        if let Some(xid) = current_xid {
            match self.connector.cancel_order(&symbol, xid).await {
                Ok(_) => {
                    rt.state.lock().current_exchange_order_id = None;
                }
                Err(GatewayError::ExchangeUnknownOrder) => {
                    // The order may have filled under us; probe before moving on.
                    match self.connector.query_order(&symbol, xid).await {
                        Ok(body) if body["status"].as_str() == Some("FILLED") => {
                            let (price, qty) = parse_fill(&body, last_price, quantity);
                            self.handle_fill(rt, price, qty, "reprice-probe").await;
                            return;
                        }
                        Ok(body) => {
                            warn!(
                                chase_id = %id,
                                xid,
                                status = body["status"].as_str().unwrap_or("?"),
                                "cancel hit unknown order; continuing"
                            );
                            rt.state.lock().current_exchange_order_id = None;
                        }
                        Err(e) => {
                            warn!(chase_id = %id, xid, error = %e, "order probe after unknown-cancel failed");
                            rt.state.lock().current_exchange_order_id = None;
                        }
                    }
                }
                Err(e) => {
                    warn!(chase_id = %id, xid, error = %e, "cancel failed; retrying next tick");
                    return;
                }
            }
        }

        if rt.dead.load(Ordering::SeqCst) || rt.is_terminal() {
            return; // cancelled mid-reprice; the old order is already gone
        }

        // ── Place the replacement ───────────────────────────────────────
        match self
            .connector
            .place_limit(&symbol, side.open_order_side(), quantity, target, reduce_only, None)
            .await
        {
            Ok(body) => {
                let new_xid = body["orderId"].as_u64();

                // Post-await guard: the chase may have gone non-active during
                // the placement; the fresh order is then an orphan.
                if rt.dead.load(Ordering::SeqCst) || rt.is_terminal() {
                    if let Some(xid) = new_xid {
                        warn!(chase_id = %id, xid, "cancelling orphan order placed during cancel window");
                        let _ = self.connector.cancel_order(&symbol, xid).await;
                    }
                    return;
                }

                let (pending_order_id, reprice_count) = {
                    let mut st = rt.state.lock();
                    st.current_exchange_order_id = new_xid;
                    st.last_order_price = target;
                    st.reprice_count += 1;
                    (st.pending_order_id.clone(), st.reprice_count)
                };
                debug!(chase_id = %id, target, reprice_count, "chase repriced");

                // Ledger id upsert off the hot path.
                if let (Some(poid), Some(xid)) = (pending_order_id, new_xid) {
                    let ledger = self.ledger.clone();
                    tokio::spawn(async move {
                        if let Err(e) = ledger.set_exchange_order_id(&poid, xid).await {
                            debug!(error = %e, "exchange id upsert failed");
                        }
                    });
                }

                self.write_snapshot(rt, false).await;
                self.broadcast_progress(rt, quote);
            }
            Err(e) if e.is_fatal_for_chase() => {
                error!(chase_id = %id, code = e.code(), "fatal order error; finishing chase");
                self.finish_error(rt, &e).await;
            }
            Err(e) if e.is_transient_price_filter() => {
                debug!(chase_id = %id, "price filter breach; skipping to next tick");
            }
            Err(e) => {
                warn!(chase_id = %id, code = e.code(), "reprice placement failed; staying active");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fill path
    // -------------------------------------------------------------------------

    /// Mark the chase filled (first observer wins), route the fill through the
    /// reconciler, notify the parent, and clean up.
    pub async fn handle_fill(&self, rt: &Arc<ChaseRuntime>, fill_price: f64, fill_qty: f64, source: &str) {
        let (id, sub_account, symbol, side, xid, intended) = {
            let st = rt.state.lock();
            if st.status.is_terminal() {
                return;
            }
            (
                st.id.clone(),
                st.sub_account.clone(),
                st.symbol.clone(),
                st.side,
                st.current_exchange_order_id,
                st.last_order_price,
            )
        };
        if !self.processed.insert(&id) {
            debug!(chase_id = %id, source, "fill already being processed");
            return;
        }
        rt.state.lock().status = ChaseStatus::Filled;

        info!(chase_id = %id, symbol = %symbol, fill_price, fill_qty, source, "chase filled");

        if let Err(e) = self
            .reconciler
            .process_chase_order_fill(ChaseFillReport {
                exchange_order_id: xid,
                sub_account: sub_account.clone(),
                symbol: symbol.clone(),
                fill_price,
                fill_qty,
            })
            .await
        {
            error!(chase_id = %id, error = %e, "chase fill reconciliation failed");
        }

        self.connector
            .report_execution(&symbol, side.as_str(), intended, fill_price, fill_qty);

        self.events.publish(GatewayEvent::ChaseFilled {
            sub_account_id: sub_account,
            chase_id: id.clone(),
            symbol,
            fill_price,
            fill_qty,
        });
        if let Some(tx) = &rt.outcome_tx {
            let _ = tx.send(ChaseOutcome::Filled {
                chase_id: id.clone(),
                fill_price,
                fill_qty,
            });
        }

        self.remove(&id, rt, false).await;
    }

    async fn finish_distance_breached(&self, rt: &Arc<ChaseRuntime>) {
        let (id, sub_account, symbol, xid, pending_order_id) = {
            let mut st = rt.state.lock();
            if st.status.is_terminal() {
                return;
            }
            st.status = ChaseStatus::DistanceBreached;
            (
                st.id.clone(),
                st.sub_account.clone(),
                st.symbol.clone(),
                st.current_exchange_order_id,
                st.pending_order_id.clone(),
            )
        };
        rt.dead.store(true, Ordering::SeqCst);

        warn!(chase_id = %id, symbol = %symbol, "distance cap breached; finishing chase");

        if let Some(xid) = xid {
            match self.connector.cancel_order(&symbol, xid).await {
                Ok(_) | Err(GatewayError::ExchangeUnknownOrder) => {}
                Err(e) => warn!(chase_id = %id, error = %e, "breach cancel failed"),
            }
        }
        if let Some(poid) = pending_order_id {
            let _ = self.ledger.update_order_status(&poid, OrderStatus::Cancelled).await;
        }

        self.events.publish(GatewayEvent::ChaseCancelled {
            sub_account_id: sub_account,
            chase_id: id.clone(),
            symbol,
            reason: "distance_breached".to_string(),
        });
        if let Some(tx) = &rt.outcome_tx {
            let _ = tx.send(ChaseOutcome::Cancelled {
                chase_id: id.clone(),
                reason: "distance_breached".to_string(),
            });
        }
        self.remove(&id, rt, false).await;
    }

    async fn finish_error(&self, rt: &Arc<ChaseRuntime>, cause: &GatewayError) {
        let (id, sub_account, symbol, pending_order_id) = {
            let mut st = rt.state.lock();
            if st.status.is_terminal() {
                return;
            }
            st.status = ChaseStatus::Error;
            (
                st.id.clone(),
                st.sub_account.clone(),
                st.symbol.clone(),
                st.pending_order_id.clone(),
            )
        };
        rt.dead.store(true, Ordering::SeqCst);

        if let Some(poid) = pending_order_id {
            let _ = self.ledger.update_order_status(&poid, OrderStatus::Cancelled).await;
        }
        self.events.publish(GatewayEvent::ChaseCancelled {
            sub_account_id: sub_account,
            chase_id: id.clone(),
            symbol,
            reason: cause.code().to_string(),
        });
        if let Some(tx) = &rt.outcome_tx {
            let _ = tx.send(ChaseOutcome::Cancelled {
                chase_id: id.clone(),
                reason: cause.code().to_string(),
            });
        }
        self.remove(&id, rt, false).await;
    }

    /// Delete the snapshot, drop the runtime from the map, and optionally
    /// abort its tasks (never when called from inside one of them).
    async fn remove(&self, id: &str, rt: &Arc<ChaseRuntime>, abort_tasks: bool) {
        if let Err(e) = self.snapshots.delete(&format!("chase:{id}")).await {
            debug!(chase_id = id, error = %e, "snapshot delete failed");
        }
        self.chases.remove(id);
        if abort_tasks {
            if let Some(handle) = rt.tick_task.lock().take() {
                handle.abort();
            }
            if let Some(handle) = rt.probe_task.lock().take() {
                handle.abort();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Probes & sweep
    // -------------------------------------------------------------------------

    fn spawn_probe_task(self: &Arc<Self>, rt: Arc<ChaseRuntime>) {
        let engine = self.clone();
        let rt_for_task = rt.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + FILL_PROBE_INTERVAL;
            let mut interval = tokio::time::interval_at(start, FILL_PROBE_INTERVAL);
            loop {
                interval.tick().await;
                if rt_for_task.is_terminal() || rt_for_task.dead.load(Ordering::SeqCst) {
                    break;
                }
                engine.probe_fill(&rt_for_task).await;
                if rt_for_task.is_terminal() {
                    break;
                }
            }
        });
        *rt.probe_task.lock() = Some(handle);
    }

    async fn probe_fill(&self, rt: &Arc<ChaseRuntime>) {
        let (symbol, xid, last_price, quantity) = {
            let st = rt.state.lock();
            (
                st.symbol.clone(),
                st.current_exchange_order_id,
                st.last_order_price,
                st.quantity,
            )
        };
        let Some(xid) = xid else { return };

        match self.connector.query_order(&symbol, xid).await {
            Ok(body) if body["status"].as_str() == Some("FILLED") => {
                let (price, qty) = parse_fill(&body, last_price, quantity);
                self.handle_fill(rt, price, qty, "fill-probe").await;
            }
            Ok(_) => {}
            Err(e) => debug!(xid, code = e.code(), "fill probe query failed"),
        }
    }

    /// Fast path: a user-stream fill for an exchange order id. Returns `true`
    /// when a live chase owned that order and the fill was routed to it.
    pub async fn on_user_stream_fill(&self, exchange_order_id: u64, fill_price: f64, fill_qty: f64) -> bool {
        let rt = self
            .chases
            .iter()
            .find(|e| e.value().state.lock().current_exchange_order_id == Some(exchange_order_id))
            .map(|e| e.value().clone());
        match rt {
            Some(rt) => {
                self.handle_fill(&rt, fill_price, fill_qty, "user-stream").await;
                true
            }
            None => false,
        }
    }

    /// The 30 s cleanup sweep: probe every active chase and evict stale dedup
    /// entries.
    pub async fn sweep_once(&self) {
        let runtimes: Vec<Arc<ChaseRuntime>> =
            self.chases.iter().map(|e| e.value().clone()).collect();
        for rt in runtimes {
            if !rt.is_terminal() {
                self.probe_fill(&rt).await;
            }
        }
        self.processed.evict_expired();
    }

    // -------------------------------------------------------------------------
    // Progress & snapshots
    // -------------------------------------------------------------------------

    fn broadcast_progress(&self, rt: &Arc<ChaseRuntime>, current_quote: f64) {
        if !rt.progress_throttle.try_fire() {
            return;
        }
        let st = rt.state.lock();
        self.events.publish(GatewayEvent::ChaseProgress {
            sub_account_id: st.sub_account.clone(),
            chase_id: st.id.clone(),
            symbol: st.symbol.clone(),
            last_order_price: st.last_order_price,
            reprice_count: st.reprice_count,
            distance_pct: distance_pct(current_quote, st.initial_price),
        });
    }

    async fn write_snapshot(&self, rt: &Arc<ChaseRuntime>, force: bool) {
        if !force && !rt.snapshot_throttle.try_fire() {
            return;
        }
        let (key, payload) = {
            let st = rt.state.lock();
            match serde_json::to_string(&*st) {
                Ok(json) => (format!("chase:{}", st.id), json),
                Err(e) => {
                    warn!(error = %e, "chase state serialization failed");
                    return;
                }
            }
        };
        if let Err(e) = self.snapshots.set(&key, &payload, SNAPSHOT_TTL_SECS).await {
            // Snapshot failures are non-fatal.
            warn!(key = %key, error = %e, "chase snapshot write failed");
        }
    }

    // -------------------------------------------------------------------------
    // Restart recovery
    // -------------------------------------------------------------------------

    /// Rehydrate chases from snapshots: finished exchange orders delete their
    /// snapshot; live ones are restored with their price subscription.
    pub async fn resume_from_snapshots(self: &Arc<Self>) {
        let entries = match self.snapshots.list_prefix("chase:").await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "chase snapshot listing failed");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "resuming chases from snapshots");

        for (key, payload) in entries {
            let state: ChaseState = match serde_json::from_str(&payload) {
                Ok(state) => state,
                Err(e) => {
                    warn!(key = %key, error = %e, "unreadable chase snapshot; deleting");
                    let _ = self.snapshots.delete(&key).await;
                    continue;
                }
            };

            let resolved = match state.current_exchange_order_id {
                Some(xid) => match self.connector.query_order(&state.symbol, xid).await {
                    Ok(body) => {
                        let status = body["status"].as_str().unwrap_or("").to_ascii_uppercase();
                        matches!(status.as_str(), "FILLED" | "CANCELED" | "CANCELLED" | "EXPIRED")
                    }
                    Err(GatewayError::ExchangeUnknownOrder) => true,
                    Err(e) => {
                        debug!(key = %key, error = %e, "resume probe failed; restoring anyway");
                        false
                    }
                },
                None => true,
            };

            if resolved {
                info!(chase_id = %state.id, "snapshot refers to a finished order; deleting");
                let _ = self.snapshots.delete(&key).await;
                continue;
            }

            info!(chase_id = %state.id, symbol = %state.symbol, "chase restored from snapshot");
            let rt = Arc::new(ChaseRuntime::new(state, None));
            let id = rt.state.lock().id.clone();
            self.chases.insert(id, rt.clone());
            self.write_snapshot(&rt, true).await;
            self.spawn_tick_task(rt.clone());
            self.spawn_probe_task(rt);
        }
    }

    /// Politely cancel every active chase (process shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.chases.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.cancel(&id, "shutdown").await {
                warn!(chase_id = %id, error = %e, "shutdown cancel failed");
            }
        }
    }
}

impl std::fmt::Debug for ChaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaseEngine")
            .field("active", &self.chases.len())
            .field("max_active", &self.max_active)
            .finish()
    }
}

/// Pull (avgPrice, executedQty) out of an order payload, with fallbacks.
fn parse_fill(body: &serde_json::Value, fallback_price: f64, fallback_qty: f64) -> (f64, f64) {
    let price = body["avgPrice"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .filter(|p: &f64| *p > 0.0)
        .unwrap_or(fallback_price);
    let qty = body["executedQty"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .filter(|q: &f64| *q > 0.0)
        .unwrap_or(fallback_qty);
    (price, qty)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderKind, Side, StalkMode};

    fn test_engine() -> Arc<ChaseEngine> {
        let prices = Arc::new(PriceCache::new());
        let snapshots = SnapshotStore::open_in_memory().unwrap();
        let connector = Arc::new(ExchangeConnector::new(
            "",
            "",
            "https://localhost.invalid",
            "wss://localhost.invalid",
            prices.clone(),
            snapshots.clone(),
        ));
        let ledger = LedgerStore::open_in_memory().unwrap();
        let events = EventBroadcaster::new();
        let reconciler = Arc::new(Reconciler::new(
            connector.clone(),
            ledger.clone(),
            events.clone(),
        ));
        Arc::new(ChaseEngine::new(
            connector, prices, ledger, snapshots, events, reconciler, 500,
        ))
    }

    fn spec(symbol: &str) -> ChaseSpec {
        let mut s = ChaseSpec::new("acct", symbol, Side::Long, 0.01, 10);
        s.stalk_mode = StalkMode::Trail;
        s
    }

    #[tokio::test]
    async fn start_without_price_fails_with_price_unavailable() {
        let engine = test_engine();
        let err = engine.start(spec("BTC/USDT:USDT")).await.unwrap_err();
        assert_eq!(err.code(), "PRICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn batch_rejects_mixed_symbols_and_oversize() {
        let engine = test_engine();
        let err = engine
            .start_batch(vec![spec("BTC/USDT:USDT"), spec("ETH/USDT:USDT")])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let specs: Vec<ChaseSpec> = (0..6).map(|_| spec("BTC/USDT:USDT")).collect();
        let err = engine.start_batch(specs).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn cancel_unknown_chase_is_an_error() {
        let engine = test_engine();
        assert!(engine.cancel("nope", "test").await.is_err());
    }

    #[tokio::test]
    async fn fill_is_processed_once_and_cleans_up() {
        let engine = test_engine();

        // A pending chase order the reconciler will resolve.
        engine
            .ledger
            .create_pending_order("acct", "BTC/USDT:USDT", Side::Long, OrderKind::ChaseLimit,
                100.0, 0.01, 10, Some(5))
            .await
            .unwrap();

        // Hand-register a runtime (no exchange round-trip).
        let state = ChaseState {
            id: "c-1".into(),
            sub_account: "acct".into(),
            symbol: "BTC/USDT:USDT".into(),
            side: Side::Long,
            quantity: 0.01,
            leverage: 10,
            stalk_offset_pct: 0.0,
            stalk_mode: StalkMode::Trail,
            max_distance_pct: 0.0,
            reduce_only: false,
            internal: false,
            parent_scalper_id: None,
            order_kind: OrderKind::ChaseLimit,
            pending_order_id: None,
            current_exchange_order_id: Some(5),
            initial_price: 100.0,
            last_order_price: 100.0,
            reprice_count: 0,
            status: ChaseStatus::Active,
            started_at: now_ms(),
        };
        let rt = Arc::new(ChaseRuntime::new(state, None));
        engine.chases.insert("c-1".into(), rt.clone());

        let mut rx = engine.events.subscribe();
        engine.handle_fill(&rt, 100.01, 0.01, "test").await;
        engine.handle_fill(&rt, 100.01, 0.01, "test").await; // duplicate

        // One open position exists with the fill's price and quantity.
        let pos = engine
            .ledger
            .find_open_position("acct", "BTC/USDT:USDT", Side::Long)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.entry_price, 100.01);
        assert_eq!(pos.quantity, 0.01);

        // Chase is removed from the table and the state is terminal.
        assert!(engine.chases.get("c-1").is_none());
        assert_eq!(rt.state.lock().status, ChaseStatus::Filled);

        // Events include exactly one chase_filled.
        let mut chase_filled = 0;
        while let Ok(evt) = rx.try_recv() {
            if matches!(evt, GatewayEvent::ChaseFilled { .. }) {
                chase_filled += 1;
            }
        }
        assert_eq!(chase_filled, 1);
    }

    #[tokio::test]
    async fn tick_gating_requires_throttle_and_single_flight() {
        let engine = test_engine();
        let state = ChaseState {
            id: "c-2".into(),
            sub_account: "acct".into(),
            symbol: "NOQUOTE/USDT:USDT".into(),
            side: Side::Long,
            quantity: 0.01,
            leverage: 10,
            stalk_offset_pct: 0.0,
            stalk_mode: StalkMode::None,
            max_distance_pct: 0.0,
            reduce_only: false,
            internal: false,
            parent_scalper_id: None,
            order_kind: OrderKind::ChaseLimit,
            pending_order_id: None,
            current_exchange_order_id: None,
            initial_price: 100.0,
            last_order_price: 100.0,
            reprice_count: 0,
            status: ChaseStatus::Active,
            started_at: now_ms(),
        };
        let rt = Arc::new(ChaseRuntime::new(state, None));

        // First tick consumes the throttle (no quote -> no-op), second is gated.
        engine.on_tick(&rt).await;
        assert!(!rt.reprice_throttle.try_fire(), "throttle must be armed");
        // The repricing flag is clear after the attempt (invariant 1).
        assert!(!rt.repricing.load(Ordering::SeqCst));

        // A dead chase never reprices.
        rt.dead.store(true, Ordering::SeqCst);
        engine.on_tick(&rt).await;
        assert!(!rt.repricing.load(Ordering::SeqCst));
    }
}
