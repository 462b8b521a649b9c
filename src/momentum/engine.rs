// =============================================================================
// Momentum (SURF) Engine — ride a sustained move, scalp the wiggles
// =============================================================================
//
// Per-(account, symbol, side) instances live in a concurrent map; each owns a
// mark-tick task (re-entrancy-guarded, 500 ms throttled) and an outcome task
// draining its child chases' fill/cancel messages.
//
// Children, all spawned through the chase engine with trail stalking:
//   - the entry chase (SURF_LIMIT, dynamic offset)
//   - one reduce-only scalp chase per fill (SURF_SCALP, spread offset)
//   - a single reduce-only deleverage chase while unwinding (SURF_DELEVERAGE)
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::profile::{bezier_multiplier, dynamic_offset_pct, SurfProfile};
use super::state::{MomentumState, SurfAction, SurfPhase};
use crate::chase::{ChaseEngine, ChaseOutcome, ChaseSpec};
use crate::errors::{GatewayError, GatewayResult};
use crate::events::{EventBroadcaster, GatewayEvent};
use crate::exchange::connector::ExchangeConnector;
use crate::price_cache::PriceCache;
use crate::snapshots::SnapshotStore;
use crate::types::{now_ms, OrderKind, RoundMode, Side, StalkMode};

/// Tick handler throttle per instance.
const TICK_THROTTLE_MS: u64 = 500;
/// Snapshot write throttle per instance.
const SNAPSHOT_THROTTLE_MS: u64 = 2000;
/// Live-log cadence.
const LIVE_LOG_THROTTLE_MS: u64 = 10_000;
/// Progress event cadence.
const PROGRESS_THROTTLE_MS: u64 = 1000;
/// Instances with no tick for this long are stopped by the cleanup sweep.
const STALE_AFTER: Duration = Duration::from_secs(300);
/// Snapshot TTL.
const SNAPSHOT_TTL_SECS: i64 = 48 * 3600;
/// Deleverage chase offset: fixed 40 bps.
const DELEVERAGE_OFFSET_PCT: f64 = 0.40;
/// Deleverage slice: fraction of the core per chase.
const DELEVERAGE_FRACTION: f64 = 0.30;
/// Exchange-wide minimum notional floor for child orders.
const MIN_CHILD_NOTIONAL: f64 = 5.0;

/// Parameters for starting one instance.
#[derive(Debug, Clone)]
pub struct MomentumRequest {
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub max_notional: f64,
    /// Profile name; auto-detected when absent.
    pub profile: Option<String>,
}

struct SurfRuntime {
    state: Mutex<MomentumState>,
    /// Tick handler re-entrancy guard.
    processing: AtomicBool,
    tick_throttle: crate::util::throttle::Throttle,
    snapshot_throttle: crate::util::throttle::Throttle,
    live_log_throttle: crate::util::throttle::Throttle,
    progress_throttle: crate::util::throttle::Throttle,
    entry_chase_id: Mutex<Option<String>>,
    deleverage_chase_id: Mutex<Option<String>>,
    outcome_tx: mpsc::UnboundedSender<ChaseOutcome>,
    last_tick: Mutex<Instant>,
    tick_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    outcome_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SurfRuntime {
    fn new(state: MomentumState, outcome_tx: mpsc::UnboundedSender<ChaseOutcome>) -> Self {
        Self {
            state: Mutex::new(state),
            processing: AtomicBool::new(false),
            tick_throttle: crate::util::throttle::Throttle::from_millis(TICK_THROTTLE_MS),
            snapshot_throttle: crate::util::throttle::Throttle::from_millis(SNAPSHOT_THROTTLE_MS),
            live_log_throttle: crate::util::throttle::Throttle::from_millis(LIVE_LOG_THROTTLE_MS),
            progress_throttle: crate::util::throttle::Throttle::from_millis(PROGRESS_THROTTLE_MS),
            entry_chase_id: Mutex::new(None),
            deleverage_chase_id: Mutex::new(None),
            outcome_tx,
            last_tick: Mutex::new(Instant::now()),
            tick_task: Mutex::new(None),
            outcome_task: Mutex::new(None),
        }
    }

    fn is_stopped(&self) -> bool {
        matches!(self.state.lock().phase, SurfPhase::Stopped)
    }
}

pub struct MomentumEngine {
    connector: Arc<ExchangeConnector>,
    prices: Arc<PriceCache>,
    snapshots: SnapshotStore,
    events: EventBroadcaster,
    chase: Arc<ChaseEngine>,
    instances: DashMap<String, Arc<SurfRuntime>>,
    max_instances: usize,
}

impl MomentumEngine {
    pub fn new(
        connector: Arc<ExchangeConnector>,
        prices: Arc<PriceCache>,
        snapshots: SnapshotStore,
        events: EventBroadcaster,
        chase: Arc<ChaseEngine>,
        max_instances: usize,
    ) -> Self {
        Self {
            connector,
            prices,
            snapshots,
            events,
            chase,
            instances: DashMap::new(),
            max_instances,
        }
    }

    pub fn active_count(&self) -> usize {
        self.instances.len()
    }

    pub fn get_state(&self, id: &str) -> Option<MomentumState> {
        self.instances.get(id).map(|rt| rt.state.lock().clone())
    }

    // -------------------------------------------------------------------------
    // start / stop
    // -------------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>, req: MomentumRequest) -> GatewayResult<String> {
        if req.max_notional <= 0.0 {
            return Err(GatewayError::InvalidInput("max_notional must be > 0".into()));
        }
        if self.instances.len() >= self.max_instances {
            return Err(GatewayError::CapacityExceeded(format!(
                "momentum cap {} reached",
                self.max_instances
            )));
        }

        let start_price = self
            .prices
            .mark(&req.symbol)
            .or_else(|| self.prices.quote(&req.symbol).map(|(b, a)| (b + a) / 2.0))
            .ok_or_else(|| GatewayError::PriceUnavailable(req.symbol.clone()))?;

        let profile = match &req.profile {
            Some(name) => SurfProfile::by_name(name)
                .ok_or_else(|| GatewayError::InvalidInput(format!("unknown profile {name}")))?,
            None => SurfProfile::auto_detect(&req.symbol, start_price),
        };

        let id = Uuid::new_v4().to_string();
        let state = MomentumState::new(
            id.clone(),
            req.sub_account.clone(),
            req.symbol.clone(),
            req.side,
            req.leverage,
            req.max_notional,
            profile,
            start_price,
            now_ms(),
        );

        info!(
            instance_id = %id,
            symbol = %req.symbol,
            side = %req.side,
            max_notional = req.max_notional,
            profile = %state.profile.name,
            start_price,
            "momentum instance started"
        );

        self.install(state).await;
        Ok(id)
    }

    /// Register a runtime, subscribe it to price events, start its tasks.
    async fn install(self: &Arc<Self>, state: MomentumState) {
        let id = state.id.clone();
        let symbol = state.symbol.clone();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let rt = Arc::new(SurfRuntime::new(state, outcome_tx));
        self.instances.insert(id.clone(), rt.clone());
        self.write_snapshot(&rt, true).await;

        // Mark-tick task.
        let engine = self.clone();
        let rt_tick = rt.clone();
        let mut rx = self.prices.subscribe(&symbol);
        let tick_handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(tick) => {
                        if rt_tick.is_stopped() {
                            break;
                        }
                        // Mark-only drives the state machine.
                        if tick.mark > 0.0 {
                            engine.on_tick(&rt_tick, tick.mark).await;
                        }
                        if rt_tick.is_stopped() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(symbol = %symbol, skipped, "momentum tick receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *rt.tick_task.lock() = Some(tick_handle);

        // Child-outcome task.
        let engine = self.clone();
        let rt_outcome = rt.clone();
        let mut outcome_rx = outcome_rx;
        let outcome_handle = tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                engine.on_child_outcome(&rt_outcome, outcome).await;
                if rt_outcome.is_stopped() {
                    break;
                }
            }
        });
        *rt.outcome_task.lock() = Some(outcome_handle);
    }

    /// Stop an instance, cancelling its child chases.
    pub async fn stop(&self, id: &str, reason: &str) -> GatewayResult<()> {
        let rt = self
            .instances
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::InvalidInput(format!("unknown momentum instance {id}")))?;

        let (sub_account, symbol, pending_chase_ids) = {
            let mut st = rt.state.lock();
            if st.phase == SurfPhase::Stopped {
                return Ok(());
            }
            st.phase = SurfPhase::Stopped;
            let scalp_ids: Vec<String> =
                st.pending_scalps.iter().map(|s| s.chase_id.clone()).collect();
            (st.sub_account.clone(), st.symbol.clone(), scalp_ids)
        };

        let mut child_ids = pending_chase_ids;
        if let Some(cid) = rt.entry_chase_id.lock().take() {
            child_ids.push(cid);
        }
        if let Some(cid) = rt.deleverage_chase_id.lock().take() {
            child_ids.push(cid);
        }
        for cid in child_ids {
            if let Err(e) = self.chase.cancel(&cid, "parent_stopped").await {
                debug!(chase_id = %cid, error = %e, "child cancel on stop");
            }
        }

        self.events.publish(GatewayEvent::PumpChaserStopped {
            sub_account_id: sub_account,
            instance_id: id.to_string(),
            symbol,
            reason: reason.to_string(),
        });
        info!(instance_id = id, reason, "momentum instance stopped");

        if let Err(e) = self.snapshots.delete(&format!("momentum:{id}")).await {
            debug!(error = %e, "momentum snapshot delete failed");
        }
        self.instances.remove(id);
        if let Some(handle) = rt.tick_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = rt.outcome_task.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tick handling
    // -------------------------------------------------------------------------

    async fn on_tick(&self, rt: &Arc<SurfRuntime>, mark: f64) {
        // Re-entrancy guard plus the 500 ms inter-tick throttle.
        if rt
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if !rt.tick_throttle.try_fire() {
            rt.processing.store(false, Ordering::SeqCst);
            return;
        }
        *rt.last_tick.lock() = Instant::now();

        let action = rt.state.lock().advance(mark, now_ms());

        match action {
            Some(SurfAction::TriggerEntry) => {
                self.ensure_entry_chase(rt).await;
            }
            Some(SurfAction::CancelEntry) => {
                self.cancel_entry_chase(rt).await;
            }
            Some(SurfAction::StartDeleverage) => {
                self.cancel_entry_chase(rt).await;
                self.ensure_deleverage_chase(rt).await;
            }
            Some(SurfAction::StopDeleverage) => {
                let cid = rt.deleverage_chase_id.lock().take();
                if let Some(cid) = cid {
                    if let Err(e) = self.chase.cancel(&cid, "deleverage_complete").await {
                        debug!(chase_id = %cid, error = %e, "deleverage cancel");
                    }
                }
            }
            None => {
                // Self-heal gaps: an ARMED instance without a live entry chase
                // (rate-limited earlier, child errored) retries here.
                let phase = rt.state.lock().phase;
                if phase == SurfPhase::Armed && rt.entry_chase_id.lock().is_none() {
                    self.ensure_entry_chase(rt).await;
                } else if phase == SurfPhase::Deleveraging
                    && rt.deleverage_chase_id.lock().is_none()
                {
                    self.ensure_deleverage_chase(rt).await;
                }
            }
        }

        self.write_snapshot(rt, false).await;
        self.broadcast_progress(rt);
        self.live_log(rt);

        rt.processing.store(false, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Entry chases
    // -------------------------------------------------------------------------

    async fn ensure_entry_chase(&self, rt: &Arc<SurfRuntime>) {
        if rt.entry_chase_id.lock().is_some() {
            return;
        }

        let (spec, instance_id) = {
            let mut st = rt.state.lock();
            if st.phase != SurfPhase::Armed {
                return;
            }
            if st.fill_rate_exceeded(now_ms()) {
                st.stats.rate_limited += 1;
                debug!(instance_id = %st.id, "entry rejected by fill-rate limiter");
                return;
            }

            let Some((bid, ask)) = self.prices.quote(&st.symbol) else {
                return;
            };
            let chase_price = match st.side {
                Side::Long => bid,
                Side::Short => ask,
            };

            let Some(qty) = self.size_entry(&st, chase_price) else {
                debug!(instance_id = %st.id, "entry sizing below exchange minimums");
                return;
            };

            let (high, low) = st.price_window().unwrap_or((chase_price, chase_price));
            let offset = dynamic_offset_pct(&st.profile, high, low, st.fills.len());

            let mut spec = ChaseSpec::new(&st.sub_account, &st.symbol, st.side, qty, st.leverage);
            spec.stalk_mode = StalkMode::Trail;
            spec.stalk_offset_pct = offset.min(10.0);
            spec.order_kind = OrderKind::SurfLimit;
            spec.internal = true;
            spec.parent_scalper_id = Some(st.id.clone());
            spec.outcome_tx = Some(rt.outcome_tx.clone());
            (spec, st.id.clone())
        };

        match self.chase.start(spec).await {
            Ok(chase_id) => {
                debug!(instance_id = %instance_id, chase_id = %chase_id, "entry chase spawned");
                *rt.entry_chase_id.lock() = Some(chase_id);
            }
            Err(e) if matches!(e, GatewayError::ExchangeMarginInsufficient | GatewayError::InsufficientMargin) => {
                error!(instance_id = %instance_id, "fatal margin error; pausing instance");
                rt.state.lock().phase = SurfPhase::Paused;
            }
            Err(e) => {
                warn!(instance_id = %instance_id, code = e.code(), "entry chase spawn failed");
            }
        }
    }

    /// Fill size: Bézier-scaled base quantity, capped by the remaining
    /// notional budget, rounded to the lot step, exchange minimums enforced.
    fn size_entry(&self, st: &MomentumState, chase_price: f64) -> Option<f64> {
        if chase_price <= 0.0 {
            return None;
        }
        let multiplier = bezier_multiplier(st.amplitude, &st.profile);
        let raw = st.profile.base_qty * multiplier;

        let budget_left = (st.max_notional - st.core.qty * chase_price).max(0.0);
        let capped = raw.min(budget_left / chase_price);

        let qty = self
            .connector
            .amount_to_precision(&st.symbol, capped, RoundMode::Floor)
            .unwrap_or(capped);

        let meta = self.connector.meta.meta(&st.symbol);
        let min_qty = meta.as_ref().map(|m| m.min_qty).unwrap_or(0.0);
        let min_notional = meta
            .as_ref()
            .map(|m| m.min_notional.max(MIN_CHILD_NOTIONAL))
            .unwrap_or(MIN_CHILD_NOTIONAL);

        if qty < min_qty || qty * chase_price < min_notional {
            return None;
        }
        Some(qty)
    }

    async fn cancel_entry_chase(&self, rt: &Arc<SurfRuntime>) {
        let cid = rt.entry_chase_id.lock().take();
        if let Some(cid) = cid {
            if let Err(e) = self.chase.cancel(&cid, "gated").await {
                debug!(chase_id = %cid, error = %e, "entry chase cancel");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Deleverage chases
    // -------------------------------------------------------------------------

    async fn ensure_deleverage_chase(&self, rt: &Arc<SurfRuntime>) {
        if rt.deleverage_chase_id.lock().is_some() {
            return;
        }

        let (spec, instance_id) = {
            let st = rt.state.lock();
            if st.phase != SurfPhase::Deleveraging || st.core.qty <= 0.0 {
                return;
            }
            let Some((bid, ask)) = self.prices.quote(&st.symbol) else {
                return;
            };
            let price = match st.side.opposite() {
                Side::Long => bid,
                Side::Short => ask,
            };

            let raw_qty = st.core.qty * DELEVERAGE_FRACTION;
            let mut qty = self
                .connector
                .amount_to_precision(&st.symbol, raw_qty, RoundMode::Floor)
                .unwrap_or(raw_qty);

            let meta = self.connector.meta.meta(&st.symbol);
            let min_qty = meta.as_ref().map(|m| m.min_qty).unwrap_or(0.0);
            let min_notional = meta
                .as_ref()
                .map(|m| m.min_notional.max(MIN_CHILD_NOTIONAL))
                .unwrap_or(MIN_CHILD_NOTIONAL);
            if qty < min_qty || qty * price < min_notional {
                // A slice below exchange minimums unwinds the whole core.
                qty = self
                    .connector
                    .amount_to_precision(&st.symbol, st.core.qty, RoundMode::Floor)
                    .unwrap_or(st.core.qty);
            }
            if qty <= 0.0 {
                return;
            }

            let mut spec = ChaseSpec::new(
                &st.sub_account,
                &st.symbol,
                st.side.opposite(),
                qty,
                st.leverage,
            );
            spec.stalk_mode = StalkMode::Trail;
            spec.stalk_offset_pct = DELEVERAGE_OFFSET_PCT;
            spec.order_kind = OrderKind::SurfDeleverage;
            spec.reduce_only = true;
            spec.internal = true;
            spec.parent_scalper_id = Some(st.id.clone());
            spec.outcome_tx = Some(rt.outcome_tx.clone());
            (spec, st.id.clone())
        };

        match self.chase.start(spec).await {
            Ok(chase_id) => {
                info!(instance_id = %instance_id, chase_id = %chase_id, "deleverage chase spawned");
                *rt.deleverage_chase_id.lock() = Some(chase_id);
            }
            Err(e) if e.is_ghost_position() => {
                // The exchange says the position does not exist: the internal
                // core is ghost state. Zero it and resume normally.
                warn!(instance_id = %instance_id, "reduce-only rejected; zeroing ghost core");
                let mut st = rt.state.lock();
                st.zero_core();
                st.phase = SurfPhase::StepWait;
            }
            Err(e) => {
                warn!(instance_id = %instance_id, code = e.code(), "deleverage chase spawn failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Child outcomes
    // -------------------------------------------------------------------------

    async fn on_child_outcome(&self, rt: &Arc<SurfRuntime>, outcome: ChaseOutcome) {
        match outcome {
            ChaseOutcome::Filled {
                chase_id,
                fill_price,
                fill_qty,
            } => {
                let is_entry = rt.entry_chase_id.lock().as_deref() == Some(chase_id.as_str());
                let is_deleverage =
                    rt.deleverage_chase_id.lock().as_deref() == Some(chase_id.as_str());
                if is_entry {
                    rt.entry_chase_id.lock().take();
                    self.on_entry_fill(rt, fill_price, fill_qty).await;
                } else if is_deleverage {
                    rt.deleverage_chase_id.lock().take();
                    self.on_deleverage_fill(rt, fill_price, fill_qty).await;
                } else {
                    self.on_scalp_fill(rt, &chase_id, fill_price).await;
                }
            }
            ChaseOutcome::Cancelled { chase_id, reason } => {
                let was_entry = {
                    let mut guard = rt.entry_chase_id.lock();
                    if guard.as_deref() == Some(chase_id.as_str()) {
                        guard.take();
                        true
                    } else {
                        false
                    }
                };
                let was_deleverage = {
                    let mut guard = rt.deleverage_chase_id.lock();
                    if guard.as_deref() == Some(chase_id.as_str()) {
                        guard.take();
                        true
                    } else {
                        false
                    }
                };
                if !was_entry && !was_deleverage {
                    // A scalp close died; its quantity goes back to the core.
                    let rolled = rt.state.lock().rollback_scalp(&chase_id);
                    if let Some(scalp) = rolled {
                        debug!(
                            chase_id = %chase_id,
                            qty = scalp.qty,
                            reason = %reason,
                            "scalp cancelled; rolled back into core"
                        );
                    }
                }
            }
        }
    }

    /// An entry chase filled: split into scalp and core buckets, spawn the
    /// scalp round-trip close.
    async fn on_entry_fill(&self, rt: &Arc<SurfRuntime>, fill_price: f64, fill_qty: f64) {
        let (instance_id, sub_account, symbol, scalp_qty, core_qty) = {
            let mut st = rt.state.lock();
            st.record_fill(fill_price, fill_qty, now_ms());
            if st.phase == SurfPhase::Armed {
                st.phase = SurfPhase::StepWait;
            }

            let mut scalp_qty = self
                .connector
                .amount_to_precision(&st.symbol, fill_qty * st.profile.scalp_ratio, RoundMode::Floor)
                .unwrap_or(fill_qty * st.profile.scalp_ratio);
            let min_notional = self
                .connector
                .meta
                .meta(&st.symbol)
                .map(|m| m.min_notional.max(MIN_CHILD_NOTIONAL))
                .unwrap_or(MIN_CHILD_NOTIONAL);
            // A scalp below minimum notional moves wholly into the core.
            if scalp_qty * fill_price < min_notional {
                scalp_qty = 0.0;
            }
            let core_qty = fill_qty - scalp_qty;
            st.absorb_core(fill_price, core_qty);
            (
                st.id.clone(),
                st.sub_account.clone(),
                st.symbol.clone(),
                scalp_qty,
                core_qty,
            )
        };

        info!(
            instance_id = %instance_id,
            fill_price,
            fill_qty,
            scalp_qty,
            core_qty,
            "entry fill split into buckets"
        );
        self.events.publish(GatewayEvent::PumpChaserFill {
            sub_account_id: sub_account,
            instance_id,
            symbol,
            fill_price,
            fill_qty,
            core_qty,
            scalp_qty,
        });

        if scalp_qty > 0.0 {
            self.spawn_scalp(rt, fill_price, scalp_qty).await;
        }
        self.write_snapshot(rt, true).await;
    }

    /// Spawn the reduce-only round-trip close for a scalp bucket at the
    /// spread offset from the entry fill.
    async fn spawn_scalp(&self, rt: &Arc<SurfRuntime>, entry_price: f64, qty: f64) {
        let spec = {
            let st = rt.state.lock();
            let mut spec = ChaseSpec::new(
                &st.sub_account,
                &st.symbol,
                st.side.opposite(),
                qty,
                st.leverage,
            );
            spec.stalk_mode = StalkMode::Trail;
            spec.stalk_offset_pct = st.profile.spread_offset_pct;
            spec.order_kind = OrderKind::SurfScalp;
            spec.reduce_only = true;
            spec.internal = true;
            spec.parent_scalper_id = Some(st.id.clone());
            // Anchor the initial target at the fill price so the first order
            // rests at entry × (1 ∓ spread).
            spec.client_quote = Some((entry_price, entry_price));
            spec.outcome_tx = Some(rt.outcome_tx.clone());
            spec
        };

        match self.chase.start(spec).await {
            Ok(chase_id) => {
                rt.state.lock().register_scalp(chase_id, entry_price, qty);
            }
            Err(e) => {
                // No round-trip possible; fold the scalp into the core.
                warn!(code = e.code(), "scalp chase spawn failed; folding into core");
                rt.state.lock().absorb_core(entry_price, qty);
            }
        }
    }

    async fn on_scalp_fill(&self, rt: &Arc<SurfRuntime>, chase_id: &str, exit_price: f64) {
        let settled = rt.state.lock().settle_scalp(chase_id, exit_price, now_ms());
        let Some(trip) = settled else {
            debug!(chase_id, "fill from unknown child chase ignored");
            return;
        };
        let (instance_id, sub_account, symbol, scalp_profit) = {
            let st = rt.state.lock();
            (
                st.id.clone(),
                st.sub_account.clone(),
                st.symbol.clone(),
                st.scalp_profit,
            )
        };
        info!(
            instance_id = %instance_id,
            entry = trip.entry_price,
            exit = trip.exit_price,
            qty = trip.qty,
            profit = trip.profit,
            scalp_profit,
            "scalp round-trip settled"
        );
        self.events.publish(GatewayEvent::PumpChaserScalp {
            sub_account_id: sub_account,
            instance_id,
            symbol,
            entry_price: trip.entry_price,
            exit_price: trip.exit_price,
            quantity: trip.qty,
            profit: trip.profit,
        });
        self.write_snapshot(rt, true).await;
    }

    async fn on_deleverage_fill(&self, rt: &Arc<SurfRuntime>, fill_price: f64, fill_qty: f64) {
        let (instance_id, sub_account, symbol, core_qty_after) = {
            let mut st = rt.state.lock();
            st.reduce_core(fill_qty);
            st.record_deleverage_fill(fill_price, fill_qty, now_ms());
            (
                st.id.clone(),
                st.sub_account.clone(),
                st.symbol.clone(),
                st.core.qty,
            )
        };
        info!(
            instance_id = %instance_id,
            fill_price,
            fill_qty,
            core_qty_after,
            "deleverage slice filled"
        );
        self.events.publish(GatewayEvent::PumpChaserDeleverage {
            sub_account_id: sub_account,
            instance_id,
            symbol,
            fill_price,
            fill_qty,
            core_qty_after,
        });
        self.write_snapshot(rt, true).await;
    }

    // -------------------------------------------------------------------------
    // Progress, logging, snapshots
    // -------------------------------------------------------------------------

    fn broadcast_progress(&self, rt: &Arc<SurfRuntime>) {
        if !rt.progress_throttle.try_fire() {
            return;
        }
        let st = rt.state.lock();
        // The deleverage block carries only the live chase id, never a stale
        // field.
        let deleverage_chase_id = rt.deleverage_chase_id.lock().clone();
        self.events.publish(GatewayEvent::PumpChaserProgress {
            sub_account_id: st.sub_account.clone(),
            instance_id: st.id.clone(),
            symbol: st.symbol.clone(),
            phase: st.phase.to_string(),
            amplitude: st.amplitude,
            extreme: st.extreme,
            gate: st.gate,
            core_qty: st.core.qty,
            core_notional: st.core.notional,
            scalp_profit: st.scalp_profit,
            deleverage_chase_id,
        });
    }

    fn live_log(&self, rt: &Arc<SurfRuntime>) {
        if !rt.live_log_throttle.try_fire() {
            return;
        }
        let st = rt.state.lock();
        info!(
            instance_id = %st.id,
            symbol = %st.symbol,
            phase = %st.phase,
            amplitude = format!("{:.3}", st.amplitude),
            extreme = st.extreme,
            gate = st.gate,
            core_qty = st.core.qty,
            core_vwap = st.core.vwap,
            scalp_profit = st.scalp_profit,
            fills = st.fills.len(),
            "surf live"
        );
    }

    async fn write_snapshot(&self, rt: &Arc<SurfRuntime>, force: bool) {
        if !force && !rt.snapshot_throttle.try_fire() {
            return;
        }
        let (key, payload) = {
            let st = rt.state.lock();
            match serde_json::to_string(&*st) {
                Ok(json) => (format!("momentum:{}", st.id), json),
                Err(e) => {
                    warn!(error = %e, "momentum state serialization failed");
                    return;
                }
            }
        };
        if let Err(e) = self.snapshots.set(&key, &payload, SNAPSHOT_TTL_SECS).await {
            warn!(key = %key, error = %e, "momentum snapshot write failed");
        }
    }

    // -------------------------------------------------------------------------
    // Restart recovery & cleanup
    // -------------------------------------------------------------------------

    /// Rehydrate instances from snapshots. Child chases recover through the
    /// chase engine's own snapshots but lose their parent channel, so pending
    /// scalps are folded back into the core for a consistent inventory.
    pub async fn resume_from_snapshots(self: &Arc<Self>) {
        let entries = match self.snapshots.list_prefix("momentum:").await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "momentum snapshot listing failed");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "resuming momentum instances from snapshots");

        for (key, payload) in entries {
            let mut state: MomentumState = match serde_json::from_str(&payload) {
                Ok(state) => state,
                Err(e) => {
                    warn!(key = %key, error = %e, "unreadable momentum snapshot; deleting");
                    let _ = self.snapshots.delete(&key).await;
                    continue;
                }
            };
            if matches!(state.phase, SurfPhase::Stopped) {
                let _ = self.snapshots.delete(&key).await;
                continue;
            }

            let orphaned: Vec<String> = state
                .pending_scalps
                .iter()
                .map(|s| s.chase_id.clone())
                .collect();
            for cid in orphaned {
                state.rollback_scalp(&cid);
            }
            // Re-arm through the normal tick path.
            if state.phase == SurfPhase::Armed {
                state.phase = SurfPhase::StepWait;
            }

            info!(instance_id = %state.id, symbol = %state.symbol, phase = %state.phase, "momentum instance restored");
            self.install(state).await;
        }
    }

    /// Stop instances with no tick for 5 minutes. Run every 60 s.
    pub async fn cleanup_sweep(&self) {
        let stale: Vec<String> = self
            .instances
            .iter()
            .filter(|e| e.value().last_tick.lock().elapsed() > STALE_AFTER)
            .map(|e| e.key().clone())
            .collect();
        for id in stale {
            warn!(instance_id = %id, "momentum instance stale; stopping");
            if let Err(e) = self.stop(&id, "stale").await {
                warn!(instance_id = %id, error = %e, "stale stop failed");
            }
        }
    }

    /// Politely stop everything (process shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id, "shutdown").await {
                warn!(instance_id = %id, error = %e, "shutdown stop failed");
            }
        }
    }
}

impl std::fmt::Debug for MomentumEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MomentumEngine")
            .field("active", &self.instances.len())
            .field("max_instances", &self.max_instances)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerStore;
    use crate::reconciler::Reconciler;

    fn test_engine() -> (Arc<MomentumEngine>, Arc<PriceCache>) {
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
        let chase = Arc::new(ChaseEngine::new(
            connector.clone(),
            prices.clone(),
            ledger,
            snapshots.clone(),
            events.clone(),
            reconciler,
            500,
        ));
        (
            Arc::new(MomentumEngine::new(
                connector, prices.clone(), snapshots, events, chase, 50,
            )),
            prices,
        )
    }

    fn request() -> MomentumRequest {
        MomentumRequest {
            sub_account: "acct".into(),
            symbol: "XYZ/USDT:USDT".into(),
            side: Side::Short,
            leverage: 5,
            max_notional: 10_000.0,
            profile: Some("mid-cap".into()),
        }
    }

    #[tokio::test]
    async fn start_requires_a_price() {
        let (engine, _prices) = test_engine();
        let err = engine.start(request()).await.unwrap_err();
        assert_eq!(err.code(), "PRICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn start_and_stop_lifecycle() {
        let (engine, prices) = test_engine();
        prices.ingest_mark("XYZ/USDT:USDT", 10.0);

        let id = engine.start(request()).await.unwrap();
        assert_eq!(engine.active_count(), 1);
        let state = engine.get_state(&id).unwrap();
        assert_eq!(state.phase, SurfPhase::Idle);
        assert_eq!(state.start_price, 10.0);
        assert_eq!(state.profile.name, "mid-cap");

        // Snapshot exists while running.
        let snap = engine.snapshots.get(&format!("momentum:{id}")).await.unwrap();
        assert!(snap.is_some());

        engine.stop(&id, "test").await.unwrap();
        assert_eq!(engine.active_count(), 0);
        let snap = engine.snapshots.get(&format!("momentum:{id}")).await.unwrap();
        assert!(snap.is_none());
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected() {
        let (engine, prices) = test_engine();
        prices.ingest_mark("XYZ/USDT:USDT", 10.0);
        let mut req = request();
        req.profile = Some("mega-cap".into());
        assert_eq!(engine.start(req).await.unwrap_err().code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn capacity_cap_is_enforced() {
        let (engine, prices) = test_engine();
        prices.ingest_mark("XYZ/USDT:USDT", 10.0);
        // Shrink the cap by filling the table.
        for _ in 0..50 {
            engine.start(request()).await.unwrap();
        }
        assert_eq!(
            engine.start(request()).await.unwrap_err().code(),
            "CAPACITY_EXCEEDED"
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn resume_folds_pending_scalps_into_core() {
        let (engine, prices) = test_engine();
        prices.ingest_mark("XYZ/USDT:USDT", 10.0);
        let id = engine.start(request()).await.unwrap();

        // Simulate a snapshot with a pending scalp and an armed phase.
        {
            let rt = engine.instances.get(&id).unwrap().value().clone();
            let mut st = rt.state.lock();
            st.phase = SurfPhase::Armed;
            st.register_scalp("ghost-chase".into(), 10.0, 2.0);
        }
        let rt_for_snapshot = engine.instances.get(&id).unwrap().value().clone();
        engine.write_snapshot(&rt_for_snapshot, true).await;

        // Drop the live instance without deleting the snapshot (crash).
        let rt = engine.instances.get(&id).unwrap().value().clone();
        engine.instances.remove(&id);
        if let Some(h) = rt.tick_task.lock().take() {
            h.abort();
        }
        if let Some(h) = rt.outcome_task.lock().take() {
            h.abort();
        }

        engine.resume_from_snapshots().await;
        let state = engine.get_state(&id).unwrap();
        assert_eq!(state.phase, SurfPhase::StepWait); // armed demotes to step-wait
        assert!(state.pending_scalps.is_empty());
        assert!((state.core.qty - 2.0).abs() < 1e-9); // scalp folded back
        engine.shutdown().await;
    }
}
