// =============================================================================
// Gateway — central wiring and process lifecycle
// =============================================================================
//
// Composes the connector, stores, engines, and broadcaster, and owns the
// periodic sweeps:
//
//   chase fill sweep        30 s
//   momentum stale cleanup  60 s
//   reconciler order poll    5 min
//   reconciler orphan sweep 60 s  (with balance refresh)
//   risk liquidation watch  10 s
//   stream idle cleanup     60 s
//   snapshot TTL purge      60 s
//
// `initialize()` brings the connector ready and resumes both engines from
// snapshots; `shutdown()` unwinds everything politely.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::chase::ChaseEngine;
use crate::config::GatewayConfig;
use crate::events::EventBroadcaster;
use crate::exchange::connector::ExchangeConnector;
use crate::ledger::LedgerStore;
use crate::momentum::MomentumEngine;
use crate::price_cache::PriceCache;
use crate::reconciler::{OrderUpdate, Reconciler};
use crate::risk_gate::RiskGate;
use crate::snapshots::SnapshotStore;

const CHASE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const MOMENTUM_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(300);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
const RISK_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const STREAM_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const STALE_STREAM_THRESHOLD: Duration = Duration::from_secs(10);
const SNAPSHOT_PURGE_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Gateway {
    pub config: GatewayConfig,
    pub prices: Arc<PriceCache>,
    pub snapshots: SnapshotStore,
    pub ledger: LedgerStore,
    pub connector: Arc<ExchangeConnector>,
    pub events: EventBroadcaster,
    pub reconciler: Arc<Reconciler>,
    pub chase: Arc<ChaseEngine>,
    pub momentum: Arc<MomentumEngine>,
    pub risk: Arc<RiskGate>,
    sweeps: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// Build the full component graph (no I/O yet).
    pub fn new(config: GatewayConfig, api_key: String, api_secret: String) -> Result<Arc<Self>> {
        let prices = Arc::new(PriceCache::new());
        let snapshots = SnapshotStore::open(&config.db_path).context("open snapshot store")?;
        let ledger = LedgerStore::open(&config.db_path).context("open ledger store")?;
        let events = EventBroadcaster::new();

        let connector = Arc::new(ExchangeConnector::new(
            api_key,
            api_secret,
            config.rest_base.clone(),
            config.ws_base.clone(),
            prices.clone(),
            snapshots.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(
            connector.clone(),
            ledger.clone(),
            events.clone(),
        ));

        let chase = Arc::new(ChaseEngine::new(
            connector.clone(),
            prices.clone(),
            ledger.clone(),
            snapshots.clone(),
            events.clone(),
            reconciler.clone(),
            config.max_active_chases,
        ));

        let momentum = Arc::new(MomentumEngine::new(
            connector.clone(),
            prices.clone(),
            snapshots.clone(),
            events.clone(),
            chase.clone(),
            config.max_momentum_instances,
        ));

        let risk = Arc::new(RiskGate::new(
            config.risk.clone(),
            config.frozen_accounts.clone(),
            ledger.clone(),
            prices.clone(),
            events.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            prices,
            snapshots,
            ledger,
            connector,
            events,
            reconciler,
            chase,
            momentum,
            risk,
            sweeps: Mutex::new(Vec::new()),
        }))
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Bring the connector ready, resume both engines, start the sweeps.
    pub async fn initialize(self: &Arc<Self>) {
        self.connector.bootstrap().await;
        self.chase.resume_from_snapshots().await;
        self.momentum.resume_from_snapshots().await;
        self.start_sweeps();
        info!("gateway initialised");
    }

    fn start_sweeps(self: &Arc<Self>) {
        let mut sweeps = self.sweeps.lock();

        let chase = self.chase.clone();
        sweeps.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHASE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                chase.sweep_once().await;
            }
        }));

        let momentum = self.momentum.clone();
        sweeps.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(MOMENTUM_CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                momentum.cleanup_sweep().await;
            }
        }));

        let reconciler = self.reconciler.clone();
        sweeps.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ORDER_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = reconciler.poll_once().await {
                    warn!(error = %e, "order poll cycle failed");
                }
            }
        }));

        let reconciler = self.reconciler.clone();
        sweeps.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = reconciler.reconcile_positions_once().await {
                    warn!(error = %e, "position reconcile cycle failed");
                }
                if let Err(e) = reconciler.refresh_balances().await {
                    warn!(error = %e, "balance refresh failed");
                }
            }
        }));

        let risk = self.risk.clone();
        sweeps.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(RISK_MONITOR_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = risk.monitor_once().await {
                    warn!(error = %e, "risk monitor cycle failed");
                }
            }
        }));

        let connector = self.connector.clone();
        sweeps.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(STREAM_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                connector.stream_idle_sweep();
                // Stale streams get their group torn down and rebuilt.
                for symbol in connector.stale_symbols(STALE_STREAM_THRESHOLD) {
                    warn!(symbol = %symbol, "market stream stale — forcing resubscribe");
                    connector.force_resubscribe(&symbol);
                }
            }
        }));

        let snapshots = self.snapshots.clone();
        sweeps.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = snapshots.purge_expired().await {
                    warn!(error = %e, "snapshot purge failed");
                }
            }
        }));
    }

    /// Route a user-stream order update: chase fills go straight to their
    /// engine (fastest fill source), everything else to the reconciler.
    pub async fn on_user_stream_order_update(&self, update: OrderUpdate) {
        let status = update.status.to_ascii_uppercase();
        if matches!(status.as_str(), "FILLED" | "CLOSED") {
            let price = if update.avg_price > 0.0 {
                update.avg_price
            } else {
                update.price
            };
            if self
                .chase
                .on_user_stream_fill(update.exchange_order_id, price, update.filled_qty)
                .await
            {
                return;
            }
        }
        if let Err(e) = self.reconciler.handle_exchange_order_update(update).await {
            warn!(error = %e, "user-stream order update failed");
        }
    }

    /// Stop sweeps, cancel engines politely, close streams, wait for REST.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        for handle in self.sweeps.lock().drain(..) {
            handle.abort();
        }
        self.momentum.shutdown().await;
        self.chase.shutdown().await;
        self.connector.shutdown_streams();
        self.connector.drain_order_slots(SHUTDOWN_DRAIN_TIMEOUT).await;
        info!("gateway shut down complete");
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connector", &self.connector)
            .field("chase", &self.chase)
            .field("momentum", &self.momentum)
            .finish()
    }
}
