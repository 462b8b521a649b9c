// =============================================================================
// Order Reconciler — exchange order events into idempotent ledger updates
// =============================================================================
//
// Two inputs converge here:
//   - fast path: user-stream order updates (handle_exchange_order_update);
//   - slow path: a 5-minute safety-net poll over pending orders.
//
// Plus the chase engines' dedicated entry point (process_chase_order_fill),
// which tolerates stale exchange ids left behind by repricing.
//
// Races between the paths are absorbed by a 30 s recently-processed TTL set,
// the order's own terminal status (durable idempotency), and a symbol-scoped
// advisory lock around orphan reconciliation.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::events::{EventBroadcaster, GatewayEvent};
use crate::exchange::connector::ExchangeConnector;
use crate::ledger::{LedgerStore, PendingOrder, TradeExecution};
use crate::types::{now_ms, OrderKind, OrderStatus};
use crate::util::ttl_map::{LockTable, TtlMap};

/// Debounce window for duplicate order events and re-reconciliation.
const PROCESSED_TTL: Duration = Duration::from_secs(30);
/// Advisory lock TTL for orphan reconciliation.
const RECONCILE_LOCK_TTL: Duration = Duration::from_secs(30);
/// Poll batch size (orders per chunk).
const POLL_BATCH_SIZE: usize = 10;
/// Orders unknown to the exchange older than this are expired.
const UNKNOWN_ORDER_EXPIRY: Duration = Duration::from_secs(60);
/// Orders that never obtained an exchange id are expired after this.
const IDLESS_ORDER_EXPIRY: Duration = Duration::from_secs(48 * 3600);
/// Relative balance change treated as drift.
const BALANCE_DRIFT_THRESHOLD: f64 = 0.0001;

/// Normalized user-stream order update.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub exchange_order_id: u64,
    pub status: String,
    pub avg_price: f64,
    pub price: f64,
    pub filled_qty: f64,
}

/// A chase fill observed by the chase engine (any of its three sources).
#[derive(Debug, Clone)]
pub struct ChaseFillReport {
    pub exchange_order_id: Option<u64>,
    pub sub_account: String,
    pub symbol: String,
    pub fill_price: f64,
    pub fill_qty: f64,
}

pub struct Reconciler {
    connector: Arc<ExchangeConnector>,
    ledger: LedgerStore,
    events: EventBroadcaster,
    /// Short-term dedup of stream/poll double delivery.
    processed: TtlMap,
    /// Symbols reconciled recently; skipped by the next orphan cycle.
    recently_reconciled: TtlMap,
    /// Symbol-scoped advisory locks for orphan reconciliation.
    locks: LockTable,
    /// Last balance snapshot for drift warnings: (asset, total).
    last_balances: Mutex<Vec<(String, f64)>>,
}

impl Reconciler {
    pub fn new(
        connector: Arc<ExchangeConnector>,
        ledger: LedgerStore,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            connector,
            ledger,
            events,
            processed: TtlMap::new(PROCESSED_TTL),
            recently_reconciled: TtlMap::new(PROCESSED_TTL),
            locks: LockTable::new(RECONCILE_LOCK_TTL),
            last_balances: Mutex::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Fast path: user-stream events
    // -------------------------------------------------------------------------

    /// Route one user-stream order update. Only terminal statuses act; chase
    /// orders are excluded (they use [`Self::process_chase_order_fill`]).
    pub async fn handle_exchange_order_update(&self, update: OrderUpdate) -> Result<()> {
        let status = update.status.to_ascii_uppercase();
        let is_fill = matches!(status.as_str(), "FILLED" | "CLOSED");
        let is_cancel = matches!(status.as_str(), "CANCELED" | "CANCELLED" | "EXPIRED" | "REJECTED");
        if !is_fill && !is_cancel {
            return Ok(());
        }

        if !self.processed.insert(&format!("stream:{}", update.exchange_order_id)) {
            debug!(order_id = update.exchange_order_id, "duplicate stream event ignored");
            return Ok(());
        }

        let Some(order) = self
            .ledger
            .find_pending_by_exchange_id(update.exchange_order_id, None, true)
            .await?
        else {
            debug!(order_id = update.exchange_order_id, "stream event for untracked order");
            return Ok(());
        };

        if is_fill {
            let fill_price = if update.avg_price > 0.0 {
                update.avg_price
            } else if update.price > 0.0 {
                update.price
            } else {
                order.price
            };
            let fill_qty = if update.filled_qty > 0.0 {
                update.filled_qty
            } else {
                order.quantity
            };
            self.handle_order_filled(&order, fill_price, fill_qty).await
        } else {
            self.ledger
                .update_order_status(&order.id, OrderStatus::Cancelled)
                .await?;
            self.events.publish(GatewayEvent::OrderCancelled {
                sub_account_id: order.sub_account.clone(),
                order_id: order.id.clone(),
                symbol: order.symbol.clone(),
                reason: status.to_lowercase(),
            });
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Fill handling (shared by both paths)
    // -------------------------------------------------------------------------

    /// Apply one fill to the ledger: close/partial-close an opposite position,
    /// or open/average a same-side one. Idempotent: a second call for an
    /// already-FILLED order is a no-op (invariant: exactly one execution per
    /// fill).
    pub async fn handle_order_filled(
        &self,
        order: &PendingOrder,
        fill_price: f64,
        fill_qty: f64,
    ) -> Result<()> {
        // Durable idempotency: re-read the order and bail on terminal status.
        let current = self
            .ledger
            .get_pending_order(&order.id)
            .await?
            .with_context(|| format!("pending order {} vanished", order.id))?;
        if current.status != OrderStatus::Pending {
            debug!(order_id = %order.id, status = %current.status, "fill already processed");
            return Ok(());
        }

        let opposite = self
            .ledger
            .find_open_position(&order.sub_account, &order.symbol, order.side.opposite())
            .await?;

        let (exec_kind, realized) = match opposite {
            // ── Close path ───────────────────────────────────────────────
            Some(pos) => {
                let full = fill_qty >= pos.quantity * (1.0 - 1e-9);
                if full {
                    let (closed, pnl) = self.ledger.close_by_price(&pos.id, fill_price).await?;
                    self.events.publish(GatewayEvent::PositionClosed {
                        sub_account_id: closed.sub_account.clone(),
                        position_id: closed.id.clone(),
                        symbol: closed.symbol.clone(),
                        close_price: fill_price,
                        realized_pnl: pnl,
                    });
                    ("close", Some(pnl))
                } else {
                    let fraction = fill_qty / pos.quantity;
                    let (reduced, pnl) = self
                        .ledger
                        .partial_close(&pos.id, fraction, fill_price)
                        .await?;
                    self.events.publish(GatewayEvent::PositionReduced {
                        sub_account_id: reduced.sub_account.clone(),
                        position_id: reduced.id.clone(),
                        symbol: reduced.symbol.clone(),
                        closed_qty: fill_qty,
                        remaining_qty: reduced.quantity,
                        realized_pnl: pnl,
                    });
                    ("partial_close", Some(pnl))
                }
            }
            // ── Open path ────────────────────────────────────────────────
            None => {
                let existing = self
                    .ledger
                    .find_open_position(&order.sub_account, &order.symbol, order.side)
                    .await?;
                let (pos, kind) = match existing {
                    Some(pos) => (
                        self.ledger.average_into(&pos.id, fill_price, fill_qty).await?,
                        "add",
                    ),
                    None => (
                        self.ledger
                            .create_position(
                                &order.sub_account,
                                &order.symbol,
                                order.side,
                                fill_price,
                                fill_qty,
                                order.leverage,
                            )
                            .await?,
                        "open",
                    ),
                };
                self.events.publish(GatewayEvent::PositionUpdated {
                    sub_account_id: pos.sub_account.clone(),
                    position_id: pos.id.clone(),
                    symbol: pos.symbol.clone(),
                    entry_price: pos.entry_price,
                    quantity: pos.quantity,
                    notional: pos.notional,
                });
                (kind, None)
            }
        };

        // Append the audit record with its idempotency signature.
        let ts = now_ms();
        let exec = TradeExecution {
            id: Uuid::new_v4().to_string(),
            sub_account: order.sub_account.clone(),
            kind: exec_kind.to_string(),
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price: fill_price,
            quantity: fill_qty,
            realized_pnl: realized,
            signature: execution_signature(&order.sub_account, exec_kind, &order.id, ts),
            ts,
        };
        self.ledger.insert_execution(&exec).await?;

        self.ledger
            .update_order_status(&order.id, OrderStatus::Filled)
            .await?;

        self.events.publish(GatewayEvent::OrderFilled {
            sub_account_id: order.sub_account.clone(),
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side.as_str().to_string(),
            order_kind: order.kind.as_str().to_string(),
            fill_price,
            fill_qty,
            suppress_toast: order.kind.is_algorithmic(),
        });

        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            kind = exec_kind,
            fill_price,
            fill_qty,
            "order fill reconciled"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Chase entry point
    // -------------------------------------------------------------------------

    /// Reconcile a chase fill. The ledger's `exchange_order_id` may be stale
    /// after repricing, so the primary id lookup falls back to the most recent
    /// pending chase for (account, symbol), and the fresh id is upserted.
    pub async fn process_chase_order_fill(&self, report: ChaseFillReport) -> Result<()> {
        let mut order = None;
        if let Some(xid) = report.exchange_order_id {
            order = self
                .ledger
                .find_pending_by_exchange_id(xid, Some(OrderKind::ChaseLimit), false)
                .await?;
        }
        if order.is_none() {
            order = self
                .ledger
                .latest_pending_chase(&report.sub_account, &report.symbol)
                .await?;
        }
        let Some(order) = order else {
            warn!(
                symbol = %report.symbol,
                exchange_order_id = ?report.exchange_order_id,
                "chase fill with no matching pending order"
            );
            return Ok(());
        };

        if let Some(xid) = report.exchange_order_id {
            if order.exchange_order_id != Some(xid) {
                self.ledger.set_exchange_order_id(&order.id, xid).await?;
            }
        }

        self.handle_order_filled(&order, report.fill_price, report.fill_qty)
            .await
    }

    // -------------------------------------------------------------------------
    // Slow path: periodic poll
    // -------------------------------------------------------------------------

    /// One safety-net poll pass over pending non-chase orders, oldest first,
    /// in batches of [`POLL_BATCH_SIZE`].
    pub async fn poll_once(&self) -> Result<()> {
        let orders = self.ledger.pending_orders_excluding_chase().await?;
        if orders.is_empty() {
            return Ok(());
        }
        debug!(pending = orders.len(), "order poll cycle started");

        for chunk in orders.chunks(POLL_BATCH_SIZE) {
            for order in chunk {
                if let Err(e) = self.poll_order(order).await {
                    warn!(order_id = %order.id, error = %e, "order poll failed");
                }
            }
        }
        Ok(())
    }

    async fn poll_order(&self, order: &PendingOrder) -> Result<()> {
        let age_ms = now_ms() - order.created_at;

        let Some(xid) = order.exchange_order_id else {
            // Never reached the exchange; expire after the long grace window.
            if age_ms > IDLESS_ORDER_EXPIRY.as_millis() as i64 {
                warn!(order_id = %order.id, "expiring order with no exchange id");
                self.expire_order(order).await?;
            }
            return Ok(());
        };

        match self.connector.query_order(&order.symbol, xid).await {
            Ok(body) => {
                let status = body["status"].as_str().unwrap_or("").to_ascii_uppercase();
                match status.as_str() {
                    "FILLED" => {
                        if self.processed.insert(&format!("stream:{xid}")) {
                            let fill_price = body["avgPrice"]
                                .as_str()
                                .and_then(|s| s.parse().ok())
                                .filter(|p: &f64| *p > 0.0)
                                .unwrap_or(order.price);
                            let fill_qty = body["executedQty"]
                                .as_str()
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(order.quantity);
                            self.handle_order_filled(order, fill_price, fill_qty).await?;
                        }
                    }
                    "CANCELED" | "CANCELLED" | "EXPIRED" => {
                        self.ledger
                            .update_order_status(&order.id, OrderStatus::Cancelled)
                            .await?;
                        self.events.publish(GatewayEvent::OrderCancelled {
                            sub_account_id: order.sub_account.clone(),
                            order_id: order.id.clone(),
                            symbol: order.symbol.clone(),
                            reason: status.to_lowercase(),
                        });
                    }
                    _ => {} // NEW / PARTIALLY_FILLED: leave pending
                }
            }
            Err(GatewayError::ExchangeUnknownOrder) => {
                // Unknown and young: grace period (a just-placed order can lag).
                if age_ms > UNKNOWN_ORDER_EXPIRY.as_millis() as i64 {
                    warn!(order_id = %order.id, xid, "expiring order unknown to the exchange");
                    self.expire_order(order).await?;
                }
            }
            Err(e) => {
                debug!(order_id = %order.id, code = e.code(), "order poll query failed");
            }
        }
        Ok(())
    }

    async fn expire_order(&self, order: &PendingOrder) -> Result<()> {
        self.ledger
            .update_order_status(&order.id, OrderStatus::Expired)
            .await?;
        self.events.publish(GatewayEvent::OrderCancelled {
            sub_account_id: order.sub_account.clone(),
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            reason: "expired".to_string(),
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orphan sweep: virtual positions with no live exchange position
    // -------------------------------------------------------------------------

    /// One reconcile cycle: close virtual positions whose symbol has no live
    /// exchange position, serialized per symbol by an advisory lock and
    /// debounced against the stream-driven path.
    pub async fn reconcile_positions_once(&self) -> Result<()> {
        let open = self.ledger.open_positions().await?;
        if open.is_empty() {
            return Ok(());
        }

        let live = self.connector.position_risk().await?;
        let live_symbols: std::collections::HashSet<String> = live
            .iter()
            .filter_map(|p| {
                let qty: f64 = p["positionAmt"].as_str()?.parse().ok()?;
                if qty.abs() > 0.0 {
                    let raw = p["symbol"].as_str()?;
                    self.connector.meta.to_canonical(raw)
                } else {
                    None
                }
            })
            .collect();

        let holder = Uuid::new_v4().to_string();
        for pos in open {
            if live_symbols.contains(&pos.symbol) {
                continue;
            }
            if self.recently_reconciled.contains(&pos.symbol) {
                debug!(symbol = %pos.symbol, "orphan skip: recently reconciled");
                continue;
            }
            if let Err(owner) = self.locks.try_acquire(&pos.symbol, &holder) {
                debug!(symbol = %pos.symbol, owner = %owner, "orphan skip: lock held");
                continue;
            }

            let close_price = self
                .connector
                .mark(&pos.symbol)
                .or_else(|| self.connector.quote(&pos.symbol).map(|(b, a)| (b + a) / 2.0));
            let Some(close_price) = close_price else {
                warn!(symbol = %pos.symbol, "orphan position has no price; skipping");
                self.locks.release(&pos.symbol, &holder);
                continue;
            };

            warn!(
                position_id = %pos.id,
                symbol = %pos.symbol,
                close_price,
                "orphaned virtual position — reconciling against exchange"
            );

            match self.ledger.close_by_price(&pos.id, close_price).await {
                Ok((closed, pnl)) => {
                    self.events.publish(GatewayEvent::PositionClosed {
                        sub_account_id: closed.sub_account.clone(),
                        position_id: closed.id.clone(),
                        symbol: closed.symbol.clone(),
                        close_price,
                        realized_pnl: pnl,
                    });
                    self.recently_reconciled.insert(&pos.symbol);
                }
                Err(e) => warn!(position_id = %pos.id, error = %e, "orphan reconcile failed"),
            }
            self.locks.release(&pos.symbol, &holder);
        }

        self.locks.evict_expired();
        self.processed.evict_expired();
        self.recently_reconciled.evict_expired();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Balance refresh (runs with the reconcile sweep)
    // -------------------------------------------------------------------------

    /// Refresh the balance snapshot and warn on significant drift.
    pub async fn refresh_balances(&self) -> Result<bool> {
        let raw = self.connector.balance().await?;
        let mut fresh: Vec<(String, f64)> = raw
            .iter()
            .filter_map(|b| {
                let asset = b["asset"].as_str()?.to_string();
                let total: f64 = b["balance"].as_str()?.parse().ok()?;
                if total != 0.0 {
                    Some((asset, total))
                } else {
                    None
                }
            })
            .collect();
        fresh.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| {
            a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
        }));

        let drift = {
            let old = self.last_balances.lock();
            detect_balance_drift(&old, &fresh)
        };
        if drift {
            warn!("balance drift detected during reconciliation");
        }
        *self.last_balances.lock() = fresh;
        Ok(drift)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("processed", &self.processed)
            .field("recently_reconciled", &self.recently_reconciled)
            .finish()
    }
}

/// Idempotency signature for a trade execution.
pub fn execution_signature(sub_account: &str, kind: &str, order_id: &str, ts: i64) -> String {
    let nonce = Uuid::new_v4();
    let mut hasher = Sha256::new();
    hasher.update(sub_account.as_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(order_id.as_bytes());
    hasher.update(ts.to_string().as_bytes());
    hasher.update(nonce.as_bytes());
    hex::encode(hasher.finalize())
}

/// True when any tracked asset moved more than the relative threshold, or
/// appeared/disappeared. First run never drifts.
fn detect_balance_drift(old: &[(String, f64)], new: &[(String, f64)]) -> bool {
    use std::collections::HashMap;

    if old.is_empty() {
        return false;
    }
    let old_map: HashMap<&str, f64> = old.iter().map(|(a, t)| (a.as_str(), *t)).collect();

    for (asset, total) in new {
        match old_map.get(asset.as_str()) {
            Some(&prev) if prev != 0.0 => {
                if ((total - prev) / prev).abs() > BALANCE_DRIFT_THRESHOLD {
                    return true;
                }
            }
            Some(_) => {
                if *total != 0.0 {
                    return true;
                }
            }
            None => return true,
        }
    }

    let new_map: HashMap<&str, ()> = new.iter().map(|(a, _)| (a.as_str(), ())).collect();
    old.iter().any(|(a, t)| *t != 0.0 && !new_map.contains_key(a.as_str()))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerStore;
    use crate::price_cache::PriceCache;
    use crate::snapshots::SnapshotStore;
    use crate::types::Side;

    fn test_connector() -> Arc<ExchangeConnector> {
        Arc::new(ExchangeConnector::new(
            "",
            "",
            "https://localhost.invalid",
            "wss://localhost.invalid",
            Arc::new(PriceCache::new()),
            SnapshotStore::open_in_memory().unwrap(),
        ))
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(
            test_connector(),
            LedgerStore::open_in_memory().unwrap(),
            EventBroadcaster::new(),
        )
    }

    #[tokio::test]
    async fn fill_opens_then_averages_position() {
        let r = reconciler();
        let o1 = r
            .ledger
            .create_pending_order("acct", "BTC/USDT:USDT", Side::Long, OrderKind::Limit,
                100.0, 1.0, 10, Some(1))
            .await
            .unwrap();
        r.handle_order_filled(&o1, 100.0, 1.0).await.unwrap();

        let pos = r
            .ledger
            .find_open_position("acct", "BTC/USDT:USDT", Side::Long)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pos.entry_price, 100.0);
        assert_eq!(pos.quantity, 1.0);

        let o2 = r
            .ledger
            .create_pending_order("acct", "BTC/USDT:USDT", Side::Long, OrderKind::Limit,
                130.0, 0.5, 10, Some(2))
            .await
            .unwrap();
        r.handle_order_filled(&o2, 130.0, 0.5).await.unwrap();

        let pos = r
            .ledger
            .find_open_position("acct", "BTC/USDT:USDT", Side::Long)
            .await
            .unwrap()
            .unwrap();
        // (100·1 + 130·0.5) / 1.5 = 110.
        assert!((pos.entry_price - 110.0).abs() < 1e-9);
        assert!((pos.notional - pos.entry_price * pos.quantity).abs() < 1e-6);
    }

    #[tokio::test]
    async fn duplicate_fill_appends_exactly_one_execution() {
        let r = reconciler();
        let order = r
            .ledger
            .create_pending_order("acct", "ETH/USDT:USDT", Side::Long, OrderKind::ChaseLimit,
                50.0, 2.0, 5, Some(7))
            .await
            .unwrap();
        r.handle_order_filled(&order, 50.0, 2.0).await.unwrap();
        r.handle_order_filled(&order, 50.0, 2.0).await.unwrap();

        let execs = r.ledger.executions_for_order(&order.id).await.unwrap();
        assert_eq!(execs.len(), 1, "idempotency under duplicate fill calls");
        let got = r.ledger.get_pending_order(&order.id).await.unwrap().unwrap();
        assert_eq!(got.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn opposite_side_fill_partially_closes() {
        let r = reconciler();
        // Existing open LONG of 5.
        let pos = r
            .ledger
            .create_position("acct", "SOL/USDT:USDT", Side::Long, 40.0, 5.0, 4)
            .await
            .unwrap();

        // SELL fill of 2 at 50 closes 2/5: pnl = 10 × 2 = 20.
        let sell = r
            .ledger
            .create_pending_order("acct", "SOL/USDT:USDT", Side::Short, OrderKind::Limit,
                50.0, 2.0, 4, Some(9))
            .await
            .unwrap();
        r.handle_order_filled(&sell, 50.0, 2.0).await.unwrap();

        let pos = r.ledger.get_position(&pos.id).await.unwrap().unwrap();
        assert!((pos.quantity - 3.0).abs() < 1e-9);
        assert!((pos.realized_pnl - 20.0).abs() < 1e-9);
        // No SHORT position was opened.
        assert!(r
            .ledger
            .find_open_position("acct", "SOL/USDT:USDT", Side::Short)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stream_updates_dedup_and_ignore_non_terminal() {
        let r = reconciler();
        let order = r
            .ledger
            .create_pending_order("acct", "XRP/USDT:USDT", Side::Long, OrderKind::Limit,
                1.0, 10.0, 2, Some(42))
            .await
            .unwrap();

        // Non-terminal: ignored.
        r.handle_exchange_order_update(OrderUpdate {
            exchange_order_id: 42,
            status: "PARTIALLY_FILLED".into(),
            avg_price: 1.0,
            price: 1.0,
            filled_qty: 4.0,
        })
        .await
        .unwrap();
        assert_eq!(
            r.ledger.get_pending_order(&order.id).await.unwrap().unwrap().status,
            OrderStatus::Pending
        );

        // Terminal fill processes once; the duplicate is debounced.
        for _ in 0..2 {
            r.handle_exchange_order_update(OrderUpdate {
                exchange_order_id: 42,
                status: "FILLED".into(),
                avg_price: 1.01,
                price: 1.0,
                filled_qty: 10.0,
            })
            .await
            .unwrap();
        }
        let execs = r.ledger.executions_for_order(&order.id).await.unwrap();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].price, 1.01);
    }

    #[tokio::test]
    async fn chase_fill_falls_back_to_latest_pending_chase() {
        let r = reconciler();
        let order = r
            .ledger
            .create_pending_order("acct", "BTC/USDT:USDT", Side::Long, OrderKind::ChaseLimit,
                100.0, 1.0, 10, Some(1000))
            .await
            .unwrap();

        // The fill reports a fresher exchange id than the ledger knows.
        r.process_chase_order_fill(ChaseFillReport {
            exchange_order_id: Some(1003),
            sub_account: "acct".into(),
            symbol: "BTC/USDT:USDT".into(),
            fill_price: 100.5,
            fill_qty: 1.0,
        })
        .await
        .unwrap();

        let got = r.ledger.get_pending_order(&order.id).await.unwrap().unwrap();
        assert_eq!(got.status, OrderStatus::Filled);
        assert_eq!(got.exchange_order_id, Some(1003));
    }

    #[test]
    fn signatures_are_unique_per_call() {
        let a = execution_signature("acct", "open", "o1", 1);
        let b = execution_signature("acct", "open", "o1", 1);
        assert_ne!(a, b); // the uuid nonce guarantees uniqueness
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn balance_drift_detection() {
        let old = vec![("USDT".to_string(), 1000.0)];
        assert!(!detect_balance_drift(&[], &old));
        assert!(!detect_balance_drift(&old, &[("USDT".to_string(), 1000.05)]));
        assert!(detect_balance_drift(&old, &[("USDT".to_string(), 900.0)]));
        assert!(detect_balance_drift(&old, &[]));
        assert!(detect_balance_drift(
            &old,
            &[("USDT".to_string(), 1000.0), ("BTC".to_string(), 1.0)]
        ));
    }
}
