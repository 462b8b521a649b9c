// =============================================================================
// Risk Gate — pre-trade policy checks and the liquidation monitor
// =============================================================================
//
// Every order an engine or user submits passes `validate` first; failures are
// structured codes the HTTP surface maps to 4xx responses. The monitor loop
// watches open positions against their liquidation price and escalates:
// margin_warning (10 %), adl_triggered (2 %), full_liquidation (crossed).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::RiskLimits;
use crate::errors::{GatewayError, GatewayResult};
use crate::events::{EventBroadcaster, GatewayEvent};
use crate::ledger::LedgerStore;
use crate::price_cache::PriceCache;
use crate::types::Side;
use crate::util::ttl_map::TtlMap;

/// Simplified maintenance-margin rate for ratio estimates.
const MAINTENANCE_MARGIN_RATE: f64 = 0.005;
/// Liquidation-distance thresholds.
const MARGIN_WARNING_DISTANCE: f64 = 0.10;
const ADL_DISTANCE: f64 = 0.02;
/// Per-position warning debounce.
const WARNING_DEBOUNCE: Duration = Duration::from_secs(60);

pub struct RiskGate {
    limits: RiskLimits,
    frozen_accounts: Vec<String>,
    ledger: LedgerStore,
    prices: Arc<PriceCache>,
    events: EventBroadcaster,
    warned: TtlMap,
}

impl RiskGate {
    pub fn new(
        limits: RiskLimits,
        frozen_accounts: Vec<String>,
        ledger: LedgerStore,
        prices: Arc<PriceCache>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            limits,
            frozen_accounts,
            ledger,
            prices,
            events,
            warned: TtlMap::new(WARNING_DEBOUNCE),
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade validation
    // -------------------------------------------------------------------------

    /// Validate a prospective order against account policy.
    pub async fn validate(
        &self,
        sub_account: &str,
        symbol: &str,
        _side: Side,
        quantity: f64,
        leverage: u32,
        reference_price: f64,
    ) -> GatewayResult<()> {
        if self.frozen_accounts.iter().any(|a| a == sub_account) {
            return Err(GatewayError::AccountFrozen(sub_account.to_string()));
        }
        if leverage > self.limits.max_leverage {
            return Err(GatewayError::MaxLeverage {
                requested: leverage,
                max: self.limits.max_leverage,
            });
        }
        if reference_price <= 0.0 {
            return Err(GatewayError::NoPrice(symbol.to_string()));
        }

        let notional = quantity * reference_price;
        if notional > self.limits.max_trade_notional {
            return Err(GatewayError::MaxNotional {
                notional,
                cap: self.limits.max_trade_notional,
            });
        }

        let open = self
            .ledger
            .open_positions()
            .await
            .map_err(|e| GatewayError::SnapshotUnavailable(e.to_string()))?;
        let (mut exposure, mut margin) = (0.0, 0.0);
        for pos in open.iter().filter(|p| p.sub_account == sub_account) {
            exposure += pos.notional;
            margin += pos.margin;
        }

        let exposure_after = exposure + notional;
        if exposure_after > self.limits.max_account_exposure {
            return Err(GatewayError::MaxExposure {
                exposure: exposure_after,
                cap: self.limits.max_account_exposure,
            });
        }

        // Post-trade margin ratio: maintenance requirement over posted margin.
        let margin_after = margin + notional / leverage.max(1) as f64;
        if margin_after > 0.0 {
            let ratio = exposure_after * MAINTENANCE_MARGIN_RATE / margin_after;
            if ratio >= self.limits.margin_ratio_threshold {
                return Err(GatewayError::MarginRatioExceeded {
                    ratio,
                    threshold: self.limits.margin_ratio_threshold,
                });
            }
        }

        Ok(())
    }

    /// Ownership check: the position must exist, be open, and belong to the
    /// account.
    pub async fn check_position_ownership(
        &self,
        sub_account: &str,
        position_id: &str,
    ) -> GatewayResult<()> {
        let pos = self
            .ledger
            .get_position(position_id)
            .await
            .map_err(|e| GatewayError::SnapshotUnavailable(e.to_string()))?
            .ok_or_else(|| GatewayError::PositionNotFound(position_id.to_string()))?;
        if pos.sub_account != sub_account {
            return Err(GatewayError::PositionNotFound(position_id.to_string()));
        }
        if pos.status == crate::types::PositionStatus::Closed {
            return Err(GatewayError::PositionClosed(position_id.to_string()));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Liquidation monitor
    // -------------------------------------------------------------------------

    /// One monitor pass over open positions.
    pub async fn monitor_once(&self) -> Result<()> {
        let open = self.ledger.open_positions().await?;
        for pos in open {
            if pos.babysitter_excluded {
                continue;
            }
            let Some(mark) = self.prices.mark(&pos.symbol) else {
                continue;
            };
            let crossed = match pos.side {
                Side::Long => mark <= pos.liquidation_price,
                Side::Short => mark >= pos.liquidation_price,
            };
            if crossed {
                warn!(
                    position_id = %pos.id,
                    symbol = %pos.symbol,
                    mark,
                    liquidation_price = pos.liquidation_price,
                    "liquidation price crossed — closing position"
                );
                match self.ledger.close_by_price(&pos.id, mark).await {
                    Ok((closed, pnl)) => {
                        self.events.publish(GatewayEvent::FullLiquidation {
                            sub_account_id: closed.sub_account.clone(),
                            position_id: closed.id.clone(),
                            symbol: closed.symbol.clone(),
                            mark_price: mark,
                            realized_pnl: pnl,
                        });
                    }
                    Err(e) => warn!(position_id = %pos.id, error = %e, "liquidation close failed"),
                }
                continue;
            }

            let distance = ((mark - pos.liquidation_price) / mark).abs();
            if distance <= ADL_DISTANCE {
                if self.warned.insert(&format!("adl:{}", pos.id)) {
                    self.events.publish(GatewayEvent::AdlTriggered {
                        sub_account_id: pos.sub_account.clone(),
                        position_id: pos.id.clone(),
                        symbol: pos.symbol.clone(),
                        mark_price: mark,
                        liquidation_price: pos.liquidation_price,
                    });
                }
            } else if distance <= MARGIN_WARNING_DISTANCE {
                if self.warned.insert(&format!("warn:{}", pos.id)) {
                    debug!(position_id = %pos.id, distance, "margin warning");
                    self.events.publish(GatewayEvent::MarginWarning {
                        sub_account_id: pos.sub_account.clone(),
                        position_id: pos.id.clone(),
                        symbol: pos.symbol.clone(),
                        mark_price: mark,
                        liquidation_price: pos.liquidation_price,
                        distance_pct: distance * 100.0,
                    });
                }
            }
        }
        self.warned.evict_expired();
        Ok(())
    }
}

impl std::fmt::Debug for RiskGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGate")
            .field("limits", &self.limits)
            .field("frozen_accounts", &self.frozen_accounts.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> RiskGate {
        RiskGate::new(
            RiskLimits {
                max_leverage: 20,
                max_trade_notional: 10_000.0,
                max_account_exposure: 50_000.0,
                margin_ratio_threshold: 0.80,
            },
            vec!["frozen-acct".to_string()],
            LedgerStore::open_in_memory().unwrap(),
            Arc::new(PriceCache::new()),
            EventBroadcaster::new(),
        )
    }

    #[tokio::test]
    async fn rejects_by_structured_code() {
        let g = gate();
        let err = g
            .validate("frozen-acct", "BTC/USDT:USDT", Side::Long, 1.0, 5, 100.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACCOUNT_FROZEN");

        let err = g
            .validate("acct", "BTC/USDT:USDT", Side::Long, 1.0, 21, 100.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MAX_LEVERAGE");

        let err = g
            .validate("acct", "BTC/USDT:USDT", Side::Long, 1.0, 5, 0.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_PRICE");

        let err = g
            .validate("acct", "BTC/USDT:USDT", Side::Long, 200.0, 5, 100.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MAX_NOTIONAL");

        assert!(g
            .validate("acct", "BTC/USDT:USDT", Side::Long, 10.0, 5, 100.0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn exposure_counts_existing_positions() {
        let g = gate();
        for _ in 0..5 {
            g.ledger
                .create_position("acct", "BTC/USDT:USDT", Side::Long, 100.0, 95.0, 10)
                .await
                .unwrap();
        }
        // Existing exposure 5 × 9 500 = 47 500; another 10 000 would breach 50 000.
        let err = g
            .validate("acct", "ETH/USDT:USDT", Side::Long, 100.0, 10, 100.0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MAX_EXPOSURE");
        // A different account is unaffected.
        assert!(g
            .validate("other", "ETH/USDT:USDT", Side::Long, 100.0, 10, 100.0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn ownership_checks() {
        let g = gate();
        let pos = g
            .ledger
            .create_position("acct", "BTC/USDT:USDT", Side::Long, 100.0, 1.0, 10)
            .await
            .unwrap();

        assert!(g.check_position_ownership("acct", &pos.id).await.is_ok());
        assert_eq!(
            g.check_position_ownership("other", &pos.id).await.unwrap_err().code(),
            "POSITION_NOT_FOUND"
        );
        g.ledger.close_by_price(&pos.id, 100.0).await.unwrap();
        assert_eq!(
            g.check_position_ownership("acct", &pos.id).await.unwrap_err().code(),
            "POSITION_CLOSED"
        );
    }

    #[tokio::test]
    async fn monitor_escalates_and_liquidates() {
        let g = gate();
        // 10x long from 100: liquidation ≈ 90.5.
        let pos = g
            .ledger
            .create_position("acct", "BTC/USDT:USDT", Side::Long, 100.0, 1.0, 10)
            .await
            .unwrap();
        let mut rx = g.events.subscribe();

        // Within 10 % of liquidation: margin warning.
        g.prices.ingest_mark("BTC/USDT:USDT", 95.0);
        g.monitor_once().await.unwrap();
        // Crossed: full liquidation closes the position.
        g.prices.ingest_mark("BTC/USDT:USDT", 90.0);
        g.monitor_once().await.unwrap();

        let mut saw_warning = false;
        let mut saw_liquidation = false;
        while let Ok(evt) = rx.try_recv() {
            match evt {
                GatewayEvent::MarginWarning { position_id, .. } => {
                    assert_eq!(position_id, pos.id);
                    saw_warning = true;
                }
                GatewayEvent::FullLiquidation { position_id, .. } => {
                    assert_eq!(position_id, pos.id);
                    saw_liquidation = true;
                }
                _ => {}
            }
        }
        assert!(saw_warning);
        assert!(saw_liquidation);
        assert!(g.ledger.open_positions().await.unwrap().is_empty());
    }
}
