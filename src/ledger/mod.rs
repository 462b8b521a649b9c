// =============================================================================
// Position Ledger — authoritative records of positions, orders, executions
// =============================================================================
//
// Invariants maintained by the store:
//   - notional = entry_price × quantity (within float tolerance)
//   - margin ≈ notional / leverage
//   - averaging: new_entry = (e·q + fill_p·fill_q) / (q + fill_q)
// =============================================================================

pub mod store;

pub use store::LedgerStore;

use serde::{Deserialize, Serialize};

use crate::types::{OrderKind, OrderStatus, PositionStatus, Side};

/// Simplified maintenance-margin rate used for liquidation estimates.
const MAINTENANCE_MARGIN_RATE: f64 = 0.005;

/// A virtual position owned by one sub-account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub notional: f64,
    pub leverage: u32,
    pub margin: f64,
    pub liquidation_price: f64,
    pub status: PositionStatus,
    /// Excluded from automated liquidation babysitting.
    pub babysitter_excluded: bool,
    pub realized_pnl: f64,
    pub opened_at: i64,
    pub closed_at: Option<i64>,
}

/// An order we have (or intend to have) resting on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: String,
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub status: OrderStatus,
    /// Live exchange order id. For CHASE_LIMIT this lags the engine's current
    /// id between reprices; the reconciler compensates (fallback lookup).
    pub exchange_order_id: Option<u64>,
    pub created_at: i64,
    pub filled_at: Option<i64>,
    pub cancelled_at: Option<i64>,
}

/// Append-only audit record of a fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecution {
    pub id: String,
    pub sub_account: String,
    /// open | add | close | partial_close
    pub kind: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub realized_pnl: Option<f64>,
    /// Idempotency signature: sha256(account ‖ kind ‖ order_id ‖ ts ‖ uuid).
    pub signature: String,
    pub ts: i64,
}

/// Estimated liquidation price for an isolated position.
pub fn liquidation_price(entry_price: f64, side: Side, leverage: u32) -> f64 {
    let lev = leverage.max(1) as f64;
    let adverse_move = (1.0 / lev) - MAINTENANCE_MARGIN_RATE;
    match side {
        Side::Long => entry_price * (1.0 - adverse_move),
        Side::Short => entry_price * (1.0 + adverse_move),
    }
}

/// Realized PnL of closing `qty` at `close_price` against `entry_price`.
pub fn realized_pnl(entry_price: f64, close_price: f64, qty: f64, side: Side) -> f64 {
    side.sign() * (close_price - entry_price) * qty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liquidation_price_brackets_entry() {
        let long = liquidation_price(100.0, Side::Long, 10);
        assert!(long < 100.0 && long > 90.0);
        let short = liquidation_price(100.0, Side::Short, 10);
        assert!(short > 100.0 && short < 110.0);
    }

    #[test]
    fn realized_pnl_signs_by_side() {
        // Open+close round-trip law: pnl = (close − open) × qty × side_sign.
        assert_eq!(realized_pnl(100.0, 110.0, 2.0, Side::Long), 20.0);
        assert_eq!(realized_pnl(100.0, 110.0, 2.0, Side::Short), -20.0);
        assert_eq!(realized_pnl(10.055, 10.004, 0.5, Side::Short), (10.055 - 10.004) * 0.5);
    }
}
