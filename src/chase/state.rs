// =============================================================================
// Chase state — specs, per-chase state, stalk-mode target math
// =============================================================================
//
// The pure pieces live here so the reprice rules are testable without a
// connector: target computation, the per-mode reprice predicate, and the
// distance cap. The engine wires them to the exchange.
// =============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::{GatewayError, GatewayResult};
use crate::types::{OrderKind, Side, StalkMode};

/// Input validation bounds.
const MAX_LEVERAGE: u32 = 125;
const MAX_STALK_OFFSET_PCT: f64 = 10.0;
const MAX_DISTANCE_CAP_PCT: f64 = 50.0;
/// A client-provided quote is trusted only within this band of the server's.
const CLIENT_QUOTE_TOLERANCE_PCT: f64 = 5.0;

/// Lifecycle of a chase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaseStatus {
    Active,
    Filled,
    Cancelled,
    DistanceBreached,
    Error,
}

impl ChaseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for ChaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Filled => write!(f, "filled"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DistanceBreached => write!(f, "distance_breached"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Child → parent notification for algorithmic owners of a chase.
#[derive(Debug, Clone)]
pub enum ChaseOutcome {
    Filled {
        chase_id: String,
        fill_price: f64,
        fill_qty: f64,
    },
    Cancelled {
        chase_id: String,
        reason: String,
    },
}

/// Everything needed to start a chase.
#[derive(Clone)]
pub struct ChaseSpec {
    pub sub_account: String,
    /// Canonical symbol.
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub stalk_offset_pct: f64,
    pub stalk_mode: StalkMode,
    /// 0 disables the distance cap.
    pub max_distance_pct: f64,
    pub reduce_only: bool,
    /// Spawned by another engine rather than a user.
    pub internal: bool,
    pub parent_scalper_id: Option<String>,
    pub order_kind: OrderKind,
    /// Client-provided (bid, ask), preferred when within 5 % of the server's.
    pub client_quote: Option<(f64, f64)>,
    /// Where fill/cancel outcomes are delivered for algorithmic parents.
    pub outcome_tx: Option<mpsc::UnboundedSender<ChaseOutcome>>,
}

impl ChaseSpec {
    /// A plain user-facing chase.
    pub fn new(sub_account: &str, symbol: &str, side: Side, quantity: f64, leverage: u32) -> Self {
        Self {
            sub_account: sub_account.to_string(),
            symbol: symbol.to_string(),
            side,
            quantity,
            leverage,
            stalk_offset_pct: 0.0,
            stalk_mode: StalkMode::None,
            max_distance_pct: 0.0,
            reduce_only: false,
            internal: false,
            parent_scalper_id: None,
            order_kind: OrderKind::ChaseLimit,
            client_quote: None,
            outcome_tx: None,
        }
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if !(self.quantity > 0.0) {
            return Err(GatewayError::InvalidInput("quantity must be > 0".into()));
        }
        if self.leverage < 1 || self.leverage > MAX_LEVERAGE {
            return Err(GatewayError::InvalidInput(format!(
                "leverage must be in 1..={MAX_LEVERAGE}"
            )));
        }
        if !(0.0..=MAX_STALK_OFFSET_PCT).contains(&self.stalk_offset_pct) {
            return Err(GatewayError::InvalidInput(format!(
                "stalk_offset_pct must be in 0..={MAX_STALK_OFFSET_PCT}"
            )));
        }
        if !(0.0..=MAX_DISTANCE_CAP_PCT).contains(&self.max_distance_pct) {
            return Err(GatewayError::InvalidInput(format!(
                "max_distance_pct must be in 0..={MAX_DISTANCE_CAP_PCT}"
            )));
        }
        Ok(())
    }

    /// Pick the quote to price from: the client's snapshot when it agrees with
    /// the server within tolerance, the server's otherwise.
    pub fn effective_quote(&self, server: (f64, f64)) -> (f64, f64) {
        if let Some((cb, ca)) = self.client_quote {
            let (sb, sa) = server;
            let bid_dev = ((cb - sb) / sb).abs() * 100.0;
            let ask_dev = ((ca - sa) / sa).abs() * 100.0;
            if cb > 0.0
                && ca >= cb
                && bid_dev <= CLIENT_QUOTE_TOLERANCE_PCT
                && ask_dev <= CLIENT_QUOTE_TOLERANCE_PCT
            {
                return (cb, ca);
            }
        }
        server
    }
}

impl std::fmt::Debug for ChaseSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaseSpec")
            .field("sub_account", &self.sub_account)
            .field("symbol", &self.symbol)
            .field("side", &self.side)
            .field("quantity", &self.quantity)
            .field("stalk_mode", &self.stalk_mode)
            .field("order_kind", &self.order_kind)
            .finish()
    }
}

/// Snapshotted per-chase state. Runtime flags (`dead`, `repricing`) live as
/// atomics on the runtime wrapper, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaseState {
    pub id: String,
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub leverage: u32,
    pub stalk_offset_pct: f64,
    pub stalk_mode: StalkMode,
    pub max_distance_pct: f64,
    pub reduce_only: bool,
    pub internal: bool,
    #[serde(default)]
    pub parent_scalper_id: Option<String>,
    pub order_kind: OrderKind,
    /// Ledger row backing this chase.
    #[serde(default)]
    pub pending_order_id: Option<String>,
    pub current_exchange_order_id: Option<u64>,
    pub initial_price: f64,
    pub last_order_price: f64,
    pub reprice_count: u32,
    pub status: ChaseStatus,
    pub started_at: i64,
}

// ---------------------------------------------------------------------------
// Target math
// ---------------------------------------------------------------------------

/// The quote a chase tracks: best bid for LONG (buy side of the book), best
/// ask for SHORT.
pub fn tracked_quote(side: Side, bid: f64, ask: f64) -> f64 {
    match side {
        Side::Long => bid,
        Side::Short => ask,
    }
}

/// Raw (unrounded) target for the resting limit order.
pub fn compute_target(side: Side, bid: f64, ask: f64, mode: StalkMode, offset_pct: f64) -> f64 {
    let quote = tracked_quote(side, bid, ask);
    match mode {
        StalkMode::None => quote,
        // Offset shifts away from the market: below bid for a buy, above ask
        // for a sell.
        StalkMode::Maintain | StalkMode::Trail => match side {
            Side::Long => quote * (1.0 - offset_pct / 100.0),
            Side::Short => quote * (1.0 + offset_pct / 100.0),
        },
    }
}

/// Per-mode reprice predicate, given the rounded new target and the price of
/// the resting order. Trail only moves toward the market.
pub fn should_reprice(mode: StalkMode, side: Side, new_target: f64, last_order_price: f64) -> bool {
    match mode {
        StalkMode::None | StalkMode::Maintain => new_target != last_order_price,
        StalkMode::Trail => match side {
            Side::Long => new_target > last_order_price,
            Side::Short => new_target < last_order_price,
        },
    }
}

/// Percent distance of the tracked quote from the chase's initial price.
pub fn distance_pct(current_quote: f64, initial_price: f64) -> f64 {
    if initial_price <= 0.0 {
        return 0.0;
    }
    ((current_quote - initial_price) / initial_price).abs() * 100.0
}

/// Whether the distance cap is breached. A cap of 0 disables the check.
pub fn distance_breached(current_quote: f64, initial_price: f64, max_distance_pct: f64) -> bool {
    max_distance_pct > 0.0 && distance_pct(current_quote, initial_price) > max_distance_pct
}

/// Relative epsilon guard against churn from sub-tick target jitter.
pub fn within_epsilon(new_target: f64, last_order_price: f64) -> bool {
    if last_order_price <= 0.0 {
        return false;
    }
    ((new_target - last_order_price) / last_order_price).abs() < 1e-5
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_bounds() {
        let mut spec = ChaseSpec::new("a", "BTC/USDT:USDT", Side::Long, 0.01, 10);
        assert!(spec.validate().is_ok());
        spec.quantity = 0.0;
        assert!(spec.validate().is_err());
        spec.quantity = 0.01;
        spec.leverage = 126;
        assert!(spec.validate().is_err());
        spec.leverage = 10;
        spec.stalk_offset_pct = 10.1;
        assert!(spec.validate().is_err());
        spec.stalk_offset_pct = 10.0;
        spec.max_distance_pct = 50.0;
        assert!(spec.validate().is_ok());
        spec.max_distance_pct = 50.5;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn targets_by_mode_and_side() {
        // none: glued to the best quote.
        assert_eq!(compute_target(Side::Long, 100.0, 100.02, StalkMode::None, 0.0), 100.0);
        assert_eq!(compute_target(Side::Short, 100.0, 100.02, StalkMode::None, 0.0), 100.02);
        // maintain/trail: shifted adversely by the offset.
        assert!((compute_target(Side::Long, 100.0, 100.02, StalkMode::Maintain, 1.0) - 99.0).abs() < 1e-9);
        assert!((compute_target(Side::Short, 100.0, 100.02, StalkMode::Trail, 1.0) - 101.0202).abs() < 1e-9);
        // offset 0 in trail mode sits exactly at the quote.
        assert_eq!(compute_target(Side::Long, 100.0, 100.02, StalkMode::Trail, 0.0), 100.0);
    }

    #[test]
    fn trail_only_moves_toward_market() {
        // LONG: book moves up -> reprice; book moves back down -> hold.
        assert!(should_reprice(StalkMode::Trail, Side::Long, 100.01, 100.00));
        assert!(!should_reprice(StalkMode::Trail, Side::Long, 100.00, 100.01));
        assert!(!should_reprice(StalkMode::Trail, Side::Long, 100.01, 100.01));
        // SHORT mirrors.
        assert!(should_reprice(StalkMode::Trail, Side::Short, 99.99, 100.00));
        assert!(!should_reprice(StalkMode::Trail, Side::Short, 100.01, 100.00));
        // maintain follows either direction.
        assert!(should_reprice(StalkMode::Maintain, Side::Long, 100.00, 100.01));
        assert!(should_reprice(StalkMode::Maintain, Side::Long, 100.02, 100.01));
    }

    #[test]
    fn distance_cap_zero_means_no_cap() {
        assert!(!distance_breached(200.0, 100.0, 0.0));
        assert!(distance_breached(101.2, 100.0, 1.0)); // 1.2 % > 1 %
        assert!(!distance_breached(100.9, 100.0, 1.0));
        // Exactly at the cap is not a breach (strict >).
        assert!(!distance_breached(101.0, 100.0, 1.0));
    }

    #[test]
    fn epsilon_filter_suppresses_sub_tick_jitter() {
        assert!(within_epsilon(100.00000001, 100.0));
        assert!(!within_epsilon(100.01, 100.0));
        assert!(!within_epsilon(100.0, 0.0));
    }

    #[test]
    fn client_quote_preferred_only_within_tolerance() {
        let mut spec = ChaseSpec::new("a", "BTC/USDT:USDT", Side::Long, 1.0, 10);
        spec.client_quote = Some((100.1, 100.12));
        assert_eq!(spec.effective_quote((100.0, 100.02)), (100.1, 100.12));
        // More than 5 % off -> server wins.
        spec.client_quote = Some((110.0, 110.2));
        assert_eq!(spec.effective_quote((100.0, 100.02)), (100.0, 100.02));
        // Crossed client quote -> server wins.
        spec.client_quote = Some((100.2, 100.1));
        assert_eq!(spec.effective_quote((100.0, 100.02)), (100.0, 100.02));
    }
}
