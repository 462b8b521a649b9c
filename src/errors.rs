// =============================================================================
// Structured error taxonomy — stable codes surfaced to callers and clients
// =============================================================================
//
// Three families:
//   - Pre-trade: rejected before anything reaches the exchange.
//   - Exchange:  mapped from exchange error bodies (see exchange::errors for
//     the code/message parser). EXCHANGE_REJECTED is the catch-all.
//   - Infra:     local infrastructure conditions engines react to.
//
// Engines decide per-code whether to retry, pause, self-heal, or finish.
// =============================================================================

use thiserror::Error;

/// Every failure surfaced by the gateway core, with a stable machine code.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    // ── Pre-trade ───────────────────────────────────────────────────────
    #[error("sub-account not found: {0}")]
    AccountNotFound(String),
    #[error("sub-account is frozen: {0}")]
    AccountFrozen(String),
    #[error("leverage {requested} exceeds maximum {max}")]
    MaxLeverage { requested: u32, max: u32 },
    #[error("notional {notional:.2} exceeds per-trade cap {cap:.2}")]
    MaxNotional { notional: f64, cap: f64 },
    #[error("total exposure {exposure:.2} exceeds cap {cap:.2}")]
    MaxExposure { exposure: f64, cap: f64 },
    #[error("post-trade margin ratio {ratio:.4} exceeds threshold {threshold:.4}")]
    MarginRatioExceeded { ratio: f64, threshold: f64 },
    #[error("insufficient margin")]
    InsufficientMargin,
    #[error("no live price for {0}")]
    NoPrice(String),
    #[error("position not found: {0}")]
    PositionNotFound(String),
    #[error("position already closed: {0}")]
    PositionClosed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    // ── Exchange ────────────────────────────────────────────────────────
    #[error("order below exchange minimum notional")]
    ExchangeMinNotional,
    #[error("exchange reports margin is insufficient")]
    ExchangeMarginInsufficient,
    #[error("precision does not match exchange filter")]
    ExchangePrecision,
    #[error("exchange rejected the order as invalid: {0}")]
    ExchangeInvalidOrder(String),
    #[error("order quantity below exchange minimum")]
    ExchangeQtyTooSmall,
    #[error("price outside the exchange price filter")]
    ExchangePriceFilter,
    #[error("order unknown to the exchange")]
    ExchangeUnknownOrder,
    #[error("banned by the exchange until {until_ms}")]
    ExchangeBanned { until_ms: i64 },
    #[error("exchange rejected the request: {0}")]
    ExchangeRejected(String),

    // ── Infra ───────────────────────────────────────────────────────────
    #[error("snapshot store unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error("advisory lock already held: {0}")]
    LockHeld(String),
    #[error("market stream stale for {0}")]
    StreamStale(String),
    #[error("order circuit breaker is open")]
    CircuitOpen,
    #[error("price unavailable for {0}")]
    PriceUnavailable(String),
}

impl GatewayError {
    /// Stable machine-readable code, the contract with clients and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Self::AccountFrozen(_) => "ACCOUNT_FROZEN",
            Self::MaxLeverage { .. } => "MAX_LEVERAGE",
            Self::MaxNotional { .. } => "MAX_NOTIONAL",
            Self::MaxExposure { .. } => "MAX_EXPOSURE",
            Self::MarginRatioExceeded { .. } => "MARGIN_RATIO_EXCEEDED",
            Self::InsufficientMargin => "INSUFFICIENT_MARGIN",
            Self::NoPrice(_) => "NO_PRICE",
            Self::PositionNotFound(_) => "POSITION_NOT_FOUND",
            Self::PositionClosed(_) => "POSITION_CLOSED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",

            Self::ExchangeMinNotional => "EXCHANGE_MIN_NOTIONAL",
            Self::ExchangeMarginInsufficient => "EXCHANGE_MARGIN_INSUFFICIENT",
            Self::ExchangePrecision => "EXCHANGE_PRECISION",
            Self::ExchangeInvalidOrder(_) => "EXCHANGE_INVALID_ORDER",
            Self::ExchangeQtyTooSmall => "EXCHANGE_QTY_TOO_SMALL",
            Self::ExchangePriceFilter => "EXCHANGE_PRICE_FILTER",
            Self::ExchangeUnknownOrder => "EXCHANGE_UNKNOWN_ORDER",
            Self::ExchangeBanned { .. } => "EXCHANGE_BANNED",
            Self::ExchangeRejected(_) => "EXCHANGE_REJECTED",

            Self::SnapshotUnavailable(_) => "SNAPSHOT_UNAVAILABLE",
            Self::LockHeld(_) => "LOCK_HELD",
            Self::StreamStale(_) => "STREAM_STALE",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::PriceUnavailable(_) => "PRICE_UNAVAILABLE",
        }
    }

    /// True for the "position does not exist / reduce-only" family that the
    /// momentum engine treats as a ghost core and self-heals from.
    pub fn is_ghost_position(&self) -> bool {
        match self {
            Self::ExchangeInvalidOrder(msg) | Self::ExchangeRejected(msg) => {
                let m = msg.to_ascii_lowercase();
                m.contains("reduceonly") || m.contains("reduce only") || m.contains("position side does not")
            }
            _ => false,
        }
    }

    /// Errors that fatally finish a chase instead of being retried next tick.
    pub fn is_fatal_for_chase(&self) -> bool {
        matches!(self, Self::ExchangeMarginInsufficient | Self::InsufficientMargin)
    }

    /// Transient price-filter breaches are skipped to the next tick.
    pub fn is_transient_price_filter(&self) -> bool {
        matches!(self, Self::ExchangePriceFilter)
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::InsufficientMargin.code(), "INSUFFICIENT_MARGIN");
        assert_eq!(GatewayError::ExchangeMinNotional.code(), "EXCHANGE_MIN_NOTIONAL");
        assert_eq!(GatewayError::CircuitOpen.code(), "CIRCUIT_OPEN");
        assert_eq!(
            GatewayError::LockHeld("BTC/USDT:USDT".into()).code(),
            "LOCK_HELD"
        );
    }

    #[test]
    fn ghost_position_family_is_detected() {
        let e = GatewayError::ExchangeInvalidOrder("Order's position side does not match".into());
        assert!(e.is_ghost_position());
        let e = GatewayError::ExchangeRejected("ReduceOnly Order is rejected".into());
        assert!(e.is_ghost_position());
        assert!(!GatewayError::ExchangeMinNotional.is_ghost_position());
    }

    #[test]
    fn chase_error_policy_buckets() {
        assert!(GatewayError::ExchangeMarginInsufficient.is_fatal_for_chase());
        assert!(GatewayError::ExchangePriceFilter.is_transient_price_filter());
        assert!(!GatewayError::ExchangeRejected("x".into()).is_fatal_for_chase());
    }
}
