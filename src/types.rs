// =============================================================================
// Shared types used across the Helios gateway
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position or algorithm instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The exchange order side that opens (or adds to) a position on this side.
    pub fn open_order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// The exchange order side that reduces a position on this side.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// +1.0 for long, -1.0 for short. PnL = sign × (exit − entry) × qty.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Self::Long),
            "SHORT" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// High-level order type as tracked in the pending-order table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    Market,
    Limit,
    ChaseLimit,
    SurfLimit,
    SurfScalp,
    SurfDeleverage,
    TwapSlice,
}

impl OrderKind {
    /// Order kinds whose fills are driven by an engine rather than a user.
    /// Their `order_filled` broadcasts carry `suppress_toast = true`.
    pub fn is_algorithmic(&self) -> bool {
        matches!(
            self,
            Self::ChaseLimit
                | Self::SurfLimit
                | Self::SurfScalp
                | Self::SurfDeleverage
                | Self::TwapSlice
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::ChaseLimit => "CHASE_LIMIT",
            Self::SurfLimit => "SURF_LIMIT",
            Self::SurfScalp => "SURF_SCALP",
            Self::SurfDeleverage => "SURF_DELEVERAGE",
            Self::TwapSlice => "TWAP_SLICE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(Self::Market),
            "LIMIT" => Some(Self::Limit),
            "CHASE_LIMIT" => Some(Self::ChaseLimit),
            "SURF_LIMIT" => Some(Self::SurfLimit),
            "SURF_SCALP" => Some(Self::SurfScalp),
            "SURF_DELEVERAGE" => Some(Self::SurfDeleverage),
            "TWAP_SLICE" => Some(Self::TwapSlice),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a pending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "FILLED" => Some(Self::Filled),
            "CANCELLED" => Some(Self::Cancelled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a virtual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a chase order tracks the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StalkMode {
    /// Sit at the best quote; reprice whenever it moves.
    None,
    /// Sit offset from the best quote in the adverse direction; always follow.
    Maintain,
    /// As `Maintain`, but only reprice toward the market. Never chase away.
    Trail,
}

impl std::fmt::Display for StalkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Maintain => write!(f, "maintain"),
            Self::Trail => write!(f, "trail"),
        }
    }
}

/// Rounding mode for precision adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundMode {
    Nearest,
    Floor,
    Ceil,
}

/// Current time as milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_signs_and_order_sides() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::Long.open_order_side(), "BUY");
        assert_eq!(Side::Long.close_order_side(), "SELL");
        assert_eq!(Side::Short.open_order_side(), "SELL");
        assert_eq!(Side::Short.opposite(), Side::Long);
    }

    #[test]
    fn order_kind_round_trips_through_strings() {
        for kind in [
            OrderKind::Market,
            OrderKind::Limit,
            OrderKind::ChaseLimit,
            OrderKind::SurfLimit,
            OrderKind::SurfScalp,
            OrderKind::SurfDeleverage,
            OrderKind::TwapSlice,
        ] {
            assert_eq!(OrderKind::parse(kind.as_str()), Some(kind));
        }
        assert!(OrderKind::ChaseLimit.is_algorithmic());
        assert!(!OrderKind::Limit.is_algorithmic());
    }
}
