// =============================================================================
// Event Broadcaster — typed fan-out to authenticated subscribers
// =============================================================================
//
// Every event is tagged with the owning sub-account id; the external surface
// filters per subscriber. Fan-out is a capacity-bounded broadcast channel:
// lagging subscribers lose the oldest (progress) events, and every terminal
// event is additionally written to the tracing log so it is never silent.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Bounded fan-out queue depth per subscriber.
const CHANNEL_CAPACITY: usize = 1024;

/// A structured event published to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    OrderPlaced {
        sub_account_id: String,
        order_id: String,
        symbol: String,
        side: String,
        order_kind: String,
        price: f64,
        quantity: f64,
    },
    OrderFilled {
        sub_account_id: String,
        order_id: String,
        symbol: String,
        side: String,
        order_kind: String,
        fill_price: f64,
        fill_qty: f64,
        suppress_toast: bool,
    },
    OrderCancelled {
        sub_account_id: String,
        order_id: String,
        symbol: String,
        reason: String,
    },
    ChaseProgress {
        sub_account_id: String,
        chase_id: String,
        symbol: String,
        last_order_price: f64,
        reprice_count: u32,
        distance_pct: f64,
    },
    ChaseFilled {
        sub_account_id: String,
        chase_id: String,
        symbol: String,
        fill_price: f64,
        fill_qty: f64,
    },
    ChaseCancelled {
        sub_account_id: String,
        chase_id: String,
        symbol: String,
        reason: String,
    },
    PumpChaserProgress {
        sub_account_id: String,
        instance_id: String,
        symbol: String,
        phase: String,
        amplitude: f64,
        extreme: f64,
        gate: f64,
        core_qty: f64,
        core_notional: f64,
        scalp_profit: f64,
        deleverage_chase_id: Option<String>,
    },
    PumpChaserFill {
        sub_account_id: String,
        instance_id: String,
        symbol: String,
        fill_price: f64,
        fill_qty: f64,
        core_qty: f64,
        scalp_qty: f64,
    },
    PumpChaserScalp {
        sub_account_id: String,
        instance_id: String,
        symbol: String,
        entry_price: f64,
        exit_price: f64,
        quantity: f64,
        profit: f64,
    },
    PumpChaserDeleverage {
        sub_account_id: String,
        instance_id: String,
        symbol: String,
        fill_price: f64,
        fill_qty: f64,
        core_qty_after: f64,
    },
    PumpChaserStopped {
        sub_account_id: String,
        instance_id: String,
        symbol: String,
        reason: String,
    },
    PositionClosed {
        sub_account_id: String,
        position_id: String,
        symbol: String,
        close_price: f64,
        realized_pnl: f64,
    },
    PositionReduced {
        sub_account_id: String,
        position_id: String,
        symbol: String,
        closed_qty: f64,
        remaining_qty: f64,
        realized_pnl: f64,
    },
    PositionUpdated {
        sub_account_id: String,
        position_id: String,
        symbol: String,
        entry_price: f64,
        quantity: f64,
        notional: f64,
    },
    MarginWarning {
        sub_account_id: String,
        position_id: String,
        symbol: String,
        mark_price: f64,
        liquidation_price: f64,
        distance_pct: f64,
    },
    AdlTriggered {
        sub_account_id: String,
        position_id: String,
        symbol: String,
        mark_price: f64,
        liquidation_price: f64,
    },
    FullLiquidation {
        sub_account_id: String,
        position_id: String,
        symbol: String,
        mark_price: f64,
        realized_pnl: f64,
    },
}

impl GatewayEvent {
    /// Terminal events must not be dropped silently; they get an info log.
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OrderFilled { .. }
                | Self::OrderCancelled { .. }
                | Self::ChaseFilled { .. }
                | Self::ChaseCancelled { .. }
                | Self::PumpChaserStopped { .. }
                | Self::PositionClosed { .. }
                | Self::FullLiquidation { .. }
        )
    }

    pub fn sub_account_id(&self) -> &str {
        match self {
            Self::OrderPlaced { sub_account_id, .. }
            | Self::OrderFilled { sub_account_id, .. }
            | Self::OrderCancelled { sub_account_id, .. }
            | Self::ChaseProgress { sub_account_id, .. }
            | Self::ChaseFilled { sub_account_id, .. }
            | Self::ChaseCancelled { sub_account_id, .. }
            | Self::PumpChaserProgress { sub_account_id, .. }
            | Self::PumpChaserFill { sub_account_id, .. }
            | Self::PumpChaserScalp { sub_account_id, .. }
            | Self::PumpChaserDeleverage { sub_account_id, .. }
            | Self::PumpChaserStopped { sub_account_id, .. }
            | Self::PositionClosed { sub_account_id, .. }
            | Self::PositionReduced { sub_account_id, .. }
            | Self::PositionUpdated { sub_account_id, .. }
            | Self::MarginWarning { sub_account_id, .. }
            | Self::AdlTriggered { sub_account_id, .. }
            | Self::FullLiquidation { sub_account_id, .. } => sub_account_id,
        }
    }
}

/// Fan-out hub. Cloneable; all clones share one underlying channel.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Broadcast failures (no subscribers) are swallowed.
    pub fn publish(&self, event: GatewayEvent) {
        if event.is_terminal() {
            info!(
                sub_account = %event.sub_account_id(),
                event = ?event,
                "terminal event"
            );
        } else {
            debug!(sub_account = %event.sub_account_id(), event = ?event, "event");
        }

        if let Err(e) = self.tx.send(event) {
            // No live subscribers — normal during startup and tests.
            debug!(error = %e, "event dropped (no subscribers)");
        }
    }

    /// Subscribe to the full event stream. Callers filter by sub-account.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_type_tags() {
        let e = GatewayEvent::ChaseFilled {
            sub_account_id: "acct-1".into(),
            chase_id: "c-1".into(),
            symbol: "BTC/USDT:USDT".into(),
            fill_price: 100.01,
            fill_qty: 0.01,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "chase_filled");
        assert_eq!(json["sub_account_id"], "acct-1");

        let e = GatewayEvent::PumpChaserScalp {
            sub_account_id: "acct-1".into(),
            instance_id: "m-1".into(),
            symbol: "ETH/USDT:USDT".into(),
            entry_price: 10.055,
            exit_price: 10.004,
            quantity: 0.5,
            profit: 0.0255,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "pump_chaser_scalp");
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let hub = EventBroadcaster::new();
        let mut rx = hub.subscribe();
        hub.publish(GatewayEvent::OrderCancelled {
            sub_account_id: "a".into(),
            order_id: "o".into(),
            symbol: "BTC/USDT:USDT".into(),
            reason: "test".into(),
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.sub_account_id(), "a");
    }
}
