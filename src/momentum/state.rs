// =============================================================================
// Momentum state machine — extremes, gates, phases, core/scalp accounting
// =============================================================================
//
// Phases:
//   IDLE        waiting for the move to reach the activation amplitude
//   ARMED       an entry chase stalks the move
//   GATED       price crossed the gate adversely; entries blocked
//   STEP_WAIT   filled (or ungated); waiting for the next step in-direction
//   DELEVERAGING core notional hit the cap; a reduce-only chase unwinds it
//   PAUSED      fatal margin error; manual intervention required
//   STOPPED     terminal
//
// `advance()` is pure: it mutates the state and returns the side effect the
// engine must perform, which keeps every transition unit-testable.
// =============================================================================

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::profile::SurfProfile;
use crate::types::Side;

/// Hysteresis: deleveraging stops below this fraction of the cap.
const DELEVERAGE_RESUME_FRACTION: f64 = 0.90;
/// Recent-price window retained for volatility estimates.
const PRICE_WINDOW_MS: i64 = 30_000;
/// Entry fill-rate window.
const FILL_RATE_WINDOW_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfPhase {
    Idle,
    Armed,
    StepWait,
    Gated,
    Deleveraging,
    Paused,
    Stopped,
}

impl std::fmt::Display for SurfPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Armed => "ARMED",
            Self::StepWait => "STEP_WAIT",
            Self::Gated => "GATED",
            Self::Deleveraging => "DELEVERAGING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

/// Side effect the engine must perform after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfAction {
    /// Entered ARMED: ensure an entry chase is live.
    TriggerEntry,
    /// Entered GATED: cancel the live entry chase.
    CancelEntry,
    /// Entered DELEVERAGING: cancel the entry chase, start the unwind chase.
    StartDeleverage,
    /// Left DELEVERAGING: cancel the unwind chase.
    StopDeleverage,
}

/// The averaged long-lived inventory bucket.
/// Invariant: notional = vwap × qty (within float tolerance).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreBucket {
    pub qty: f64,
    pub vwap: f64,
    pub notional: f64,
}

/// A scalp bucket awaiting its round-trip close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingScalp {
    pub chase_id: String,
    pub entry_price: f64,
    pub qty: f64,
}

/// A completed scalp round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalpRoundTrip {
    pub entry_price: f64,
    pub exit_price: f64,
    pub qty: f64,
    pub profit: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub price: f64,
    pub qty: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfStats {
    pub jump_rejections: u32,
    pub rate_limited: u32,
    pub entries_triggered: u32,
}

/// Snapshotted per-instance state. Runtime-only pieces (the recent-price
/// ring) are rebuilt after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumState {
    pub id: String,
    pub sub_account: String,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub max_notional: f64,
    pub profile: SurfProfile,
    pub phase: SurfPhase,
    pub start_price: f64,
    /// High-water mark for SHORT, low-water mark for LONG.
    pub extreme: f64,
    /// Trailing floor (SHORT) or ceiling (LONG) from the extreme.
    pub gate: f64,
    pub amplitude: f64,
    pub last_fill_price: Option<f64>,
    pub core: CoreBucket,
    pub pending_scalps: Vec<PendingScalp>,
    pub scalp_round_trips: Vec<ScalpRoundTrip>,
    pub scalp_profit: f64,
    pub fills: Vec<FillRecord>,
    pub deleverage_fills: Vec<FillRecord>,
    pub stats: SurfStats,
    pub started_at: i64,
    /// Recent (ts, price) ring for the volatility window. Runtime-only.
    #[serde(skip, default)]
    pub recent_prices: VecDeque<(i64, f64)>,
}

impl MomentumState {
    pub fn new(
        id: String,
        sub_account: String,
        symbol: String,
        side: Side,
        leverage: u32,
        max_notional: f64,
        profile: SurfProfile,
        start_price: f64,
        now_ms: i64,
    ) -> Self {
        let mut state = Self {
            id,
            sub_account,
            symbol,
            side,
            leverage,
            max_notional,
            profile,
            phase: SurfPhase::Idle,
            start_price,
            extreme: start_price,
            gate: 0.0,
            amplitude: 0.0,
            last_fill_price: None,
            core: CoreBucket::default(),
            pending_scalps: Vec::new(),
            scalp_round_trips: Vec::new(),
            scalp_profit: 0.0,
            fills: Vec::new(),
            deleverage_fills: Vec::new(),
            stats: SurfStats::default(),
            started_at: now_ms,
            recent_prices: VecDeque::new(),
        };
        state.gate = state.gate_for(start_price);
        state
    }

    fn gate_for(&self, extreme: f64) -> f64 {
        match self.side {
            Side::Short => extreme * (1.0 - self.profile.trail_pct / 100.0),
            Side::Long => extreme * (1.0 + self.profile.trail_pct / 100.0),
        }
    }

    /// Accept a new extreme only if the jump is within `hwm_jump_max`.
    fn update_extreme(&mut self, price: f64) {
        let better = match self.side {
            Side::Short => price > self.extreme,
            Side::Long => price < self.extreme,
        };
        if !better {
            return;
        }
        let jump_pct = ((price - self.extreme) / self.extreme).abs() * 100.0;
        if jump_pct > self.profile.hwm_jump_max {
            self.stats.jump_rejections += 1;
            return;
        }
        self.extreme = price;
        self.gate = self.gate_for(price);
        self.amplitude = ((self.extreme - self.start_price) / self.start_price).abs() * 100.0;
    }

    /// Price crossed the gate adversely (retraced past the trail).
    fn gate_crossed(&self, price: f64) -> bool {
        match self.side {
            Side::Short => price < self.gate,
            Side::Long => price > self.gate,
        }
    }

    /// Price moved beyond the step threshold in the instance's direction.
    fn step_reached(&self, price: f64) -> bool {
        let reference = match self.last_fill_price {
            Some(p) => match self.side {
                Side::Short => p * (1.0 + self.profile.step_pct / 100.0),
                Side::Long => p * (1.0 - self.profile.step_pct / 100.0),
            },
            None => match self.side {
                Side::Short => self.start_price * (1.0 + self.profile.min_activation_amp / 100.0),
                Side::Long => self.start_price * (1.0 - self.profile.min_activation_amp / 100.0),
            },
        };
        match self.side {
            Side::Short => price > reference,
            Side::Long => price < reference,
        }
    }

    fn core_value_at(&self, price: f64) -> f64 {
        self.core.qty * price
    }

    /// Advance the machine by one mark-price tick.
    pub fn advance(&mut self, price: f64, now_ms: i64) -> Option<SurfAction> {
        self.push_price(now_ms, price);

        match self.phase {
            SurfPhase::Paused | SurfPhase::Stopped => return None,
            _ => {}
        }

        self.update_extreme(price);

        match self.phase {
            SurfPhase::Idle => {
                // Amplitude exactly at the threshold arms (boundary inclusive).
                if self.amplitude >= self.profile.min_activation_amp {
                    self.phase = SurfPhase::Armed;
                    self.stats.entries_triggered += 1;
                    return Some(SurfAction::TriggerEntry);
                }
            }
            SurfPhase::Armed => {
                if self.core_value_at(price) >= self.max_notional {
                    self.phase = SurfPhase::Deleveraging;
                    return Some(SurfAction::StartDeleverage);
                }
                if self.gate_crossed(price) {
                    self.phase = SurfPhase::Gated;
                    return Some(SurfAction::CancelEntry);
                }
            }
            SurfPhase::Gated => {
                if !self.gate_crossed(price) {
                    self.phase = SurfPhase::StepWait;
                }
            }
            SurfPhase::StepWait => {
                if self.core_value_at(price) >= self.max_notional {
                    self.phase = SurfPhase::Deleveraging;
                    return Some(SurfAction::StartDeleverage);
                }
                if self.step_reached(price) {
                    self.phase = SurfPhase::Armed;
                    self.stats.entries_triggered += 1;
                    return Some(SurfAction::TriggerEntry);
                }
            }
            SurfPhase::Deleveraging => {
                if self.core_value_at(price) < DELEVERAGE_RESUME_FRACTION * self.max_notional {
                    self.phase = SurfPhase::StepWait;
                    return Some(SurfAction::StopDeleverage);
                }
            }
            SurfPhase::Paused | SurfPhase::Stopped => {}
        }
        None
    }

    // -------------------------------------------------------------------------
    // Price window & fill-rate limiter
    // -------------------------------------------------------------------------

    fn push_price(&mut self, now_ms: i64, price: f64) {
        self.recent_prices.push_back((now_ms, price));
        while let Some(&(ts, _)) = self.recent_prices.front() {
            if now_ms - ts > PRICE_WINDOW_MS {
                self.recent_prices.pop_front();
            } else {
                break;
            }
        }
    }

    /// (high, low) of the recent-price window.
    pub fn price_window(&self) -> Option<(f64, f64)> {
        if self.recent_prices.is_empty() {
            return None;
        }
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        for &(_, p) in &self.recent_prices {
            high = high.max(p);
            low = low.min(p);
        }
        Some((high, low))
    }

    /// Entry fills within the last hour already at the limit?
    pub fn fill_rate_exceeded(&self, now_ms: i64) -> bool {
        let recent = self
            .fills
            .iter()
            .filter(|f| now_ms - f.ts <= FILL_RATE_WINDOW_MS)
            .count();
        recent > self.profile.max_fills_per_hour
    }

    // -------------------------------------------------------------------------
    // Core & scalp accounting
    // -------------------------------------------------------------------------

    /// Absorb the core fraction of a fill; VWAP is recomputed.
    pub fn absorb_core(&mut self, price: f64, qty: f64) {
        if qty <= 0.0 {
            return;
        }
        self.core.qty += qty;
        self.core.notional += price * qty;
        self.core.vwap = self.core.notional / self.core.qty;
    }

    /// Reduce the core by `qty` at its VWAP (deleverage fill).
    pub fn reduce_core(&mut self, qty: f64) {
        let qty = qty.min(self.core.qty);
        self.core.qty -= qty;
        if self.core.qty <= 0.0 {
            self.core = CoreBucket::default();
        } else {
            self.core.notional = self.core.vwap * self.core.qty;
        }
    }

    /// The live core does not exist on the exchange; drop it (self-heal).
    pub fn zero_core(&mut self) {
        self.core = CoreBucket::default();
    }

    pub fn register_scalp(&mut self, chase_id: String, entry_price: f64, qty: f64) {
        self.pending_scalps.push(PendingScalp {
            chase_id,
            entry_price,
            qty,
        });
    }

    /// Settle a scalp round-trip, crediting the profit. Returns the completed
    /// trip, or `None` for an unknown chase id.
    pub fn settle_scalp(&mut self, chase_id: &str, exit_price: f64, now_ms: i64) -> Option<ScalpRoundTrip> {
        let idx = self.pending_scalps.iter().position(|s| s.chase_id == chase_id)?;
        let scalp = self.pending_scalps.swap_remove(idx);
        // For SHORT: profit = (entry − exit) × qty; mirrored for LONG.
        let profit = match self.side {
            Side::Short => (scalp.entry_price - exit_price) * scalp.qty,
            Side::Long => (exit_price - scalp.entry_price) * scalp.qty,
        };
        self.scalp_profit += profit;
        let trip = ScalpRoundTrip {
            entry_price: scalp.entry_price,
            exit_price,
            qty: scalp.qty,
            profit,
            ts: now_ms,
        };
        self.scalp_round_trips.push(trip.clone());
        Some(trip)
    }

    /// A scalp close was cancelled/expired; its quantity rolls into the core.
    pub fn rollback_scalp(&mut self, chase_id: &str) -> Option<PendingScalp> {
        let idx = self.pending_scalps.iter().position(|s| s.chase_id == chase_id)?;
        let scalp = self.pending_scalps.swap_remove(idx);
        self.absorb_core(scalp.entry_price, scalp.qty);
        Some(scalp)
    }

    pub fn record_fill(&mut self, price: f64, qty: f64, now_ms: i64) {
        self.fills.push(FillRecord { price, qty, ts: now_ms });
        self.last_fill_price = Some(price);
    }

    pub fn record_deleverage_fill(&mut self, price: f64, qty: f64, now_ms: i64) {
        self.deleverage_fills.push(FillRecord { price, qty, ts: now_ms });
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// The S3 shape: SHORT at 10.00, mid-cap-ish numbers.
    fn short_state() -> MomentumState {
        let mut profile = SurfProfile::mid_cap();
        profile.trail_pct = 0.8;
        profile.step_pct = 0.3;
        profile.min_activation_amp = 0.5;
        profile.scalp_ratio = 0.5;
        profile.spread_offset_pct = 0.5;
        profile.base_qty = 1.0;
        MomentumState::new(
            "m-1".into(),
            "acct".into(),
            "XYZ/USDT:USDT".into(),
            Side::Short,
            5,
            10_000.0,
            profile,
            10.0,
            0,
        )
    }

    #[test]
    fn idle_arms_exactly_at_activation_amplitude() {
        let mut s = short_state();
        assert_eq!(s.advance(10.04, 1), None); // 0.4 % < 0.5 %
        assert_eq!(s.phase, SurfPhase::Idle);
        // Exactly 0.5 % triggers (boundary inclusive).
        assert_eq!(s.advance(10.05, 2), Some(SurfAction::TriggerEntry));
        assert_eq!(s.phase, SurfPhase::Armed);
        assert!((s.amplitude - 0.5).abs() < 1e-9);
    }

    #[test]
    fn armed_gates_on_adverse_cross_and_ungates_to_step_wait() {
        let mut s = short_state();
        s.advance(10.06, 1); // armed; extreme 10.06, floor = 10.06 × 0.992
        assert_eq!(s.phase, SurfPhase::Armed);
        let floor = s.gate;
        assert!((floor - 10.06 * 0.992).abs() < 1e-9);

        // Retrace below the floor: gated, entry must be cancelled.
        assert_eq!(s.advance(floor - 0.01, 2), Some(SurfAction::CancelEntry));
        assert_eq!(s.phase, SurfPhase::Gated);

        // Return across the gate: step-wait.
        assert_eq!(s.advance(floor + 0.001, 3), None);
        assert_eq!(s.phase, SurfPhase::StepWait);
    }

    #[test]
    fn step_wait_rearms_beyond_last_fill_step() {
        let mut s = short_state();
        s.advance(10.06, 1);
        s.phase = SurfPhase::StepWait;
        s.last_fill_price = Some(10.055);

        // Needs price > 10.055 × 1.003 = 10.085165 for a SHORT.
        assert_eq!(s.advance(10.08, 2), None);
        assert_eq!(s.phase, SurfPhase::StepWait);
        assert_eq!(s.advance(10.09, 3), Some(SurfAction::TriggerEntry));
        assert_eq!(s.phase, SurfPhase::Armed);
    }

    #[test]
    fn step_wait_without_fill_uses_activation_reference() {
        let mut s = short_state();
        s.phase = SurfPhase::StepWait;
        // Reference = 10.00 × 1.005 = 10.05.
        assert_eq!(s.advance(10.049, 1), None);
        assert_eq!(s.advance(10.051, 2), Some(SurfAction::TriggerEntry));
    }

    #[test]
    fn deleverage_cycle_with_hysteresis() {
        let mut s = short_state();
        s.phase = SurfPhase::Armed;
        s.absorb_core(10.0, 999.0); // 9990 notional at price 10

        // 999 × 10.02 ≈ 10 010 ≥ 10 000: start deleveraging.
        assert_eq!(s.advance(10.02, 1), Some(SurfAction::StartDeleverage));
        assert_eq!(s.phase, SurfPhase::Deleveraging);

        // Still above 90 % of the cap: stay.
        assert_eq!(s.advance(9.5, 2), None);

        // Unwound below 0.90 × cap: resume.
        s.reduce_core(300.0);
        assert_eq!(s.advance(9.5, 3), Some(SurfAction::StopDeleverage));
        assert_eq!(s.phase, SurfPhase::StepWait);
    }

    #[test]
    fn extreme_jump_filter_rejects_spikes() {
        let mut s = short_state(); // hwm_jump_max = 3 %
        s.advance(10.2, 1);
        assert!((s.extreme - 10.2).abs() < 1e-9);
        // A 5 % spike is rejected and counted.
        s.advance(10.2 * 1.05, 2);
        assert!((s.extreme - 10.2).abs() < 1e-9);
        assert_eq!(s.stats.jump_rejections, 1);
        // A modest new high is accepted.
        s.advance(10.3, 3);
        assert!((s.extreme - 10.3).abs() < 1e-9);
    }

    #[test]
    fn core_invariant_holds_through_absorb_and_reduce() {
        let mut s = short_state();
        s.absorb_core(10.055, 0.5);
        assert!((s.core.notional - s.core.vwap * s.core.qty).abs() < 1e-6);
        s.absorb_core(10.10, 1.5);
        assert!((s.core.notional - s.core.vwap * s.core.qty).abs() < 1e-6);
        let vwap_before = s.core.vwap;
        s.reduce_core(0.6);
        assert!((s.core.notional - s.core.vwap * s.core.qty).abs() < 1e-6);
        assert!((s.core.vwap - vwap_before).abs() < 1e-9, "reduce keeps vwap");
        s.reduce_core(1e9);
        assert_eq!(s.core.qty, 0.0);
        assert_eq!(s.core.notional, 0.0);
    }

    #[test]
    fn scalp_round_trip_credits_signed_profit() {
        // S3: SHORT scalp 0.5 @ 10.055 bought back at 10.004.
        let mut s = short_state();
        s.register_scalp("scalp-1".into(), 10.055, 0.5);
        let trip = s.settle_scalp("scalp-1", 10.004, 99).unwrap();
        assert!((trip.profit - 0.0255).abs() < 1e-9);
        assert!((s.scalp_profit - 0.0255).abs() < 1e-9);
        assert!(s.pending_scalps.is_empty());
        assert!(s.settle_scalp("scalp-1", 10.0, 100).is_none());
    }

    #[test]
    fn cancelled_scalp_rolls_back_into_core() {
        let mut s = short_state();
        s.register_scalp("scalp-2".into(), 10.0, 0.5);
        assert_eq!(s.core.qty, 0.0);
        s.rollback_scalp("scalp-2").unwrap();
        assert!((s.core.qty - 0.5).abs() < 1e-9);
        assert!((s.core.vwap - 10.0).abs() < 1e-9);
        assert!((s.core.notional - s.core.vwap * s.core.qty).abs() < 1e-6);
    }

    #[test]
    fn fill_rate_limiter_counts_the_last_hour() {
        let mut s = short_state();
        s.profile.max_fills_per_hour = 2;
        let now = 10_000_000;
        s.record_fill(10.0, 1.0, now - 3_500_000);
        s.record_fill(10.0, 1.0, now - 1_000);
        assert!(!s.fill_rate_exceeded(now));
        s.record_fill(10.0, 1.0, now - 500);
        // Three fills inside the hour > limit of 2.
        assert!(s.fill_rate_exceeded(now));
        // An hour later the window has drained.
        assert!(!s.fill_rate_exceeded(now + FILL_RATE_WINDOW_MS + 1_000));
    }

    #[test]
    fn paused_and_stopped_are_inert() {
        let mut s = short_state();
        s.phase = SurfPhase::Paused;
        assert_eq!(s.advance(20.0, 1), None);
        assert_eq!(s.phase, SurfPhase::Paused);
        s.phase = SurfPhase::Stopped;
        assert_eq!(s.advance(20.0, 2), None);
    }

    #[test]
    fn price_window_tracks_high_low_within_30s() {
        let mut s = short_state();
        s.advance(10.0, 0);
        s.advance(10.5, 10_000);
        s.advance(9.8, 20_000);
        let (high, low) = s.price_window().unwrap();
        assert_eq!((high, low), (10.5, 9.8));
        // Entries older than 30 s fall out.
        s.advance(10.1, 45_000);
        let (high, low) = s.price_window().unwrap();
        assert_eq!((high, low), (10.1, 10.1));
    }

    #[test]
    fn long_side_mirrors_gate_and_step_logic() {
        let mut profile = SurfProfile::mid_cap();
        profile.trail_pct = 1.0;
        profile.min_activation_amp = 0.5;
        profile.step_pct = 0.3;
        let mut s = MomentumState::new(
            "m-2".into(),
            "acct".into(),
            "ABC/USDT:USDT".into(),
            Side::Long,
            5,
            1_000.0,
            profile,
            100.0,
            0,
        );
        // LONG rides a dump: extreme is the low-water mark.
        assert_eq!(s.advance(99.4, 1), Some(SurfAction::TriggerEntry)); // 0.6 % down
        assert_eq!(s.phase, SurfPhase::Armed);
        assert!((s.extreme - 99.4).abs() < 1e-9);
        let ceiling = s.gate;
        assert!((ceiling - 99.4 * 1.01).abs() < 1e-9);

        // Bounce above the ceiling gates the instance.
        assert_eq!(s.advance(ceiling + 0.01, 2), Some(SurfAction::CancelEntry));
        assert_eq!(s.phase, SurfPhase::Gated);
    }
}
