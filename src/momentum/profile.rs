// =============================================================================
// SURF profiles — per-tier tuning, the Bézier sizing curve, dynamic offsets
// =============================================================================

use serde::{Deserialize, Serialize};

/// Tunable parameters for one momentum instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfProfile {
    pub name: String,
    /// Trail distance from the extreme that forms the gate (percent).
    pub trail_pct: f64,
    /// Step beyond the last fill that re-arms the next entry (percent).
    pub step_pct: f64,
    /// Minimum amplitude before the instance arms at all (percent).
    pub min_activation_amp: f64,
    /// Base stalk offset for entry chases, in basis points.
    pub vol_offset_bps: f64,
    /// Fraction of each fill routed to the scalp bucket.
    pub scalp_ratio: f64,
    /// Spread offset for scalp round-trip closes (percent).
    pub spread_offset_pct: f64,
    /// Amplitude at which the sizing curve saturates (percent).
    pub bezier_max_pump: f64,
    /// Sizing multiplier ceiling.
    pub max_multiplier: f64,
    /// Extreme jumps beyond this are ignored (percent).
    pub hwm_jump_max: f64,
    /// Entry rate limit.
    pub max_fills_per_hour: usize,
    /// Base quantity per fill before the multiplier.
    pub base_qty: f64,
}

impl SurfProfile {
    pub fn large_cap() -> Self {
        Self {
            name: "large-cap".to_string(),
            trail_pct: 0.5,
            step_pct: 0.25,
            min_activation_amp: 0.35,
            vol_offset_bps: 8.0,
            scalp_ratio: 0.5,
            spread_offset_pct: 0.35,
            bezier_max_pump: 4.0,
            max_multiplier: 3.0,
            hwm_jump_max: 2.0,
            max_fills_per_hour: 30,
            base_qty: 0.005,
        }
    }

    pub fn mid_cap() -> Self {
        Self {
            name: "mid-cap".to_string(),
            trail_pct: 0.8,
            step_pct: 0.3,
            min_activation_amp: 0.5,
            vol_offset_bps: 12.0,
            scalp_ratio: 0.5,
            spread_offset_pct: 0.5,
            bezier_max_pump: 6.0,
            max_multiplier: 4.0,
            hwm_jump_max: 3.0,
            max_fills_per_hour: 24,
            base_qty: 1.0,
        }
    }

    pub fn small_cap() -> Self {
        Self {
            name: "small-cap".to_string(),
            trail_pct: 1.2,
            step_pct: 0.5,
            min_activation_amp: 0.8,
            vol_offset_bps: 20.0,
            scalp_ratio: 0.4,
            spread_offset_pct: 0.8,
            bezier_max_pump: 10.0,
            max_multiplier: 5.0,
            hwm_jump_max: 5.0,
            max_fills_per_hour: 18,
            base_qty: 50.0,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "large-cap" => Some(Self::large_cap()),
            "mid-cap" => Some(Self::mid_cap()),
            "small-cap" => Some(Self::small_cap()),
            _ => None,
        }
    }

    /// BTC/ETH get the large-cap profile; everything else by price tier.
    pub fn auto_detect(symbol: &str, price: f64) -> Self {
        let base = symbol.split('/').next().unwrap_or("");
        if base == "BTC" || base == "ETH" {
            return Self::large_cap();
        }
        if price >= 1.0 {
            Self::mid_cap()
        } else {
            Self::small_cap()
        }
    }
}

// ---------------------------------------------------------------------------
// Sizing curve
// ---------------------------------------------------------------------------

/// Cubic Bézier sizing multiplier over the normalized amplitude.
///
/// Control points 1.0 → 1.05 → 0.9·max → max give a slow start and a smooth
/// saturation at `max_multiplier`. The result is clamped to [1, max].
pub fn bezier_multiplier(amplitude_pct: f64, profile: &SurfProfile) -> f64 {
    let t = if profile.bezier_max_pump > 0.0 {
        (amplitude_pct / profile.bezier_max_pump).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let p0 = 1.0;
    let p1 = 1.05;
    let p2 = 0.9 * profile.max_multiplier;
    let p3 = profile.max_multiplier;

    let u = 1.0 - t;
    let value = u * u * u * p0 + 3.0 * u * u * t * p1 + 3.0 * u * t * t * p2 + t * t * t * p3;
    value.clamp(1.0, profile.max_multiplier)
}

/// Stalk offset for an entry chase (percent).
///
/// Combines the configured base (vol_offset_bps / 100), a recent-volatility
/// multiplier (window range over midpoint relative to the base, clamped
/// 0.5–3.0), and a fill-count scaler (0.7 early, 1.5 late).
pub fn dynamic_offset_pct(
    profile: &SurfProfile,
    window_high: f64,
    window_low: f64,
    fill_count: usize,
) -> f64 {
    let base = profile.vol_offset_bps / 100.0;

    let vol_multiplier = if base > 0.0 && window_high > window_low && window_low > 0.0 {
        let mid = (window_high + window_low) / 2.0;
        let range_pct = (window_high - window_low) / mid * 100.0;
        (range_pct / base).clamp(0.5, 3.0)
    } else {
        1.0
    };

    let count_scaler = if fill_count < 3 {
        0.7
    } else if fill_count >= 10 {
        1.5
    } else {
        1.0
    };

    base * vol_multiplier * count_scaler
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_detection_by_symbol_and_price() {
        assert_eq!(SurfProfile::auto_detect("BTC/USDT:USDT", 50_000.0).name, "large-cap");
        assert_eq!(SurfProfile::auto_detect("ETH/USDT:USDT", 3_000.0).name, "large-cap");
        assert_eq!(SurfProfile::auto_detect("SOL/USDT:USDT", 150.0).name, "mid-cap");
        assert_eq!(SurfProfile::auto_detect("PEPE/USDT:USDT", 0.00001).name, "small-cap");
        assert!(SurfProfile::by_name("mid-cap").is_some());
        assert!(SurfProfile::by_name("nope").is_none());
    }

    #[test]
    fn bezier_curve_is_monotone_between_bounds() {
        let profile = SurfProfile::mid_cap();
        assert_eq!(bezier_multiplier(0.0, &profile), 1.0);
        assert_eq!(bezier_multiplier(profile.bezier_max_pump, &profile), profile.max_multiplier);
        // Beyond saturation stays at the ceiling.
        assert_eq!(bezier_multiplier(100.0, &profile), profile.max_multiplier);

        let mid = bezier_multiplier(profile.bezier_max_pump / 2.0, &profile);
        assert!(mid > 1.0 && mid < profile.max_multiplier);

        // Monotone non-decreasing over the range.
        let mut prev = 0.0;
        for i in 0..=20 {
            let amp = profile.bezier_max_pump * i as f64 / 20.0;
            let m = bezier_multiplier(amp, &profile);
            assert!(m >= prev - 1e-9, "multiplier decreased at amp {amp}");
            prev = m;
        }
    }

    #[test]
    fn dynamic_offset_clamps_volatility_and_scales_by_fills() {
        let profile = SurfProfile::mid_cap(); // base = 0.12 %
        let base = profile.vol_offset_bps / 100.0;

        // Quiet window: vol multiplier bottoms out at 0.5; early scaler 0.7.
        let quiet = dynamic_offset_pct(&profile, 100.0005, 100.0, 0);
        assert!((quiet - base * 0.5 * 0.7).abs() < 1e-9);

        // Violent window clamps at 3.0; late scaler 1.5.
        let wild = dynamic_offset_pct(&profile, 110.0, 100.0, 12);
        assert!((wild - base * 3.0 * 1.5).abs() < 1e-9);

        // Degenerate window falls back to the base.
        let flat = dynamic_offset_pct(&profile, 100.0, 100.0, 5);
        assert!((flat - base).abs() < 1e-9);
    }
}
