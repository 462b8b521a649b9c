// =============================================================================
// Runtime Configuration — gateway settings with atomic save
// =============================================================================
//
// Credentials are never stored here; they come from the environment
// (HELIOS_API_KEY / HELIOS_API_SECRET). Every field carries a serde default
// so older config files keep loading after new fields are added.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_rest_base() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_base() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_db_path() -> String {
    "helios.db".to_string()
}

fn default_max_active_chases() -> usize {
    500
}

fn default_max_momentum_instances() -> usize {
    50
}

fn default_max_leverage() -> u32 {
    125
}

fn default_max_trade_notional() -> f64 {
    250_000.0
}

fn default_max_account_exposure() -> f64 {
    1_000_000.0
}

fn default_margin_ratio_threshold() -> f64 {
    0.80
}

// =============================================================================
// RiskLimits
// =============================================================================

/// Per-account risk policy enforced by the risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Maximum leverage accepted on any order.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,

    /// Maximum notional of a single trade (quote currency).
    #[serde(default = "default_max_trade_notional")]
    pub max_trade_notional: f64,

    /// Maximum total open exposure per sub-account (quote currency).
    #[serde(default = "default_max_account_exposure")]
    pub max_account_exposure: f64,

    /// Post-trade margin ratio above which orders are rejected.
    #[serde(default = "default_margin_ratio_threshold")]
    pub margin_ratio_threshold: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_leverage: default_max_leverage(),
            max_trade_notional: default_max_trade_notional(),
            max_account_exposure: default_max_account_exposure(),
            margin_ratio_threshold: default_margin_ratio_threshold(),
        }
    }
}

// =============================================================================
// GatewayConfig
// =============================================================================

/// Top-level runtime configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// REST API base URL.
    #[serde(default = "default_rest_base")]
    pub rest_base: String,

    /// Market-data WebSocket base URL.
    #[serde(default = "default_ws_base")]
    pub ws_base: String,

    /// SQLite database path (ledger tables + snapshot KV).
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Global cap on concurrently active chases.
    #[serde(default = "default_max_active_chases")]
    pub max_active_chases: usize,

    /// Per-process cap on live momentum instances.
    #[serde(default = "default_max_momentum_instances")]
    pub max_momentum_instances: usize,

    /// Sub-accounts blocked from trading.
    #[serde(default)]
    pub frozen_accounts: Vec<String>,

    /// Risk gate policy.
    #[serde(default)]
    pub risk: RiskLimits,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rest_base: default_rest_base(),
            ws_base: default_ws_base(),
            db_path: default_db_path(),
            max_active_chases: default_max_active_chases(),
            max_momentum_instances: default_max_momentum_instances(),
            frozen_accounts: Vec::new(),
            risk: RiskLimits::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read gateway config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse gateway config from {}", path.display()))?;

        info!(
            path = %path.display(),
            rest_base = %config.rest_base,
            db_path = %config.db_path,
            "gateway config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise gateway config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "gateway config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.rest_base, "https://fapi.binance.com");
        assert_eq!(cfg.max_active_chases, 500);
        assert_eq!(cfg.max_momentum_instances, 50);
        assert_eq!(cfg.risk.max_leverage, 125);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "db_path": "/tmp/x.db", "risk": { "max_leverage": 20 } }"#;
        let cfg: GatewayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert_eq!(cfg.risk.max_leverage, 20);
        assert!((cfg.risk.margin_ratio_threshold - 0.80).abs() < f64::EPSILON);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = GatewayConfig::default();
        cfg.frozen_accounts.push("acct-frozen".to_string());
        cfg.save(&path).unwrap();
        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded.frozen_accounts, vec!["acct-frozen"]);
        assert_eq!(loaded.max_active_chases, cfg.max_active_chases);
    }
}
