// =============================================================================
// Helios Perp Gateway — Main Entry Point
// =============================================================================
//
// Multi-tenant execution-and-reconciliation core for a perpetual-futures
// exchange: chase engine, momentum (SURF) engine, order reconciler, and the
// shared rate-limited exchange connector.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod chase;
mod config;
mod errors;
mod events;
mod exchange;
mod gateway;
mod ledger;
mod momentum;
mod price_cache;
mod reconciler;
mod risk_gate;
mod snapshots;
mod types;
mod util;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::gateway::Gateway;

const CONFIG_PATH: &str = "gateway_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Helios Perp Gateway — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = GatewayConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        GatewayConfig::default()
    });

    let api_key = std::env::var("HELIOS_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("HELIOS_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("HELIOS_API_KEY / HELIOS_API_SECRET not set — signed endpoints will fail");
    }

    // ── 2. Build & initialise the gateway ────────────────────────────────
    let gateway = Gateway::new(config, api_key, api_secret)?;
    gateway.initialize().await;

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 3. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    gateway.shutdown().await;

    if let Err(e) = gateway.config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save gateway config on shutdown");
    }

    info!("Helios Perp Gateway shut down complete.");
    Ok(())
}
