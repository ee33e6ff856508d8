// =============================================================================
// Tick Arena — Main Entry Point
// =============================================================================
//
// Replays a historical tick corpus as a live market for a fixed real-time
// contest window. The engine boots idle: an admin starts a contest via the
// API once participants are connected.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod contest;
mod fanout;
mod market_data;
mod runtime_config;
mod storage;
mod trading;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::types::ContestStatus;

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
    info!("║        Tick Arena — Contest Engine Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Env overrides for the deployment-specific knobs.
    if let Ok(addr) = std::env::var("ARENA_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("ARENA_DB_PATH") {
        config.db_path = path;
    }
    if let Ok(syms) = std::env::var("ARENA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(
        db_path = %config.db_path,
        duration_secs = config.contest_duration_secs,
        base_interval_secs = config.base_interval_secs,
        "Engine configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config)?);

    // A contest never survives a restart: repair any row a previous process
    // left live, and start from a clean idle baseline.
    match state.store.mark_stale_contests_stopped() {
        Ok(0) => {}
        Ok(n) => warn!(rows = n, "marked stale contest rows STOPPED from a previous run"),
        Err(e) => error!(error = %e, "failed to repair stale contest rows"),
    }

    // ── 3. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = state.config.bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    match state.controller.status() {
        ContestStatus::Running | ContestStatus::Paused => {
            info!("Live contest found — running end-of-contest cleanup");
            if let Err(e) = state.controller.stop().await {
                error!(error = %e, "Failed to stop contest during shutdown");
            }
        }
        _ => {}
    }

    // Persist the effective config (including env overrides) so the next run
    // starts from the same knobs.
    if let Err(e) = state.config.save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Tick Arena shut down complete.");
    Ok(())
}
