// =============================================================================
// Gatekeeper — Main Entry Point
// =============================================================================
//
// Reads `SignalInput` JSON lines from stdin, gates them, executes approved
// ones against the paper adapter and serves the operator API. Durable state
// lives under `GATEKEEPER_DATA_DIR`; a final snapshot is taken on Ctrl+C.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::{api, scheduler, AppState, ConfigStore, PaperAdapter, RuntimeConfig, SignalInput};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Gatekeeper — Starting Up                          ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Runtime config ────────────────────────────────────────────────
    let config_path = PathBuf::from(
        std::env::var("GATEKEEPER_CONFIG").unwrap_or_else(|_| "runtime_config.json".into()),
    );
    if !config_path.exists() {
        warn!(path = %config_path.display(), "no runtime config found — seeding defaults");
        RuntimeConfig::default().save(&config_path)?;
    }
    // An unreadable config is fatal.
    let config = Arc::new(ConfigStore::from_file(&config_path)?);

    // ── 3. Durable state + recovery ──────────────────────────────────────
    let data_dir = PathBuf::from(std::env::var("GATEKEEPER_DATA_DIR").unwrap_or_else(|_| "data".into()));
    let slippage_bps = std::env::var("GATEKEEPER_PAPER_SLIPPAGE_BPS")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(2.0);
    let latency_ms = std::env::var("GATEKEEPER_PAPER_LATENCY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let paper = Arc::new(
        PaperAdapter::new(slippage_bps).with_latency(std::time::Duration::from_millis(latency_ms)),
    );

    let state = Arc::new(
        AppState::open(config.clone(), &data_dir, paper.clone())
            .context("failed to initialise durable state")?,
    );

    info!(
        data_dir = %data_dir.display(),
        mode = %state.health.mode(),
        source = ?state.recovery.source,
        "engine state ready"
    );

    // ── 4. Background loops ──────────────────────────────────────────────
    let (input_tx, _handles) = scheduler::spawn_all(state.clone());

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("GATEKEEPER_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3001".into());

    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind API server — API disabled");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 6. Signal input (stdin JSON lines) ───────────────────────────────
    tokio::spawn(read_stdin_inputs(input_tx, paper));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — taking final snapshot");

    let snap_state = state.clone();
    match tokio::task::spawn_blocking(move || snap_state.take_snapshot()).await {
        Ok(Ok(info)) => info!(last_seq = info.last_seq, "final snapshot written"),
        Ok(Err(e)) => error!(error = %e, "final snapshot failed — ledger replay will cover it"),
        Err(e) => error!(error = %e, "final snapshot task panicked"),
    }

    info!("Gatekeeper shut down complete.");
    Ok(())
}

/// Forward stdin lines to the evaluation loop. Malformed lines are skipped.
async fn read_stdin_inputs(tx: mpsc::Sender<SignalInput>, paper: Arc<PaperAdapter>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed — no further signal input");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let input: SignalInput = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                warn!(error = %e, "skipping malformed signal input line");
                continue;
            }
        };
        if let Some(price) = input.price {
            paper.mark_price(&input.symbol, price);
        }
        debug!(symbol = %input.symbol, components = input.scores.len(), "signal input received");

        if tx.send(input).await.is_err() {
            warn!("evaluation loop stopped — dropping further input");
            return;
        }
    }
}
