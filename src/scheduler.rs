// =============================================================================
// Scheduler — background loops sharing one `Arc<AppState>`
// =============================================================================
//
//   evaluation   one consumer of the bounded input channel; signals are
//                processed strictly one at a time
//   ttl sweep    expires non-terminal signals past their TTL
//   snapshot     snapshot + backup rotation
//   config       hot reload of the runtime config file
//   reconcile    structural repair of the derived indices
//
// Every periodic loop re-reads its interval from the live config on each tick,
// so a recalibrated interval applies without a restart.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::types::SignalInput;

/// Capacity of the signal input channel. Producers wait when it is full.
pub const INPUT_CHANNEL_CAPACITY: usize = 1_024;

/// Spawn every background loop. Returns the input sender and the task handles.
pub fn spawn_all(state: Arc<AppState>) -> (mpsc::Sender<SignalInput>, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);

    let handles = vec![
        tokio::spawn(run_evaluation_loop(state.clone(), rx)),
        tokio::spawn(run_ttl_sweep(state.clone())),
        tokio::spawn(run_snapshot_loop(state.clone())),
        tokio::spawn(run_config_reload(state.clone())),
        tokio::spawn(run_reconcile_loop(state)),
    ];

    info!(tasks = handles.len(), "background loops running");
    (tx, handles)
}

// ── Evaluation ──────────────────────────────────────────────────────────────

/// Consume inputs until every sender is dropped.
pub async fn run_evaluation_loop(state: Arc<AppState>, mut rx: mpsc::Receiver<SignalInput>) {
    info!("evaluation loop starting");
    while let Some(input) = rx.recv().await {
        let symbol = input.symbol.clone();
        match state.engine.process(input).await {
            Ok(envelope) if envelope.is_blocked() => debug!(
                symbol = %symbol,
                signal_id = %envelope.signal_id,
                gate = envelope.blocking_gate.as_deref().unwrap_or("-"),
                reason = envelope.reason.as_deref().unwrap_or("-"),
                "signal blocked"
            ),
            Ok(envelope) => debug!(
                symbol = %symbol,
                signal_id = %envelope.signal_id,
                state = %envelope.final_state,
                "signal processed"
            ),
            Err(e) => warn!(symbol = %symbol, error = %e, "signal dropped before evaluation"),
        }
    }
    info!("input channel closed — evaluation loop stopped");
}

// ── TTL sweep ───────────────────────────────────────────────────────────────

pub async fn run_ttl_sweep(state: Arc<AppState>) {
    loop {
        let every = Duration::from_secs(state.config.current().lifecycle.sweep_interval_secs.max(1));
        tokio::time::sleep(every).await;

        let sweep_state = state.clone();
        match tokio::task::spawn_blocking(move || sweep_state.sweep_expired()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!(expired = n, "TTL sweep expired stale signals"),
            // Already on the health monitor; retried next tick.
            Ok(Err(e)) => warn!(error = %e, "TTL sweep failed"),
            Err(e) => error!(error = %e, "TTL sweep task panicked"),
        }
    }
}

// ── Snapshots ───────────────────────────────────────────────────────────────

pub async fn run_snapshot_loop(state: Arc<AppState>) {
    loop {
        let every = Duration::from_secs(state.config.current().store.snapshot_interval_secs.max(1));
        tokio::time::sleep(every).await;

        let snap_state = state.clone();
        match tokio::task::spawn_blocking(move || snap_state.take_snapshot()).await {
            Ok(Ok(info)) => debug!(last_seq = info.last_seq, "periodic snapshot taken"),
            Ok(Err(e)) => warn!(error = %e, "periodic snapshot failed"),
            Err(e) => error!(error = %e, "snapshot task panicked"),
        }
    }
}

// ── Config reload ───────────────────────────────────────────────────────────

pub async fn run_config_reload(state: Arc<AppState>) {
    loop {
        let every = Duration::from_secs(state.config.current().reload_interval_secs.max(1));
        tokio::time::sleep(every).await;

        match state.config.reload_if_changed() {
            Ok(true) => info!(
                version = state.config.current().version,
                reloads = state.config.reload_count(),
                "runtime config reloaded"
            ),
            Ok(false) => {}
            // Already logged by the store; previous snapshot stays in effect.
            Err(e) => debug!(error = %e, "config reload rejected"),
        }
    }
}

// ── Reconciliation ──────────────────────────────────────────────────────────

pub async fn run_reconcile_loop(state: Arc<AppState>) {
    loop {
        let every = Duration::from_secs(state.config.current().store.reconcile_interval_secs.max(1));
        tokio::time::sleep(every).await;

        let recon_state = state.clone();
        match tokio::task::spawn_blocking(move || recon_state.reconcile()).await {
            Ok(Ok(result)) if result.repaired => warn!(
                position_drift = result.position_drift,
                signal_drift = result.signal_drift,
                "reconciliation repaired drifted indices"
            ),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "reconciliation failed"),
            Err(e) => error!(error = %e, "reconciliation task panicked"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperAdapter;
    use crate::lifecycle::SignalState;
    use crate::runtime_config::{ConfigStore, RuntimeConfig};
    use chrono::Utc;
    use std::collections::HashMap;

    fn input(symbol: &str) -> SignalInput {
        SignalInput {
            symbol: symbol.into(),
            timestamp: Utc::now(),
            scores: HashMap::from([("momentum".to_string(), 0.9), ("orderbook".to_string(), 0.9)]),
            price: None,
        }
    }

    #[tokio::test]
    async fn evaluation_loop_drains_channel_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let paper = PaperAdapter::new(0.0);
        for s in ["AAA", "BBB", "CCC"] {
            paper.mark_price(s, 10.0);
        }
        let state = Arc::new(
            AppState::open(
                Arc::new(ConfigStore::fixed(RuntimeConfig::default())),
                dir.path(),
                Arc::new(paper),
            )
            .unwrap(),
        );

        let (tx, rx) = mpsc::channel(4);
        let worker = tokio::spawn(run_evaluation_loop(state.clone(), rx));
        for s in ["AAA", "BBB", "CCC"] {
            tx.send(input(s)).await.unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let decisions = state.engine.recent_decisions(10);
        let symbols: Vec<&str> = decisions.iter().rev().map(|d| d.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAA", "BBB", "CCC"]);
        assert!(decisions.iter().all(|d| d.final_state == SignalState::Executed));
        assert_eq!(state.store.open_positions().unwrap().len(), 3);
    }
}
