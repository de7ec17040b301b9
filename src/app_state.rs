// =============================================================================
// Central Application State — Gatekeeper decision core
// =============================================================================
//
// Ties the durable store, the signal lifecycle, the decision engine and the
// health monitor together. Everything is wired from one data directory:
//
//   <data_dir>/ledger.jsonl                 append-only event ledger
//   <data_dir>/snapshot.json                latest snapshot
//   <data_dir>/backups/snapshot-<seq>.json  rotated snapshot backups
//
// Thread safety:
//   - Every subsystem manages its own interior mutability behind `Arc`.
//   - parking_lot::RwLock for the few bits of operational status kept here.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::DecisionEngine;
use crate::execution::ExecutionAdapter;
use crate::health::{HealthEvent, HealthMonitor, ModeStatus, Severity};
use crate::ledger::Ledger;
use crate::lifecycle::{Lifecycle, SignalState};
use crate::position_store::PositionStore;
use crate::reconcile::{reconcile_once, ReconcileResult};
use crate::recovery::{recover, RecoveryReport, RecoverySource};
use crate::runtime_config::{ConfigStore, RuntimeConfig};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::types::EngineMode;

const LEDGER_FILE: &str = "ledger.jsonl";

fn retention_cutoff(config: &RuntimeConfig) -> DateTime<Utc> {
    chrono::Duration::from_std(config.retention())
        .ok()
        .and_then(|retention| Utc::now().checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub config: Arc<ConfigStore>,

    // ── Durable state ───────────────────────────────────────────────────
    pub lifecycle: Arc<Lifecycle>,
    pub store: Arc<PositionStore>,
    pub snapshots: SnapshotStore,

    // ── Decisions ───────────────────────────────────────────────────────
    pub engine: Arc<DecisionEngine>,

    // ── Health ──────────────────────────────────────────────────────────
    pub health: Arc<HealthMonitor>,

    // ── Operational status ──────────────────────────────────────────────
    /// How the indices were rebuilt at startup.
    pub recovery: RecoveryReport,
    pub last_snapshot: RwLock<Option<SnapshotInfo>>,
    pub last_reconcile: RwLock<Option<ReconcileResult>>,
    /// Reason of the last refused snapshot, so a standing refusal alerts once.
    snapshot_refusal: RwLock<Option<String>>,
    pub data_dir: PathBuf,

    // ── Timing ──────────────────────────────────────────────────────────
    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

/// Where and when the last snapshot landed.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub last_seq: u64,
    pub path: PathBuf,
    pub taken_at: DateTime<Utc>,
}

impl AppState {
    /// Open the ledger under `data_dir`, run startup recovery and wire up
    /// every service.
    ///
    /// Fails only if the ledger file itself cannot be opened. Untrusted
    /// durable state is not an error: the engine comes up read-only.
    pub fn open(
        config: Arc<ConfigStore>,
        data_dir: impl Into<PathBuf>,
        adapter: Arc<dyn ExecutionAdapter>,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let cfg = config.current();
        let lock_timeout = cfg.lock_timeout();
        let snapshots = SnapshotStore::new(&data_dir, cfg.store.backup_keep);

        // Opening first truncates a torn tail before recovery reads it.
        let ledger_path = data_dir.join(LEDGER_FILE);
        let ledger = Arc::new(
            Ledger::open(&ledger_path, lock_timeout)
                .with_context(|| format!("failed to open ledger at {}", ledger_path.display()))?,
        );

        let mut recovered = recover(&snapshots, &ledger_path);
        let cutoff = retention_cutoff(&cfg);
        recovered.signals.prune_terminal(cutoff);
        recovered.positions.prune_closed(cutoff);
        let report = recovered.report;

        let health = Arc::new(HealthMonitor::new());
        for alert in &report.alerts {
            health.raise(alert.clone());
        }

        let lifecycle = Arc::new(Lifecycle::new(ledger.clone(), recovered.signals, lock_timeout));
        let store = Arc::new(PositionStore::new(ledger, recovered.positions, lock_timeout));

        if report.mode == EngineMode::ReadOnly {
            store.set_read_only(true);
            health.enter_read_only(format!("startup recovery ({:?})", report.source));
        }

        info!(
            data_dir = %data_dir.display(),
            source = ?report.source,
            base_seq = report.base_seq,
            replayed = report.replayed_events,
            mode = %report.mode,
            "durable state recovered"
        );

        let engine = Arc::new(DecisionEngine::new(
            config.clone(),
            lifecycle.clone(),
            store.clone(),
            health.clone(),
            adapter,
        ));

        Ok(Self {
            config,
            lifecycle,
            store,
            snapshots,
            engine,
            health,
            recovery: report,
            last_snapshot: RwLock::new(None),
            last_reconcile: RwLock::new(None),
            snapshot_refusal: RwLock::new(None),
            data_dir,
            start_time: std::time::Instant::now(),
        })
    }

    pub fn ledger_path(&self) -> &Path {
        self.store.ledger().path()
    }

    // ── Periodic duties ─────────────────────────────────────────────────

    /// Capture and persist a snapshot plus rotated backup.
    ///
    /// Refused while the ledger holds records that did not decode: a
    /// snapshot would become the new replay base and hide them for good.
    pub fn take_snapshot(&self) -> Result<SnapshotInfo> {
        if let Some(reason) = self.snapshot_blocker() {
            let mut last = self.snapshot_refusal.write();
            if last.as_deref() != Some(reason.as_str()) {
                self.health.raise(HealthEvent::new(
                    Severity::Warning,
                    "snapshot",
                    "snapshot_refused",
                    reason.clone(),
                ));
                *last = Some(reason.clone());
            }
            anyhow::bail!("snapshot refused: {reason}");
        }
        *self.snapshot_refusal.write() = None;

        let snapshot = match Snapshot::capture(&self.lifecycle, &self.store) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.health.raise(HealthEvent::new(
                    Severity::Warning,
                    "snapshot",
                    "snapshot_failed",
                    format!("snapshot not captured: {e}"),
                ));
                return Err(e.context("failed to capture snapshot"));
            }
        };
        let path = match self.snapshots.write(&snapshot) {
            Ok(path) => path,
            Err(e) => {
                self.health.raise(HealthEvent::new(
                    Severity::Error,
                    "snapshot",
                    "snapshot_write_failed",
                    format!("snapshot at seq {} not written: {e}", snapshot.last_seq),
                ));
                return Err(anyhow::Error::new(e).context("failed to write snapshot"));
            }
        };
        let info = SnapshotInfo {
            last_seq: snapshot.last_seq,
            path,
            taken_at: snapshot.taken_at,
        };
        *self.last_snapshot.write() = Some(info.clone());
        Ok(info)
    }

    /// Why snapshots are currently refused, if they are.
    pub fn snapshot_blocker(&self) -> Option<String> {
        let corrupt = self.known_corrupt_lines();
        if !corrupt.is_empty() {
            return Some(format!("ledger has undecodable lines {corrupt:?}"));
        }
        (self.recovery.source == RecoverySource::Empty)
            .then(|| "startup recovery found no trustworthy state".to_string())
    }

    /// Corrupt ledger lines as last observed by reconcile, else by recovery.
    fn known_corrupt_lines(&self) -> Vec<usize> {
        match self.last_reconcile.read().as_ref() {
            Some(last) => last.corrupt_ledger_lines.clone(),
            None => self.recovery.corrupt_ledger_lines.clone(),
        }
    }

    /// Expire every non-terminal signal past its TTL, then drop terminal
    /// records older than the retention window. Returns how many expired.
    pub fn sweep_expired(&self) -> Result<usize> {
        let config = self.config.current();
        let now = Utc::now();
        let expired = self
            .lifecycle
            .expire_stale(now, |symbol| config.signal_ttl_for(symbol))
            .map_err(|e| self.sweep_failed(anyhow::Error::new(e).context("TTL sweep failed")))?;

        let cutoff = retention_cutoff(&config);
        self.lifecycle
            .prune(cutoff)
            .map_err(|e| self.sweep_failed(anyhow::Error::new(e).context("signal pruning failed")))?;
        self.store
            .prune(cutoff)
            .map_err(|e| self.sweep_failed(anyhow::Error::new(e).context("position pruning failed")))?;
        Ok(expired.len())
    }

    fn sweep_failed(&self, e: anyhow::Error) -> anyhow::Error {
        self.health.raise(HealthEvent::new(
            Severity::Warning,
            "lifecycle",
            "sweep_failed",
            format!("{e:#}"),
        ));
        e
    }

    pub fn reconcile(&self) -> Result<ReconcileResult> {
        let known = self.known_corrupt_lines();
        let cutoff = retention_cutoff(&self.config.current());
        let result = match reconcile_once(
            &self.snapshots,
            &self.lifecycle,
            &self.store,
            &self.health,
            &known,
            Some(cutoff),
        ) {
            Ok(result) => result,
            Err(e) => {
                self.health.raise(HealthEvent::new(
                    Severity::Warning,
                    "reconcile",
                    "reconcile_failed",
                    format!("{e:#}"),
                ));
                return Err(e);
            }
        };
        *self.last_reconcile.write() = Some(result.clone());
        Ok(result)
    }

    // ── Operator control ────────────────────────────────────────────────

    /// Stop approvals and position writes.
    pub fn halt(&self, reason: &str) {
        self.health.enter_read_only(format!("operator halt: {reason}"));
        self.store.set_read_only(true);
    }

    /// Leave read-only mode. Returns `false` if the engine was not halted.
    pub fn resume(&self) -> bool {
        let resumed = self.health.resume();
        if resumed {
            self.store.set_read_only(false);
        } else {
            warn!("resume requested but engine is already in normal mode");
        }
        resumed
    }

    // ── Status ──────────────────────────────────────────────────────────

    /// Serialisable overview for the health endpoint.
    pub fn status(&self) -> EngineStatus {
        let config = self.config.current();
        let signals_by_state = self
            .lifecycle
            .index_snapshot()
            .map(|index| index.count_by_state())
            .unwrap_or_default();
        let open_positions = self.store.open_positions().map(|p| p.len()).ok();

        EngineStatus {
            mode: self.health.mode_status(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
            ledger_seq: self.store.ledger().last_seq().ok(),
            open_positions,
            signals_by_state,
            config_version: config.version,
            config_reloads: self.config.reload_count(),
            recovery: self.recovery.clone(),
            last_snapshot: self.last_snapshot.read().clone(),
            last_reconcile: self.last_reconcile.read().clone(),
            recent_events: self.health.recent(20),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("data_dir", &self.data_dir)
            .field("mode", &self.health.mode())
            .finish()
    }
}

// =============================================================================
// Serialisable status
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub mode: ModeStatus,
    pub uptime_secs: u64,
    pub server_time: i64,
    /// `None` when the ledger lock could not be taken in time.
    pub ledger_seq: Option<u64>,
    pub open_positions: Option<usize>,
    pub signals_by_state: HashMap<SignalState, usize>,
    pub config_version: u64,
    pub config_reloads: u64,
    pub recovery: RecoveryReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<SnapshotInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile: Option<ReconcileResult>,
    pub recent_events: Vec<HealthEvent>,
}
