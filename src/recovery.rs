// =============================================================================
// Startup Recovery — rebuild the indices from snapshot + ledger tail
// =============================================================================
//
// Ladder, first rung that holds wins:
//   1. primary snapshot valid            -> snapshot + ledger tail
//   2. newest valid backup               -> backup + ledger tail      (error alert)
//   3. ledger alone                      -> full ledger replay        (error alert)
//   4. nothing decodes at all            -> empty indices, ReadOnly   (critical alert)
//
// No snapshot and no backups at all is the normal state before the first
// snapshot is taken; that replays the ledger quietly. A ledger with corrupt
// lines is always replayed as far as it decodes, then the engine is put in
// ReadOnly until an operator resumes.
// =============================================================================

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::health::{HealthEvent, Severity};
use crate::ledger::{read_events, LedgerScan};
use crate::lifecycle::SignalIndex;
use crate::position_store::PositionIndex;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::types::EngineMode;

/// Where the recovered state came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum RecoverySource {
    /// No durable state at all: first start.
    Fresh,
    Snapshot,
    Backup(PathBuf),
    LedgerOnly,
    /// Nothing could be trusted; indices are empty.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub source: RecoverySource,
    /// `last_seq` of the snapshot the replay started from (0 for none).
    pub base_seq: u64,
    pub replayed_events: usize,
    pub corrupt_ledger_lines: Vec<usize>,
    pub mode: EngineMode,
    pub alerts: Vec<HealthEvent>,
}

/// Indices ready to hand to `Lifecycle` and `PositionStore`.
#[derive(Debug)]
pub struct Recovered {
    pub positions: PositionIndex,
    pub signals: SignalIndex,
    pub report: RecoveryReport,
}

/// Run the recovery ladder against `snapshots` and the ledger at `ledger_path`.
pub fn recover(snapshots: &SnapshotStore, ledger_path: &Path) -> Recovered {
    recover_through(snapshots, ledger_path, None)
}

/// Same ladder, but events after `through` are ignored. Reconciliation uses
/// this to rebuild at the sequence it captured.
pub fn recover_through(snapshots: &SnapshotStore, ledger_path: &Path, through: Option<u64>) -> Recovered {
    let mut alerts = Vec::new();

    // ── Rung 1 / 2: pick a base snapshot ─────────────────────────────────
    let (base, source) = match snapshots.load_primary() {
        Ok(Some(snapshot)) => (Some(snapshot), RecoverySource::Snapshot),
        Ok(None) => match backup_base(snapshots, &mut alerts, "primary snapshot missing") {
            Some((path, snapshot)) => (Some(snapshot), RecoverySource::Backup(path)),
            None => (None, RecoverySource::Fresh),
        },
        Err(e) => {
            alerts.push(HealthEvent::new(
                Severity::Error,
                "recovery",
                "snapshot_invalid",
                format!("primary snapshot rejected: {e}"),
            ));
            match backup_base(snapshots, &mut alerts, "primary snapshot invalid") {
                Some((path, snapshot)) => (Some(snapshot), RecoverySource::Backup(path)),
                None => (None, RecoverySource::LedgerOnly),
            }
        }
    };

    let base_seq = base.as_ref().map(|s| s.last_seq).unwrap_or(0);

    // ── Ledger tail ──────────────────────────────────────────────────────
    let scan = match read_events(ledger_path, base_seq) {
        Ok(scan) => Some(scan),
        Err(e) => {
            alerts.push(HealthEvent::new(
                Severity::Critical,
                "recovery",
                "ledger_unreadable",
                format!("ledger at {} unreadable: {e}", ledger_path.display()),
            ));
            None
        }
    };
    let ledger_clean = scan.as_ref().map(LedgerScan::is_clean).unwrap_or(false);
    let corrupt_ledger_lines = scan
        .as_ref()
        .map(|s| s.corrupt_lines.clone())
        .unwrap_or_default();
    if let Some(scan) = scan.as_ref().filter(|s| !s.is_clean()) {
        alerts.push(HealthEvent::new(
            Severity::Critical,
            "recovery",
            "ledger_corrupt",
            format!(
                "ledger has {} undecodable line(s): {:?}; replaying the rest read-only",
                scan.corrupt_lines.len(),
                scan.corrupt_lines
            ),
        ));
    }

    let mut events = scan.map(|s| s.events).unwrap_or_default();
    if let Some(through) = through {
        events.retain(|e| e.seq <= through);
    }

    let snapshot_was_rejected = source == RecoverySource::LedgerOnly;

    // ── Rung 4: nothing trustworthy ──────────────────────────────────────
    // Reached only when there is no base and not a single decodable event.
    // Whatever does decode is always replayed, so open positions are never
    // dropped just because a neighbouring line is damaged.
    if base.is_none() && !ledger_clean && events.is_empty() {
        alerts.push(HealthEvent::new(
            Severity::Critical,
            "recovery",
            "store_untrusted",
            "neither snapshot nor ledger can be trusted; starting empty in read-only mode",
        ));
        return finish(
            PositionIndex::default(),
            SignalIndex::default(),
            RecoveryReport {
                source: RecoverySource::Empty,
                base_seq: 0,
                replayed_events: 0,
                corrupt_ledger_lines,
                mode: EngineMode::ReadOnly,
                alerts,
            },
        );
    }

    // ── Build from base (or nothing) and replay the tail ─────────────────
    let (mut positions, mut signals) = match base.map(Snapshot::into_indices) {
        Some(Ok(indices)) => indices,
        // Already validated by `load_file`.
        Some(Err(e)) => {
            alerts.push(HealthEvent::new(
                Severity::Error,
                "recovery",
                "snapshot_invalid",
                format!("snapshot rejected while rebuilding: {e}"),
            ));
            (PositionIndex::default(), SignalIndex::default())
        }
        None => (PositionIndex::default(), SignalIndex::default()),
    };

    let mut replayed = 0;
    for event in &events {
        let p = positions.apply(event);
        let s = signals.apply(event);
        if p || s {
            replayed += 1;
        }
    }

    let source = match source {
        RecoverySource::Fresh if !events.is_empty() || !ledger_clean => RecoverySource::LedgerOnly,
        other => other,
    };
    if snapshot_was_rejected {
        alerts.push(HealthEvent::new(
            Severity::Error,
            "recovery",
            "ledger_only_replay",
            format!("no valid snapshot or backup; rebuilt from {} ledger event(s)", events.len()),
        ));
    }

    let mode = if ledger_clean {
        EngineMode::Normal
    } else {
        EngineMode::ReadOnly
    };

    finish(
        positions,
        signals,
        RecoveryReport {
            source,
            base_seq,
            replayed_events: replayed,
            corrupt_ledger_lines,
            mode,
            alerts,
        },
    )
}

fn backup_base(
    snapshots: &SnapshotStore,
    alerts: &mut Vec<HealthEvent>,
    why: &str,
) -> Option<(PathBuf, Snapshot)> {
    match snapshots.newest_valid_backup() {
        Ok(Some((path, snapshot))) => {
            alerts.push(HealthEvent::new(
                Severity::Error,
                "recovery",
                "restored_from_backup",
                format!("{why}; restored from backup {}", path.display()),
            ));
            Some((path, snapshot))
        }
        Ok(None) => None,
        Err(e) => {
            alerts.push(HealthEvent::new(
                Severity::Error,
                "recovery",
                "backups_unreadable",
                format!("snapshot backups unreadable: {e}"),
            ));
            None
        }
    }
}

fn finish(positions: PositionIndex, signals: SignalIndex, report: RecoveryReport) -> Recovered {
    info!(
        source = ?report.source,
        base_seq = report.base_seq,
        replayed = report.replayed_events,
        live_positions = positions.live_count(),
        signals = signals.len(),
        mode = %report.mode,
        alerts = report.alerts.len(),
        "recovery complete"
    );
    Recovered {
        positions,
        signals,
        report,
    }
}
