// =============================================================================
// Reconciliation — compare the live indices against the durable record
// =============================================================================
//
// SAFETY POLICY: this module only repairs *structure*. It rebuilds the derived
// indices from snapshot + ledger and swaps them in when they drifted, but it
// will **never** open, close or re-size a position on its own. Anything it
// cannot rebuild cleanly is escalated to the health monitor and left for an
// operator.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::health::{HealthEvent, HealthMonitor, Severity};
use crate::lifecycle::{Lifecycle, Signal, SignalIndex};
use crate::position_store::{Position, PositionIndex, PositionStore};
use crate::ledger::read_events;
use crate::recovery::{recover_through, RecoverySource};
use crate::snapshot::SnapshotStore;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    /// Ledger sequence the pass was taken at.
    pub ledger_seq: u64,
    /// Positions whose live copy differs from the rebuilt one (or is missing
    /// on either side).
    pub position_drift: usize,
    pub signal_drift: usize,
    /// Whether the rebuilt indices were swapped in.
    pub repaired: bool,
    /// Set when the durable record could not be rebuilt cleanly.
    pub skipped_reason: Option<String>,
    /// Undecodable ledger lines seen by this pass.
    #[serde(default)]
    pub corrupt_ledger_lines: Vec<usize>,
    /// ISO-8601 timestamp of this reconciliation run.
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Run one reconciliation cycle.
///
/// 1. Under the ledger lock, note the ledger sequence and copy both indices.
/// 2. Without the lock, rebuild from snapshot + ledger up to that sequence.
/// 3. On drift, retake the lock, roll the rebuild forward over anything
///    appended meanwhile, and swap it in.
///
/// `known_corrupt` lists ledger lines already reported; recovery alerts are
/// raised again only when the set of corrupt lines changes. Terminal records
/// settled before `prune_before` are left out of both sides of the diff.
pub fn reconcile_once(
    snapshots: &SnapshotStore,
    lifecycle: &Lifecycle,
    store: &PositionStore,
    health: &HealthMonitor,
    known_corrupt: &[usize],
    prune_before: Option<DateTime<Utc>>,
) -> Result<ReconcileResult> {
    let now = Utc::now().to_rfc3339();
    debug!(timestamp = %now, "reconciliation cycle started");

    let ledger = store.ledger().clone();

    // -----------------------------------------------------------------
    // 1. Consistent view of the live indices
    // -----------------------------------------------------------------
    let (ledger_seq, mut live_positions, mut live_signals) = ledger.transact(|tx| -> Result<_> {
        let positions = store
            .index_snapshot()
            .context("reconcile: position index unavailable")?;
        let signals = lifecycle
            .index_snapshot()
            .context("reconcile: signal index unavailable")?;
        Ok((tx.last_seq(), positions, signals))
    })?;

    // -----------------------------------------------------------------
    // 2. Rebuild from the durable record
    // -----------------------------------------------------------------
    let mut rebuilt = recover_through(snapshots, ledger.path(), Some(ledger_seq));
    let corrupt_ledger_lines = rebuilt.report.corrupt_ledger_lines.clone();
    if let Some(cutoff) = prune_before {
        for positions in [&mut live_positions, &mut rebuilt.positions] {
            positions.prune_closed(cutoff);
        }
        for signals in [&mut live_signals, &mut rebuilt.signals] {
            signals.prune_terminal(cutoff);
        }
    }

    let skip = |reason: String, position_drift: usize, signal_drift: usize| ReconcileResult {
        ledger_seq,
        position_drift,
        signal_drift,
        repaired: false,
        skipped_reason: Some(reason),
        corrupt_ledger_lines: corrupt_ledger_lines.clone(),
        timestamp: now.clone(),
    };

    if rebuilt.report.base_seq > ledger_seq {
        // A snapshot landed after step 1; the next cycle compares against it.
        debug!(base_seq = rebuilt.report.base_seq, ledger_seq, "snapshot newer than reconcile view");
        return Ok(skip("snapshot newer than reconcile view".into(), 0, 0));
    }

    let untrusted = match &rebuilt.report.source {
        RecoverySource::Empty => Some("durable record untrusted".to_string()),
        _ if !corrupt_ledger_lines.is_empty() => Some(format!(
            "ledger has {} corrupt line(s)",
            corrupt_ledger_lines.len()
        )),
        _ => None,
    };

    // -----------------------------------------------------------------
    // 3. Compare with the live indices
    // -----------------------------------------------------------------
    let position_drift = diff_positions(&live_positions, &rebuilt.positions);
    let signal_drift = diff_signals(&live_signals, &rebuilt.signals);

    if let Some(reason) = untrusted {
        if corrupt_ledger_lines.as_slice() != known_corrupt {
            for alert in std::mem::take(&mut rebuilt.report.alerts) {
                health.raise(alert);
            }
        }
        warn!(reason = %reason, position_drift, signal_drift, "reconciliation skipped repair");
        return Ok(skip(reason, position_drift, signal_drift));
    }

    // -----------------------------------------------------------------
    // 4. Repair
    // -----------------------------------------------------------------
    let repaired = position_drift > 0 || signal_drift > 0;
    if repaired {
        let mut positions = rebuilt.positions;
        let mut signals = rebuilt.signals;
        ledger.transact(|tx| -> Result<()> {
            let current_seq = tx.last_seq();
            if current_seq > ledger_seq {
                roll_forward(ledger.path(), ledger_seq, current_seq, &mut positions, &mut signals)?;
            }
            store
                .replace_index(positions)
                .context("reconcile: failed to swap position index")?;
            lifecycle
                .replace_index(signals)
                .context("reconcile: failed to swap signal index")?;
            Ok(())
        })?;
        health.raise(HealthEvent::new(
            Severity::Warning,
            "reconcile",
            "index_drift",
            format!(
                "rebuilt indices from the ledger at seq {ledger_seq}: \
                 {position_drift} position(s), {signal_drift} signal(s) differed"
            ),
        ));
    }

    info!(
        ledger_seq,
        position_drift,
        signal_drift,
        repaired,
        timestamp = %now,
        "reconciliation cycle completed"
    );

    Ok(ReconcileResult {
        ledger_seq,
        position_drift,
        signal_drift,
        repaired,
        skipped_reason: None,
        corrupt_ledger_lines,
        timestamp: now,
    })
}

/// Apply ledger events in `(from, to]` to a rebuild taken at `from`.
fn roll_forward(
    path: &Path,
    from: u64,
    to: u64,
    positions: &mut PositionIndex,
    signals: &mut SignalIndex,
) -> Result<()> {
    let tail = read_events(path, from).context("reconcile: failed to read ledger tail")?;
    if !tail.is_clean() {
        anyhow::bail!("reconcile: ledger tail has corrupt lines {:?}", tail.corrupt_lines);
    }
    for event in tail.events.iter().filter(|e| e.seq <= to) {
        positions.apply(event);
        signals.apply(event);
    }
    debug!(from, to, "rolled rebuild forward over new appends");
    Ok(())
}

// ---------------------------------------------------------------------------
// Diffing
// ---------------------------------------------------------------------------

/// Number of positions (by id) that differ between `live` and `rebuilt`.
fn diff_positions(live: &PositionIndex, rebuilt: &PositionIndex) -> usize {
    let by_id = |index: &PositionIndex| -> BTreeMap<String, Position> {
        index
            .all_positions()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect()
    };
    count_differences(&by_id(live), &by_id(rebuilt), |id| {
        debug!(position_id = %id, "position drift");
    })
}

fn diff_signals(live: &SignalIndex, rebuilt: &SignalIndex) -> usize {
    let by_id = |index: &SignalIndex| -> BTreeMap<String, Signal> {
        index.signals().map(|s| (s.id.clone(), s.clone())).collect()
    };
    count_differences(&by_id(live), &by_id(rebuilt), |id| {
        debug!(signal_id = %id, "signal drift");
    })
}

fn count_differences<T: PartialEq>(
    live: &BTreeMap<String, T>,
    rebuilt: &BTreeMap<String, T>,
    mut on_drift: impl FnMut(&str),
) -> usize {
    let mut drift = 0;
    for (id, item) in live {
        if rebuilt.get(id) != Some(item) {
            on_drift(id);
            drift += 1;
        }
    }
    for id in rebuilt.keys().filter(|id| !live.contains_key(*id)) {
        on_drift(id);
        drift += 1;
    }
    drift
}
