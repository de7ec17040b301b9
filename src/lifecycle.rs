// =============================================================================
// Signal Lifecycle — state machine + ledger-derived index
// =============================================================================
//
// Life-cycle:
//   GENERATED  -> EVALUATING -> APPROVED | BLOCKED
//   APPROVED   -> EXECUTING  -> EXECUTED | BLOCKED (execution failure/timeout)
//   any non-terminal         -> EXPIRED  (TTL sweep)
//
// Every transition is validated against `SignalState::can_transition_to`
// *inside* the ledger lock, appended (durably) and only then applied to the
// in-memory index. A rejected transition is an explicit error; nothing is
// silently ignored.
//
// Terminal signals are retired, not deleted: they stay in the index and the
// ledger for audit.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LifecycleError;
use crate::gates::GateVerdict;
use crate::ledger::{EventKind, Ledger, LedgerEvent};
use crate::types::Direction;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalState {
    Generated,
    Evaluating,
    Approved,
    Blocked,
    Executing,
    Executed,
    Expired,
}

impl SignalState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Blocked | Self::Executed | Self::Expired)
    }

    /// The allowed-transition table.
    pub fn can_transition_to(self, next: SignalState) -> bool {
        use SignalState::*;
        match (self, next) {
            (Generated, Evaluating) => true,
            (Evaluating, Approved) | (Evaluating, Blocked) => true,
            (Approved, Executing) => true,
            (Executing, Executed) | (Executing, Blocked) => true,
            (from, Expired) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SignalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Generated => "GENERATED",
            Self::Evaluating => "EVALUATING",
            Self::Approved => "APPROVED",
            Self::Blocked => "BLOCKED",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A timestamped trading-opportunity candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub component_scores: HashMap<String, f64>,
    pub fused_score: f64,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the upstream score batch.
    pub observed_at: DateTime<Utc>,
    pub state: SignalState,
    /// Reason code attached to the latest transition (e.g. `sector_cap`).
    #[serde(default)]
    pub reason: Option<String>,
    /// Every state the signal has been in, oldest first.
    #[serde(default)]
    pub history: Vec<(SignalState, DateTime<Utc>)>,
}

impl Signal {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// In-memory view of all signals, derived from the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalIndex {
    signals: HashMap<String, Signal>,
    /// Highest ledger sequence applied. Replays skip anything at or below it.
    last_seq: u64,
}

impl SignalIndex {
    pub fn from_signals(signals: Vec<Signal>, last_seq: u64) -> Self {
        Self {
            signals: signals.into_iter().map(|s| (s.id.clone(), s)).collect(),
            last_seq,
        }
    }

    /// Apply one ledger event. Returns `false` if it was already applied or
    /// does not concern signals.
    pub fn apply(&mut self, event: &LedgerEvent) -> bool {
        if event.seq <= self.last_seq {
            return false;
        }
        self.last_seq = event.seq;

        match &event.event {
            EventKind::SignalGenerated(signal) => {
                self.signals
                    .entry(signal.id.clone())
                    .or_insert_with(|| signal.clone());
                true
            }
            EventKind::SignalTransition { from, to, reason } => {
                let Some(signal) = self.signals.get_mut(&event.subject_id) else {
                    warn!(signal_id = %event.subject_id, seq = event.seq, "transition for unknown signal");
                    return false;
                };
                if signal.state != *from {
                    warn!(
                        signal_id = %event.subject_id,
                        seq = event.seq,
                        expected = %from,
                        actual = %signal.state,
                        "ledger transition does not match index state"
                    );
                }
                signal.state = *to;
                signal.reason = reason.clone();
                signal.history.push((*to, event.timestamp));
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Signal> {
        self.signals.get(id)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn signals(&self) -> impl Iterator<Item = &Signal> {
        self.signals.values()
    }

    /// Drop terminal signals whose last transition is older than `cutoff`.
    pub fn prune_terminal(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.signals.len();
        self.signals.retain(|_, s| {
            let settled_at = s.history.last().map(|(_, at)| *at).unwrap_or(s.created_at);
            !s.state.is_terminal() || settled_at >= cutoff
        });
        before - self.signals.len()
    }

    /// Signals sorted by creation time, for snapshots and API listings.
    pub fn sorted(&self) -> Vec<Signal> {
        let mut out: Vec<Signal> = self.signals.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn count_by_state(&self) -> HashMap<SignalState, usize> {
        let mut counts = HashMap::new();
        for s in self.signals.values() {
            *counts.entry(s.state).or_insert(0) += 1;
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// Lifecycle service
// ---------------------------------------------------------------------------

/// Owns the signal index and writes every transition through the ledger.
pub struct Lifecycle {
    ledger: Arc<Ledger>,
    index: RwLock<SignalIndex>,
    lock_timeout: Duration,
}

impl Lifecycle {
    pub fn new(ledger: Arc<Ledger>, index: SignalIndex, lock_timeout: Duration) -> Self {
        Self {
            ledger,
            index: RwLock::new(index),
            lock_timeout,
        }
    }

    /// Record a freshly generated signal.
    pub fn register(&self, signal: Signal) -> Result<Signal, LifecycleError> {
        if signal.state != SignalState::Generated {
            return Err(LifecycleError::InvalidTransition {
                signal_id: signal.id.clone(),
                from: signal.state,
                to: SignalState::Generated,
            });
        }
        self.ledger.transact(|tx| {
            let mut index = self.write_index()?;
            let event = tx.append(signal.id.clone(), EventKind::SignalGenerated(signal.clone()))?;
            index.apply(&event);
            debug!(signal_id = %signal.id, symbol = %signal.symbol, fused = signal.fused_score, "signal registered");
            Ok(signal)
        })
    }

    /// Move `id` to `to`, validating against the transition table.
    pub fn transition(
        &self,
        id: &str,
        to: SignalState,
        reason: Option<&str>,
    ) -> Result<Signal, LifecycleError> {
        self.ledger.transact(|tx| {
            let mut index = self.write_index()?;
            let from = index
                .get(id)
                .map(|s| s.state)
                .ok_or_else(|| LifecycleError::UnknownSignal(id.to_string()))?;

            if !from.can_transition_to(to) {
                warn!(signal_id = id, %from, %to, "invalid transition rejected");
                return Err(LifecycleError::InvalidTransition {
                    signal_id: id.to_string(),
                    from,
                    to,
                });
            }

            let event = tx.append(
                id,
                EventKind::SignalTransition {
                    from,
                    to,
                    reason: reason.map(str::to_string),
                },
            )?;
            index.apply(&event);
            debug!(signal_id = id, %from, %to, reason = reason.unwrap_or("-"), "signal transition");
            index
                .get(id)
                .cloned()
                .ok_or_else(|| LifecycleError::UnknownSignal(id.to_string()))
        })
    }

    /// Record the ordered gate verdicts for a signal (audit only, no state
    /// change).
    pub fn record_verdicts(
        &self,
        id: &str,
        verdicts: &[GateVerdict],
        size_multiplier: f64,
    ) -> Result<(), LifecycleError> {
        self.ledger.transact(|tx| {
            let mut index = self.write_index()?;
            let event = tx.append(
                id,
                EventKind::GateVerdicts {
                    verdicts: verdicts.to_vec(),
                    size_multiplier,
                },
            )?;
            index.apply(&event);
            Ok(())
        })
    }

    /// Force every non-terminal signal older than its TTL into EXPIRED.
    ///
    /// `ttl_for` resolves the TTL per symbol so overrides apply.
    pub fn expire_stale(
        &self,
        now: DateTime<Utc>,
        ttl_for: impl Fn(&str) -> Duration,
    ) -> Result<Vec<Signal>, LifecycleError> {
        let candidates: Vec<String> = {
            let index = self.read_index()?;
            index
                .signals()
                .filter(|s| !s.state.is_terminal() && s.age(now) > ttl_for(&s.symbol))
                .map(|s| s.id.clone())
                .collect()
        };

        let mut expired = Vec::with_capacity(candidates.len());
        for id in candidates {
            match self.transition(&id, SignalState::Expired, Some("ttl_expired")) {
                Ok(signal) => {
                    info!(signal_id = %id, symbol = %signal.symbol, "signal expired by TTL sweep");
                    expired.push(signal);
                }
                // Reached a terminal state between the scan and the transition.
                Err(LifecycleError::InvalidTransition { .. }) => {
                    debug!(signal_id = %id, "signal settled before expiry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    pub fn get(&self, id: &str) -> Result<Option<Signal>, LifecycleError> {
        Ok(self.read_index()?.get(id).cloned())
    }

    /// Clone of the full index (snapshots, API, reconciliation).
    pub fn index_snapshot(&self) -> Result<SignalIndex, LifecycleError> {
        Ok(self.read_index()?.clone())
    }

    /// Drop terminal signals older than `cutoff` from the index.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let pruned = self.write_index()?.prune_terminal(cutoff);
        if pruned > 0 {
            debug!(pruned, cutoff = %cutoff, "terminal signals pruned from index");
        }
        Ok(pruned)
    }

    /// Swap in an index rebuilt from the durable record.
    pub fn replace_index(&self, index: SignalIndex) -> Result<(), LifecycleError> {
        *self.write_index()? = index;
        Ok(())
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    fn read_index(&self) -> Result<parking_lot::RwLockReadGuard<'_, SignalIndex>, LifecycleError> {
        self.index
            .try_read_for(self.lock_timeout)
            .ok_or(LifecycleError::LockTimeout(self.lock_timeout))
    }

    fn write_index(&self) -> Result<parking_lot::RwLockWriteGuard<'_, SignalIndex>, LifecycleError> {
        self.index
            .try_write_for(self.lock_timeout)
            .ok_or(LifecycleError::LockTimeout(self.lock_timeout))
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.index.try_read().map(|i| i.len()).unwrap_or(0);
        f.debug_struct("Lifecycle").field("signals", &count).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use SignalState::*;

    const ALL: [SignalState; 7] = [Generated, Evaluating, Approved, Blocked, Executing, Executed, Expired];

    fn signal(id: &str, created_at: DateTime<Utc>) -> Signal {
        Signal {
            id: id.to_string(),
            symbol: "X".into(),
            direction: Direction::Long,
            component_scores: HashMap::new(),
            fused_score: 0.4,
            confidence: 0.4,
            created_at,
            observed_at: created_at,
            state: Generated,
            reason: None,
            history: vec![(Generated, created_at)],
        }
    }

    fn lifecycle(dir: &tempfile::TempDir) -> Lifecycle {
        let ledger = Ledger::open(dir.path().join("ledger.jsonl"), Duration::from_millis(200)).unwrap();
        Lifecycle::new(Arc::new(ledger), SignalIndex::default(), Duration::from_millis(200))
    }

    fn valid_path(history: &[(SignalState, DateTime<Utc>)]) -> bool {
        history.first().map(|h| h.0) == Some(Generated)
            && history.windows(2).all(|w| w[0].0.can_transition_to(w[1].0))
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        assert!(Generated.can_transition_to(Evaluating));
        assert!(Evaluating.can_transition_to(Approved));
        assert!(Evaluating.can_transition_to(Blocked));
        assert!(Approved.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Executed));
        assert!(Executing.can_transition_to(Blocked));
        assert!(!Generated.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Executed));
        assert!(!Approved.can_transition_to(Blocked));
        assert!(!Executed.can_transition_to(Executing));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(Expired));
        }
    }

    #[test]
    fn happy_path_is_recorded_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(&dir);
        lc.register(signal("s1", Utc::now())).unwrap();
        for to in [Evaluating, Approved, Executing, Executed] {
            lc.transition("s1", to, None).unwrap();
        }
        let s = lc.get("s1").unwrap().unwrap();
        assert_eq!(s.state, Executed);
        assert_eq!(s.history.len(), 5);
        assert!(valid_path(&s.history));
    }

    #[test]
    fn invalid_transition_is_an_error_and_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(&dir);
        lc.register(signal("s1", Utc::now())).unwrap();
        lc.transition("s1", Evaluating, None).unwrap();
        lc.transition("s1", Approved, None).unwrap();

        let err = lc.transition("s1", Executed, None).unwrap_err();
        assert_eq!(err.reason_code(), "invalid_transition");
        assert_eq!(lc.get("s1").unwrap().unwrap().state, Approved);
        // Only generated + two transitions reached the ledger.
        assert_eq!(lc.ledger().read_since(0).unwrap().events.len(), 3);
    }

    #[test]
    fn unknown_signal_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(&dir);
        assert!(matches!(
            lc.transition("nope", Evaluating, None),
            Err(LifecycleError::UnknownSignal(_))
        ));
    }

    #[test]
    fn sweep_expires_only_stale_non_terminal_signals() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(&dir);
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(120);

        lc.register(signal("stale", old)).unwrap();
        lc.register(signal("stale-evaluating", old)).unwrap();
        lc.transition("stale-evaluating", Evaluating, None).unwrap();
        lc.register(signal("fresh", now)).unwrap();
        lc.register(signal("done", old)).unwrap();
        lc.transition("done", Evaluating, None).unwrap();
        lc.transition("done", Blocked, Some("sector_cap")).unwrap();

        let expired = lc.expire_stale(now, |_| Duration::from_secs(30)).unwrap();
        let mut ids: Vec<_> = expired.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["stale", "stale-evaluating"]);

        assert_eq!(lc.get("fresh").unwrap().unwrap().state, Generated);
        assert_eq!(lc.get("done").unwrap().unwrap().reason.as_deref(), Some("sector_cap"));
        let stale = lc.get("stale").unwrap().unwrap();
        assert_eq!(stale.reason.as_deref(), Some("ttl_expired"));
        assert!(valid_path(&stale.history));
    }

    #[test]
    fn prune_drops_only_settled_terminal_signals() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(&dir);
        let now = Utc::now();
        lc.register(signal("done", now)).unwrap();
        lc.transition("done", Evaluating, None).unwrap();
        lc.transition("done", Blocked, Some("sector_cap")).unwrap();
        lc.register(signal("pending", now - chrono::Duration::days(3))).unwrap();

        assert_eq!(lc.prune(now - chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(lc.prune(Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);
        assert!(lc.get("done").unwrap().is_none());
        assert_eq!(lc.get("pending").unwrap().unwrap().state, Generated);
        // The ledger still holds the pruned signal.
        assert_eq!(lc.ledger().read_since(0).unwrap().events.len(), 4);
    }

    #[test]
    fn no_signal_outlives_twice_its_ttl_when_swept_each_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(&dir);
        let ttl = Duration::from_secs(10);
        let start = Utc::now();

        for i in 0..20 {
            let created = start + chrono::Duration::seconds(i);
            lc.register(signal(&format!("s{i}"), created)).unwrap();
        }

        // Sweep once per TTL over a simulated minute.
        let mut t = start;
        for _ in 0..6 {
            t += chrono::Duration::seconds(10);
            lc.expire_stale(t, |_| ttl).unwrap();
            let index = lc.index_snapshot().unwrap();
            for s in index.signals() {
                if !s.state.is_terminal() {
                    assert!(s.age(t) <= ttl * 2, "{} stuck for {:?}", s.id, s.age(t));
                }
            }
        }
    }

    #[test]
    fn replaying_ledger_twice_yields_identical_index() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(&dir);
        lc.register(signal("a", Utc::now())).unwrap();
        lc.register(signal("b", Utc::now())).unwrap();
        lc.transition("a", Evaluating, None).unwrap();
        lc.transition("b", Expired, Some("ttl_expired")).unwrap();

        let events = lc.ledger().read_since(0).unwrap().events;
        let mut once = SignalIndex::default();
        for e in &events {
            once.apply(e);
        }
        let mut twice = once.clone();
        for e in &events {
            assert!(!twice.apply(e));
        }
        assert_eq!(once, twice);
        assert_eq!(once, lc.index_snapshot().unwrap());
    }
}
