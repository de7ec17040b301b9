// =============================================================================
// Decision Engine — the pipeline every signal goes through
// =============================================================================
//
// Pipeline:
//   1. Fuse component scores (Signal Aggregator) and register the signal
//   2. GENERATED -> EVALUATING
//   3. Build the gate context (config snapshot, open positions, engine mode)
//   4. Run the gate chain and journal its verdicts
//   5. EVALUATING -> APPROVED | BLOCKED
//   6. (approved) APPROVED -> EXECUTING, call the adapter under a timeout
//   7. Record the fill in the position store, EXECUTING -> EXECUTED
//      or EXECUTING -> BLOCKED(execution_timeout | execution_failed)
//
// Every failure is contained to the signal being processed: it ends BLOCKED
// with a reason code (or is left for the TTL sweep to expire), and store-layer
// faults are escalated to the health monitor.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::decision_envelope::DecisionEnvelope;
use crate::error::{LedgerError, LifecycleError, StoreError};
use crate::execution::{ExecutionAdapter, ExecutionReport, ExecutionRequest};
use crate::gates::{GateChain, GateContext, GateStats, GateVerdict};
use crate::health::{HealthEvent, HealthMonitor, Severity};
use crate::lifecycle::{Lifecycle, Signal, SignalState};
use crate::position_store::{Position, PositionKey, PositionStore};
use crate::runtime_config::ConfigStore;
use crate::signals::SignalAggregator;
use crate::types::{Direction, EngineMode, SignalInput};

/// Maximum number of recent decisions to retain.
const MAX_RECENT_DECISIONS: usize = 100;
/// Closed positions handed to the timing gate.
const RECENT_CLOSED_WINDOW: usize = 50;

pub struct DecisionEngine {
    config: Arc<ConfigStore>,
    lifecycle: Arc<Lifecycle>,
    store: Arc<PositionStore>,
    health: Arc<HealthMonitor>,
    chain: GateChain,
    adapter: Arc<dyn ExecutionAdapter>,
    recent: RwLock<VecDeque<DecisionEnvelope>>,
}

impl DecisionEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        lifecycle: Arc<Lifecycle>,
        store: Arc<PositionStore>,
        health: Arc<HealthMonitor>,
        adapter: Arc<dyn ExecutionAdapter>,
    ) -> Self {
        let chain = GateChain::from_config(&config.current().gates);
        info!(adapter = adapter.name(), "decision engine ready");
        Self {
            config,
            lifecycle,
            store,
            health,
            chain,
            adapter,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_DECISIONS)),
        }
    }

    // -------------------------------------------------------------------------
    // Full pipeline
    // -------------------------------------------------------------------------

    /// Evaluate `input` and, if approved, execute it.
    ///
    /// Evaluation appends and fsyncs ledger records under timed locks, so it
    /// runs on the blocking pool rather than a runtime worker.
    pub async fn process(self: &Arc<Self>, input: SignalInput) -> anyhow::Result<DecisionEnvelope> {
        let engine = Arc::clone(self);
        let mut envelope = tokio::task::spawn_blocking(move || engine.evaluate(&input))
            .await
            .context("evaluation task panicked")??;
        if envelope.final_state == SignalState::Approved {
            envelope = self.execute(envelope).await;
        }
        self.push_decision(envelope.clone());
        Ok(envelope)
    }

    // -------------------------------------------------------------------------
    // Evaluation (steps 1-5)
    // -------------------------------------------------------------------------

    /// Fuse, gate and approve or block one input. Returns `Err` only when the
    /// signal could not even be registered.
    pub fn evaluate(&self, input: &SignalInput) -> anyhow::Result<DecisionEnvelope> {
        // Snapshot once: every gate for this signal sees the same thresholds.
        let config = self.config.current();

        let signal = SignalAggregator::build_signal(input, &config);
        let signal = self.lifecycle.register(signal).map_err(|e| {
            self.escalate_lifecycle(&e);
            anyhow::Error::new(e).context(format!("failed to register signal for {}", input.symbol))
        })?;

        if let Err(e) = self.lifecycle.transition(&signal.id, SignalState::Evaluating, None) {
            self.escalate_lifecycle(&e);
            return Ok(self.block(&signal, Vec::new(), None, e.reason_code()));
        }

        let open = match self.store.open_positions() {
            Ok(p) => p,
            Err(e) => {
                self.escalate_store(&e);
                return Ok(self.block(&signal, Vec::new(), None, e.reason_code()));
            }
        };
        let closed = match self.store.closed_positions(RECENT_CLOSED_WINDOW) {
            Ok(p) => p,
            Err(e) => {
                self.escalate_store(&e);
                return Ok(self.block(&signal, Vec::new(), None, e.reason_code()));
            }
        };

        let ctx = GateContext {
            config: &config,
            open_positions: &open,
            recently_closed: &closed,
            engine_mode: self.health.mode(),
            now: Utc::now(),
        };
        let result = self.chain.evaluate(&signal, &ctx);

        if let Err(e) = self
            .lifecycle
            .record_verdicts(&signal.id, &result.verdicts, result.size_multiplier)
        {
            self.escalate_lifecycle(&e);
            return Ok(self.block(&signal, result.verdicts, None, e.reason_code()));
        }

        if let (Some(gate), Some(reason)) = (result.blocked_by, result.block_reason.as_deref()) {
            return Ok(self.block(&signal, result.verdicts.clone(), Some(gate.name().to_string()), reason));
        }

        // The symbol-state gate covers this, but approvals must stop in
        // read-only mode even if that gate is disabled.
        if self.health.mode() == EngineMode::ReadOnly {
            return Ok(self.block(&signal, result.verdicts, None, "store_degraded"));
        }
        if signal.direction == Direction::Neutral {
            return Ok(self.block(&signal, result.verdicts, None, "no_direction"));
        }

        let target_size = config.base_size_for(&signal.symbol) * result.size_multiplier;
        if !(target_size > 0.0) {
            return Ok(self.block(&signal, result.verdicts, None, "zero_size"));
        }

        if let Err(e) = self.lifecycle.transition(&signal.id, SignalState::Approved, None) {
            self.escalate_lifecycle(&e);
            return Ok(self.block(&signal, result.verdicts, None, e.reason_code()));
        }

        info!(
            signal_id = %signal.id,
            symbol = %signal.symbol,
            direction = %signal.direction,
            fused = signal.fused_score,
            multiplier = result.size_multiplier,
            target_size,
            "signal approved"
        );
        Ok(DecisionEnvelope::approved(&signal, &result, target_size))
    }

    // -------------------------------------------------------------------------
    // Execution (steps 6-7)
    // -------------------------------------------------------------------------

    /// Execute an approved decision. Never fails: every outcome is recorded
    /// on the returned envelope and in the ledger.
    pub async fn execute(&self, mut envelope: DecisionEnvelope) -> DecisionEnvelope {
        let config = self.config.current();

        if let Err(e) = self
            .lifecycle
            .transition(&envelope.signal_id, SignalState::Executing, None)
        {
            // Typically expired by the sweep while waiting.
            warn!(signal_id = %envelope.signal_id, error = %e, "approved signal could not start executing");
            self.escalate_lifecycle(&e);
            let state = self.current_state(&envelope.signal_id, SignalState::Approved);
            envelope.settle(state, Some(e.reason_code().to_string()), None);
            return envelope;
        }

        let request = ExecutionRequest {
            symbol: envelope.symbol.clone(),
            direction: envelope.direction,
            target_size: envelope.target_size,
            signal_id: envelope.signal_id.clone(),
        };
        let timeout = config.adapter_timeout();

        match tokio::time::timeout(timeout, self.adapter.execute(request)).await {
            Err(_) => {
                warn!(
                    signal_id = %envelope.signal_id,
                    adapter = self.adapter.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "execution adapter timed out"
                );
                self.finish_blocked(envelope, "execution_timeout", None)
            }
            Ok(Err(e)) => {
                warn!(signal_id = %envelope.signal_id, error = %e, "execution adapter failed");
                self.finish_blocked(envelope, "execution_failed", None)
            }
            Ok(Ok(report)) if !report.success => {
                warn!(
                    signal_id = %envelope.signal_id,
                    code = report.error_code.as_deref().unwrap_or("-"),
                    "execution rejected"
                );
                self.finish_blocked(envelope, "execution_failed", Some(report))
            }
            Ok(Ok(report)) if !(report.fill_price > 0.0 && report.filled_size > 0.0) => {
                warn!(
                    signal_id = %envelope.signal_id,
                    fill_price = report.fill_price,
                    filled_size = report.filled_size,
                    "execution report has no usable fill"
                );
                self.finish_blocked(envelope, "execution_failed", Some(report))
            }
            Ok(Ok(report)) => self.record_fill(envelope, report),
        }
    }

    fn record_fill(&self, mut envelope: DecisionEnvelope, report: ExecutionReport) -> DecisionEnvelope {
        let key = PositionKey::new(envelope.symbol.clone(), envelope.direction);
        let position = Position::new_open(
            &envelope.symbol,
            envelope.direction,
            report.fill_price,
            report.filled_size,
            Some(envelope.signal_id.clone()),
        );

        let recorded = match self.store.open(position) {
            Err(StoreError::AlreadyOpen(_)) => {
                // Another fill for the same key landed first.
                self.health.raise(HealthEvent::new(
                    Severity::Warning,
                    "execution",
                    "fill_merged",
                    format!("fill for {key} merged into the already open position"),
                ));
                self.store
                    .merge_fill(&key, report.fill_price, report.filled_size)
            }
            other => other,
        };

        match recorded {
            Ok(position) => {
                let state = match self
                    .lifecycle
                    .transition(&envelope.signal_id, SignalState::Executed, None)
                {
                    Ok(s) => s.state,
                    Err(e) => {
                        warn!(signal_id = %envelope.signal_id, error = %e, "fill recorded but signal not marked executed");
                        self.escalate_lifecycle(&e);
                        self.current_state(&envelope.signal_id, SignalState::Executing)
                    }
                };
                info!(
                    signal_id = %envelope.signal_id,
                    key = %key,
                    position_id = %position.id,
                    fill_price = report.fill_price,
                    filled_size = report.filled_size,
                    "signal executed"
                );
                envelope.settle(state, None, Some(report));
                envelope
            }
            Err(e) => {
                self.health.raise(HealthEvent::new(
                    Severity::Critical,
                    "execution",
                    "unrecorded_fill",
                    format!(
                        "adapter filled {} {} @ {} for signal {} but the store rejected it: {e}",
                        report.filled_size, key, report.fill_price, envelope.signal_id
                    ),
                ));
                self.escalate_store(&e);
                self.finish_blocked(envelope, "position_write_failed", Some(report))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Outcome helpers
    // -------------------------------------------------------------------------

    /// Move `signal` to BLOCKED and build its envelope.
    fn block(
        &self,
        signal: &Signal,
        verdicts: Vec<GateVerdict>,
        gate: Option<String>,
        reason: &str,
    ) -> DecisionEnvelope {
        let mut envelope = DecisionEnvelope::blocked(signal, verdicts, gate, reason);
        match self
            .lifecycle
            .transition(&signal.id, SignalState::Blocked, Some(reason))
        {
            Ok(_) => {
                info!(signal_id = %signal.id, symbol = %signal.symbol, reason, "signal blocked");
            }
            Err(e) => {
                // Left non-terminal; the TTL sweep will expire it.
                warn!(signal_id = %signal.id, reason, error = %e, "could not record block");
                self.escalate_lifecycle(&e);
                let state = self.current_state(&signal.id, SignalState::Evaluating);
                envelope.settle(state, None, None);
            }
        }
        envelope
    }

    fn finish_blocked(
        &self,
        mut envelope: DecisionEnvelope,
        reason: &str,
        report: Option<ExecutionReport>,
    ) -> DecisionEnvelope {
        let state = match self
            .lifecycle
            .transition(&envelope.signal_id, SignalState::Blocked, Some(reason))
        {
            Ok(s) => s.state,
            Err(e) => {
                warn!(signal_id = %envelope.signal_id, reason, error = %e, "could not record execution block");
                self.escalate_lifecycle(&e);
                self.current_state(&envelope.signal_id, SignalState::Executing)
            }
        };
        envelope.size_multiplier = 0.0;
        envelope.settle(state, Some(reason.to_string()), report);
        envelope
    }

    fn current_state(&self, signal_id: &str, fallback: SignalState) -> SignalState {
        match self.lifecycle.get(signal_id) {
            Ok(Some(s)) => s.state,
            _ => fallback,
        }
    }

    fn escalate_lifecycle(&self, e: &LifecycleError) {
        match e {
            LifecycleError::Ledger(le) => self.escalate_ledger(le),
            LifecycleError::LockTimeout(timeout) => self.raise_lock_timeout("signal index", *timeout),
            _ => {}
        }
    }

    fn escalate_store(&self, e: &StoreError) {
        match e {
            StoreError::Ledger(le) => self.escalate_ledger(le),
            StoreError::LockTimeout { key, timeout } => self.raise_lock_timeout(key, *timeout),
            _ => {}
        }
    }

    /// Durable-write failures stop approvals; lock timeouts only warn.
    fn escalate_ledger(&self, e: &LedgerError) {
        match e {
            LedgerError::LockTimeout(timeout) => self.raise_lock_timeout("ledger", *timeout),
            _ => {
                error!(error = %e, "ledger write failed");
                self.health.raise(HealthEvent::new(
                    Severity::Error,
                    "ledger",
                    "ledger_io_error",
                    e.to_string(),
                ));
                self.health.enter_read_only("ledger write failure");
            }
        }
    }

    fn raise_lock_timeout(&self, what: &str, timeout: Duration) {
        self.health.raise(HealthEvent::new(
            Severity::Warning,
            "store",
            "lock_timeout",
            format!("{what} lock not acquired within {timeout:?}"),
        ));
    }

    // -------------------------------------------------------------------------
    // Audit / introspection
    // -------------------------------------------------------------------------

    fn push_decision(&self, envelope: DecisionEnvelope) {
        let mut recent = self.recent.write();
        recent.push_back(envelope);
        while recent.len() > MAX_RECENT_DECISIONS {
            recent.pop_front();
        }
    }

    /// The `n` most recent decisions, newest first.
    pub fn recent_decisions(&self, n: usize) -> Vec<DecisionEnvelope> {
        self.recent.read().iter().rev().take(n).cloned().collect()
    }

    pub fn gate_stats(&self) -> Vec<GateStats> {
        self.chain.stats()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn store(&self) -> &Arc<PositionStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("gates", &self.chain.gates())
            .field("adapter", &self.adapter.name())
            .field("store", &self.store)
            .finish()
    }
}
