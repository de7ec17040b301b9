// =============================================================================
// Decision Envelope — Auditable record of every approve / block decision
// =============================================================================
//
// Every signal flows through aggregation, the gate chain and (if approved)
// execution. The envelope captures the verdict from each step so that every
// decision can be audited after the fact. The ordered gate verdicts are also
// written to the ledger; the envelope is the in-memory view kept for the
// operator API.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::execution::ExecutionReport;
use crate::gates::{ChainResult, GateVerdict};
use crate::lifecycle::{Signal, SignalState};
use crate::types::Direction;

/// Complete auditable record of one signal's decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEnvelope {
    /// Unique identifier for this decision (UUID v4).
    pub id: String,

    pub signal_id: String,

    pub symbol: String,

    pub direction: Direction,

    pub fused_score: f64,

    /// Ordered gate verdicts, ending at the first block (if any).
    pub verdicts: Vec<GateVerdict>,

    /// Final multiplier from the gate chain; 0 when blocked.
    pub size_multiplier: f64,

    /// Base size times the multiplier. 0 when blocked.
    pub target_size: f64,

    /// Terminal (or last reached) signal state.
    pub final_state: SignalState,

    /// Gate that blocked the signal, if a gate did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_gate: Option<String>,

    /// Machine-readable reason for the final state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Adapter report when execution was attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,

    pub created_at: DateTime<Utc>,
}

impl DecisionEnvelope {
    /// Envelope for a signal the chain approved.
    pub fn approved(signal: &Signal, chain: &ChainResult, target_size: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            fused_score: signal.fused_score,
            verdicts: chain.verdicts.clone(),
            size_multiplier: chain.size_multiplier,
            target_size,
            final_state: SignalState::Approved,
            blocking_gate: None,
            reason: None,
            execution: None,
            created_at: Utc::now(),
        }
    }

    /// Envelope for a blocked signal. `verdicts` may be empty when the block
    /// happened before the chain ran (e.g. a lock timeout).
    pub fn blocked(
        signal: &Signal,
        verdicts: Vec<GateVerdict>,
        blocking_gate: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal.id.clone(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            fused_score: signal.fused_score,
            verdicts,
            size_multiplier: 0.0,
            target_size: 0.0,
            final_state: SignalState::Blocked,
            blocking_gate,
            reason: Some(reason.into()),
            execution: None,
            created_at: Utc::now(),
        }
    }

    /// Record where execution left the signal.
    pub fn settle(&mut self, final_state: SignalState, reason: Option<String>, execution: Option<ExecutionReport>) {
        self.final_state = final_state;
        if reason.is_some() {
            self.reason = reason;
        }
        if execution.is_some() {
            self.execution = execution;
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.final_state == SignalState::Blocked
    }
}
