// =============================================================================
// Gate Chain — ordered evaluation with cumulative size multiplier
// =============================================================================
//
// The composition is fixed at construction: the enabled list from config is
// de-duplicated and stable-sorted by tier. Thresholds are not captured here;
// each evaluation reads the config snapshot in `GateContext`.
//
// Multiplier rules:
//   - starts at 1.0 (bounded by `size_multiplier_cap`)
//   - Reduce(f) multiplies by f, f must lie in (0, 1]
//   - Block sets it to 0 and stops the chain
//   - a gate error or panic is a Block with reason `internal_error`

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use super::{GateContext, GateKind, GateOutcome, GateVerdict, Verdict};
use crate::lifecycle::Signal;
use crate::runtime_config::GateParams;

/// Per-gate evaluation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub gate: String,
    pub invoked: u64,
    pub allowed: u64,
    pub reduced: u64,
    pub blocked: u64,
    pub errors: u64,
}

/// Outcome of running the whole chain on one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainResult {
    pub verdicts: Vec<GateVerdict>,
    /// Final multiplier, 0 when blocked.
    pub size_multiplier: f64,
    pub blocked_by: Option<GateKind>,
    /// Reason code of the blocking gate.
    pub block_reason: Option<String>,
}

impl ChainResult {
    pub fn approved(&self) -> bool {
        self.blocked_by.is_none()
    }
}

pub struct GateChain {
    gates: Vec<GateKind>,
    stats: Mutex<HashMap<GateKind, GateStats>>,
}

impl GateChain {
    pub fn new(enabled: &[GateKind]) -> Self {
        let mut gates: Vec<GateKind> = Vec::with_capacity(enabled.len());
        for gate in enabled {
            if !gates.contains(gate) {
                gates.push(*gate);
            }
        }
        gates.sort_by_key(|g| g.tier());

        let stats = gates
            .iter()
            .map(|g| {
                (
                    *g,
                    GateStats {
                        gate: g.name().to_string(),
                        ..GateStats::default()
                    },
                )
            })
            .collect();

        info!(
            gates = ?gates.iter().map(|g| g.name()).collect::<Vec<_>>(),
            "gate chain assembled"
        );

        Self {
            gates,
            stats: Mutex::new(stats),
        }
    }

    pub fn from_config(params: &GateParams) -> Self {
        Self::new(&params.enabled)
    }

    /// Gates in evaluation order.
    pub fn gates(&self) -> &[GateKind] {
        &self.gates
    }

    /// Run every gate in order until one blocks.
    pub fn evaluate(&self, signal: &Signal, ctx: &GateContext<'_>) -> ChainResult {
        let cap = ctx.config.gates.size_multiplier_cap;
        let mut multiplier = 1.0_f64.min(cap);
        let mut verdicts = Vec::with_capacity(self.gates.len());

        for &gate in &self.gates {
            let outcome = match catch_unwind(AssertUnwindSafe(|| gate.evaluate(signal, multiplier, ctx))) {
                Ok(Ok(outcome)) => sanitize(gate, outcome),
                Ok(Err(e)) => {
                    error!(gate = %gate, signal_id = %signal.id, error = %e, "gate evaluation failed");
                    self.record_error(gate);
                    GateOutcome::block("internal_error")
                }
                Err(_) => {
                    error!(gate = %gate, signal_id = %signal.id, "gate panicked");
                    self.record_error(gate);
                    GateOutcome::block("internal_error")
                }
            };

            let (verdict, reason_code) = match outcome {
                GateOutcome::Allow => {
                    self.bump(gate, |s| s.allowed += 1);
                    (Verdict::Allow, "ok".to_string())
                }
                GateOutcome::Reduce { factor, reason } => {
                    multiplier = (multiplier * factor).clamp(0.0, cap);
                    self.bump(gate, |s| s.reduced += 1);
                    (Verdict::Reduce, reason)
                }
                GateOutcome::Block { reason } => {
                    multiplier = 0.0;
                    self.bump(gate, |s| s.blocked += 1);
                    (Verdict::Block, reason)
                }
            };

            verdicts.push(GateVerdict {
                signal_id: signal.id.clone(),
                gate_name: gate.name().to_string(),
                verdict,
                size_multiplier: multiplier,
                reason_code: reason_code.clone(),
                evaluated_at: ctx.now,
            });

            if verdict == Verdict::Block {
                return ChainResult {
                    verdicts,
                    size_multiplier: 0.0,
                    blocked_by: Some(gate),
                    block_reason: Some(reason_code),
                };
            }
        }

        ChainResult {
            verdicts,
            size_multiplier: multiplier,
            blocked_by: None,
            block_reason: None,
        }
    }

    /// Counters for every gate, in evaluation order.
    pub fn stats(&self) -> Vec<GateStats> {
        let stats = self.stats.lock();
        self.gates
            .iter()
            .filter_map(|g| stats.get(g).cloned())
            .collect()
    }

    /// Errors are counted on top of the block they turn into.
    fn record_error(&self, gate: GateKind) {
        if let Some(entry) = self.stats.lock().get_mut(&gate) {
            entry.errors += 1;
        }
    }

    fn bump(&self, gate: GateKind, f: impl FnOnce(&mut GateStats)) {
        let mut stats = self.stats.lock();
        if let Some(entry) = stats.get_mut(&gate) {
            entry.invoked += 1;
            f(entry);
        }
    }
}

/// A reduction outside (0, 1] is a gate bug, not a decision.
fn sanitize(gate: GateKind, outcome: GateOutcome) -> GateOutcome {
    match outcome {
        GateOutcome::Reduce { factor, .. } if !(factor > 0.0 && factor <= 1.0) => {
            error!(gate = %gate, factor, "gate returned out-of-range reduction");
            GateOutcome::block("internal_error")
        }
        other => other,
    }
}
