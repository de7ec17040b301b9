// =============================================================================
// Gates Module
// =============================================================================
//
// The gate chain is a fixed, statically dispatched set of evaluators. Each
// gate returns one of:
//   - Allow            (hard pass)
//   - Block(reason)    (hard stop, terminates the chain, multiplier -> 0)
//   - Reduce(factor)   (soft, multiplies the running size multiplier)
//
// Gates run in tier order so a safety block always pre-empts profitability
// reasoning:
//   Safety -> Risk -> Profitability -> Timing

pub mod chain;
pub mod evaluators;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::position_store::Position;
use crate::runtime_config::RuntimeConfig;
use crate::types::EngineMode;

pub use chain::{ChainResult, GateChain, GateStats};

/// Priority tier. Lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GateTier {
    Safety = 0,
    Risk = 1,
    Profitability = 2,
    Timing = 3,
}

/// Every evaluator the chain knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    SymbolState,
    CorrelationExposure,
    IntelligenceConflict,
    ConvictionThreshold,
    FeeEdge,
    MinimumHold,
}

impl GateKind {
    /// All gates in their canonical order.
    pub fn all() -> Vec<GateKind> {
        vec![
            Self::SymbolState,
            Self::CorrelationExposure,
            Self::IntelligenceConflict,
            Self::ConvictionThreshold,
            Self::FeeEdge,
            Self::MinimumHold,
        ]
    }

    pub fn tier(self) -> GateTier {
        match self {
            Self::SymbolState => GateTier::Safety,
            Self::CorrelationExposure | Self::IntelligenceConflict => GateTier::Risk,
            Self::ConvictionThreshold | Self::FeeEdge => GateTier::Profitability,
            Self::MinimumHold => GateTier::Timing,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SymbolState => "symbol_state",
            Self::CorrelationExposure => "correlation_exposure",
            Self::IntelligenceConflict => "intelligence_conflict",
            Self::ConvictionThreshold => "conviction_threshold",
            Self::FeeEdge => "fee_edge",
            Self::MinimumHold => "minimum_hold",
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Verdict class recorded per gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Block,
    Reduce,
}

/// What a single gate decided.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Allow,
    Block { reason: String },
    Reduce { factor: f64, reason: String },
}

impl GateOutcome {
    pub fn block(reason: impl Into<String>) -> Self {
        Self::Block {
            reason: reason.into(),
        }
    }

    pub fn reduce(factor: f64, reason: impl Into<String>) -> Self {
        Self::Reduce {
            factor,
            reason: reason.into(),
        }
    }
}

/// Auditable record of one gate's verdict on one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub signal_id: String,
    pub gate_name: String,
    pub verdict: Verdict,
    /// Running size multiplier after this gate.
    pub size_multiplier: f64,
    pub reason_code: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Read-only shared state handed to every gate.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    /// Live config snapshot taken for this evaluation.
    pub config: &'a RuntimeConfig,
    /// Positions in OPEN or CLOSING state.
    pub open_positions: &'a [Position],
    /// Recently closed positions, newest first.
    pub recently_closed: &'a [Position],
    pub engine_mode: EngineMode,
    pub now: DateTime<Utc>,
}
