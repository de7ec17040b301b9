// =============================================================================
// Error types for the durable state layer
// =============================================================================
//
// Callers branch on these, so they are typed rather than `anyhow`. Glue code
// (config loading, background tasks, main) stays on `anyhow::Result`.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::SignalState;
use crate::position_store::PositionKey;

/// Failures of the append-only ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("ledger i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("ledger corrupted at line {line}: {detail}")]
    Corrupt { line: usize, detail: String },

    #[error("ledger writer disabled: a failed append could not be rolled back")]
    Poisoned,
}

/// Failures of the position store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock for {key} not acquired within {timeout:?}")]
    LockTimeout { key: String, timeout: Duration },

    #[error("position {0} is already open")]
    AlreadyOpen(PositionKey),

    #[error("no open position for {0}")]
    NotFound(PositionKey),

    #[error("invalid position for {key}: {detail}")]
    InvalidPosition { key: PositionKey, detail: String },

    #[error("store is read-only: {0}")]
    ReadOnly(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl StoreError {
    /// Transient failures surface as a blocked signal, never a crash.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::Ledger(LedgerError::LockTimeout(_))
        )
    }

    /// Short machine-readable code recorded as a reason on blocked signals.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::LockTimeout { .. } | Self::Ledger(LedgerError::LockTimeout(_)) => "lock_timeout",
            Self::AlreadyOpen(_) => "position_already_open",
            Self::NotFound(_) => "position_not_found",
            Self::InvalidPosition { .. } => "invalid_position",
            Self::ReadOnly(_) => "store_degraded",
            Self::Ledger(_) => "ledger_io_error",
        }
    }
}

/// Failures of the signal lifecycle state machine.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid transition {from} -> {to} for signal {signal_id}")]
    InvalidTransition {
        signal_id: String,
        from: SignalState,
        to: SignalState,
    },

    #[error("unknown signal {0}")]
    UnknownSignal(String),

    #[error("signal index lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl LifecycleError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnknownSignal(_) => "unknown_signal",
            Self::LockTimeout(_) | Self::Ledger(LedgerError::LockTimeout(_)) => "lock_timeout",
            Self::Ledger(_) => "ledger_io_error",
        }
    }
}
