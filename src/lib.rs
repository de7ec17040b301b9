// =============================================================================
// Gatekeeper — signal gating and durable position state
// =============================================================================
//
// Fuses component scores into signals, runs them through a prioritised gate
// chain, hands approved signals to an execution adapter and keeps positions
// and signal lifecycles in a crash-safe, ledger-backed store.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
pub mod api;
pub mod app_state;
pub mod decision_envelope;
pub mod engine;
pub mod error;
pub mod execution;
pub mod gates;
pub mod health;
pub mod ledger;
pub mod lifecycle;
pub mod persist;
pub mod position_store;
pub mod reconcile;
pub mod recovery;
pub mod runtime_config;
pub mod scheduler;
pub mod signals;
pub mod snapshot;
pub mod types;

pub use app_state::AppState;
pub use engine::DecisionEngine;
pub use error::{LedgerError, LifecycleError, StoreError};
pub use execution::{ExecutionAdapter, ExecutionReport, ExecutionRequest, PaperAdapter};
pub use runtime_config::{ConfigStore, RuntimeConfig};
pub use types::{Direction, EngineMode, SignalInput};
