// =============================================================================
// Health Monitor — engine mode and escalation channel
// =============================================================================
//
// The store layer never crashes the process on a data problem. It raises a
// `HealthEvent` here instead. Events are:
//   - logged at a level matching their severity
//   - kept in a bounded ring buffer for the operator API
//   - fanned out on a `tokio::sync::broadcast` channel for external monitoring
//
// The monitor also owns the engine mode. `ReadOnly` blocks every new approval
// until an operator resumes.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::types::EngineMode;

/// Maximum number of recent health events to retain.
const MAX_RECENT_EVENTS: usize = 200;
/// Capacity of the broadcast channel. Slow subscribers lag, never block.
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A store-layer escalation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthEvent {
    pub at: DateTime<Utc>,
    pub severity: Severity,
    /// Subsystem that raised it, e.g. "recovery", "ledger", "execution".
    pub component: String,
    /// Machine-readable code, e.g. "snapshot_invalid".
    pub code: String,
    pub message: String,
}

impl HealthEvent {
    pub fn new(
        severity: Severity,
        component: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            at: Utc::now(),
            severity,
            component: component.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Current mode plus the reason it was entered.
#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub mode: EngineMode,
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
}

pub struct HealthMonitor {
    mode: RwLock<ModeStatus>,
    recent: RwLock<VecDeque<HealthEvent>>,
    tx: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            mode: RwLock::new(ModeStatus {
                mode: EngineMode::Normal,
                reason: None,
                since: Utc::now(),
            }),
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
            tx,
        }
    }

    /// Record and publish an event.
    pub fn raise(&self, event: HealthEvent) {
        match event.severity {
            Severity::Info => {
                info!(component = %event.component, code = %event.code, "{}", event.message)
            }
            Severity::Warning => {
                warn!(component = %event.component, code = %event.code, "{}", event.message)
            }
            Severity::Error | Severity::Critical => error!(
                severity = ?event.severity,
                component = %event.component,
                code = %event.code,
                "{}",
                event.message
            ),
        }

        {
            let mut recent = self.recent.write();
            recent.push_back(event.clone());
            while recent.len() > MAX_RECENT_EVENTS {
                recent.pop_front();
            }
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.tx.subscribe()
    }

    /// The `n` most recent events, newest first.
    pub fn recent(&self, n: usize) -> Vec<HealthEvent> {
        self.recent.read().iter().rev().take(n).cloned().collect()
    }

    pub fn mode(&self) -> EngineMode {
        self.mode.read().mode
    }

    pub fn mode_status(&self) -> ModeStatus {
        self.mode.read().clone()
    }

    /// Stop approving trades. Idempotent; the first reason is kept.
    pub fn enter_read_only(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut mode = self.mode.write();
        if mode.mode == EngineMode::ReadOnly {
            return;
        }
        *mode = ModeStatus {
            mode: EngineMode::ReadOnly,
            reason: Some(reason.clone()),
            since: Utc::now(),
        };
        drop(mode);
        self.raise(HealthEvent::new(
            Severity::Critical,
            "engine",
            "read_only",
            format!("engine entered read-only mode: {reason}"),
        ));
    }

    /// Leave read-only mode. Returns `false` if the engine was already normal.
    pub fn resume(&self) -> bool {
        let mut mode = self.mode.write();
        if mode.mode == EngineMode::Normal {
            return false;
        }
        *mode = ModeStatus {
            mode: EngineMode::Normal,
            reason: None,
            since: Utc::now(),
        };
        drop(mode);
        self.raise(HealthEvent::new(Severity::Warning, "engine", "resumed", "engine resumed normal mode"));
        true
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
