// =============================================================================
// Execution Adapter — boundary to the order-routing collaborator
// =============================================================================
//
// The core hands an approved, sized request to an `ExecutionAdapter` and waits
// (with a bounded timeout, enforced by the engine) for an `ExecutionReport`.
// Real exchange connectivity lives outside this crate; `PaperAdapter`
// simulates fills locally, like the demo mode of a live trading bot.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::types::Direction;

// ---------------------------------------------------------------------------
// Request / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub symbol: String,
    pub direction: Direction,
    /// Base size times the gate chain's multiplier.
    pub target_size: f64,
    pub signal_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub fill_price: f64,
    pub filled_size: f64,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl ExecutionReport {
    pub fn filled(fill_price: f64, filled_size: f64) -> Self {
        Self {
            success: true,
            fill_price,
            filled_size,
            error_code: None,
        }
    }

    pub fn rejected(error_code: impl Into<String>) -> Self {
        Self {
            success: false,
            fill_price: 0.0,
            filled_size: 0.0,
            error_code: Some(error_code.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Order-routing collaborator. Implementations must be cancel-safe: the
/// engine drops the future when its timeout elapses.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionReport>;
}

// ---------------------------------------------------------------------------
// Paper adapter
// ---------------------------------------------------------------------------

/// Simulated fills at the last marked price plus a fixed slippage.
pub struct PaperAdapter {
    marks: RwLock<HashMap<String, f64>>,
    slippage_bps: f64,
    latency: Duration,
}

impl PaperAdapter {
    pub fn new(slippage_bps: f64) -> Self {
        Self {
            marks: RwLock::new(HashMap::new()),
            slippage_bps,
            latency: Duration::ZERO,
        }
    }

    /// Simulated venue round-trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Record the latest reference price for `symbol`.
    pub fn mark_price(&self, symbol: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.marks.write().insert(symbol.to_string(), price);
        }
    }

    pub fn mark(&self, symbol: &str) -> Option<f64> {
        self.marks.read().get(symbol).copied()
    }
}

impl Default for PaperAdapter {
    fn default() -> Self {
        Self::new(2.0)
    }
}

#[async_trait]
impl ExecutionAdapter for PaperAdapter {
    fn name(&self) -> &str {
        "paper"
    }

    async fn execute(&self, request: ExecutionRequest) -> anyhow::Result<ExecutionReport> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let Some(mark) = self.mark(&request.symbol) else {
            return Ok(ExecutionReport::rejected("no_reference_price"));
        };
        if !(request.target_size > 0.0) {
            return Ok(ExecutionReport::rejected("invalid_size"));
        }

        // Pay the slippage in the direction of the trade.
        let fill_price = mark * (1.0 + request.direction.sign() * self.slippage_bps / 10_000.0);
        let sim_order_id = Uuid::new_v4().to_string();

        info!(
            symbol = %request.symbol,
            direction = %request.direction,
            size = request.target_size,
            fill_price,
            signal_id = %request.signal_id,
            sim_order_id = %sim_order_id,
            "paper fill"
        );

        Ok(ExecutionReport::filled(fill_price, request.target_size))
    }
}

impl std::fmt::Debug for PaperAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperAdapter")
            .field("marks", &self.marks.read().len())
            .field("slippage_bps", &self.slippage_bps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(symbol: &str, direction: Direction, size: f64) -> ExecutionRequest {
        ExecutionRequest {
            symbol: symbol.into(),
            direction,
            target_size: size,
            signal_id: "sig".into(),
        }
    }

    #[tokio::test]
    async fn paper_fill_applies_slippage_against_the_trade() {
        let paper = PaperAdapter::new(10.0);
        paper.mark_price("BTCUSDT", 100.0);

        let long = paper.execute(request("BTCUSDT", Direction::Long, 0.5)).await.unwrap();
        assert!(long.success);
        assert!((long.fill_price - 100.1).abs() < 1e-9);
        assert_eq!(long.filled_size, 0.5);

        let short = paper.execute(request("BTCUSDT", Direction::Short, 0.5)).await.unwrap();
        assert!((short.fill_price - 99.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unmarked_symbol_is_rejected() {
        let paper = PaperAdapter::default();
        let report = paper.execute(request("NOPE", Direction::Long, 1.0)).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.error_code.as_deref(), Some("no_reference_price"));
    }

    #[test]
    fn bad_marks_are_ignored() {
        let paper = PaperAdapter::default();
        paper.mark_price("X", -1.0);
        paper.mark_price("X", f64::NAN);
        assert_eq!(paper.mark("X"), None);
    }
}
