// =============================================================================
// Shared types used across the Gatekeeper decision core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction of a signal or position.
///
/// `Neutral` only ever appears on signals whose fused score sits inside the
/// aggregator dead-band; positions are always `Long` or `Short`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// +1.0 for long, -1.0 for short, 0.0 for neutral.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
            Self::Neutral => 0.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
            Self::Neutral => Self::Neutral,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Whether the core may approve new trades.
///
/// `ReadOnly` is entered when the durable state could not be trusted at
/// startup, when the store layer escalates an I/O failure, or when an operator
/// halts the engine. Evaluation keeps running, but the symbol-state gate
/// blocks every signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Normal,
    ReadOnly,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::ReadOnly => write!(f, "ReadOnly"),
        }
    }
}

/// A batch of component scores for one (symbol, timestamp), as delivered by
/// the upstream signal-computation collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalInput {
    pub symbol: String,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub scores: std::collections::HashMap<String, f64>,
    /// Last traded price, when the producer has one. Used only to mark the
    /// paper execution adapter.
    #[serde(default)]
    pub price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Direction::Long).unwrap(), "\"long\"");
        let d: Direction = serde_json::from_str("\"short\"").unwrap();
        assert_eq!(d, Direction::Short);
    }

    #[test]
    fn opposite_and_sign() {
        assert_eq!(Direction::Long.opposite(), Direction::Short);
        assert_eq!(Direction::Neutral.opposite(), Direction::Neutral);
        assert_eq!(Direction::Short.sign(), -1.0);
    }

    #[test]
    fn signal_input_defaults_missing_fields() {
        let input: SignalInput = serde_json::from_str(r#"{ "symbol": "BTCUSDT" }"#).unwrap();
        assert!(input.scores.is_empty());
        assert_eq!(input.symbol, "BTCUSDT");
        assert_eq!(input.price, None);
    }
}
