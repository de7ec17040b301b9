// =============================================================================
// Signal Aggregator — Weighted component fusion
// =============================================================================
//
// fused = Σ clamp(weight, floor, ceiling) · clamp(score, -1, 1)
//
// The aggregator is pure: the same (scores, weights, params) always produce the
// same result, so it can be replayed for backtesting. Components named in the
// weight map but missing from the input contribute 0. Components present in
// the input but unknown to the weight map are weighted at the floor.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::{Signal, SignalState};
use crate::runtime_config::{AggregatorParams, RuntimeConfig};
use crate::types::{Direction, SignalInput};

/// The contribution of a single component to the fused score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub name: String,
    /// Weight after floor / ceiling shaping.
    pub weight: f64,
    /// Score after clamping to [-1, 1]; 0 when the component was missing.
    pub score: f64,
    pub contribution: f64,
}

/// Result of fusing one batch of component scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedScore {
    pub score: f64,
    pub direction: Direction,
    /// |score| clamped to [0, 1].
    pub confidence: f64,
    pub contributions: Vec<SignalContribution>,
}

pub struct SignalAggregator;

impl SignalAggregator {
    /// Fuse `scores` under `weights`.
    pub fn fuse(
        scores: &HashMap<String, f64>,
        weights: &HashMap<String, f64>,
        params: &AggregatorParams,
    ) -> FusedScore {
        // Sorted so that the summation order (and therefore the float result)
        // does not depend on hash iteration order.
        let names: BTreeSet<&str> = weights
            .keys()
            .chain(scores.keys())
            .map(String::as_str)
            .collect();

        let mut contributions = Vec::with_capacity(names.len());
        let mut total = 0.0;

        for name in names {
            let weight = shape_weight(weights.get(name).copied(), params);
            let score = scores
                .get(name)
                .copied()
                .filter(|s| s.is_finite())
                .map(|s| s.clamp(-1.0, 1.0))
                .unwrap_or(0.0);
            let contribution = weight * score;
            total += contribution;
            contributions.push(SignalContribution {
                name: name.to_string(),
                weight,
                score,
                contribution,
            });
        }

        let direction = if total > params.neutral_band {
            Direction::Long
        } else if total < -params.neutral_band {
            Direction::Short
        } else {
            Direction::Neutral
        };

        FusedScore {
            score: total,
            direction,
            confidence: total.abs().min(1.0),
            contributions,
        }
    }

    /// Fuse an upstream input under the live config and wrap it as a freshly
    /// generated signal.
    pub fn build_signal(input: &SignalInput, config: &RuntimeConfig) -> Signal {
        let fused = Self::fuse(&input.scores, &config.weights, &config.aggregator);
        Self::signal_from(input, fused, Utc::now())
    }

    fn signal_from(input: &SignalInput, fused: FusedScore, created_at: DateTime<Utc>) -> Signal {
        Signal {
            id: Uuid::new_v4().to_string(),
            symbol: input.symbol.clone(),
            direction: fused.direction,
            component_scores: sanitized_scores(&input.scores),
            fused_score: fused.score,
            confidence: fused.confidence,
            created_at,
            observed_at: input.timestamp,
            state: SignalState::Generated,
            reason: None,
            history: vec![(SignalState::Generated, created_at)],
        }
    }
}

/// Scores as they are journaled: non-finite readings dropped, the rest
/// clamped to [-1, 1]. JSON has no NaN, so a raw NaN would make the ledger
/// record unreadable.
fn sanitized_scores(scores: &HashMap<String, f64>) -> HashMap<String, f64> {
    scores
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| (k.clone(), v.clamp(-1.0, 1.0)))
        .collect()
}

fn shape_weight(weight: Option<f64>, params: &AggregatorParams) -> f64 {
    weight
        .filter(|w| w.is_finite())
        .unwrap_or(params.weight_floor)
        .clamp(params.weight_floor, params.weight_ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn two_component_scenario_fuses_to_point_four() {
        let scores = map(&[("a", 0.8), ("b", -0.2)]);
        let weights = map(&[("a", 0.6), ("b", 0.4)]);
        let fused = SignalAggregator::fuse(&scores, &weights, &AggregatorParams::default());
        assert!((fused.score - 0.40).abs() < 1e-12);
        assert_eq!(fused.direction, Direction::Long);
        assert!((fused.confidence - 0.40).abs() < 1e-12);
    }

    #[test]
    fn missing_component_is_neutral() {
        let scores = map(&[("a", 0.5)]);
        let weights = map(&[("a", 0.5), ("b", 0.5)]);
        let fused = SignalAggregator::fuse(&scores, &weights, &AggregatorParams::default());
        assert!((fused.score - 0.25).abs() < 1e-12);
        let b = fused.contributions.iter().find(|c| c.name == "b").unwrap();
        assert_eq!(b.score, 0.0);
        assert_eq!(b.contribution, 0.0);
    }

    #[test]
    fn zero_weight_is_lifted_to_floor() {
        let scores = map(&[("a", 1.0)]);
        let weights = map(&[("a", 0.0)]);
        let params = AggregatorParams::default();
        let fused = SignalAggregator::fuse(&scores, &weights, &params);
        assert!((fused.score - params.weight_floor).abs() < 1e-12);
    }

    #[test]
    fn heavy_weight_is_capped_at_ceiling() {
        let scores = map(&[("a", -1.0)]);
        let weights = map(&[("a", 5.0)]);
        let params = AggregatorParams::default();
        let fused = SignalAggregator::fuse(&scores, &weights, &params);
        assert!((fused.score + params.weight_ceiling).abs() < 1e-12);
        assert_eq!(fused.direction, Direction::Short);
    }

    #[test]
    fn unknown_component_gets_floor_weight() {
        let scores = map(&[("mystery", 1.0)]);
        let fused = SignalAggregator::fuse(&scores, &HashMap::new(), &AggregatorParams::default());
        assert_eq!(fused.contributions.len(), 1);
        assert_eq!(fused.contributions[0].weight, AggregatorParams::default().weight_floor);
    }

    #[test]
    fn out_of_range_and_nan_scores_are_sanitised() {
        let scores = map(&[("a", 7.0), ("b", f64::NAN)]);
        let weights = map(&[("a", 0.5), ("b", 0.5)]);
        let fused = SignalAggregator::fuse(&scores, &weights, &AggregatorParams::default());
        assert!((fused.score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn small_scores_are_neutral() {
        let scores = map(&[("a", 0.05)]);
        let weights = map(&[("a", 0.5)]);
        let fused = SignalAggregator::fuse(&scores, &weights, &AggregatorParams::default());
        assert_eq!(fused.direction, Direction::Neutral);
    }

    #[test]
    fn fusion_is_deterministic() {
        let scores = map(&[("a", 0.31), ("b", -0.77), ("c", 0.12), ("d", 0.9)]);
        let weights = map(&[("a", 0.1), ("b", 0.3), ("c", 0.25), ("d", 0.35)]);
        let params = AggregatorParams::default();
        let first = SignalAggregator::fuse(&scores, &weights, &params);
        for _ in 0..20 {
            assert_eq!(SignalAggregator::fuse(&scores, &weights, &params), first);
        }
    }

    #[test]
    fn build_signal_starts_generated() {
        let input = SignalInput {
            symbol: "X".into(),
            timestamp: Utc::now(),
            scores: map(&[("momentum", 0.9)]),
            price: None,
        };
        let signal = SignalAggregator::build_signal(&input, &RuntimeConfig::default());
        assert_eq!(signal.state, SignalState::Generated);
        assert_eq!(signal.history.len(), 1);
        assert_eq!(signal.symbol, "X");
    }

    #[test]
    fn journaled_scores_drop_non_finite_readings() {
        let input = SignalInput {
            symbol: "X".into(),
            timestamp: Utc::now(),
            scores: map(&[("momentum", 0.9), ("whale_flow", f64::NAN), ("depth", 4.0)]),
            price: None,
        };
        let signal = SignalAggregator::build_signal(&input, &RuntimeConfig::default());
        assert_eq!(signal.component_scores, map(&[("momentum", 0.9), ("depth", 1.0)]));

        let text = serde_json::to_string(&signal).unwrap();
        let back: Signal = serde_json::from_str(&text).unwrap();
        assert_eq!(back.component_scores, signal.component_scores);
    }
}
