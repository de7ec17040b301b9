// =============================================================================
// Gate Evaluators — one rule per `GateKind`
// =============================================================================
//
// Every threshold comes from `ctx.config`, the snapshot taken at evaluation
// time, so a recalibration by the learning process applies to the very next
// signal. An `Err` from any evaluator is converted by the chain into a hard
// block with reason `internal_error`.
//
// Gates:
//   symbol_state          — engine writable, symbol enabled, key not already open
//   correlation_exposure  — global position cap, per-sector cap (soft near cap)
//   intelligence_conflict — intelligence components must not oppose direction
//   conviction_threshold  — |fused| above per-symbol threshold
//   fee_edge              — expected edge must clear round-trip fees
//   minimum_hold          — no premature flips, re-entry cooldown
// =============================================================================

use anyhow::{bail, Result};
use tracing::debug;

use super::{GateContext, GateKind, GateOutcome};
use crate::lifecycle::Signal;
use crate::position_store::PositionState;
use crate::types::{Direction, EngineMode};

impl GateKind {
    /// Evaluate this gate for `signal` given the running multiplier.
    pub fn evaluate(self, signal: &Signal, running: f64, ctx: &GateContext<'_>) -> Result<GateOutcome> {
        if !signal.fused_score.is_finite() {
            bail!("signal {} has non-finite fused score", signal.id);
        }
        let outcome = match self {
            Self::SymbolState => symbol_state(signal, ctx),
            Self::CorrelationExposure => correlation_exposure(signal, ctx),
            Self::IntelligenceConflict => intelligence_conflict(signal, ctx)?,
            Self::ConvictionThreshold => conviction_threshold(signal, ctx),
            Self::FeeEdge => fee_edge(signal, ctx)?,
            Self::MinimumHold => minimum_hold(signal, ctx),
        };
        debug!(gate = %self, signal_id = %signal.id, running, ?outcome, "gate evaluated");
        Ok(outcome)
    }
}

// ── Safety ───────────────────────────────────────────────────────────────────

fn symbol_state(signal: &Signal, ctx: &GateContext<'_>) -> GateOutcome {
    if ctx.engine_mode == EngineMode::ReadOnly {
        return GateOutcome::block("store_degraded");
    }
    if !ctx.config.symbol_enabled(&signal.symbol) {
        return GateOutcome::block("symbol_disabled");
    }
    let already = ctx
        .open_positions
        .iter()
        .any(|p| p.key.symbol == signal.symbol && p.key.direction == signal.direction);
    if already {
        return GateOutcome::block("position_already_open");
    }
    GateOutcome::Allow
}

// ── Risk ─────────────────────────────────────────────────────────────────────

fn correlation_exposure(signal: &Signal, ctx: &GateContext<'_>) -> GateOutcome {
    let limits = &ctx.config.gates.exposure;

    if ctx.open_positions.len() >= limits.max_open_positions {
        return GateOutcome::block("max_positions");
    }

    let sector = ctx.config.sector_for(&signal.symbol);
    let same_sector = ctx
        .open_positions
        .iter()
        .filter(|p| ctx.config.sector_for(&p.key.symbol) == sector)
        .count();

    if same_sector >= limits.max_sector_positions {
        return GateOutcome::block("sector_cap");
    }
    if same_sector + 1 == limits.max_sector_positions {
        return GateOutcome::reduce(limits.near_cap_multiplier, "sector_near_cap");
    }
    GateOutcome::Allow
}

fn intelligence_conflict(signal: &Signal, ctx: &GateContext<'_>) -> Result<GateOutcome> {
    let params = &ctx.config.gates.intelligence;
    if params.reduce_magnitude > params.block_magnitude {
        bail!(
            "intelligence reduce_magnitude {} exceeds block_magnitude {}",
            params.reduce_magnitude,
            params.block_magnitude
        );
    }

    let readings: Vec<f64> = params
        .components
        .iter()
        .filter_map(|name| signal.component_scores.get(name))
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(-1.0, 1.0))
        .collect();
    if readings.is_empty() || signal.direction == Direction::Neutral {
        return Ok(GateOutcome::Allow);
    }

    let intel = readings.iter().sum::<f64>() / readings.len() as f64;
    // Positive when intelligence agrees with the trade direction.
    let alignment = intel * signal.direction.sign();
    if alignment >= 0.0 {
        return Ok(GateOutcome::Allow);
    }

    let opposition = -alignment;
    if opposition >= params.block_magnitude {
        Ok(GateOutcome::block("intelligence_conflict"))
    } else if opposition >= params.reduce_magnitude {
        Ok(GateOutcome::reduce(params.reduce_multiplier, "intelligence_disagrees"))
    } else {
        Ok(GateOutcome::Allow)
    }
}

// ── Profitability ────────────────────────────────────────────────────────────

fn conviction_threshold(signal: &Signal, ctx: &GateContext<'_>) -> GateOutcome {
    if signal.direction == Direction::Neutral {
        return GateOutcome::block("no_direction");
    }
    let threshold = ctx.config.conviction_threshold_for(&signal.symbol);
    if signal.fused_score.abs() < threshold {
        return GateOutcome::block("conviction_below_threshold");
    }
    GateOutcome::Allow
}

fn fee_edge(signal: &Signal, ctx: &GateContext<'_>) -> Result<GateOutcome> {
    let p = &ctx.config.gates.fee_edge;
    if p.round_trip_fee_bps < 0.0 || p.edge_bps_per_unit_score <= 0.0 {
        bail!(
            "fee_edge misconfigured: fee {} bps, edge/score {} bps",
            p.round_trip_fee_bps,
            p.edge_bps_per_unit_score
        );
    }

    let edge_bps = signal.fused_score.abs() * p.edge_bps_per_unit_score;
    if edge_bps < p.round_trip_fee_bps * p.min_edge_ratio {
        return Ok(GateOutcome::block("edge_below_fees"));
    }
    if edge_bps < p.round_trip_fee_bps * p.comfortable_edge_ratio {
        return Ok(GateOutcome::reduce(p.low_edge_multiplier, "low_edge"));
    }
    Ok(GateOutcome::Allow)
}

// ── Timing ───────────────────────────────────────────────────────────────────

fn minimum_hold(signal: &Signal, ctx: &GateContext<'_>) -> GateOutcome {
    let timing = &ctx.config.gates.timing;
    let opposite = signal.direction.opposite();

    let flip_too_early = ctx.open_positions.iter().any(|p| {
        p.key.symbol == signal.symbol
            && p.key.direction == opposite
            && p.state == PositionState::Open
            && age_secs(ctx, p.opened_at) < timing.min_hold_secs as i64
    });
    if flip_too_early {
        return GateOutcome::block("min_hold_not_elapsed");
    }

    let in_cooldown = ctx.recently_closed.iter().any(|p| {
        p.key.symbol == signal.symbol
            && p.key.direction == signal.direction
            && p.closed_at
                .map(|at| age_secs(ctx, at) < timing.reentry_cooldown_secs as i64)
                .unwrap_or(false)
    });
    if in_cooldown {
        return GateOutcome::block("reentry_cooldown");
    }
    GateOutcome::Allow
}

fn age_secs(ctx: &GateContext<'_>, at: chrono::DateTime<chrono::Utc>) -> i64 {
    (ctx.now - at).num_seconds()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::SignalState;
    use crate::position_store::Position;
    use crate::runtime_config::{RuntimeConfig, SymbolOverride};
    use chrono::{Duration, Utc};

    fn signal(symbol: &str, direction: Direction, fused: f64, scores: &[(&str, f64)]) -> Signal {
        let now = Utc::now();
        Signal {
            id: "sig".into(),
            symbol: symbol.into(),
            direction,
            component_scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            fused_score: fused,
            confidence: fused.abs().min(1.0),
            created_at: now,
            observed_at: now,
            state: SignalState::Evaluating,
            reason: None,
            history: Vec::new(),
        }
    }

    fn ctx<'a>(config: &'a RuntimeConfig, open: &'a [Position], closed: &'a [Position]) -> GateContext<'a> {
        GateContext {
            config,
            open_positions: open,
            recently_closed: closed,
            engine_mode: EngineMode::Normal,
            now: Utc::now(),
        }
    }

    fn with_sector(config: &mut RuntimeConfig, symbol: &str, sector: &str) {
        config.symbols.insert(
            symbol.into(),
            SymbolOverride {
                sector: Some(sector.into()),
                ..SymbolOverride::default()
            },
        );
    }

    #[test]
    fn symbol_state_blocks_read_only_disabled_and_duplicates() {
        let mut config = RuntimeConfig::default();
        let sig = signal("X", Direction::Long, 0.5, &[]);

        let mut c = ctx(&config, &[], &[]);
        c.engine_mode = EngineMode::ReadOnly;
        assert_eq!(GateKind::SymbolState.evaluate(&sig, 1.0, &c).unwrap(), GateOutcome::block("store_degraded"));

        let open = vec![Position::new_open("X", Direction::Long, 10.0, 1.0, None)];
        let c = ctx(&config, &open, &[]);
        assert_eq!(
            GateKind::SymbolState.evaluate(&sig, 1.0, &c).unwrap(),
            GateOutcome::block("position_already_open")
        );

        config.symbols.insert(
            "X".into(),
            SymbolOverride {
                enabled: false,
                ..SymbolOverride::default()
            },
        );
        let c = ctx(&config, &[], &[]);
        assert_eq!(GateKind::SymbolState.evaluate(&sig, 1.0, &c).unwrap(), GateOutcome::block("symbol_disabled"));
    }

    #[test]
    fn sector_cap_blocks_and_near_cap_reduces() {
        let mut config = RuntimeConfig::default();
        for s in ["X", "A", "B", "C"] {
            with_sector(&mut config, s, "L1");
        }
        let sig = signal("X", Direction::Long, 0.5, &[]);

        let one = vec![Position::new_open("A", Direction::Long, 10.0, 1.0, None)];
        let c = ctx(&config, &one, &[]);
        assert_eq!(
            GateKind::CorrelationExposure.evaluate(&sig, 1.0, &c).unwrap(),
            GateOutcome::reduce(0.75, "sector_near_cap")
        );

        let three = vec![
            Position::new_open("A", Direction::Long, 10.0, 1.0, None),
            Position::new_open("B", Direction::Long, 10.0, 1.0, None),
            Position::new_open("C", Direction::Short, 10.0, 1.0, None),
        ];
        let c = ctx(&config, &three, &[]);
        assert_eq!(
            GateKind::CorrelationExposure.evaluate(&sig, 1.0, &c).unwrap(),
            GateOutcome::block("sector_cap")
        );
    }

    #[test]
    fn global_position_cap_blocks() {
        let mut config = RuntimeConfig::default();
        config.gates.exposure.max_open_positions = 1;
        let open = vec![Position::new_open("Z", Direction::Long, 10.0, 1.0, None)];
        let c = ctx(&config, &open, &[]);
        let sig = signal("X", Direction::Long, 0.5, &[]);
        assert_eq!(
            GateKind::CorrelationExposure.evaluate(&sig, 1.0, &c).unwrap(),
            GateOutcome::block("max_positions")
        );
    }

    #[test]
    fn intelligence_opposition_reduces_then_blocks() {
        let config = RuntimeConfig::default();
        let c = ctx(&config, &[], &[]);

        let mild = signal("X", Direction::Long, 0.5, &[("whale_flow", -0.4), ("funding_rate", -0.4)]);
        assert_eq!(
            GateKind::IntelligenceConflict.evaluate(&mild, 1.0, &c).unwrap(),
            GateOutcome::reduce(0.5, "intelligence_disagrees")
        );

        let strong = signal("X", Direction::Long, 0.5, &[("whale_flow", -0.9), ("funding_rate", -0.8)]);
        assert_eq!(
            GateKind::IntelligenceConflict.evaluate(&strong, 1.0, &c).unwrap(),
            GateOutcome::block("intelligence_conflict")
        );

        let agree = signal("X", Direction::Short, -0.5, &[("whale_flow", -0.9)]);
        assert_eq!(GateKind::IntelligenceConflict.evaluate(&agree, 1.0, &c).unwrap(), GateOutcome::Allow);

        let silent = signal("X", Direction::Long, 0.5, &[("momentum", 1.0)]);
        assert_eq!(GateKind::IntelligenceConflict.evaluate(&silent, 1.0, &c).unwrap(), GateOutcome::Allow);
    }

    #[test]
    fn conviction_uses_per_symbol_threshold() {
        let mut config = RuntimeConfig::default();
        let sig = signal("X", Direction::Long, 0.4, &[]);
        assert_eq!(
            GateKind::ConvictionThreshold.evaluate(&sig, 1.0, &ctx(&config, &[], &[])).unwrap(),
            GateOutcome::Allow
        );

        config.symbols.insert(
            "X".into(),
            SymbolOverride {
                conviction_threshold: Some(0.5),
                ..SymbolOverride::default()
            },
        );
        assert_eq!(
            GateKind::ConvictionThreshold.evaluate(&sig, 1.0, &ctx(&config, &[], &[])).unwrap(),
            GateOutcome::block("conviction_below_threshold")
        );

        let neutral = signal("X", Direction::Neutral, 0.01, &[]);
        assert_eq!(
            GateKind::ConvictionThreshold.evaluate(&neutral, 1.0, &ctx(&config, &[], &[])).unwrap(),
            GateOutcome::block("no_direction")
        );
    }

    #[test]
    fn fee_edge_bands() {
        let config = RuntimeConfig::default();
        let c = ctx(&config, &[], &[]);
        // 50 bps per unit score, 10 bps fees: block < 10, reduce < 30.
        let thin = signal("X", Direction::Long, 0.1, &[]);
        let low = signal("X", Direction::Long, 0.4, &[]);
        let rich = signal("X", Direction::Long, 0.8, &[]);
        assert_eq!(GateKind::FeeEdge.evaluate(&thin, 1.0, &c).unwrap(), GateOutcome::block("edge_below_fees"));
        assert_eq!(GateKind::FeeEdge.evaluate(&low, 1.0, &c).unwrap(), GateOutcome::reduce(0.5, "low_edge"));
        assert_eq!(GateKind::FeeEdge.evaluate(&rich, 1.0, &c).unwrap(), GateOutcome::Allow);
    }

    #[test]
    fn misconfigured_fee_gate_is_an_error() {
        let mut config = RuntimeConfig::default();
        config.gates.fee_edge.edge_bps_per_unit_score = 0.0;
        let sig = signal("X", Direction::Long, 0.4, &[]);
        assert!(GateKind::FeeEdge.evaluate(&sig, 1.0, &ctx(&config, &[], &[])).is_err());
    }

    #[test]
    fn non_finite_score_is_an_error_for_every_gate() {
        let config = RuntimeConfig::default();
        let sig = signal("X", Direction::Long, f64::NAN, &[]);
        for gate in GateKind::all() {
            assert!(gate.evaluate(&sig, 1.0, &ctx(&config, &[], &[])).is_err());
        }
    }

    #[test]
    fn minimum_hold_blocks_early_flip_and_reentry() {
        let config = RuntimeConfig::default();
        let sig = signal("X", Direction::Long, 0.5, &[]);

        let mut young_short = Position::new_open("X", Direction::Short, 10.0, 1.0, None);
        young_short.opened_at = Utc::now() - Duration::seconds(10);
        let open = vec![young_short.clone()];
        assert_eq!(
            GateKind::MinimumHold.evaluate(&sig, 1.0, &ctx(&config, &open, &[])).unwrap(),
            GateOutcome::block("min_hold_not_elapsed")
        );

        let mut old_short = young_short;
        old_short.opened_at = Utc::now() - Duration::seconds(3_600);
        let open = vec![old_short];
        assert_eq!(
            GateKind::MinimumHold.evaluate(&sig, 1.0, &ctx(&config, &open, &[])).unwrap(),
            GateOutcome::Allow
        );

        let mut closed = Position::new_open("X", Direction::Long, 10.0, 1.0, None);
        closed.state = PositionState::Closed;
        closed.closed_at = Some(Utc::now() - Duration::seconds(5));
        let closed = vec![closed];
        assert_eq!(
            GateKind::MinimumHold.evaluate(&sig, 1.0, &ctx(&config, &[], &closed)).unwrap(),
            GateOutcome::block("reentry_cooldown")
        );
    }

    #[test]
    fn thresholds_follow_the_config_passed_in() {
        let sig = signal("X", Direction::Long, 0.35, &[]);
        let mut config = RuntimeConfig::default();
        assert_eq!(
            GateKind::ConvictionThreshold.evaluate(&sig, 1.0, &ctx(&config, &[], &[])).unwrap(),
            GateOutcome::Allow
        );
        config.gates.conviction_threshold = 0.36;
        assert_eq!(
            GateKind::ConvictionThreshold.evaluate(&sig, 1.0, &ctx(&config, &[], &[])).unwrap(),
            GateOutcome::block("conviction_below_threshold")
        );
    }
}
