// =============================================================================
// Signals Module
// =============================================================================
//
// Signal fusion for the decision core:
// - Weighted component fusion with per-component floor / ceiling

pub mod aggregator;

pub use aggregator::{FusedScore, SignalAggregator};
