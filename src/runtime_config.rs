// =============================================================================
// Runtime Configuration — Hot-reloadable weights and gate thresholds
// =============================================================================
//
// The document is owned by the external learning process; the core only reads
// it. `ConfigStore` hands out immutable `Arc` snapshots, and the reload task
// swaps in a new snapshot whenever the file changes on disk. Gates read the
// snapshot at evaluation time, so a recalibration applies to the next signal.
//
// All fields carry `#[serde(default)]` so that a partial document (or one
// written by an older learner) still loads.
//
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gates::GateKind;
use crate::persist;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_weights() -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    weights.insert("order_flow_imbalance".to_string(), 0.25);
    weights.insert("funding_rate".to_string(), 0.15);
    weights.insert("whale_flow".to_string(), 0.20);
    weights.insert("momentum".to_string(), 0.20);
    weights.insert("orderbook".to_string(), 0.10);
    weights.insert("volatility".to_string(), 0.10);
    weights
}

fn default_weight_floor() -> f64 {
    0.02
}

fn default_weight_ceiling() -> f64 {
    0.6
}

fn default_neutral_band() -> f64 {
    0.05
}

fn default_size_multiplier_cap() -> f64 {
    1.0
}

fn default_conviction_threshold() -> f64 {
    0.3
}

fn default_round_trip_fee_bps() -> f64 {
    10.0
}

fn default_edge_bps_per_unit_score() -> f64 {
    50.0
}

fn default_min_edge_ratio() -> f64 {
    1.0
}

fn default_comfortable_edge_ratio() -> f64 {
    3.0
}

fn default_low_edge_multiplier() -> f64 {
    0.5
}

fn default_intel_components() -> Vec<String> {
    vec!["whale_flow".to_string(), "funding_rate".to_string()]
}

fn default_intel_reduce_magnitude() -> f64 {
    0.3
}

fn default_intel_block_magnitude() -> f64 {
    0.7
}

fn default_intel_reduce_multiplier() -> f64 {
    0.5
}

fn default_max_open_positions() -> usize {
    10
}

fn default_max_sector_positions() -> usize {
    2
}

fn default_near_cap_multiplier() -> f64 {
    0.75
}

fn default_min_hold_secs() -> u64 {
    300
}

fn default_reentry_cooldown_secs() -> u64 {
    60
}

fn default_base_position_size() -> f64 {
    1.0
}

fn default_signal_ttl_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_lock_timeout_ms() -> u64 {
    250
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_backup_keep() -> usize {
    5
}

fn default_reconcile_interval_secs() -> u64 {
    120
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_adapter_timeout_ms() -> u64 {
    5_000
}

fn default_reload_interval_secs() -> u64 {
    10
}

// =============================================================================
// Sections
// =============================================================================

/// Weight shaping applied by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorParams {
    /// No component may be driven below this weight.
    #[serde(default = "default_weight_floor")]
    pub weight_floor: f64,

    /// No component may exceed this weight.
    #[serde(default = "default_weight_ceiling")]
    pub weight_ceiling: f64,

    /// |fused score| at or below this is labelled neutral.
    #[serde(default = "default_neutral_band")]
    pub neutral_band: f64,
}

impl Default for AggregatorParams {
    fn default() -> Self {
        Self {
            weight_floor: default_weight_floor(),
            weight_ceiling: default_weight_ceiling(),
            neutral_band: default_neutral_band(),
        }
    }
}

/// Fee / edge sufficiency thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEdgeParams {
    /// Entry + exit fees, in basis points.
    #[serde(default = "default_round_trip_fee_bps")]
    pub round_trip_fee_bps: f64,

    /// Expected edge in bps per unit of |fused score|.
    #[serde(default = "default_edge_bps_per_unit_score")]
    pub edge_bps_per_unit_score: f64,

    /// Block below `fees * min_edge_ratio`.
    #[serde(default = "default_min_edge_ratio")]
    pub min_edge_ratio: f64,

    /// Reduce below `fees * comfortable_edge_ratio`.
    #[serde(default = "default_comfortable_edge_ratio")]
    pub comfortable_edge_ratio: f64,

    #[serde(default = "default_low_edge_multiplier")]
    pub low_edge_multiplier: f64,
}

impl Default for FeeEdgeParams {
    fn default() -> Self {
        Self {
            round_trip_fee_bps: default_round_trip_fee_bps(),
            edge_bps_per_unit_score: default_edge_bps_per_unit_score(),
            min_edge_ratio: default_min_edge_ratio(),
            comfortable_edge_ratio: default_comfortable_edge_ratio(),
            low_edge_multiplier: default_low_edge_multiplier(),
        }
    }
}

/// Intelligence-conflict thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelligenceParams {
    /// Component names treated as independent market intelligence.
    #[serde(default = "default_intel_components")]
    pub components: Vec<String>,

    #[serde(default = "default_intel_reduce_magnitude")]
    pub reduce_magnitude: f64,

    #[serde(default = "default_intel_block_magnitude")]
    pub block_magnitude: f64,

    #[serde(default = "default_intel_reduce_multiplier")]
    pub reduce_multiplier: f64,
}

impl Default for IntelligenceParams {
    fn default() -> Self {
        Self {
            components: default_intel_components(),
            reduce_magnitude: default_intel_reduce_magnitude(),
            block_magnitude: default_intel_block_magnitude(),
            reduce_multiplier: default_intel_reduce_multiplier(),
        }
    }
}

/// Correlation / exposure throttle limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureParams {
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,

    /// Maximum open positions sharing one sector.
    #[serde(default = "default_max_sector_positions")]
    pub max_sector_positions: usize,

    /// Applied when the sector has exactly one free slot left.
    #[serde(default = "default_near_cap_multiplier")]
    pub near_cap_multiplier: f64,
}

impl Default for ExposureParams {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
            max_sector_positions: default_max_sector_positions(),
            near_cap_multiplier: default_near_cap_multiplier(),
        }
    }
}

/// Minimum-hold timing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingParams {
    /// An opposite-direction position must be at least this old before a flip.
    #[serde(default = "default_min_hold_secs")]
    pub min_hold_secs: u64,

    /// Quiet period after closing a key before it may be reopened.
    #[serde(default = "default_reentry_cooldown_secs")]
    pub reentry_cooldown_secs: u64,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            min_hold_secs: default_min_hold_secs(),
            reentry_cooldown_secs: default_reentry_cooldown_secs(),
        }
    }
}

/// Gate chain composition and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateParams {
    /// Gates to run. Order here only breaks ties inside a priority tier.
    #[serde(default = "GateKind::all")]
    pub enabled: Vec<GateKind>,

    /// Upper bound of the cumulative size multiplier.
    #[serde(default = "default_size_multiplier_cap")]
    pub size_multiplier_cap: f64,

    #[serde(default = "default_conviction_threshold")]
    pub conviction_threshold: f64,

    #[serde(default)]
    pub fee_edge: FeeEdgeParams,

    #[serde(default)]
    pub intelligence: IntelligenceParams,

    #[serde(default)]
    pub exposure: ExposureParams,

    #[serde(default)]
    pub timing: TimingParams,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            enabled: GateKind::all(),
            size_multiplier_cap: default_size_multiplier_cap(),
            conviction_threshold: default_conviction_threshold(),
            fee_edge: FeeEdgeParams::default(),
            intelligence: IntelligenceParams::default(),
            exposure: ExposureParams::default(),
            timing: TimingParams::default(),
        }
    }
}

/// Per-symbol overrides. Unset fields fall back to the global value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolOverride {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub sector: Option<String>,

    #[serde(default)]
    pub conviction_threshold: Option<f64>,

    #[serde(default)]
    pub base_size: Option<f64>,

    #[serde(default)]
    pub signal_ttl_secs: Option<u64>,
}

impl Default for SymbolOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            sector: None,
            conviction_threshold: None,
            base_size: None,
            signal_ttl_secs: None,
        }
    }
}

/// Signal lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleParams {
    #[serde(default = "default_signal_ttl_secs")]
    pub signal_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LifecycleParams {
    fn default() -> Self {
        Self {
            signal_ttl_secs: default_signal_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Durable store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreParams {
    /// Bound on every lock acquisition in the store and ledger.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Number of rotated snapshot backups to keep.
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// How long terminal signals and closed positions stay in memory. The
    /// ledger keeps them regardless.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for StoreParams {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            backup_keep: default_backup_keep(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

/// Execution adapter bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionParams {
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            adapter_timeout_ms: default_adapter_timeout_ms(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the decision core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Version stamp written by the learning process. Informational only.
    #[serde(default)]
    pub version: u64,

    /// Component name -> weight.
    #[serde(default = "default_weights")]
    pub weights: HashMap<String, f64>,

    #[serde(default)]
    pub aggregator: AggregatorParams,

    #[serde(default)]
    pub gates: GateParams,

    /// Position size before gate reductions, in instrument units.
    #[serde(default = "default_base_position_size")]
    pub base_position_size: f64,

    #[serde(default)]
    pub symbols: HashMap<String, SymbolOverride>,

    #[serde(default)]
    pub lifecycle: LifecycleParams,

    #[serde(default)]
    pub store: StoreParams,

    #[serde(default)]
    pub execution: ExecutionParams,

    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: 0,
            weights: default_weights(),
            aggregator: AggregatorParams::default(),
            gates: GateParams::default(),
            base_position_size: default_base_position_size(),
            symbols: HashMap::new(),
            lifecycle: LifecycleParams::default(),
            store: StoreParams::default(),
            execution: ExecutionParams::default(),
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("runtime config at {} rejected", path.display()))?;

        info!(
            path = %path.display(),
            version = config.version,
            components = config.weights.len(),
            gates = config.gates.enabled.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp + rename).
    ///
    /// The core never rewrites a live config; this is used to seed a template
    /// for the learning process when no file exists yet.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        persist::atomic_write(path, content.as_bytes())
            .with_context(|| format!("failed to write runtime config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Reject documents that would make the gate arithmetic meaningless.
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregator;
        if !(agg.weight_floor > 0.0) {
            bail!("aggregator.weight_floor must be > 0 (got {})", agg.weight_floor);
        }
        if !(agg.weight_ceiling >= agg.weight_floor) {
            bail!(
                "aggregator.weight_ceiling {} is below weight_floor {}",
                agg.weight_ceiling,
                agg.weight_floor
            );
        }
        if self.weights.values().any(|w| !w.is_finite()) {
            bail!("weights must be finite");
        }

        let gates = &self.gates;
        if !(gates.size_multiplier_cap > 0.0) {
            bail!("gates.size_multiplier_cap must be > 0");
        }
        for (name, factor) in [
            ("fee_edge.low_edge_multiplier", gates.fee_edge.low_edge_multiplier),
            ("intelligence.reduce_multiplier", gates.intelligence.reduce_multiplier),
            ("exposure.near_cap_multiplier", gates.exposure.near_cap_multiplier),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                bail!("gates.{name} must be in (0, 1] (got {factor})");
            }
        }
        if self.base_position_size <= 0.0 {
            bail!("base_position_size must be > 0");
        }
        if self.lifecycle.signal_ttl_secs == 0 {
            bail!("lifecycle.signal_ttl_secs must be > 0");
        }
        if self.store.lock_timeout_ms == 0 {
            bail!("store.lock_timeout_ms must be > 0");
        }
        if self.store.retention_secs < self.gates.timing.reentry_cooldown_secs {
            bail!(
                "store.retention_secs ({}) must cover gates.timing.reentry_cooldown_secs ({})",
                self.store.retention_secs,
                self.gates.timing.reentry_cooldown_secs
            );
        }
        if self.execution.adapter_timeout_ms == 0 {
            bail!("execution.adapter_timeout_ms must be > 0");
        }
        Ok(())
    }

    // --- Per-symbol resolution ----------------------------------------------

    pub fn symbol_enabled(&self, symbol: &str) -> bool {
        self.symbols.get(symbol).map(|o| o.enabled).unwrap_or(true)
    }

    /// Sector of `symbol`; an unmapped symbol is its own sector.
    pub fn sector_for<'a>(&'a self, symbol: &'a str) -> &'a str {
        self.symbols
            .get(symbol)
            .and_then(|o| o.sector.as_deref())
            .unwrap_or(symbol)
    }

    pub fn conviction_threshold_for(&self, symbol: &str) -> f64 {
        self.symbols
            .get(symbol)
            .and_then(|o| o.conviction_threshold)
            .unwrap_or(self.gates.conviction_threshold)
    }

    pub fn base_size_for(&self, symbol: &str) -> f64 {
        self.symbols
            .get(symbol)
            .and_then(|o| o.base_size)
            .unwrap_or(self.base_position_size)
    }

    pub fn signal_ttl_for(&self, symbol: &str) -> Duration {
        let secs = self
            .symbols
            .get(symbol)
            .and_then(|o| o.signal_ttl_secs)
            .unwrap_or(self.lifecycle.signal_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.store.lock_timeout_ms)
    }

    /// Terminal records older than this are dropped from the indices.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.store.retention_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.adapter_timeout_ms)
    }
}

// =============================================================================
// ConfigStore
// =============================================================================

/// Shared, hot-reloadable handle on the current configuration.
pub struct ConfigStore {
    current: RwLock<Arc<RuntimeConfig>>,
    path: Option<PathBuf>,
    last_modified: Mutex<Option<SystemTime>>,
    reloads: AtomicU64,
}

impl ConfigStore {
    /// A store that never reloads (tests, embedded use).
    pub fn fixed(config: RuntimeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            path: None,
            last_modified: Mutex::new(None),
            reloads: AtomicU64::new(0),
        }
    }

    /// Load from `path` and watch it for changes.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = RuntimeConfig::load(&path)?;
        let modified = modified_at(&path);
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            path: Some(path),
            last_modified: Mutex::new(modified),
            reloads: AtomicU64::new(0),
        })
    }

    /// The snapshot in effect right now. Never cache it across signals.
    pub fn current(&self) -> Arc<RuntimeConfig> {
        self.current.read().clone()
    }

    /// Number of successful swaps since startup.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Validate and install `config` as the new snapshot.
    pub fn replace(&self, config: RuntimeConfig) -> Result<()> {
        config.validate()?;
        let version = config.version;
        *self.current.write() = Arc::new(config);
        self.reloads.fetch_add(1, Ordering::SeqCst);
        info!(version, "runtime config swapped");
        Ok(())
    }

    /// Re-read the backing file if its modification time moved.
    ///
    /// Returns `Ok(true)` when a new snapshot was installed. A document that
    /// fails to parse or validate is rejected and the previous snapshot stays
    /// in effect.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };

        let modified = modified_at(path);
        {
            let last = self.last_modified.lock();
            if modified.is_some() && *last == modified {
                return Ok(false);
            }
        }

        match RuntimeConfig::load(path) {
            Ok(config) => {
                self.replace(config)?;
                *self.last_modified.lock() = modified;
                Ok(true)
            }
            Err(e) => {
                // Remember the mtime so a broken file is not re-parsed every tick.
                *self.last_modified.lock() = modified;
                warn!(error = %e, "config reload rejected — keeping previous version");
                Err(e)
            }
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
