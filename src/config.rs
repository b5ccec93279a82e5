//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

// Re-export component configs that live next to their components
pub use crate::rug::RugDetectorConfig;
pub use crate::scoring::{DecisionThresholds, FactorWeights, ScoringConfig};

/// Hard ceiling on a single position, regardless of configuration
pub const MAX_SINGLE_POSITION_FRACTION: f64 = 0.05;

const MIN_HOLD_SECS: u64 = 8 * 3600;
const MAX_HOLD_SECS: u64 = 12 * 3600;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capital: CapitalConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub rug: RugDetectorConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub feed: FeedConfig,
}

/// Capital, sizing and exposure limits
#[derive(Debug, Clone, Deserialize)]
pub struct CapitalConfig {
    /// Notional capital used to express P&L in USD
    #[serde(default = "default_total_capital_usd")]
    pub total_capital_usd: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    /// Upper bound on any single position (fraction of capital)
    #[serde(default = "default_max_position_fraction")]
    pub max_position_fraction: f64,
    #[serde(default = "default_high_conviction_fraction")]
    pub high_conviction_fraction: f64,
    #[serde(default = "default_moderate_fraction")]
    pub moderate_fraction: f64,
    /// Aggregate exposure ceiling across open and pending positions
    #[serde(default = "default_exposure_ceiling")]
    pub exposure_ceiling: f64,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            total_capital_usd: default_total_capital_usd(),
            max_open_positions: default_max_open_positions(),
            max_position_fraction: default_max_position_fraction(),
            high_conviction_fraction: default_high_conviction_fraction(),
            moderate_fraction: default_moderate_fraction(),
            exposure_ceiling: default_exposure_ceiling(),
        }
    }
}

/// Per-position supervision
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Exit when price <= entry * stop_loss_multiple
    #[serde(default = "default_stop_loss_multiple")]
    pub stop_loss_multiple: f64,
    /// Exit when price >= entry * take_profit_multiple
    #[serde(default = "default_take_profit_multiple")]
    pub take_profit_multiple: f64,
    #[serde(default = "default_max_hold_secs")]
    pub max_hold_secs: u64,
    /// Consecutive ticks without a new sample before a staleness warning
    #[serde(default = "default_stale_after_missed_ticks")]
    pub stale_after_missed_ticks: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            stop_loss_multiple: default_stop_loss_multiple(),
            take_profit_multiple: default_take_profit_multiple(),
            max_hold_secs: default_max_hold_secs(),
            stale_after_missed_ticks: default_stale_after_missed_ticks(),
        }
    }
}

/// Rolling telemetry retention
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Window retention, must cover the longest momentum horizon (24h)
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_max_samples_per_token")]
    pub max_samples_per_token: usize,
    /// A candidate with no sample for this long is eligible for eviction
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Deployer balance baseline lookback
    #[serde(default = "default_dev_baseline_secs")]
    pub dev_baseline_secs: u64,
    #[serde(default = "default_holder_retention_secs")]
    pub holder_retention_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            max_samples_per_token: default_max_samples_per_token(),
            stale_after_secs: default_stale_after_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            dev_baseline_secs: default_dev_baseline_secs(),
            holder_retention_secs: default_holder_retention_secs(),
        }
    }
}

/// Execution gateway timeouts and retries
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_entry_max_attempts")]
    pub entry_max_attempts: u32,
    #[serde(default = "default_exit_max_attempts")]
    pub exit_max_attempts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Paper gateway slippage
    #[serde(default = "default_paper_slippage_bps")]
    pub paper_slippage_bps: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_execution_timeout_ms(),
            entry_max_attempts: default_entry_max_attempts(),
            exit_max_attempts: default_exit_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            paper_slippage_bps: default_paper_slippage_bps(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Candidate re-scoring cadence
    #[serde(default = "default_evaluation_interval_ms")]
    pub evaluation_interval_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub ingest_channel_capacity: usize,
    #[serde(default = "default_channel_capacity")]
    pub event_channel_capacity: usize,
    /// How long shutdown waits for exit flushes before aborting monitors
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: default_evaluation_interval_ms(),
            ingest_channel_capacity: default_channel_capacity(),
            event_channel_capacity: default_channel_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerConfig {
    /// Append-only JSONL journal; in-memory only when unset
    #[serde(default)]
    pub journal_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_dexscreener_url")]
    pub dexscreener_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Token addresses polled by `conviction watch` when none are given
    #[serde(default)]
    pub watch_list: Vec<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            dexscreener_url: default_dexscreener_url(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            watch_list: vec![],
        }
    }
}

fn default_total_capital_usd() -> f64 { 10_000.0 }
fn default_max_open_positions() -> usize { 10 }
fn default_max_position_fraction() -> f64 { MAX_SINGLE_POSITION_FRACTION }
fn default_high_conviction_fraction() -> f64 { 0.05 }
fn default_moderate_fraction() -> f64 { 0.02 }
fn default_exposure_ceiling() -> f64 { 0.5 }

fn default_tick_interval_ms() -> u64 { 1500 }
fn default_stop_loss_multiple() -> f64 { 0.85 }
fn default_take_profit_multiple() -> f64 { 1.5 }
fn default_max_hold_secs() -> u64 { 10 * 3600 }
fn default_stale_after_missed_ticks() -> u32 { 3 }

fn default_retention_secs() -> u64 { 90_000 }
fn default_max_samples_per_token() -> usize { 4096 }
fn default_stale_after_secs() -> u64 { 900 }
fn default_eviction_interval_secs() -> u64 { 60 }
fn default_dev_baseline_secs() -> u64 { 3600 }
fn default_holder_retention_secs() -> u64 { 3600 }

fn default_execution_timeout_ms() -> u64 { 3000 }
fn default_entry_max_attempts() -> u32 { 3 }
fn default_exit_max_attempts() -> u32 { 5 }
fn default_backoff_initial_ms() -> u64 { 200 }
fn default_backoff_max_ms() -> u64 { 2000 }
fn default_paper_slippage_bps() -> u32 { 50 }

fn default_evaluation_interval_ms() -> u64 { 1000 }
fn default_channel_capacity() -> usize { 1024 }
fn default_shutdown_grace_secs() -> u64 { 10 }

fn default_dexscreener_url() -> String {
    "https://api.dexscreener.com/latest/dex".to_string()
}

fn default_poll_interval_ms() -> u64 { 2000 }
fn default_request_timeout_ms() -> u64 { 5000 }

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix CONVICTION__)
            .add_source(
                config::Environment::with_prefix("CONVICTION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let capital = &self.capital;
        if capital.total_capital_usd <= 0.0 {
            anyhow::bail!("total_capital_usd must be positive");
        }
        if capital.max_open_positions == 0 {
            anyhow::bail!("max_open_positions must be at least 1");
        }
        if capital.max_position_fraction <= 0.0
            || capital.max_position_fraction > MAX_SINGLE_POSITION_FRACTION
        {
            anyhow::bail!(
                "max_position_fraction must be in (0, {}], got {}",
                MAX_SINGLE_POSITION_FRACTION,
                capital.max_position_fraction
            );
        }
        for (name, size) in [
            ("high_conviction_fraction", capital.high_conviction_fraction),
            ("moderate_fraction", capital.moderate_fraction),
        ] {
            if size <= 0.0 || size > capital.max_position_fraction {
                anyhow::bail!(
                    "{} must be in (0, max_position_fraction={}], got {}",
                    name,
                    capital.max_position_fraction,
                    size
                );
            }
        }
        if capital.exposure_ceiling <= 0.0 || capital.exposure_ceiling > 1.0 {
            anyhow::bail!("exposure_ceiling must be in (0, 1]");
        }

        self.scoring
            .validate()
            .context("Invalid scoring configuration")?;

        let monitor = &self.monitor;
        if monitor.stop_loss_multiple <= 0.0 || monitor.stop_loss_multiple >= 1.0 {
            anyhow::bail!("stop_loss_multiple must be in (0, 1)");
        }
        if monitor.take_profit_multiple <= 1.0 {
            anyhow::bail!("take_profit_multiple must be greater than 1");
        }
        if !(MIN_HOLD_SECS..=MAX_HOLD_SECS).contains(&monitor.max_hold_secs) {
            anyhow::bail!(
                "max_hold_secs must be between {} and {}, got {}",
                MIN_HOLD_SECS,
                MAX_HOLD_SECS,
                monitor.max_hold_secs
            );
        }
        if monitor.tick_interval_ms == 0 || monitor.stale_after_missed_ticks == 0 {
            anyhow::bail!("monitor tick_interval_ms and stale_after_missed_ticks must be positive");
        }

        self.rug.validate().context("Invalid rug configuration")?;

        if self.tracker.retention_secs < 24 * 3600 {
            anyhow::bail!("tracker retention_secs must cover the 24h momentum horizon");
        }
        if self.tracker.eviction_interval_secs == 0 {
            anyhow::bail!("tracker eviction_interval_secs must be positive");
        }

        let execution = &self.execution;
        if execution.timeout_ms == 0 {
            anyhow::bail!("execution timeout_ms must be positive");
        }
        if execution.entry_max_attempts == 0 || execution.exit_max_attempts == 0 {
            anyhow::bail!("execution attempt limits must be at least 1");
        }
        if execution.paper_slippage_bps > 10000 {
            anyhow::bail!("paper_slippage_bps cannot exceed 10000 (100%)");
        }

        if self.engine.evaluation_interval_ms == 0 || self.feed.poll_interval_ms == 0 {
            anyhow::bail!("evaluation and poll intervals must be positive");
        }
        if self.engine.ingest_channel_capacity == 0 || self.engine.event_channel_capacity == 0 {
            anyhow::bail!("channel capacities must be positive");
        }

        if self.capital.exposure_ceiling
            < self.capital.high_conviction_fraction * self.capital.max_open_positions as f64
        {
            tracing::warn!(
                "exposure_ceiling {} binds before max_open_positions {} at full size",
                self.capital.exposure_ceiling,
                self.capital.max_open_positions
            );
        }

        Ok(())
    }

    /// Get configuration summary for display
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Capital:
    total: ${}
    max_open_positions: {}
    sizes: high={}  moderate={}  max={}
    exposure_ceiling: {}
  Scoring:
    weights: momentum={} volume={} age={} whale={} dev={}
    high_conviction: composite>={} (momentum>={} volume>={} age>={} whale>={} dev>={})
    moderate: composite>={}
    neutral_factor: {}
  Monitor:
    tick: {}ms
    stop_loss: x{}
    take_profit: x{}
    max_hold: {}s
  Rug:
    window: {}s  min_hits: {}  eval: {}ms
  Execution:
    timeout: {}ms
    attempts: entry={} exit={}
  Ledger:
    journal: {}
  Feed:
    dexscreener: {}
    poll: {}ms
    watch_list: {} tokens
"#,
            self.capital.total_capital_usd,
            self.capital.max_open_positions,
            self.capital.high_conviction_fraction,
            self.capital.moderate_fraction,
            self.capital.max_position_fraction,
            self.capital.exposure_ceiling,
            self.scoring.weights.momentum,
            self.scoring.weights.volume_health,
            self.scoring.weights.age_bonus,
            self.scoring.weights.whale,
            self.scoring.weights.dev,
            self.scoring.thresholds.high_composite,
            self.scoring.thresholds.min_momentum,
            self.scoring.thresholds.min_volume_health,
            self.scoring.thresholds.min_age_bonus,
            self.scoring.thresholds.min_whale,
            self.scoring.thresholds.min_dev,
            self.scoring.thresholds.moderate_composite,
            self.scoring.neutral_factor,
            self.monitor.tick_interval_ms,
            self.monitor.stop_loss_multiple,
            self.monitor.take_profit_multiple,
            self.monitor.max_hold_secs,
            self.rug.window_secs,
            self.rug.min_hits,
            self.rug.eval_interval_ms,
            self.execution.timeout_ms,
            self.execution.entry_max_attempts,
            self.execution.exit_max_attempts,
            self.ledger.journal_path.as_deref().unwrap_or("(memory only)"),
            mask_url(&self.feed.dexscreener_url),
            self.feed.poll_interval_ms,
            self.feed.watch_list.len(),
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}
