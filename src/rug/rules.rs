//! Rug rules
//!
//! Each rule is an independent pure predicate over a `RugWindow`. Rules
//! never look at each other's results; aggregation happens in the detector.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::detector::RugDetectorConfig;
use crate::telemetry::{HolderBalance, TokenCandidate};

/// Rug rule identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RugRule {
    SharpDrop,
    VolumeSpikeDrop,
    LiquidityDrain,
    WhaleExodus,
    DevDump,
}

impl RugRule {
    /// Stable rule id used in logs and the ledger
    pub fn id(&self) -> &'static str {
        match self {
            RugRule::SharpDrop => "sharp-drop",
            RugRule::VolumeSpikeDrop => "volume-spike-drop",
            RugRule::LiquidityDrain => "liquidity-drain",
            RugRule::WhaleExodus => "whale-exodus",
            RugRule::DevDump => "dev-dump",
        }
    }

    /// Get severity weight for this rule
    pub fn severity(&self) -> f64 {
        match self {
            RugRule::LiquidityDrain => 0.95,
            RugRule::DevDump => 0.9,
            RugRule::SharpDrop => 0.8,
            RugRule::WhaleExodus => 0.75,
            RugRule::VolumeSpikeDrop => 0.7,
        }
    }
}

impl std::fmt::Display for RugRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// A single rule firing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHit {
    pub rule: RugRule,
    /// Sample timestamp the rule fired on
    pub at: DateTime<Utc>,
    /// Observed magnitude (drop fraction, volume multiple, holder count)
    pub magnitude: f64,
    pub detail: String,
}

/// Telemetry view a rule evaluates against
#[derive(Debug, Clone, Default)]
pub struct RugWindow {
    pub token_id: String,
    pub as_of: Option<DateTime<Utc>>,
    /// Prices inside the sharp-drop window, oldest first
    pub prices: Vec<(DateTime<Utc>, f64)>,
    /// 24h volume readings inside the volume baseline window, oldest first
    pub volumes: Vec<(DateTime<Utc>, f64)>,
    pub liquidity_current: Option<f64>,
    pub liquidity_previous: Option<f64>,
    /// Earliest and latest top-holder snapshots inside the detection window
    pub holders_first: Option<Vec<HolderBalance>>,
    pub holders_latest: Option<Vec<HolderBalance>>,
    /// Top-10 share readings inside the detection window
    pub top10: Vec<(DateTime<Utc>, f64)>,
    /// Deployer balance readings inside the detection window
    pub deployer: Vec<(DateTime<Utc>, f64)>,
}

impl RugWindow {
    /// Build a window from a tracker candidate
    pub fn from_candidate(candidate: &TokenCandidate, config: &RugDetectorConfig) -> Self {
        let as_of = candidate.last_sample_at;
        let detection_since = as_of - Duration::seconds(config.window_secs as i64);

        let mut snapshots = candidate
            .holders
            .iter()
            .filter(|(t, _)| *t >= detection_since);
        let holders_first = snapshots.next().map(|(_, h)| h.clone());
        let holders_latest = candidate.holders.back().map(|(_, h)| h.clone());

        Self {
            token_id: candidate.id.clone(),
            as_of: Some(as_of),
            prices: candidate
                .price
                .since(as_of - Duration::seconds(config.sharp_drop_window_secs as i64)),
            volumes: candidate
                .volume
                .since(as_of - Duration::seconds(config.volume_baseline_secs as i64)),
            liquidity_current: candidate.liquidity.latest_value(),
            liquidity_previous: candidate.liquidity.previous_value(),
            holders_first,
            holders_latest,
            top10: candidate.top10.since(detection_since),
            deployer: candidate.deployer.since(detection_since),
        }
    }

    fn current_price(&self) -> Option<f64> {
        self.prices.last().map(|(_, p)| *p)
    }

    /// Decline from the window's peak price to the current price
    fn drawdown(&self) -> Option<f64> {
        let current = self.current_price()?;
        let peak = self.prices.iter().map(|(_, p)| *p).fold(f64::MIN, f64::max);
        if peak <= 0.0 {
            return None;
        }
        Some((peak - current) / peak)
    }

    fn hit(&self, rule: RugRule, magnitude: f64, detail: String) -> RuleHit {
        RuleHit {
            rule,
            at: self.as_of.unwrap_or_else(Utc::now),
            magnitude,
            detail,
        }
    }
}

/// A rule predicate
pub type RulePredicate = fn(&RugWindow, &RugDetectorConfig) -> Option<RuleHit>;

/// The full rule set, evaluated independently
pub const RULES: [(RugRule, RulePredicate); 5] = [
    (RugRule::SharpDrop, sharp_drop),
    (RugRule::VolumeSpikeDrop, volume_spike_drop),
    (RugRule::LiquidityDrain, liquidity_drain),
    (RugRule::WhaleExodus, whale_exodus),
    (RugRule::DevDump, dev_dump),
];

/// Evaluate every rule against the window
pub fn evaluate(window: &RugWindow, config: &RugDetectorConfig) -> Vec<RuleHit> {
    RULES
        .iter()
        .filter_map(|(_, predicate)| predicate(window, config))
        .collect()
}

/// Price fell sharply from its recent peak
pub fn sharp_drop(window: &RugWindow, config: &RugDetectorConfig) -> Option<RuleHit> {
    let drawdown = window.drawdown()?;
    (drawdown >= config.sharp_drop_pct).then(|| {
        window.hit(
            RugRule::SharpDrop,
            drawdown,
            format!("price down {:.1}% from window peak", drawdown * 100.0),
        )
    })
}

/// Volume spiked against its rolling average while price declined
pub fn volume_spike_drop(window: &RugWindow, config: &RugDetectorConfig) -> Option<RuleHit> {
    let ((_, current), previous) = window.volumes.split_last()?;
    if previous.is_empty() {
        return None;
    }
    let average = previous.iter().map(|(_, v)| v).sum::<f64>() / previous.len() as f64;
    if average <= 0.0 {
        return None;
    }
    let multiple = current / average;
    let decline = window.drawdown()?;

    (multiple >= config.volume_spike_multiple && decline >= config.volume_spike_price_drop_pct)
        .then(|| {
            window.hit(
                RugRule::VolumeSpikeDrop,
                multiple,
                format!(
                    "volume {:.1}x average with price down {:.1}%",
                    multiple,
                    decline * 100.0
                ),
            )
        })
}

/// Liquidity collapsed against its last known value
pub fn liquidity_drain(window: &RugWindow, config: &RugDetectorConfig) -> Option<RuleHit> {
    let current = window.liquidity_current?;
    let previous = window.liquidity_previous?;
    if previous <= 0.0 {
        return None;
    }
    let drop = (previous - current) / previous;
    (drop >= config.liquidity_drain_pct).then(|| {
        window.hit(
            RugRule::LiquidityDrain,
            drop,
            format!("liquidity down {:.1}% (${:.0} -> ${:.0})", drop * 100.0, previous, current),
        )
    })
}

/// Several large holders cut their balances inside the window.
///
/// With per-holder balances a holder that vanished from the latest snapshot
/// counts as fully exited. Without them, a fall in top-10 share is used.
pub fn whale_exodus(window: &RugWindow, config: &RugDetectorConfig) -> Option<RuleHit> {
    if let (Some(first), Some(latest)) = (&window.holders_first, &window.holders_latest) {
        let exited = first
            .iter()
            .filter(|h| h.balance > 0.0)
            .filter(|h| {
                let now = latest
                    .iter()
                    .find(|l| l.address == h.address)
                    .map_or(0.0, |l| l.balance);
                (h.balance - now) / h.balance >= config.whale_drop_pct
            })
            .count();

        return (exited >= config.whale_min_holders).then(|| {
            window.hit(
                RugRule::WhaleExodus,
                exited as f64,
                format!(
                    "{} top holders reduced balance by >= {:.0}%",
                    exited,
                    config.whale_drop_pct * 100.0
                ),
            )
        });
    }

    let (_, first) = window.top10.first()?;
    let (_, latest) = window.top10.last()?;
    let fall = first - latest;
    (fall >= config.whale_top10_drop_points).then(|| {
        window.hit(
            RugRule::WhaleExodus,
            fall,
            format!("top-10 share fell {:.1} points", fall),
        )
    })
}

/// Deployer wallet sold a large part of its balance
pub fn dev_dump(window: &RugWindow, config: &RugDetectorConfig) -> Option<RuleHit> {
    let (_, baseline) = window.deployer.first()?;
    let (_, current) = window.deployer.last()?;
    if *baseline <= 0.0 {
        return None;
    }
    let drop = (baseline - current) / baseline;
    (drop >= config.dev_dump_pct).then(|| {
        window.hit(
            RugRule::DevDump,
            drop,
            format!("deployer balance down {:.1}%", drop * 100.0),
        )
    })
}
