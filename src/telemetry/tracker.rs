//! Token lifecycle tracker
//!
//! Single writer (telemetry ingestion), many readers (scoring, rug
//! detection, monitors). Readers only ever see cloned snapshots or derived
//! feature vectors.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

use super::sample::{HolderBalance, QualityIssue, SampleField, TokenSample};
use super::window::SeriesWindow;
use crate::config::TrackerConfig;
use crate::error::{Error, Result};

const HOLDER_SNAPSHOT_CAP: usize = 256;

/// Data quality attached to a feature vector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQuality {
    /// Fields absent or malformed in the latest sample (last known value used)
    pub stale_fields: Vec<SampleField>,
    /// Fields never observed with a usable value
    pub unknown_fields: Vec<SampleField>,
}

impl DataQuality {
    pub fn is_degraded(&self) -> bool {
        !self.stale_fields.is_empty() || !self.unknown_fields.is_empty()
    }
}

/// Derived per-factor inputs for one token at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub token_id: String,
    pub as_of: DateTime<Utc>,
    pub price_usd: Option<f64>,
    pub return_5m: Option<f64>,
    pub return_1h: Option<f64>,
    pub return_24h: Option<f64>,
    pub volume_to_mcap: Option<f64>,
    pub age_secs: u64,
    pub holder_count: Option<u64>,
    pub top10_percent: Option<f64>,
    pub deployer_balance_delta: Option<f64>,
    pub quality: DataQuality,
}

/// Rolling telemetry state for one token
#[derive(Debug, Clone)]
pub struct TokenCandidate {
    pub id: String,
    pub contract_address: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub last_sample_at: DateTime<Utc>,
    /// Incremented for every accepted sample
    pub sequence: u64,
    pub price: SeriesWindow,
    pub volume: SeriesWindow,
    pub liquidity: SeriesWindow,
    pub top10: SeriesWindow,
    pub deployer: SeriesWindow,
    pub holders: VecDeque<(DateTime<Utc>, Vec<HolderBalance>)>,
    pub market_cap: Option<f64>,
    pub holder_count: Option<u64>,
    last_issues: Vec<QualityIssue>,
}

impl TokenCandidate {
    fn new(sample: &TokenSample, config: &TrackerConfig) -> Self {
        let retention = Duration::seconds(config.retention_secs as i64);
        let window = || SeriesWindow::new(retention, config.max_samples_per_token);
        Self {
            id: sample.token_id.clone(),
            contract_address: sample.contract_address.clone(),
            discovered_at: sample.timestamp,
            launched_at: sample.launched_at,
            last_sample_at: sample.timestamp,
            sequence: 0,
            price: window(),
            volume: window(),
            liquidity: window(),
            top10: window(),
            deployer: window(),
            holders: VecDeque::new(),
            market_cap: None,
            holder_count: None,
            last_issues: Vec::new(),
        }
    }

    /// Token age at `at`, from launch when known, else from discovery
    pub fn age_at(&self, at: DateTime<Utc>) -> u64 {
        let born = self.launched_at.unwrap_or(self.discovered_at);
        (at - born).num_seconds().max(0) as u64
    }

    fn apply(&mut self, sample: TokenSample, holder_retention: Duration) {
        let at = sample.timestamp;
        if let Some(v) = sample.price_usd {
            self.price.push(at, v);
        }
        if let Some(v) = sample.volume_24h {
            self.volume.push(at, v);
        }
        if let Some(v) = sample.liquidity_usd {
            self.liquidity.push(at, v);
        }
        if let Some(v) = sample.top10_percent_held {
            self.top10.push(at, v);
        }
        if let Some(v) = sample.deployer_wallet_balance {
            self.deployer.push(at, v);
        }
        if let Some(v) = sample.market_cap_usd {
            self.market_cap = Some(v);
        }
        if let Some(v) = sample.holder_count {
            self.holder_count = Some(v);
        }
        if let Some(holders) = sample.top_holders {
            self.holders.push_back((at, holders));
            let cutoff = at - holder_retention;
            while self.holders.front().map_or(false, |(t, _)| *t < cutoff)
                || self.holders.len() > HOLDER_SNAPSHOT_CAP
            {
                self.holders.pop_front();
            }
        }
        if self.contract_address.is_none() {
            self.contract_address = sample.contract_address;
        }
        if self.launched_at.is_none() {
            self.launched_at = sample.launched_at;
        }
        self.last_sample_at = at;
        self.sequence += 1;
    }

    fn has_value(&self, field: SampleField) -> bool {
        match field {
            SampleField::Price => !self.price.is_empty(),
            SampleField::Volume => !self.volume.is_empty(),
            SampleField::MarketCap => self.market_cap.is_some(),
            SampleField::Liquidity => !self.liquidity.is_empty(),
            SampleField::HolderCount => self.holder_count.is_some(),
            SampleField::Top10Percent => !self.top10.is_empty(),
            SampleField::DeployerBalance => !self.deployer.is_empty(),
            SampleField::TopHolders => !self.holders.is_empty(),
        }
    }

    fn quality(&self) -> DataQuality {
        let mut quality = DataQuality::default();
        for issue in &self.last_issues {
            let field = issue.field();
            if self.has_value(field) {
                quality.stale_fields.push(field);
            } else {
                quality.unknown_fields.push(field);
            }
        }
        quality
    }

    /// Derive the feature vector from the current windows
    pub fn features(&self, dev_baseline: Duration) -> FeatureVector {
        let volume_to_mcap = match (self.volume.latest_value(), self.market_cap) {
            (Some(volume), Some(mcap)) if mcap > 0.0 => Some(volume / mcap),
            _ => None,
        };

        FeatureVector {
            token_id: self.id.clone(),
            as_of: self.last_sample_at,
            price_usd: self.price.latest_value(),
            return_5m: self.price.change_over(Duration::minutes(5)),
            return_1h: self.price.change_over(Duration::hours(1)),
            return_24h: self.price.change_over(Duration::hours(24)),
            volume_to_mcap,
            age_secs: self.age_at(self.last_sample_at),
            holder_count: self.holder_count,
            top10_percent: self.top10.latest_value(),
            deployer_balance_delta: self.deployer.change_over(dev_baseline),
            quality: self.quality(),
        }
    }
}

/// Result of ingesting one sample
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub accepted: bool,
    pub created: bool,
    pub sequence: u64,
    pub issues: Vec<QualityIssue>,
}

/// Tracks rolling telemetry per token
pub struct TokenLifecycleTracker {
    config: TrackerConfig,
    candidates: DashMap<String, TokenCandidate>,
    /// Newest accepted sample timestamp (ms), the tracker's notion of "now"
    watermark_ms: AtomicI64,
}

impl TokenLifecycleTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            candidates: DashMap::new(),
            watermark_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Ingest one telemetry sample. Never fails; bad input is logged and kept out.
    pub fn update(&self, sample: TokenSample) -> UpdateOutcome {
        let rejected = UpdateOutcome {
            accepted: false,
            created: false,
            sequence: 0,
            issues: Vec::new(),
        };

        if sample.token_id.trim().is_empty() {
            warn!("Dropping telemetry sample without token id");
            return rejected;
        }

        let token_id = sample.token_id.clone();
        let (sample, issues) = sample.sanitize();
        let holder_retention = Duration::seconds(self.config.holder_retention_secs as i64);

        let mut created = false;
        let mut entry = self.candidates.entry(token_id.clone()).or_insert_with(|| {
            created = true;
            TokenCandidate::new(&sample, &self.config)
        });
        let candidate = entry.value_mut();

        if !created && sample.timestamp < candidate.last_sample_at {
            warn!(
                token = %token_id,
                sample_at = %sample.timestamp,
                last_at = %candidate.last_sample_at,
                "Out-of-order telemetry sample ignored"
            );
            return UpdateOutcome {
                sequence: candidate.sequence,
                issues,
                ..rejected
            };
        }

        let changed = issues != candidate.last_issues && !issues.is_empty();
        if changed || issues.iter().any(|i| i.is_malformed()) {
            let fields: Vec<String> = issues.iter().map(|i| format!("{:?}", i)).collect();
            warn!(
                token = %token_id,
                issues = %fields.join(","),
                "Degraded telemetry sample, keeping last known values"
            );
        }
        candidate.last_issues = issues.clone();
        self.watermark_ms
            .fetch_max(sample.timestamp.timestamp_millis(), Ordering::Relaxed);
        candidate.apply(sample, holder_retention);

        if created {
            info!(token = %token_id, "New token candidate discovered");
        } else {
            debug!(token = %token_id, seq = candidate.sequence, "Telemetry updated");
        }

        UpdateOutcome {
            accepted: true,
            created,
            sequence: candidate.sequence,
            issues,
        }
    }

    /// Current feature vector for a token
    pub fn features(&self, token_id: &str) -> Result<FeatureVector> {
        let dev_baseline = Duration::seconds(self.config.dev_baseline_secs as i64);
        self.candidates
            .get(token_id)
            .map(|c| c.features(dev_baseline))
            .ok_or_else(|| Error::UnknownToken(token_id.to_string()))
    }

    /// Run a read-only closure against a token's state
    pub fn with_candidate<R>(
        &self,
        token_id: &str,
        f: impl FnOnce(&TokenCandidate) -> R,
    ) -> Option<R> {
        self.candidates.get(token_id).map(|c| f(c.value()))
    }

    /// Cloned snapshot of a token's state
    pub fn snapshot(&self, token_id: &str) -> Option<TokenCandidate> {
        self.with_candidate(token_id, |c| c.clone())
    }

    /// Latest known price
    pub fn latest_price(&self, token_id: &str) -> Option<f64> {
        self.with_candidate(token_id, |c| c.price.latest_value()).flatten()
    }

    /// Latest accepted sample sequence number
    pub fn sequence(&self, token_id: &str) -> Option<u64> {
        self.with_candidate(token_id, |c| c.sequence)
    }

    /// All tracked token ids
    pub fn active_tokens(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Timestamp of the newest sample seen for any token.
    ///
    /// Staleness is judged against this rather than the wall clock so a
    /// replayed history ages the same way it did live.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self.watermark_ms.load(Ordering::Relaxed) {
            i64::MIN => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// Remove tokens that went quiet and carry no position
    pub fn evict_stale(&self, now: DateTime<Utc>, is_held: impl Fn(&str) -> bool) -> Vec<String> {
        let stale_after = Duration::seconds(self.config.stale_after_secs as i64);
        let stale: Vec<String> = self
            .candidates
            .iter()
            .filter(|c| now - c.last_sample_at > stale_after)
            .map(|c| c.key().clone())
            .filter(|id| !is_held(id))
            .collect();

        for id in &stale {
            self.candidates.remove(id);
            debug!(token = %id, "Evicted stale candidate");
        }
        if !stale.is_empty() {
            info!("Evicted {} stale candidates", stale.len());
        }
        stale
    }
}
