//! Rug detector
//!
//! One evaluation task per watched token, running on its own cadence and
//! independent of the position monitor's tick. Rule hits are remembered per
//! token for the detection window; once enough distinct rules have fired
//! inside that window a single aggregated `RugSignal` is published on the
//! token's broadcast channel.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rules::{self, RugRule, RugWindow, RuleHit};
use crate::error::{Error, Result};
use crate::telemetry::TokenLifecycleTracker;

/// Rug detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RugDetectorConfig {
    /// Window inside which distinct rule hits are aggregated
    pub window_secs: u64,
    /// Detector evaluation cadence per token
    pub eval_interval_ms: u64,
    /// Distinct rules needed for a signal
    pub min_hits: usize,
    pub sharp_drop_pct: f64,
    pub sharp_drop_window_secs: u64,
    pub volume_spike_multiple: f64,
    pub volume_baseline_secs: u64,
    pub volume_spike_price_drop_pct: f64,
    pub liquidity_drain_pct: f64,
    pub whale_drop_pct: f64,
    pub whale_min_holders: usize,
    pub whale_top10_drop_points: f64,
    pub dev_dump_pct: f64,
    pub channel_capacity: usize,
}

impl Default for RugDetectorConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            eval_interval_ms: 500,
            min_hits: 2,
            sharp_drop_pct: 0.15,
            sharp_drop_window_secs: 300,
            volume_spike_multiple: 2.0,
            volume_baseline_secs: 3600,
            volume_spike_price_drop_pct: 0.10,
            liquidity_drain_pct: 0.50,
            whale_drop_pct: 0.25,
            whale_min_holders: 2,
            whale_top10_drop_points: 10.0,
            dev_dump_pct: 0.20,
            channel_capacity: 16,
        }
    }
}

impl RugDetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_hits < 2 {
            return Err(Error::Config(
                "rug min_hits must be at least 2; a single rule never signals".into(),
            ));
        }
        if self.window_secs == 0 || self.eval_interval_ms == 0 || self.sharp_drop_window_secs == 0 {
            return Err(Error::Config("rug windows and intervals must be positive".into()));
        }
        let fractions = [
            self.sharp_drop_pct,
            self.volume_spike_price_drop_pct,
            self.liquidity_drain_pct,
            self.whale_drop_pct,
            self.dev_dump_pct,
        ];
        if fractions.iter().any(|f| *f <= 0.0 || *f > 1.0) {
            return Err(Error::Config("rug drop thresholds must be in (0, 1]".into()));
        }
        if self.volume_spike_multiple <= 1.0 {
            return Err(Error::Config("volume_spike_multiple must exceed 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("rug channel_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Aggregated rug signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RugSignal {
    pub token_id: String,
    /// Most severe contributing rule
    pub signal_type: RugRule,
    /// Combined severity (0.0 to 1.0)
    pub strength: f64,
    pub timestamp: DateTime<Utc>,
    /// Distinct contributing rules
    pub rules: Vec<RugRule>,
    pub hits: Vec<RuleHit>,
}

impl RugSignal {
    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }
}

/// Remembers rule hits for one token and aggregates them
#[derive(Debug, Clone)]
pub struct HitAggregator {
    window: Duration,
    min_hits: usize,
    hits: Vec<RuleHit>,
}

impl HitAggregator {
    pub fn new(window: Duration, min_hits: usize) -> Self {
        Self {
            window,
            min_hits: min_hits.max(2),
            hits: Vec::new(),
        }
    }

    /// Record new hits observed at `now`. Returns a signal once enough
    /// distinct rules fired inside the window.
    pub fn record(
        &mut self,
        token_id: &str,
        new_hits: Vec<RuleHit>,
        now: DateTime<Utc>,
    ) -> Option<RugSignal> {
        let cutoff = now - self.window;
        self.hits.retain(|h| h.at >= cutoff);
        self.hits.extend(new_hits);

        let distinct: BTreeSet<RugRule> = self.hits.iter().map(|h| h.rule).collect();
        if distinct.len() < self.min_hits {
            return None;
        }

        let rules: Vec<RugRule> = distinct.into_iter().collect();
        let signal_type = rules
            .iter()
            .copied()
            .max_by(|a, b| a.severity().total_cmp(&b.severity()))?;
        // Noisy-OR of the contributing severities
        let strength = 1.0 - rules.iter().map(|r| 1.0 - r.severity()).product::<f64>();

        Some(RugSignal {
            token_id: token_id.to_string(),
            signal_type,
            strength,
            timestamp: now,
            rules,
            hits: std::mem::take(&mut self.hits),
        })
    }

    pub fn pending(&self) -> usize {
        self.hits.len()
    }
}

struct Watch {
    sender: broadcast::Sender<RugSignal>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-token rug detection with broadcast fan-out
pub struct RugDetector {
    config: RugDetectorConfig,
    tracker: Arc<TokenLifecycleTracker>,
    watches: DashMap<String, Watch>,
}

impl RugDetector {
    pub fn new(config: RugDetectorConfig, tracker: Arc<TokenLifecycleTracker>) -> Self {
        Self {
            config,
            tracker,
            watches: DashMap::new(),
        }
    }

    /// Start watching a token and subscribe to its signals.
    /// Watching an already watched token just adds a subscriber.
    pub fn watch(&self, token_id: &str) -> broadcast::Receiver<RugSignal> {
        // The entry guard holds the shard lock, so one task per token
        match self.watches.entry(token_id.to_string()) {
            Entry::Occupied(watch) => watch.get().sender.subscribe(),
            Entry::Vacant(slot) => {
                let (sender, receiver) = broadcast::channel(self.config.channel_capacity);
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(run_watch(
                    token_id.to_string(),
                    self.config.clone(),
                    self.tracker.clone(),
                    sender.clone(),
                    cancel.clone(),
                ));

                info!(token = %token_id, "Rug detector watching token");
                slot.insert(Watch {
                    sender,
                    cancel,
                    handle,
                });
                receiver
            }
        }
    }

    /// Subscribe to an already watched token
    pub fn subscribe(&self, token_id: &str) -> Option<broadcast::Receiver<RugSignal>> {
        self.watches.get(token_id).map(|w| w.sender.subscribe())
    }

    /// Stop watching a token and close its channel
    pub fn unwatch(&self, token_id: &str) {
        if let Some((_, watch)) = self.watches.remove(token_id) {
            watch.cancel.cancel();
            debug!(token = %token_id, "Rug detector stopped watching token");
        }
    }

    pub fn is_watching(&self, token_id: &str) -> bool {
        self.watches.contains_key(token_id)
    }

    pub fn watched_count(&self) -> usize {
        self.watches.len()
    }

    /// Live subscriber count for a token's channel
    pub fn subscriber_count(&self, token_id: &str) -> usize {
        self.watches
            .get(token_id)
            .map_or(0, |w| w.sender.receiver_count())
    }

    /// Evaluate a token's current window right now, outside the watch
    /// cadence. Only hits from this one evaluation are aggregated.
    pub fn probe(&self, token_id: &str) -> Option<RugSignal> {
        let window = self
            .tracker
            .with_candidate(token_id, |c| RugWindow::from_candidate(c, &self.config))?;
        let as_of = window.as_of?;
        let hits = rules::evaluate(&window, &self.config);
        let window_len = Duration::seconds(self.config.window_secs as i64);
        HitAggregator::new(window_len, self.config.min_hits).record(token_id, hits, as_of)
    }

    /// Stop every watch task
    pub fn shutdown(&self) {
        let tokens: Vec<String> = self.watches.iter().map(|w| w.key().clone()).collect();
        for token in tokens {
            if let Some((_, watch)) = self.watches.remove(&token) {
                watch.cancel.cancel();
                watch.handle.abort();
            }
        }
    }
}

async fn run_watch(
    token_id: String,
    config: RugDetectorConfig,
    tracker: Arc<TokenLifecycleTracker>,
    sender: broadcast::Sender<RugSignal>,
    cancel: CancellationToken,
) {
    let period = std::time::Duration::from_millis(config.eval_interval_ms);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let window_len = Duration::seconds(config.window_secs as i64);
    let mut aggregator = HitAggregator::new(window_len, config.min_hits);
    let mut last_sequence: Option<u64> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Assess each accepted sample exactly once
                let sequence = tracker.sequence(&token_id);
                if sequence.is_none() || sequence == last_sequence {
                    continue;
                }
                last_sequence = sequence;

                let window =
                    tracker.with_candidate(&token_id, |c| RugWindow::from_candidate(c, &config));
                let Some(window) = window else {
                    continue;
                };
                let Some(as_of) = window.as_of else {
                    continue;
                };

                let hits = rules::evaluate(&window, &config);
                for hit in &hits {
                    debug!(
                        token = %token_id,
                        rule = %hit.rule,
                        detail = %hit.detail,
                        "Rug rule hit"
                    );
                }

                if let Some(signal) = aggregator.record(&token_id, hits, as_of) {
                    warn!(
                        token = %token_id,
                        signal_type = %signal.signal_type,
                        strength = signal.strength,
                        rules = ?signal.rule_ids(),
                        "RUG SIGNAL"
                    );
                    if sender.send(signal).is_err() {
                        debug!(token = %token_id, "Rug signal had no subscribers");
                    }
                }
            }
        }
    }

    debug!(token = %token_id, "Rug watch task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::telemetry::TokenSample;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn hit(rule: RugRule, at: DateTime<Utc>) -> RuleHit {
        RuleHit {
            rule,
            at,
            magnitude: 1.0,
            detail: String::new(),
        }
    }

    fn aggregator() -> HitAggregator {
        HitAggregator::new(Duration::seconds(300), 2)
    }

    #[test]
    fn test_single_rule_never_signals() {
        let mut agg = aggregator();
        for i in 0..10 {
            let signal = agg.record("tok", vec![hit(RugRule::SharpDrop, t(i * 10))], t(i * 10));
            assert!(signal.is_none());
        }
    }

    #[test]
    fn test_two_distinct_rules_in_window_signal() {
        let mut agg = aggregator();
        assert!(agg.record("tok", vec![hit(RugRule::SharpDrop, t(0))], t(0)).is_none());

        let signal = agg
            .record("tok", vec![hit(RugRule::LiquidityDrain, t(120))], t(120))
            .unwrap();
        assert_eq!(signal.rules, vec![RugRule::SharpDrop, RugRule::LiquidityDrain]);
        assert_eq!(signal.signal_type, RugRule::LiquidityDrain);
        assert!(signal.strength > RugRule::LiquidityDrain.severity());
        assert!(signal.strength <= 1.0);
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn test_hits_outside_window_expire() {
        let mut agg = aggregator();
        agg.record("tok", vec![hit(RugRule::SharpDrop, t(0))], t(0));
        let signal = agg.record("tok", vec![hit(RugRule::DevDump, t(400))], t(400));
        assert!(signal.is_none());
        assert_eq!(agg.pending(), 1);
    }

    #[test]
    fn test_config_rejects_single_hit() {
        let config = RugDetectorConfig {
            min_hits: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(RugDetectorConfig::default().validate().is_ok());
    }

    fn sample(at: DateTime<Utc>, price: f64, volume: f64) -> TokenSample {
        let mut s = TokenSample::new("tok", at);
        s.price_usd = Some(price);
        s.volume_24h = Some(volume);
        s
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_publishes_aggregated_signal() {
        let tracker = Arc::new(TokenLifecycleTracker::new(TrackerConfig::default()));
        let detector = RugDetector::new(RugDetectorConfig::default(), tracker.clone());

        tracker.update(sample(t(0), 0.001, 10_000.0));
        tracker.update(sample(t(60), 0.00095, 10_000.0));
        let mut rx = detector.watch("tok");
        assert_eq!(detector.subscriber_count("tok"), 1);

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert!(rx.try_recv().is_err());

        tracker.update(sample(t(120), 0.00083, 22_000.0));
        let signal = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal.rules, vec![RugRule::SharpDrop, RugRule::VolumeSpikeDrop]);

        detector.unwatch("tok");
        assert!(!detector.is_watching("tok"));
        assert_eq!(detector.subscriber_count("tok"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_watch_shares_one_task() {
        let tracker = Arc::new(TokenLifecycleTracker::new(TrackerConfig::default()));
        let detector = Arc::new(RugDetector::new(RugDetectorConfig::default(), tracker));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let detector = detector.clone();
                tokio::spawn(async move { detector.watch("tok") })
            })
            .collect();
        let mut receivers = Vec::new();
        for handle in handles {
            receivers.push(handle.await.unwrap());
        }

        assert_eq!(detector.watched_count(), 1);
        assert_eq!(detector.subscriber_count("tok"), 8);

        // A single unwatch closes every receiver; a leaked duplicate task
        // would keep its sender alive
        detector.unwatch("tok");
        for mut rx in receivers {
            let closed = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap();
            assert!(matches!(closed, Err(broadcast::error::RecvError::Closed)));
        }
    }

    #[test]
    fn test_probe_evaluates_current_window() {
        let tracker = Arc::new(TokenLifecycleTracker::new(TrackerConfig::default()));
        let detector = RugDetector::new(RugDetectorConfig::default(), tracker.clone());
        assert!(detector.probe("tok").is_none());

        tracker.update(sample(t(0), 0.001, 10_000.0));
        tracker.update(sample(t(60), 0.00095, 10_000.0));
        assert!(detector.probe("tok").is_none());

        tracker.update(sample(t(120), 0.00083, 22_000.0));
        let signal = detector.probe("tok").unwrap();
        assert_eq!(signal.signal_type, RugRule::SharpDrop);
        assert!(!detector.is_watching("tok"));
    }
}
