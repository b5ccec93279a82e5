//! Scoring engine for turning token features into conviction decisions
//!
//! Five factors are computed from a `FeatureVector`, combined into a
//! weighted composite and classified by a conjunctive decision rule. The
//! engine is a pure function of its input: identical features always yield
//! identical scores.

pub mod factors;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::telemetry::FeatureVector;

/// Conviction class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    HighConviction,
    Moderate,
    Reject,
}

impl Decision {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Decision::HighConviction => "All factors confirm - full size entry",
            Decision::Moderate => "Composite clears the bar - reduced size entry",
            Decision::Reject => "Insufficient conviction - no entry",
        }
    }

    /// Check if this decision allows opening a position
    pub fn allows_entry(&self) -> bool {
        !matches!(self, Decision::Reject)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Decision::HighConviction => "HIGH_CONVICTION",
            Decision::Moderate => "MODERATE",
            Decision::Reject => "REJECT",
        };
        write!(f, "{}", name)
    }
}

/// Scoring factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    Momentum,
    VolumeHealth,
    AgeBonus,
    Whale,
    Dev,
}

/// Per-factor scores, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorScores {
    pub momentum: f64,
    pub volume_health: f64,
    pub age_bonus: f64,
    pub whale: f64,
    pub dev: f64,
}

/// Result of scoring one feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub token_id: String,
    pub as_of: DateTime<Utc>,
    pub factors: FactorScores,
    /// Weighted average of the factors
    pub composite: f64,
    pub decision: Decision,
    /// Share of factors computed from known inputs (0.0 to 1.0)
    pub confidence: f64,
    /// Factors that fell back to the neutral value
    pub unknown_factors: Vec<Factor>,
    /// Set when any input was unknown or the latest sample was incomplete
    pub degraded: bool,
}

/// Factor weights for the composite
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub momentum: f64,
    pub volume_health: f64,
    pub age_bonus: f64,
    pub whale: f64,
    pub dev: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            momentum: 0.30,
            volume_health: 0.20,
            age_bonus: 0.15,
            whale: 0.20,
            dev: 0.15,
        }
    }
}

impl FactorWeights {
    pub fn sum(&self) -> f64 {
        self.momentum + self.volume_health + self.age_bonus + self.whale + self.dev
    }

    fn as_array(&self) -> [f64; 5] {
        [self.momentum, self.volume_health, self.age_bonus, self.whale, self.dev]
    }
}

/// Decision thresholds
///
/// HIGH_CONVICTION needs the composite bar AND every per-factor minimum.
/// MODERATE needs only its composite bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionThresholds {
    pub high_composite: f64,
    pub min_momentum: f64,
    pub min_volume_health: f64,
    pub min_age_bonus: f64,
    pub min_whale: f64,
    pub min_dev: f64,
    pub moderate_composite: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            high_composite: 0.8,
            min_momentum: 0.7,
            min_volume_health: 0.6,
            min_age_bonus: 0.5,
            min_whale: 0.5,
            min_dev: 0.5,
            moderate_composite: 0.6,
        }
    }
}

/// Scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: FactorWeights,
    #[serde(default)]
    pub thresholds: DecisionThresholds,
    /// Value used for a factor whose inputs are unknown
    #[serde(default = "default_neutral_factor")]
    pub neutral_factor: f64,
}

fn default_neutral_factor() -> f64 {
    0.5
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            thresholds: DecisionThresholds::default(),
            neutral_factor: default_neutral_factor(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        let weights = self.weights.as_array();
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(Error::Config("factor weights must be non-negative".into()));
        }
        if (self.weights.sum() - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!(
                "factor weights must sum to 1.0, got {:.6}",
                self.weights.sum()
            )));
        }

        let t = &self.thresholds;
        let bounded = [
            t.high_composite,
            t.min_momentum,
            t.min_volume_health,
            t.min_age_bonus,
            t.min_whale,
            t.min_dev,
            t.moderate_composite,
            self.neutral_factor,
        ];
        if bounded.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return Err(Error::Config(
                "thresholds and neutral_factor must be within [0, 1]".into(),
            ));
        }
        if t.moderate_composite > t.high_composite {
            return Err(Error::Config(
                "moderate_composite cannot exceed high_composite".into(),
            ));
        }
        Ok(())
    }
}

/// The main scoring engine
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score a feature vector
    pub fn score(&self, features: &FeatureVector) -> Score {
        let neutral = self.config.neutral_factor;
        let mut unknown_factors = Vec::new();
        let mut resolve = |factor: Factor, value: Option<f64>| match value {
            Some(v) => factors::unit(v),
            None => {
                unknown_factors.push(factor);
                neutral
            }
        };

        let scores = FactorScores {
            momentum: resolve(
                Factor::Momentum,
                factors::momentum(features.return_5m, features.return_1h, features.return_24h),
            ),
            volume_health: resolve(
                Factor::VolumeHealth,
                factors::volume_health(features.volume_to_mcap),
            ),
            age_bonus: factors::age_bonus(features.age_secs),
            whale: resolve(
                Factor::Whale,
                factors::whale(features.top10_percent, features.holder_count),
            ),
            dev: resolve(Factor::Dev, factors::dev(features.deployer_balance_delta)),
        };

        let composite = self.composite(&scores);
        let mut decision = self.decide(&scores, composite);
        // A neutral stand-in cannot confirm a full-size entry
        if decision == Decision::HighConviction && !unknown_factors.is_empty() {
            decision = Decision::Moderate;
        }
        let confidence = 1.0 - unknown_factors.len() as f64 / 5.0;
        let degraded = !unknown_factors.is_empty() || features.quality.is_degraded();

        Score {
            token_id: features.token_id.clone(),
            as_of: features.as_of,
            factors: scores,
            composite,
            decision,
            confidence,
            unknown_factors,
            degraded,
        }
    }

    /// Weighted average of the factor scores
    pub fn composite(&self, scores: &FactorScores) -> f64 {
        let w = &self.config.weights;
        let total = w.sum();
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = scores.momentum * w.momentum
            + scores.volume_health * w.volume_health
            + scores.age_bonus * w.age_bonus
            + scores.whale * w.whale
            + scores.dev * w.dev;
        factors::unit(weighted / total)
    }

    /// Conjunctive decision rule
    pub fn decide(&self, scores: &FactorScores, composite: f64) -> Decision {
        let t = &self.config.thresholds;

        let high = composite >= t.high_composite
            && scores.momentum >= t.min_momentum
            && scores.volume_health >= t.min_volume_health
            && scores.age_bonus >= t.min_age_bonus
            && scores.whale >= t.min_whale
            && scores.dev >= t.min_dev;

        if high {
            Decision::HighConviction
        } else if composite >= t.moderate_composite {
            Decision::Moderate
        } else {
            Decision::Reject
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::DataQuality;

    fn scenario_a_features() -> FeatureVector {
        FeatureVector {
            token_id: "tok".to_string(),
            as_of: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            price_usd: Some(0.0001),
            return_5m: Some(0.12),
            return_1h: Some(0.25),
            return_24h: Some(0.60),
            volume_to_mcap: Some(0.30),
            age_secs: 2 * 3600,
            holder_count: Some(1000),
            top10_percent: Some(20.0),
            deployer_balance_delta: Some(0.0),
            quality: DataQuality::default(),
        }
    }

    fn scores(m: f64, v: f64, a: f64, w: f64, d: f64) -> FactorScores {
        FactorScores {
            momentum: m,
            volume_health: v,
            age_bonus: a,
            whale: w,
            dev: d,
        }
    }

    #[test]
    fn test_scenario_a_high_conviction() {
        let engine = ScoringEngine::default();
        let score = engine.score(&scenario_a_features());

        assert!((score.composite - 0.85).abs() < 0.01, "composite {}", score.composite);
        assert_eq!(score.decision, Decision::HighConviction);
        assert_eq!(score.confidence, 1.0);
        assert!(!score.degraded);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let engine = ScoringEngine::default();
        let features = scenario_a_features();
        let first = engine.score(&features);
        for _ in 0..10 {
            assert_eq!(engine.score(&features), first);
        }
    }

    #[test]
    fn test_single_weak_factor_blocks_high_conviction() {
        let engine = ScoringEngine::default();

        // Composite clears 0.8 but dev is below its minimum
        let s = scores(1.0, 1.0, 0.7, 1.0, 0.3);
        let composite = engine.composite(&s);
        assert!(composite >= 0.8);
        assert_eq!(engine.decide(&s, composite), Decision::Moderate);

        // Momentum just under its minimum
        let s = scores(0.69, 1.0, 0.7, 1.0, 1.0);
        let composite = engine.composite(&s);
        assert!(composite >= 0.8);
        assert_eq!(engine.decide(&s, composite), Decision::Moderate);
    }

    #[test]
    fn test_decision_bands() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.decide(&scores(1.0, 1.0, 0.7, 1.0, 1.0), 0.8), Decision::HighConviction);
        assert_eq!(engine.decide(&scores(0.2, 0.2, 0.2, 0.2, 0.2), 0.6), Decision::Moderate);
        assert_eq!(engine.decide(&scores(1.0, 1.0, 1.0, 1.0, 1.0), 0.59), Decision::Reject);
    }

    #[test]
    fn test_unknown_inputs_use_neutral_and_degrade() {
        let engine = ScoringEngine::default();
        let mut features = scenario_a_features();
        features.top10_percent = None;
        features.deployer_balance_delta = None;

        let score = engine.score(&features);
        assert_eq!(score.factors.whale, 0.5);
        assert_eq!(score.factors.dev, 0.5);
        assert!(score.degraded);
        assert!((score.confidence - 0.6).abs() < 1e-9);
        assert_eq!(score.unknown_factors, vec![Factor::Whale, Factor::Dev]);
    }

    #[test]
    fn test_unknown_confirming_factor_caps_at_moderate() {
        let engine = ScoringEngine::default();
        let mut features = scenario_a_features();
        features.deployer_balance_delta = None;

        let score = engine.score(&features);
        assert_eq!(score.factors.dev, 0.5);
        assert!(score.composite >= 0.8, "composite {}", score.composite);
        assert_eq!(score.decision, Decision::Moderate);
    }

    #[test]
    fn test_factor_scores_in_range_for_extreme_features() {
        let engine = ScoringEngine::default();
        let mut features = scenario_a_features();
        features.return_5m = Some(1e9);
        features.return_1h = Some(-1.0);
        features.volume_to_mcap = Some(1e6);
        features.top10_percent = Some(100.0);
        features.holder_count = Some(u64::MAX);
        features.deployer_balance_delta = Some(-1.0);
        features.age_secs = u64::MAX;

        let score = engine.score(&features);
        for v in [
            score.factors.momentum,
            score.factors.volume_health,
            score.factors.age_bonus,
            score.factors.whale,
            score.factors.dev,
            score.composite,
        ] {
            assert!((0.0..=1.0).contains(&v));
        }
        assert_eq!(score.decision, Decision::Reject);
    }

    #[test]
    fn test_config_validation() {
        assert!(ScoringConfig::default().validate().is_ok());

        let mut config = ScoringConfig::default();
        config.weights.dev = 0.5;
        assert!(config.validate().is_err());

        let mut config = ScoringConfig::default();
        config.thresholds.min_whale = 1.5;
        assert!(config.validate().is_err());
    }
}
