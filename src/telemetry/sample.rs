//! Telemetry sample wire type
//!
//! Every numeric field is optional: a field the feed could not supply is
//! `None`, never zero. Sanitizing additionally demotes malformed values
//! (NaN, infinite, negative, out-of-range) to `None` and reports them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Balance of a single large holder at sample time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderBalance {
    pub address: String,
    pub balance: f64,
}

/// One telemetry observation for a token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSample {
    pub token_id: String,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub price_usd: Option<f64>,
    #[serde(default)]
    pub volume_24h: Option<f64>,
    #[serde(default)]
    pub market_cap_usd: Option<f64>,
    #[serde(default)]
    pub liquidity_usd: Option<f64>,
    #[serde(default)]
    pub holder_count: Option<u64>,
    #[serde(default)]
    pub top10_percent_held: Option<f64>,
    #[serde(default)]
    pub deployer_wallet_balance: Option<f64>,
    /// Per-holder balances for the largest holders, when the feed has them
    #[serde(default)]
    pub top_holders: Option<Vec<HolderBalance>>,
    /// On-chain launch time, when known; discovery time is used otherwise
    #[serde(default)]
    pub launched_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Telemetry fields tracked for data quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleField {
    Price,
    Volume,
    MarketCap,
    Liquidity,
    HolderCount,
    Top10Percent,
    DeployerBalance,
    TopHolders,
}

impl std::fmt::Display for SampleField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SampleField::Price => "price_usd",
            SampleField::Volume => "volume_24h",
            SampleField::MarketCap => "market_cap_usd",
            SampleField::Liquidity => "liquidity_usd",
            SampleField::HolderCount => "holder_count",
            SampleField::Top10Percent => "top10_percent_held",
            SampleField::DeployerBalance => "deployer_wallet_balance",
            SampleField::TopHolders => "top_holders",
        };
        write!(f, "{}", name)
    }
}

/// Why a field did not contribute a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    Missing(SampleField),
    Malformed(SampleField),
}

impl QualityIssue {
    pub fn field(&self) -> SampleField {
        match self {
            QualityIssue::Missing(f) | QualityIssue::Malformed(f) => *f,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, QualityIssue::Malformed(_))
    }
}

fn check(
    value: Option<f64>,
    field: SampleField,
    valid: impl Fn(f64) -> bool,
    issues: &mut Vec<QualityIssue>,
) -> Option<f64> {
    match value {
        None => {
            issues.push(QualityIssue::Missing(field));
            None
        }
        Some(v) if v.is_finite() && valid(v) => Some(v),
        Some(_) => {
            issues.push(QualityIssue::Malformed(field));
            None
        }
    }
}

impl TokenSample {
    /// Minimal sample with every optional field unknown
    pub fn new(token_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            token_id: token_id.into(),
            contract_address: None,
            price_usd: None,
            volume_24h: None,
            market_cap_usd: None,
            liquidity_usd: None,
            holder_count: None,
            top10_percent_held: None,
            deployer_wallet_balance: None,
            top_holders: None,
            launched_at: None,
            timestamp,
        }
    }

    /// Drop malformed values and report every field that is unusable
    pub fn sanitize(mut self) -> (Self, Vec<QualityIssue>) {
        let mut issues = Vec::new();

        self.price_usd = check(self.price_usd, SampleField::Price, |v| v > 0.0, &mut issues);
        self.volume_24h = check(self.volume_24h, SampleField::Volume, |v| v >= 0.0, &mut issues);
        self.market_cap_usd = check(
            self.market_cap_usd,
            SampleField::MarketCap,
            |v| v > 0.0,
            &mut issues,
        );
        self.liquidity_usd = check(
            self.liquidity_usd,
            SampleField::Liquidity,
            |v| v >= 0.0,
            &mut issues,
        );
        self.top10_percent_held = check(
            self.top10_percent_held,
            SampleField::Top10Percent,
            |v| (0.0..=100.0).contains(&v),
            &mut issues,
        );
        self.deployer_wallet_balance = check(
            self.deployer_wallet_balance,
            SampleField::DeployerBalance,
            |v| v >= 0.0,
            &mut issues,
        );

        if self.holder_count.is_none() {
            issues.push(QualityIssue::Missing(SampleField::HolderCount));
        }

        // Holder lists are optional enrichment: absence is not a quality issue
        if let Some(holders) = self.top_holders.take() {
            let total = holders.len();
            let valid: Vec<HolderBalance> = holders
                .into_iter()
                .filter(|h| h.balance.is_finite() && h.balance >= 0.0 && !h.address.is_empty())
                .collect();
            if valid.len() != total {
                issues.push(QualityIssue::Malformed(SampleField::TopHolders));
            }
            self.top_holders = if valid.is_empty() { None } else { Some(valid) };
        }

        (self, issues)
    }
}
