//! DexScreener polling feed
//!
//! Polls the public token endpoint for each watched address and maps the
//! best pair into a `TokenSample`. DexScreener has no holder or deployer
//! data; those fields stay missing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TelemetryFeed;
use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::telemetry::TokenSample;

/// Delay between consecutive token requests within one poll
const REQUEST_SPACING: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
    pub h24: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: String,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DexPair {
    pub chain_id: String,
    pub dex_id: String,
    pub pair_address: String,
    pub base_token: BaseToken,
    pub price_usd: Option<String>,
    pub volume: Option<Volume>,
    pub liquidity: Option<Liquidity>,
    pub market_cap: Option<f64>,
    pub fdv: Option<f64>,
    /// Milliseconds since epoch
    pub pair_created_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairsResponse {
    pub pairs: Option<Vec<DexPair>>,
}

impl DexPair {
    /// Map a pair into a sample. Unparseable values become missing.
    pub fn to_sample(&self, token_id: &str, at: DateTime<Utc>) -> TokenSample {
        let mut sample = TokenSample::new(token_id, at);
        sample.contract_address = Some(self.base_token.address.clone());
        sample.price_usd = self
            .price_usd
            .as_ref()
            .and_then(|p| p.parse::<f64>().ok());
        sample.volume_24h = self.volume.as_ref().and_then(|v| v.h24);
        sample.market_cap_usd = self.market_cap.or(self.fdv);
        sample.liquidity_usd = self.liquidity.as_ref().and_then(|l| l.usd);
        sample.launched_at = self.pair_created_at.and_then(DateTime::from_timestamp_millis);
        sample
    }

    fn liquidity_usd(&self) -> f64 {
        self.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0)
    }
}

/// Pick the deepest pair for a token
pub fn best_pair(pairs: Vec<DexPair>) -> Option<DexPair> {
    pairs
        .into_iter()
        .max_by(|a, b| a.liquidity_usd().total_cmp(&b.liquidity_usd()))
}

/// Polls DexScreener for a fixed watch list
pub struct DexScreenerFeed {
    client: reqwest::Client,
    config: FeedConfig,
    tokens: Vec<String>,
}

impl DexScreenerFeed {
    pub fn new(config: FeedConfig, tokens: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            config,
            tokens,
        })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Fetch the best pair for one token address
    pub async fn fetch(&self, address: &str) -> Result<Option<DexPair>> {
        let url = format!(
            "{}/tokens/{}",
            self.config.dexscreener_url.trim_end_matches('/'),
            address
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Feed(format!(
                "DexScreener returned {} for {}",
                resp.status(),
                address
            )));
        }
        let data: TokenPairsResponse = resp.json().await?;
        Ok(data.pairs.and_then(best_pair))
    }

    async fn poll_once(&self, sink: &mpsc::Sender<TokenSample>) -> std::result::Result<u64, ()> {
        let mut delivered = 0;
        for address in &self.tokens {
            match self.fetch(address).await {
                Ok(Some(pair)) => {
                    let sample = pair.to_sample(address, Utc::now());
                    debug!(
                        token = %address,
                        price = ?sample.price_usd,
                        dex = %pair.dex_id,
                        "DexScreener sample"
                    );
                    if sink.send(sample).await.is_err() {
                        return Err(());
                    }
                    delivered += 1;
                }
                Ok(None) => debug!(token = %address, "No DexScreener pairs"),
                Err(e) => warn!(token = %address, error = %e, "DexScreener poll failed"),
            }
            tokio::time::sleep(REQUEST_SPACING).await;
        }
        Ok(delivered)
    }
}

#[async_trait]
impl TelemetryFeed for DexScreenerFeed {
    fn name(&self) -> &str {
        "dexscreener"
    }

    async fn run(
        &mut self,
        sink: mpsc::Sender<TokenSample>,
        shutdown: CancellationToken,
    ) -> Result<u64> {
        if self.tokens.is_empty() {
            return Err(Error::Feed("watch list is empty".into()));
        }
        info!(
            tokens = self.tokens.len(),
            poll_interval_ms = self.config.poll_interval_ms,
            "Polling DexScreener"
        );

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut delivered = 0u64;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once(&sink).await {
                        Ok(n) => delivered += n,
                        Err(()) => {
                            debug!("Ingest channel closed, DexScreener feed stopped");
                            break;
                        }
                    }
                }
            }
        }
        Ok(delivered)
    }
}
