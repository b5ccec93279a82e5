//! Paper trading gateway
//!
//! Fills immediately at the tracker's latest known price, moved against the
//! trader by a fixed slippage.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{ExecutionGateway, FillResult};
use crate::error::{Error, Result};
use crate::position::{EntryIntent, ExitIntent};
use crate::telemetry::TokenLifecycleTracker;

pub struct PaperGateway {
    tracker: Arc<TokenLifecycleTracker>,
    slippage_bps: u32,
}

impl PaperGateway {
    pub fn new(tracker: Arc<TokenLifecycleTracker>, slippage_bps: u32) -> Self {
        Self {
            tracker,
            slippage_bps,
        }
    }

    fn slippage(&self) -> f64 {
        self.slippage_bps as f64 / 10_000.0
    }

    fn market_price(&self, token_id: &str) -> Result<f64> {
        self.tracker
            .latest_price(token_id)
            .ok_or_else(|| Error::ExecutionRejected(format!("no market price for {}", token_id)))
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn place_entry(&self, intent: &EntryIntent) -> Result<FillResult> {
        let price = self.market_price(&intent.token_id)? * (1.0 + self.slippage());
        info!(
            token = %intent.token_id,
            size = intent.size_fraction,
            price,
            "[PAPER] Entry filled"
        );
        Ok(FillResult {
            fill_price: price,
            timestamp: Utc::now(),
        })
    }

    async fn place_exit(&self, intent: &ExitIntent) -> Result<FillResult> {
        let price = self.market_price(&intent.token_id)? * (1.0 - self.slippage());
        info!(
            token = %intent.token_id,
            position = %intent.position_id,
            reason = %intent.reason,
            price,
            "[PAPER] Exit filled"
        );
        Ok(FillResult {
            fill_price: price,
            timestamp: Utc::now(),
        })
    }
}
