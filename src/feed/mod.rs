//! Telemetry sources
//!
//! A feed pushes `TokenSample`s into the engine's ingest channel until it is
//! exhausted or cancelled.

pub mod dexscreener;
pub mod replay;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::telemetry::TokenSample;

pub use dexscreener::{DexPair, DexScreenerFeed};
pub use replay::{ReplayFeed, ReplayLog};

#[async_trait]
pub trait TelemetryFeed: Send {
    fn name(&self) -> &str;

    /// Deliver samples to `sink`. Returns the number delivered.
    async fn run(
        &mut self,
        sink: mpsc::Sender<TokenSample>,
        shutdown: CancellationToken,
    ) -> Result<u64>;
}
