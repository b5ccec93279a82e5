//! Time-bounded, retried gateway calls
//!
//! Every call is wrapped in `tokio::time::timeout` and retried with
//! exponential backoff up to a fixed attempt count. Entries only retry
//! transient failures; exits retry every failure because an unclosed
//! position is the costlier outcome.

use backoff::{future::retry, ExponentialBackoff};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ExecutionGateway, FillResult};
use crate::config::ExecutionConfig;
use crate::error::{Error, Result};
use crate::position::{EntryIntent, ExitIntent};

/// Gateway wrapper applying timeout and retry policy
#[derive(Clone)]
pub struct GatewayExecutor {
    gateway: Arc<dyn ExecutionGateway>,
    config: ExecutionConfig,
}

impl GatewayExecutor {
    pub fn new(gateway: Arc<dyn ExecutionGateway>, config: ExecutionConfig) -> Self {
        Self { gateway, config }
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    /// Place an entry. Failures are returned as-is once retries are spent.
    pub async fn enter(&self, intent: &EntryIntent) -> Result<FillResult> {
        let (result, _) = self
            .run(
                "entry",
                &intent.token_id,
                self.config.entry_max_attempts,
                false,
                || self.gateway.place_entry(intent),
            )
            .await;
        result
    }

    /// Place an exit. Exhausting retries yields `Error::ExitEscalated`.
    pub async fn exit(&self, intent: &ExitIntent) -> Result<FillResult> {
        let (result, attempts) = self
            .run(
                "exit",
                &intent.token_id,
                self.config.exit_max_attempts,
                true,
                || self.gateway.place_exit(intent),
            )
            .await;

        result.map_err(|e| Error::ExitEscalated {
            position: intent.position_id.clone(),
            attempts,
            last_error: e.to_string(),
        })
    }

    async fn run<F, Fut>(
        &self,
        kind: &'static str,
        token_id: &str,
        max_attempts: u32,
        retry_all: bool,
        op: F,
    ) -> (Result<FillResult>, u32)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<FillResult>>,
    {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let attempts = AtomicU32::new(0);
        let max_attempts = max_attempts.max(1);

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.backoff_initial_ms),
            max_interval: Duration::from_millis(self.config.backoff_max_ms),
            max_elapsed_time: None,
            ..Default::default()
        };

        let result = retry(backoff, || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;

            let outcome = match tokio::time::timeout(timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::ExecutionTimeout(self.config.timeout_ms)),
            };

            match outcome {
                Ok(fill) => {
                    debug!(
                        kind,
                        token = %token_id,
                        attempt,
                        price = fill.fill_price,
                        "Fill confirmed"
                    );
                    Ok(fill)
                }
                Err(e) if attempt < max_attempts && (retry_all || e.is_retryable()) => {
                    warn!(
                        kind,
                        token = %token_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Execution attempt failed, retrying"
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await;

        (result, attempts.load(Ordering::SeqCst))
    }
}
