//! Execution gateway boundary
//!
//! The venue wire protocol lives behind `ExecutionGateway`. The engine only
//! talks to gateways through `GatewayExecutor`, which adds the timeout and
//! bounded retry policy.

pub mod executor;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::position::{EntryIntent, ExitIntent};

pub use executor::GatewayExecutor;
pub use paper::PaperGateway;

/// Confirmed fill from the venue
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillResult {
    pub fill_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Execution venue (DEX, broker, simulator)
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Gateway name for logs
    fn name(&self) -> &str;

    /// Open a position of `intent.size_fraction` of capital
    async fn place_entry(&self, intent: &EntryIntent) -> Result<FillResult>;

    /// Close the whole position
    async fn place_exit(&self, intent: &ExitIntent) -> Result<FillResult>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable gateway for tests

    use super::*;
    use crate::error::Error;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// One scripted response
    #[derive(Debug, Clone, Copy)]
    pub enum Scripted {
        Fill(f64),
        Transport,
        Reject,
        Hang,
    }

    #[derive(Default)]
    pub struct ScriptedGateway {
        entries: Mutex<VecDeque<Scripted>>,
        exits: Mutex<VecDeque<Scripted>>,
        prices: Mutex<HashMap<String, f64>>,
        entry_calls: AtomicU32,
        exit_calls: AtomicU32,
    }

    impl ScriptedGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_entries(self, script: &[Scripted]) -> Self {
            self.entries.lock().unwrap().extend(script.iter().copied());
            self
        }

        pub fn with_exits(self, script: &[Scripted]) -> Self {
            self.exits.lock().unwrap().extend(script.iter().copied());
            self
        }

        /// Price used once a script runs out
        pub fn set_price(&self, token_id: &str, price: f64) {
            self.prices
                .lock()
                .unwrap()
                .insert(token_id.to_string(), price);
        }

        pub fn entry_calls(&self) -> u32 {
            self.entry_calls.load(Ordering::SeqCst)
        }

        pub fn exit_calls(&self) -> u32 {
            self.exit_calls.load(Ordering::SeqCst)
        }

        async fn respond(&self, next: Option<Scripted>, token_id: &str) -> Result<FillResult> {
            let fallback = self.prices.lock().unwrap().get(token_id).copied().unwrap_or(1.0);
            match next.unwrap_or(Scripted::Fill(fallback)) {
                Scripted::Fill(price) => Ok(FillResult {
                    fill_price: price,
                    timestamp: Utc::now(),
                }),
                Scripted::Transport => Err(Error::ExecutionTransport("connection reset".into())),
                Scripted::Reject => Err(Error::ExecutionRejected("venue rejected order".into())),
                Scripted::Hang => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl ExecutionGateway for ScriptedGateway {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn place_entry(&self, intent: &EntryIntent) -> Result<FillResult> {
            self.entry_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.entries.lock().unwrap().pop_front();
            self.respond(next, &intent.token_id).await
        }

        async fn place_exit(&self, intent: &ExitIntent) -> Result<FillResult> {
            self.exit_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.exits.lock().unwrap().pop_front();
            self.respond(next, &intent.token_id).await
        }
    }
}
