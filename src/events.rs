//! Engine events for external consumers (dashboards, notifiers)

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::position::{ExitReason, SkipReason};
use crate::rug::RugSignal;
use crate::scoring::{Decision, FactorScores};

/// Position lifecycle transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionEvent {
    Open {
        position_id: String,
        token_id: String,
        decision: Decision,
        entry_price: f64,
        size_fraction: f64,
    },
    Closing {
        position_id: String,
        token_id: String,
        reason: ExitReason,
    },
    Closed {
        position_id: String,
        token_id: String,
        reason: ExitReason,
        exit_price: f64,
        pnl_fraction: f64,
        pnl_usd: f64,
    },
}

/// Everything the engine publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Decision {
        token_id: String,
        decision: Decision,
        composite: f64,
        scores: FactorScores,
        degraded: bool,
    },
    Position(PositionEvent),
    Skipped {
        token_id: String,
        decision: Decision,
        reason: SkipReason,
    },
    EntryFailed {
        token_id: String,
        error: String,
    },
    Rug(RugSignal),
    /// Exit retries exhausted; capital is at risk until a human acts
    ManualIntervention {
        position_id: String,
        token_id: String,
        error: String,
    },
    ReconciliationRequired {
        position_id: String,
        token_id: String,
        detail: String,
    },
    DataStale {
        position_id: String,
        token_id: String,
        missed_ticks: u32,
    },
}

/// Broadcast fan-out of engine events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            trace!("Engine event dropped: no subscribers");
        }
    }
}
