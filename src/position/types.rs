//! Position model and intents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::execution::FillResult;
use crate::scoring::Decision;

/// Why a position was exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    RugDetected,
    StopLoss,
    TakeProfit,
    TimeLimit,
    /// Orderly engine shutdown
    Shutdown,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExitReason::RugDetected => "RUG_DETECTED",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TimeLimit => "TIME_LIMIT",
            ExitReason::Shutdown => "SHUTDOWN",
        };
        write!(f, "{}", name)
    }
}

/// Position lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "state", content = "reason")]
pub enum PositionState {
    /// Slot reserved, entry not yet filled
    Pending,
    Open,
    Closing(ExitReason),
    Closed,
    /// Capital may still be at risk and the book needs a human
    ReconciliationRequired,
}

impl PositionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed)
    }
}

/// Reservation handed to the execution gateway for an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryIntent {
    /// Becomes the position id on fill
    pub id: String,
    pub token_id: String,
    pub decision: Decision,
    pub size_fraction: f64,
    pub created_at: DateTime<Utc>,
}

impl EntryIntent {
    pub fn new(token_id: &str, decision: Decision, size_fraction: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            token_id: token_id.to_string(),
            decision,
            size_fraction,
            created_at: Utc::now(),
        }
    }
}

/// Exit request for an open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitIntent {
    pub position_id: String,
    pub token_id: String,
    pub reason: ExitReason,
    pub size_fraction: f64,
    pub created_at: DateTime<Utc>,
}

/// Portfolio-level P&L for a position: size * (exit / entry - 1)
pub fn pnl_fraction(size_fraction: f64, entry_price: f64, exit_price: f64) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    size_fraction * (exit_price / entry_price - 1.0)
}

/// A filled position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub token_id: String,
    pub decision: Decision,
    /// Fraction of capital
    pub size_fraction: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub state: PositionState,
    pub exit_reason: Option<ExitReason>,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    /// Realized P&L as a fraction of total capital
    pub realized_pnl_fraction: Option<f64>,
    pub realized_pnl_usd: Option<f64>,
}

impl Position {
    /// Create an OPEN position from a confirmed entry fill
    pub fn from_fill(intent: &EntryIntent, fill: &FillResult) -> Self {
        Self {
            id: intent.id.clone(),
            token_id: intent.token_id.clone(),
            decision: intent.decision,
            size_fraction: intent.size_fraction,
            entry_price: fill.fill_price,
            entry_time: fill.timestamp,
            state: PositionState::Open,
            exit_reason: None,
            exit_price: None,
            exit_time: None,
            realized_pnl_fraction: None,
            realized_pnl_usd: None,
        }
    }

    /// OPEN -> CLOSING(reason)
    pub fn begin_close(&mut self, reason: ExitReason) -> Result<ExitIntent> {
        if self.state != PositionState::Open {
            return Err(Error::InvariantViolation {
                token: self.token_id.clone(),
                detail: format!("cannot close position {} from {:?}", self.id, self.state),
            });
        }
        self.state = PositionState::Closing(reason);
        self.exit_reason = Some(reason);
        Ok(ExitIntent {
            position_id: self.id.clone(),
            token_id: self.token_id.clone(),
            reason,
            size_fraction: self.size_fraction,
            created_at: Utc::now(),
        })
    }

    /// CLOSING -> CLOSED, recording realized P&L. Returns the P&L fraction.
    pub fn close(&mut self, fill: &FillResult, total_capital_usd: f64) -> Result<f64> {
        if !matches!(self.state, PositionState::Closing(_)) {
            return Err(Error::InvariantViolation {
                token: self.token_id.clone(),
                detail: format!("exit fill for position {} in {:?}", self.id, self.state),
            });
        }
        let pnl = pnl_fraction(self.size_fraction, self.entry_price, fill.fill_price);
        self.exit_price = Some(fill.fill_price);
        self.exit_time = Some(fill.timestamp);
        self.realized_pnl_fraction = Some(pnl);
        self.realized_pnl_usd = Some(pnl * total_capital_usd);
        self.state = PositionState::Closed;
        Ok(pnl)
    }

    /// Exit could not be confirmed; park for a human
    pub fn require_reconciliation(&mut self) {
        self.state = PositionState::ReconciliationRequired;
    }

    /// Unrealized return at `price` (0.5 = +50%)
    pub fn unrealized_return(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        price / self.entry_price - 1.0
    }

    /// Exit price over entry price, once closed
    pub fn exit_multiple(&self) -> Option<f64> {
        let exit = self.exit_price?;
        (self.entry_price > 0.0).then(|| exit / self.entry_price)
    }

    pub fn hold_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.entry_time).num_seconds().max(0) as u64
    }
}
