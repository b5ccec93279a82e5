//! Trade ledger
//!
//! Append-only record of every intent, fill, failure and realized P&L. It
//! is the reconciliation source of truth when the engine stops abruptly, so
//! entries are optionally mirrored to a JSONL journal as they are appended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::execution::FillResult;
use crate::position::{EntryIntent, ExitIntent, ExitReason, Position, SkipReason};
use crate::scoring::Decision;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerRecord {
    EntryIntent {
        intent: EntryIntent,
    },
    EntryFilled {
        position_id: String,
        token_id: String,
        size_fraction: f64,
        fill: FillResult,
    },
    EntryFailed {
        intent_id: String,
        token_id: String,
        error: String,
    },
    Skipped {
        token_id: String,
        decision: Decision,
        reason: SkipReason,
    },
    ExitIntent {
        intent: ExitIntent,
    },
    ExitFilled {
        position_id: String,
        token_id: String,
        reason: ExitReason,
        size_fraction: f64,
        entry_price: f64,
        fill: FillResult,
        pnl_fraction: f64,
        pnl_usd: f64,
    },
    ExitFailed {
        position_id: String,
        token_id: String,
        error: String,
        /// Retries exhausted and the position was escalated
        escalated: bool,
    },
    ReconciliationRequired {
        position_id: String,
        token_id: String,
        detail: String,
    },
}

impl LedgerRecord {
    pub fn token_id(&self) -> &str {
        match self {
            LedgerRecord::EntryIntent { intent } => &intent.token_id,
            LedgerRecord::ExitIntent { intent } => &intent.token_id,
            LedgerRecord::EntryFilled { token_id, .. }
            | LedgerRecord::EntryFailed { token_id, .. }
            | LedgerRecord::Skipped { token_id, .. }
            | LedgerRecord::ExitFilled { token_id, .. }
            | LedgerRecord::ExitFailed { token_id, .. }
            | LedgerRecord::ReconciliationRequired { token_id, .. } => token_id,
        }
    }

    /// Record for a closed position
    pub fn exit_filled(position: &Position, fill: &FillResult) -> Option<Self> {
        Some(LedgerRecord::ExitFilled {
            position_id: position.id.clone(),
            token_id: position.token_id.clone(),
            reason: position.exit_reason?,
            size_fraction: position.size_fraction,
            entry_price: position.entry_price,
            fill: *fill,
            pnl_fraction: position.realized_pnl_fraction?,
            pnl_usd: position.realized_pnl_usd?,
        })
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: LedgerRecord,
}

/// A completed round trip
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub position_id: String,
    pub token_id: String,
    pub reason: ExitReason,
    pub size_fraction: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_fraction: f64,
    pub pnl_usd: f64,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn exit_multiple(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.exit_price / self.entry_price
    }
}

/// Aggregate trading statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub realized_pnl_fraction: f64,
    pub realized_pnl_usd: f64,
    pub average_exit_multiple: f64,
    pub skipped_capacity: u32,
    pub entry_failures: u32,
    pub escalations: u32,
}

impl LedgerStats {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        (self.winning_trades as f64 / self.total_trades as f64) * 100.0
    }
}

struct Inner {
    /// Entries appended by this process
    entries: Vec<LedgerEntry>,
    /// Highest sequence number issued, including earlier journal runs
    last_seq: u64,
    journal: Option<tokio::fs::File>,
}

/// Append-only trade ledger
pub struct TradeLedger {
    inner: Mutex<Inner>,
    journal_path: Option<PathBuf>,
}

impl TradeLedger {
    /// In-memory ledger
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                last_seq: 0,
                journal: None,
            }),
            journal_path: None,
        }
    }

    /// Ledger mirrored to an append-only JSONL journal.
    ///
    /// Reopening an existing journal continues its sequence numbers; only
    /// entries appended by this process are held in memory.
    pub async fn with_journal<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::Ledger(format!("{}: {}", path.display(), e)))?;
        let last_seq = if exists {
            Self::read_journal(&path)
                .await?
                .iter()
                .map(|e| e.seq)
                .max()
                .unwrap_or(0)
        } else {
            0
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Ledger(format!("{}: {}", path.display(), e)))?;

        info!(last_seq, "Trade ledger journal: {}", path.display());
        Ok(Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                last_seq,
                journal: Some(file),
            }),
            journal_path: Some(path),
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    /// Append a record. The entry is kept in memory even if the journal
    /// write fails; the failure is returned for the caller to log.
    pub async fn append(&self, record: LedgerRecord) -> Result<LedgerEntry> {
        let mut inner = self.inner.lock().await;
        inner.last_seq += 1;
        let entry = LedgerEntry {
            seq: inner.last_seq,
            recorded_at: Utc::now(),
            record,
        };
        inner.entries.push(entry.clone());

        if let Some(journal) = inner.journal.as_mut() {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            let written = async {
                journal.write_all(line.as_bytes()).await?;
                journal.flush().await
            }
            .await;
            if let Err(e) = written {
                error!(seq = entry.seq, "Ledger journal write failed: {}", e);
                return Err(Error::Ledger(e.to_string()));
            }
        }

        debug!(seq = entry.seq, token = %entry.record.token_id(), "Ledger entry appended");
        Ok(entry)
    }

    /// Append, logging instead of propagating journal failures
    pub async fn record(&self, record: LedgerRecord) {
        if let Err(e) = self.append(record).await {
            error!("Trade ledger append failed: {}", e);
        }
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.lock().await.entries.clone()
    }

    pub async fn entries_for(&self, token_id: &str) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|e| e.record.token_id() == token_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn closed_trades(&self) -> Vec<ClosedTrade> {
        closed_trades(&self.inner.lock().await.entries)
    }

    pub async fn stats(&self) -> LedgerStats {
        stats(&self.inner.lock().await.entries)
    }

    /// Read a journal back, skipping lines that do not parse
    pub async fn read_journal<P: AsRef<Path>>(path: P) -> Result<Vec<LedgerEntry>> {
        let data = tokio::fs::read_to_string(path.as_ref()).await?;
        let mut entries = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => error!(line = line_no + 1, "Unreadable ledger journal line: {}", e),
            }
        }
        Ok(entries)
    }
}

/// Closed trades in ledger order
pub fn closed_trades(entries: &[LedgerEntry]) -> Vec<ClosedTrade> {
    entries
        .iter()
        .filter_map(|e| match &e.record {
            LedgerRecord::ExitFilled {
                position_id,
                token_id,
                reason,
                size_fraction,
                entry_price,
                fill,
                pnl_fraction,
                pnl_usd,
            } => Some(ClosedTrade {
                position_id: position_id.clone(),
                token_id: token_id.clone(),
                reason: *reason,
                size_fraction: *size_fraction,
                entry_price: *entry_price,
                exit_price: fill.fill_price,
                pnl_fraction: *pnl_fraction,
                pnl_usd: *pnl_usd,
                closed_at: fill.timestamp,
            }),
            _ => None,
        })
        .collect()
}

/// Aggregate statistics over ledger entries
pub fn stats(entries: &[LedgerEntry]) -> LedgerStats {
    let mut stats = LedgerStats::default();
    let trades = closed_trades(entries);

    for trade in &trades {
        stats.total_trades += 1;
        if trade.pnl_fraction >= 0.0 {
            stats.winning_trades += 1;
        } else {
            stats.losing_trades += 1;
        }
        stats.realized_pnl_fraction += trade.pnl_fraction;
        stats.realized_pnl_usd += trade.pnl_usd;
    }
    if !trades.is_empty() {
        stats.average_exit_multiple =
            trades.iter().map(ClosedTrade::exit_multiple).sum::<f64>() / trades.len() as f64;
    }

    for entry in entries {
        match &entry.record {
            LedgerRecord::Skipped { reason, .. } if reason.is_capacity() => {
                stats.skipped_capacity += 1
            }
            LedgerRecord::EntryFailed { .. } => stats.entry_failures += 1,
            LedgerRecord::ExitFailed { escalated: true, .. } => stats.escalations += 1,
            _ => {}
        }
    }
    stats
}
