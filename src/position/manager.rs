//! Position admission control
//!
//! The open-position count and aggregate exposure are one authoritative
//! resource guarded by a single mutex. Every admission runs the full
//! check-and-reserve sequence inside that critical section, so two
//! simultaneous signals can never both observe the last free slot.
//! Pending reservations count toward both limits.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::types::{EntryIntent, Position, PositionState};
use crate::config::{CapitalConfig, MAX_SINGLE_POSITION_FRACTION};
use crate::error::{Error, Result};
use crate::execution::FillResult;
use crate::scoring::Decision;

const EXPOSURE_EPSILON: f64 = 1e-9;

/// Why an admission was skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Decision was REJECT
    Rejected,
    /// Engine is shutting down
    AdmissionsClosed,
    /// Token already has a pending or open position
    AlreadyHeld { token_id: String },
    /// Maximum number of concurrent positions reached
    MaxPositionsReached { current: usize, max: usize },
    /// Requested size would push exposure past the ceiling
    MaxExposureReached {
        current: f64,
        requested: f64,
        ceiling: f64,
    },
}

impl SkipReason {
    /// Get human-readable description
    pub fn description(&self) -> String {
        match self {
            SkipReason::Rejected => "Decision rejected".to_string(),
            SkipReason::AdmissionsClosed => "Admissions closed".to_string(),
            SkipReason::AlreadyHeld { token_id } => {
                format!("Position already held in {}", token_id)
            }
            SkipReason::MaxPositionsReached { current, max } => {
                format!("Max positions reached: {}/{}", current, max)
            }
            SkipReason::MaxExposureReached {
                current,
                requested,
                ceiling,
            } => format!(
                "Max exposure reached: {:.3} + {:.3} > {:.3}",
                current, requested, ceiling
            ),
        }
    }

    /// Capacity skips are logged as SKIPPED_CAPACITY
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            SkipReason::MaxPositionsReached { .. } | SkipReason::MaxExposureReached { .. }
        )
    }
}

/// Admission outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Enter(EntryIntent),
    Skip(SkipReason),
}

/// Current portfolio state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub open_positions: usize,
    pub pending_entries: usize,
    pub closing_positions: usize,
    pub reconciliation_required: usize,
    /// All slots in use, including pending
    pub total_slots_used: usize,
    pub max_positions: usize,
    pub remaining_slots: usize,
    /// Aggregate size across every slot (fraction of capital)
    pub exposure_fraction: f64,
    pub exposure_ceiling: f64,
    pub remaining_capacity: f64,
    pub admitting: bool,
}

#[derive(Debug, Clone)]
enum Slot {
    Pending(EntryIntent),
    Held {
        position_id: String,
        size_fraction: f64,
        state: PositionState,
    },
}

impl Slot {
    fn size(&self) -> f64 {
        match self {
            Slot::Pending(intent) => intent.size_fraction,
            Slot::Held { size_fraction, .. } => *size_fraction,
        }
    }

    fn state(&self) -> PositionState {
        match self {
            Slot::Pending(_) => PositionState::Pending,
            Slot::Held { state, .. } => *state,
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    slots: HashMap<String, Slot>,
    /// Fills that could not be booked normally; never dropped
    orphans: Vec<Position>,
}

impl Book {
    fn exposure(&self) -> f64 {
        self.slots.values().map(Slot::size).sum()
    }
}

/// Admission control, sizing and exposure enforcement
pub struct PositionManager {
    config: CapitalConfig,
    book: Mutex<Book>,
    admitting: AtomicBool,
}

impl PositionManager {
    pub fn new(config: CapitalConfig) -> Self {
        Self {
            config,
            book: Mutex::new(Book::default()),
            admitting: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &CapitalConfig {
        &self.config
    }

    /// Position size for a decision, clamped to the single-position ceiling
    pub fn size_for(&self, decision: Decision) -> Option<f64> {
        let requested = match decision {
            Decision::HighConviction => self.config.high_conviction_fraction,
            Decision::Moderate => self.config.moderate_fraction,
            Decision::Reject => return None,
        };
        let ceiling = self
            .config
            .max_position_fraction
            .min(MAX_SINGLE_POSITION_FRACTION);
        Some(requested.min(ceiling))
    }

    /// Check-and-reserve. On `Enter` the slot and exposure are already held
    /// by the returned intent until `confirm_entry` or `abandon_entry`.
    pub async fn evaluate(&self, token_id: &str, decision: Decision) -> Admission {
        let Some(size) = self.size_for(decision) else {
            return Admission::Skip(SkipReason::Rejected);
        };

        let mut book = self.book.lock().await;

        if !self.admitting.load(Ordering::SeqCst) {
            debug!(token = %token_id, "Admission refused: shutting down");
            return Admission::Skip(SkipReason::AdmissionsClosed);
        }

        if book.slots.contains_key(token_id) {
            debug!(token = %token_id, "Admission refused: already held");
            return Admission::Skip(SkipReason::AlreadyHeld {
                token_id: token_id.to_string(),
            });
        }

        let current = book.slots.len();
        if current >= self.config.max_open_positions {
            let reason = SkipReason::MaxPositionsReached {
                current,
                max: self.config.max_open_positions,
            };
            info!(
                token = %token_id,
                decision = %decision,
                reason = %reason.description(),
                "SKIPPED_CAPACITY"
            );
            return Admission::Skip(reason);
        }

        let exposure = book.exposure();
        if exposure + size > self.config.exposure_ceiling + EXPOSURE_EPSILON {
            let reason = SkipReason::MaxExposureReached {
                current: exposure,
                requested: size,
                ceiling: self.config.exposure_ceiling,
            };
            info!(
                token = %token_id,
                decision = %decision,
                reason = %reason.description(),
                "SKIPPED_CAPACITY"
            );
            return Admission::Skip(reason);
        }

        let intent = EntryIntent::new(token_id, decision, size);
        book.slots
            .insert(token_id.to_string(), Slot::Pending(intent.clone()));

        info!(
            token = %token_id,
            decision = %decision,
            size = size,
            slots = book.slots.len(),
            exposure = exposure + size,
            "Entry reserved"
        );
        Admission::Enter(intent)
    }

    /// Turn a reservation into an OPEN position after a confirmed fill.
    ///
    /// A fill that does not match its reservation is an invariant
    /// violation: the filled position is parked as reconciliation-required
    /// (see `orphans()`) and an error is returned.
    pub async fn confirm_entry(&self, intent: &EntryIntent, fill: &FillResult) -> Result<Position> {
        let mut book = self.book.lock().await;
        let mut position = Position::from_fill(intent, fill);

        let reserved = matches!(
            book.slots.get(&intent.token_id),
            Some(Slot::Pending(pending)) if pending.id == intent.id
        );
        let current = book.slots.get(&intent.token_id).map(Slot::state);

        match current {
            Some(_) if reserved => {
                book.slots.insert(
                    intent.token_id.clone(),
                    Slot::Held {
                        position_id: position.id.clone(),
                        size_fraction: position.size_fraction,
                        state: PositionState::Open,
                    },
                );
                info!(
                    token = %intent.token_id,
                    position = %position.id,
                    entry_price = fill.fill_price,
                    size = intent.size_fraction,
                    "Position OPEN"
                );
                Ok(position)
            }
            other => {
                let detail = match other {
                    Some(state) => format!(
                        "fill for intent {} while token slot is {:?}",
                        intent.id, state
                    ),
                    None => format!("fill for intent {} without a reservation", intent.id),
                };
                error!(
                    token = %intent.token_id,
                    position = %position.id,
                    detail = %detail,
                    "INVARIANT VIOLATION - position requires reconciliation"
                );
                position.require_reconciliation();
                book.orphans.push(position);
                Err(Error::InvariantViolation {
                    token: intent.token_id.clone(),
                    detail,
                })
            }
        }
    }

    /// Drop a reservation whose entry failed
    pub async fn abandon_entry(&self, intent: &EntryIntent) {
        let mut book = self.book.lock().await;
        let matches = matches!(
            book.slots.get(&intent.token_id),
            Some(Slot::Pending(p)) if p.id == intent.id
        );
        if matches {
            book.slots.remove(&intent.token_id);
            debug!(token = %intent.token_id, "Entry reservation released");
        }
    }

    /// Update the state recorded for a held position
    pub async fn set_state(&self, token_id: &str, position_id: &str, new_state: PositionState) {
        let mut book = self.book.lock().await;
        match book.slots.get_mut(token_id) {
            Some(Slot::Held {
                position_id: held,
                state,
                ..
            }) if held == position_id => *state = new_state,
            _ => warn!(
                token = %token_id,
                position = %position_id,
                "State update for unknown position"
            ),
        }
    }

    /// Free the slot of a closed position
    pub async fn release(&self, token_id: &str, position_id: &str) {
        let mut book = self.book.lock().await;
        let matches = matches!(
            book.slots.get(token_id),
            Some(Slot::Held { position_id: held, .. }) if held == position_id
        );
        if matches {
            book.slots.remove(token_id);
            debug!(token = %token_id, position = %position_id, "Position slot released");
        }
    }

    /// Stop admitting new positions
    pub fn close_admissions(&self) {
        if self.admitting.swap(false, Ordering::SeqCst) {
            info!("Position admissions closed");
        }
    }

    pub fn is_admitting(&self) -> bool {
        self.admitting.load(Ordering::SeqCst)
    }

    /// State of the slot held for a token, if any
    pub async fn slot_state(&self, token_id: &str) -> Option<PositionState> {
        self.book.lock().await.slots.get(token_id).map(Slot::state)
    }

    /// Tokens with a pending or held position
    pub async fn held_tokens(&self) -> HashSet<String> {
        self.book.lock().await.slots.keys().cloned().collect()
    }

    /// Positions that could not be booked and need a human
    pub async fn orphans(&self) -> Vec<Position> {
        self.book.lock().await.orphans.clone()
    }

    /// Snapshot of the portfolio
    pub async fn portfolio_state(&self) -> PortfolioState {
        let book = self.book.lock().await;
        let mut state = PortfolioState {
            max_positions: self.config.max_open_positions,
            exposure_ceiling: self.config.exposure_ceiling,
            admitting: self.is_admitting(),
            ..Default::default()
        };

        for slot in book.slots.values() {
            match slot.state() {
                PositionState::Pending => state.pending_entries += 1,
                PositionState::Open => state.open_positions += 1,
                PositionState::Closing(_) => state.closing_positions += 1,
                PositionState::ReconciliationRequired => state.reconciliation_required += 1,
                PositionState::Closed => {}
            }
        }

        state.total_slots_used = book.slots.len();
        state.remaining_slots = self
            .config
            .max_open_positions
            .saturating_sub(state.total_slots_used);
        state.exposure_fraction = book.exposure();
        state.remaining_capacity =
            (self.config.exposure_ceiling - state.exposure_fraction).max(0.0);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn manager() -> PositionManager {
        PositionManager::new(CapitalConfig::default())
    }

    fn fill(price: f64) -> FillResult {
        FillResult {
            fill_price: price,
            timestamp: Utc::now(),
        }
    }

    async fn open(manager: &PositionManager, token: &str) -> Position {
        match manager.evaluate(token, Decision::HighConviction).await {
            Admission::Enter(intent) => manager.confirm_entry(&intent, &fill(1.0)).await.unwrap(),
            Admission::Skip(reason) => panic!("unexpected skip: {:?}", reason),
        }
    }

    #[tokio::test]
    async fn test_sizing_by_decision() {
        let manager = manager();
        assert_eq!(manager.size_for(Decision::HighConviction), Some(0.05));
        assert_eq!(manager.size_for(Decision::Moderate), Some(0.02));
        assert_eq!(manager.size_for(Decision::Reject), None);

        match manager.evaluate("mod", Decision::Moderate).await {
            Admission::Enter(intent) => assert_eq!(intent.size_fraction, 0.02),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_size_never_exceeds_single_position_cap() {
        let config = CapitalConfig {
            high_conviction_fraction: 0.2,
            max_position_fraction: 0.3,
            ..Default::default()
        };
        let manager = PositionManager::new(config);
        assert_eq!(manager.size_for(Decision::HighConviction), Some(0.05));
    }

    #[tokio::test]
    async fn test_reject_never_reserves() {
        let manager = manager();
        assert_eq!(
            manager.evaluate("tok", Decision::Reject).await,
            Admission::Skip(SkipReason::Rejected)
        );
        assert_eq!(manager.portfolio_state().await.total_slots_used, 0);
    }

    #[tokio::test]
    async fn test_one_position_per_token() {
        let manager = manager();
        open(&manager, "tok").await;
        assert!(matches!(
            manager.evaluate("tok", Decision::HighConviction).await,
            Admission::Skip(SkipReason::AlreadyHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_eleventh_position_skipped_for_capacity() {
        let manager = manager();
        for i in 0..10 {
            open(&manager, &format!("tok{}", i)).await;
        }
        let state = manager.portfolio_state().await;
        assert_eq!(state.open_positions, 10);
        assert_eq!(state.remaining_slots, 0);

        let admission = manager.evaluate("tok10", Decision::HighConviction).await;
        match admission {
            Admission::Skip(reason) => {
                assert!(reason.is_capacity());
                assert_eq!(reason, SkipReason::MaxPositionsReached { current: 10, max: 10 });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exposure_ceiling() {
        let config = CapitalConfig {
            exposure_ceiling: 0.12,
            ..Default::default()
        };
        let manager = PositionManager::new(config);
        open(&manager, "a").await;
        open(&manager, "b").await;

        // 0.10 used, 0.05 more would breach 0.12
        assert!(matches!(
            manager.evaluate("c", Decision::HighConviction).await,
            Admission::Skip(SkipReason::MaxExposureReached { .. })
        ));
        // 0.02 fits exactly
        assert!(matches!(
            manager.evaluate("c", Decision::Moderate).await,
            Admission::Enter(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_respect_last_slot() {
        let manager = Arc::new(manager());
        for i in 0..9 {
            open(&manager, &format!("held{}", i)).await;
        }

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .evaluate(&format!("new{}", i), Decision::HighConviction)
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let admitted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Admission::Enter(_))))
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(manager.portfolio_state().await.total_slots_used, 10);
    }

    #[tokio::test]
    async fn test_abandon_entry_frees_slot() {
        let manager = manager();
        let intent = match manager.evaluate("tok", Decision::HighConviction).await {
            Admission::Enter(intent) => intent,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(manager.portfolio_state().await.pending_entries, 1);

        manager.abandon_entry(&intent).await;
        let state = manager.portfolio_state().await;
        assert_eq!(state.total_slots_used, 0);
        assert_eq!(state.exposure_fraction, 0.0);
    }

    #[tokio::test]
    async fn test_mismatched_fill_requires_reconciliation() {
        let manager = manager();
        open(&manager, "tok").await;

        let stray = EntryIntent::new("tok", Decision::HighConviction, 0.05);
        let result = manager.confirm_entry(&stray, &fill(1.0)).await;
        assert!(matches!(result, Err(Error::InvariantViolation { .. })));

        let orphans = manager.orphans().await;
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].state, PositionState::ReconciliationRequired);
        // The original position is untouched
        assert_eq!(manager.slot_state("tok").await, Some(PositionState::Open));
    }

    #[tokio::test]
    async fn test_release_and_close_admissions() {
        let manager = manager();
        let position = open(&manager, "tok").await;
        manager.release("tok", &position.id).await;
        assert!(manager.held_tokens().await.is_empty());

        manager.close_admissions();
        assert_eq!(
            manager.evaluate("tok", Decision::HighConviction).await,
            Admission::Skip(SkipReason::AdmissionsClosed)
        );
        assert!(!manager.portfolio_state().await.admitting);
    }
}
