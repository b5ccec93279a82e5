//! Per-position supervision
//!
//! One monitor task per OPEN position. Each tick evaluates the exit rules
//! in strict precedence: rug signal, stop-loss, take-profit, time limit.
//! Rug signals arrive on the token's broadcast channel and are acted on as
//! soon as they are received. A telemetry gap never forces an exit; after
//! enough consecutive ticks without a new sample a staleness warning is
//! raised and the position is held.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::manager::PositionManager;
use super::types::{ExitReason, Position, PositionState};
use crate::config::MonitorConfig;
use crate::events::{EngineEvent, EventBus, PositionEvent};
use crate::execution::GatewayExecutor;
use crate::ledger::{LedgerRecord, TradeLedger};
use crate::rug::{RugDetector, RugSignal};
use crate::telemetry::TokenLifecycleTracker;

/// Relative slack on price thresholds; decimal prices rarely land exactly
const THRESHOLD_TOLERANCE: f64 = 1e-9;

/// Shared collaborators for every monitor
pub struct MonitorContext {
    pub config: MonitorConfig,
    pub total_capital_usd: f64,
    pub tracker: Arc<TokenLifecycleTracker>,
    pub manager: Arc<PositionManager>,
    pub detector: Arc<RugDetector>,
    pub executor: GatewayExecutor,
    pub ledger: Arc<TradeLedger>,
    pub events: EventBus,
}

/// How a monitor finished
#[derive(Debug, Clone)]
pub enum MonitorOutcome {
    /// Exit filled, P&L recorded
    Closed(Position),
    /// Exit could not be confirmed; a human must reconcile
    Escalated(Position),
}

impl MonitorOutcome {
    pub fn position(&self) -> &Position {
        match self {
            MonitorOutcome::Closed(p) | MonitorOutcome::Escalated(p) => p,
        }
    }
}

/// Exit rules in precedence order. Pure: same inputs, same answer.
pub fn evaluate_exit(
    position: &Position,
    price: Option<f64>,
    held_secs: u64,
    pending_rug: Option<&RugSignal>,
    config: &MonitorConfig,
) -> Option<ExitReason> {
    if pending_rug.is_some() {
        return Some(ExitReason::RugDetected);
    }

    if let Some(price) = price {
        let stop = position.entry_price * config.stop_loss_multiple;
        let target = position.entry_price * config.take_profit_multiple;
        if price <= stop * (1.0 + THRESHOLD_TOLERANCE) {
            return Some(ExitReason::StopLoss);
        }
        if price >= target * (1.0 - THRESHOLD_TOLERANCE) {
            return Some(ExitReason::TakeProfit);
        }
    }

    if held_secs >= config.max_hold_secs {
        return Some(ExitReason::TimeLimit);
    }

    None
}

/// Supervises one open position until it is closed or escalated
pub struct PositionMonitor {
    position: Position,
    ctx: Arc<MonitorContext>,
    rug_rx: broadcast::Receiver<RugSignal>,
    rug_open: bool,
    shutdown: CancellationToken,
    started: Instant,
    last_sequence: Option<u64>,
    missed_ticks: u32,
    pending_rug: Option<RugSignal>,
}

impl PositionMonitor {
    pub fn new(
        position: Position,
        ctx: Arc<MonitorContext>,
        rug_rx: broadcast::Receiver<RugSignal>,
        shutdown: CancellationToken,
    ) -> Self {
        let last_sequence = ctx.tracker.sequence(&position.token_id);
        Self {
            position,
            ctx,
            rug_rx,
            rug_open: true,
            shutdown,
            started: Instant::now(),
            last_sequence,
            missed_ticks: 0,
            pending_rug: None,
        }
    }

    /// Spawn the monitor task
    pub fn spawn(self) -> JoinHandle<MonitorOutcome> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> MonitorOutcome {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
            self.ctx.config.tick_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            position = %self.position.id,
            token = %self.position.token_id,
            entry_price = self.position.entry_price,
            "Position monitor started"
        );

        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Some(ExitReason::Shutdown),
                signal = self.rug_rx.recv(), if self.rug_open => self.on_rug(signal),
                _ = ticker.tick() => self.on_tick(),
            };

            if let Some(reason) = trigger {
                return self.exit(reason).await;
            }
        }
    }

    fn on_rug(&mut self, signal: Result<RugSignal, RecvError>) -> Option<ExitReason> {
        match signal {
            Ok(signal) => {
                warn!(
                    position = %self.position.id,
                    token = %self.position.token_id,
                    rules = ?signal.rule_ids(),
                    strength = signal.strength,
                    "Rug signal received"
                );
                self.ctx.events.publish(EngineEvent::Rug(signal.clone()));
                self.pending_rug = Some(signal);
                self.evaluate()
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(position = %self.position.id, skipped, "Rug signal receiver lagged");
                None
            }
            Err(RecvError::Closed) => {
                warn!(position = %self.position.id, "Rug signal channel closed");
                self.rug_open = false;
                None
            }
        }
    }

    fn on_tick(&mut self) -> Option<ExitReason> {
        let sequence = self.ctx.tracker.sequence(&self.position.token_id);
        if sequence.is_some() && sequence != self.last_sequence {
            self.last_sequence = sequence;
            self.missed_ticks = 0;
        } else {
            self.missed_ticks += 1;
            if self.missed_ticks == self.ctx.config.stale_after_missed_ticks {
                warn!(
                    position = %self.position.id,
                    token = %self.position.token_id,
                    missed_ticks = self.missed_ticks,
                    "Telemetry stale, holding position"
                );
                self.ctx.events.publish(EngineEvent::DataStale {
                    position_id: self.position.id.clone(),
                    token_id: self.position.token_id.clone(),
                    missed_ticks: self.missed_ticks,
                });
            }
        }
        self.evaluate()
    }

    fn evaluate(&mut self) -> Option<ExitReason> {
        let price = self.ctx.tracker.latest_price(&self.position.token_id);
        let held_secs = self.started.elapsed().as_secs();
        let reason = evaluate_exit(
            &self.position,
            price,
            held_secs,
            self.pending_rug.as_ref(),
            &self.ctx.config,
        )?;
        if reason == ExitReason::RugDetected {
            return Some(reason);
        }

        // The watch task may not have assessed the latest sample yet
        if let Some(signal) = self.ctx.detector.probe(&self.position.token_id) {
            warn!(
                position = %self.position.id,
                token = %self.position.token_id,
                rules = ?signal.rule_ids(),
                preempted = %reason,
                "Rug rules fire on the current window"
            );
            self.ctx.events.publish(EngineEvent::Rug(signal.clone()));
            self.pending_rug = Some(signal);
            return Some(ExitReason::RugDetected);
        }
        Some(reason)
    }

    /// OPEN -> CLOSING -> CLOSED, or escalation when the exit never fills
    async fn exit(mut self, reason: ExitReason) -> MonitorOutcome {
        let ctx = self.ctx.clone();
        let token_id = self.position.token_id.clone();
        let position_id = self.position.id.clone();

        let intent = match self.position.begin_close(reason) {
            Ok(intent) => intent,
            Err(e) => {
                error!(position = %position_id, token = %token_id, "{}", e);
                return self.escalate(e.to_string()).await;
            }
        };

        if reason == ExitReason::RugDetected {
            warn!(position = %position_id, token = %token_id, "EMERGENCY EXIT: rug detected");
        } else {
            info!(position = %position_id, token = %token_id, reason = %reason, "Exit triggered");
        }

        ctx.manager
            .set_state(&token_id, &position_id, PositionState::Closing(reason))
            .await;
        ctx.events.publish(EngineEvent::Position(PositionEvent::Closing {
            position_id: position_id.clone(),
            token_id: token_id.clone(),
            reason,
        }));
        ctx.ledger
            .record(LedgerRecord::ExitIntent {
                intent: intent.clone(),
            })
            .await;

        let fill = match ctx.executor.exit(&intent).await {
            Ok(fill) => fill,
            Err(e) => return self.escalate(e.to_string()).await,
        };

        let pnl = match self.position.close(&fill, ctx.total_capital_usd) {
            Ok(pnl) => pnl,
            Err(e) => return self.escalate(e.to_string()).await,
        };
        if let Some(record) = LedgerRecord::exit_filled(&self.position, &fill) {
            ctx.ledger.record(record).await;
        }

        self.unsubscribe();
        ctx.manager.release(&token_id, &position_id).await;

        let pnl_usd = self.position.realized_pnl_usd.unwrap_or_default();
        ctx.events.publish(EngineEvent::Position(PositionEvent::Closed {
            position_id: position_id.clone(),
            token_id: token_id.clone(),
            reason,
            exit_price: fill.fill_price,
            pnl_fraction: pnl,
            pnl_usd,
        }));
        info!(
            position = %position_id,
            token = %token_id,
            reason = %reason,
            exit_price = fill.fill_price,
            pnl_fraction = pnl,
            pnl_usd,
            "Position CLOSED"
        );

        MonitorOutcome::Closed(self.position)
    }

    /// Park the position for a human; the slot stays reserved
    async fn escalate(mut self, error: String) -> MonitorOutcome {
        let ctx = self.ctx.clone();
        let token_id = self.position.token_id.clone();
        let position_id = self.position.id.clone();

        error!(
            position = %position_id,
            token = %token_id,
            error = %error,
            "MANUAL INTERVENTION REQUIRED: exit not confirmed, capital at risk"
        );

        self.position.require_reconciliation();
        self.unsubscribe();
        ctx.manager
            .set_state(&token_id, &position_id, PositionState::ReconciliationRequired)
            .await;

        ctx.ledger
            .record(LedgerRecord::ExitFailed {
                position_id: position_id.clone(),
                token_id: token_id.clone(),
                error: error.clone(),
                escalated: true,
            })
            .await;
        ctx.ledger
            .record(LedgerRecord::ReconciliationRequired {
                position_id: position_id.clone(),
                token_id: token_id.clone(),
                detail: error.clone(),
            })
            .await;

        ctx.events.publish(EngineEvent::ManualIntervention {
            position_id: position_id.clone(),
            token_id: token_id.clone(),
            error: error.clone(),
        });
        ctx.events.publish(EngineEvent::ReconciliationRequired {
            position_id,
            token_id,
            detail: error,
        });

        MonitorOutcome::Escalated(self.position)
    }

    /// Leave the token's rug channel
    fn unsubscribe(&mut self) {
        self.rug_open = false;
        self.ctx.detector.unwatch(&self.position.token_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CapitalConfig, ExecutionConfig, TrackerConfig};
    use crate::execution::testing::{Scripted, ScriptedGateway};
    use crate::execution::FillResult;
    use crate::position::{Admission, EntryIntent};
    use crate::rug::{RugDetectorConfig, RugRule};
    use crate::scoring::Decision;
    use crate::telemetry::TokenSample;
    use chrono::{Duration, Utc};

    fn monitor_config() -> MonitorConfig {
        MonitorConfig {
            tick_interval_ms: 100,
            ..Default::default()
        }
    }

    fn exec_config() -> ExecutionConfig {
        ExecutionConfig {
            timeout_ms: 50,
            exit_max_attempts: 3,
            backoff_initial_ms: 5,
            backoff_max_ms: 10,
            ..Default::default()
        }
    }

    fn push_price(tracker: &TokenLifecycleTracker, token: &str, offset_secs: i64, price: f64) {
        let mut sample = TokenSample::new(token, Utc::now() + Duration::seconds(offset_secs));
        sample.price_usd = Some(price);
        tracker.update(sample);
    }

    async fn setup(gateway: Arc<ScriptedGateway>) -> (Arc<MonitorContext>, Position) {
        let tracker = Arc::new(TokenLifecycleTracker::new(TrackerConfig::default()));
        push_price(&tracker, "tok", 0, 1.0);

        let manager = Arc::new(PositionManager::new(CapitalConfig::default()));
        let intent: EntryIntent = match manager.evaluate("tok", Decision::HighConviction).await {
            Admission::Enter(intent) => intent,
            other => panic!("unexpected {:?}", other),
        };
        let fill = FillResult {
            fill_price: 1.0,
            timestamp: Utc::now(),
        };
        let position = manager.confirm_entry(&intent, &fill).await.unwrap();

        let ctx = Arc::new(MonitorContext {
            config: monitor_config(),
            total_capital_usd: 10_000.0,
            detector: Arc::new(RugDetector::new(RugDetectorConfig::default(), tracker.clone())),
            tracker,
            manager,
            executor: GatewayExecutor::new(gateway, exec_config()),
            ledger: Arc::new(TradeLedger::in_memory()),
            events: EventBus::new(64),
        });
        (ctx, position)
    }

    fn position_at(entry: f64) -> Position {
        let intent = EntryIntent::new("tok", Decision::HighConviction, 0.05);
        Position::from_fill(
            &intent,
            &FillResult {
                fill_price: entry,
                timestamp: Utc::now(),
            },
        )
    }

    fn rug_signal() -> RugSignal {
        RugSignal {
            token_id: "tok".into(),
            signal_type: RugRule::SharpDrop,
            strength: 0.94,
            timestamp: Utc::now(),
            rules: vec![RugRule::SharpDrop, RugRule::VolumeSpikeDrop],
            hits: vec![],
        }
    }

    #[test]
    fn test_exit_precedence() {
        let config = MonitorConfig::default();
        let position = position_at(1.0);
        let rug = rug_signal();

        // Rug beats take-profit on the same tick
        assert_eq!(
            evaluate_exit(&position, Some(1.6), 0, Some(&rug), &config),
            Some(ExitReason::RugDetected)
        );
        // Stop-loss beats time limit
        assert_eq!(
            evaluate_exit(&position, Some(0.85), config.max_hold_secs, None, &config),
            Some(ExitReason::StopLoss)
        );
        // Take-profit beats time limit
        assert_eq!(
            evaluate_exit(&position, Some(1.5), config.max_hold_secs, None, &config),
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(
            evaluate_exit(&position, Some(1.1), config.max_hold_secs, None, &config),
            Some(ExitReason::TimeLimit)
        );
        assert_eq!(evaluate_exit(&position, Some(1.1), 60, None, &config), None);
        // Decimal prices that are equal on paper still trigger
        let small = position_at(0.0001);
        assert_eq!(
            evaluate_exit(&small, Some(0.00015), 60, None, &config),
            Some(ExitReason::TakeProfit)
        );
        // Unknown price only leaves the time limit
        assert_eq!(evaluate_exit(&position, None, 60, None, &config), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_profit_closes_and_releases() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.set_price("tok", 1.5);
        let (ctx, position) = setup(gateway).await;
        let rx = ctx.detector.watch("tok");
        let mut events = ctx.events.subscribe();

        let handle =
            PositionMonitor::new(position, ctx.clone(), rx, CancellationToken::new()).spawn();
        push_price(&ctx.tracker, "tok", 1, 1.5);

        let outcome = handle.await.unwrap();
        let closed = match outcome {
            MonitorOutcome::Closed(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
        assert!((closed.realized_pnl_fraction.unwrap() - 0.025).abs() < 1e-12);

        assert!(ctx.manager.held_tokens().await.is_empty());
        assert!(!ctx.detector.is_watching("tok"));
        assert_eq!(ctx.ledger.stats().await.total_trades, 1);

        let mut saw_closing = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Position(PositionEvent::Closing { reason, .. }) = event {
                assert_eq!(reason, ExitReason::TakeProfit);
                saw_closing = true;
            }
        }
        assert!(saw_closing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rug_signal_preempts_take_profit() {
        let gateway = Arc::new(ScriptedGateway::new());
        let (ctx, position) = setup(gateway).await;
        let (tx, rx) = broadcast::channel(4);

        // Price sits above take-profit, but the rug signal is already queued
        push_price(&ctx.tracker, "tok", 1, 1.6);
        tx.send(rug_signal()).unwrap();

        let outcome = PositionMonitor::new(position, ctx.clone(), rx, CancellationToken::new())
            .run()
            .await;
        assert_eq!(outcome.position().exit_reason, Some(ExitReason::RugDetected));
        assert_eq!(outcome.position().state, PositionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_data_warns_without_exit() {
        let gateway = Arc::new(ScriptedGateway::new());
        let (ctx, position) = setup(gateway).await;
        let rx = ctx.detector.watch("tok");
        let mut events = ctx.events.subscribe();
        let shutdown = CancellationToken::new();

        let handle = PositionMonitor::new(position, ctx.clone(), rx, shutdown.clone()).spawn();
        tokio::time::sleep(std::time::Duration::from_millis(450)).await;

        let mut stale = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::DataStale { missed_ticks, .. } => {
                    assert_eq!(missed_ticks, 3);
                    stale += 1;
                }
                EngineEvent::Position(PositionEvent::Closing { .. }) => {
                    panic!("exited on stale data")
                }
                _ => {}
            }
        }
        assert_eq!(stale, 1);
        assert_eq!(ctx.manager.slot_state("tok").await, Some(PositionState::Open));

        shutdown.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.position().exit_reason, Some(ExitReason::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_exhaustion_escalates_and_keeps_slot() {
        let gateway = Arc::new(ScriptedGateway::new().with_exits(&[Scripted::Transport; 5]));
        let (ctx, position) = setup(gateway.clone()).await;
        let rx = ctx.detector.watch("tok");
        let mut events = ctx.events.subscribe();

        push_price(&ctx.tracker, "tok", 1, 0.8);
        let outcome = PositionMonitor::new(position, ctx.clone(), rx, CancellationToken::new())
            .run()
            .await;

        let parked = match outcome {
            MonitorOutcome::Escalated(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(parked.state, PositionState::ReconciliationRequired);
        assert_eq!(gateway.exit_calls(), 3);
        assert_eq!(
            ctx.manager.slot_state("tok").await,
            Some(PositionState::ReconciliationRequired)
        );
        assert_eq!(ctx.manager.portfolio_state().await.reconciliation_required, 1);
        assert_eq!(ctx.ledger.stats().await.escalations, 1);
        assert!(!ctx.detector.is_watching("tok"));

        let mut manual = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::ManualIntervention { .. }) {
                manual = true;
            }
        }
        assert!(manual);
    }
}
