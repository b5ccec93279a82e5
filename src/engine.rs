//! Engine orchestration
//!
//! Wires the tracker, scoring, admission, execution, rug detection and the
//! ledger together and owns every background task:
//! - ingest loop, the only writer of telemetry state
//! - candidate evaluation pipeline
//! - stale candidate eviction
//! - one monitor per open position
//!
//! Shutdown is two-phase: admissions close first, then every open position
//! is flushed with a SHUTDOWN exit before remaining tasks are aborted.

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{EngineEvent, EventBus, PositionEvent};
use crate::execution::{ExecutionGateway, GatewayExecutor};
use crate::ledger::{LedgerRecord, TradeLedger};
use crate::position::{
    Admission, MonitorContext, MonitorOutcome, PortfolioState, Position, PositionManager,
    PositionMonitor, SkipReason,
};
use crate::rug::RugDetector;
use crate::scoring::{Score, ScoringEngine};
use crate::telemetry::{TokenLifecycleTracker, TokenSample, UpdateOutcome};

/// What happened to a scored candidate
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    Opened(Position),
    Skipped(SkipReason),
    Failed(String),
}

/// One pipeline evaluation
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub score: Score,
    pub outcome: EntryOutcome,
}

/// Summary of an orderly shutdown
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub closed: usize,
    pub escalated: usize,
    pub aborted: usize,
}

pub struct Engine {
    config: Config,
    tracker: Arc<TokenLifecycleTracker>,
    scoring: ScoringEngine,
    manager: Arc<PositionManager>,
    detector: Arc<RugDetector>,
    ledger: Arc<TradeLedger>,
    events: EventBus,
    monitor_ctx: Arc<MonitorContext>,
    monitors: Mutex<HashMap<String, JoinHandle<MonitorOutcome>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Sequence each token was last scored at
    last_scored: DashMap<String, u64>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        config: Config,
        tracker: Arc<TokenLifecycleTracker>,
        gateway: Arc<dyn ExecutionGateway>,
        ledger: TradeLedger,
    ) -> Self {
        let manager = Arc::new(PositionManager::new(config.capital.clone()));
        let detector = Arc::new(RugDetector::new(config.rug.clone(), tracker.clone()));
        let ledger = Arc::new(ledger);
        let events = EventBus::new(config.engine.event_channel_capacity);
        let executor = GatewayExecutor::new(gateway, config.execution.clone());

        let monitor_ctx = Arc::new(MonitorContext {
            config: config.monitor.clone(),
            total_capital_usd: config.capital.total_capital_usd,
            tracker: tracker.clone(),
            manager: manager.clone(),
            detector: detector.clone(),
            executor,
            ledger: ledger.clone(),
            events: events.clone(),
        });

        info!(
            gateway = %monitor_ctx.executor.gateway_name(),
            max_positions = config.capital.max_open_positions,
            exposure_ceiling = config.capital.exposure_ceiling,
            "Engine initialized"
        );

        Self {
            scoring: ScoringEngine::new(config.scoring.clone()),
            config,
            tracker,
            manager,
            detector,
            ledger,
            events,
            monitor_ctx,
            monitors: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            last_scored: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn tracker(&self) -> &Arc<TokenLifecycleTracker> {
        &self.tracker
    }

    pub fn manager(&self) -> &Arc<PositionManager> {
        &self.manager
    }

    pub fn ledger(&self) -> &Arc<TradeLedger> {
        &self.ledger
    }

    pub fn detector(&self) -> &Arc<RugDetector> {
        &self.detector
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn portfolio_state(&self) -> PortfolioState {
        self.manager.portfolio_state().await
    }

    /// Positions whose monitor is still running
    pub async fn active_monitors(&self) -> usize {
        self.monitors
            .lock()
            .await
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Apply one sample to the tracker
    pub fn ingest(&self, sample: TokenSample) -> UpdateOutcome {
        self.tracker.update(sample)
    }

    /// Spawn the background loops. Samples sent on the returned channel are
    /// applied in order by a single ingest task.
    pub async fn start(self: &Arc<Self>) -> mpsc::Sender<TokenSample> {
        let (tx, rx) = mpsc::channel(self.config.engine.ingest_channel_capacity.max(1));

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.clone().run_ingest(rx)));
        tasks.push(tokio::spawn(self.clone().run_pipeline()));
        tasks.push(tokio::spawn(self.clone().run_eviction()));

        info!(
            evaluation_interval_ms = self.config.engine.evaluation_interval_ms,
            "Engine started"
        );
        tx
    }

    async fn run_ingest(self: Arc<Self>, mut rx: mpsc::Receiver<TokenSample>) {
        loop {
            let sample = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                sample = rx.recv() => sample,
            };
            match sample {
                Some(sample) => {
                    self.ingest(sample);
                }
                None => {
                    debug!("Telemetry channel closed");
                    break;
                }
            }
        }
    }

    async fn run_pipeline(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.engine.evaluation_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.evaluate_candidates().await;
                }
            }
        }
        debug!("Evaluation pipeline stopped");
    }

    async fn run_eviction(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.tracker.eviction_interval_secs,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; nothing to evict yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.evict_stale().await;
                }
            }
        }
    }

    /// Score every candidate with new data and no position, then try to
    /// enter the ones that qualify. Entries run concurrently; admission is
    /// serialized inside the position manager.
    pub async fn evaluate_candidates(&self) -> Vec<Evaluation> {
        let held = self.manager.held_tokens().await;

        let mut scores = Vec::new();
        for token_id in self.tracker.active_tokens() {
            if held.contains(&token_id) {
                continue;
            }
            let Some(sequence) = self.tracker.sequence(&token_id) else {
                continue;
            };
            if self.last_scored.get(&token_id).map(|s| *s) == Some(sequence) {
                continue;
            }

            let features = match self.tracker.features(&token_id) {
                Ok(features) => features,
                Err(e) => {
                    debug!(token = %token_id, error = %e, "Candidate vanished before scoring");
                    continue;
                }
            };
            self.last_scored.insert(token_id.clone(), sequence);

            let score = self.scoring.score(&features);
            debug!(
                token = %token_id,
                decision = %score.decision,
                composite = score.composite,
                confidence = score.confidence,
                "Candidate scored"
            );
            self.events.publish(EngineEvent::Decision {
                token_id: token_id.clone(),
                decision: score.decision,
                composite: score.composite,
                scores: score.factors,
                degraded: score.degraded,
            });

            if score.decision.allows_entry() {
                scores.push(score);
            }
        }

        join_all(scores.into_iter().map(|score| async move {
            let outcome = self.try_enter(&score).await;
            Evaluation { score, outcome }
        }))
        .await
    }

    /// Admission, execution and booking for one qualifying score
    pub async fn try_enter(&self, score: &Score) -> EntryOutcome {
        let token_id = &score.token_id;

        let intent = match self.manager.evaluate(token_id, score.decision).await {
            Admission::Enter(intent) => intent,
            Admission::Skip(reason) => {
                self.ledger
                    .record(LedgerRecord::Skipped {
                        token_id: token_id.clone(),
                        decision: score.decision,
                        reason: reason.clone(),
                    })
                    .await;
                self.events.publish(EngineEvent::Skipped {
                    token_id: token_id.clone(),
                    decision: score.decision,
                    reason: reason.clone(),
                });
                return EntryOutcome::Skipped(reason);
            }
        };

        self.ledger
            .record(LedgerRecord::EntryIntent {
                intent: intent.clone(),
            })
            .await;

        let fill = match self.monitor_ctx.executor.enter(&intent).await {
            Ok(fill) => fill,
            Err(e) => {
                warn!(
                    token = %token_id,
                    decision = %score.decision,
                    error = %e,
                    "Entry execution failed, intent discarded"
                );
                self.manager.abandon_entry(&intent).await;
                // Eligible again on the next sample
                self.last_scored.remove(token_id);
                self.ledger
                    .record(LedgerRecord::EntryFailed {
                        intent_id: intent.id.clone(),
                        token_id: token_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                self.events.publish(EngineEvent::EntryFailed {
                    token_id: token_id.clone(),
                    error: e.to_string(),
                });
                return EntryOutcome::Failed(e.to_string());
            }
        };

        let position = match self.manager.confirm_entry(&intent, &fill).await {
            Ok(position) => position,
            Err(e) => {
                // The orphaned position carries the intent id
                let position_id = intent.id.clone();
                self.ledger
                    .record(LedgerRecord::ReconciliationRequired {
                        position_id: position_id.clone(),
                        token_id: token_id.clone(),
                        detail: e.to_string(),
                    })
                    .await;
                self.events.publish(EngineEvent::ReconciliationRequired {
                    position_id,
                    token_id: token_id.clone(),
                    detail: e.to_string(),
                });
                return EntryOutcome::Failed(e.to_string());
            }
        };

        self.ledger
            .record(LedgerRecord::EntryFilled {
                position_id: position.id.clone(),
                token_id: token_id.clone(),
                size_fraction: position.size_fraction,
                fill,
            })
            .await;
        self.events.publish(EngineEvent::Position(PositionEvent::Open {
            position_id: position.id.clone(),
            token_id: token_id.clone(),
            decision: position.decision,
            entry_price: position.entry_price,
            size_fraction: position.size_fraction,
        }));

        self.spawn_monitor(position.clone()).await;
        EntryOutcome::Opened(position)
    }

    async fn spawn_monitor(&self, position: Position) {
        let rug_rx = self.detector.watch(&position.token_id);
        let position_id = position.id.clone();
        let handle = PositionMonitor::new(
            position,
            self.monitor_ctx.clone(),
            rug_rx,
            self.shutdown.child_token(),
        )
        .spawn();

        let mut monitors = self.monitors.lock().await;
        monitors.retain(|_, h| !h.is_finished());
        monitors.insert(position_id, handle);
    }

    /// Drop stale candidates that hold no position
    pub async fn evict_stale(&self) -> Vec<String> {
        let Some(now) = self.tracker.watermark() else {
            return Vec::new();
        };
        let held = self.manager.held_tokens().await;
        let evicted = self.tracker.evict_stale(now, |token| held.contains(token));
        for token in &evicted {
            self.last_scored.remove(token);
        }
        evicted
    }

    /// Two-phase shutdown: stop admitting, flush exits, then stop tasks
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutdown phase 1: closing admissions");
        self.manager.close_admissions();

        let open = self.manager.portfolio_state().await.open_positions;
        info!(open_positions = open, "Shutdown phase 2: flushing exits");
        self.shutdown.cancel();

        let handles: Vec<(String, JoinHandle<MonitorOutcome>)> =
            self.monitors.lock().await.drain().collect();
        let deadline = Instant::now() + Duration::from_secs(self.config.engine.shutdown_grace_secs);

        let mut report = ShutdownReport::default();
        for (position_id, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(MonitorOutcome::Closed(_))) => report.closed += 1,
                Ok(Ok(MonitorOutcome::Escalated(_))) => report.escalated += 1,
                Ok(Err(e)) => {
                    error!(position = %position_id, error = %e, "Monitor task failed");
                    report.aborted += 1;
                }
                Err(_) => {
                    error!(
                        position = %position_id,
                        "Exit flush timed out, monitor aborted; reconcile from the ledger"
                    );
                    handle.abort();
                    report.aborted += 1;
                }
            }
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.detector.shutdown();

        info!(
            closed = report.closed,
            escalated = report.escalated,
            aborted = report.aborted,
            "Shutdown complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::execution::testing::{Scripted, ScriptedGateway};
    use crate::position::{ExitReason, PositionState};
    use crate::scoring::Decision;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use tokio_test::assert_ok;

    fn config() -> Config {
        let mut config = Config::default();
        config.monitor.tick_interval_ms = 100;
        config.engine.shutdown_grace_secs = 5;
        config.execution = ExecutionConfig {
            timeout_ms: 50,
            entry_max_attempts: 2,
            exit_max_attempts: 2,
            backoff_initial_ms: 5,
            backoff_max_ms: 10,
            ..Default::default()
        };
        config
    }

    fn engine_with(gateway: Arc<ScriptedGateway>) -> Engine {
        let tracker = Arc::new(TokenLifecycleTracker::new(config().tracker));
        Engine::new(config(), tracker, gateway, TradeLedger::in_memory())
    }

    fn sample(token: &str, at: DateTime<Utc>, launched: DateTime<Utc>, price: f64) -> TokenSample {
        let mut s = TokenSample::new(token, at);
        s.price_usd = Some(price);
        s.volume_24h = Some(30_000.0);
        s.market_cap_usd = Some(100_000.0);
        s.liquidity_usd = Some(50_000.0);
        s.holder_count = Some(1_000);
        s.top10_percent_held = Some(20.0);
        s.deployer_wallet_balance = Some(1_000_000.0);
        s.launched_at = Some(launched);
        s
    }

    /// Two hours of history ending at `now`: +12% over 5m, +25% over 1h,
    /// +60% since launch
    fn feed_scenario_a(engine: &Engine, token: &str, now: DateTime<Utc>) {
        feed_history(engine, token, now, 0.0001);
    }

    fn feed_history(engine: &Engine, token: &str, now: DateTime<Utc>, price: f64) {
        let launched = now - ChronoDuration::hours(2);
        for (offset, p) in [
            (ChronoDuration::hours(2), price / 1.60),
            (ChronoDuration::hours(1), price / 1.25),
            (ChronoDuration::minutes(5), price / 1.12),
            (ChronoDuration::zero(), price),
        ] {
            assert!(engine.ingest(sample(token, now - offset, launched, p)).accepted);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_a_take_profit_end_to_end() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.set_price("tok", 0.0001);
        let engine = engine_with(gateway.clone());
        let mut events = engine.subscribe();
        let now = Utc::now();

        feed_scenario_a(&engine, "tok", now);
        let evaluations = engine.evaluate_candidates().await;
        assert_eq!(evaluations.len(), 1);
        let evaluation = &evaluations[0];
        assert_eq!(evaluation.score.decision, Decision::HighConviction);
        assert!((evaluation.score.composite - 0.85).abs() < 0.01);

        let position = match &evaluation.outcome {
            EntryOutcome::Opened(p) => p.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(position.size_fraction, 0.05);
        assert_eq!(position.entry_price, 0.0001);
        assert!(engine.detector().is_watching("tok"));

        // Price rises 50%
        gateway.set_price("tok", 0.00015);
        let launched = now - ChronoDuration::hours(2);
        engine.ingest(sample("tok", now + ChronoDuration::seconds(30), launched, 0.00015));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = engine.ledger().stats().await;
        assert_eq!(stats.total_trades, 1);
        assert!((stats.realized_pnl_fraction - 0.025).abs() < 1e-9);
        assert!(engine.manager().held_tokens().await.is_empty());
        assert!(!engine.detector().is_watching("tok"));

        let mut closed_reason = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Position(PositionEvent::Closed { reason, .. }) = event {
                closed_reason = Some(reason);
            }
        }
        assert_eq!(closed_reason, Some(ExitReason::TakeProfit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_rug_exit_overrides_stop_loss() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.set_price("tok", 0.001);
        let engine = engine_with(gateway.clone());
        let now = Utc::now();

        feed_history(&engine, "tok", now, 0.001);
        let evaluations = engine.evaluate_candidates().await;
        assert!(matches!(evaluations[0].outcome, EntryOutcome::Opened(_)));

        // -17% inside five minutes on 2.2x volume; also below the stop-loss
        gateway.set_price("tok", 0.00083);
        let mut crash = sample(
            "tok",
            now + ChronoDuration::seconds(60),
            now - ChronoDuration::hours(2),
            0.00083,
        );
        crash.volume_24h = Some(66_000.0);
        engine.ingest(crash);
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let trades = engine.ledger().closed_trades().await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, ExitReason::RugDetected);
        assert!(trades[0].pnl_fraction < 0.0);
        assert!(!engine.detector().is_watching("tok"));
        assert_eq!(engine.active_monitors().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_eleventh_signal_skipped_for_capacity() {
        let gateway = Arc::new(ScriptedGateway::new());
        for i in 0..11 {
            gateway.set_price(&format!("tok{}", i), 0.0001);
        }
        let engine = engine_with(gateway.clone());
        let now = Utc::now();

        for i in 0..10 {
            feed_scenario_a(&engine, &format!("tok{}", i), now);
        }
        let opened = engine
            .evaluate_candidates()
            .await
            .into_iter()
            .filter(|e| matches!(e.outcome, EntryOutcome::Opened(_)))
            .count();
        assert_eq!(opened, 10);

        feed_scenario_a(&engine, "tok10", now);
        let evaluations = engine.evaluate_candidates().await;
        assert_eq!(evaluations.len(), 1);
        match &evaluations[0].outcome {
            EntryOutcome::Skipped(reason) => assert!(reason.is_capacity()),
            other => panic!("unexpected {:?}", other),
        }

        // No entry intent for the eleventh token, one capacity skip recorded
        let entries = engine.ledger().entries_for("tok10").await;
        assert!(entries
            .iter()
            .all(|e| !matches!(e.record, LedgerRecord::EntryIntent { .. })));
        assert_eq!(engine.ledger().stats().await.skipped_capacity, 1);
        assert_eq!(gateway.entry_calls(), 10);
        assert_eq!(engine.portfolio_state().await.open_positions, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_failure_creates_no_position() {
        let gateway = Arc::new(
            ScriptedGateway::new().with_entries(&[Scripted::Transport, Scripted::Transport]),
        );
        let engine = engine_with(gateway.clone());
        feed_scenario_a(&engine, "tok", Utc::now());

        let evaluations = engine.evaluate_candidates().await;
        assert!(matches!(evaluations[0].outcome, EntryOutcome::Failed(_)));
        assert_eq!(gateway.entry_calls(), 2);

        let state = engine.portfolio_state().await;
        assert_eq!(state.total_slots_used, 0);
        assert_eq!(state.exposure_fraction, 0.0);
        assert_eq!(engine.active_monitors().await, 0);
        assert_eq!(engine.ledger().stats().await.entry_failures, 1);
        assert!(!engine.detector().is_watching("tok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_candidate_is_not_rescored() {
        let gateway = Arc::new(ScriptedGateway::new().with_entries(&[Scripted::Reject]));
        gateway.set_price("tok", 0.0001);
        let engine = engine_with(gateway);
        feed_scenario_a(&engine, "tok", Utc::now());

        assert_eq!(engine.evaluate_candidates().await.len(), 1);
        // Failed entry makes the token eligible again
        assert_eq!(engine.evaluate_candidates().await.len(), 1);
        // Now held; nothing left to score
        assert!(engine.evaluate_candidates().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_open_positions() {
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = engine_with(gateway.clone());
        let now = Utc::now();
        for token in ["a", "b"] {
            gateway.set_price(token, 0.0001);
            feed_scenario_a(&engine, token, now);
        }
        engine.evaluate_candidates().await;
        assert_eq!(engine.portfolio_state().await.open_positions, 2);

        let report = engine.shutdown().await;
        assert_eq!(
            report,
            ShutdownReport {
                closed: 2,
                escalated: 0,
                aborted: 0
            }
        );
        assert!(!engine.manager().is_admitting());
        assert!(engine.manager().held_tokens().await.is_empty());

        let trades = engine.ledger().closed_trades().await;
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| t.reason == ExitReason::Shutdown));

        // Admissions stay closed
        feed_scenario_a(&engine, "c", now + ChronoDuration::seconds(1));
        let evaluations = engine.evaluate_candidates().await;
        assert!(matches!(
            evaluations[0].outcome,
            EntryOutcome::Skipped(SkipReason::AdmissionsClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_escalation_keeps_slot() {
        let gateway = Arc::new(ScriptedGateway::new().with_exits(&[Scripted::Reject; 2]));
        let engine = engine_with(gateway.clone());
        gateway.set_price("tok", 0.0001);
        feed_scenario_a(&engine, "tok", Utc::now());
        engine.evaluate_candidates().await;

        let report = engine.shutdown().await;
        assert_eq!(report.escalated, 1);
        assert_eq!(
            engine.manager().slot_state("tok").await,
            Some(PositionState::ReconciliationRequired)
        );
    }

    #[tokio::test]
    async fn test_eviction_ages_by_sample_time() {
        let engine = engine_with(Arc::new(ScriptedGateway::new()));
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        engine.ingest(sample("old", start, start, 0.0001));
        engine.ingest(sample("old", start + ChronoDuration::seconds(5), start, 0.0001));

        // Historical timestamps alone never make a candidate stale
        assert!(engine.evict_stale().await.is_empty());
        assert_eq!(engine.tracker().len(), 1);

        // Telemetry moving 1000s past the last "old" sample does
        let later = start + ChronoDuration::seconds(1_005);
        engine.ingest(sample("fresh", later, later, 0.0001));
        assert_eq!(engine.evict_stale().await, vec!["old".to_string()]);
        assert_eq!(engine.tracker().len(), 1);
        assert!(engine.tracker().snapshot("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loops_ingest_and_enter() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.set_price("tok", 0.0001);
        let engine = Arc::new(engine_with(gateway.clone()));
        let tx = engine.start().await;

        let now = Utc::now();
        let launched = now - ChronoDuration::hours(2);
        for (offset, p) in [
            (ChronoDuration::hours(2), 0.0001 / 1.60),
            (ChronoDuration::hours(1), 0.0001 / 1.25),
            (ChronoDuration::minutes(5), 0.0001 / 1.12),
            (ChronoDuration::zero(), 0.0001),
        ] {
            assert_ok!(tx.send(sample("tok", now - offset, launched, p)).await);
        }

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(engine.portfolio_state().await.open_positions, 1);
        assert_eq!(engine.active_monitors().await, 1);

        let report = engine.shutdown().await;
        assert_eq!(report.closed, 1);
    }
}
