//! CLI command implementations

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::events::EngineEvent;
use crate::execution::PaperGateway;
use crate::feed::{DexScreenerFeed, ReplayFeed, ReplayLog, TelemetryFeed};
use crate::ledger::{LedgerStats, TradeLedger};
use crate::position::PortfolioState;
use crate::scoring::ScoringEngine;
use crate::telemetry::TokenLifecycleTracker;

/// Replay a JSONL telemetry file through the engine with paper execution
pub async fn replay(config: &Config, file: &Path, paced: bool) -> Result<()> {
    let engine = Arc::new(paper_engine(config).await?);
    let events = spawn_event_logger(&engine);
    let tx = engine.start().await;

    let mut feed = ReplayFeed::new(file, paced);
    let shutdown = engine.shutdown_token();
    tokio::select! {
        result = feed.run(tx, shutdown.child_token()) => {
            let delivered = result.context("Replay failed")?;
            info!(delivered, "Replay complete, letting positions settle");
            // Give the pipeline and monitors a few cycles on the final state
            let settle = Duration::from_millis(
                2 * config.engine.evaluation_interval_ms.max(config.monitor.tick_interval_ms),
            );
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
    }

    finish(&engine, events).await
}

/// Poll DexScreener for the given addresses and paper-trade them
pub async fn watch(config: &Config, addresses: Vec<String>) -> Result<()> {
    let tokens = if addresses.is_empty() {
        config.feed.watch_list.clone()
    } else {
        addresses
    };
    if tokens.is_empty() {
        anyhow::bail!("No token addresses given and feed.watch_list is empty");
    }

    let engine = Arc::new(paper_engine(config).await?);
    let events = spawn_event_logger(&engine);
    let tx = engine.start().await;

    let mut feed = DexScreenerFeed::new(config.feed.clone(), tokens)?;
    info!(tokens = feed.tokens().len(), "Watching tokens, Ctrl-C to stop");

    let shutdown = engine.shutdown_token();
    tokio::select! {
        result = feed.run(tx, shutdown.child_token()) => {
            if let Err(e) = result {
                error!("Feed stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
    }

    finish(&engine, events).await
}

/// Score the final state of every token in a replay file without trading
pub async fn score(config: &Config, file: &Path) -> Result<()> {
    let log = ReplayLog::read(file).await.context("Failed to read replay file")?;
    if !log.skipped.is_empty() {
        warn!("Skipped {} malformed lines", log.skipped.len());
    }

    let tracker = TokenLifecycleTracker::new(config.tracker.clone());
    let tokens = log.tokens();
    for sample in log.samples {
        tracker.update(sample);
    }

    let scoring = ScoringEngine::new(config.scoring.clone());
    println!(
        "\n{:<24} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>6}  DECISION",
        "TOKEN", "MOMENTUM", "VOLUME", "AGE", "WHALE", "DEV", "SCORE", "CONF"
    );
    for token in tokens {
        let features = match tracker.features(&token) {
            Ok(f) => f,
            Err(e) => {
                debug!(token = %token, error = %e, "Token has no state");
                continue;
            }
        };
        let score = scoring.score(&features);
        let f = &score.factors;
        println!(
            "{:<24} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.4} {:>6.2}  {}{}",
            truncate(&token, 24),
            f.momentum,
            f.volume_health,
            f.age_bonus,
            f.whale,
            f.dev,
            score.composite,
            score.confidence,
            score.decision,
            if score.degraded { " (degraded)" } else { "" }
        );
    }
    println!();
    Ok(())
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

async fn paper_engine(config: &Config) -> Result<Engine> {
    let tracker = Arc::new(TokenLifecycleTracker::new(config.tracker.clone()));
    let gateway = Arc::new(PaperGateway::new(
        tracker.clone(),
        config.execution.paper_slippage_bps,
    ));
    let ledger = match &config.ledger.journal_path {
        Some(path) => TradeLedger::with_journal(path)
            .await
            .with_context(|| format!("Failed to open ledger journal {}", path))?,
        None => TradeLedger::in_memory(),
    };
    warn!("Running with the PAPER gateway - no real orders are placed");
    Ok(Engine::new(config.clone(), tracker, gateway, ledger))
}

fn spawn_event_logger(engine: &Engine) -> JoinHandle<()> {
    let mut rx = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Event logger lagged, {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &EngineEvent) {
    let json = serde_json::to_string(event).unwrap_or_default();
    match event {
        EngineEvent::Decision { .. } => debug!(target: "conviction_engine::events", "{}", json),
        EngineEvent::ManualIntervention { .. } | EngineEvent::ReconciliationRequired { .. } => {
            error!(target: "conviction_engine::events", "{}", json)
        }
        EngineEvent::Rug(_) | EngineEvent::DataStale { .. } | EngineEvent::EntryFailed { .. } => {
            warn!(target: "conviction_engine::events", "{}", json)
        }
        _ => info!(target: "conviction_engine::events", "{}", json),
    }
}

async fn finish(engine: &Engine, events: JoinHandle<()>) -> Result<()> {
    let report = engine.shutdown().await;
    events.abort();

    let stats = engine.ledger().stats().await;
    let portfolio = engine.portfolio_state().await;
    print_summary(&stats, &portfolio);

    if report.escalated > 0 || report.aborted > 0 || portfolio.reconciliation_required > 0 {
        anyhow::bail!(
            "{} position(s) need manual reconciliation",
            report.escalated + report.aborted
        );
    }
    Ok(())
}

fn print_summary(stats: &LedgerStats, portfolio: &PortfolioState) {
    println!("{}", render_summary(stats, portfolio));
}

fn render_summary(stats: &LedgerStats, portfolio: &PortfolioState) -> String {
    let mut out = String::from("\n=== CONVICTION ENGINE SUMMARY ===\n\n");
    out.push_str(&format!("Trades: {}\n", stats.total_trades));
    out.push_str(&format!("  Wins: {}\n", stats.winning_trades));
    out.push_str(&format!("  Losses: {}\n", stats.losing_trades));
    // win_rate() is already a percentage
    out.push_str(&format!("  Win rate: {:.1}%\n", stats.win_rate()));
    out.push_str(&format!(
        "  Avg exit multiple: {:.3}x\n",
        stats.average_exit_multiple
    ));
    out.push_str(&format!(
        "Realized P&L: {:+.3}% (${:+.2})\n",
        stats.realized_pnl_fraction * 100.0,
        stats.realized_pnl_usd
    ));
    out.push_str(&format!("Skipped (capacity): {}\n", stats.skipped_capacity));
    out.push_str(&format!("Entry failures: {}\n", stats.entry_failures));
    out.push_str(&format!("Escalations: {}\n", stats.escalations));
    out.push_str(&format!(
        "\nOpen slots in use: {}/{}\n",
        portfolio.total_slots_used, portfolio.max_positions
    ));
    if portfolio.reconciliation_required > 0 {
        out.push_str(&format!(
            "WARNING: {} position(s) require reconciliation\n",
            portfolio.reconciliation_required
        ));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    }
}
