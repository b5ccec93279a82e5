//! Newline-delimited JSON replay
//!
//! One `TokenSample` per line. Blank lines and `#` comments are ignored;
//! malformed lines are logged and skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TelemetryFeed;
use crate::error::{Error, Result};
use crate::telemetry::TokenSample;

/// Longest real pause between two paced samples
const MAX_PACING_GAP: Duration = Duration::from_secs(10);

/// Parsed replay file
#[derive(Debug, Clone, Default)]
pub struct ReplayLog {
    pub samples: Vec<TokenSample>,
    /// Line numbers (1-based) that could not be parsed
    pub skipped: Vec<usize>,
}

impl ReplayLog {
    pub fn parse(content: &str) -> Self {
        let mut log = ReplayLog::default();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<TokenSample>(line) {
                Ok(sample) => log.samples.push(sample),
                Err(e) => {
                    warn!(line = idx + 1, error = %e, "Skipping malformed replay line");
                    log.skipped.push(idx + 1);
                }
            }
        }
        log
    }

    pub async fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Feed(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(Self::parse(&content))
    }

    /// Distinct token ids in first-seen order
    pub fn tokens(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for sample in &self.samples {
            if !seen.contains(&sample.token_id) {
                seen.push(sample.token_id.clone());
            }
        }
        seen
    }
}

/// Replays a JSONL file, optionally paced by sample timestamps
pub struct ReplayFeed {
    path: PathBuf,
    paced: bool,
}

impl ReplayFeed {
    pub fn new(path: impl Into<PathBuf>, paced: bool) -> Self {
        Self {
            path: path.into(),
            paced,
        }
    }
}

#[async_trait]
impl TelemetryFeed for ReplayFeed {
    fn name(&self) -> &str {
        "replay"
    }

    async fn run(
        &mut self,
        sink: mpsc::Sender<TokenSample>,
        shutdown: CancellationToken,
    ) -> Result<u64> {
        let log = ReplayLog::read(&self.path).await?;
        info!(
            path = %self.path.display(),
            samples = log.samples.len(),
            skipped = log.skipped.len(),
            paced = self.paced,
            "Replaying telemetry"
        );

        let mut delivered = 0u64;
        let mut previous: Option<DateTime<Utc>> = None;
        for sample in log.samples {
            if self.paced {
                if let Some(prev) = previous {
                    let gap = (sample.timestamp - prev).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(gap.min(MAX_PACING_GAP)) => {}
                    }
                }
                previous = Some(sample.timestamp);
            }
            if shutdown.is_cancelled() {
                break;
            }
            if sink.send(sample).await.is_err() {
                debug!("Ingest channel closed, replay stopped");
                break;
            }
            delivered += 1;
        }

        info!(delivered, "Replay finished");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LOG: &str = r#"
# two tokens
{"tokenId":"a","priceUsd":0.001,"timestamp":"2024-01-01T00:00:00Z"}
{"tokenId":"b","priceUsd":0.002,"volume24h":5000.0,"timestamp":"2024-01-01T00:00:01Z"}
not json
{"tokenId":"a","timestamp":"2024-01-01T00:00:05Z"}
{"priceUsd":1.0}
"#;

    #[test]
    fn test_parse_skips_malformed_lines() {
        let log = ReplayLog::parse(LOG);
        assert_eq!(log.samples.len(), 3);
        assert_eq!(log.skipped, vec![5, 7]);
        assert_eq!(log.tokens(), vec!["a".to_string(), "b".to_string()]);
        // Absent fields stay missing
        assert_eq!(log.samples[2].price_usd, None);
        assert_eq!(log.samples[1].volume_24h, Some(5000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_delivers_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LOG.as_bytes()).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let mut feed = ReplayFeed::new(file.path(), true);
        let started = tokio::time::Instant::now();
        let delivered = feed.run(tx, CancellationToken::new()).await.unwrap();
        assert_eq!(delivered, 3);
        // Gaps of 1s and 4s between sample timestamps are honoured
        assert!(started.elapsed() >= Duration::from_secs(5));

        let mut tokens = Vec::new();
        while let Some(sample) = rx.recv().await {
            tokens.push(sample.token_id);
        }
        assert_eq!(tokens, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_feed_error() {
        let (tx, _rx) = mpsc::channel(1);
        let mut feed = ReplayFeed::new("/nonexistent/replay.jsonl", false);
        assert!(matches!(
            feed.run(tx, CancellationToken::new()).await,
            Err(Error::Feed(_))
        ));
    }
}
