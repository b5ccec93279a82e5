//! Timestamped rolling windows
//!
//! Windows are keyed on sample timestamps rather than wall-clock arrival so
//! that replayed telemetry produces the same features as live telemetry.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Rolling window of timestamped values
#[derive(Debug, Clone)]
pub struct SeriesWindow {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    retention: Duration,
    max_samples: usize,
}

impl SeriesWindow {
    /// Create a new window retaining samples for `retention`
    pub fn new(retention: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
            max_samples: max_samples.max(2),
        }
    }

    /// Add a sample. Out-of-order samples older than the latest are dropped.
    pub fn push(&mut self, at: DateTime<Utc>, value: f64) -> bool {
        if let Some((last, _)) = self.samples.back() {
            if at < *last {
                return false;
            }
        }
        self.samples.push_back((at, value));
        self.prune(at);

        // Prevent unbounded growth
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        true
    }

    /// Remove samples older than the retention relative to `now`
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        while let Some((time, _)) = self.samples.front() {
            if *time < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Latest sample
    pub fn latest(&self) -> Option<(DateTime<Utc>, f64)> {
        self.samples.back().copied()
    }

    /// Latest value
    pub fn latest_value(&self) -> Option<f64> {
        self.samples.back().map(|(_, v)| *v)
    }

    /// Value before the latest one
    pub fn previous_value(&self) -> Option<f64> {
        let len = self.samples.len();
        if len < 2 {
            return None;
        }
        self.samples.get(len - 2).map(|(_, v)| *v)
    }

    /// Oldest retained sample
    pub fn earliest(&self) -> Option<(DateTime<Utc>, f64)> {
        self.samples.front().copied()
    }

    /// Most recent value recorded at or before `at`
    pub fn value_at_or_before(&self, at: DateTime<Utc>) -> Option<f64> {
        self.samples
            .iter()
            .rev()
            .find(|(t, _)| *t <= at)
            .map(|(_, v)| *v)
    }

    /// Fractional change from the reference value `horizon` ago to the latest.
    ///
    /// When the history is shorter than the horizon the earliest retained
    /// sample is the reference (change since first observation).
    pub fn change_over(&self, horizon: Duration) -> Option<f64> {
        let (latest_at, latest) = self.latest()?;
        if self.samples.len() < 2 {
            return None;
        }
        let reference = self
            .value_at_or_before(latest_at - horizon)
            .or_else(|| self.earliest().map(|(_, v)| v))?;
        if reference <= 0.0 {
            return None;
        }
        Some(latest / reference - 1.0)
    }

    /// Samples with timestamp >= `since`
    pub fn since(&self, since: DateTime<Utc>) -> Vec<(DateTime<Utc>, f64)> {
        self.samples
            .iter()
            .filter(|(t, _)| *t >= since)
            .copied()
            .collect()
    }

    /// Number of retained samples
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Check if window is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
