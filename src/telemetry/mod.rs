//! Token telemetry ingestion and rolling state
//!
//! - `sample`: wire type for one observation plus sanitizing
//! - `window`: timestamp-keyed rolling series
//! - `tracker`: per-token lifecycle state and feature extraction

pub mod sample;
pub mod tracker;
pub mod window;

pub use sample::{HolderBalance, QualityIssue, SampleField, TokenSample};
pub use tracker::{
    DataQuality, FeatureVector, TokenCandidate, TokenLifecycleTracker, UpdateOutcome,
};
pub use window::SeriesWindow;
