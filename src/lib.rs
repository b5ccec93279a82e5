//! Conviction Engine Library
//!
//! Real-time conviction scoring for newly launched tokens, admission under a
//! hard position and exposure cap, and per-position supervision with rug
//! detection.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod feed;
pub mod ledger;
pub mod position;
pub mod rug;
pub mod scoring;
pub mod telemetry;

// Re-export commonly used types
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
