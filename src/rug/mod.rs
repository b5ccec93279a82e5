//! Rug detection
//!
//! `rules` holds the independent predicates, `detector` runs them per
//! watched token and fans out aggregated signals.

pub mod detector;
pub mod rules;

pub use detector::{HitAggregator, RugDetector, RugDetectorConfig, RugSignal};
pub use rules::{RugRule, RugWindow, RuleHit};
