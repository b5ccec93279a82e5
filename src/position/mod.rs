//! Position lifecycle: admission, supervision and exit

pub mod manager;
pub mod monitor;
pub mod types;

pub use manager::{Admission, PortfolioState, PositionManager, SkipReason};
pub use monitor::{evaluate_exit, MonitorContext, MonitorOutcome, PositionMonitor};
pub use types::{pnl_fraction, EntryIntent, ExitIntent, ExitReason, Position, PositionState};
