//! Failure history tracking.

pub mod fail_history;

pub use fail_history::{BinCount, FailHistory, HISTORY_BINS};
