//! Admission verdicts handed back to the transaction engine.

use std::time::Duration;

/// Why a connection attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Too many recent connection failures.
    Congested,
    /// The destination already has `max_connection` open connections.
    AtCapacity,
}

/// A refusal with the back-off hints for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    /// What tripped.
    pub reason: DenyReason,
    /// How long the caller should wait before retrying.
    pub retry_after: Duration,
    /// Width of the random jitter the caller may add to `retry_after`.
    pub retry_jitter: Duration,
    /// Error page configured on the governing rule.
    pub error_page: Option<String>,
}

/// The answer to "may I open a connection to this destination now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead. The destination's active-connection count now includes this
    /// connection; report it closed when done.
    Allow,
    /// Fail or redirect the request.
    Deny(Denial),
}

impl Admission {
    /// Whether the verdict allows the connection.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }

    /// The denial reason, if any.
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Admission::Allow => None,
            Admission::Deny(denial) => Some(denial.reason),
        }
    }
}

/// Origin connect parameters for the current entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Connect timeout.
    pub timeout: Duration,
    /// Connect retries.
    pub retries: u32,
}
