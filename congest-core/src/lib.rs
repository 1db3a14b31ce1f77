//! Congest Core functionality.
//!
//! This crate tracks connection failures and concurrent-connection pressure
//! per upstream destination and answers, without ever blocking the calling
//! thread, whether a new connection may be opened right now.
//!
//! The pieces, bottom up:
//! - [`table`]: a mutex-sharded hash table with a per-partition deferred
//!   operation queue and [`Ticket`]s for results that arrive later.
//! - [`history`]: the bucketed sliding-window failure counter.
//! - [`domain`]: rules, the hot-swappable rule matcher, destination keys and
//!   the per-destination state machine.
//! - [`config`]: the rule file loader.
//! - [`service`]: [`CongestionService`], which ties the above together.

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod history;
pub mod service;
pub mod table;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_rule_set, load_rules_from_file, parse_rules, ParsedRules};
pub use domain::{
    control_key, derive_key, Admission, CongestionScheme, ConnectPolicy, Denial, DenyReason,
    DestPattern, Destination, DestinationEntry, DestinationKey, EntrySnapshot, EntryState, Rule,
    RuleDefaults, RuleMatcher, RuleSet,
};
pub use error::{CongestError, Result, RuleError};
pub use service::{CongestionService, RemoveSummary, SharedCongestionService, SweepReport};
pub use table::{Cancelled, Ticket, TicketState};
