//! Congestion domain model: rules, destinations, and per-destination state.

pub mod admission;
pub mod destination;
pub mod entry;
pub mod rule;
pub mod rule_set;

pub use admission::{Admission, ConnectPolicy, Denial, DenyReason};
pub use destination::{control_key, derive_key, Destination, DestinationKey};
pub use entry::{DestinationEntry, EntrySnapshot, EntryState};
pub use rule::{CongestionScheme, DestPattern, Rule, RuleDefaults};
pub use rule_set::{MatchTarget, RuleMatcher, RuleSet};
