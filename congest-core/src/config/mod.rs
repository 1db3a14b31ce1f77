//! Rule file loading.

pub mod loader;
pub mod parser;

pub use loader::{load_rule_set, load_rules_from_file};
pub use parser::{parse_record, parse_rules, ParsedRules};
