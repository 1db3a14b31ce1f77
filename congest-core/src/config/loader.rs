//! Reading rule files from disk.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::parser::{parse_rules, ParsedRules};
use crate::domain::rule::RuleDefaults;
use crate::domain::rule_set::RuleSet;
use crate::error::{CongestError, Result};

/// Load and parse the rule file at `path`.
///
/// A file that cannot be read is an error and nothing is returned; invalid
/// records are logged, reported in [`ParsedRules::errors`] and skipped.
pub fn load_rules_from_file<P: AsRef<Path>>(path: P, defaults: &RuleDefaults) -> Result<ParsedRules> {
    let path = path.as_ref();
    info!("Loading congestion rules from: {}", path.display());

    let contents = std::fs::read_to_string(path).map_err(|source| CongestError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let parsed = parse_rules(&contents, defaults);
    for err in &parsed.errors {
        warn!("{}:{}", path.display(), err);
    }
    log_rules_summary(&parsed);
    Ok(parsed)
}

/// Load the rule file and package the valid rules as a [`RuleSet`].
pub fn load_rule_set<P: AsRef<Path>>(path: P, defaults: &RuleDefaults) -> Result<RuleSet> {
    let parsed = load_rules_from_file(path, defaults)?;
    Ok(RuleSet::new(parsed.rules))
}

fn log_rules_summary(parsed: &ParsedRules) {
    info!(
        "Congestion rules loaded: {} valid, {} rejected",
        parsed.rules.len(),
        parsed.errors.len()
    );
    for rule in &parsed.rules {
        debug!("  line {} rank {}: {}", rule.line, rule.rank(), rule);
    }
}
