//! Ranked rule sets and the hot-swappable matcher.

use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::destination::Destination;
use crate::domain::rule::Rule;

/// What a rule is being matched against.
#[derive(Debug, Clone, Copy)]
pub enum MatchTarget<'a> {
    /// A live request; prefixes are matched against the request path.
    Request(&'a Destination),
    /// An existing entry being revalidated; port and prefix must equal the
    /// values of the rule the entry currently holds.
    Entry {
        /// Host name stored in the entry.
        host: Option<&'a str>,
        /// Address stored in the entry.
        ip: Option<IpAddr>,
        /// Port of the entry's current rule.
        port: Option<u16>,
        /// Prefix of the entry's current rule.
        prefix: Option<&'a str>,
    },
}

impl MatchTarget<'_> {
    fn accepts(&self, rule: &Rule) -> bool {
        match self {
            MatchTarget::Request(dest) => {
                rule.pattern.matches(dest.host.as_deref(), dest.ip)
                    && rule.port.map_or(true, |p| p == dest.port)
                    && rule.prefix_matches_path(&dest.path)
            }
            MatchTarget::Entry { host, ip, port, prefix } => {
                rule.pattern.matches(*host, *ip)
                    && (rule.port.is_none() || rule.port == *port)
                    && (rule.prefix.is_none() || rule.prefix.as_deref() == *prefix)
            }
        }
    }
}

/// An ordered, immutable list of rules from one configuration generation.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
    generation: u64,
}

impl RuleSet {
    /// Build a rule set from rules in declaration order.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            generation: 0,
        }
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The configuration generation this set was installed as.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Iterate the rules in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    /// Find the most specific rule for `target`.
    ///
    /// Highest rank wins; among equal ranks the earliest declared rule wins.
    pub fn resolve(&self, target: MatchTarget<'_>) -> Option<Arc<Rule>> {
        let mut best: Option<&Arc<Rule>> = None;
        for rule in &self.rules {
            if !target.accepts(rule) {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    rule.rank() > current.rank()
                        || (rule.rank() == current.rank() && rule.line < current.line)
                }
            };
            if better {
                best = Some(rule);
            }
        }
        best.cloned()
    }
}

/// Holds the current [`RuleSet`] and swaps it atomically on reload.
///
/// Readers take a snapshot without locking; a reload never blocks or
/// invalidates a resolution already in progress.
#[derive(Debug)]
pub struct RuleMatcher {
    current: ArcSwap<RuleSet>,
    generations: AtomicU64,
}

impl RuleMatcher {
    /// Create a matcher with an initial rule set (generation 1).
    pub fn new(initial: RuleSet) -> Self {
        let matcher = Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
            generations: AtomicU64::new(0),
        };
        matcher.install(initial);
        matcher
    }

    /// Atomically replace the rule set, returning its generation number.
    pub fn install(&self, mut rules: RuleSet) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        rules.generation = generation;
        self.current.store(Arc::new(rules));
        generation
    }

    /// The rule set currently installed.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Resolve a request destination against the current rule set.
    pub fn resolve(&self, dest: &Destination) -> Option<Arc<Rule>> {
        self.current.load().resolve(MatchTarget::Request(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::{DestPattern, RuleDefaults};

    fn host_rule(line: usize, host: &str) -> Rule {
        Rule::with_defaults(line, DestPattern::Host(host.into()), &RuleDefaults::default())
    }

    #[test]
    fn higher_rank_beats_declaration_order() {
        let mut port_only = host_rule(1, "origin");
        port_only.port = Some(80);
        let mut prefix_port = host_rule(2, "origin");
        prefix_port.port = Some(80);
        prefix_port.prefix = Some("/api".into());

        let set = RuleSet::new(vec![port_only, prefix_port]);
        let dest = Destination::host("origin", 80).with_path("/api/v1");
        assert_eq!(set.resolve(MatchTarget::Request(&dest)).map(|r| r.line), Some(2));

        let other_path = Destination::host("origin", 80).with_path("/static");
        assert_eq!(set.resolve(MatchTarget::Request(&other_path)).map(|r| r.line), Some(1));
    }

    #[test]
    fn equal_rank_keeps_earliest_line() {
        let set = RuleSet::new(vec![host_rule(7, "origin"), host_rule(3, "origin")]);
        let dest = Destination::host("origin", 80);
        assert_eq!(set.resolve(MatchTarget::Request(&dest)).map(|r| r.line), Some(3));
    }

    #[test]
    fn entry_target_requires_exact_prefix() {
        let mut r = host_rule(1, "origin");
        r.prefix = Some("/api".into());
        let set = RuleSet::new(vec![r]);
        let exact = MatchTarget::Entry { host: Some("origin"), ip: None, port: None, prefix: Some("/api") };
        let longer = MatchTarget::Entry { host: Some("origin"), ip: None, port: None, prefix: Some("/api/v2") };
        assert!(set.resolve(exact).is_some());
        assert!(set.resolve(longer).is_none());
    }

    #[test]
    fn install_bumps_generation() {
        let matcher = RuleMatcher::new(RuleSet::default());
        assert_eq!(matcher.snapshot().generation(), 1);
        let generation = matcher.install(RuleSet::new(vec![host_rule(1, "origin")]));
        assert_eq!(generation, 2);
        assert!(matcher.resolve(&Destination::host("origin", 443)).is_some());
    }
}
