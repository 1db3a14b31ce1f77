//! Per-destination congestion state.
//!
//! An entry is shared between its table slot and any caller still holding it.
//! Counters and flags are atomics; the failure history sits behind the entry's
//! own mutex, which is only ever taken with `try_lock` so request threads never
//! wait on it.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::admission::{Admission, ConnectPolicy, Denial, DenyReason};
use crate::domain::destination::DestinationKey;
use crate::domain::rule::{CongestionScheme, Rule};
use crate::history::FailHistory;

/// Observable state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Accepting connections.
    Live,
    /// Failure threshold reached; new attempts are refused.
    Congested,
    /// `max_connection` reached. Computed on read, never stored.
    AtCapacity,
}

impl EntryState {
    /// Single-letter code used in listings.
    pub fn letter(&self) -> char {
        match self {
            EntryState::Live => ' ',
            EntryState::Congested => 'F',
            EntryState::AtCapacity => 'M',
        }
    }
}

/// Point-in-time copy of an entry for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    /// Entry key.
    pub key: DestinationKey,
    /// Host name copy.
    pub hostname: Option<String>,
    /// Address copy.
    pub ip: Option<IpAddr>,
    /// Declaration line of the governing rule.
    pub rule_line: usize,
    /// Scheme of the governing rule.
    pub scheme: CongestionScheme,
    /// Prefix of the governing rule.
    pub prefix: Option<String>,
    /// State at snapshot time.
    pub state: EntryState,
    /// Whether the failure threshold is tripped, even while at capacity.
    pub congested: bool,
    /// Last congestion time, or the snapshot time while at capacity.
    pub timestamp: i64,
    /// When the entry last became congested (0 if never).
    pub last_congested: i64,
    /// Requests refused because of failures.
    pub congested_rejections: u32,
    /// Requests refused because of the connection cap.
    pub capacity_rejections: u32,
    /// Newest failure timestamp.
    pub last_event: i64,
    /// Failures in the window at last registration.
    pub events: u32,
    /// Holders of the entry, table slot included.
    pub ref_count: usize,
    /// Open connections.
    pub active_connections: u32,
}

/// Runtime congestion and capacity state for one destination key.
#[derive(Debug)]
pub struct DestinationEntry {
    key: DestinationKey,
    hostname: Option<String>,
    ip: Option<IpAddr>,
    rule: ArcSwap<Rule>,
    history: Mutex<FailHistory>,
    /// Mirrors of the history, readable without its lock.
    last_event: AtomicI64,
    events: AtomicU32,
    active_connections: AtomicU32,
    congested: AtomicBool,
    last_congested: AtomicI64,
    at_capacity: AtomicBool,
    last_at_capacity: AtomicI64,
    congested_rejections: AtomicU32,
    capacity_rejections: AtomicU32,
}

impl DestinationEntry {
    /// A fresh, live entry governed by `rule`.
    pub fn new(key: DestinationKey, hostname: Option<String>, ip: Option<IpAddr>, rule: Arc<Rule>) -> Self {
        let history = FailHistory::new(rule.fail_window);
        Self {
            key,
            hostname,
            ip,
            rule: ArcSwap::new(rule),
            history: Mutex::new(history),
            last_event: AtomicI64::new(0),
            events: AtomicU32::new(0),
            active_connections: AtomicU32::new(0),
            congested: AtomicBool::new(false),
            last_congested: AtomicI64::new(0),
            at_capacity: AtomicBool::new(false),
            last_at_capacity: AtomicI64::new(0),
            congested_rejections: AtomicU32::new(0),
            capacity_rejections: AtomicU32::new(0),
        }
    }

    /// Entry key.
    pub fn key(&self) -> DestinationKey {
        self.key
    }

    /// Host name the entry was created for.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Address the entry was created for.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// The rule currently governing the entry.
    pub fn rule(&self) -> Arc<Rule> {
        self.rule.load_full()
    }

    /// Whether the failure threshold has tripped.
    pub fn is_congested(&self) -> bool {
        self.congested.load(Ordering::Acquire)
    }

    /// Open connections.
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Newest failure timestamp seen.
    pub fn last_event(&self) -> i64 {
        self.last_event.load(Ordering::Acquire)
    }

    /// State as of now.
    pub fn state(&self) -> EntryState {
        let rule = self.rule.load();
        if rule.max_connection.is_some_and(|cap| self.active_connections() >= cap) {
            EntryState::AtCapacity
        } else if self.is_congested() {
            EntryState::Congested
        } else {
            EntryState::Live
        }
    }

    /// Decide whether a new connection may be opened, reserving a connection
    /// slot on success.
    pub fn admit(&self, now: i64) -> Admission {
        let rule = self.rule.load();
        let cap = rule.max_connection;
        if cap.is_some_and(|cap| self.active_connections() >= cap) {
            return self.deny_at_capacity(&rule, now);
        }
        if self.is_congested() {
            self.congested_rejections.fetch_add(1, Ordering::Relaxed);
            return Admission::Deny(Denial {
                reason: DenyReason::Congested,
                retry_after: secs(rule.client_wait_interval),
                retry_jitter: secs(rule.wait_interval_alpha),
                error_page: rule.error_page.clone(),
            });
        }
        let reserved = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match cap {
                Some(cap) if n >= cap => None,
                _ => Some(n + 1),
            });
        match reserved {
            Ok(_) => Admission::Allow,
            Err(_) => self.deny_at_capacity(&rule, now),
        }
    }

    fn deny_at_capacity(&self, rule: &Rule, now: i64) -> Admission {
        self.capacity_rejections.fetch_add(1, Ordering::Relaxed);
        if !self.at_capacity.swap(true, Ordering::AcqRel) {
            self.last_at_capacity.store(now, Ordering::Release);
            info!(key = %self.key, host = ?self.hostname, "destination reached its connection cap");
        }
        Admission::Deny(Denial {
            reason: DenyReason::AtCapacity,
            retry_after: secs(rule.proxy_retry_interval),
            retry_jitter: Duration::ZERO,
            error_page: rule.error_page.clone(),
        })
    }

    /// Count a connection opened outside [`DestinationEntry::admit`].
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one connection slot.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        let below_cap = self
            .rule
            .load()
            .max_connection
            .map_or(true, |cap| self.active_connections() < cap);
        if below_cap {
            self.at_capacity.store(false, Ordering::Release);
        }
    }

    /// Record a connection failure at `t` (seconds).
    ///
    /// Best effort: if another thread holds the history lock the event is
    /// dropped, so a request thread never waits here. Returns whether the
    /// event was recorded.
    pub fn register_failure(&self, t: i64) -> bool {
        let rule = self.rule.load();
        let Some(threshold) = rule.max_connection_failures else {
            return false;
        };
        let Some(mut history) = self.history.try_lock() else {
            debug!(key = %self.key, time = t, "failure info lost due to lock contention");
            return false;
        };
        let events = history.register(t);
        self.events.store(events, Ordering::Release);
        self.last_event.store(history.last_event(), Ordering::Release);
        if events >= threshold && !self.congested.swap(true, Ordering::AcqRel) {
            self.last_congested.store(history.last_event(), Ordering::Release);
            info!(
                key = %self.key,
                host = ?self.hostname,
                events,
                threshold,
                "destination congested"
            );
        }
        true
    }

    /// Clear the congested flag. Returns whether it was set.
    pub fn go_alive(&self) -> bool {
        let was = self.congested.swap(false, Ordering::AcqRel);
        if was {
            info!(key = %self.key, host = ?self.hostname, "destination alive again");
        }
        was
    }

    /// Switch to a freshly resolved rule.
    ///
    /// A different fail window re-counts the history under the new window.
    /// The congested flag is cleared when the new threshold is disabled, or
    /// when the re-counted events fall below it and either the window
    /// narrowed or the threshold rose; it is never set here. Returns `false`
    /// without changing anything if the history lock is busy.
    pub fn apply_rule(&self, rule: Arc<Rule>) -> bool {
        let Some(mut history) = self.history.try_lock() else {
            return false;
        };
        let old = self.rule.load_full();
        if old.fail_window != rule.fail_window {
            *history = history.resized(rule.fail_window);
            self.events.store(history.events(), Ordering::Release);
        }
        let clear = match rule.max_connection_failures {
            None => true,
            Some(threshold) => {
                let relaxed = rule.fail_window < old.fail_window
                    || old.max_connection_failures.map_or(true, |prev| threshold > prev);
                relaxed && history.events() < threshold
            }
        };
        self.rule.store(rule);
        if clear && self.congested.swap(false, Ordering::AcqRel) {
            info!(key = %self.key, host = ?self.hostname, "congestion cleared by new rule");
        }
        true
    }

    /// Whether the entry carries nothing worth keeping: not congested, no open
    /// connections, and no failure within the last fail window.
    pub fn gc_eligible(&self, now: i64) -> bool {
        !self.is_congested()
            && self.active_connections() == 0
            && now - self.last_event() >= i64::from(self.rule.load().fail_window)
    }

    /// Whether the proxy itself may try a congested origin again.
    pub fn proxy_retry(&self, now: i64) -> bool {
        now - self.last_event() >= i64::from(self.rule.load().proxy_retry_interval)
    }

    /// Connect timeout and retries for the current state.
    pub fn connect_policy(&self) -> ConnectPolicy {
        let rule = self.rule.load();
        if self.is_congested() {
            ConnectPolicy {
                timeout: secs(rule.dead_os_conn_timeout),
                retries: rule.dead_os_conn_retries,
            }
        } else {
            ConnectPolicy {
                timeout: secs(rule.live_os_conn_timeout),
                retries: rule.live_os_conn_retries,
            }
        }
    }

    /// Copy out everything a listing needs.
    pub fn snapshot(self: &Arc<Self>, now: i64) -> EntrySnapshot {
        let rule = self.rule.load();
        let state = self.state();
        let last_congested = self.last_congested.load(Ordering::Acquire);
        EntrySnapshot {
            key: self.key,
            hostname: self.hostname.clone(),
            ip: self.ip,
            rule_line: rule.line,
            scheme: rule.scheme,
            prefix: rule.prefix.clone(),
            state,
            congested: self.is_congested(),
            timestamp: if state == EntryState::AtCapacity { now } else { last_congested },
            last_congested,
            congested_rejections: self.congested_rejections.load(Ordering::Relaxed),
            capacity_rejections: self.capacity_rejections.load(Ordering::Relaxed),
            last_event: self.last_event(),
            events: self.events.load(Ordering::Acquire),
            ref_count: Arc::strong_count(self),
            active_connections: self.active_connections(),
        }
    }
}

fn secs(value: u32) -> Duration {
    Duration::from_secs(u64::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::{DestPattern, RuleDefaults};

    const T0: i64 = 1_700_000_000;

    fn rule(tweak: impl FnOnce(&mut Rule)) -> Arc<Rule> {
        let mut r = Rule::with_defaults(1, DestPattern::Host("origin".into()), &RuleDefaults::default());
        tweak(&mut r);
        Arc::new(r)
    }

    fn entry(rule: Arc<Rule>) -> DestinationEntry {
        DestinationEntry::new(DestinationKey(1), Some("origin".into()), None, rule)
    }

    impl DestinationEntry {
        fn snapshot_events(&self) -> u32 {
            self.events.load(Ordering::Acquire)
        }
    }

    #[test]
    fn threshold_flips_to_congested() {
        let e = entry(rule(|r| r.max_connection_failures = Some(3)));
        assert!(e.register_failure(T0));
        assert!(e.register_failure(T0 + 1));
        assert!(!e.is_congested());
        assert!(e.register_failure(T0 + 2));
        assert!(e.is_congested());
        assert_eq!(e.admit(T0 + 3).deny_reason(), Some(DenyReason::Congested));
        assert!(e.go_alive());
        assert!(e.admit(T0 + 3).is_allowed());
    }

    #[test]
    fn disabled_threshold_ignores_failures() {
        let e = entry(rule(|r| r.max_connection_failures = None));
        assert!(!e.register_failure(T0));
        assert_eq!(e.last_event(), 0);
    }

    #[test]
    fn contention_drops_the_failure() {
        let e = entry(rule(|r| r.max_connection_failures = Some(1)));
        let guard = e.history.lock();
        assert!(!e.register_failure(T0));
        drop(guard);
        assert!(!e.is_congested());
    }

    #[test]
    fn capacity_denial_uses_proxy_retry_interval() {
        let e = entry(rule(|r| {
            r.max_connection = Some(1);
            r.proxy_retry_interval = 7;
        }));
        assert!(e.admit(T0).is_allowed());
        match e.admit(T0) {
            Admission::Deny(d) => {
                assert_eq!(d.reason, DenyReason::AtCapacity);
                assert_eq!(d.retry_after, Duration::from_secs(7));
            }
            Admission::Allow => panic!("expected denial"),
        }
        assert_eq!(e.state(), EntryState::AtCapacity);
        e.connection_closed();
        assert_eq!(e.state(), EntryState::Live);
    }

    #[test]
    fn zero_cap_blocks_everything() {
        let e = entry(rule(|r| r.max_connection = Some(0)));
        assert_eq!(e.admit(T0).deny_reason(), Some(DenyReason::AtCapacity));
    }

    #[test]
    fn closing_never_underflows() {
        let e = entry(rule(|_| {}));
        e.connection_closed();
        assert_eq!(e.active_connections(), 0);
    }

    #[test]
    fn new_rule_with_disabled_threshold_clears_congestion() {
        let e = entry(rule(|r| r.max_connection_failures = Some(1)));
        e.register_failure(T0);
        assert!(e.is_congested());
        assert!(e.apply_rule(rule(|r| r.max_connection_failures = None)));
        assert!(!e.is_congested());
    }

    #[test]
    fn unchanged_rule_keeps_congestion() {
        let e = entry(rule(|r| r.max_connection_failures = Some(1)));
        e.register_failure(T0);
        assert!(e.apply_rule(rule(|r| r.max_connection_failures = Some(1))));
        assert!(e.is_congested());
    }

    #[test]
    fn raised_threshold_clears_congestion() {
        let e = entry(rule(|r| r.max_connection_failures = Some(1)));
        e.register_failure(T0);
        assert!(e.apply_rule(rule(|r| r.max_connection_failures = Some(5))));
        assert!(!e.is_congested());
    }

    #[test]
    fn narrower_window_clears_when_old_failures_fall_out() {
        let e = entry(rule(|r| {
            r.max_connection_failures = Some(2);
            r.fail_window = 600;
        }));
        e.register_failure(T0);
        e.register_failure(T0 + 300);
        assert!(e.is_congested());
        assert!(e.apply_rule(rule(|r| {
            r.max_connection_failures = Some(2);
            r.fail_window = 60;
        })));
        assert!(!e.is_congested());
        assert_eq!(e.snapshot_events(), 1);
    }

    #[test]
    fn narrower_window_keeps_congestion_while_failures_still_count() {
        let e = entry(rule(|r| {
            r.max_connection_failures = Some(2);
            r.fail_window = 600;
        }));
        e.register_failure(T0);
        e.register_failure(T0 + 1);
        assert!(e.apply_rule(rule(|r| {
            r.max_connection_failures = Some(2);
            r.fail_window = 60;
        })));
        assert!(e.is_congested());
    }

    #[test]
    fn wider_window_keeps_congestion() {
        let e = entry(rule(|r| {
            r.max_connection_failures = Some(2);
            r.fail_window = 60;
        }));
        e.register_failure(T0);
        e.register_failure(T0 + 1);
        assert!(e.is_congested());
        assert!(e.apply_rule(rule(|r| {
            r.max_connection_failures = Some(2);
            r.fail_window = 600;
        })));
        assert!(e.is_congested());
        assert_eq!(e.snapshot_events(), 2);
        assert_eq!(e.admit(T0 + 2).deny_reason(), Some(DenyReason::Congested));
    }

    #[test]
    fn gc_eligibility_follows_window_and_activity() {
        let e = entry(rule(|r| {
            r.max_connection_failures = Some(10);
            r.fail_window = 120;
        }));
        e.register_failure(T0);
        assert!(!e.gc_eligible(T0 + 60));
        assert!(e.gc_eligible(T0 + 120));
        e.connection_opened();
        assert!(!e.gc_eligible(T0 + 500));
    }

    #[test]
    fn connect_policy_switches_when_congested() {
        let e = entry(rule(|r| r.max_connection_failures = Some(1)));
        assert_eq!(e.connect_policy().retries, 2);
        e.register_failure(T0);
        assert_eq!(e.connect_policy().timeout, Duration::from_secs(15));
        assert!(!e.proxy_retry(T0 + 5));
        assert!(e.proxy_retry(T0 + 10));
    }

    #[test]
    fn snapshot_reports_refcount_and_state() {
        let e = Arc::new(entry(rule(|r| r.max_connection_failures = Some(1))));
        let held = Arc::clone(&e);
        e.register_failure(T0);
        let snap = e.snapshot(T0 + 1);
        assert_eq!(snap.state, EntryState::Congested);
        assert_eq!(snap.state.letter(), 'F');
        assert_eq!(snap.timestamp, T0);
        assert_eq!(snap.ref_count, 2);
        drop(held);
    }
}
