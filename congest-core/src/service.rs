//! The congestion service: rule matching, the destination table, and the
//! operations the proxy and the operator call.
//!
//! Every table operation goes through the lock-or-defer front end, so none of
//! these methods ever waits on a lock held by another thread. Operations that
//! had to be queued hand back a pending [`Ticket`].

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::domain::admission::{Admission, ConnectPolicy};
use crate::domain::destination::{control_key, derive_key, Destination, DestinationKey};
use crate::domain::entry::{DestinationEntry, EntrySnapshot, EntryState};
use crate::domain::rule::Rule;
use crate::domain::rule_set::{MatchTarget, RuleMatcher, RuleSet};
use crate::table::{DeferredTable, Partition, Ticket};

/// What one partition sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionSweep {
    /// Entries switched to a different rule.
    pub rebound: usize,
    /// Entries released (no rule, changed key, or idle).
    pub removed: usize,
}

/// Totals for one sweep over the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Partitions swept in place.
    pub swept: usize,
    /// Partitions that were busy and got a sweep queued instead.
    pub deferred: usize,
    /// Partitions skipped because a queued sweep is still outstanding.
    pub skipped: usize,
    /// Entries switched to a different rule.
    pub rebound: usize,
    /// Entries released.
    pub removed: usize,
}

/// Result of clearing the whole table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveSummary {
    /// Entries dropped immediately.
    pub removed_now: usize,
    /// Partitions whose clear was queued behind their lock.
    pub deferred_partitions: usize,
}

/// Tracks upstream congestion and answers admission queries.
pub struct CongestionService {
    matcher: Arc<RuleMatcher>,
    table: DeferredTable<DestinationEntry>,
    clock: Arc<dyn Clock>,
    sweep_pending: Arc<[AtomicBool]>,
}

impl std::fmt::Debug for CongestionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CongestionService")
            .field("generation", &self.matcher.snapshot().generation())
            .field("partitions", &self.table.partition_count())
            .finish()
    }
}

impl CongestionService {
    /// A service over `rules` with `partitions` table shards and the wall clock.
    pub fn new(rules: RuleSet, partitions: usize) -> Self {
        Self::with_clock(rules, partitions, Arc::new(SystemClock))
    }

    /// A service with an explicit time source.
    pub fn with_clock(rules: RuleSet, partitions: usize, clock: Arc<dyn Clock>) -> Self {
        let table = DeferredTable::new(partitions);
        let sweep_pending = (0..table.partition_count())
            .map(|_| AtomicBool::new(false))
            .collect();
        Self {
            matcher: Arc::new(RuleMatcher::new(rules)),
            table,
            clock,
            sweep_pending,
        }
    }

    /// Current time according to the service clock.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// The installed rule set.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.matcher.snapshot()
    }

    /// Number of table partitions.
    pub fn partition_count(&self) -> usize {
        self.table.partition_count()
    }

    /// Entries in the table. Takes every partition lock in turn, so this is
    /// for operators and tests, not the request path.
    pub fn entry_count(&self) -> usize {
        self.table.table().len()
    }

    /// Install a new rule set and revalidate every entry against it.
    ///
    /// Returns the new generation number.
    pub fn reload(&self, rules: RuleSet) -> u64 {
        let count = rules.len();
        let generation = self.matcher.install(rules);
        info!(generation, rules = count, "congestion rules installed");
        let report = self.sweep(self.clock.now());
        debug!(?report, "post-reload sweep");
        generation
    }

    /// The rule governing `dest`, if any. A destination with neither a host
    /// name nor an address is never governed.
    pub fn resolve(&self, dest: &Destination) -> Option<Arc<Rule>> {
        if !dest.is_identified() {
            return None;
        }
        self.matcher.resolve(dest)
    }

    /// Key `dest` would be tracked under, if a rule governs it.
    pub fn key_for(&self, dest: &Destination) -> Option<DestinationKey> {
        self.resolve(dest)
            .map(|rule| derive_key(dest.host.as_deref(), dest.ip, &rule))
    }

    /// May a new connection to `dest` be opened now?
    ///
    /// An allowed connection is counted as active; report it closed with
    /// [`CongestionService::report_connection_closed`]. If the ticket is
    /// deferred and then cancelled or dropped, an `Allow` nobody received
    /// gives its connection slot back. Destinations no rule governs are
    /// always allowed and not tracked.
    pub fn check_admission(&self, dest: &Destination) -> Ticket<Admission> {
        let Some(rule) = self.resolve(dest) else {
            return Ticket::ready(Admission::Allow);
        };
        let now = self.clock.now();
        let key = derive_key(dest.host.as_deref(), dest.ip, &rule);
        let host = dest.host.clone();
        let ip = dest.ip;
        self.table.submit_with_undo(
            key.0,
            move |p| {
                let entry = p.get_or_insert_with(key.0, || DestinationEntry::new(key, host, ip, rule));
                let verdict = entry.admit(now);
                if let Admission::Deny(denial) = &verdict {
                    debug!(key = %key, reason = ?denial.reason, "connection denied");
                }
                verdict
            },
            move |p, unclaimed| {
                if unclaimed.is_allowed() {
                    if let Some(entry) = p.lookup(key.0) {
                        entry.connection_closed();
                    }
                    debug!(key = %key, "unclaimed admission released its slot");
                }
            },
        )
    }

    /// Record a failed connection attempt to `dest` at `timestamp` (seconds).
    pub fn report_failure(&self, dest: &Destination, timestamp: i64) {
        let Some(rule) = self.resolve(dest) else {
            return;
        };
        if rule.max_connection_failures.is_none() {
            return;
        }
        drop(self.with_entry(dest, rule, move |entry| {
            entry.register_failure(timestamp);
        }));
    }

    /// Count a connection to `dest` that was opened without
    /// [`CongestionService::check_admission`].
    pub fn report_connection_opened(&self, dest: &Destination) {
        let Some(rule) = self.resolve(dest) else {
            return;
        };
        drop(self.with_entry(dest, rule, |entry| entry.connection_opened()));
    }

    /// Release a connection to `dest`.
    pub fn report_connection_closed(&self, dest: &Destination) {
        let Some(key) = self.key_for(dest) else {
            return;
        };
        drop(self.table.submit(key.0, move |p| {
            if let Some(entry) = p.lookup(key.0) {
                entry.connection_closed();
            }
        }));
    }

    /// Clear the congested state of `dest`. The ticket yields whether it was set.
    pub fn go_alive(&self, dest: &Destination) -> Ticket<bool> {
        match self.key_for(dest) {
            Some(key) => self.go_alive_key(key),
            None => Ticket::ready(false),
        }
    }

    /// Clear the congested state of the entry under `key`.
    pub fn go_alive_key(&self, key: DestinationKey) -> Ticket<bool> {
        self.table.submit(key.0, move |p| {
            p.lookup(key.0).is_some_and(|entry| entry.go_alive())
        })
    }

    /// The entry tracking `dest`, if one exists.
    pub fn lookup_entry(&self, dest: &Destination) -> Ticket<Option<Arc<DestinationEntry>>> {
        match self.key_for(dest) {
            Some(key) => self.table.lookup(key.0),
            None => Ticket::ready(None),
        }
    }

    /// Whether the proxy itself may try `dest` again. Untracked and live
    /// destinations always may.
    pub fn proxy_retry(&self, dest: &Destination) -> Ticket<bool> {
        let Some(key) = self.key_for(dest) else {
            return Ticket::ready(true);
        };
        let now = self.clock.now();
        self.table.submit(key.0, move |p| match p.lookup(key.0) {
            Some(entry) if entry.is_congested() => entry.proxy_retry(now),
            _ => true,
        })
    }

    /// Origin connect timeout and retries for `dest`; `None` when no rule
    /// governs it.
    pub fn connect_policy(&self, dest: &Destination) -> Ticket<Option<ConnectPolicy>> {
        let Some(rule) = self.resolve(dest) else {
            return Ticket::ready(None);
        };
        let key = derive_key(dest.host.as_deref(), dest.ip, &rule);
        self.table.submit(key.0, move |p| {
            Some(match p.lookup(key.0) {
                Some(entry) => entry.connect_policy(),
                None => ConnectPolicy {
                    timeout: std::time::Duration::from_secs(u64::from(rule.live_os_conn_timeout)),
                    retries: rule.live_os_conn_retries,
                },
            })
        })
    }

    /// Drop every entry.
    pub fn remove_all(&self) -> RemoveSummary {
        let mut summary = RemoveSummary::default();
        for idx in 0..self.table.partition_count() {
            let mut ticket = self.table.clear_partition(idx);
            if ticket.is_deferred() {
                summary.deferred_partitions += 1;
            } else {
                summary.removed_now += ticket.try_take().unwrap_or(0);
            }
        }
        info!(
            removed = summary.removed_now,
            deferred = summary.deferred_partitions,
            "congestion table cleared"
        );
        summary
    }

    /// Drop the entry under `key`. The ticket yields whether one existed.
    pub fn remove_key(&self, key: DestinationKey) -> Ticket<bool> {
        self.table
            .submit(key.0, move |p| p.remove(key.0).is_some())
    }

    /// Drop the per-host entry for `host` (and `prefix`, if given).
    pub fn remove_host(&self, host: &str, prefix: Option<&str>) -> Ticket<bool> {
        self.remove_key(control_key(Some(host), None, prefix))
    }

    /// Drop the per-ip entry for `ip` (and `prefix`, if given).
    pub fn remove_ip(&self, ip: IpAddr, prefix: Option<&str>) -> Ticket<bool> {
        self.remove_key(control_key(None, Some(ip), prefix))
    }

    /// Revalidate every entry against the installed rules and release the
    /// ones that no longer carry state.
    ///
    /// Busy partitions get a sweep queued behind their lock, at most one at a
    /// time per partition.
    pub fn sweep(&self, now: i64) -> SweepReport {
        let mut report = SweepReport::default();
        for idx in 0..self.table.partition_count() {
            let flag = &self.sweep_pending[idx];
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.table.try_flush(idx);
                report.skipped += 1;
                continue;
            }
            let matcher = Arc::clone(&self.matcher);
            let pending = Arc::clone(&self.sweep_pending);
            let mut ticket = self.table.submit_to(idx, move |p| {
                pending[idx].store(false, Ordering::Release);
                sweep_partition(p, &matcher.snapshot(), now)
            });
            if ticket.is_deferred() {
                report.deferred += 1;
                continue;
            }
            if let Some(done) = ticket.try_take() {
                report.swept += 1;
                report.rebound += done.rebound;
                report.removed += done.removed;
            }
        }
        if report.removed > 0 || report.deferred > 0 {
            debug!(?report, "congestion sweep");
        }
        report
    }

    /// Snapshot the congested and at-capacity entries, or every entry with
    /// `include_all`. One ticket per partition.
    pub fn snapshot_entries(&self, include_all: bool) -> Vec<Ticket<Vec<EntrySnapshot>>> {
        let now = self.clock.now();
        (0..self.table.partition_count())
            .map(|idx| {
                self.table.submit_to(idx, move |p| {
                    let mut out = Vec::new();
                    p.for_each(|_, entry| {
                        if include_all || entry.state() != EntryState::Live {
                            out.push(entry.snapshot(now));
                        }
                    });
                    out
                })
            })
            .collect()
    }

    /// Apply every queued operation, waiting for partition locks.
    ///
    /// For shutdown and tests.
    pub fn flush(&self) {
        self.table.flush_all();
    }

    fn with_entry<R, F>(&self, dest: &Destination, rule: Arc<Rule>, op: F) -> Ticket<R>
    where
        F: FnOnce(&DestinationEntry) -> R + Send + 'static,
        R: Send + 'static,
    {
        let key = derive_key(dest.host.as_deref(), dest.ip, &rule);
        let host = dest.host.clone();
        let ip = dest.ip;
        self.table.submit(key.0, move |p| {
            let entry = p.get_or_insert_with(key.0, || DestinationEntry::new(key, host, ip, rule));
            op(entry.as_ref())
        })
    }
}

/// A shared reference to a congestion service.
pub type SharedCongestionService = Arc<CongestionService>;

/// Revalidate and collect one partition.
fn sweep_partition(partition: &mut Partition<DestinationEntry>, rules: &RuleSet, now: i64) -> PartitionSweep {
    let mut sweep = PartitionSweep::default();
    let removed = partition.remove_where(|_, entry| {
        let current = entry.rule();
        let target = MatchTarget::Entry {
            host: entry.hostname(),
            ip: entry.ip(),
            port: current.port,
            prefix: current.prefix.as_deref(),
        };
        let Some(rule) = rules.resolve(target) else {
            return true;
        };
        if derive_key(entry.hostname(), entry.ip(), &rule) != entry.key() {
            return true;
        }
        // equal rules keep their state; a busy entry is retried next sweep
        if *rule != *current && entry.apply_rule(rule) {
            sweep.rebound += 1;
        }
        entry.gc_eligible(now)
    });
    sweep.removed = removed.len();
    sweep
}
