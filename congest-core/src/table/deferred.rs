//! Lock-or-defer access to a [`PartitionedTable`].
//!
//! Every operation first tries its partition lock. The winner drains that
//! partition's deferred queue in FIFO order and then runs its own operation
//! under the same acquisition. A loser pushes its operation onto the
//! partition's lock-free queue and returns a pending [`Ticket`] at once, so no
//! caller ever waits on another thread's lock. After releasing, a caller makes
//! one more non-blocking attempt to drain anything queued meanwhile; an
//! operation is otherwise applied on the next acquisition of its partition.

use crossbeam_queue::SegQueue;
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::trace;

use crate::table::partition::Partition;
use crate::table::partitioned::PartitionedTable;
use crate::table::ticket::Ticket;

/// An operation waiting for its partition lock.
pub type DeferredOp<V> = Box<dyn FnOnce(&mut Partition<V>) + Send>;

/// Multi-producer FIFO of operations for one partition.
pub struct DeferredQueue<V> {
    ops: SegQueue<DeferredOp<V>>,
}

impl<V> Default for DeferredQueue<V> {
    fn default() -> Self {
        Self {
            ops: SegQueue::new(),
        }
    }
}

impl<V> DeferredQueue<V> {
    /// Queue an operation.
    pub fn push(&self, op: DeferredOp<V>) {
        self.ops.push(op);
    }

    /// Operations currently queued.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply queued operations in submission order.
    ///
    /// Only operations already queued when the drain starts are applied, which
    /// bounds the time the caller holds the partition lock.
    pub fn drain_into(&self, partition: &mut Partition<V>) -> usize {
        let budget = self.ops.len();
        let mut applied = 0;
        while applied < budget {
            let Some(op) = self.ops.pop() else { break };
            op(partition);
            applied += 1;
        }
        applied
    }
}

/// A [`PartitionedTable`] with one [`DeferredQueue`] per partition.
pub struct DeferredTable<V> {
    table: PartitionedTable<V>,
    queues: Box<[DeferredQueue<V>]>,
}

impl<V: Send + Sync + 'static> DeferredTable<V> {
    /// Create a table with `partitions` shards.
    pub fn new(partitions: usize) -> Self {
        let table = PartitionedTable::new(partitions);
        let queues = (0..table.partition_count())
            .map(|_| DeferredQueue::default())
            .collect();
        Self { table, queues }
    }

    /// The underlying table.
    pub fn table(&self) -> &PartitionedTable<V> {
        &self.table
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.table.partition_count()
    }

    /// Operations waiting on partition `idx`.
    pub fn pending(&self, idx: usize) -> usize {
        self.queues[idx].len()
    }

    /// Run `op` on the partition owning `key`, now or once the lock frees up.
    pub fn submit<R, F>(&self, key: u64, op: F) -> Ticket<R>
    where
        F: FnOnce(&mut Partition<V>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.submit_to(self.table.partition_of(key), op)
    }

    /// Run `op` on partition `idx`, now or once the lock frees up.
    pub fn submit_to<R, F>(&self, idx: usize, op: F) -> Ticket<R>
    where
        F: FnOnce(&mut Partition<V>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_or_defer(idx, op, |_, _| {})
    }

    /// Like [`DeferredTable::submit`], but when a deferred result finds no
    /// receiver (its ticket was cancelled or dropped) `undo` runs on it under
    /// the same partition lock.
    pub fn submit_with_undo<R, F, U>(&self, key: u64, op: F, undo: U) -> Ticket<R>
    where
        F: FnOnce(&mut Partition<V>) -> R + Send + 'static,
        U: FnOnce(&mut Partition<V>, R) + Send + 'static,
        R: Send + 'static,
    {
        self.run_or_defer(self.table.partition_of(key), op, undo)
    }

    /// Store `value` under `key`; the ticket yields the replaced value.
    pub fn insert_or_replace(&self, key: u64, value: Arc<V>) -> Ticket<Option<Arc<V>>> {
        self.submit(key, move |p| p.insert_or_replace(key, value))
    }

    /// Remove the value under `key`; the ticket yields it.
    pub fn remove(&self, key: u64) -> Ticket<Option<Arc<V>>> {
        self.submit(key, move |p| p.remove(key))
    }

    /// Look up `key` after every earlier queued operation on its partition.
    pub fn lookup(&self, key: u64) -> Ticket<Option<Arc<V>>> {
        self.submit(key, move |p| p.lookup(key))
    }

    /// Empty partition `idx`; the ticket yields the number of entries dropped.
    pub fn clear_partition(&self, idx: usize) -> Ticket<usize> {
        self.submit_to(idx, Partition::clear)
    }

    /// Drain partition `idx` if its lock is free. Returns whether it was.
    pub fn try_flush(&self, idx: usize) -> bool {
        match self.table.try_lock_partition(idx) {
            Some(mut guard) => {
                self.queues[idx].drain_into(&mut guard);
                true
            }
            None => false,
        }
    }

    /// Lock every partition in turn and apply everything queued.
    ///
    /// Waits for partition locks, so it is meant for teardown and tests only.
    pub fn flush_all(&self) {
        for idx in 0..self.partition_count() {
            let mut guard: MutexGuard<'_, Partition<V>> = self.table.lock_partition(idx);
            while !self.queues[idx].is_empty() {
                self.queues[idx].drain_into(&mut guard);
            }
        }
    }

    fn run_or_defer<R, F, U>(&self, idx: usize, op: F, undo: U) -> Ticket<R>
    where
        F: FnOnce(&mut Partition<V>) -> R + Send + 'static,
        U: FnOnce(&mut Partition<V>, R) + Send + 'static,
        R: Send + 'static,
    {
        match self.table.try_lock_partition(idx) {
            Some(mut guard) => {
                self.queues[idx].drain_into(&mut guard);
                let out = op(&mut guard);
                drop(guard);
                self.retry_drain(idx);
                Ticket::ready(out)
            }
            None => {
                let (ticket, completer) = Ticket::pending();
                self.queues[idx].push(Box::new(move |partition| {
                    if let Err(unclaimed) = completer.offer(op(partition)) {
                        undo(partition, unclaimed);
                    }
                }));
                trace!(partition = idx, "partition busy, operation deferred");
                self.retry_drain(idx);
                ticket
            }
        }
    }

    fn retry_drain(&self, idx: usize) {
        if self.queues[idx].is_empty() {
            return;
        }
        if let Some(mut guard) = self.table.try_lock_partition(idx) {
            self.queues[idx].drain_into(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ticket::TicketState;

    #[test]
    fn busy_partition_defers_and_next_holder_drains() {
        let table: DeferredTable<u64> = DeferredTable::new(4);
        let idx = table.table().partition_of(9);

        let guard = table.table().lock_partition(idx);
        let mut insert = table.insert_or_replace(9, Arc::new(90));
        let mut remove = table.remove(9);
        assert!(insert.is_deferred());
        assert_eq!(insert.state(), TicketState::Pending);
        assert_eq!(table.pending(idx), 2);
        drop(guard);

        // an unrelated key on the same partition takes the lock and drains first
        let mut look = table.lookup(13);
        assert_eq!(look.try_take(), Some(None));
        assert_eq!(table.pending(idx), 0);
        assert_eq!(insert.try_take(), Some(None));
        assert_eq!(remove.try_take().flatten().as_deref(), Some(&90));
    }

    #[test]
    fn cancelled_op_still_applies() {
        let table: DeferredTable<u64> = DeferredTable::new(2);
        let idx = table.table().partition_of(4);
        let guard = table.table().lock_partition(idx);
        let mut ticket = table.insert_or_replace(4, Arc::new(1));
        assert!(ticket.cancel());
        drop(guard);
        table.flush_all();
        assert_eq!(ticket.try_take(), None);
        let mut look = table.lookup(4);
        assert_eq!(look.try_take().flatten().as_deref(), Some(&1));
    }

    #[test]
    fn unclaimed_result_is_undone() {
        let table: DeferredTable<u64> = DeferredTable::new(2);
        let idx = table.table().partition_of(6);
        let guard = table.table().lock_partition(idx);
        let mut kept = table.submit_with_undo(
            6,
            |p| p.insert_or_replace(6, Arc::new(1)).is_none(),
            |_, _| panic!("claimed result must not be undone"),
        );
        let dropped = table.submit_with_undo(
            8,
            |p| p.insert_or_replace(8, Arc::new(2)).is_none(),
            |p, inserted| {
                if inserted {
                    p.remove(8);
                }
            },
        );
        drop(dropped);
        drop(guard);
        table.flush_all();
        assert_eq!(kept.try_take(), Some(true));
        let mut six = table.lookup(6);
        let mut eight = table.lookup(8);
        assert_eq!(six.try_take().flatten().as_deref(), Some(&1));
        assert_eq!(eight.try_take(), Some(None));
    }

    #[test]
    fn free_partition_answers_immediately() {
        let table: DeferredTable<&'static str> = DeferredTable::new(8);
        let mut t = table.insert_or_replace(3, Arc::new("x"));
        assert!(!t.is_deferred());
        assert_eq!(t.try_take(), Some(None));
        let mut cleared = table.clear_partition(table.table().partition_of(3));
        assert_eq!(cleared.try_take(), Some(1));
    }
}
