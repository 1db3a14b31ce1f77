//! Mutex-sharded hash table.

use parking_lot::{Mutex, MutexGuard};

use crate::table::partition::Partition;

/// Default number of partitions.
pub const DEFAULT_PARTITIONS: usize = 64;

/// A fixed set of independently locked [`Partition`]s.
///
/// There is no table-wide lock: operations on different partitions run fully
/// in parallel, and all mutation inside one partition is serialised by that
/// partition's mutex. Keys are expected to be well distributed already
/// (they are digests), so a key's partition is simply `key % partitions`.
#[derive(Debug)]
pub struct PartitionedTable<V> {
    partitions: Box<[Mutex<Partition<V>>]>,
}

impl<V> PartitionedTable<V> {
    /// Create a table with `count` partitions (at least one).
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            partitions: (0..count)
                .map(|_| Mutex::new(Partition::new(count as u64)))
                .collect(),
        }
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition index owning `key`.
    pub fn partition_of(&self, key: u64) -> usize {
        (key % self.partitions.len() as u64) as usize
    }

    /// Lock partition `idx` if that can be done without waiting.
    pub fn try_lock_partition(&self, idx: usize) -> Option<MutexGuard<'_, Partition<V>>> {
        self.partitions[idx].try_lock()
    }

    /// Lock partition `idx`, waiting for the current holder.
    ///
    /// Only for callers off the request path (tests, teardown).
    pub fn lock_partition(&self, idx: usize) -> MutexGuard<'_, Partition<V>> {
        self.partitions[idx].lock()
    }

    /// Entry count summed over partitions (a point-in-time approximation
    /// while other threads are mutating).
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    /// Whether every partition is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
