//! One independently locked shard of the destination table.

use std::sync::Arc;

/// Average chain length above which a partition doubles its bucket count.
pub const MAX_AVG_CHAIN: usize = 4;

const INITIAL_BUCKETS: usize = 8;

/// A chained hash table keyed by pre-hashed 64-bit keys.
///
/// Values are shared (`Arc`) so callers can keep using an entry after the
/// partition lock is released or the slot is removed. A partition is only ever
/// touched while its owner holds the partition lock.
#[derive(Debug)]
pub struct Partition<V> {
    buckets: Vec<Vec<(u64, Arc<V>)>>,
    len: usize,
    stride: u64,
}

impl<V> Partition<V> {
    /// An empty partition. `stride` is the partition count of the owning table;
    /// bucket selection divides it out since every key here shares `key % stride`.
    pub fn new(stride: u64) -> Self {
        Self {
            buckets: (0..INITIAL_BUCKETS).map(|_| Vec::new()).collect(),
            len: 0,
            stride: stride.max(1),
        }
    }

    fn bucket_of(&self, key: u64) -> usize {
        ((key / self.stride) % self.buckets.len() as u64) as usize
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the partition holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current bucket count.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Find the value stored under `key`.
    pub fn lookup(&self, key: u64) -> Option<Arc<V>> {
        self.buckets[self.bucket_of(key)]
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| Arc::clone(v))
    }

    /// Store `value` under `key`, returning the value it replaced.
    pub fn insert_or_replace(&mut self, key: u64, value: Arc<V>) -> Option<Arc<V>> {
        let idx = self.bucket_of(key);
        if let Some(slot) = self.buckets[idx].iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.buckets[idx].push((key, value));
        self.len += 1;
        if self.len > self.buckets.len() * MAX_AVG_CHAIN {
            self.grow();
        }
        None
    }

    /// Return the value under `key`, creating it with `make` on a miss.
    pub fn get_or_insert_with(&mut self, key: u64, make: impl FnOnce() -> V) -> Arc<V> {
        if let Some(existing) = self.lookup(key) {
            return existing;
        }
        let value = Arc::new(make());
        self.insert_or_replace(key, Arc::clone(&value));
        value
    }

    /// Remove and return the value under `key`.
    pub fn remove(&mut self, key: u64) -> Option<Arc<V>> {
        let idx = self.bucket_of(key);
        let chain = &mut self.buckets[idx];
        let pos = chain.iter().position(|(k, _)| *k == key)?;
        self.len -= 1;
        Some(chain.swap_remove(pos).1)
    }

    /// Visit every entry.
    pub fn for_each(&self, mut f: impl FnMut(u64, &Arc<V>)) {
        for (key, value) in self.buckets.iter().flatten() {
            f(*key, value);
        }
    }

    /// Remove every entry for which `collect` returns true and hand them back.
    ///
    /// The partition's own reference is dropped when the caller drops the
    /// returned values.
    pub fn remove_where(&mut self, mut collect: impl FnMut(u64, &Arc<V>) -> bool) -> Vec<Arc<V>> {
        let mut removed = Vec::new();
        for chain in &mut self.buckets {
            let mut i = 0;
            while i < chain.len() {
                if collect(chain[i].0, &chain[i].1) {
                    removed.push(chain.swap_remove(i).1);
                } else {
                    i += 1;
                }
            }
        }
        self.len -= removed.len();
        removed
    }

    /// Remove everything, returning the number of entries dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.buckets.iter_mut().for_each(Vec::clear);
        self.len = 0;
        dropped
    }

    fn grow(&mut self) {
        let doubled = self.buckets.len() * 2;
        let old = std::mem::replace(&mut self.buckets, (0..doubled).map(|_| Vec::new()).collect());
        for (key, value) in old.into_iter().flatten() {
            let idx = self.bucket_of(key);
            self.buckets[idx].push((key, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn insert_replaces_by_key() {
        let mut p = Partition::new(4);
        assert!(p.insert_or_replace(8, Arc::new("a")).is_none());
        let prev = p.insert_or_replace(8, Arc::new("b"));
        assert_eq!(prev.as_deref(), Some(&"a"));
        assert_eq!(p.len(), 1);
        assert_eq!(p.lookup(8).as_deref(), Some(&"b"));
    }

    #[test]
    fn grows_when_chains_get_long() {
        let mut p = Partition::new(1);
        for key in 0..(INITIAL_BUCKETS * MAX_AVG_CHAIN + 1) as u64 {
            p.insert_or_replace(key, Arc::new(key));
        }
        assert_eq!(p.bucket_count(), INITIAL_BUCKETS * 2);
        for key in 0..(INITIAL_BUCKETS * MAX_AVG_CHAIN + 1) as u64 {
            assert_eq!(p.lookup(key).as_deref(), Some(&key));
        }
    }

    #[test]
    fn remove_where_releases_matching_entries() {
        let mut p = Partition::new(1);
        for key in 0..10u64 {
            p.insert_or_replace(key, Arc::new(key));
        }
        let removed = p.remove_where(|k, _| k % 2 == 0);
        assert_eq!(removed.len(), 5);
        assert_eq!(p.len(), 5);
        let mut left = Vec::new();
        p.for_each(|k, _| left.push(k));
        left.sort_unstable();
        assert_eq!(left, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn get_or_insert_keeps_existing() {
        let mut p = Partition::new(1);
        let first = p.get_or_insert_with(3, || 1);
        let second = p.get_or_insert_with(3, || 2);
        assert!(Arc::ptr_eq(&first, &second));
    }

    proptest! {
        #[test]
        fn behaves_like_a_map(ops in proptest::collection::vec((0u8..3, 0u64..200, any::<u32>()), 1..400)) {
            let mut p = Partition::new(16);
            let mut model = HashMap::new();
            for (op, slot, value) in ops {
                // keys owned by partition 5 of a 16-way table
                let key = slot * 16 + 5;
                match op {
                    0 => {
                        let prev = p.insert_or_replace(key, Arc::new(value)).map(|v| *v);
                        prop_assert_eq!(prev, model.insert(key, value));
                    }
                    1 => prop_assert_eq!(p.remove(key).map(|v| *v), model.remove(&key)),
                    _ => prop_assert_eq!(p.lookup(key).map(|v| *v), model.get(&key).copied()),
                }
                prop_assert_eq!(p.len(), model.len());
            }
            prop_assert!(p.len() <= p.bucket_count() * MAX_AVG_CHAIN);
        }
    }
}
