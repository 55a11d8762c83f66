//! Iteration over a [`HashTable`].
//!
//! Three flavours:
//!
//! - [`Iter`] borrows the table; the borrow checker rules out mutation.
//! - [`SafeIter`] is a detached cursor. Mutation between steps is allowed,
//!   and opportunistic rehash steps are paused while it is alive so entries
//!   are not shuffled behind the cursor.
//! - [`FingerprintIter`] is a detached cursor for read-only walks. It records
//!   the table's structural fingerprint and, in debug builds, asserts on
//!   [`release`](FingerprintIter::release) that nothing changed.

use super::policy::DictType;
use super::table::{Entry, HashTable};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Borrowing iterator over both bucket arrays.
pub struct Iter<'a, K, V> {
    tables: [Option<&'a [Option<Box<Entry<K, V>>>]>; 2],
    table: usize,
    bucket: usize,
    node: Option<&'a Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.node {
                self.node = entry.next.as_deref();
                return Some((&entry.key, &entry.value));
            }
            let buckets = self.tables.get(self.table).copied().flatten()?;
            match buckets.get(self.bucket) {
                Some(link) => {
                    self.node = link.as_deref();
                    self.bucket += 1;
                }
                None => {
                    self.table += 1;
                    self.bucket = 0;
                }
            }
        }
    }
}

impl<K, V, T: DictType<K, V>> HashTable<K, V, T> {
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tables: [Some(&self.main.buckets[..]), self.target().map(|t| &t.buckets[..])],
            table: 0,
            bucket: 0,
            node: None,
        }
    }

    /// Starts a safe iteration. Rehash steps triggered by lookups and
    /// inserts are paused until the returned cursor is dropped.
    pub fn safe_iter(&self) -> SafeIter<K> {
        SafeIter {
            cursor: BucketCursor::default(),
            _guard: IterGuard::new(&self.iterators),
        }
    }

    /// Starts a fingerprint-checked iteration.
    pub fn fingerprint_iter(&self) -> FingerprintIter<K> {
        FingerprintIter {
            cursor: BucketCursor::default(),
            fingerprint: self.fingerprint(),
        }
    }

    /// Number of live safe iterators.
    pub fn safe_iterators(&self) -> usize {
        self.iterators.load(Ordering::Relaxed)
    }
}

impl<'a, K, V, T: DictType<K, V>> IntoIterator for &'a HashTable<K, V, T> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

struct IterGuard(Arc<AtomicUsize>);

impl IterGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for IterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Walks bucket by bucket, buffering the keys of one chain at a time.
struct BucketCursor<K> {
    table: usize,
    bucket: usize,
    pending: Vec<K>,
}

impl<K> Default for BucketCursor<K> {
    fn default() -> Self {
        Self {
            table: 0,
            bucket: 0,
            pending: Vec::new(),
        }
    }
}

impl<K: Clone> BucketCursor<K> {
    fn next_key<V, T: DictType<K, V>>(&mut self, ht: &HashTable<K, V, T>) -> Option<K> {
        loop {
            if let Some(key) = self.pending.pop() {
                return Some(key);
            }
            let table = ht.raw_table(self.table)?;
            if self.bucket >= table.size() {
                self.table += 1;
                self.bucket = 0;
                continue;
            }
            let mut cur = table.buckets[self.bucket].as_deref();
            while let Some(entry) = cur {
                self.pending.push(entry.key.clone());
                cur = entry.next.as_deref();
            }
            self.bucket += 1;
        }
    }
}

/// Detached cursor that tolerates mutation between steps.
///
/// Must only be driven with the table it was created from.
pub struct SafeIter<K> {
    cursor: BucketCursor<K>,
    _guard: IterGuard,
}

impl<K: Clone> SafeIter<K> {
    pub fn next_key<V, T: DictType<K, V>>(&mut self, ht: &HashTable<K, V, T>) -> Option<K> {
        self.cursor.next_key(ht)
    }
}

/// Detached cursor for walks that must not mutate the table.
pub struct FingerprintIter<K> {
    cursor: BucketCursor<K>,
    fingerprint: u64,
}

impl<K: Clone> FingerprintIter<K> {
    pub fn next_key<V, T: DictType<K, V>>(&mut self, ht: &HashTable<K, V, T>) -> Option<K> {
        self.cursor.next_key(ht)
    }

    /// Ends the walk. Debug builds panic if the table was structurally
    /// modified since the iterator was created.
    pub fn release<V, T: DictType<K, V>>(self, ht: &HashTable<K, V, T>) {
        debug_assert_eq!(
            self.fingerprint,
            ht.fingerprint(),
            "hash table modified during fingerprint iteration"
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::dict::HashTable;
    use std::collections::HashSet;

    fn table_with(n: u32) -> HashTable<u32, u32> {
        let mut table = HashTable::new();
        for i in 0..n {
            table.insert(i, i).unwrap();
        }
        table
    }

    #[test]
    fn test_iter_covers_both_tables() {
        let mut table = table_with(32);
        while table.rehash_step(1) {}
        table.expand(512).unwrap();
        table.rehash_step(2);
        assert!(table.is_rehashing());

        let seen: HashSet<u32> = table.iter().map(|(k, _)| *k).collect();
        assert_eq!(seen, (0..32).collect());
    }

    #[test]
    fn test_safe_iter_pauses_rehash() {
        let mut table = table_with(32);
        while table.rehash_step(1) {}
        table.expand(512).unwrap();
        let cursor = table.rehash_cursor();

        let mut it = table.safe_iter();
        assert_eq!(table.safe_iterators(), 1);
        for i in 0..32 {
            table.get(&i);
        }
        assert_eq!(table.rehash_cursor(), cursor);

        let mut count = 0;
        while it.next_key(&table).is_some() {
            count += 1;
        }
        assert_eq!(count, 32);

        drop(it);
        assert_eq!(table.safe_iterators(), 0);
        table.get(&0);
        assert_ne!(table.rehash_cursor(), cursor);
    }

    #[test]
    fn test_safe_iter_allows_deletion() {
        let mut table = table_with(100);
        let mut it = table.safe_iter();

        while let Some(key) = it.next_key(&table) {
            if key % 2 == 0 {
                table.delete(&key).unwrap();
            }
        }
        drop(it);

        assert_eq!(table.len(), 50);
        assert!(table.iter().all(|(k, _)| k % 2 == 1));
    }

    #[test]
    fn test_fingerprint_iter_read_only_walk() {
        let table = table_with(40);
        let mut it = table.fingerprint_iter();
        let mut keys = Vec::new();
        while let Some(key) = it.next_key(&table) {
            keys.push(key);
        }
        it.release(&table);

        keys.sort_unstable();
        assert_eq!(keys, (0..40).collect::<Vec<_>>());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "modified during fingerprint iteration")]
    fn test_fingerprint_iter_detects_mutation() {
        let mut table = table_with(10);
        let mut it = table.fingerprint_iter();
        it.next_key(&table);
        table.insert(1000, 0).unwrap();
        it.release(&table);
    }
}
