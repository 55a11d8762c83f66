//! The incrementally rehashing table.
//!
//! ## Layout
//!
//! ```text
//!   main                      rehash = Migrating { target, cursor }
//!   ┌───┐                     ┌───┐
//!   │ 0 │ (empty, migrated)   │ 0 │──> e ──> f
//!   │ 1 │ (empty, migrated)   │ 1 │
//!   │ 2 │──> a ──> b   <─ cursor
//!   │ 3 │──> c                │ 3 │──> g
//!   └───┘                     │...│
//!                             └───┘
//! ```
//!
//! While a migration is in progress every bucket of `main` below `cursor` is
//! empty, new entries always land in `target`, and lookups probe both.
//! Each call that touches the table moves one more bucket across, so the cost
//! of growing is spread over ordinary traffic instead of stalling the server.

use super::policy::{DefaultDictType, DictType, ResizePolicy};
use super::DictError;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Size of a freshly created table. Sizes are always powers of two at least
/// this large.
pub const INITIAL_SIZE: usize = 4;

/// Number of chain-length buckets kept by [`TableStats::histogram`].
pub const STATS_HISTOGRAM_LEN: usize = 50;

/// A stored key/value pair.
#[derive(Clone)]
pub struct Entry<K, V> {
    pub(super) key: K,
    pub(super) value: V,
    pub(super) next: Link<K, V>,
}

pub(super) type Link<K, V> = Option<Box<Entry<K, V>>>;

impl<K, V> Entry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }
}

/// One bucket array with its entry count.
#[derive(Clone)]
pub(super) struct RawTable<K, V> {
    pub(super) buckets: Box<[Link<K, V>]>,
    pub(super) used: usize,
}

impl<K, V> RawTable<K, V> {
    fn with_size(size: usize) -> Self {
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Self {
            buckets: buckets.into_boxed_slice(),
            used: 0,
        }
    }

    pub(super) fn size(&self) -> usize {
        self.buckets.len()
    }

    pub(super) fn mask(&self) -> usize {
        self.buckets.len() - 1
    }
}

/// Migration state. `cursor` is the next bucket of the main table awaiting
/// migration into `target`.
#[derive(Clone)]
pub(super) enum Rehash<K, V> {
    Idle,
    Migrating { target: RawTable<K, V>, cursor: usize },
}

#[derive(Clone, Copy)]
enum Which {
    Main,
    Target,
}

/// Hash table with two bucket arrays and incremental migration between
/// them.
///
/// # Example
///
/// ```
/// use emberkv::dict::HashTable;
///
/// let mut table: HashTable<String, u32> = HashTable::new();
/// table.insert("a".to_string(), 1).unwrap();
/// assert!(table.upsert("b".to_string(), 2));
/// assert_eq!(table.get(&"a".to_string()), Some(&1));
/// assert_eq!(table.len(), 2);
/// ```
pub struct HashTable<K, V, T: DictType<K, V> = DefaultDictType> {
    pub(super) main: RawTable<K, V>,
    pub(super) rehash: Rehash<K, V>,
    pub(super) ty: T,
    policy: ResizePolicy,
    pub(super) iterators: Arc<AtomicUsize>,
}

impl<K: Hash + Eq, V> HashTable<K, V> {
    /// Creates an empty table with its own resize policy.
    pub fn new() -> Self {
        Self::with_type(DefaultDictType::default(), ResizePolicy::default())
    }

    /// Creates an empty table that obeys a shared resize policy.
    pub fn with_policy(policy: ResizePolicy) -> Self {
        Self::with_type(DefaultDictType::default(), policy)
    }
}

impl<K: Hash + Eq, V> Default for HashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, T: DictType<K, V>> HashTable<K, V, T> {
    pub fn with_type(ty: T, policy: ResizePolicy) -> Self {
        Self {
            main: RawTable::with_size(INITIAL_SIZE),
            rehash: Rehash::Idle,
            ty,
            policy,
            iterators: Arc::new(AtomicUsize::new(0)),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn len(&self) -> usize {
        self.main.used + self.target().map_or(0, |t| t.used)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of buckets across both arrays.
    pub fn capacity(&self) -> usize {
        self.main.size() + self.target().map_or(0, |t| t.size())
    }

    /// Bucket count of the main array.
    pub fn table_size(&self) -> usize {
        self.main.size()
    }

    pub fn is_rehashing(&self) -> bool {
        matches!(self.rehash, Rehash::Migrating { .. })
    }

    /// Next bucket awaiting migration, if a migration is in progress.
    pub fn rehash_cursor(&self) -> Option<usize> {
        match &self.rehash {
            Rehash::Migrating { cursor, .. } => Some(*cursor),
            Rehash::Idle => None,
        }
    }

    pub fn policy(&self) -> &ResizePolicy {
        &self.policy
    }

    pub fn dict_type(&self) -> &T {
        &self.ty
    }

    pub(super) fn target(&self) -> Option<&RawTable<K, V>> {
        match &self.rehash {
            Rehash::Migrating { target, .. } => Some(target),
            Rehash::Idle => None,
        }
    }

    /// Table 0 is the main array, table 1 the migration target.
    pub(super) fn raw_table(&self, index: usize) -> Option<&RawTable<K, V>> {
        match index {
            0 => Some(&self.main),
            1 => self.target(),
            _ => None,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Finds an entry, moving one bucket of an ongoing migration first.
    pub fn find(&mut self, key: &K) -> Option<&Entry<K, V>> {
        if self.is_empty() {
            return None;
        }
        self.nudge_rehash();
        self.peek(key)
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut Entry<K, V>> {
        if self.is_empty() {
            return None;
        }
        self.nudge_rehash();
        let (which, idx, depth) = self.locate(key)?;
        entry_at(&mut self.main, &mut self.rehash, which, idx, depth)
    }

    /// Looks an entry up without touching the migration. Usable through a
    /// shared reference, e.g. from a forked child's snapshot.
    pub fn peek(&self, key: &K) -> Option<&Entry<K, V>> {
        let hash = self.ty.hash(key) as usize;
        if let Some(entry) = find_in(&self.main.buckets[hash & self.main.mask()], key, &self.ty) {
            return Some(entry);
        }
        let target = self.target()?;
        find_in(&target.buckets[hash & target.mask()], key, &self.ty)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.find(key).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.find_mut(key).map(|e| &mut e.value)
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Returns (table, bucket, depth-in-chain) of the key.
    fn locate(&self, key: &K) -> Option<(Which, usize, usize)> {
        let hash = self.ty.hash(key) as usize;
        let idx = hash & self.main.mask();
        if let Some(depth) = chain_position(&self.main.buckets[idx], key, &self.ty) {
            return Some((Which::Main, idx, depth));
        }
        let target = self.target()?;
        let idx = hash & target.mask();
        chain_position(&target.buckets[idx], key, &self.ty).map(|depth| (Which::Target, idx, depth))
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Adds a new entry. Fails with [`DictError::KeyExists`] without touching
    /// the stored value when the key is present.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), DictError> {
        self.nudge_rehash();
        self.expand_if_needed();
        if self.locate(&key).is_some() {
            return Err(DictError::KeyExists);
        }
        self.link_new(key, value);
        Ok(())
    }

    /// Inserts or replaces. The replaced value goes through the destructor
    /// hook; the passed key is discarded when one is already stored.
    ///
    /// # Returns
    ///
    /// `true` if the key was newly created.
    pub fn upsert(&mut self, key: K, value: V) -> bool {
        self.nudge_rehash();
        self.expand_if_needed();
        let Some((which, idx, depth)) = self.locate(&key) else {
            self.link_new(key, value);
            return true;
        };
        let old = match entry_at(&mut self.main, &mut self.rehash, which, idx, depth) {
            Some(entry) => std::mem::replace(&mut entry.value, value),
            None => return false,
        };
        self.ty.drop_value(old);
        false
    }

    /// Unlinks an entry and hands it back without running destructor hooks.
    pub fn remove(&mut self, key: &K) -> Option<(K, V)> {
        if self.is_empty() {
            return None;
        }
        self.nudge_rehash();
        let (which, idx, depth) = self.locate(key)?;
        let table = match which {
            Which::Main => &mut self.main,
            Which::Target => match &mut self.rehash {
                Rehash::Migrating { target, .. } => target,
                Rehash::Idle => return None,
            },
        };
        let link = link_at(&mut table.buckets[idx], depth)?;
        let mut node = link.take()?;
        *link = node.next.take();
        table.used -= 1;
        let node = *node;
        Some((node.key, node.value))
    }

    /// Removes an entry and disposes of its key and value.
    pub fn delete(&mut self, key: &K) -> Result<(), DictError> {
        let (key, value) = self.remove(key).ok_or(DictError::NotFound)?;
        self.ty.drop_key(key);
        self.ty.drop_value(value);
        Ok(())
    }

    /// Drops every entry and shrinks back to the initial size.
    pub fn clear(&mut self) {
        release_table(&mut self.main, &self.ty);
        if let Rehash::Migrating { target, .. } = &mut self.rehash {
            release_table(target, &self.ty);
        }
        self.main = RawTable::with_size(INITIAL_SIZE);
        self.rehash = Rehash::Idle;
    }

    fn link_new(&mut self, key: K, value: V) -> &mut Entry<K, V> {
        let hash = self.ty.hash(&key) as usize;
        let table = match &mut self.rehash {
            Rehash::Migrating { target, .. } => target,
            Rehash::Idle => &mut self.main,
        };
        let idx = hash & table.mask();
        let next = table.buckets[idx].take();
        table.used += 1;
        table.buckets[idx].insert(Box::new(Entry { key, value, next }))
    }

    // ========================================================================
    // Resizing
    // ========================================================================

    /// Starts migrating to a table of the next power of two `>= size`.
    ///
    /// Ignores the resize policy. Fails if a migration is already running,
    /// if `size` cannot hold the current entries, or if the size would not
    /// change.
    pub fn expand(&mut self, size: usize) -> Result<(), DictError> {
        if self.is_rehashing() {
            return Err(DictError::ResizeForbidden);
        }
        if self.main.used > size {
            return Err(DictError::InvalidSize(size));
        }
        let real = size
            .max(INITIAL_SIZE)
            .checked_next_power_of_two()
            .ok_or(DictError::InvalidSize(size))?;
        if real == self.main.size() {
            return Err(DictError::InvalidSize(size));
        }
        if self.main.used == 0 {
            self.main = RawTable::with_size(real);
            return Ok(());
        }
        self.rehash = Rehash::Migrating {
            target: RawTable::with_size(real),
            cursor: 0,
        };
        Ok(())
    }

    /// Like [`expand`](Self::expand), but honours the resize policy: while
    /// resizing is suppressed it is refused unless the load ratio exceeds the
    /// force ratio.
    pub fn resize(&mut self, size: usize) -> Result<(), DictError> {
        if self.is_rehashing() {
            return Err(DictError::ResizeForbidden);
        }
        let ratio = self.main.used / self.main.size();
        if !self.policy.is_enabled() && ratio <= self.policy.force_ratio() {
            return Err(DictError::ResizeForbidden);
        }
        self.expand(size)
    }

    /// Resizes to the smallest table holding every entry.
    pub fn shrink_to_fit(&mut self) -> Result<(), DictError> {
        self.resize(self.main.used.max(INITIAL_SIZE))
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        let size = self.main.size();
        let used = self.main.used;
        if used >= size && (self.policy.is_enabled() || used / size > self.policy.force_ratio()) {
            // Only fails when the size would not change.
            let _ = self.expand(used * 2);
        }
    }

    // ========================================================================
    // Incremental rehash
    // ========================================================================

    /// Migrates up to `n` non-empty buckets, visiting at most `10 * n` empty
    /// ones on the way.
    ///
    /// # Returns
    ///
    /// `true` while migration work remains.
    pub fn rehash_step(&mut self, n: usize) -> bool {
        let Rehash::Migrating { target, cursor } = &mut self.rehash else {
            return false;
        };
        let mut empty_visits = n * 10;
        let mut remaining = n;

        while remaining > 0 && self.main.used != 0 {
            remaining -= 1;
            debug_assert!(*cursor < self.main.size());
            while self.main.buckets[*cursor].is_none() {
                *cursor += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }
            let mut chain = self.main.buckets[*cursor].take();
            while let Some(mut node) = chain {
                chain = node.next.take();
                let idx = (self.ty.hash(&node.key) as usize) & target.mask();
                node.next = target.buckets[idx].take();
                target.buckets[idx] = Some(node);
                self.main.used -= 1;
                target.used += 1;
            }
            *cursor += 1;
        }

        if self.main.used == 0 {
            if let Rehash::Migrating { target, .. } = std::mem::replace(&mut self.rehash, Rehash::Idle) {
                self.main = target;
            }
            return false;
        }
        true
    }

    /// Runs 100-bucket steps until `budget` is spent. Does nothing while
    /// safe iterators are alive.
    ///
    /// # Returns
    ///
    /// Number of buckets scheduled for migration.
    pub fn rehash_for(&mut self, budget: Duration) -> usize {
        if self.iterators.load(Ordering::Relaxed) > 0 {
            return 0;
        }
        let start = Instant::now();
        let mut rehashes = 0;
        while self.rehash_step(100) {
            rehashes += 100;
            if start.elapsed() > budget {
                break;
            }
        }
        rehashes
    }

    fn nudge_rehash(&mut self) {
        if self.is_rehashing() && self.iterators.load(Ordering::Relaxed) == 0 {
            self.rehash_step(1);
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Checksum over both arrays' addresses, sizes and counts.
    pub fn fingerprint(&self) -> u64 {
        let (target_ptr, target_size, target_used) = match self.target() {
            Some(t) => (t.buckets.as_ptr() as usize, t.size(), t.used),
            None => (0, 0, 0),
        };
        let integers = [
            self.main.buckets.as_ptr() as usize as u64,
            self.main.size() as u64,
            self.main.used as u64,
            target_ptr as u64,
            target_size as u64,
            target_used as u64,
        ];
        integers.iter().fold(0u64, |hash, &i| mix64(hash.wrapping_add(i)))
    }

    pub fn stats(&self) -> DictStats {
        DictStats {
            main: table_stats(&self.main),
            target: self.target().map(table_stats),
        }
    }
}

impl<K: Clone, V: Clone, T: DictType<K, V> + Clone> Clone for HashTable<K, V, T> {
    fn clone(&self) -> Self {
        Self {
            main: self.main.clone(),
            rehash: self.rehash.clone(),
            ty: self.ty.clone(),
            policy: self.policy.clone(),
            iterators: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<K, V, T: DictType<K, V>> Drop for HashTable<K, V, T> {
    fn drop(&mut self) {
        release_table(&mut self.main, &self.ty);
        if let Rehash::Migrating { target, .. } = &mut self.rehash {
            release_table(target, &self.ty);
        }
    }
}

impl<K, V, T: DictType<K, V>> fmt::Debug for HashTable<K, V, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("len", &self.len())
            .field("size", &self.main.size())
            .field("rehash_cursor", &self.rehash_cursor())
            .finish()
    }
}

// ============================================================================
// Chain helpers
// ============================================================================

fn find_in<'a, K, V, T: DictType<K, V>>(link: &'a Link<K, V>, key: &K, ty: &T) -> Option<&'a Entry<K, V>> {
    let mut cur = link.as_deref();
    while let Some(entry) = cur {
        if ty.key_eq(&entry.key, key) {
            return Some(entry);
        }
        cur = entry.next.as_deref();
    }
    None
}

fn chain_position<K, V, T: DictType<K, V>>(link: &Link<K, V>, key: &K, ty: &T) -> Option<usize> {
    let mut cur = link.as_deref();
    let mut depth = 0;
    while let Some(entry) = cur {
        if ty.key_eq(&entry.key, key) {
            return Some(depth);
        }
        depth += 1;
        cur = entry.next.as_deref();
    }
    None
}

fn link_at<K, V>(mut link: &mut Link<K, V>, depth: usize) -> Option<&mut Link<K, V>> {
    for _ in 0..depth {
        link = &mut link.as_mut()?.next;
    }
    Some(link)
}

fn entry_at<'a, K, V>(
    main: &'a mut RawTable<K, V>,
    rehash: &'a mut Rehash<K, V>,
    which: Which,
    idx: usize,
    depth: usize,
) -> Option<&'a mut Entry<K, V>> {
    let table = match which {
        Which::Main => main,
        Which::Target => match rehash {
            Rehash::Migrating { target, .. } => target,
            Rehash::Idle => return None,
        },
    };
    link_at(&mut table.buckets[idx], depth)?.as_deref_mut()
}

fn release_table<K, V, T: DictType<K, V>>(table: &mut RawTable<K, V>, ty: &T) {
    for bucket in table.buckets.iter_mut() {
        let mut chain = bucket.take();
        while let Some(mut node) = chain {
            chain = node.next.take();
            let node = *node;
            ty.drop_key(node.key);
            ty.drop_value(node.value);
        }
    }
    table.used = 0;
}

/// Thomas Wang's 64 bit integer mix.
fn mix64(mut key: u64) -> u64 {
    key = (!key).wrapping_add(key << 21);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key.wrapping_add(key << 31)
}

// ============================================================================
// Stats
// ============================================================================

/// Shape of one bucket array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    pub size: usize,
    pub used: usize,
    pub non_empty_slots: usize,
    pub max_chain: usize,
    /// `histogram[n]` counts buckets with a chain of length `n`; the last
    /// slot absorbs longer chains.
    pub histogram: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictStats {
    pub main: TableStats,
    pub target: Option<TableStats>,
}

fn table_stats<K, V>(table: &RawTable<K, V>) -> TableStats {
    let mut stats = TableStats {
        size: table.size(),
        used: table.used,
        non_empty_slots: 0,
        max_chain: 0,
        histogram: vec![0; STATS_HISTOGRAM_LEN],
    };
    for bucket in table.buckets.iter() {
        let mut len = 0;
        let mut cur = bucket.as_deref();
        while let Some(entry) = cur {
            len += 1;
            cur = entry.next.as_deref();
        }
        if len > 0 {
            stats.non_empty_slots += 1;
        }
        stats.max_chain = stats.max_chain.max(len);
        stats.histogram[len.min(STATS_HISTOGRAM_LEN - 1)] += 1;
    }
    stats
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.used == 0 {
            return writeln!(f, " table size: {}\n No stats available for empty dictionaries", self.size);
        }
        writeln!(f, " table size: {}", self.size)?;
        writeln!(f, " number of elements: {}", self.used)?;
        writeln!(f, " different slots: {}", self.non_empty_slots)?;
        writeln!(f, " max chain length: {}", self.max_chain)?;
        let avg = self.used as f64 / self.non_empty_slots.max(1) as f64;
        writeln!(f, " avg chain length (counted): {:.02}", avg)?;
        writeln!(f, " avg chain length (computed): {:.02}", self.used as f64 / self.size as f64)?;
        writeln!(f, " Chain length distribution:")?;
        for (len, &count) in self.histogram.iter().enumerate().filter(|(_, c)| **c > 0) {
            let pct = count as f64 * 100.0 / self.size as f64;
            writeln!(f, "   {}: {} ({:.02}%)", len, count, pct)?;
        }
        Ok(())
    }
}

impl fmt::Display for DictStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hash table 0 stats (main hash table):")?;
        write!(f, "{}", self.main)?;
        if let Some(target) = &self.target {
            writeln!(f, "Hash table 1 stats (rehashing target):")?;
            write!(f, "{}", target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;
    use std::rc::Rc;

    /// Every key lands in the same bucket.
    #[derive(Clone, Default)]
    struct Colliding;

    impl DictType<u64, u64> for Colliding {
        fn hash(&self, _key: &u64) -> u64 {
            7
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }
    }

    /// Counts destructor invocations.
    #[derive(Clone, Default)]
    struct Counting {
        keys: Rc<Cell<usize>>,
        values: Rc<Cell<usize>>,
    }

    impl DictType<u64, String> for Counting {
        fn hash(&self, key: &u64) -> u64 {
            let mut h = DefaultHasher::new();
            h.write_u64(*key);
            h.finish()
        }

        fn key_eq(&self, a: &u64, b: &u64) -> bool {
            a == b
        }

        fn drop_key(&self, _key: u64) {
            self.keys.set(self.keys.get() + 1);
        }

        fn drop_value(&self, _value: String) {
            self.values.set(self.values.get() + 1);
        }
    }

    fn finish_rehash<K, V, T: DictType<K, V>>(table: &mut HashTable<K, V, T>) {
        while table.rehash_step(1) {}
    }

    #[test]
    fn test_insert_find_delete() {
        let mut table: HashTable<String, i32> = HashTable::new();

        table.insert("one".into(), 1).unwrap();
        table.insert("two".into(), 2).unwrap();

        assert_eq!(table.get(&"one".into()), Some(&1));
        assert_eq!(table.get(&"three".into()), None);
        assert_eq!(table.len(), 2);

        table.delete(&"one".into()).unwrap();
        assert_eq!(table.get(&"one".into()), None);
        assert_eq!(table.delete(&"one".into()), Err(DictError::NotFound));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_existing_key_fails() {
        let mut table: HashTable<&str, i32> = HashTable::new();
        table.insert("k", 1).unwrap();

        assert_eq!(table.insert("k", 2), Err(DictError::KeyExists));
        assert_eq!(table.get(&"k"), Some(&1));
    }

    #[test]
    fn test_upsert_replaces_and_disposes_old_value() {
        let ty = Counting::default();
        let mut table = HashTable::with_type(ty.clone(), ResizePolicy::default());

        assert!(table.upsert(1, "a".to_string()));
        assert!(!table.upsert(1, "b".to_string()));

        assert_eq!(table.get(&1).map(String::as_str), Some("b"));
        assert_eq!(ty.values.get(), 1);
        assert_eq!(ty.keys.get(), 0);
    }

    #[test]
    fn test_five_inserts_expand_once_to_eight() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        assert_eq!(table.table_size(), INITIAL_SIZE);

        let mut expansions = 0;
        for i in 0..5 {
            let was_rehashing = table.is_rehashing();
            table.insert(i, i).unwrap();
            if !was_rehashing && table.is_rehashing() {
                expansions += 1;
            }
        }
        finish_rehash(&mut table);

        assert_eq!(expansions, 1);
        assert_eq!(table.table_size(), 8);
        assert_eq!(table.len(), 5);
        assert!(!table.is_rehashing());
    }

    #[test]
    fn test_lookups_see_both_tables_during_rehash() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        for i in 0..64 {
            table.insert(i, i * 10).unwrap();
        }
        finish_rehash(&mut table);
        table.expand(1024).unwrap();
        assert!(table.is_rehashing());

        for i in 0..64 {
            assert_eq!(table.peek(&i).map(|e| *e.value()), Some(i * 10));
        }
        for i in 0..64 {
            assert_eq!(table.get(&i), Some(&(i * 10)));
        }
        finish_rehash(&mut table);
        assert_eq!(table.table_size(), 1024);
        assert_eq!(table.len(), 64);
    }

    #[test]
    fn test_inserts_land_in_target_while_rehashing() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        for i in 0..4 {
            table.insert(i, i).unwrap();
        }
        table.expand(64).unwrap();
        table.insert(100, 100).unwrap();

        assert!(table.target().map_or(0, |t| t.used) >= 1);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_rehash_step_bounds_empty_visits() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        table.expand(1 << 12).unwrap();
        table.insert(1, 1).unwrap();
        table.expand(8).unwrap();

        // One step visits at most ten empty buckets before giving up.
        let before = table.rehash_cursor().unwrap();
        table.rehash_step(1);
        let after = table.rehash_cursor().unwrap_or(before);
        assert!(after - before <= 10 || !table.is_rehashing());

        finish_rehash(&mut table);
        assert_eq!(table.table_size(), 8);
        assert_eq!(table.get(&1), Some(&1));
    }

    #[test]
    fn test_expand_refused_while_rehashing() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        for i in 0..8 {
            table.insert(i, i).unwrap();
        }
        finish_rehash(&mut table);
        table.expand(64).unwrap();

        assert_eq!(table.expand(128), Err(DictError::ResizeForbidden));
        assert_eq!(table.resize(128), Err(DictError::ResizeForbidden));
    }

    #[test]
    fn test_expand_rejects_same_or_too_small_size() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        for i in 0..3 {
            table.insert(i, i).unwrap();
        }

        assert_eq!(table.expand(2), Err(DictError::InvalidSize(2)));
        assert_eq!(table.expand(4), Err(DictError::InvalidSize(4)));
    }

    #[test]
    fn test_suppressed_policy_defers_growth_until_forced() {
        let policy = ResizePolicy::default();
        policy.forbid();
        let mut table: HashTable<u32, u32> = HashTable::with_policy(policy.clone());

        // Load ratio may reach the force ratio without growing.
        for i in 0..(4 * 5 + 1) as u32 {
            table.insert(i, i).unwrap();
        }
        assert_eq!(table.table_size(), 4);
        assert!(!table.is_rehashing());

        // A few more push the ratio past it.
        for i in 21..25u32 {
            table.insert(i, i).unwrap();
        }
        assert!(table.is_rehashing());

        finish_rehash(&mut table);
        policy.allow();
        assert!(table.table_size() > 4);
        for i in 0..25u32 {
            assert_eq!(table.get(&i), Some(&i));
        }
    }

    #[test]
    fn test_shrink_to_fit_respects_policy() {
        let policy = ResizePolicy::default();
        let mut table: HashTable<u32, u32> = HashTable::with_policy(policy.clone());
        for i in 0..100 {
            table.insert(i, i).unwrap();
        }
        finish_rehash(&mut table);
        for i in 0..95 {
            table.delete(&i).unwrap();
        }

        policy.forbid();
        assert_eq!(table.shrink_to_fit(), Err(DictError::ResizeForbidden));

        policy.allow();
        table.shrink_to_fit().unwrap();
        finish_rehash(&mut table);
        assert_eq!(table.table_size(), 8);
        for i in 95..100 {
            assert_eq!(table.get(&i), Some(&i));
        }
    }

    #[test]
    fn test_colliding_keys_share_one_chain() {
        let mut table = HashTable::with_type(Colliding, ResizePolicy::default());
        for i in 0..10u64 {
            table.insert(i, i + 1).unwrap();
        }
        finish_rehash(&mut table);

        let stats = table.stats();
        assert_eq!(stats.main.non_empty_slots, 1);
        assert_eq!(stats.main.max_chain, 10);

        table.delete(&4).unwrap();
        table.delete(&0).unwrap();
        table.delete(&9).unwrap();
        for i in [1u64, 2, 3, 5, 6, 7, 8] {
            assert_eq!(table.get(&i), Some(&(i + 1)));
        }
        assert_eq!(table.len(), 7);
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut table: HashTable<&str, Vec<u8>> = HashTable::new();
        table.insert("k", vec![1]).unwrap();
        table.get_mut(&"k").unwrap().push(2);

        assert_eq!(table.get(&"k"), Some(&vec![1, 2]));
    }

    #[test]
    fn test_remove_bypasses_destructors() {
        let ty = Counting::default();
        let mut table = HashTable::with_type(ty.clone(), ResizePolicy::default());
        table.insert(1, "a".to_string()).unwrap();
        table.insert(2, "b".to_string()).unwrap();

        assert_eq!(table.remove(&1), Some((1, "a".to_string())));
        assert_eq!(ty.keys.get(), 0);

        table.delete(&2).unwrap();
        assert_eq!((ty.keys.get(), ty.values.get()), (1, 1));
    }

    #[test]
    fn test_clear_and_drop_run_destructors() {
        let ty = Counting::default();
        {
            let mut table = HashTable::with_type(ty.clone(), ResizePolicy::default());
            for i in 0..10 {
                table.insert(i, i.to_string()).unwrap();
            }
            table.clear();
            assert_eq!(table.len(), 0);
            assert_eq!(table.table_size(), INITIAL_SIZE);
            assert_eq!(ty.keys.get(), 10);

            for i in 0..3 {
                table.insert(i, i.to_string()).unwrap();
            }
        }
        assert_eq!(ty.keys.get(), 13);
        assert_eq!(ty.values.get(), 13);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        for i in 0..20 {
            table.insert(i, i).unwrap();
        }
        let mut copy = table.clone();
        copy.delete(&3).unwrap();

        assert_eq!(table.get(&3), Some(&3));
        assert_eq!(copy.get(&3), None);
        assert_eq!(copy.len(), 19);
    }

    #[test]
    fn test_fingerprint_tracks_structure() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        table.insert(1, 1).unwrap();
        let before = table.fingerprint();

        *table.get_mut(&1).unwrap() = 5;
        assert_eq!(table.fingerprint(), before);

        table.insert(2, 2).unwrap();
        assert_ne!(table.fingerprint(), before);
    }

    #[test]
    fn test_rehash_for_finishes_migration() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        for i in 0..1000 {
            table.insert(i, i).unwrap();
        }
        table.expand(1 << 16).ok();
        while table.is_rehashing() {
            table.rehash_for(Duration::from_millis(1));
        }
        assert_eq!(table.len(), 1000);
    }

    #[test]
    fn test_stats_display() {
        let mut table: HashTable<u32, u32> = HashTable::new();
        table.insert(1, 1).unwrap();
        let text = table.stats().to_string();

        assert!(text.contains("Hash table 0 stats"));
        assert!(text.contains("number of elements: 1"));
    }
}
