//! The keyspace: numbered databases sharing one resize policy.
//!
//! ## Expiry
//!
//! Expired keys are removed in two ways:
//! 1. **Lazy**: any access through [`Keyspace::lookup_read`] or
//!    [`Keyspace::lookup_write`] first checks the key's deadline
//! 2. **Active**: [`Keyspace::active_expire_cycle`] samples the expiry
//!    index from the cron under a time budget
//!
//! Both queue the removed key so the caller can propagate a `DEL` to the
//! append-only log. While loading, keys past their deadline are left alone:
//! the log being replayed contains the deletions itself.

use super::db::{Db, Value};
use crate::dict::ResizePolicy;
use crate::reactor::{Clock, SystemClock};
use bytes::Bytes;
use std::fmt;

/// Counters reported by `INFO stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyspaceStats {
    pub expired_keys: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
}

/// All databases of one server.
///
/// # Example
///
/// ```
/// use emberkv::storage::{Keyspace, Value};
/// use bytes::Bytes;
///
/// let mut ks = Keyspace::new(16);
/// ks.set(0, Bytes::from("name"), Value::Str(Bytes::from("Ariz")));
/// assert_eq!(
///     ks.lookup_read(0, &Bytes::from("name")),
///     Some(&Value::Str(Bytes::from("Ariz")))
/// );
/// assert!(ks.lookup_read(1, &Bytes::from("name")).is_none());
/// ```
pub struct Keyspace {
    dbs: Vec<Db>,
    policy: ResizePolicy,
    loading: bool,
    expired: Vec<(usize, Bytes)>,
    clock: Box<dyn Clock>,
    pub(crate) stats: KeyspaceStats,
    /// Next database visited by the active expiry cycle.
    pub(crate) expire_db: usize,
}

impl Keyspace {
    pub fn new(databases: usize) -> Self {
        Self::with_clock(databases, ResizePolicy::default(), SystemClock)
    }

    pub fn with_policy(databases: usize, policy: ResizePolicy) -> Self {
        Self::with_clock(databases, policy, SystemClock)
    }

    pub fn with_clock(databases: usize, policy: ResizePolicy, clock: impl Clock + 'static) -> Self {
        let dbs = (0..databases.max(1)).map(|id| Db::new(id, policy.clone())).collect();
        Self {
            dbs,
            policy,
            loading: false,
            expired: Vec::new(),
            clock: Box::new(clock),
            stats: KeyspaceStats::default(),
            expire_db: 0,
        }
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    pub fn db(&self, id: usize) -> Option<&Db> {
        self.dbs.get(id)
    }

    pub fn db_mut(&mut self, id: usize) -> Option<&mut Db> {
        self.dbs.get_mut(id)
    }

    pub fn dbs_mut(&mut self) -> &mut [Db] {
        &mut self.dbs
    }

    /// The resize switch shared by every table.
    pub fn policy(&self) -> &ResizePolicy {
        &self.policy
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms() as i64
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    pub fn stats(&self) -> KeyspaceStats {
        self.stats
    }

    /// Total keys across all databases.
    pub fn len(&self) -> usize {
        self.dbs.iter().map(Db::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Deletes `key` if its deadline has passed.
    ///
    /// # Returns
    ///
    /// `true` if the key was expired and removed.
    pub fn expire_if_needed(&mut self, db: usize, key: &Bytes) -> bool {
        if self.loading {
            return false;
        }
        let now = self.now_ms();
        let Some(d) = self.dbs.get_mut(db) else {
            return false;
        };
        match d.expire_of(key) {
            Some(when) if when <= now => {
                d.dict.remove(key);
                d.expires.remove(key);
                self.note_expired(db, key.clone());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn note_expired(&mut self, db: usize, key: Bytes) {
        self.stats.expired_keys += 1;
        self.expired.push((db, key));
    }

    /// Keys removed by expiry since the last call, in removal order.
    pub fn take_expired(&mut self) -> Vec<(usize, Bytes)> {
        std::mem::take(&mut self.expired)
    }

    /// Sets an absolute deadline. The key must exist.
    ///
    /// # Returns
    ///
    /// `false` if the key does not exist.
    pub fn set_expire(&mut self, db: usize, key: &Bytes, when_ms: i64) -> bool {
        let Some(d) = self.dbs.get_mut(db) else {
            return false;
        };
        if d.dict.find(key).is_none() {
            return false;
        }
        d.expires.upsert(key.clone(), when_ms);
        true
    }

    pub fn get_expire(&self, db: usize, key: &Bytes) -> Option<i64> {
        self.dbs.get(db)?.expire_of(key)
    }

    /// Removes the deadline of `key`.
    pub fn persist(&mut self, db: usize, key: &Bytes) -> bool {
        self.dbs
            .get_mut(db)
            .is_some_and(|d| d.expires.remove(key).is_some())
    }

    // ========================================================================
    // Access
    // ========================================================================

    /// Looks a key up for reading, counting a hit or miss.
    pub fn lookup_read(&mut self, db: usize, key: &Bytes) -> Option<&Value> {
        self.expire_if_needed(db, key);
        let found = self.dbs.get_mut(db)?.dict.find(key).is_some();
        if found {
            self.stats.keyspace_hits += 1;
        } else {
            self.stats.keyspace_misses += 1;
        }
        self.dbs.get_mut(db)?.dict.get(key)
    }

    /// Looks a key up for modification.
    pub fn lookup_write(&mut self, db: usize, key: &Bytes) -> Option<&mut Value> {
        self.expire_if_needed(db, key);
        self.dbs.get_mut(db)?.dict.get_mut(key)
    }

    pub fn exists(&mut self, db: usize, key: &Bytes) -> bool {
        self.expire_if_needed(db, key);
        self.dbs.get_mut(db).is_some_and(|d| d.dict.contains_key(key))
    }

    /// Stores `value`, clearing any deadline.
    pub fn set(&mut self, db: usize, key: Bytes, value: Value) {
        self.set_with(db, key, value, false);
    }

    /// Stores `value`; `keep_ttl` preserves an existing deadline.
    pub fn set_with(&mut self, db: usize, key: Bytes, value: Value, keep_ttl: bool) {
        let Some(d) = self.dbs.get_mut(db) else {
            return;
        };
        if !keep_ttl {
            d.expires.remove(&key);
        }
        d.dict.upsert(key, value);
    }

    /// Removes a key and its deadline.
    ///
    /// # Returns
    ///
    /// The removed value.
    pub fn delete(&mut self, db: usize, key: &Bytes) -> Option<Value> {
        self.expire_if_needed(db, key);
        let d = self.dbs.get_mut(db)?;
        let (_, value) = d.dict.remove(key)?;
        d.expires.remove(key);
        Some(value)
    }

    /// Replaces database `db` with an empty one.
    ///
    /// # Returns
    ///
    /// The old database, so the caller decides where it is dropped.
    pub fn flush_db(&mut self, db: usize) -> Option<Db> {
        let slot = self.dbs.get_mut(db)?;
        Some(std::mem::replace(slot, Db::new(db, self.policy.clone())))
    }

    /// Replaces every database with an empty one.
    pub fn flush_all(&mut self) -> Vec<Db> {
        (0..self.dbs.len()).filter_map(|id| self.flush_db(id)).collect()
    }

    // ========================================================================
    // Iteration and maintenance
    // ========================================================================

    /// Calls `f` for every key of `db` whose deadline is not earlier than
    /// `now_ms`, stopping at the first error.
    ///
    /// A key expiring exactly at `now_ms` is still visited, unlike
    /// [`Keyspace::expire_if_needed`] which treats it as expired.
    ///
    /// Does not modify any table, so it is safe to run in a forked child.
    pub fn for_each_live<E, F>(&self, db: usize, now_ms: i64, mut f: F) -> Result<(), E>
    where
        F: FnMut(&Bytes, &Value, Option<i64>) -> Result<(), E>,
    {
        let Some(d) = self.dbs.get(db) else {
            return Ok(());
        };
        let snapshot = d.dict.fingerprint_iter();
        for (key, value) in d.dict.iter() {
            let expire = d.expire_of(key);
            if expire.is_some_and(|when| when < now_ms) {
                continue;
            }
            f(key, value, expire)?;
        }
        snapshot.release(&d.dict);
        Ok(())
    }

    /// Shrinks sparse tables of `db`. Returns `true` if a shrink started.
    pub fn shrink_if_sparse(&mut self, db: usize) -> bool {
        self.dbs.get_mut(db).is_some_and(|d| d.shrink_if_sparse())
    }

    /// Runs one time-bounded migration burst on `db`.
    pub fn incremental_rehash(&mut self, db: usize, budget: std::time::Duration) -> bool {
        self.dbs.get_mut(db).is_some_and(|d| d.incremental_rehash(budget))
    }

    /// `(db, keys, expires)` for every non-empty database.
    pub fn keyspace_info(&self) -> Vec<(usize, usize, usize)> {
        self.dbs
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| (d.id(), d.len(), d.expires_len()))
            .collect()
    }
}

impl fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyspace")
            .field("databases", &self.dbs.len())
            .field("keys", &self.len())
            .field("loading", &self.loading)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ManualClock;

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn string(s: &str) -> Value {
        Value::Str(key(s))
    }

    fn manual() -> (Keyspace, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        (Keyspace::with_clock(4, ResizePolicy::default(), clock.clone()), clock)
    }

    #[test]
    fn test_set_get_delete() {
        let (mut ks, _) = manual();
        ks.set(0, key("a"), string("1"));
        assert_eq!(ks.lookup_read(0, &key("a")), Some(&string("1")));
        assert_eq!(ks.delete(0, &key("a")), Some(string("1")));
        assert!(ks.lookup_read(0, &key("a")).is_none());
        assert_eq!(ks.stats().keyspace_hits, 1);
        assert_eq!(ks.stats().keyspace_misses, 1);
    }

    #[test]
    fn test_lazy_expiry_queues_key() {
        let (mut ks, clock) = manual();
        ks.set(2, key("session"), string("token"));
        assert!(ks.set_expire(2, &key("session"), 1_000_100));

        clock.advance(99);
        assert!(ks.exists(2, &key("session")));

        clock.advance(1);
        assert!(ks.lookup_read(2, &key("session")).is_none());
        assert_eq!(ks.take_expired(), vec![(2, key("session"))]);
        assert!(ks.take_expired().is_empty());
        assert_eq!(ks.stats().expired_keys, 1);
        assert_eq!(ks.db(2).unwrap().expires_len(), 0);
    }

    #[test]
    fn test_loading_suspends_lazy_expiry() {
        let (mut ks, clock) = manual();
        ks.set(0, key("k"), string("v"));
        ks.set_expire(0, &key("k"), 1_000_000);
        ks.set_loading(true);
        clock.advance(10);
        assert!(ks.exists(0, &key("k")));
        ks.set_loading(false);
        assert!(!ks.exists(0, &key("k")));
    }

    #[test]
    fn test_set_clears_ttl_unless_kept() {
        let (mut ks, _) = manual();
        ks.set(0, key("k"), string("v"));
        ks.set_expire(0, &key("k"), 2_000_000);
        ks.set_with(0, key("k"), string("w"), true);
        assert_eq!(ks.get_expire(0, &key("k")), Some(2_000_000));
        ks.set(0, key("k"), string("x"));
        assert_eq!(ks.get_expire(0, &key("k")), None);
    }

    #[test]
    fn test_set_expire_requires_key() {
        let (mut ks, _) = manual();
        assert!(!ks.set_expire(0, &key("missing"), 5));
        assert!(!ks.persist(0, &key("missing")));
    }

    #[test]
    fn test_flush_returns_old_tables() {
        let (mut ks, _) = manual();
        ks.set(0, key("a"), string("1"));
        ks.set(1, key("b"), string("2"));

        let old = ks.flush_db(1).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(ks.len(), 1);

        let all = ks.flush_all();
        assert_eq!(all.len(), 4);
        assert!(ks.is_empty());
    }

    #[test]
    fn test_for_each_live_skips_expired() {
        let (mut ks, _) = manual();
        ks.set(0, key("live"), string("1"));
        ks.set(0, key("ttl"), string("2"));
        ks.set(0, key("dead"), string("3"));
        ks.set_expire(0, &key("ttl"), 5_000_000);
        ks.set_expire(0, &key("dead"), 10);

        let mut seen = Vec::new();
        ks.for_each_live::<(), _>(0, ks.now_ms(), |k, _, exp| {
            seen.push((k.clone(), exp));
            Ok(())
        })
        .unwrap();
        seen.sort();
        assert_eq!(seen, vec![(key("live"), None), (key("ttl"), Some(5_000_000))]);
    }

    #[test]
    fn test_for_each_live_keeps_key_expiring_now() {
        let (mut ks, _) = manual();
        let now = ks.now_ms();
        ks.set(0, key("edge"), string("1"));
        ks.set_expire(0, &key("edge"), now);

        let mut seen = Vec::new();
        ks.for_each_live::<(), _>(0, now, |k, _, exp| {
            seen.push((k.clone(), exp));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(key("edge"), Some(now))]);

        assert!(ks.expire_if_needed(0, &key("edge")));
    }

    #[test]
    fn test_keyspace_info() {
        let (mut ks, _) = manual();
        ks.set(3, key("a"), string("1"));
        ks.set_expire(3, &key("a"), 9_999_999);
        assert_eq!(ks.keyspace_info(), vec![(3, 1, 1)]);
    }
}
