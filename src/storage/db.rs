//! One numbered database: the key table and its expiry index.

use crate::dict::{HashTable, ResizePolicy, INITIAL_SIZE};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Percentage of used slots below which a table is shrunk.
pub const HASHTABLE_MIN_FILL: usize = 10;

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
}

impl Value {
    /// Name reported by `TYPE`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }

    /// Number of elements freeing this value would touch.
    pub fn element_count(&self) -> usize {
        match self {
            Value::Str(_) => 1,
            Value::List(items) => items.len(),
        }
    }
}

/// Keys with their values plus absolute expiry times in Unix milliseconds.
///
/// Every key in `expires` is also present in `dict`.
pub struct Db {
    pub(crate) id: usize,
    pub(crate) dict: HashTable<Bytes, Value>,
    pub(crate) expires: HashTable<Bytes, i64>,
    /// Resume point of the active expiry scan.
    pub(crate) expire_cursor: u64,
}

impl Db {
    pub fn new(id: usize, policy: ResizePolicy) -> Self {
        Self {
            id,
            dict: HashTable::with_policy(policy.clone()),
            expires: HashTable::with_policy(policy),
            expire_cursor: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    pub fn expires_len(&self) -> usize {
        self.expires.len()
    }

    pub fn dict(&self) -> &HashTable<Bytes, Value> {
        &self.dict
    }

    pub fn expires(&self) -> &HashTable<Bytes, i64> {
        &self.expires
    }

    /// Expiry of `key` without advancing any migration.
    pub fn expire_of(&self, key: &Bytes) -> Option<i64> {
        self.expires.peek(key).map(|e| *e.value())
    }

    /// Shrinks either table when fewer than 10% of its slots are used.
    ///
    /// # Returns
    ///
    /// `true` if a shrink was started. A sparse table is left alone while
    /// the resize policy forbids it or a migration is already running.
    pub fn shrink_if_sparse(&mut self) -> bool {
        let mut started = false;
        if needs_shrink(self.dict.table_size(), self.dict.len()) {
            match self.dict.shrink_to_fit() {
                Ok(()) => started = true,
                Err(e) => debug!(db = self.id, table = "keys", error = %e, "Skipped shrinking sparse table"),
            }
        }
        if needs_shrink(self.expires.table_size(), self.expires.len()) {
            match self.expires.shrink_to_fit() {
                Ok(()) => started = true,
                Err(e) => debug!(db = self.id, table = "expires", error = %e, "Skipped shrinking sparse table"),
            }
        }
        started
    }

    /// Spends up to `budget` migrating the key table, or the expiry index
    /// if the key table is idle.
    ///
    /// # Returns
    ///
    /// `true` if any migration work was done.
    pub fn incremental_rehash(&mut self, budget: Duration) -> bool {
        if self.dict.is_rehashing() {
            self.dict.rehash_for(budget);
            return true;
        }
        if self.expires.is_rehashing() {
            self.expires.rehash_for(budget);
            return true;
        }
        false
    }
}

fn needs_shrink(size: usize, used: usize) -> bool {
    size > INITIAL_SIZE && used * 100 / size < HASHTABLE_MIN_FILL
}
