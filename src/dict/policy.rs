//! Pluggable key behaviour and the shared resize policy.
//!
//! Every table is parameterised by a [`DictType`] that decides how keys are
//! hashed and compared, and how keys and values are disposed of when the
//! table lets go of them. The [`ResizePolicy`] is a handle shared by all the
//! tables of one keyspace, so a single switch can suppress growth everywhere
//! while a copy-on-write child process is alive.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Load ratio (`used / size`) above which a table grows even when
/// resizing is suppressed.
pub const FORCE_RESIZE_RATIO: usize = 5;

/// Hashing, comparison and destructor hooks for one table instance.
///
/// The destructor hooks run whenever the table disposes of something it
/// owns: `delete`, value replacement in `upsert`, `clear`, and dropping the
/// table. Entries handed back to the caller (`remove`) bypass them.
pub trait DictType<K, V> {
    fn hash(&self, key: &K) -> u64;

    fn key_eq(&self, a: &K, b: &K) -> bool;

    fn drop_key(&self, key: K) {
        drop(key);
    }

    fn drop_value(&self, value: V) {
        drop(value);
    }
}

/// `Hash + Eq` keys hashed through a [`BuildHasher`].
#[derive(Debug, Clone, Default)]
pub struct DefaultDictType<S = RandomState> {
    hasher: S,
}

impl<S> DefaultDictType<S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self { hasher }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> DictType<K, V> for DefaultDictType<S> {
    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn key_eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

#[derive(Debug)]
struct PolicyState {
    enabled: AtomicBool,
    force_ratio: usize,
}

/// Shared switch controlling whether tables may resize.
///
/// Clones observe the same switch. While disabled, tables only grow once
/// their load ratio exceeds [`force_ratio`](Self::force_ratio), and
/// explicit shrinking is refused.
#[derive(Debug, Clone)]
pub struct ResizePolicy {
    inner: Arc<PolicyState>,
}

impl ResizePolicy {
    pub fn new(force_ratio: usize) -> Self {
        Self {
            inner: Arc::new(PolicyState {
                enabled: AtomicBool::new(true),
                force_ratio,
            }),
        }
    }

    pub fn allow(&self) {
        self.set_enabled(true);
    }

    pub fn forbid(&self) {
        self.set_enabled(false);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn force_ratio(&self) -> usize {
        self.inner.force_ratio
    }
}

impl Default for ResizePolicy {
    fn default() -> Self {
        Self::new(FORCE_RESIZE_RATIO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_clones_share_switch() {
        let policy = ResizePolicy::default();
        let other = policy.clone();

        assert!(other.is_enabled());
        policy.forbid();
        assert!(!other.is_enabled());
        other.allow();
        assert!(policy.is_enabled());
        assert_eq!(policy.force_ratio(), FORCE_RESIZE_RATIO);
    }

    #[test]
    fn test_default_type_hash_is_stable_per_instance() {
        let ty = DefaultDictType::<RandomState>::default();
        let a = DictType::<&str, ()>::hash(&ty, &"key");
        let b = DictType::<&str, ()>::hash(&ty, &"key");
        assert_eq!(a, b);
        assert!(DictType::<&str, ()>::key_eq(&ty, &"key", &"key"));
        assert!(!DictType::<&str, ()>::key_eq(&ty, &"key", &"other"));
    }
}
