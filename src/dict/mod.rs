//! Incrementally Rehashing Hash Table
//!
//! The associative container behind every keyspace and expiry index.
//! Lookups, inserts and deletes are O(1) amortized; growing and shrinking
//! never stop the world.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    HashTable<K, V, T>                        │
//! │                                                              │
//! │   main: RawTable          rehash: Idle                       │
//! │   ┌──┬──┬──┬──┐                 │ Migrating { target,      │
//! │   │  │  │  │  │ ──────────────> │             cursor }     │
//! │   └──┴──┴──┴──┘   rehash_step   ┌──┬──┬──┬──┬──┬──┬──┬──┐   │
//! │                                 │  │  │  │  │  │  │  │  │   │
//! │   T: DictType (hash, eq, drop)  └──┴──┴──┴──┴──┴──┴──┴──┘   │
//! │   ResizePolicy (shared switch)                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - Sizes are powers of two, floor [`INITIAL_SIZE`].
//! - A table grows to the next power of two `>= 2 * len` once `len >= size`,
//!   provided the shared [`ResizePolicy`] allows it, or unconditionally once
//!   `len / size` exceeds the policy's force ratio.
//! - Migration is an explicit state (`Idle | Migrating { target, cursor }`),
//!   advanced one bucket per lookup/insert/delete and in bulk by
//!   [`HashTable::rehash_step`] and [`HashTable::rehash_for`].
//! - [`HashTable::scan`] walks with a reverse-binary cursor that survives
//!   resizes between calls.

pub mod iter;
pub mod policy;
pub mod scan;
pub mod table;

use thiserror::Error;

pub use iter::{FingerprintIter, Iter, SafeIter};
pub use policy::{DefaultDictType, DictType, ResizePolicy, FORCE_RESIZE_RATIO};
pub use table::{DictStats, Entry, HashTable, TableStats, INITIAL_SIZE};

/// Errors returned by table operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DictError {
    #[error("key already exists")]
    KeyExists,

    #[error("key not found")]
    NotFound,

    /// A migration is running, or resizing is suppressed and the load ratio
    /// is below the force ratio.
    #[error("resize not allowed now")]
    ResizeForbidden,

    #[error("invalid table size: {0}")]
    InvalidSize(usize),
}
