//! Keyspace Storage
//!
//! Numbered databases built on the incrementally rehashing
//! [`HashTable`](crate::dict::HashTable). Everything here runs on the loop
//! thread; the only concurrent reader is a forked rewrite child, which sees
//! its own copy-on-write snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Keyspace                             │
//! │  ┌──────────────┐ ┌──────────────┐        ┌──────────────┐  │
//! │  │ Db 0         │ │ Db 1         │  ...   │ Db N-1       │  │
//! │  │  dict        │ │  dict        │        │  dict        │  │
//! │  │  expires     │ │  expires     │        │  expires     │  │
//! │  └──────────────┘ └──────────────┘        └──────────────┘  │
//! │          ResizePolicy (shared by every table)               │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │ active_expire_cycle (cron)
//! ```

pub mod db;
pub mod expire;
pub mod keyspace;

pub use db::{Db, Value};
pub use expire::ExpiryConfig;
pub use keyspace::{Keyspace, KeyspaceStats};
