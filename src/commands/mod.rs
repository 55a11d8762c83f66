//! Command Layer
//!
//! Turns a decoded argument vector into a reply and a keyspace change.
//!
//! ## Architecture
//!
//! ```text
//! argv (Vec<Bytes>)
//!       │
//!       ▼
//! ┌─────────────────┐
//! │ COMMANDS table  │  arity, flags, expiry translation
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │ CommandExecutor │ ───> │    Keyspace     │  (storage module)
//! └────────┬────────┘      └─────────────────┘
//!          │ Outcome { reply, dirty, propagate_as }
//!          ▼
//!   server: reply to client, feed the append-only log
//! ```
//!
//! Server-level commands (`BGREWRITEAOF`, `INFO`, `CONFIG`, `DEBUG`,
//! `SHUTDOWN`) are flagged `ADMIN` in the table and handled by the server.

pub mod executor;
pub mod table;

pub use executor::{parse_i64, ClientContext, CommandExecutor, Outcome, LAZYFREE_THRESHOLD};
pub use table::{lookup_command, CommandFlags, CommandSpec, ExpiryKind, COMMANDS};
