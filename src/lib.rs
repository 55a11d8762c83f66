//! # EmberKV - A Durable In-Memory Key-Value Core
//!
//! EmberKV is the durability and indexing core of a Redis-compatible,
//! in-memory key-value server: a single-threaded event reactor, a hash
//! table that resizes without pausing the server, and an append-only log
//! that is compacted by a forked child while traffic keeps flowing.
//!
//! ## Features
//!
//! - **Event Reactor**: readiness callbacks and timers on one thread, with
//!   before/after-sleep hooks
//! - **Incremental Rehashing**: table growth and shrinkage migrate a few
//!   buckets per operation or per millisecond of cron time
//! - **Append-Only Log**: `always`/`everysec`/`no` fsync policies, write
//!   error recovery, truncated-tail tolerance on load
//! - **Background Rewrite**: fork, stream the commands written meanwhile
//!   over a pipe, stop handshake, atomic rename
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 EmberKV                                  │
//! │                                                                          │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐               │
//! │  │  Reactor    │───>│   Server    │───>│ CommandExecutor │               │
//! │  │ (poll loop) │    │  (clients)  │    └────────┬────────┘               │
//! │  └─────────────┘    └──────┬──────┘             │                        │
//! │                            │                    ▼                        │
//! │                            │        ┌───────────────────────┐            │
//! │                            │        │       Keyspace        │            │
//! │                            │        │ db0 ... dbN           │            │
//! │                            │        │ HashTable + expires   │            │
//! │                            │        └───────────────────────┘            │
//! │                            ▼                    ▲                        │
//! │  ┌──────────────────────────────────┐           │ fork (copy-on-write)   │
//! │  │ Aof: buffer ─> file ─> fsync(bio)│───────────┴──> rewrite child       │
//! │  │      rewrite buffer ─> diff pipe │<── stop/ack ──                     │
//! │  └──────────────────────────────────┘                                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use emberkv::config::ServerConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut config = ServerConfig::default();
//!     config.set("appendonly", "yes")?;
//!     config.set("appendfsync", "everysec")?;
//!     emberkv::server::run(config)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Commands
//!
//! ### Strings
//! - `SET key value [EX s|PX ms] [NX|XX] [KEEPTTL] [GET]`, `GET`, `GETSET`
//! - `SETEX` / `PSETEX`, `INCR` / `INCRBY` / `DECR` / `DECRBY`
//! - `APPEND`, `STRLEN`
//!
//! ### Keys
//! - `DEL` / `UNLINK`, `EXISTS`, `TYPE`
//! - `EXPIRE` / `PEXPIRE` / `EXPIREAT` / `PEXPIREAT`, `TTL` / `PTTL`, `PERSIST`
//!
//! ### Lists
//! - `LPUSH` / `RPUSH`, `LPOP` / `RPOP`, `LLEN`, `LRANGE`
//!
//! ### Server
//! - `PING`, `ECHO`, `SELECT`, `DBSIZE`, `FLUSHDB` / `FLUSHALL [ASYNC]`
//! - `BGREWRITEAOF`, `INFO [section]`, `CONFIG SET appendonly|appendfsync`
//! - `DEBUG HTSTATS db`, `SHUTDOWN`
//!
//! ## Module Overview
//!
//! - [`dict`]: incrementally rehashing hash table
//! - [`reactor`]: event loop, poll backend and clocks
//! - [`aof`]: append-only log, rewrite and loader
//! - [`bio`]: background fsync, close and free jobs
//! - [`process`]: fork, reap, signals
//! - [`storage`]: databases, expiry
//! - [`commands`]: command table and executor
//! - [`protocol`]: request decoding and reply encoding
//! - [`server`]: the TCP server gluing it all together
//! - [`config`]: settings

pub mod aof;
pub mod bio;
pub mod commands;
pub mod config;
pub mod dict;
pub mod process;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use aof::{Aof, AofError, AofState};
pub use commands::{ClientContext, CommandExecutor};
pub use config::{AofConfig, FsyncPolicy, ServerConfig};
pub use dict::HashTable;
pub use protocol::{CommandDecoder, ParseError, RespValue};
pub use reactor::EventLoop;
pub use server::{Server, ServerError};
pub use storage::{Keyspace, Value};

/// The default port EmberKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host EmberKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
