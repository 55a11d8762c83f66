//! Command Executor
//!
//! Runs keyspace commands and reports, besides the reply, how many changes
//! they made and what should be written to the append-only log.
//!
//! ## Architecture
//!
//! ```text
//! argv ──> lookup_command ──> arity check ──> cmd_* ──> Outcome
//!                                               │        ├─ reply
//!                                               ▼        ├─ dirty
//!                                           Keyspace     └─ propagate_as
//! ```
//!
//! A command with `dirty > 0` is propagated verbatim unless `propagate_as`
//! says otherwise, e.g. an `EXPIRE` with a deadline in the past deletes the
//! key and is logged as `DEL`.

use super::table::{lookup_command, CommandSpec};
use crate::bio::BioHandle;
use crate::protocol::RespValue;
use crate::storage::{Keyspace, Value};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Values with more elements than this are freed on the background pool by
/// `UNLINK` and `FLUSH* ASYNC`.
pub const LAZYFREE_THRESHOLD: usize = 64;

/// Per-client execution state.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    /// Selected database.
    pub db: usize,
}

impl ClientContext {
    pub fn new(db: usize) -> Self {
        Self { db }
    }
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub reply: RespValue,
    /// Number of keyspace changes.
    pub dirty: u64,
    /// Replacement for the logged form, when it differs from the request.
    pub propagate_as: Option<Vec<Bytes>>,
}

impl Outcome {
    fn reply(reply: RespValue) -> Self {
        Self {
            reply,
            dirty: 0,
            propagate_as: None,
        }
    }

    fn changed(reply: RespValue, dirty: u64) -> Self {
        Self {
            reply,
            dirty,
            propagate_as: None,
        }
    }
}

/// Executes keyspace commands.
///
/// # Example
///
/// ```
/// use emberkv::commands::{ClientContext, CommandExecutor};
/// use emberkv::protocol::RespValue;
/// use emberkv::storage::Keyspace;
/// use bytes::Bytes;
///
/// let executor = CommandExecutor::new(None);
/// let mut ks = Keyspace::new(16);
/// let mut ctx = ClientContext::default();
///
/// let argv: Vec<Bytes> = vec!["SET".into(), "name".into(), "Ariz".into()];
/// let out = executor.execute(&mut ks, &mut ctx, &argv);
/// assert_eq!(out.reply, RespValue::ok());
/// assert_eq!(out.dirty, 1);
/// ```
#[derive(Clone, Default)]
pub struct CommandExecutor {
    bio: Option<BioHandle>,
}

impl CommandExecutor {
    /// Without a background pool, lazy frees happen inline.
    pub fn new(bio: Option<BioHandle>) -> Self {
        Self { bio }
    }

    /// Executes `argv` (command name first).
    pub fn execute(&self, ks: &mut Keyspace, ctx: &mut ClientContext, argv: &[Bytes]) -> Outcome {
        let Some(name) = argv.first() else {
            return Outcome::reply(RespValue::error("ERR empty command"));
        };
        let Some(spec) = lookup_command(name) else {
            return Outcome::reply(RespValue::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(name)
            )));
        };
        if !spec.arity_ok(argv.len()) {
            return Outcome::reply(RespValue::wrong_arity(spec.name));
        }
        self.dispatch(spec, ks, ctx, &argv[1..])
    }

    fn dispatch(&self, spec: &CommandSpec, ks: &mut Keyspace, ctx: &mut ClientContext, args: &[Bytes]) -> Outcome {
        let db = ctx.db;
        let now = ks.now_ms();
        match spec.name {
            "PING" => cmd_ping(args),
            "ECHO" => Outcome::reply(RespValue::bulk_string(args[0].clone())),
            "SELECT" => cmd_select(ks, ctx, args),

            "SET" => cmd_set(ks, db, args),
            "GET" => cmd_get(ks, db, args),
            "GETSET" => cmd_getset(ks, db, args),
            "SETEX" => cmd_setex(ks, db, args, 1000),
            "PSETEX" => cmd_setex(ks, db, args, 1),
            "INCR" => cmd_incr_by(ks, db, &args[0], 1),
            "DECR" => cmd_incr_by(ks, db, &args[0], -1),
            "INCRBY" | "DECRBY" => match parse_i64(&args[1]) {
                Some(n) if spec.name == "INCRBY" => cmd_incr_by(ks, db, &args[0], n),
                Some(n) => match n.checked_neg() {
                    Some(neg) => cmd_incr_by(ks, db, &args[0], neg),
                    None => Outcome::reply(RespValue::error("ERR decrement would overflow")),
                },
                None => Outcome::reply(RespValue::not_integer()),
            },
            "APPEND" => cmd_append(ks, db, args),
            "STRLEN" => cmd_strlen(ks, db, args),

            "DEL" => self.cmd_del(ks, db, args, false),
            "UNLINK" => self.cmd_del(ks, db, args, true),
            "EXISTS" => {
                let n = args.iter().filter(|k| ks.exists(db, k)).count();
                Outcome::reply(RespValue::integer(n as i64))
            }
            "EXPIRE" => cmd_expire(ks, db, args, now, 1000),
            "PEXPIRE" => cmd_expire(ks, db, args, now, 1),
            "EXPIREAT" => cmd_expire(ks, db, args, 0, 1000),
            "PEXPIREAT" => cmd_expire(ks, db, args, 0, 1),
            "TTL" => cmd_ttl(ks, db, args, 1000),
            "PTTL" => cmd_ttl(ks, db, args, 1),
            "PERSIST" => {
                let removed = ks.exists(db, &args[0]) && ks.persist(db, &args[0]);
                Outcome::changed(RespValue::integer(removed as i64), removed as u64)
            }
            "TYPE" => {
                let name = ks.lookup_read(db, &args[0]).map_or("none", Value::type_name);
                Outcome::reply(RespValue::simple_string(name))
            }

            "RPUSH" => cmd_push(ks, db, args, false),
            "LPUSH" => cmd_push(ks, db, args, true),
            "LPOP" => cmd_pop(ks, db, args, true),
            "RPOP" => cmd_pop(ks, db, args, false),
            "LLEN" => match ks.lookup_read(db, &args[0]) {
                None => Outcome::reply(RespValue::integer(0)),
                Some(Value::List(items)) => Outcome::reply(RespValue::integer(items.len() as i64)),
                Some(_) => Outcome::reply(RespValue::wrong_type()),
            },
            "LRANGE" => cmd_lrange(ks, db, args),

            "DBSIZE" => {
                let n = ks.db(db).map_or(0, |d| d.len());
                Outcome::reply(RespValue::integer(n as i64))
            }
            "FLUSHDB" | "FLUSHALL" => self.cmd_flush(ks, db, args, spec.name == "FLUSHALL"),

            _ => Outcome::reply(RespValue::error(format!(
                "ERR command '{}' is not a keyspace command",
                spec.name
            ))),
        }
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// DEL / UNLINK key [key ...]
    fn cmd_del(&self, ks: &mut Keyspace, db: usize, keys: &[Bytes], lazy: bool) -> Outcome {
        let mut deleted = 0;
        for key in keys {
            if let Some(value) = ks.delete(db, key) {
                deleted += 1;
                if lazy {
                    self.free(value);
                }
            }
        }
        Outcome::changed(RespValue::integer(deleted), deleted as u64)
    }

    /// FLUSHDB / FLUSHALL [ASYNC|SYNC]
    fn cmd_flush(&self, ks: &mut Keyspace, db: usize, args: &[Bytes], all: bool) -> Outcome {
        let lazy = match args {
            [] => false,
            [mode] if mode.eq_ignore_ascii_case(b"ASYNC") => true,
            [mode] if mode.eq_ignore_ascii_case(b"SYNC") => false,
            _ => return Outcome::reply(RespValue::syntax_error()),
        };
        let old = if all {
            ks.flush_all()
        } else {
            ks.flush_db(db).into_iter().collect()
        };
        let removed: usize = old.iter().map(|d| d.len()).sum();

        match &self.bio {
            Some(bio) if lazy => bio.lazy_free(old),
            _ => drop(old),
        }
        // Flushing an empty database is still propagated.
        Outcome::changed(RespValue::ok(), removed.max(1) as u64)
    }

    /// Drops `value` on the background pool when it is large.
    fn free(&self, value: Value) {
        match &self.bio {
            Some(bio) if value.element_count() > LAZYFREE_THRESHOLD => bio.lazy_free(value),
            _ => drop(value),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

fn cmd_ping(args: &[Bytes]) -> Outcome {
    match args {
        [] => Outcome::reply(RespValue::pong()),
        [msg] => Outcome::reply(RespValue::bulk_string(msg.clone())),
        _ => Outcome::reply(RespValue::wrong_arity("PING")),
    }
}

fn cmd_select(ks: &Keyspace, ctx: &mut ClientContext, args: &[Bytes]) -> Outcome {
    match parse_i64(&args[0]) {
        None => Outcome::reply(RespValue::not_integer()),
        Some(id) if id < 0 || id as usize >= ks.db_count() => {
            Outcome::reply(RespValue::error("ERR DB index is out of range"))
        }
        Some(id) => {
            ctx.db = id as usize;
            Outcome::reply(RespValue::ok())
        }
    }
}

// ============================================================================
// Strings
// ============================================================================

/// SET key value [EX seconds | PX milliseconds | KEEPTTL] [NX | XX] [GET]
fn cmd_set(ks: &mut Keyspace, db: usize, args: &[Bytes]) -> Outcome {
    let key = &args[0];
    let value = &args[1];

    let mut ttl_ms: Option<i64> = None;
    let mut nx = false;
    let mut xx = false;
    let mut get = false;
    let mut keep_ttl = false;

    let mut i = 2;
    while i < args.len() {
        let opt = args[i].to_ascii_uppercase();
        match opt.as_slice() {
            b"EX" | b"PX" if ttl_ms.is_none() && !keep_ttl => {
                i += 1;
                let Some(raw) = args.get(i) else {
                    return Outcome::reply(RespValue::syntax_error());
                };
                let unit = if opt == b"EX" { 1000 } else { 1 };
                match parse_i64(raw).and_then(|n| n.checked_mul(unit)) {
                    Some(ms) if ms > 0 => ttl_ms = Some(ms),
                    _ => return Outcome::reply(RespValue::error("ERR invalid expire time in 'set' command")),
                }
            }
            b"KEEPTTL" if ttl_ms.is_none() => keep_ttl = true,
            b"NX" if !xx => nx = true,
            b"XX" if !nx => xx = true,
            b"GET" => get = true,
            _ => return Outcome::reply(RespValue::syntax_error()),
        }
        i += 1;
    }

    let old = match ks.lookup_read(db, key) {
        None => None,
        Some(Value::Str(s)) => Some(s.clone()),
        Some(_) if get => return Outcome::reply(RespValue::wrong_type()),
        Some(_) => Some(Bytes::new()),
    };
    let old_reply = || old.clone().map_or(RespValue::Null, RespValue::BulkString);

    if (nx && old.is_some()) || (xx && old.is_none()) {
        return Outcome::reply(if get { old_reply() } else { RespValue::Null });
    }

    ks.set_with(db, key.clone(), Value::Str(value.clone()), keep_ttl);
    if let Some(ms) = ttl_ms {
        let when = ks.now_ms().saturating_add(ms);
        ks.set_expire(db, key, when);
    }
    Outcome::changed(if get { old_reply() } else { RespValue::ok() }, 1)
}

fn cmd_get(ks: &mut Keyspace, db: usize, args: &[Bytes]) -> Outcome {
    match ks.lookup_read(db, &args[0]) {
        None => Outcome::reply(RespValue::Null),
        Some(Value::Str(s)) => Outcome::reply(RespValue::bulk_string(s.clone())),
        Some(_) => Outcome::reply(RespValue::wrong_type()),
    }
}

fn cmd_getset(ks: &mut Keyspace, db: usize, args: &[Bytes]) -> Outcome {
    let old = match ks.lookup_read(db, &args[0]) {
        None => RespValue::Null,
        Some(Value::Str(s)) => RespValue::bulk_string(s.clone()),
        Some(_) => return Outcome::reply(RespValue::wrong_type()),
    };
    ks.set(db, args[0].clone(), Value::Str(args[1].clone()));
    Outcome::changed(old, 1)
}

/// SETEX / PSETEX key ttl value
fn cmd_setex(ks: &mut Keyspace, db: usize, args: &[Bytes], unit: i64) -> Outcome {
    let ms = match parse_i64(&args[1]).and_then(|n| n.checked_mul(unit)) {
        Some(ms) if ms > 0 => ms,
        Some(_) => return Outcome::reply(RespValue::error("ERR invalid expire time in 'setex' command")),
        None => return Outcome::reply(RespValue::not_integer()),
    };
    let when = ks.now_ms().saturating_add(ms);
    ks.set(db, args[0].clone(), Value::Str(args[2].clone()));
    ks.set_expire(db, &args[0], when);
    Outcome::changed(RespValue::ok(), 1)
}

fn cmd_incr_by(ks: &mut Keyspace, db: usize, key: &Bytes, delta: i64) -> Outcome {
    let current = match ks.lookup_write(db, key) {
        None => 0,
        Some(Value::Str(s)) => match parse_i64(s) {
            Some(n) => n,
            None => return Outcome::reply(RespValue::not_integer()),
        },
        Some(_) => return Outcome::reply(RespValue::wrong_type()),
    };
    let Some(next) = current.checked_add(delta) else {
        return Outcome::reply(RespValue::error("ERR increment or decrement would overflow"));
    };
    ks.set_with(db, key.clone(), Value::Str(Bytes::from(next.to_string())), true);
    Outcome::changed(RespValue::integer(next), 1)
}

fn cmd_append(ks: &mut Keyspace, db: usize, args: &[Bytes]) -> Outcome {
    let joined = match ks.lookup_write(db, &args[0]) {
        None => args[1].clone(),
        Some(Value::Str(s)) => {
            let mut buf = BytesMut::with_capacity(s.len() + args[1].len());
            buf.extend_from_slice(s);
            buf.extend_from_slice(&args[1]);
            buf.freeze()
        }
        Some(_) => return Outcome::reply(RespValue::wrong_type()),
    };
    let len = joined.len();
    ks.set_with(db, args[0].clone(), Value::Str(joined), true);
    Outcome::changed(RespValue::integer(len as i64), 1)
}

fn cmd_strlen(ks: &mut Keyspace, db: usize, args: &[Bytes]) -> Outcome {
    match ks.lookup_read(db, &args[0]) {
        None => Outcome::reply(RespValue::integer(0)),
        Some(Value::Str(s)) => Outcome::reply(RespValue::integer(s.len() as i64)),
        Some(_) => Outcome::reply(RespValue::wrong_type()),
    }
}

// ============================================================================
// Expiry
// ============================================================================

/// EXPIRE family. The deadline is `base_ms + arg * unit`.
fn cmd_expire(ks: &mut Keyspace, db: usize, args: &[Bytes], base_ms: i64, unit: i64) -> Outcome {
    let key = &args[0];
    let Some(when) = parse_i64(&args[1])
        .and_then(|n| n.checked_mul(unit))
        .and_then(|n| n.checked_add(base_ms))
    else {
        return Outcome::reply(RespValue::not_integer());
    };
    if !ks.exists(db, key) {
        return Outcome::reply(RespValue::integer(0));
    }

    // A deadline already in the past deletes the key right away. The log
    // gets a DEL so replay does not depend on the clock.
    if when <= ks.now_ms() && !ks.is_loading() {
        ks.delete(db, key);
        return Outcome {
            reply: RespValue::integer(1),
            dirty: 1,
            propagate_as: Some(vec![Bytes::from_static(b"DEL"), key.clone()]),
        };
    }
    ks.set_expire(db, key, when);
    Outcome::changed(RespValue::integer(1), 1)
}

/// TTL / PTTL key: -2 if missing, -1 without deadline.
fn cmd_ttl(ks: &mut Keyspace, db: usize, args: &[Bytes], unit: i64) -> Outcome {
    if !ks.exists(db, &args[0]) {
        return Outcome::reply(RespValue::integer(-2));
    }
    let reply = match ks.get_expire(db, &args[0]) {
        None => -1,
        Some(when) => {
            let left = (when - ks.now_ms()).max(0);
            (left + unit / 2) / unit
        }
    };
    Outcome::reply(RespValue::integer(reply))
}

// ============================================================================
// Lists
// ============================================================================

/// LPUSH / RPUSH key element [element ...]
fn cmd_push(ks: &mut Keyspace, db: usize, args: &[Bytes], head: bool) -> Outcome {
    let key = &args[0];
    let elements = &args[1..];
    let len = match ks.lookup_write(db, key) {
        Some(Value::List(items)) => {
            push_all(items, elements, head);
            items.len()
        }
        Some(_) => return Outcome::reply(RespValue::wrong_type()),
        None => {
            let mut items = VecDeque::with_capacity(elements.len());
            push_all(&mut items, elements, head);
            let len = items.len();
            ks.set(db, key.clone(), Value::List(items));
            len
        }
    };
    Outcome::changed(RespValue::integer(len as i64), elements.len() as u64)
}

fn push_all(items: &mut VecDeque<Bytes>, elements: &[Bytes], head: bool) {
    for e in elements {
        if head {
            items.push_front(e.clone());
        } else {
            items.push_back(e.clone());
        }
    }
}

/// LPOP / RPOP key. An emptied list is deleted.
fn cmd_pop(ks: &mut Keyspace, db: usize, args: &[Bytes], head: bool) -> Outcome {
    let (popped, now_empty) = match ks.lookup_write(db, &args[0]) {
        None => return Outcome::reply(RespValue::Null),
        Some(Value::List(items)) => {
            let popped = if head { items.pop_front() } else { items.pop_back() };
            (popped, items.is_empty())
        }
        Some(_) => return Outcome::reply(RespValue::wrong_type()),
    };
    if now_empty {
        ks.delete(db, &args[0]);
    }
    match popped {
        Some(item) => Outcome::changed(RespValue::bulk_string(item), 1),
        None => Outcome::reply(RespValue::Null),
    }
}

/// LRANGE key start stop, inclusive, negative indices from the end.
fn cmd_lrange(ks: &mut Keyspace, db: usize, args: &[Bytes]) -> Outcome {
    let (Some(start), Some(stop)) = (parse_i64(&args[1]), parse_i64(&args[2])) else {
        return Outcome::reply(RespValue::not_integer());
    };
    let items = match ks.lookup_read(db, &args[0]) {
        None => return Outcome::reply(RespValue::array(Vec::new())),
        Some(Value::List(items)) => items,
        Some(_) => return Outcome::reply(RespValue::wrong_type()),
    };

    let len = items.len() as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return Outcome::reply(RespValue::array(Vec::new()));
    }
    let range = items
        .iter()
        .skip(start as usize)
        .take((stop - start + 1) as usize)
        .map(|b| RespValue::bulk_string(b.clone()))
        .collect();
    Outcome::reply(RespValue::array(range))
}

/// Parses a base-10 signed integer argument.
pub fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
