//! The static command table.
//!
//! Every command the server understands has one [`CommandSpec`]. The
//! append-only log reads two things from it: whether the command writes
//! (only writes are logged) and how an expiry argument must be translated so
//! that replaying the log later yields the same deadline.

use std::ops::BitOr;

/// Classification bits of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags(u8);

impl CommandFlags {
    pub const NONE: CommandFlags = CommandFlags(0);
    /// Modifies the keyspace; logged when it changed something.
    pub const WRITE: CommandFlags = CommandFlags(1);
    pub const READONLY: CommandFlags = CommandFlags(2);
    /// Handled by the server rather than the keyspace executor.
    pub const ADMIN: CommandFlags = CommandFlags(4);
    /// O(1) or O(log n).
    pub const FAST: CommandFlags = CommandFlags(8);

    pub const fn union(self, other: CommandFlags) -> CommandFlags {
        CommandFlags(self.0 | other.0)
    }

    pub fn contains(self, other: CommandFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CommandFlags {
    type Output = CommandFlags;

    fn bitor(self, rhs: CommandFlags) -> CommandFlags {
        self.union(rhs)
    }
}

/// How a command's expiry argument is written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryKind {
    /// No expiry argument.
    None,
    /// `EXPIRE key seconds`
    RelativeSecs,
    /// `PEXPIRE key milliseconds`
    RelativeMillis,
    /// `EXPIREAT key unix-seconds`
    AbsoluteSecs,
    /// `PEXPIREAT key unix-ms`, already in log form.
    AbsoluteMillis,
    /// `SETEX key seconds value`
    SetExSecs,
    /// `PSETEX key milliseconds value`
    SetExMillis,
    /// `SET key value [EX s|PX ms] ...`
    SetOptions,
}

/// Static description of one command.
#[derive(Debug)]
pub struct CommandSpec {
    /// Upper-case name.
    pub name: &'static str,
    /// Exact argument count including the name when positive, minimum when
    /// negative.
    pub arity: i32,
    pub flags: CommandFlags,
    pub expiry: ExpiryKind,
}

impl CommandSpec {
    pub fn is_write(&self) -> bool {
        self.flags.contains(CommandFlags::WRITE)
    }

    pub fn is_admin(&self) -> bool {
        self.flags.contains(CommandFlags::ADMIN)
    }

    /// Whether `argc` arguments (name included) satisfy the arity.
    pub fn arity_ok(&self, argc: usize) -> bool {
        let argc = argc as i32;
        if self.arity >= 0 {
            argc == self.arity
        } else {
            argc >= -self.arity
        }
    }
}

const W: CommandFlags = CommandFlags::WRITE;
const R: CommandFlags = CommandFlags::READONLY;
const A: CommandFlags = CommandFlags::ADMIN;
const WF: CommandFlags = CommandFlags::WRITE.union(CommandFlags::FAST);
const RF: CommandFlags = CommandFlags::READONLY.union(CommandFlags::FAST);
const F: CommandFlags = CommandFlags::FAST;

const fn spec(name: &'static str, arity: i32, flags: CommandFlags, expiry: ExpiryKind) -> CommandSpec {
    CommandSpec {
        name,
        arity,
        flags,
        expiry,
    }
}

/// Every supported command.
pub static COMMANDS: &[CommandSpec] = &[
    // Connection
    spec("PING", -1, F, ExpiryKind::None),
    spec("ECHO", 2, F, ExpiryKind::None),
    spec("SELECT", 2, F, ExpiryKind::None),
    // Strings
    spec("SET", -3, W, ExpiryKind::SetOptions),
    spec("GET", 2, RF, ExpiryKind::None),
    spec("GETSET", 3, W, ExpiryKind::None),
    spec("SETEX", 4, W, ExpiryKind::SetExSecs),
    spec("PSETEX", 4, W, ExpiryKind::SetExMillis),
    spec("INCR", 2, WF, ExpiryKind::None),
    spec("INCRBY", 3, WF, ExpiryKind::None),
    spec("DECR", 2, WF, ExpiryKind::None),
    spec("DECRBY", 3, WF, ExpiryKind::None),
    spec("APPEND", 3, W, ExpiryKind::None),
    spec("STRLEN", 2, RF, ExpiryKind::None),
    // Keys
    spec("DEL", -2, W, ExpiryKind::None),
    spec("UNLINK", -2, WF, ExpiryKind::None),
    spec("EXISTS", -2, RF, ExpiryKind::None),
    spec("EXPIRE", 3, WF, ExpiryKind::RelativeSecs),
    spec("PEXPIRE", 3, WF, ExpiryKind::RelativeMillis),
    spec("EXPIREAT", 3, WF, ExpiryKind::AbsoluteSecs),
    spec("PEXPIREAT", 3, WF, ExpiryKind::AbsoluteMillis),
    spec("TTL", 2, RF, ExpiryKind::None),
    spec("PTTL", 2, RF, ExpiryKind::None),
    spec("PERSIST", 2, WF, ExpiryKind::None),
    spec("TYPE", 2, RF, ExpiryKind::None),
    // Lists
    spec("RPUSH", -3, WF, ExpiryKind::None),
    spec("LPUSH", -3, WF, ExpiryKind::None),
    spec("LPOP", 2, WF, ExpiryKind::None),
    spec("RPOP", 2, WF, ExpiryKind::None),
    spec("LLEN", 2, RF, ExpiryKind::None),
    spec("LRANGE", 4, R, ExpiryKind::None),
    // Databases
    spec("DBSIZE", 1, RF, ExpiryKind::None),
    spec("FLUSHDB", -1, W, ExpiryKind::None),
    spec("FLUSHALL", -1, W, ExpiryKind::None),
    // Server
    spec("BGREWRITEAOF", 1, A, ExpiryKind::None),
    spec("INFO", -1, A, ExpiryKind::None),
    spec("CONFIG", -2, A, ExpiryKind::None),
    spec("DEBUG", -2, A, ExpiryKind::None),
    spec("SHUTDOWN", -1, A, ExpiryKind::None),
];

/// Finds a command by name, case-insensitively.
///
/// # Example
///
/// ```
/// use emberkv::commands::{lookup_command, ExpiryKind};
///
/// let spec = lookup_command(b"pexpire").unwrap();
/// assert_eq!(spec.name, "PEXPIRE");
/// assert_eq!(spec.expiry, ExpiryKind::RelativeMillis);
/// assert!(lookup_command(b"NOSUCH").is_none());
/// ```
pub fn lookup_command(name: &[u8]) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name.as_bytes().eq_ignore_ascii_case(name))
}
