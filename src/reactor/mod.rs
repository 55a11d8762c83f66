//! Event Reactor
//!
//! A single-threaded loop that multiplexes descriptor readiness and timer
//! callbacks. Every other subsystem gets scheduled through it.
//!
//! ## One iteration
//!
//! ```text
//!   ┌──────────────────┐
//!   │  before_sleep    │   e.g. flush the append-only log
//!   └────────┬─────────┘
//!            ▼
//!   ┌──────────────────┐   timeout = nearest timer deadline
//!   │  poll(2)         │   (0 if due, forever if no timers)
//!   └────────┬─────────┘
//!            ▼
//!   ┌──────────────────┐
//!   │  after_sleep     │
//!   └────────┬─────────┘
//!            ▼
//!   ┌──────────────────┐   read callback, then write callback
//!   │  file events     │   (once if both are the same callback)
//!   └────────┬─────────┘
//!            ▼
//!   ┌──────────────────┐   sweep: collect tombstones, run finalizers,
//!   │  timer events    │   fire due timers
//!   └──────────────────┘
//! ```
//!
//! Callbacks receive the loop itself plus a mutable reference to the
//! caller's state `S`, so they can register and remove events and touch
//! server state without shared ownership.

pub mod clock;
pub mod event_loop;
pub mod poller;

use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use thiserror::Error;

pub use clock::{unix_millis, Clock, ManualClock, SystemClock};
pub use event_loop::{EventLoop, FileProc, TimerAction};
pub use poller::wait_fd;

/// Readiness interest for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    /// `self` without the bits of `other`.
    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

/// What a single [`EventLoop::process_events`] call may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFlags(u8);

impl ProcessFlags {
    pub const FILE_EVENTS: ProcessFlags = ProcessFlags(1);
    pub const TIME_EVENTS: ProcessFlags = ProcessFlags(2);
    pub const ALL_EVENTS: ProcessFlags = ProcessFlags(1 | 2);
    /// Poll without blocking.
    pub const DONT_WAIT: ProcessFlags = ProcessFlags(4);
    /// Run the after-sleep hook once the wait returns.
    pub const CALL_AFTER_SLEEP: ProcessFlags = ProcessFlags(8);

    pub fn contains(self, other: ProcessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProcessFlags {
    type Output = ProcessFlags;

    fn bitor(self, rhs: ProcessFlags) -> ProcessFlags {
        ProcessFlags(self.0 | rhs.0)
    }
}

/// Identifier of a timer. Never reused within one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors returned by reactor registration calls.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("descriptor {fd} out of range (capacity {capacity})")]
    OutOfRange { fd: RawFd, capacity: usize },

    #[error("cannot resize to {requested}: descriptor {max_fd} is registered")]
    Capacity { requested: usize, max_fd: RawFd },

    #[error("no such timer: {0}")]
    NoSuchTimer(TimerId),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
