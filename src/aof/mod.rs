//! Append-Only Log
//!
//! Every write command that changed the keyspace is appended to a log file
//! which is replayed on startup. The log is compacted by a forked child
//! while the server keeps running.
//!
//! ## Architecture
//!
//! ```text
//!  command ──> feed() ──┬──> buf ── flush() ──> appendonly.aof ──> fsync (bio)
//!                       │
//!                       └──> RewriteBuffer ── diff pipe ──> rewrite child
//!                            (only while a child runs)         │
//!                                                              ▼
//!                               temp-rewriteaof-bg-<pid>.aof ──┘
//!                                         │ rename on completion
//!                                         ▼
//!                                   appendonly.aof
//! ```
//!
//! ## States
//!
//! `Off -> WaitRewrite -> On`. Switching the log on starts a rewrite
//! first; only once it completes is the live file trusted and appended to.
//! Whether a rewrite child is alive is tracked separately.
//!
//! ## Durability
//!
//! - `always`: write and fsync on every flush; a failure of either is fatal
//! - `everysec`: fsync at most once per second on the background pool; a
//!   flush is postponed for up to two seconds while such an fsync runs
//! - `no`: the kernel decides
//!
//! A failed or short write under the relaxed policies is recorded, the file
//! is cut back to its last good size and the flush is retried later.

pub mod background;
pub mod encoding;
pub mod loader;
pub mod pipes;
pub mod rewrite;
pub mod rewrite_buffer;

use crate::bio::{BioHandle, BioKind};
use crate::config::{AofConfig, FsyncPolicy};
use crate::dict::ResizePolicy;
use crate::reactor::{Clock, EventLoop, SystemClock};
use crate::storage::Keyspace;
use bytes::{Buf, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub use background::RewriteChild;
pub use loader::{load_file, LoadOptions, LoadReport, LoadSink, SnapshotCodec, SNAPSHOT_SIGNATURE};
pub use rewrite_buffer::RewriteBuffer;

/// Minimum time between two write-error log lines.
const WRITE_ERROR_LOG_INTERVAL_MS: u64 = 30_000;

/// Longest a flush waits for a running background fsync.
const MAX_FLUSH_POSTPONE_SECS: u64 = 2;

/// Errors of the append-only log.
#[derive(Debug, Error)]
pub enum AofError {
    #[error("background append only file rewriting already in progress")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("can't fork the rewrite child: {0}")]
    Fork(#[from] nix::Error),

    /// A record that is not a well-formed multi-bulk command.
    #[error("bad file format reading the append only file at offset {offset}: {reason}")]
    Format { offset: u64, reason: String },

    /// The last record is incomplete and truncation is not allowed.
    #[error("unexpected end of file reading the append only file at offset {offset}; make a backup and fix it with a repair tool")]
    Truncated { offset: u64 },

    #[error("unknown command '{name}' reading the append only file at offset {offset}")]
    UnknownCommand { offset: u64, name: String },

    /// The durability contract can no longer be honored.
    #[error("fatal error writing the append only file: {0}")]
    FatalWrite(io::Error),

    #[error("snapshot preamble: {0}")]
    Snapshot(String),

    #[error("rewrite handshake failed: {0}")]
    Handshake(String),
}

impl AofError {
    /// Whether the process must stop serving.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AofError::FatalWrite(_) | AofError::Truncated { .. } | AofError::UnknownCommand { .. } | AofError::Format { .. }
        )
    }
}

/// Whether commands are appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AofState {
    Off,
    /// Enabled; waiting for the first rewrite to produce a trusted file.
    WaitRewrite,
    On,
}

/// Last failed write, kept until a write succeeds again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    Short { written: usize, expected: usize },
    Io(io::ErrorKind),
}

/// Snapshot of the log's status for `INFO persistence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AofStatus {
    pub state: AofState,
    pub rewrite_in_progress: bool,
    pub rewrite_scheduled: bool,
    pub last_rewrite_duration: Option<Duration>,
    pub last_bgrewrite_ok: bool,
    pub last_write_error: Option<WriteError>,
    pub current_size: u64,
    pub rewrite_base_size: u64,
    pub buffer_length: usize,
    pub rewrite_buffer_length: usize,
    pub pending_bio_fsync: usize,
    pub delayed_fsync: u64,
}

/// The append-only log of one server.
pub struct Aof {
    config: AofConfig,
    dir: PathBuf,
    path: PathBuf,
    pub(crate) state: AofState,
    pub(crate) file: Option<File>,
    /// Encoded commands not yet written.
    buf: BytesMut,
    /// Database of the last command fed; `None` forces a `SELECT`.
    selected_db: Option<usize>,
    current_size: u64,
    rewrite_base_size: u64,
    last_fsync_secs: u64,
    flush_postponed_since: Option<u64>,
    delayed_fsync: u64,
    last_write_error: Option<WriteError>,
    last_write_error_log_ms: Option<u64>,
    pub(crate) child: Option<RewriteChild>,
    pub(crate) rewrite_buf: RewriteBuffer,
    rewrite_scheduled: bool,
    last_bgrewrite_ok: bool,
    last_rewrite_duration: Option<Duration>,
    policy: ResizePolicy,
    bio: Option<BioHandle>,
    clock: Box<dyn Clock>,
    snapshot: Option<Box<dyn SnapshotCodec>>,
    /// Closed by the rewrite child right after the fork.
    child_close_fds: Vec<RawFd>,
}

impl Aof {
    /// Creates a log in state `Off` for `dir/config.filename`.
    ///
    /// `policy` is the keyspace's resize switch; it is turned off while a
    /// rewrite child shares the parent's pages.
    pub fn new(config: AofConfig, dir: impl Into<PathBuf>, policy: ResizePolicy) -> Self {
        let dir = dir.into();
        let path = dir.join(&config.filename);
        let rewrite_buf = RewriteBuffer::new(config.rewrite_block_size);
        Self {
            config,
            dir,
            path,
            state: AofState::Off,
            file: None,
            buf: BytesMut::new(),
            selected_db: None,
            current_size: 0,
            rewrite_base_size: 0,
            last_fsync_secs: 0,
            flush_postponed_since: None,
            delayed_fsync: 0,
            last_write_error: None,
            last_write_error_log_ms: None,
            child: None,
            rewrite_buf,
            rewrite_scheduled: false,
            last_bgrewrite_ok: true,
            last_rewrite_duration: None,
            policy,
            bio: None,
            clock: Box::new(SystemClock),
            snapshot: None,
            child_close_fds: Vec::new(),
        }
    }

    /// Hands fsync and close jobs to `bio` instead of running them inline.
    pub fn with_bio(mut self, bio: BioHandle) -> Self {
        self.bio = Some(bio);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Codec for the optional snapshot preamble.
    pub fn with_snapshot_codec(mut self, codec: Box<dyn SnapshotCodec>) -> Self {
        self.snapshot = Some(codec);
        self
    }

    pub fn config(&self) -> &AofConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> AofState {
        self.state
    }

    pub fn snapshot_codec(&self) -> Option<&dyn SnapshotCodec> {
        self.snapshot.as_deref()
    }

    /// Registers a descriptor (a listening socket) the rewrite child must
    /// close right after the fork.
    pub fn close_in_child(&mut self, fd: RawFd) {
        self.child_close_fds.push(fd);
    }

    pub fn set_fsync_policy(&mut self, fsync: FsyncPolicy) {
        self.config.fsync = fsync;
    }

    fn now_secs(&self) -> u64 {
        self.clock.now_ms() / 1000
    }

    // ========================================================================
    // Opening and closing
    // ========================================================================

    /// Opens the log for appending at startup, creating it if missing, and
    /// enters `On`.
    pub fn open(&mut self) -> Result<(), AofError> {
        let file = open_append(&self.path)?;
        self.current_size = file.metadata()?.len();
        self.rewrite_base_size = self.current_size;
        self.file = Some(file);
        self.state = AofState::On;
        self.last_fsync_secs = self.now_secs();
        Ok(())
    }

    /// Re-reads the file size, e.g. after the loader truncated the file.
    pub fn reload_size(&mut self) -> Result<(), AofError> {
        if let Some(file) = &self.file {
            self.current_size = file.metadata()?.len();
            self.rewrite_base_size = self.current_size;
        }
        Ok(())
    }

    /// Turns the log on at runtime: opens the file and starts the rewrite
    /// that will produce its trusted content.
    ///
    /// If a rewrite is already running, one is scheduled for when it ends.
    pub fn start_append_only<S>(&mut self, el: &mut EventLoop<S>, ks: &Keyspace) -> Result<(), AofError>
    where
        S: AsMut<Aof> + 'static,
    {
        if self.state != AofState::Off {
            return Ok(());
        }
        let file = open_append(&self.path).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Can't open the append only file to enable the AOF");
            e
        })?;

        if self.child.is_some() {
            self.rewrite_scheduled = true;
            info!("AOF was enabled but there is already a rewrite in progress, scheduling another one");
        } else {
            self.start_background_rewrite(el, ks).map_err(|e| {
                warn!(error = %e, "Can't trigger the background AOF rewrite needed to enable the AOF");
                e
            })?;
        }
        self.file = Some(file);
        self.state = AofState::WaitRewrite;
        self.last_fsync_secs = self.now_secs();
        Ok(())
    }

    /// Turns the log off: flushes and syncs the file, closes it and
    /// cancels any rewrite child.
    pub fn stop_append_only<S>(&mut self, el: &mut EventLoop<S>) -> Result<(), AofError> {
        if self.state == AofState::Off {
            return Ok(());
        }
        self.flush(true)?;
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_data() {
                warn!(error = %e, "Fsync of the append only file failed while turning it off");
            }
        }
        self.selected_db = None;
        self.state = AofState::Off;
        self.kill_rewrite_child(el);
        info!("Append only file turned off");
        Ok(())
    }

    /// Final flush and fsync before exit. A running child is canceled.
    pub fn shutdown<S>(&mut self, el: &mut EventLoop<S>) -> Result<(), AofError> {
        self.kill_rewrite_child(el);
        if self.state == AofState::Off {
            return Ok(());
        }
        info!("Calling fsync() on the AOF file");
        self.flush(true)?;
        if let Some(file) = &self.file {
            file.sync_data()?;
        }
        Ok(())
    }

    // ========================================================================
    // Feed
    // ========================================================================

    /// Appends a command executed against database `db`.
    ///
    /// The command goes to the write buffer while the log is `On`, and to
    /// the rewrite buffer while a rewrite child runs.
    pub fn feed(&mut self, db: usize, argv: &[Bytes]) {
        if self.state != AofState::On && self.child.is_none() {
            return;
        }
        let mut out = BytesMut::new();
        if self.selected_db != Some(db) {
            encoding::cat_select(&mut out, db);
            self.selected_db = Some(db);
        }
        encoding::cat_translated(&mut out, argv, self.clock.now_ms() as i64);

        if self.state == AofState::On {
            self.buf.extend_from_slice(&out);
        }
        if self.child.is_some() {
            self.rewrite_buf.append(&out);
        }
    }

    /// Bytes fed but not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    // ========================================================================
    // Flush
    // ========================================================================

    fn fsync_in_progress(&self) -> bool {
        self.bio.as_ref().is_some_and(|bio| bio.pending(BioKind::Fsync) > 0)
    }

    /// Writes the buffer to the file and fsyncs according to the policy.
    ///
    /// With `force` unset, an `everysec` flush may be postponed while a
    /// background fsync is still running.
    ///
    /// # Errors
    ///
    /// [`AofError::FatalWrite`] when a write or fsync fails under the
    /// `always` policy. Failures under other policies are recorded in the
    /// status and retried by a later flush.
    pub fn flush(&mut self, force: bool) -> Result<(), AofError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };

        let sync_in_progress = self.config.fsync == FsyncPolicy::EverySec && self.fsync_in_progress();
        if sync_in_progress && !force {
            let now = self.now_secs();
            match self.flush_postponed_since {
                None => {
                    self.flush_postponed_since = Some(now);
                    return Ok(());
                }
                Some(since) if now.saturating_sub(since) < MAX_FLUSH_POSTPONE_SECS => return Ok(()),
                Some(_) => {
                    self.delayed_fsync += 1;
                    warn!(
                        "Asynchronous AOF fsync is taking too long (disk is busy?). Writing the AOF buffer without waiting for fsync to complete"
                    );
                }
            }
        }
        self.flush_postponed_since = None;

        let expected = self.buf.len();
        let (mut written, err) = write_buffer(file, &self.buf);
        if written != expected {
            let now_ms = self.clock.now_ms();
            let log_now = self
                .last_write_error_log_ms
                .map_or(true, |last| now_ms.saturating_sub(last) >= WRITE_ERROR_LOG_INTERVAL_MS);
            if log_now {
                self.last_write_error_log_ms = Some(now_ms);
                match &err {
                    Some(e) => error!(error = %e, "Error writing to the AOF file"),
                    None => warn!(written, expected, "Short write while writing to the AOF file (is the disk near full?)"),
                }
            }

            if written > 0 {
                match file.set_len(self.current_size) {
                    Ok(()) => written = 0,
                    Err(e) => {
                        if log_now {
                            warn!(error = %e, "Could not remove short write from the append-only file");
                        }
                    }
                }
            }

            if self.config.fsync == FsyncPolicy::Always {
                error!("Can't recover from AOF write error when the AOF fsync policy is 'always'. Exiting...");
                let cause = err.unwrap_or_else(|| io::Error::new(io::ErrorKind::WriteZero, "short write"));
                return Err(AofError::FatalWrite(cause));
            }

            self.last_write_error = Some(match &err {
                Some(e) => WriteError::Io(e.kind()),
                None => WriteError::Short { written, expected },
            });
            if written > 0 {
                // The partial tail could not be removed; keep only what is
                // still unwritten.
                self.current_size += written as u64;
                self.buf.advance(written);
            }
            return Ok(());
        }

        if self.last_write_error.take().is_some() {
            warn!("AOF write error looks solved, writes are accepted again");
        }
        self.current_size += written as u64;
        if self.buf.capacity() < 4000 {
            self.buf.clear();
        } else {
            self.buf = BytesMut::new();
        }

        if self.config.no_fsync_on_rewrite && self.child.is_some() {
            return Ok(());
        }
        let now = self.now_secs();
        match self.config.fsync {
            FsyncPolicy::Always => {
                if let Err(e) = file.sync_data() {
                    error!(error = %e, "Can't persist AOF for fsync error when the AOF fsync policy is 'always'. Exiting...");
                    return Err(AofError::FatalWrite(e));
                }
                self.last_fsync_secs = now;
            }
            FsyncPolicy::EverySec if now > self.last_fsync_secs => {
                if !sync_in_progress {
                    background_fsync(self.bio.as_ref(), file);
                }
                self.last_fsync_secs = now;
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether a flush is waiting for a background fsync.
    pub fn flush_postponed(&self) -> bool {
        self.flush_postponed_since.is_some()
    }

    pub fn last_write_error(&self) -> Option<WriteError> {
        self.last_write_error
    }

    /// Write commands must be refused: the log is on and cannot be written.
    pub fn writes_blocked(&self) -> bool {
        self.state == AofState::On && self.last_write_error.is_some()
    }

    // ========================================================================
    // Rewrite triggers
    // ========================================================================

    pub fn rewrite_scheduled(&self) -> bool {
        self.rewrite_scheduled
    }

    pub fn schedule_rewrite(&mut self) {
        self.rewrite_scheduled = true;
    }

    /// Whether the log has grown enough over its post-rewrite size to be
    /// rewritten automatically.
    pub fn should_auto_rewrite(&self) -> bool {
        if self.state != AofState::On || self.child.is_some() || self.config.auto_rewrite_percentage == 0 {
            return false;
        }
        if self.current_size <= self.config.auto_rewrite_min_size {
            return false;
        }
        let base = self.rewrite_base_size.max(1);
        let growth = (self.current_size.saturating_sub(base)) * 100 / base;
        growth >= self.config.auto_rewrite_percentage
    }

    pub fn status(&self) -> AofStatus {
        AofStatus {
            state: self.state,
            rewrite_in_progress: self.child.is_some(),
            rewrite_scheduled: self.rewrite_scheduled,
            last_rewrite_duration: self.last_rewrite_duration,
            last_bgrewrite_ok: self.last_bgrewrite_ok,
            last_write_error: self.last_write_error,
            current_size: self.current_size,
            rewrite_base_size: self.rewrite_base_size,
            buffer_length: self.buf.len(),
            rewrite_buffer_length: self.rewrite_buf.len(),
            pending_bio_fsync: self.bio.as_ref().map_or(0, |bio| bio.pending(BioKind::Fsync)),
            delayed_fsync: self.delayed_fsync,
        }
    }
}

impl AsMut<Aof> for Aof {
    fn as_mut(&mut self) -> &mut Aof {
        self
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Writes as much of `data` as possible.
///
/// # Returns
///
/// Bytes written and the error that stopped the write, if any.
fn write_buffer(mut file: &File, data: &[u8]) -> (usize, Option<io::Error>) {
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (written, Some(e)),
        }
    }
    (written, None)
}

/// Fsyncs `file` on the background pool, or inline without one.
fn background_fsync(bio: Option<&BioHandle>, file: &File) {
    let result = match bio {
        Some(bio) => bio.fsync(file),
        None => file.sync_data(),
    };
    if let Err(e) = result {
        warn!(error = %e, "Fsync of the append only file failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ManualClock;

    fn make_command(args: &[&str]) -> Vec<Bytes> {
        args.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    fn open_log(dir: &tempfile::TempDir, fsync: FsyncPolicy) -> (Aof, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let config = AofConfig {
            enabled: true,
            fsync,
            ..AofConfig::default()
        };
        let mut aof = Aof::new(config, dir.path(), ResizePolicy::default()).with_clock(clock.clone());
        aof.open().unwrap();
        (aof, clock)
    }

    #[test]
    fn test_feed_and_flush_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let (mut aof, _) = open_log(&dir, FsyncPolicy::EverySec);

        aof.feed(0, &make_command(&["SET", "k", "v"]));
        aof.flush(true).unwrap();

        let data = std::fs::read(aof.path()).unwrap();
        assert_eq!(
            data,
            b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"
        );
        assert_eq!(aof.status().current_size, data.len() as u64);
        assert_eq!(aof.pending_bytes(), 0);
    }

    #[test]
    fn test_select_only_on_db_change() {
        let dir = tempfile::tempdir().unwrap();
        let (mut aof, _) = open_log(&dir, FsyncPolicy::No);

        aof.feed(0, &make_command(&["INCR", "a"]));
        aof.feed(0, &make_command(&["INCR", "a"]));
        aof.feed(3, &make_command(&["INCR", "a"]));
        aof.flush(false).unwrap();

        let data = std::fs::read(aof.path()).unwrap();
        let text = String::from_utf8(data).unwrap();
        assert_eq!(text.matches("SELECT").count(), 2);
        assert_eq!(text.matches("INCR").count(), 3);
    }

    #[test]
    fn test_feed_translates_relative_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let (mut aof, _) = open_log(&dir, FsyncPolicy::No);

        aof.feed(0, &make_command(&["EXPIRE", "k", "10"]));
        aof.flush(true).unwrap();

        let text = String::from_utf8(std::fs::read(aof.path()).unwrap()).unwrap();
        assert!(text.ends_with("*3\r\n$9\r\nPEXPIREAT\r\n$1\r\nk\r\n$13\r\n1700000010000\r\n"));
    }

    #[test]
    fn test_feed_ignored_when_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut aof = Aof::new(AofConfig::default(), dir.path(), ResizePolicy::default());
        aof.feed(0, &make_command(&["SET", "k", "v"]));
        assert_eq!(aof.pending_bytes(), 0);
        assert_eq!(aof.state(), AofState::Off);
    }

    #[test]
    fn test_write_error_recorded_then_solved() {
        let dir = tempfile::tempdir().unwrap();
        let (mut aof, _) = open_log(&dir, FsyncPolicy::EverySec);

        // A read-only handle makes every write fail.
        let writable = aof.file.replace(File::open(aof.path()).unwrap());
        aof.feed(0, &make_command(&["SET", "k", "v"]));
        aof.flush(true).unwrap();
        assert!(matches!(aof.last_write_error(), Some(WriteError::Io(_))));
        assert!(aof.writes_blocked());
        assert!(!aof.flush_postponed());
        assert!(aof.pending_bytes() > 0);

        aof.file = writable;
        aof.flush(false).unwrap();
        assert_eq!(aof.last_write_error(), None);
        assert!(!aof.writes_blocked());
        assert_eq!(aof.pending_bytes(), 0);
        assert!(std::fs::read(aof.path()).unwrap().ends_with(b"$1\r\nv\r\n"));
    }

    #[test]
    fn test_write_error_is_fatal_under_always() {
        let dir = tempfile::tempdir().unwrap();
        let (mut aof, _) = open_log(&dir, FsyncPolicy::Always);
        aof.file = Some(File::open(aof.path()).unwrap());

        aof.feed(0, &make_command(&["SET", "k", "v"]));
        let err = aof.flush(true).unwrap_err();
        assert!(matches!(err, AofError::FatalWrite(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_auto_rewrite_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (mut aof, _) = open_log(&dir, FsyncPolicy::No);
        aof.config.auto_rewrite_min_size = 10;
        aof.rewrite_base_size = 100;

        aof.current_size = 150;
        assert!(!aof.should_auto_rewrite());
        aof.current_size = 200;
        assert!(aof.should_auto_rewrite());

        aof.config.auto_rewrite_percentage = 0;
        assert!(!aof.should_auto_rewrite());
    }

    #[test]
    fn test_status_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (aof, _) = open_log(&dir, FsyncPolicy::EverySec);
        let status = aof.status();
        assert_eq!(status.state, AofState::On);
        assert!(!status.rewrite_in_progress);
        assert!(status.last_bgrewrite_ok);
        assert_eq!(status.pending_bio_fsync, 0);
    }
}
