//! The rewrite child.
//!
//! Runs in the forked process only. It rebuilds the log from its
//! copy-on-write image of the keyspace, collects the commands the parent
//! keeps streaming meanwhile, and hands the result back as a file:
//!
//! ```text
//! 1. temp-rewriteaof-<pid>.aof  <- SELECT/SET/RPUSH/PEXPIREAT per live key
//!                                  (diff channel read every 10 KiB)
//! 2. fsync, then drain the diff channel: up to 1 s or 20 empty 1 ms polls
//! 3. stop handshake: send '!', wait up to 5 s for '!'
//! 4. last diff read, append the whole diff, fsync
//! 5. rename to temp-rewriteaof-bg-<pid>.aof   (the parent picks it up)
//! ```

use super::encoding::{cat_command, cat_pexpireat, cat_select};
use super::loader::SnapshotCodec;
use super::pipes::{ChildPipes, HANDSHAKE_BYTE};
use super::AofError;
use crate::config::AofConfig;
use crate::reactor::poller::wait_fd;
use crate::reactor::Interest;
use crate::storage::{Keyspace, Value};
use bytes::{Bytes, BytesMut};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Output size between two reads of the diff channel.
const DIFF_READ_INTERVAL: usize = 10 * 1024;

/// Output size between two fsyncs when incremental fsync is on.
const INCREMENTAL_FSYNC_BYTES: u64 = 32 * 1024 * 1024;

const DRAIN_LIMIT: Duration = Duration::from_millis(1000);
const DRAIN_MAX_EMPTY_POLLS: u32 = 20;
const HANDSHAKE_TIMEOUT_MS: i32 = 5000;

/// Name of the file the child writes into.
pub fn temp_file_name(dir: &Path, pid: i32) -> PathBuf {
    dir.join(format!("temp-rewriteaof-{}.aof", pid))
}

/// Name under which the child leaves its finished file.
pub fn done_file_name(dir: &Path, pid: i32) -> PathBuf {
    dir.join(format!("temp-rewriteaof-bg-{}.aof", pid))
}

/// Knobs copied out of [`AofConfig`] before the fork.
#[derive(Debug, Clone)]
pub struct RewriteSettings {
    pub items_per_cmd: usize,
    pub incremental_fsync: bool,
    pub use_snapshot_preamble: bool,
}

impl From<&AofConfig> for RewriteSettings {
    fn from(config: &AofConfig) -> Self {
        Self {
            items_per_cmd: config.rewrite_items_per_cmd.max(1),
            incremental_fsync: config.rewrite_incremental_fsync,
            use_snapshot_preamble: config.use_snapshot_preamble,
        }
    }
}

/// Child entry point.
///
/// # Returns
///
/// The exit status: 0 on success, 1 on failure.
pub fn run_child(
    ks: &Keyspace,
    pipes: ChildPipes,
    dir: &Path,
    settings: &RewriteSettings,
    snapshot: Option<&dyn SnapshotCodec>,
) -> i32 {
    let pid = std::process::id() as i32;
    let mut child = ChildRewrite {
        pipes,
        settings,
        diff: Vec::new(),
    };
    match child.rewrite(ks, dir, pid, snapshot) {
        Ok(()) => 0,
        Err(e) => {
            warn!(error = %e, "Error rewriting the append only file");
            let _ = fs::remove_file(temp_file_name(dir, pid));
            1
        }
    }
}

struct ChildRewrite<'a> {
    pipes: ChildPipes,
    settings: &'a RewriteSettings,
    /// Commands received from the parent so far.
    diff: Vec<u8>,
}

impl ChildRewrite<'_> {
    fn rewrite(&mut self, ks: &Keyspace, dir: &Path, pid: i32, snapshot: Option<&dyn SnapshotCodec>) -> Result<(), AofError> {
        let temp = temp_file_name(dir, pid);
        let mut file = File::create(&temp)?;

        match snapshot {
            Some(codec) if self.settings.use_snapshot_preamble => {
                codec.save(ks, &mut file)?;
                self.pipes.read_diff(&mut self.diff)?;
            }
            _ => self.write_keyspace(ks, &mut file)?,
        }
        file.sync_data()?;

        self.drain_diff()?;
        self.stop_handshake()?;
        self.pipes.read_diff(&mut self.diff)?;

        info!(bytes = self.diff.len(), "Concatenating AOF diff accumulated during the rewrite");
        file.write_all(&self.diff)?;
        file.sync_data()?;
        drop(file);

        fs::rename(&temp, done_file_name(dir, pid))?;
        info!("SYNC append only file rewrite performed");
        Ok(())
    }

    /// Emits reconstruction commands for every live key.
    fn write_keyspace(&mut self, ks: &Keyspace, file: &mut File) -> Result<(), AofError> {
        let now = ks.now_ms();
        let items_per_cmd = self.settings.items_per_cmd;
        let mut out = BytesMut::with_capacity(2 * DIFF_READ_INTERVAL);
        let mut since_fsync = 0u64;

        for db in 0..ks.db_count() {
            if ks.db(db).map_or(true, |d| d.is_empty()) {
                continue;
            }
            cat_select(&mut out, db);
            ks.for_each_live(db, now, |key, value, expire| -> Result<(), AofError> {
                emit_key(&mut out, key, value, items_per_cmd);
                if let Some(when) = expire {
                    cat_pexpireat(&mut out, key, when);
                }
                if out.len() >= DIFF_READ_INTERVAL {
                    file.write_all(&out)?;
                    since_fsync += out.len() as u64;
                    out.clear();
                    if self.settings.incremental_fsync && since_fsync >= INCREMENTAL_FSYNC_BYTES {
                        file.sync_data()?;
                        since_fsync = 0;
                    }
                    self.pipes.read_diff(&mut self.diff)?;
                }
                Ok(())
            })?;
        }
        file.write_all(&out)?;
        Ok(())
    }

    /// Reads diff bytes until the parent goes quiet or the time limit hits.
    fn drain_diff(&mut self) -> io::Result<()> {
        let start = Instant::now();
        let mut empty_polls = 0;
        let fd = self.pipes.diff_rx.as_raw_fd();
        while start.elapsed() < DRAIN_LIMIT && empty_polls < DRAIN_MAX_EMPTY_POLLS {
            if wait_fd(fd, Interest::READABLE, 1)?.is_empty() {
                empty_polls += 1;
                continue;
            }
            empty_polls = 0;
            self.pipes.read_diff(&mut self.diff)?;
        }
        Ok(())
    }

    /// Asks the parent to stop sending and waits for its acknowledgment.
    fn stop_handshake(&mut self) -> Result<(), AofError> {
        self.pipes.send_stop()?;

        let fd = self.pipes.ack_rx.as_raw_fd();
        if wait_fd(fd, Interest::READABLE, HANDSHAKE_TIMEOUT_MS)?.is_empty() {
            return Err(AofError::Handshake("parent did not acknowledge the stop request in time".into()));
        }
        let mut byte = [0u8; 1];
        let n = self.pipes.ack_rx.read(&mut byte)?;
        if n != 1 || byte[0] != HANDSHAKE_BYTE {
            return Err(AofError::Handshake("unexpected acknowledgment from parent".into()));
        }
        info!("Parent agreed to stop sending diffs. Finalizing AOF...");
        Ok(())
    }
}

/// Strings become `SET`, lists become `RPUSH` batches of at most
/// `items_per_cmd` elements.
fn emit_key(out: &mut BytesMut, key: &Bytes, value: &Value, items_per_cmd: usize) {
    match value {
        Value::Str(s) => cat_command(out, &[b"SET".as_slice(), &key[..], &s[..]]),
        Value::List(items) => {
            let items: Vec<&Bytes> = items.iter().collect();
            for batch in items.chunks(items_per_cmd.max(1)) {
                let mut argv: Vec<&[u8]> = Vec::with_capacity(batch.len() + 2);
                argv.push(b"RPUSH");
                argv.push(key);
                argv.extend(batch.iter().map(|b| &b[..]));
                cat_command(out, &argv);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::pipes;
    use std::collections::VecDeque;

    fn settings(items_per_cmd: usize) -> RewriteSettings {
        RewriteSettings {
            items_per_cmd,
            incremental_fsync: true,
            use_snapshot_preamble: false,
        }
    }

    #[test]
    fn test_list_batches() {
        let items: VecDeque<Bytes> = ["a", "b", "c"].iter().map(|s| Bytes::from(*s)).collect();

        let mut out = BytesMut::new();
        emit_key(&mut out, &Bytes::from("l"), &Value::List(items), 2);

        let mut expected = BytesMut::new();
        cat_command(&mut expected, &["RPUSH", "l", "a", "b"]);
        cat_command(&mut expected, &["RPUSH", "l", "c"]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_rewrite_in_process_with_ack() {
        let dir = tempfile::tempdir().unwrap();
        let mut ks = Keyspace::new(4);
        ks.set(0, Bytes::from("s"), Value::Str(Bytes::from("v")));
        ks.set(2, Bytes::from("t"), Value::Str(Bytes::from("w")));
        ks.set_expire(2, &Bytes::from("t"), i64::MAX / 2);

        let (mut parent, child_pipes) = pipes::open().unwrap();
        parent.diff_tx.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
        // Acknowledge ahead of time; the child reads it after its stop byte.
        parent.send_ack().unwrap();

        let settings = settings(64);
        let mut child = ChildRewrite {
            pipes: child_pipes,
            settings: &settings,
            diff: Vec::new(),
        };
        child.rewrite(&ks, dir.path(), 4242, None).unwrap();
        assert!(parent.read_stop().unwrap());

        let written = fs::read(done_file_name(dir.path(), 4242)).unwrap();
        let mut expected = BytesMut::new();
        cat_select(&mut expected, 0);
        cat_command(&mut expected, &["SET", "s", "v"]);
        cat_select(&mut expected, 2);
        cat_command(&mut expected, &["SET", "t", "w"]);
        cat_pexpireat(&mut expected, b"t", i64::MAX / 2);
        expected.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(written, expected.to_vec());
        assert!(!temp_file_name(dir.path(), 4242).exists());
    }
}
