//! Replaying a log file.
//!
//! The file is read in chunks and decoded with the strict multi-bulk
//! decoder. Each complete command is handed to a [`LoadSink`]; the sink is
//! also told the current offset every [`PROGRESS_EVERY`] commands so the
//! caller can keep serving events during a long load.
//!
//! ## End of file
//!
//! - clean end: success
//! - malformed record: [`AofError::Format`] at the record's offset
//! - incomplete last record: with truncation tolerance the file is cut
//!   back to the last complete record and the load succeeds, otherwise
//!   [`AofError::Truncated`]

use super::AofError;
use crate::protocol::CommandDecoder;
use crate::storage::Keyspace;
use bytes::{Buf, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Leading bytes of an embedded snapshot.
pub const SNAPSHOT_SIGNATURE: &[u8] = b"REDIS";

/// Commands between two [`LoadSink::progress`] calls.
pub const PROGRESS_EVERY: u64 = 1000;

const READ_CHUNK: usize = 64 * 1024;

/// Receiver of replayed commands.
pub trait LoadSink {
    /// Executes one command. Replies are discarded by the caller.
    fn apply(&mut self, argv: Vec<Bytes>) -> Result<(), AofError>;

    /// Called periodically with the number of bytes consumed so far.
    fn progress(&mut self, _offset: u64) {}
}

/// Snapshot format embedded at the start of a log.
pub trait SnapshotCodec {
    /// Writes a snapshot of `ks` that starts with [`SNAPSHOT_SIGNATURE`].
    fn save(&self, ks: &Keyspace, out: &mut dyn Write) -> io::Result<()>;

    /// Replays the snapshot at the start of `data` into `sink`.
    ///
    /// # Returns
    ///
    /// Number of bytes the snapshot occupied.
    fn load(&self, data: &[u8], sink: &mut dyn LoadSink) -> Result<usize, AofError>;
}

/// Result of a successful load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Commands replayed, snapshot excluded.
    pub commands: u64,
    /// Offset just past the last complete record.
    pub valid_bytes: u64,
    /// Set when an incomplete tail was cut off.
    pub truncated_to: Option<u64>,
}

/// Load behaviour.
#[derive(Default, Clone, Copy)]
pub struct LoadOptions<'a> {
    /// Cut an incomplete last record instead of failing.
    pub load_truncated: bool,
    pub snapshot: Option<&'a dyn SnapshotCodec>,
}

/// Replays the log at `path` into `sink`.
///
/// # Example
///
/// ```
/// use emberkv::aof::{load_file, AofError, LoadOptions, LoadSink};
/// use bytes::Bytes;
///
/// struct Collect(Vec<Vec<Bytes>>);
///
/// impl LoadSink for Collect {
///     fn apply(&mut self, argv: Vec<Bytes>) -> Result<(), AofError> {
///         self.0.push(argv);
///         Ok(())
///     }
/// }
///
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("appendonly.aof");
/// std::fs::write(&path, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
///
/// let mut sink = Collect(Vec::new());
/// let report = load_file(&path, LoadOptions::default(), &mut sink).unwrap();
/// assert_eq!(report.commands, 1);
/// assert_eq!(sink.0[0][0], Bytes::from("GET"));
/// ```
pub fn load_file(path: &Path, options: LoadOptions<'_>, sink: &mut dyn LoadSink) -> Result<LoadReport, AofError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size == 0 {
        debug!(path = %path.display(), "Empty append only file");
        return Ok(LoadReport::default());
    }

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut offset = 0u64;
    let mut report = LoadReport::default();

    fill(&mut file, &mut buf)?;
    if buf.starts_with(SNAPSHOT_SIGNATURE) {
        let Some(codec) = options.snapshot else {
            return Err(AofError::Snapshot(
                "file starts with a snapshot preamble but no snapshot codec is configured".into(),
            ));
        };
        // The codec needs the whole preamble at once.
        while fill(&mut file, &mut buf)? > 0 {}
        let used = codec.load(&buf, sink)?;
        info!(bytes = used, "Reading snapshot preamble of the append only file");
        buf.advance(used);
        offset = used as u64;
    }

    let decoder = CommandDecoder::strict();
    loop {
        match decoder.decode(&buf) {
            Ok(Some((argv, consumed))) => {
                sink.apply(argv).map_err(|e| match e {
                    AofError::UnknownCommand { name, .. } => AofError::UnknownCommand { offset, name },
                    other => other,
                })?;
                buf.advance(consumed);
                offset += consumed as u64;
                report.commands += 1;
                if report.commands % PROGRESS_EVERY == 0 {
                    sink.progress(offset);
                }
            }
            Ok(None) => {
                if fill(&mut file, &mut buf)? > 0 {
                    continue;
                }
                report.valid_bytes = offset;
                if buf.is_empty() {
                    return Ok(report);
                }
                return truncated_tail(path, offset, options.load_truncated, report);
            }
            Err(e) => {
                return Err(AofError::Format {
                    offset,
                    reason: e.to_string(),
                })
            }
        }
    }
}

fn fill(file: &mut File, buf: &mut BytesMut) -> io::Result<usize> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match file.read(&mut chunk) {
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn truncated_tail(path: &Path, offset: u64, load_truncated: bool, mut report: LoadReport) -> Result<LoadReport, AofError> {
    if !load_truncated {
        return Err(AofError::Truncated { offset });
    }
    warn!(
        path = %path.display(),
        offset,
        "AOF loaded anyway because aof-load-truncated is enabled, truncating the incomplete last command"
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(offset)?;
    file.sync_all()?;
    report.truncated_to = Some(offset);
    info!(offset, "AOF truncated to the last valid command");
    Ok(report)
}
