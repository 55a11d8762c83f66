//! Feed, flush and reload: replaying the log must rebuild the keyspace the
//! commands produced.

use bytes::Bytes;
use emberkv::aof::{load_file, Aof, AofError, LoadOptions, LoadSink};
use emberkv::commands::{ClientContext, CommandExecutor};
use emberkv::config::{AofConfig, FsyncPolicy};
use emberkv::dict::ResizePolicy;
use emberkv::reactor::ManualClock;
use emberkv::storage::{Keyspace, Value};
use std::convert::Infallible;
use std::fs::OpenOptions;
use std::io::Write;

const NOW_MS: u64 = 1_700_000_000_000;
const DATABASES: usize = 4;

fn make_command(args: &[&str]) -> Vec<Bytes> {
    args.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
}

/// Executes replayed commands against a fresh keyspace.
struct Replayer {
    ks: Keyspace,
    executor: CommandExecutor,
    ctx: ClientContext,
    progress_calls: usize,
}

impl Replayer {
    fn new(clock: ManualClock) -> Self {
        let mut ks = Keyspace::with_clock(DATABASES, ResizePolicy::default(), clock);
        ks.set_loading(true);
        Self {
            ks,
            executor: CommandExecutor::new(None),
            ctx: ClientContext::default(),
            progress_calls: 0,
        }
    }
}

impl LoadSink for Replayer {
    fn apply(&mut self, argv: Vec<Bytes>) -> Result<(), AofError> {
        let out = self.executor.execute(&mut self.ks, &mut self.ctx, &argv);
        assert!(!out.reply.is_error(), "replay failed: {:?}", out.reply);
        Ok(())
    }

    fn progress(&mut self, _offset: u64) {
        self.progress_calls += 1;
    }
}

/// Every live key as `(db, key, value, expire)`, sorted.
fn dump(ks: &Keyspace) -> Vec<(usize, Bytes, Value, Option<i64>)> {
    let mut out = Vec::new();
    for db in 0..ks.db_count() {
        ks.for_each_live(db, ks.now_ms(), |key, value, expire| -> Result<(), Infallible> {
            out.push((db, key.clone(), value.clone(), expire));
            Ok(())
        })
        .unwrap();
    }
    out.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    out
}

/// Runs commands like the server does: execute, then log what changed.
struct Primary {
    ks: Keyspace,
    executor: CommandExecutor,
    ctx: ClientContext,
    aof: Aof,
}

impl Primary {
    fn new(dir: &tempfile::TempDir, clock: ManualClock) -> Self {
        let config = AofConfig {
            enabled: true,
            fsync: FsyncPolicy::No,
            ..AofConfig::default()
        };
        let mut aof = Aof::new(config, dir.path(), ResizePolicy::default()).with_clock(clock.clone());
        aof.open().unwrap();
        Self {
            ks: Keyspace::with_clock(DATABASES, ResizePolicy::default(), clock),
            executor: CommandExecutor::new(None),
            ctx: ClientContext::default(),
            aof,
        }
    }

    fn run(&mut self, args: &[&str]) {
        let argv = make_command(args);
        let out = self.executor.execute(&mut self.ks, &mut self.ctx, &argv);
        for (db, key) in self.ks.take_expired() {
            self.aof.feed(db, &[Bytes::from_static(b"DEL"), key]);
        }
        if out.dirty > 0 {
            let logged = out.propagate_as.as_deref().unwrap_or(&argv);
            self.aof.feed(self.ctx.db, logged);
        }
        self.aof.flush(false).unwrap();
    }
}

#[test]
fn test_replay_rebuilds_keyspace() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(NOW_MS);
    let mut primary = Primary::new(&dir, clock.clone());

    primary.run(&["SET", "greeting", "hello"]);
    primary.run(&["APPEND", "greeting", " world"]);
    primary.run(&["INCRBY", "counter", "41"]);
    primary.run(&["INCR", "counter"]);
    primary.run(&["RPUSH", "queue", "a", "b", "c"]);
    primary.run(&["LPOP", "queue"]);
    primary.run(&["SELECT", "2"]);
    primary.run(&["SET", "session", "token", "EX", "100"]);
    primary.run(&["SETEX", "cache", "50", "blob"]);
    primary.run(&["EXPIRE", "missing", "10"]);
    primary.run(&["SELECT", "1"]);
    primary.run(&["SET", "doomed", "x"]);
    primary.run(&["PEXPIRE", "doomed", "-1"]);
    primary.run(&["SET", "kept", "y", "PX", "5000"]);
    primary.run(&["PERSIST", "kept"]);

    // Replay later: relative expiries were logged as absolute deadlines.
    clock.advance(20_000);
    let mut replayer = Replayer::new(clock.clone());
    let report = load_file(primary.aof.path(), LoadOptions::default(), &mut replayer).unwrap();
    replayer.ks.set_loading(false);

    assert!(report.commands > 0);
    assert_eq!(report.truncated_to, None);
    assert_eq!(dump(&replayer.ks), dump(&primary.ks));
    assert_eq!(replayer.ks.get_expire(2, &Bytes::from("session")), Some(NOW_MS as i64 + 100_000));
    assert_eq!(replayer.ks.get_expire(1, &Bytes::from("kept")), None);
}

#[test]
fn test_expired_keys_replay_as_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(NOW_MS);
    let mut primary = Primary::new(&dir, clock.clone());

    primary.run(&["SET", "short", "lived", "PX", "10"]);
    clock.advance(100);
    // Lazy expiry on access is logged as DEL before the read.
    primary.run(&["GET", "short"]);

    let text = String::from_utf8(std::fs::read(primary.aof.path()).unwrap()).unwrap();
    assert!(text.ends_with("*2\r\n$3\r\nDEL\r\n$5\r\nshort\r\n"));

    // Replaying much earlier than the deadline still ends without the key.
    clock.set(NOW_MS - 1_000_000);
    let mut replayer = Replayer::new(clock);
    load_file(primary.aof.path(), LoadOptions::default(), &mut replayer).unwrap();
    assert!(replayer.ks.is_empty());
}

#[test]
fn test_progress_reported_during_long_load() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(NOW_MS);
    let mut primary = Primary::new(&dir, clock.clone());
    for i in 0..2500 {
        primary.run(&["SET", &format!("key:{}", i), "v"]);
    }

    let mut replayer = Replayer::new(clock);
    let report = load_file(primary.aof.path(), LoadOptions::default(), &mut replayer).unwrap();
    // One SELECT plus 2500 SETs.
    assert_eq!(report.commands, 2501);
    assert_eq!(replayer.progress_calls, 2);
    assert_eq!(replayer.ks.len(), 2500);
}

#[test]
fn test_truncated_tail_tolerated_and_cut() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(NOW_MS);
    let mut primary = Primary::new(&dir, clock.clone());
    primary.run(&["SET", "a", "1"]);
    primary.run(&["SET", "b", "2"]);

    let path = primary.aof.path().to_path_buf();
    let valid = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nc\r\n$1")
        .unwrap();

    let mut strict = Replayer::new(clock.clone());
    let options = LoadOptions {
        load_truncated: false,
        snapshot: None,
    };
    match load_file(&path, options, &mut strict) {
        Err(AofError::Truncated { offset }) => assert_eq!(offset, valid),
        other => panic!("expected a truncation error, got {:?}", other),
    }

    let mut tolerant = Replayer::new(clock);
    let options = LoadOptions {
        load_truncated: true,
        snapshot: None,
    };
    let report = load_file(&path, options, &mut tolerant).unwrap();
    assert_eq!(report.truncated_to, Some(valid));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), valid);
    assert_eq!(tolerant.ks.len(), 2);
}

#[test]
fn test_garbage_is_a_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("appendonly.aof");
    std::fs::write(&path, b"*1\r\n$4\r\nPING\r\nGARBAGE\r\n").unwrap();

    let mut replayer = Replayer::new(ManualClock::new(NOW_MS));
    match load_file(&path, LoadOptions::default(), &mut replayer) {
        Err(AofError::Format { offset, .. }) => assert_eq!(offset, 14),
        other => panic!("expected a format error, got {:?}", other),
    }
}
