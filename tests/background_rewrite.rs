//! Background rewrite with a real forked child while the parent keeps
//! accepting writes.

use bytes::Bytes;
use emberkv::aof::rewrite::{done_file_name, temp_file_name};
use emberkv::aof::{load_file, Aof, AofError, LoadOptions, LoadSink};
use emberkv::commands::{ClientContext, CommandExecutor};
use emberkv::config::{AofConfig, FsyncPolicy};
use emberkv::dict::ResizePolicy;
use emberkv::process::ChildExit;
use emberkv::reactor::{EventLoop, ProcessFlags};
use emberkv::storage::{Keyspace, Value};
use std::convert::Infallible;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DATABASES: usize = 4;
const REWRITE_TIMEOUT: Duration = Duration::from_secs(30);

// Forked children inherit every open pipe of the test process, so the
// rewrites in this binary run one at a time.
static FORK_LOCK: Mutex<()> = Mutex::new(());

fn make_command(args: &[&str]) -> Vec<Bytes> {
    args.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
}

struct Node {
    ks: Keyspace,
    executor: CommandExecutor,
    ctx: ClientContext,
    aof: Aof,
    el: EventLoop<Aof>,
}

impl Node {
    fn new(dir: &tempfile::TempDir) -> Self {
        let policy = ResizePolicy::default();
        let config = AofConfig {
            enabled: true,
            fsync: FsyncPolicy::No,
            ..AofConfig::default()
        };
        let mut aof = Aof::new(config, dir.path(), policy.clone());
        aof.open().unwrap();
        Self {
            ks: Keyspace::with_policy(DATABASES, policy),
            executor: CommandExecutor::new(None),
            ctx: ClientContext::default(),
            aof,
            el: EventLoop::new(1024),
        }
    }

    fn run(&mut self, args: &[&str]) {
        let argv = make_command(args);
        let out = self.executor.execute(&mut self.ks, &mut self.ctx, &argv);
        assert!(!out.reply.is_error(), "{:?} failed: {:?}", args, out.reply);
        if out.dirty > 0 {
            let logged = out.propagate_as.as_deref().unwrap_or(&argv);
            self.aof.feed(self.ctx.db, logged);
        }
    }

    /// One loop iteration the way the server's before-sleep hook and cron
    /// drive it.
    fn tick(&mut self) -> Option<ChildExit> {
        self.aof.flush(false).unwrap();
        self.aof.arm_diff_writer(&mut self.el);
        self.el
            .process_events(&mut self.aof, ProcessFlags::FILE_EVENTS | ProcessFlags::DONT_WAIT)
            .unwrap();
        self.aof.poll_rewrite_child(&mut self.el).unwrap()
    }

    fn wait_for_child(&mut self, mut between: impl FnMut(&mut Self, usize)) -> ChildExit {
        let deadline = Instant::now() + REWRITE_TIMEOUT;
        let mut round = 0;
        loop {
            between(self, round);
            if let Some(exit) = self.tick() {
                return exit;
            }
            assert!(Instant::now() < deadline, "rewrite child did not finish");
            round += 1;
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

struct Replayer {
    ks: Keyspace,
    executor: CommandExecutor,
    ctx: ClientContext,
}

impl LoadSink for Replayer {
    fn apply(&mut self, argv: Vec<Bytes>) -> Result<(), AofError> {
        let out = self.executor.execute(&mut self.ks, &mut self.ctx, &argv);
        assert!(!out.reply.is_error(), "replay failed: {:?}", out.reply);
        Ok(())
    }
}

fn reload(aof: &Aof) -> Keyspace {
    let mut ks = Keyspace::new(DATABASES);
    ks.set_loading(true);
    let mut replayer = Replayer {
        ks,
        executor: CommandExecutor::new(None),
        ctx: ClientContext::default(),
    };
    load_file(aof.path(), LoadOptions::default(), &mut replayer).unwrap();
    replayer.ks.set_loading(false);
    replayer.ks
}

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

#[test]
fn test_rewrite_keeps_writes_made_during_it() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let mut node = Node::new(&dir);

    for i in 0..2000 {
        node.run(&["SET", &format!("key:{}", i), &format!("value:{}", i)]);
    }
    for i in 0..2000 {
        // Overwrites make the old log much larger than a rewrite of it.
        node.run(&["SET", &format!("key:{}", i), &format!("v{}", i)]);
    }
    node.run(&["RPUSH", "list", "a", "b", "c", "d", "e"]);
    node.run(&["SELECT", "3"]);
    node.run(&["SET", "ttl", "x", "EX", "1000"]);
    node.aof.flush(true).unwrap();
    let size_before = node.aof.status().current_size;

    node.aof.start_background_rewrite(&mut node.el, &node.ks).unwrap();
    assert!(node.aof.is_rewriting());
    assert!(matches!(
        node.aof.start_background_rewrite(&mut node.el, &node.ks),
        Err(AofError::AlreadyRunning)
    ));

    let pid = node.aof.rewrite_child_pid().unwrap().as_raw();
    let exit = node.wait_for_child(|node, round| {
        if round < 200 {
            node.run(&["SELECT", "1"]);
            node.run(&["INCR", "during"]);
            node.run(&["RPUSH", "events", &format!("e{}", round)]);
            node.run(&["SELECT", "0"]);
            node.run(&["DEL", &format!("key:{}", round)]);
        }
    });
    assert_eq!(exit, ChildExit::Exited(0));

    let status = node.aof.status();
    assert!(!status.rewrite_in_progress);
    assert!(status.last_bgrewrite_ok);
    assert!(status.current_size < size_before);
    assert!(!temp_file_name(dir.path(), pid).exists());
    assert!(!done_file_name(dir.path(), pid).exists());

    // Writes after the swap land in the new file.
    node.run(&["SET", "after", "swap"]);
    node.aof.flush(true).unwrap();
    assert_eq!(
        std::fs::metadata(node.aof.path()).unwrap().len(),
        node.aof.status().current_size
    );

    assert_eq!(dump(&reload(&node.aof)), dump(&node.ks));
}

#[test]
fn test_cancelled_rewrite_leaves_log_untouched() {
    let _guard = FORK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let mut node = Node::new(&dir);

    node.run(&["SET", "a", "1"]);
    node.aof.flush(true).unwrap();
    let before = std::fs::read(node.aof.path()).unwrap();

    let pid = node.aof.start_background_rewrite(&mut node.el, &node.ks).unwrap().as_raw();
    node.run(&["SET", "b", "2"]);
    node.aof.kill_rewrite_child(&mut node.el);

    let status = node.aof.status();
    assert!(!status.rewrite_in_progress);
    assert!(status.last_bgrewrite_ok);
    assert_eq!(status.rewrite_buffer_length, 0);
    assert!(!temp_file_name(dir.path(), pid).exists());
    assert!(!done_file_name(dir.path(), pid).exists());

    // The parent keeps appending to the original file.
    node.aof.flush(true).unwrap();
    let after = std::fs::read(node.aof.path()).unwrap();
    assert!(after.starts_with(&before));
    assert!(after.len() > before.len());
    assert_eq!(dump(&reload(&node.aof)), dump(&node.ks));
}
