//! The periodic server timer.
//!
//! Runs every `1000 / hz` milliseconds:
//!
//! 1. shutdown signals
//! 2. active expiry, with `DEL` propagation
//! 3. table shrinking and incremental rehashing, only without a rewrite
//!    child (resizing would copy pages the child shares)
//! 4. reaping the rewrite child
//! 5. scheduled and automatic rewrites
//! 6. flush retries

use super::Server;
use crate::process;
use crate::reactor::{EventLoop, TimerAction};
use std::time::Duration;
use tracing::{info, warn};

/// Time budget of one incremental rehash burst.
const REHASH_BUDGET: Duration = Duration::from_millis(1);

impl Server {
    pub(crate) fn cron(&mut self, el: &mut EventLoop<Server>, period_ms: u64) -> TimerAction {
        if process::shutdown_requested() {
            info!("Received SIGINT or SIGTERM, scheduling shutdown...");
            el.stop();
            return TimerAction::Remove;
        }

        if !self.keyspace.is_loading() {
            let budget = self.expiry.budget(self.config.hz);
            self.keyspace.active_expire_cycle(&self.expiry, budget);
            self.propagate_expired();
        }

        if !self.aof.is_rewriting() {
            self.databases_cron();
        }

        if let Err(e) = self.aof.poll_rewrite_child(el) {
            warn!(error = %e, "Can't check the AOF rewrite child");
        }

        if !self.aof.is_rewriting() && self.aof.rewrite_scheduled() {
            self.start_rewrite(el);
        }
        if self.aof.should_auto_rewrite() {
            let status = self.aof.status();
            let base = status.rewrite_base_size.max(1);
            let growth = status.current_size.saturating_sub(base) * 100 / base;
            info!(growth, "Starting automatic rewriting of AOF on growth");
            self.start_rewrite(el);
        }

        self.retry_flush(el);
        TimerAction::Reschedule(period_ms)
    }

    fn databases_cron(&mut self) {
        for db in 0..self.keyspace.db_count() {
            self.keyspace.shrink_if_sparse(db);
        }
        if self.config.activerehashing {
            for db in 0..self.keyspace.db_count() {
                if self.keyspace.incremental_rehash(db, REHASH_BUDGET) {
                    // One database per run keeps the cron short.
                    break;
                }
            }
        }
    }

    fn start_rewrite(&mut self, el: &mut EventLoop<Server>) {
        if let Err(e) = self.aof.start_background_rewrite(el, &self.keyspace) {
            warn!(error = %e, "Can't start the scheduled AOF rewrite");
        }
    }

    /// Retries a postponed flush on every run, and a failed write once per
    /// second.
    fn retry_flush(&mut self, el: &mut EventLoop<Server>) {
        let retry = if self.aof.flush_postponed() {
            true
        } else if self.aof.last_write_error().is_some() {
            let now_secs = el.now_ms() / 1000;
            let due = now_secs != self.last_write_retry_secs;
            self.last_write_retry_secs = now_secs;
            due
        } else {
            false
        };
        if retry {
            if let Err(e) = self.aof.flush(false) {
                self.fail(el, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ClientContext;
    use crate::config::ServerConfig;
    use bytes::Bytes;

    fn make_command(args: &[&str]) -> Vec<Bytes> {
        args.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
    }

    #[test]
    fn test_cron_expires_and_propagates_del() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.dir = dir.path().to_path_buf();
        config.aof.enabled = true;
        let mut el = EventLoop::new(config.setsize());
        let mut server = Server::new(config).unwrap();
        server.load_data(&mut el).unwrap();

        let mut ctx = ClientContext::default();
        server.call(&mut el, &mut ctx, &make_command(&["SET", "k", "v", "PX", "1"]));
        std::thread::sleep(Duration::from_millis(5));

        let action = server.cron(&mut el, 100);
        assert_eq!(action, TimerAction::Reschedule(100));
        assert_eq!(server.keyspace.len(), 0);

        server.aof.flush(true).unwrap();
        let text = String::from_utf8(std::fs::read(server.aof.path()).unwrap()).unwrap();
        assert!(text.ends_with("*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n"));
    }
}
