//! Parent side of the background rewrite.
//!
//! ```text
//!  start_background_rewrite ── fork ──> child (rewrite::run_child)
//!        │
//!        ├─ before_sleep: arm_diff_writer ── WRITABLE on diff pipe
//!        │                                    └─ stream RewriteBuffer
//!        ├─ READABLE on stop pipe ── '!' ──> stop streaming, ack '!'
//!        │
//!        └─ cron: poll_rewrite_child ── exit 0 ──> append residual diff,
//!                                                  rename over the log,
//!                                                  swap descriptors
//! ```
//!
//! Whatever the outcome, the pipes are closed, the rewrite buffer is reset,
//! the temporary files are unlinked and table resizing is allowed again.

use super::pipes::{self, ParentPipes};
use super::rewrite::{done_file_name, run_child, temp_file_name, RewriteSettings};
use super::{background_fsync, Aof, AofError, AofState};
use crate::config::FsyncPolicy;
use crate::process::{self, ChildExit, Pid};
use crate::reactor::{EventLoop, Interest};
use crate::storage::Keyspace;
use nix::sys::signal::Signal;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;
use tracing::{info, warn};

/// A running rewrite child as seen from the parent.
#[derive(Debug)]
pub struct RewriteChild {
    pid: Pid,
    pipes: ParentPipes,
    started: Instant,
    /// Set once the child asked the parent to stop streaming.
    stop_sending: bool,
}

impl RewriteChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn stop_sending(&self) -> bool {
        self.stop_sending
    }
}

impl Aof {
    pub fn is_rewriting(&self) -> bool {
        self.child.is_some()
    }

    pub fn rewrite_child_pid(&self) -> Option<Pid> {
        self.child.as_ref().map(RewriteChild::pid)
    }

    /// Forks a child that rewrites the log from the current keyspace.
    ///
    /// # Errors
    ///
    /// [`AofError::AlreadyRunning`] if a child is alive, or the pipe,
    /// registration or fork failure.
    pub fn start_background_rewrite<S>(&mut self, el: &mut EventLoop<S>, ks: &Keyspace) -> Result<Pid, AofError>
    where
        S: AsMut<Aof> + 'static,
    {
        if self.child.is_some() {
            return Err(AofError::AlreadyRunning);
        }

        let (parent, child_pipes) = pipes::open().map_err(io::Error::from)?;
        let stop_fd = parent.stop_fd();
        el.add_file_event(stop_fd, Interest::READABLE, |el, state: &mut S, fd, _| {
            state.as_mut().handle_stop_request(el, fd);
        })
        .map_err(io::Error::other)?;

        let settings = RewriteSettings::from(&self.config);
        let dir = self.dir.clone();
        let close_fds = self.child_close_fds.clone();
        let snapshot = self.snapshot.as_deref();
        let started = Instant::now();

        let forked = process::fork_rewrite_child(move || {
            for fd in close_fds {
                let _ = nix::unistd::close(fd);
            }
            run_child(ks, child_pipes, &dir, &settings, snapshot)
        });
        let pid = match forked {
            Ok(pid) => pid,
            Err(e) => {
                el.remove_file_event(stop_fd, Interest::READABLE);
                warn!(error = %e, "Can't rewrite append only file in background: fork failed");
                return Err(AofError::Fork(e));
            }
        };

        info!(pid = pid.as_raw(), "Background append only file rewriting started");
        self.policy.forbid();
        self.rewrite_buf.reset();
        self.rewrite_scheduled = false;
        // The first command streamed to the child must carry its SELECT.
        self.selected_db = None;
        self.child = Some(RewriteChild {
            pid,
            pipes: parent,
            started,
            stop_sending: false,
        });
        Ok(pid)
    }

    /// Registers the diff writer if there are bytes to stream and it is
    /// not registered yet. Called before every wait of the loop.
    pub fn arm_diff_writer<S>(&mut self, el: &mut EventLoop<S>)
    where
        S: AsMut<Aof> + 'static,
    {
        let Some(child) = &self.child else {
            return;
        };
        if child.stop_sending || self.rewrite_buf.is_empty() {
            return;
        }
        let fd = child.pipes.diff_fd();
        if el.file_interest(fd).is_writable() {
            return;
        }
        let registered = el.add_file_event(fd, Interest::WRITABLE, |el, state: &mut S, fd, _| {
            state.as_mut().write_diff(el, fd);
        });
        if let Err(e) = registered {
            warn!(error = %e, "Can't register the AOF diff writer");
        }
    }

    /// Streams rewrite-buffer bytes to the child until the pipe is full.
    fn write_diff<S>(&mut self, el: &mut EventLoop<S>, fd: RawFd) {
        let Some(child) = self.child.as_mut() else {
            el.remove_file_event(fd, Interest::WRITABLE);
            return;
        };
        if !child.stop_sending {
            if let Err(e) = self.rewrite_buf.write_to(&mut child.pipes.diff_tx) {
                warn!(error = %e, "Error streaming the AOF diff to the rewrite child");
                child.stop_sending = true;
            }
        }
        if child.stop_sending || self.rewrite_buf.is_empty() {
            el.remove_file_event(fd, Interest::WRITABLE);
        }
    }

    /// The child wrote on the stop channel.
    fn handle_stop_request<S>(&mut self, el: &mut EventLoop<S>, fd: RawFd) {
        if let Some(child) = self.child.as_mut() {
            match child.pipes.read_stop() {
                Ok(true) => {
                    info!("AOF rewrite child asks to stop sending diffs");
                    child.stop_sending = true;
                    if let Err(e) = child.pipes.send_ack() {
                        warn!(error = %e, "Can't send ACK to AOF child");
                    }
                }
                Ok(false) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => warn!(error = %e, "Can't read the stop request of the AOF child"),
            }
        }
        el.remove_file_event(fd, Interest::READABLE);
        if let Some(child) = self.child.as_ref().filter(|c| c.stop_sending) {
            el.remove_file_event(child.pipes.diff_fd(), Interest::WRITABLE);
        }
    }

    /// Reaps the child if it has exited and finishes the rewrite.
    ///
    /// # Returns
    ///
    /// How the child ended, or `None` while it still runs.
    pub fn poll_rewrite_child<S>(&mut self, el: &mut EventLoop<S>) -> Result<Option<ChildExit>, AofError> {
        let Some(child) = &self.child else {
            return Ok(None);
        };
        match process::try_wait(child.pid).map_err(io::Error::from)? {
            Some(exit) => {
                self.rewrite_done(el, exit);
                Ok(Some(exit))
            }
            None => Ok(None),
        }
    }

    fn rewrite_done<S>(&mut self, el: &mut EventLoop<S>, exit: ChildExit) {
        let Some(child) = self.child.take() else {
            return;
        };
        let pid = child.pid.as_raw();
        match exit {
            ChildExit::Exited(0) => {
                if let Err(e) = self.install_rewrite(pid) {
                    warn!(error = %e, "Can't install the rewritten append only file");
                    self.last_bgrewrite_ok = false;
                }
            }
            ChildExit::Exited(code) => {
                self.last_bgrewrite_ok = false;
                warn!(code, "Background AOF rewrite terminated with error");
            }
            ChildExit::Signaled(sig) => {
                // SIGUSR1 is how the parent cancels a child on purpose.
                if sig != Signal::SIGUSR1 {
                    self.last_bgrewrite_ok = false;
                }
                warn!(signal = %sig, "Background AOF rewrite terminated by signal");
            }
        }
        self.release_child(el, child);
        if self.state == AofState::WaitRewrite {
            self.rewrite_scheduled = true;
        }
    }

    /// Appends the residual diff to the child's file and moves it over the
    /// log.
    fn install_rewrite(&mut self, pid: i32) -> Result<(), AofError> {
        let start = Instant::now();
        let done = done_file_name(&self.dir, pid);
        let mut new_file = OpenOptions::new().append(true).open(&done).map_err(|e| {
            warn!(path = %done.display(), "Unable to open the temporary AOF produced by the child");
            e
        })?;
        let residual = self.rewrite_buf.drain_into(&mut new_file)?;
        info!(bytes = residual, "Residual parent diff successfully flushed to the rewritten AOF");

        // With the log off nobody holds the old file; keep it open across
        // the rename so its unlink happens when the background pool closes
        // it.
        let unlink_holder = match self.file {
            None => File::open(&self.path).ok(),
            Some(_) => None,
        };
        fs::rename(&done, &self.path)?;

        let old_file = match self.file.take() {
            None => unlink_holder,
            Some(old) => {
                match self.config.fsync {
                    FsyncPolicy::Always => {
                        if let Err(e) = new_file.sync_data() {
                            warn!(error = %e, "Fsync of the rewritten append only file failed");
                        }
                    }
                    FsyncPolicy::EverySec => background_fsync(self.bio.as_ref(), &new_file),
                    FsyncPolicy::No => {}
                }
                self.current_size = new_file.metadata()?.len();
                self.rewrite_base_size = self.current_size;
                self.file = Some(new_file);
                self.selected_db = None;
                // Already part of the rewritten file through the rewrite
                // buffer.
                self.buf.clear();
                Some(old)
            }
        };

        self.last_bgrewrite_ok = true;
        info!("Background AOF rewrite finished successfully");
        if self.state == AofState::WaitRewrite {
            self.state = AofState::On;
        }
        if let Some(old) = old_file {
            match &self.bio {
                Some(bio) => bio.close(old),
                None => drop(old),
            }
        }
        info!(elapsed_us = start.elapsed().as_micros() as u64, "Background AOF rewrite done handler finished");
        Ok(())
    }

    /// Cancels a running child with SIGUSR1 and cleans up after it.
    pub fn kill_rewrite_child<S>(&mut self, el: &mut EventLoop<S>) {
        let Some(child) = self.child.take() else {
            return;
        };
        info!(pid = child.pid.as_raw(), "Killing running AOF rewrite child");
        if process::kill(child.pid, Signal::SIGUSR1).is_ok() {
            if let Err(e) = process::wait_blocking(child.pid) {
                warn!(error = %e, "Can't reap the killed AOF rewrite child");
            }
        }
        self.release_child(el, child);
    }

    fn release_child<S>(&mut self, el: &mut EventLoop<S>, child: RewriteChild) {
        el.remove_file_event(child.pipes.stop_fd(), Interest::READABLE);
        el.remove_file_event(child.pipes.diff_fd(), Interest::WRITABLE);
        let pid = child.pid.as_raw();
        self.last_rewrite_duration = Some(child.started.elapsed());
        drop(child);

        self.rewrite_buf.reset();
        let _ = fs::remove_file(temp_file_name(&self.dir, pid));
        let _ = fs::remove_file(done_file_name(&self.dir, pid));
        self.policy.allow();
    }
}
