//! Child processes: fork, reap, signal.
//!
//! The rewrite child is created with a plain `fork(2)`, so it starts with a
//! copy-on-write image of the parent's memory. It never returns into the
//! parent's code: the child function's return value becomes its exit status
//! through `_exit(2)`, which skips destructors and atexit handlers that
//! would otherwise flush or free state the parent still owns.

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

pub use nix::unistd::Pid;

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
}

impl ChildExit {
    pub fn success(self) -> bool {
        matches!(self, ChildExit::Exited(0))
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "exited with status {}", code),
            ChildExit::Signaled(sig) => write!(f, "terminated by {}", sig),
        }
    }
}

/// Forks and runs `body` in the new process.
///
/// # Returns
///
/// The child's pid, in the parent. In the child, `body` runs and the
/// process exits with its return value.
pub fn fork_rewrite_child<F>(body: F) -> Result<Pid, Errno>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the parent is single-threaded apart from the background pool,
    // and the child only performs file I/O before calling `_exit`.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let code = body();
            // SAFETY: terminates the child without unwinding or running
            // the parent's destructors.
            unsafe { libc::_exit(code) }
        }
    }
}

/// Reaps `pid` if it has terminated.
///
/// # Returns
///
/// `Ok(None)` while the child is still running.
pub fn try_wait(pid: Pid) -> Result<Option<ChildExit>, Errno> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG))? {
        WaitStatus::Exited(_, code) => Ok(Some(ChildExit::Exited(code))),
        WaitStatus::Signaled(_, sig, _) => Ok(Some(ChildExit::Signaled(sig))),
        _ => Ok(None),
    }
}

/// Blocks until `pid` terminates.
pub fn wait_blocking(pid: Pid) -> Result<ChildExit, Errno> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ChildExit::Exited(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ChildExit::Signaled(sig)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

pub fn kill(pid: Pid, sig: Signal) -> Result<(), Errno> {
    signal::kill(pid, sig)
}

/// Pid of the calling process.
pub fn current_pid() -> Pid {
    nix::unistd::getpid()
}

// ============================================================================
// Shutdown signals
// ============================================================================

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Makes SIGINT and SIGTERM set a flag instead of terminating the process.
/// The server cron polls it with [`shutdown_requested`].
pub fn install_shutdown_handlers() -> Result<(), Errno> {
    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores into an atomic.
        unsafe { signal::sigaction(sig, &action) }?;
    }
    Ok(())
}

/// Whether SIGINT or SIGTERM arrived since the last call.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fork_and_reap_exit_code() {
        let pid = fork_rewrite_child(|| 7).unwrap();
        assert_eq!(wait_blocking(pid).unwrap(), ChildExit::Exited(7));
    }

    #[test]
    fn test_try_wait_then_kill() {
        let pid = fork_rewrite_child(|| {
            std::thread::sleep(Duration::from_secs(30));
            0
        })
        .unwrap();

        assert_eq!(try_wait(pid).unwrap(), None);
        kill(pid, Signal::SIGUSR1).unwrap();

        let exit = wait_blocking(pid).unwrap();
        assert_eq!(exit, ChildExit::Signaled(Signal::SIGUSR1));
        assert!(!exit.success());
    }

    #[test]
    fn test_install_shutdown_handlers() {
        install_shutdown_handlers().unwrap();
        install_shutdown_handlers().unwrap();
    }

    #[test]
    fn test_child_exit_display() {
        assert_eq!(ChildExit::Exited(1).to_string(), "exited with status 1");
        assert!(ChildExit::Exited(0).success());
    }
}
