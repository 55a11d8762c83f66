//! Background I/O Jobs
//!
//! Slow system calls that must not stall the event loop run here: fsync of
//! the append-only log, closing a file whose last link was just renamed
//! over (the close performs the unlink), and dropping large values.
//!
//! ## Design
//!
//! A small multi-threaded `tokio` runtime executes every job on
//! `spawn_blocking`. The loop thread never awaits anything: it submits jobs
//! through a [`BioHandle`] and reads per-kind pending counters, which the
//! everysec flush policy uses to tell whether a previous fsync is still
//! running.

use std::any::Any;
use std::fs::File;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{trace, warn};

/// Job categories with separate pending counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioKind {
    Fsync,
    CloseFile,
    LazyFree,
}

impl BioKind {
    fn index(self) -> usize {
        match self {
            BioKind::Fsync => 0,
            BioKind::CloseFile => 1,
            BioKind::LazyFree => 2,
        }
    }
}

/// A unit of background work.
pub enum BioJob {
    /// `fdatasync` the file. The descriptor is a duplicate owned by the job.
    Fsync(File),
    /// Close the file.
    CloseFile(File),
    /// Drop the value.
    LazyFree(Box<dyn Any + Send>),
}

impl BioJob {
    pub fn kind(&self) -> BioKind {
        match self {
            BioJob::Fsync(_) => BioKind::Fsync,
            BioJob::CloseFile(_) => BioKind::CloseFile,
            BioJob::LazyFree(_) => BioKind::LazyFree,
        }
    }

    fn run(self, shared: &Shared) {
        match self {
            BioJob::Fsync(file) => {
                if let Err(e) = file.sync_data() {
                    shared.fsync_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Background fsync failed");
                }
            }
            BioJob::CloseFile(file) => drop(file),
            BioJob::LazyFree(value) => drop(value),
        }
    }
}

#[derive(Default)]
struct Shared {
    pending: [AtomicUsize; 3],
    completed: AtomicU64,
    fsync_errors: AtomicU64,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl Shared {
    fn total_pending(&self) -> usize {
        self.pending.iter().map(|p| p.load(Ordering::Acquire)).sum()
    }
}

/// Owner of the background runtime.
pub struct BackgroundJobs {
    runtime: Runtime,
    shared: Arc<Shared>,
}

impl BackgroundJobs {
    /// Starts the pool with `threads` workers for blocking jobs.
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("bio")
            .build()?;
        Ok(Self {
            runtime,
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn handle(&self) -> BioHandle {
        BioHandle {
            handle: self.runtime.handle().clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Waits for outstanding jobs, then stops the runtime.
    pub fn shutdown(self, timeout: Duration) {
        self.handle().wait_idle(timeout);
        self.runtime.shutdown_timeout(timeout);
    }
}

/// Cloneable job submitter.
#[derive(Clone)]
pub struct BioHandle {
    handle: Handle,
    shared: Arc<Shared>,
}

impl BioHandle {
    pub fn submit(&self, job: BioJob) {
        let kind = job.kind();
        self.shared.pending[kind.index()].fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&self.shared);

        self.handle.spawn_blocking(move || {
            job.run(&shared);
            shared.pending[kind.index()].fetch_sub(1, Ordering::AcqRel);
            shared.completed.fetch_add(1, Ordering::Relaxed);
            trace!(?kind, "Background job done");

            let _lock = shared.idle_lock.lock().unwrap_or_else(|e| e.into_inner());
            shared.idle.notify_all();
        });
    }

    /// Submits an fsync of a duplicate of `file`.
    pub fn fsync(&self, file: &File) -> std::io::Result<()> {
        self.submit(BioJob::Fsync(file.try_clone()?));
        Ok(())
    }

    pub fn close(&self, file: File) {
        self.submit(BioJob::CloseFile(file));
    }

    pub fn lazy_free<T: Send + 'static>(&self, value: T) {
        self.submit(BioJob::LazyFree(Box::new(value)));
    }

    /// Jobs of `kind` submitted but not yet finished.
    pub fn pending(&self, kind: BioKind) -> usize {
        self.shared.pending[kind.index()].load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn fsync_errors(&self) -> u64 {
        self.shared.fsync_errors.load(Ordering::Relaxed)
    }

    /// Blocks until no job is pending or `timeout` elapses.
    ///
    /// # Returns
    ///
    /// `true` if the pool drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lock = self.shared.idle_lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.shared.total_pending() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            lock = match self.shared.idle.wait_timeout(lock, deadline - now) {
                Ok((lock, _)) => lock,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fsync_and_close_jobs_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("log")).unwrap();
        file.write_all(b"data").unwrap();

        let bio = BackgroundJobs::new(2).unwrap();
        let handle = bio.handle();
        handle.fsync(&file).unwrap();
        handle.close(file);

        assert!(handle.wait_idle(Duration::from_secs(5)));
        assert_eq!(handle.pending(BioKind::Fsync), 0);
        assert_eq!(handle.pending(BioKind::CloseFile), 0);
        assert_eq!(handle.completed(), 2);
        assert_eq!(handle.fsync_errors(), 0);
        bio.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_lazy_free_drops_value_off_thread() {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let bio = BackgroundJobs::new(1).unwrap();
        let handle = bio.handle();
        handle.lazy_free(Flag(Arc::clone(&dropped)));

        assert!(handle.wait_idle(Duration::from_secs(5)));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(handle.pending(BioKind::LazyFree), 0);
    }

    #[test]
    fn test_wait_idle_with_nothing_pending() {
        let bio = BackgroundJobs::new(1).unwrap();
        assert!(bio.handle().wait_idle(Duration::ZERO));
    }
}
