//! Server
//!
//! Ties the keyspace, the command executor and the append-only log to one
//! single-threaded event loop.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────── EventLoop<Server> ─────────────────────────────┐
//! │                                                                             │
//! │  listener READABLE ──> accept ──> client READABLE ──> decode ──> call()     │
//! │                                                                  │          │
//! │                                      Keyspace <── CommandExecutor┤          │
//! │                                                                  ▼          │
//! │                                                            Aof::feed        │
//! │                                                                             │
//! │  before_sleep: Aof::flush(false) ─> arm diff writer ─> write client replies │
//! │                                                                             │
//! │  cron (1000/hz ms): active expiry, rehash, reap rewrite child,              │
//! │                     scheduled/automatic rewrites, flush retries, signals    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies are written from the before-sleep hook, after the log was
//! flushed, so a client never sees an acknowledgment for a write that is
//! not yet in the file.

mod admin;
mod connection;
mod cron;

use crate::aof::{load_file, Aof, AofError, LoadOptions, LoadReport, LoadSink};
use crate::bio::BackgroundJobs;
use crate::commands::{lookup_command, ClientContext, CommandExecutor};
use crate::config::ServerConfig;
use crate::dict::ResizePolicy;
use crate::process;
use crate::protocol::RespValue;
use crate::reactor::{EventLoop, Interest, ProcessFlags, ReactorError};
use crate::storage::{ExpiryConfig, Keyspace};
use bytes::Bytes;
use connection::Client;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Threads of the background job pool.
const BIO_THREADS: usize = 2;

/// How long shutdown waits for queued fsync and close jobs.
const BIO_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Aof(#[from] AofError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error("can't install signal handlers: {0}")]
    Signal(#[from] nix::Error),
}

/// Counters reported by `INFO stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub connections_received: u64,
    pub rejected_connections: u64,
    pub commands_processed: u64,
}

/// State shared by every callback of the loop.
pub struct Server {
    config: ServerConfig,
    keyspace: Keyspace,
    executor: CommandExecutor,
    aof: Aof,
    bio: Option<BackgroundJobs>,
    listener: Option<TcpListener>,
    clients: HashMap<RawFd, Client>,
    next_client_id: u64,
    /// Clients with reply bytes waiting for the before-sleep hook.
    pending_writes: Vec<RawFd>,
    expiry: ExpiryConfig,
    stats: ServerStats,
    started: Instant,
    /// Last cron second in which a failed write was retried.
    last_write_retry_secs: u64,
    /// Error that stopped the loop.
    fatal: Option<AofError>,
}

impl Server {
    /// Creates the server and its background job pool. Nothing is bound
    /// or loaded yet.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let bio = BackgroundJobs::new(BIO_THREADS)?;
        let policy = ResizePolicy::default();
        let keyspace = Keyspace::with_policy(config.databases, policy.clone());
        let executor = CommandExecutor::new(Some(bio.handle()));
        let aof = Aof::new(config.aof.clone(), config.dir.clone(), policy).with_bio(bio.handle());

        Ok(Self {
            config,
            keyspace,
            executor,
            aof,
            bio: Some(bio),
            listener: None,
            clients: HashMap::new(),
            next_client_id: 1,
            pending_writes: Vec::new(),
            expiry: ExpiryConfig::default(),
            stats: ServerStats::default(),
            started: Instant::now(),
            last_write_retry_secs: 0,
            fatal: None,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn aof(&self) -> &Aof {
        &self.aof
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Stops the loop because of an unrecoverable error.
    fn fail(&mut self, el: &mut EventLoop<Server>, err: AofError) {
        error!(error = %err, "Fatal error, stopping the server");
        self.fatal = Some(err);
        el.stop();
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Installs the before-sleep hook and the cron timer.
    pub fn install_hooks(&mut self, el: &mut EventLoop<Server>) {
        el.set_before_sleep(|el, server: &mut Server| server.before_sleep(el));
        let period = self.config.cron_period_ms();
        el.add_timer(period, move |el, server: &mut Server, _| server.cron(el, period));
    }

    /// Opens the log and replays it when the log is enabled.
    ///
    /// Clients connecting meanwhile are served `-LOADING` errors.
    pub fn load_data(&mut self, el: &mut EventLoop<Server>) -> Result<Option<LoadReport>, ServerError> {
        if !self.config.aof.enabled {
            return Ok(None);
        }
        self.aof.open()?;

        let start = Instant::now();
        let path = self.aof.path().to_path_buf();
        let options = LoadOptions {
            load_truncated: self.config.aof.load_truncated,
            snapshot: None,
        };
        self.keyspace.set_loading(true);
        let mut replay = Replay {
            el,
            server: self,
            ctx: ClientContext::default(),
        };
        let loaded = load_file(&path, options, &mut replay);
        self.keyspace.set_loading(false);
        let report = loaded?;

        self.aof.reload_size()?;
        info!(
            commands = report.commands,
            bytes = report.valid_bytes,
            seconds = start.elapsed().as_secs_f64(),
            "DB loaded from append only file"
        );
        Ok(Some(report))
    }

    /// Final flush, fsync and cleanup once the loop returned.
    ///
    /// # Returns
    ///
    /// The error that stopped the loop, if any.
    pub fn shutdown(&mut self, el: &mut EventLoop<Server>) -> Result<(), ServerError> {
        info!("User requested shutdown...");
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            self.free_client(el, fd);
        }
        if let Some(listener) = self.listener.take() {
            el.remove_file_event(listener.as_raw_fd(), Interest::READABLE);
        }

        let result = match self.fatal.take() {
            Some(err) => {
                self.aof.kill_rewrite_child(el);
                Err(err.into())
            }
            None => self.aof.shutdown(el).map_err(ServerError::from),
        };
        if let Some(bio) = self.bio.take() {
            bio.shutdown(BIO_DRAIN_TIMEOUT);
        }
        if result.is_ok() {
            info!("EmberKV is now ready to exit, bye bye...");
        }
        result
    }

    // ========================================================================
    // Command execution
    // ========================================================================

    /// Runs one request and logs it when it changed the keyspace.
    fn call(&mut self, el: &mut EventLoop<Server>, ctx: &mut ClientContext, argv: &[Bytes]) -> RespValue {
        self.stats.commands_processed += 1;
        let spec = argv.first().and_then(|name| lookup_command(name));

        if self.keyspace.is_loading() && spec.map_or(true, |s| s.name != "INFO") {
            return RespValue::error("LOADING EmberKV is loading the dataset in memory");
        }
        if let Some(spec) = spec.filter(|s| s.is_admin()) {
            if !spec.arity_ok(argv.len()) {
                return RespValue::wrong_arity(spec.name);
            }
            return self.admin(el, spec.name, &argv[1..]);
        }
        if spec.is_some_and(|s| s.is_write()) && self.aof.writes_blocked() {
            return RespValue::error(
                "MISCONF Errors writing to the AOF file: write commands are disabled until the log can be written again",
            );
        }

        let out = self.executor.execute(&mut self.keyspace, ctx, argv);
        self.propagate_expired();
        if out.dirty > 0 {
            let logged = out.propagate_as.as_deref().unwrap_or(argv);
            self.aof.feed(ctx.db, logged);
        }
        out.reply
    }

    /// Logs keys removed by expiry as `DEL`.
    fn propagate_expired(&mut self) {
        for (db, key) in self.keyspace.take_expired() {
            self.aof.feed(db, &[Bytes::from_static(b"DEL"), key]);
        }
    }

    fn before_sleep(&mut self, el: &mut EventLoop<Server>) {
        if let Err(e) = self.aof.flush(false) {
            self.fail(el, e);
            return;
        }
        self.aof.arm_diff_writer(el);
        self.handle_pending_writes(el);
    }
}

impl AsMut<Aof> for Server {
    fn as_mut(&mut self) -> &mut Aof {
        &mut self.aof
    }
}

/// Feeds replayed commands to the executor and keeps the loop responsive
/// during a long load.
struct Replay<'a> {
    el: &'a mut EventLoop<Server>,
    server: &'a mut Server,
    ctx: ClientContext,
}

impl LoadSink for Replay<'_> {
    fn apply(&mut self, argv: Vec<Bytes>) -> Result<(), AofError> {
        let known = argv
            .first()
            .and_then(|name| lookup_command(name))
            .is_some_and(|spec| !spec.is_admin());
        if !known {
            let name = argv.first().map(|n| String::from_utf8_lossy(n).into_owned()).unwrap_or_default();
            return Err(AofError::UnknownCommand { offset: 0, name });
        }
        let out = self.server.executor.execute(&mut self.server.keyspace, &mut self.ctx, &argv);
        if out.reply.is_error() {
            warn!(command = %String::from_utf8_lossy(&argv[0]), "Command from the append only file failed");
        }
        Ok(())
    }

    fn progress(&mut self, _offset: u64) {
        let served = self
            .el
            .process_events(self.server, ProcessFlags::FILE_EVENTS | ProcessFlags::DONT_WAIT);
        if let Err(e) = served {
            warn!(error = %e, "Can't serve clients while loading");
        }
        self.server.handle_pending_writes(self.el);
    }
}

/// Runs a server until SHUTDOWN, a signal or a fatal error.
///
/// # Example
///
/// ```ignore
/// use emberkv::config::ServerConfig;
///
/// let mut config = ServerConfig::default();
/// config.set("appendonly", "yes")?;
/// emberkv::server::run(config)?;
/// ```
pub fn run(config: ServerConfig) -> Result<(), ServerError> {
    let mut el = EventLoop::new(config.setsize());
    let mut server = Server::new(config)?;
    process::install_shutdown_handlers()?;

    server.listen(&mut el)?;
    if let Err(e) = server.load_data(&mut el) {
        error!(error = %e, "Can't load the append only file");
        let _ = server.shutdown(&mut el);
        return Err(e);
    }
    server.install_hooks(&mut el);
    info!(backend = el.backend_name(), "Ready to accept connections");

    if let Err(e) = el.run(&mut server) {
        error!(error = %e, "Event loop failed");
        let _ = server.shutdown(&mut el);
        return Err(e.into());
    }
    server.shutdown(&mut el)
}
