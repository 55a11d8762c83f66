//! Client Connections
//!
//! Every client is a non-blocking socket registered with the event loop.
//!
//! ## Lifecycle
//!
//! ```text
//! 1. listener READABLE ──> accept until WouldBlock
//!        │                  (descriptor beyond capacity: "-ERR max ..." and close)
//!        ▼
//! 2. client READABLE ──> read into query buffer ──> decode ──> Server::call
//!        │                                                       │
//!        │                         reply serialized into reply buffer
//!        ▼
//! 3. before_sleep ──> write replies; leftovers wait for WRITABLE
//!        │
//!        ▼
//! 4. EOF, I/O error or protocol error ──> deregister and drop the socket
//! ```
//!
//! ## Buffer Management
//!
//! TCP is a stream: one read may carry half a request or several. The
//! query buffer accumulates bytes until the decoder finds complete
//! requests.

use super::{Server, ServerError};
use crate::commands::ClientContext;
use crate::protocol::{CommandDecoder, RespValue};
use crate::reactor::{EventLoop, Interest};
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, info, warn};

/// Bytes read per `read(2)` call.
const READ_CHUNK: usize = 16 * 1024;

/// Largest query buffer before the client is dropped.
const MAX_QUERY_BUFFER: usize = 1024 * 1024 * 1024;

/// Initial query buffer capacity.
const INITIAL_BUFFER_SIZE: usize = 4096;

/// One connected client.
#[derive(Debug)]
pub(crate) struct Client {
    id: u64,
    stream: TcpStream,
    addr: SocketAddr,
    query: BytesMut,
    reply: BytesMut,
    ctx: ClientContext,
    /// Close once the reply buffer is written.
    close_after_reply: bool,
}

/// What a read left the client in.
enum ReadStatus {
    Open,
    Closed,
}

impl Client {
    fn new(id: u64, stream: TcpStream, addr: SocketAddr) -> Self {
        Self {
            id,
            stream,
            addr,
            query: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            reply: BytesMut::new(),
            ctx: ClientContext::default(),
            close_after_reply: false,
        }
    }

    /// Reads everything currently available.
    fn fill_query(&mut self) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    self.query.extend_from_slice(&chunk[..n]);
                    if self.query.len() > MAX_QUERY_BUFFER {
                        warn!(client = self.id, "Closing client that reached max query buffer length");
                        return Err(io::Error::other("max query buffer length reached"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes as much of the reply buffer as the socket takes.
    ///
    /// # Returns
    ///
    /// `true` once the buffer is empty.
    fn flush_reply(&mut self) -> io::Result<bool> {
        while !self.reply.is_empty() {
            match self.stream.write(&self.reply) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.reply.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl Server {
    /// Binds the listening socket and registers the accept handler.
    pub fn listen(&mut self, el: &mut EventLoop<Server>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_address())?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();
        el.add_file_event(fd, Interest::READABLE, |el, server: &mut Server, _, _| {
            server.accept_clients(el);
        })?;
        // The rewrite child must not keep the port open.
        self.aof.close_in_child(fd);
        info!(addr = %listener.local_addr()?, "Listening for connections");
        self.listener = Some(listener);
        Ok(())
    }

    fn accept_clients(&mut self, el: &mut EventLoop<Server>) {
        loop {
            let Some(listener) = &self.listener else {
                return;
            };
            let (stream, addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accepting client connection failed");
                    return;
                }
            };
            self.stats.connections_received += 1;
            self.register_client(el, stream, addr);
        }
    }

    fn register_client(&mut self, el: &mut EventLoop<Server>, mut stream: TcpStream, addr: SocketAddr) {
        let fd = stream.as_raw_fd();
        let full = usize::try_from(fd).map_or(true, |idx| idx >= el.capacity())
            || self.clients.len() >= self.config.maxclients;
        if full {
            self.stats.rejected_connections += 1;
            let _ = stream.write_all(b"-ERR max number of clients reached\r\n");
            warn!(%addr, "Rejecting client: max number of clients reached");
            return;
        }

        if let Err(e) = stream.set_nonblocking(true).and_then(|_| stream.set_nodelay(true)) {
            warn!(%addr, error = %e, "Can't configure client socket");
            return;
        }
        let registered = el.add_file_event(fd, Interest::READABLE, |el, server: &mut Server, fd, _| {
            server.read_from_client(el, fd);
        });
        if let Err(e) = registered {
            warn!(%addr, error = %e, "Can't register client");
            return;
        }

        let id = self.next_client_id;
        self.next_client_id += 1;
        debug!(client = id, %addr, "Accepted connection");
        self.clients.insert(fd, Client::new(id, stream, addr));
    }

    fn read_from_client(&mut self, el: &mut EventLoop<Server>, fd: RawFd) {
        let Some(client) = self.clients.get_mut(&fd) else {
            el.remove_file_event(fd, Interest::READABLE);
            return;
        };
        match client.fill_query() {
            Ok(ReadStatus::Open) => self.process_query(el, fd),
            Ok(ReadStatus::Closed) => {
                // Answer what was already received, then close.
                client.close_after_reply = true;
                self.process_query(el, fd);
            }
            Err(e) => {
                debug!(client = client.id, error = %e, "Reading from client failed");
                self.free_client(el, fd);
            }
        }
    }

    /// Executes every complete request in the client's query buffer.
    fn process_query(&mut self, el: &mut EventLoop<Server>, fd: RawFd) {
        let decoder = CommandDecoder::lenient();
        loop {
            let Some(client) = self.clients.get_mut(&fd) else {
                return;
            };
            let (argv, consumed) = match decoder.decode(&client.query) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => {
                    debug!(client = client.id, error = %e, "Protocol error from client");
                    RespValue::error(format!("ERR Protocol error: {}", e)).serialize_into(&mut client.reply);
                    client.query.clear();
                    client.close_after_reply = true;
                    break;
                }
            };
            client.query.advance(consumed);
            if argv.is_empty() {
                continue;
            }

            let mut ctx = client.ctx.clone();
            let reply = self.call(el, &mut ctx, &argv);
            if let Some(client) = self.clients.get_mut(&fd) {
                client.ctx = ctx;
                reply.serialize_into(&mut client.reply);
            }
            if el.is_stopped() {
                break;
            }
        }
        if !self.pending_writes.contains(&fd) {
            self.pending_writes.push(fd);
        }
    }

    /// Writes queued replies. Clients whose socket is full get a writable
    /// handler.
    pub(crate) fn handle_pending_writes(&mut self, el: &mut EventLoop<Server>) {
        for fd in std::mem::take(&mut self.pending_writes) {
            let Some(client) = self.clients.get_mut(&fd) else {
                continue;
            };
            match client.flush_reply() {
                Ok(true) if client.close_after_reply => self.free_client(el, fd),
                Ok(true) => {}
                Ok(false) => {
                    if el.file_interest(fd).is_writable() {
                        continue;
                    }
                    let registered = el.add_file_event(fd, Interest::WRITABLE, |el, server: &mut Server, fd, _| {
                        server.write_to_client(el, fd);
                    });
                    if registered.is_err() {
                        self.free_client(el, fd);
                    }
                }
                Err(e) => {
                    debug!(client = client.id, error = %e, "Writing to client failed");
                    self.free_client(el, fd);
                }
            }
        }
    }

    fn write_to_client(&mut self, el: &mut EventLoop<Server>, fd: RawFd) {
        let Some(client) = self.clients.get_mut(&fd) else {
            el.remove_file_event(fd, Interest::WRITABLE);
            return;
        };
        match client.flush_reply() {
            Ok(true) => {
                el.remove_file_event(fd, Interest::WRITABLE);
                if client.close_after_reply {
                    self.free_client(el, fd);
                }
            }
            Ok(false) => {}
            Err(_) => self.free_client(el, fd),
        }
    }

    pub(crate) fn free_client(&mut self, el: &mut EventLoop<Server>, fd: RawFd) {
        el.remove_file_event(fd, Interest::READABLE | Interest::WRITABLE);
        if let Some(client) = self.clients.remove(&fd) {
            debug!(client = client.id, addr = %client.addr, "Client closed connection");
        }
        self.pending_writes.retain(|&pending| pending != fd);
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.len()
    }
}
