//! Single-threaded readiness reactor
//!
//! One thread owns the listener, every client socket and the poller. Each
//! loop iteration waits for readiness (bounded by `poll_timeout`), accepts
//! new clients, reads and routes whatever arrived, and flushes queued
//! output. Shutdown is cooperative: a [`ShutdownHandle`] clears the running
//! flag and wakes the poller.
//!
//! A connection reads at most `read_budget` bytes per turn. One that still
//! had bytes waiting is carried over and read again on the next iteration
//! without waiting for a new readiness edge. A peer whose outbound backlog
//! would pass `max_queued_bytes` is disconnected.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::frame::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use crate::protocol::message::Message;
use crate::server::groups::GroupRegistry;
use crate::server::registry::ClientRegistry;
use crate::server::router::{Disposition, Outbox, Router};
use crate::store::FileStore;
use crate::transport::buffer::{FlushStatus, DEFAULT_READ_CAPACITY};
use crate::transport::connection::{Connection, ConnectionId, ConnectionLimits};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections; extra clients are closed on accept
    pub max_connections: usize,
    /// Upper bound on one readiness wait
    pub poll_timeout: Duration,
    /// Bytes requested per socket read
    pub read_chunk_size: usize,
    /// Bytes read from one connection per turn before its frames are routed
    pub read_budget: usize,
    /// Largest accepted frame payload
    pub max_frame_size: usize,
    /// Encoded output allowed to back up for one peer
    pub max_queued_bytes: usize,
    /// Readiness events collected per poll
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1024,
            poll_timeout: Duration::from_secs(1),
            read_chunk_size: DEFAULT_READ_CAPACITY,
            read_budget: 8 * DEFAULT_READ_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
            max_queued_bytes: 4 * (MAX_FRAME_SIZE + FRAME_HEADER_SIZE),
            events_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Reject settings the reactor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ChatError::config("max_connections must be at least 1"));
        }
        if self.read_chunk_size == 0 {
            return Err(ChatError::config("read_chunk_size must be at least 1"));
        }
        if self.read_budget < self.read_chunk_size {
            return Err(ChatError::config("read_budget must cover one read_chunk_size"));
        }
        if self.events_capacity == 0 {
            return Err(ChatError::config("events_capacity must be at least 1"));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(ChatError::config(format!(
                "max_frame_size {} exceeds the 32-bit length prefix",
                self.max_frame_size
            )));
        }
        if self.max_queued_bytes < self.max_frame_size + FRAME_HEADER_SIZE {
            return Err(ChatError::config(
                "max_queued_bytes must hold at least one full frame",
            ));
        }
        Ok(())
    }

    /// Buffer bounds handed to every accepted connection
    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            read_chunk: self.read_chunk_size,
            read_budget: self.read_budget,
            max_frame_size: self.max_frame_size,
            max_queued_bytes: self.max_queued_bytes,
        }
    }
}

/// Stops a running [`ChatServer`] from any thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the reactor to exit after its current iteration
    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.waker
            .wake()
            .map_err(|e| ChatError::internal(format!("Failed to wake reactor: {}", e)))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// What a readiness token refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Listener,
    Waker,
    Client(ConnectionId),
}

impl From<Token> for Slot {
    fn from(token: Token) -> Self {
        match token {
            LISTENER => Slot::Listener,
            WAKER => Slot::Waker,
            token => Slot::Client(token.into()),
        }
    }
}

/// Readiness copied out of an event so the event list can be reused
#[derive(Debug, Clone, Copy)]
struct Readiness {
    slot: Slot,
    readable: bool,
    writable: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            slot: event.token().into(),
            // Hang-ups and errors surface through the next read
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

/// Outbox over the reactor's connection table.
///
/// Delivery only queues; connections that received something are recorded
/// so the reactor can flush them once routing is done. Connections whose
/// backlog is full are recorded in `overflowed` and refuse further output.
struct ConnectionOutbox<'a> {
    connections: &'a mut HashMap<ConnectionId, Connection>,
    touched: &'a mut Vec<ConnectionId>,
    overflowed: &'a mut Vec<ConnectionId>,
}

impl Outbox for ConnectionOutbox<'_> {
    fn is_open(&self, id: ConnectionId) -> bool {
        self.connections.get(&id).is_some_and(Connection::is_open)
    }

    fn deliver(&mut self, id: ConnectionId, message: &Message) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        if !conn.is_open() || self.overflowed.contains(&id) {
            return false;
        }
        match conn.enqueue(message) {
            Ok(()) => {
                if !self.touched.contains(&id) {
                    self.touched.push(id);
                }
                true
            }
            Err(e @ ChatError::Connection(_)) => {
                warn!("Dropping slow peer {}: {}", id, e);
                self.overflowed.push(id);
                false
            }
            Err(e) => {
                warn!("Failed to queue {:?} for {}: {}", message.kind, id, e);
                false
            }
        }
    }
}

/// Re-arm `conn` with the poller if its wanted interest changed
fn sync_interest(registry: &Registry, conn: &mut Connection) -> io::Result<()> {
    let desired = conn.desired_interest();
    if desired != conn.interest() {
        let token = conn.token();
        registry.reregister(conn.stream_mut(), token, desired)?;
        conn.set_interest(desired);
    }
    Ok(())
}

/// Chat server driven by one readiness loop
pub struct ChatServer {
    config: ServerConfig,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<ConnectionId, Connection>,
    /// Connections that stopped reading at their budget with bytes left
    carried_reads: Vec<ConnectionId>,
    next_id: usize,
    router: Router,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ChatServer {
    /// Bind the listener and set up the poller
    pub fn bind(config: ServerConfig, store: Arc<dyn FileStore>) -> Result<Self> {
        config.validate()?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.bind_addr).map_err(|e| {
            ChatError::network(format!("Failed to bind {}: {}", config.bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let router = Router::new(
            Arc::new(ClientRegistry::new()),
            Arc::new(GroupRegistry::new()),
            store,
        );

        Ok(Self {
            events: Events::with_capacity(config.events_capacity),
            config,
            poll,
            listener,
            local_addr,
            connections: HashMap::new(),
            carried_reads: Vec::new(),
            next_id: FIRST_CONNECTION,
            router,
            running: Arc::new(AtomicBool::new(true)),
            waker,
        })
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until stopped.
    ///
    /// Only a failing poll ends the loop with an error. Every connection is
    /// closed before returning.
    pub fn run(&mut self) -> Result<()> {
        info!("Chat server listening on {}", self.local_addr);

        let mut ready: Vec<Readiness> = Vec::with_capacity(self.config.events_capacity);
        let result = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }

            // Pending input must not wait for a readiness edge that never comes
            let timeout = if self.carried_reads.is_empty() {
                self.config.poll_timeout
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Poll failed: {}", e);
                break Err(ChatError::network(format!("Poll failed: {}", e)));
            }

            ready.clear();
            ready.extend(self.events.iter().map(Readiness::from));
            let carried = std::mem::take(&mut self.carried_reads);

            for readiness in ready.drain(..) {
                match readiness.slot {
                    Slot::Listener => self.accept_pending(),
                    Slot::Waker => debug!("Reactor woken"),
                    Slot::Client(id) => {
                        if readiness.writable {
                            self.flush_connection(id);
                        }
                        if readiness.readable && !carried.contains(&id) {
                            self.read_connection(id);
                        }
                    }
                }
            }
            for id in carried {
                self.read_connection(id);
            }
        };

        self.close_all();
        info!("Chat server stopped");
        result
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.connections.len() >= self.config.max_connections {
            warn!(
                "Connection limit ({}) reached, refusing {}",
                self.config.max_connections, peer
            );
            return;
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, id.into(), Interest::READABLE)
        {
            warn!("Failed to register {}: {}", peer, e);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, e);
        }

        let conn = Connection::new(id, stream, peer, self.config.connection_limits());
        self.connections.insert(id, conn);
        info!("Accepted {} from {}", id, peer);
    }

    fn read_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.is_open() {
            return;
        }

        let outcome = match conn.read_available() {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Read failed on {}: {}", id, e);
                self.teardown(id);
                return;
            }
        };

        // Messages decoded ahead of a fatal frame are still routed
        let mut messages = Vec::new();
        let fatal = conn.decode_messages(&mut messages).err();

        let mut touched = Vec::new();
        let mut overflowed = Vec::new();
        let mut disposition = Disposition::Continue;
        for message in messages {
            let bound = match self.connections.get(&id) {
                Some(conn) => conn.name().map(str::to_owned),
                None => break,
            };
            let mut outbox = ConnectionOutbox {
                connections: &mut self.connections,
                touched: &mut touched,
                overflowed: &mut overflowed,
            };
            disposition = self.router.route(id, bound.as_deref(), message, &mut outbox);

            match &disposition {
                Disposition::Continue => {}
                Disposition::Authenticated(name) => {
                    if let Some(conn) = self.connections.get_mut(&id) {
                        conn.bind_name(name.clone());
                    }
                }
                Disposition::CloseAfterFlush => {
                    if let Some(conn) = self.connections.get_mut(&id) {
                        conn.begin_close();
                    }
                    break;
                }
                Disposition::Teardown => break,
            }
        }

        if disposition == Disposition::Teardown {
            self.teardown(id);
        } else if let Some(e) = fatal {
            warn!("Closing {}: {}", id, e);
            self.teardown(id);
        } else if outcome.eof {
            debug!("{} closed by peer", id);
            self.teardown(id);
        } else {
            if !outcome.drained && !self.carried_reads.contains(&id) {
                self.carried_reads.push(id);
            }
            if !touched.contains(&id) {
                // Re-arm the origin even if nothing was queued for it
                touched.push(id);
            }
        }

        for slow in overflowed {
            self.teardown(slow);
        }
        for target in touched {
            self.flush_connection(target);
        }
    }

    /// Write what is queued for `id` and re-arm it, tearing it down when a
    /// closing connection has drained or the socket failed.
    fn flush_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        let status = if conn.has_pending_output() {
            conn.flush()
        } else {
            Ok(FlushStatus::Drained)
        };

        match status {
            Ok(FlushStatus::Drained) if !conn.is_open() => {
                debug!("{} drained, closing", id);
                self.teardown(id);
            }
            Ok(_) => {
                if let Err(e) = sync_interest(self.poll.registry(), conn) {
                    warn!("Failed to re-arm {}: {}", id, e);
                    self.teardown(id);
                }
            }
            Err(e) => {
                debug!("Write failed on {}: {}", id, e);
                self.teardown(id);
            }
        }
    }

    /// Drop a connection and release its name and memberships
    fn teardown(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        self.carried_reads.retain(|carried| *carried != id);

        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!("Deregister failed for {}: {}", id, e);
        }

        match conn.name() {
            Some(name) => {
                self.router.disconnect(name);
                info!("{} ({}) disconnected after {:?}", name, id, conn.uptime());
            }
            None => info!("{} from {} disconnected", id, conn.peer()),
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.teardown(id);
        }
    }
}

impl std::fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.len())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}
