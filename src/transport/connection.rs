//! Per-socket connection state
//!
//! A `Connection` owns one non-blocking TCP stream together with its inbound
//! accumulator, its frame decoder and its outbound frame queue. The reactor
//! drives it; the router only ever reaches it through the reactor's outbox.

use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::error::{ChatError, Result};
use crate::protocol::codec::{self, MessageCodec};
use crate::protocol::frame::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use crate::protocol::message::Message;
use crate::transport::buffer::{FlushStatus, ReadBuffer, WriteQueue, DEFAULT_READ_CAPACITY};

/// Identifier of an accepted connection, doubling as its poll token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl From<Token> for ConnectionId {
    fn from(token: Token) -> Self {
        ConnectionId(token.0)
    }
}

impl From<ConnectionId> for Token {
    fn from(id: ConnectionId) -> Self {
        Token(id.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection as seen by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, no name bound yet
    Unauthenticated,
    /// Bound to a display name
    Authenticated,
    /// Draining its last replies before it is torn down
    Closing,
}

/// Per-connection buffer bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Bytes requested per socket read
    pub read_chunk: usize,
    /// Bytes read per readiness event before decoding
    pub read_budget: usize,
    /// Largest accepted frame payload
    pub max_frame_size: usize,
    /// Encoded bytes that may wait for a slow peer
    pub max_queued_bytes: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_READ_CAPACITY,
            read_budget: 8 * DEFAULT_READ_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
            max_queued_bytes: 4 * (MAX_FRAME_SIZE + FRAME_HEADER_SIZE),
        }
    }
}

/// What one call to [`Connection::read_available`] produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Bytes appended to the inbound buffer
    pub bytes: usize,
    /// The peer closed its write half
    pub eof: bool,
    /// The socket reported `WouldBlock`; false means the budget ran out
    /// first and more bytes may be waiting
    pub drained: bool,
}

/// One accepted client socket
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnectionState,
    name: Option<String>,
    inbound: ReadBuffer,
    codec: MessageCodec,
    outbound: WriteQueue,
    interest: Interest,
    limits: ConnectionLimits,
    created_at: Instant,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            id,
            stream,
            peer,
            state: ConnectionState::Unauthenticated,
            name: None,
            inbound: ReadBuffer::with_capacity(limits.read_chunk),
            codec: MessageCodec::new(limits.max_frame_size),
            outbound: WriteQueue::new(),
            interest: Interest::READABLE,
            limits,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn token(&self) -> Token {
        self.id.into()
    }

    /// Get the remote address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Display name, once logged in
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection still accepts new traffic
    pub fn is_open(&self) -> bool {
        self.state != ConnectionState::Closing
    }

    /// Record a successful login
    pub fn bind_name(&mut self, name: String) {
        self.name = Some(name);
        self.state = ConnectionState::Authenticated;
    }

    /// Stop reading and tear down once queued replies are written
    pub fn begin_close(&mut self) {
        self.state = ConnectionState::Closing;
    }

    /// Get connection uptime
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Interest currently registered with the poller
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Interest this connection should have given its queue and state
    pub fn desired_interest(&self) -> Interest {
        match (self.state, self.outbound.is_empty()) {
            (ConnectionState::Closing, _) => Interest::WRITABLE,
            (_, true) => Interest::READABLE,
            (_, false) => Interest::READABLE | Interest::WRITABLE,
        }
    }

    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    /// Read what the socket has, up to the read budget.
    ///
    /// Stops at `WouldBlock`, end of stream or once `read_budget` bytes have
    /// been read, whichever comes first. Bytes read before an end of stream
    /// are kept so they can still be decoded.
    pub fn read_available(&mut self) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        while outcome.bytes < self.limits.read_budget {
            let remaining = self.limits.read_budget - outcome.bytes;
            let chunk = self.limits.read_chunk.min(remaining);
            match self.inbound.fill_from(&mut self.stream, chunk) {
                Ok(0) => {
                    outcome.eof = true;
                    return Ok(outcome);
                }
                Ok(n) => outcome.bytes += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    outcome.drained = true;
                    return Ok(outcome);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Decode every complete message buffered so far
    pub fn decode_messages(&mut self, out: &mut Vec<Message>) -> Result<usize> {
        self.codec.decode_all(&mut self.inbound, out)
    }

    /// Encode and queue a message
    pub fn enqueue(&mut self, message: &Message) -> Result<()> {
        let frame = codec::encode(message)?;
        self.enqueue_frame(frame)
    }

    /// Queue an already encoded frame.
    ///
    /// Fails with a `Connection` error, queueing nothing, when the frame
    /// would push the backlog past `max_queued_bytes`.
    pub fn enqueue_frame(&mut self, frame: Bytes) -> Result<()> {
        let queued = self.outbound.queued_bytes();
        if queued + frame.len() > self.limits.max_queued_bytes {
            return Err(ChatError::connection(format!(
                "Outbound queue full: {} bytes pending, {} more refused",
                queued,
                frame.len()
            )));
        }
        self.outbound.push(frame);
        Ok(())
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Write queued frames until the socket pushes back or the queue empties
    pub fn flush(&mut self) -> io::Result<FlushStatus> {
        let status = self.outbound.flush_to(&mut self.stream)?;
        if status == FlushStatus::Drained {
            self.stream.flush()?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn connected_pair() -> (Connection, std::net::TcpStream) {
        let limits = ConnectionLimits {
            read_chunk: 64,
            ..ConnectionLimits::default()
        };
        connected_pair_with(limits)
    }

    fn connected_pair_with(limits: ConnectionLimits) -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        let stream = TcpStream::from_std(server_side);
        (Connection::new(ConnectionId(5), stream, peer, limits), client)
    }

    /// Flush until the queue drains, reading the peer side as needed
    fn drain_into(conn: &mut Connection, client: &mut std::net::TcpStream, expect: usize) {
        let mut received = 0;
        let mut buf = vec![0u8; 64 * 1024];
        for _ in 0..10_000 {
            let status = conn.flush().unwrap();
            if status == FlushStatus::Drained && received == expect {
                return;
            }
            if received < expect {
                received += client.read(&mut buf).unwrap();
            }
        }
        panic!("queue never drained");
    }

    #[test]
    fn test_connection_id_token_conversion() {
        let id = ConnectionId(42);
        let token: Token = id.into();
        assert_eq!(token, Token(42));
        assert_eq!(ConnectionId::from(token), id);
        assert_eq!(id.to_string(), "conn-42");
    }

    #[test]
    fn test_state_transitions_and_interest() {
        let (mut conn, _client) = connected_pair();
        assert_eq!(conn.state(), ConnectionState::Unauthenticated);
        assert_eq!(conn.desired_interest(), Interest::READABLE);

        conn.bind_name("alice".to_string());
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.name(), Some("alice"));

        conn.enqueue(&Message::success("hi")).unwrap();
        assert!(conn.has_pending_output());
        assert_eq!(
            conn.desired_interest(),
            Interest::READABLE | Interest::WRITABLE
        );

        conn.begin_close();
        assert!(!conn.is_open());
        assert_eq!(conn.desired_interest(), Interest::WRITABLE);
    }

    #[test]
    fn test_read_and_decode_from_socket() {
        let (mut conn, mut client) = connected_pair();

        let first = Message::login("alice");
        let second = Message::direct("alice", "bob", "hello");
        client.write_all(&codec::encode(&first).unwrap()).unwrap();
        client.write_all(&codec::encode(&second).unwrap()).unwrap();
        client.flush().unwrap();

        let mut decoded = Vec::new();
        for _ in 0..200 {
            conn.read_available().unwrap();
            conn.decode_messages(&mut decoded).unwrap();
            if decoded.len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_read_stops_at_budget() {
        let limits = ConnectionLimits {
            read_chunk: 256,
            read_budget: 1024,
            ..ConnectionLimits::default()
        };
        let (mut conn, mut client) = connected_pair_with(limits);
        client.write_all(&[7u8; 10 * 1024]).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut total = 0;
        let mut budget_hit = false;
        for _ in 0..200 {
            let outcome = conn.read_available().unwrap();
            assert!(outcome.bytes <= 1024);
            budget_hit |= !outcome.drained && outcome.bytes == 1024;
            total += outcome.bytes;
            if total == 10 * 1024 {
                break;
            }
            if outcome.drained {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        assert_eq!(total, 10 * 1024);
        assert!(budget_hit);
    }

    #[test]
    fn test_decode_between_budgeted_reads_keeps_buffer_small() {
        let limits = ConnectionLimits {
            read_chunk: 128,
            read_budget: 512,
            ..ConnectionLimits::default()
        };
        let (mut conn, mut client) = connected_pair_with(limits);

        let message = Message::direct("alice", "bob", "x".repeat(40));
        let frame = codec::encode(&message).unwrap();
        let count = 200;
        for _ in 0..count {
            client.write_all(&frame).unwrap();
        }
        client.flush().unwrap();

        let mut decoded = Vec::new();
        for _ in 0..2000 {
            let outcome = conn.read_available().unwrap();
            conn.decode_messages(&mut decoded).unwrap();
            // At most one partial frame is left behind after decoding
            assert!(conn.inbound.len() < frame.len());
            if decoded.len() == count {
                break;
            }
            if outcome.drained {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(decoded.len(), count);
    }

    #[test]
    fn test_eof_is_reported() {
        let (mut conn, client) = connected_pair();
        drop(client);

        let mut outcome = ReadOutcome::default();
        for _ in 0..200 {
            outcome = conn.read_available().unwrap();
            if outcome.eof {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(outcome.eof);
    }

    #[test]
    fn test_flush_reaches_peer() {
        let (mut conn, mut client) = connected_pair();
        let reply = Message::success("welcome");
        conn.enqueue(&reply).unwrap();

        let mut status = FlushStatus::Blocked;
        for _ in 0..200 {
            status = conn.flush().unwrap();
            if status == FlushStatus::Drained {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(status, FlushStatus::Drained);
        assert!(!conn.has_pending_output());

        let expected = codec::encode(&reply).unwrap();
        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).unwrap();
        assert_eq!(&received[..], &expected[..]);
    }

    #[test]
    fn test_interest_returns_to_readable_after_drain() {
        let (mut conn, mut client) = connected_pair();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        conn.bind_name("bob".to_string());

        // More than the kernel buffers will take in one go
        let big = Message::direct("alice", "bob", "y".repeat(256 * 1024));
        let frame = codec::encode(&big).unwrap();
        for _ in 0..64 {
            conn.enqueue_frame(frame.clone()).unwrap();
        }

        assert_eq!(conn.flush().unwrap(), FlushStatus::Blocked);
        assert!(conn.has_pending_output());
        assert_eq!(
            conn.desired_interest(),
            Interest::READABLE | Interest::WRITABLE
        );

        drain_into(&mut conn, &mut client, 64 * frame.len());
        assert!(!conn.has_pending_output());
        assert_eq!(conn.desired_interest(), Interest::READABLE);
    }

    #[test]
    fn test_queue_limit_refuses_whole_frames() {
        let limits = ConnectionLimits {
            max_queued_bytes: 100,
            ..ConnectionLimits::default()
        };
        let (mut conn, _client) = connected_pair_with(limits);

        conn.enqueue_frame(Bytes::from(vec![1u8; 60])).unwrap();
        let err = conn.enqueue_frame(Bytes::from(vec![2u8; 60])).unwrap_err();
        assert!(matches!(err, ChatError::Connection(_)));

        // The refused frame left no partial bytes behind
        assert_eq!(conn.outbound.queued_bytes(), 60);
        conn.enqueue_frame(Bytes::from(vec![3u8; 40])).unwrap();
        assert_eq!(conn.outbound.queued_bytes(), 100);
    }
}
