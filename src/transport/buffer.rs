//! Per-connection byte buffers
//!
//! `ReadBuffer` accumulates inbound bytes for the frame decoder and
//! `WriteQueue` holds encoded frames until the socket accepts them.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use bytes::{Buf, Bytes, BytesMut};

/// Default inbound buffer size, matching a typical socket read
pub const DEFAULT_READ_CAPACITY: usize = 8192;

/// Inbound byte accumulator for the frame decoder.
///
/// Consumed bytes are dropped from the front with `advance`; `BytesMut`
/// reuses that prefix before it grows the allocation.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    buf: BytesMut,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_READ_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Unread bytes
    pub fn unread(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Number of unread bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Room left before the next reallocation
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Mark `n` unread bytes as consumed
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "consumed past the end of the buffer");
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Make sure at least `additional` bytes fit after the unread data
    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    /// Append bytes that were received some other way
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Writable view for async readers such as `AsyncReadExt::read_buf`
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Perform one read of at most `chunk` bytes from `reader`.
    ///
    /// Returns what the reader returned: `Ok(0)` means end of stream. On
    /// error the unread data is left untouched.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R, chunk: usize) -> io::Result<usize> {
        let filled = self.buf.len();
        self.buf.resize(filled + chunk, 0);
        match reader.read(&mut self.buf[filled..]) {
            Ok(n) => {
                self.buf.truncate(filled + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(filled);
                Err(e)
            }
        }
    }
}

/// Result of pushing queued frames at a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Everything queued has been written
    Drained,
    /// The writer stopped accepting bytes; the current frame is kept
    Blocked,
}

/// FIFO of encoded frames awaiting transmission.
///
/// The front frame becomes `current` and stays there, shrinking as bytes are
/// accepted, until it is fully written.
#[derive(Debug, Default)]
pub struct WriteQueue {
    pending: VecDeque<Bytes>,
    current: Option<Bytes>,
    queued_bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a complete frame
    pub fn push(&mut self, frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        self.queued_bytes += frame.len();
        self.pending.push_back(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Bytes not yet written
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Write as much as `writer` accepts.
    ///
    /// `WouldBlock` ends the attempt with `Blocked`; any other error is
    /// returned and the queue is left as it was at the failure point.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushStatus> {
        loop {
            if self.current.is_none() {
                self.current = self.pending.pop_front();
            }
            let Some(frame) = self.current.as_mut() else {
                return Ok(FlushStatus::Drained);
            };

            match writer.write(&frame[..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ));
                }
                Ok(n) => {
                    frame.advance(n);
                    self.queued_bytes -= n;
                    if frame.is_empty() {
                        self.current = None;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Blocked);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
