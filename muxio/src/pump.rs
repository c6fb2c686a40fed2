//! Request body sources for the upload pump.
//!
//! The protocol engine pulls request body data through a callback. Two
//! source kinds feed that pull:
//!
//! - [`PollableSource`]: read non-blocking straight into the engine's
//!   buffer. `WouldBlock` suspends the stream; a readiness watch on the
//!   source's fd (or a deferred retry) resumes it.
//! - [`OpaqueSource`]: may block, so it is never read from inside the
//!   pull callback. Reads are dispatched to the reactor's deferred
//!   queue and their outcome is latched as buffered bytes, EOF, or an
//!   error; the next pull drains the latch.

use std::io;
use std::os::unix::io::RawFd;

/// A byte producer that supports non-blocking reads.
pub trait PollableSource {
    /// Read up to `buf.len()` bytes without blocking.
    ///
    /// `Ok(0)` means end of body. `ErrorKind::WouldBlock` means no data
    /// right now.
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Fd to watch for readability after `WouldBlock`. Sources without
    /// one are retried on the next loop turn.
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

/// A byte producer whose reads may block or are otherwise opaque.
pub trait OpaqueSource {
    /// Read up to `buf.len()` bytes; `Ok(0)` means end of body. Called
    /// off the pull path only.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A request body source handed to [`crate::Message`].
pub enum RequestSource {
    Pollable(Box<dyn PollableSource>),
    Opaque(Box<dyn OpaqueSource>),
}

impl std::fmt::Debug for RequestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestSource::Pollable(_) => f.write_str("RequestSource::Pollable"),
            RequestSource::Opaque(_) => f.write_str("RequestSource::Opaque"),
        }
    }
}

/// Latched outcome of an off-path opaque read. The three states are
/// mutually exclusive; the pull callback drains exactly one of them.
#[derive(Debug, Default)]
pub(crate) struct SourceLatch {
    pub buffered: Vec<u8>,
    pub eof: bool,
    pub error: Option<io::Error>,
    /// An off-path read has been dispatched and has not latched yet.
    pub read_pending: bool,
}

/// An in-memory body. Always ready; used for byte-slice request bodies.
pub struct BufSource {
    data: Vec<u8>,
    pos: usize,
}

impl BufSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl PollableSource for BufSource {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}
