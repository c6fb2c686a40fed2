//! I/O driver: transport abstraction and the readiness reactor.
//!
//! The session owns one [`Reactor`] and attaches readiness sources to
//! it: the transport's fd (read and write interest) and request body
//! source fds while their streams are suspended. The reactor also
//! carries a deferred-action queue, the equivalent of idle callbacks:
//! work that must run on the next loop turn rather than inside a
//! protocol callback (close completion, off-path body reads, write
//! retries for fd-less transports).

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

/// A bidirectional byte stream with pollable read and write halves.
///
/// `read_*` returning `Ok(0)` signals EOF. Non-blocking calls return
/// `ErrorKind::WouldBlock` when not ready.
pub trait Transport {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<usize>;
    fn read_blocking(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_blocking(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Fd to register with the reactor. Transports without one (tests,
    /// in-memory pipes) are pumped opportunistically instead.
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

/// TCP transport in non-blocking mode; blocking calls park in poll(2).
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }

    fn wait(&self, events: libc::c_short) -> io::Result<()> {
        let mut pollfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events,
            revents: 0,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Transport for TcpTransport {
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write(data)
    }

    fn read_blocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(libc::POLLIN)?,
                other => return other,
            }
        }
    }

    fn write_blocking(&mut self, data: &[u8]) -> io::Result<usize> {
        loop {
            match self.stream.write(data) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(libc::POLLOUT)?,
                other => return other,
            }
        }
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

/// Deferred session work, run outside protocol callbacks.
#[derive(Debug)]
pub(crate) enum Action {
    /// Drain pending engine output to the transport.
    TryWrite,
    /// Re-evaluate a pending waiter.
    CheckStatus(u64),
    /// Arm the withheld request body (100 Continue arrived).
    ArmBody(u32),
    /// Resume a deferred stream and try writing (fd-less sources).
    ResumeStream(u32),
    /// Run one off-path read of an opaque body source.
    OpaqueRead { msg_id: u64, len: usize },
    /// Complete the graceful-close waiter (GOAWAY flushed).
    CloseDone,
    /// Terminate the session if no exchanges remain.
    TerminateSession,
}

/// What a readiness token is watching.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Watch {
    Transport,
    BodySource { stream_id: u32 },
}

/// One readiness wake.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Wake {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// mio-backed readiness reactor with a deferred-action queue.
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    watches: Slab<(RawFd, Watch)>,
    deferred: VecDeque<Action>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            watches: Slab::with_capacity(8),
            deferred: VecDeque::new(),
        })
    }

    /// Queue work for the next loop turn.
    pub fn defer(&mut self, action: Action) {
        self.deferred.push_back(action);
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn take_deferred(&mut self) -> Vec<Action> {
        self.deferred.drain(..).collect()
    }

    /// Register an fd; returns the watch token.
    pub fn watch_fd(&mut self, fd: RawFd, interest: Interest, watch: Watch) -> io::Result<usize> {
        let entry = self.watches.vacant_entry();
        let token = entry.key();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), interest)?;
        entry.insert((fd, watch));
        Ok(token)
    }

    /// Remove a watch registered with `watch_fd`.
    pub fn unwatch(&mut self, token: usize) {
        if self.watches.contains(token) {
            let (fd, _) = self.watches.remove(token);
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    pub fn watch_kind(&self, token: usize) -> Option<Watch> {
        self.watches.get(token).map(|(_, watch)| *watch)
    }

    /// True when at least one fd is registered.
    pub fn has_watches(&self) -> bool {
        !self.watches.is_empty()
    }

    /// Wait for readiness, up to `timeout`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Wake>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|event| Wake {
                token: event.token().0,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_starts_empty() {
        let reactor = Reactor::new().unwrap();
        assert!(!reactor.has_deferred());
        assert!(!reactor.has_watches());
        assert!(reactor.watch_kind(0).is_none());
    }

    #[test]
    fn deferred_actions_drain_in_order() {
        let mut reactor = Reactor::new().unwrap();
        reactor.defer(Action::TryWrite);
        reactor.defer(Action::CloseDone);
        assert!(reactor.has_deferred());

        let actions = reactor.take_deferred();
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], Action::TryWrite));
        assert!(matches!(actions[1], Action::CloseDone));
        assert!(!reactor.has_deferred());
    }

    #[test]
    fn unwatch_unknown_token_is_harmless() {
        let mut reactor = Reactor::new().unwrap();
        reactor.unwatch(42);
    }

    #[test]
    fn poll_with_zero_timeout_returns_empty() {
        let mut reactor = Reactor::new().unwrap();
        let wakes = reactor.poll(Some(Duration::from_millis(0))).unwrap();
        assert!(wakes.is_empty());
    }

    #[test]
    fn tcp_transport_registers_fd() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let transport = TcpTransport::new(stream).unwrap();
        assert!(transport.poll_fd().is_some());
    }

    #[test]
    fn tcp_transport_round_trip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut transport = TcpTransport::new(client).unwrap();
        assert_eq!(transport.write_blocking(b"ping").unwrap(), 4);

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        let mut buf = [0u8; 4];
        let n = transport.read_blocking(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
