//! The HTTP/2 session engine: one instance per transport connection.
//!
//! [`Session`] owns the protocol [`Engine`], the transport, the reactor,
//! and every in-flight [`Exchange`]. All protocol callbacks run
//! synchronously inside the engine's two pump calls through a hooks
//! context that borrows the session's registries; because the engine is
//! mutably borrowed for the duration, a callback can never re-enter it.
//! Anything a callback wants done that needs the engine (a write
//! attempt, arming a withheld body, a status re-check) is queued as a
//! follow-up and replayed once the pump call returns. Work that must
//! wait for the next loop turn (close completion, off-path body reads)
//! goes to the reactor's deferred queue instead.
//!
//! User-supplied callbacks (waiters, completion callbacks, the close
//! callback) are never invoked while the session interior is borrowed;
//! they are staged as callouts and dispatched after the borrow ends, so
//! a callback may freely call back into the session.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http2::{
    Engine, EngineError, EngineHooks, ErrorCode, FrameDetail, FrameHeader, FrameInfo, FrameType,
    HeaderField, Pull, RequestBody, Setting, SettingId, StreamId, SubmitError, FRAME_HEADER_SIZE,
};
use mio::Interest;
use tracing::{debug, warn};

use crate::cancel::Cancellable;
use crate::driver::{Action, Reactor, Transport, Watch};
use crate::error::Error;
use crate::exchange::{Completion, CompletionFn, Exchange, ExchangeState, Waiter};
use crate::message::{request_header_allowed, Message};
use crate::metrics;
use crate::pump::RequestSource;
use crate::sink::{ResponseBody, SinkChain};

/// Connection-level receive window, matching other implementations.
const INITIAL_WINDOW_SIZE: u32 = 32 * 1024 * 1024;

/// HPACK table size advertised to the peer.
const MAX_HEADER_TABLE_SIZE: u32 = 65_536;

/// Transport read buffer size.
const READ_BUFFER_SIZE: usize = 8_192;

/// A callback staged for dispatch outside the session borrow.
type Callout = Box<dyn FnOnce()>;

struct OutboundChunk {
    chunk: Bytes,
    written: usize,
}

/// Registries and flags visible to the protocol hooks.
pub(crate) struct SessionState {
    conn_id: u64,
    /// Active exchanges, keyed by message id.
    exchanges: HashMap<u64, Exchange>,
    /// Stream id to message id.
    by_stream: HashMap<u32, u64>,
    /// Finished exchanges whose RST_STREAM has not been flushed yet.
    closing: HashMap<u32, Exchange>,
    /// Messages with a registered async waiter.
    pending_waiters: Vec<u64>,
    /// Follow-up work queued by hooks, replayed after the pump call.
    followups: Vec<Action>,
    /// First session-level error.
    error: Option<Error>,
    is_shutdown: bool,
    read_eof: bool,
    session_terminated: bool,
    goaway_sent: bool,
    close_waiter: Option<Box<dyn FnOnce()>>,
}

pub(crate) struct SessionCore {
    weak: Weak<RefCell<SessionCore>>,
    engine: Engine,
    transport: Box<dyn Transport>,
    reactor: Reactor,
    st: SessionState,
    /// At most one outstanding chunk; the next one is requested from
    /// the engine only once this has been fully written.
    outbound: Option<OutboundChunk>,
    /// A writable readiness source is armed; writes resume on its wake.
    write_blocked: bool,
    /// User callbacks staged for dispatch outside the borrow.
    callouts: Vec<Callout>,
}

/// A client-side HTTP/2 session over one transport connection.
pub struct Session {
    core: Rc<RefCell<SessionCore>>,
}

impl Session {
    /// Create a session over an open transport. Queues the connection
    /// preface, our SETTINGS (32 MiB initial window, 64 KiB header
    /// table, push disabled) and the stream-0 window update, and starts
    /// writing.
    pub fn new(transport: Box<dyn Transport>, conn_id: u64) -> io::Result<Session> {
        let mut engine = Engine::client();
        engine.submit_settings(&[
            Setting {
                id: SettingId::InitialWindowSize,
                value: INITIAL_WINDOW_SIZE,
            },
            Setting {
                id: SettingId::HeaderTableSize,
                value: MAX_HEADER_TABLE_SIZE,
            },
            Setting {
                id: SettingId::EnablePush,
                value: 0,
            },
        ]);
        engine.set_local_window_size(INITIAL_WINDOW_SIZE);

        let reactor = Reactor::new()?;
        let core = Rc::new_cyclic(|weak| {
            RefCell::new(SessionCore {
                weak: weak.clone(),
                engine,
                transport,
                reactor,
                st: SessionState {
                    conn_id,
                    exchanges: HashMap::new(),
                    by_stream: HashMap::new(),
                    closing: HashMap::new(),
                    pending_waiters: Vec::new(),
                    followups: Vec::new(),
                    error: None,
                    is_shutdown: false,
                    read_eof: false,
                    session_terminated: false,
                    goaway_sent: false,
                    close_waiter: None,
                },
                outbound: None,
                write_blocked: false,
                callouts: Vec::new(),
            })
        });

        {
            let mut inner = core.borrow_mut();
            let fd = inner.transport.poll_fd();
            if let Some(fd) = fd {
                inner
                    .reactor
                    .watch_fd(fd, Interest::READABLE | Interest::WRITABLE, Watch::Transport)?;
            }
            inner.try_write(false);
            inner.settle();
        }

        Ok(Session { core })
    }

    /// The opaque connection id used in logs.
    pub fn connection_id(&self) -> u64 {
        self.core.borrow().st.conn_id
    }

    /// Register a new exchange for `msg` and submit its HEADERS (and
    /// body, unless `Expect: 100-continue` withholds it).
    pub fn send(&self, msg: &Message, completion: impl FnOnce(&Message, Completion) + 'static) {
        self.core
            .borrow_mut()
            .send_item(msg, Box::new(completion));
        drain_callouts(&self.core);
    }

    /// Finalize an exchange: emit RST_STREAM, move it to the closing
    /// registry, invoke its completion callback, and possibly schedule
    /// session termination.
    pub fn finished(&self, msg: &Message) {
        self.core.borrow_mut().finish_exchange(msg.id());
        drain_callouts(&self.core);
    }

    /// Freeze waiter dispatch for this exchange. Wire I/O continues.
    pub fn pause(&self, msg: &Message) {
        let mut core = self.core.borrow_mut();
        if let Some(ex) = core.st.exchanges.get_mut(&msg.id()) {
            if ex.paused {
                warn!("pausing an already-paused message");
            }
            ex.paused = true;
        }
    }

    /// Resume waiter dispatch; the waiter is re-evaluated immediately.
    pub fn unpause(&self, msg: &Message) {
        {
            let mut core = self.core.borrow_mut();
            if let Some(ex) = core.st.exchanges.get_mut(&msg.id()) {
                if !ex.paused {
                    warn!("unpausing a message that was not paused");
                }
                ex.paused = false;
            }
            core.check_status(msg.id());
        }
        drain_callouts(&self.core);
    }

    pub fn is_paused(&self, msg: &Message) -> bool {
        self.core
            .borrow()
            .st
            .exchanges
            .get(&msg.id())
            .is_some_and(|ex| ex.paused)
    }

    /// Whether `msg` has an active exchange on this session.
    pub fn in_progress(&self, msg: &Message) -> bool {
        self.core.borrow().st.exchanges.contains_key(&msg.id())
    }

    /// Discard the rest of the response body: RST_STREAM with
    /// STREAM_CLOSED; the engine ignores further DATA on the stream.
    pub fn skip(&self, msg: &Message, blocking: bool) {
        {
            let mut core = self.core.borrow_mut();
            let stream_id = match core.st.exchanges.get(&msg.id()) {
                Some(ex) if ex.state < ExchangeState::ReadDone => ex.stream_id,
                _ => return,
            };
            if let Some(stream_id) = stream_id {
                debug!(conn = core.st.conn_id, stream = stream_id.value(), "skip");
                core.engine.submit_rst_stream(stream_id, ErrorCode::StreamClosed);
                core.try_write(blocking);
            }
        }
        drain_callouts(&self.core);
    }

    /// Drive I/O until the exchange reaches the body-reading state or
    /// fails. On failure the exchange is finalized (restartable errors
    /// mark the message as restarting instead of stamping completion).
    pub fn run_until_read(&self, msg: &Message, cancel: &Cancellable) -> Result<(), Error> {
        let msg_id = msg.id();
        let result = self.run_until(msg_id, ExchangeState::ReadingBody, cancel);

        if let Err(err) = &result {
            let mut core = self.core.borrow_mut();
            if core.st.exchanges.contains_key(&msg_id) {
                let restart = core
                    .st
                    .exchanges
                    .get(&msg_id)
                    .is_some_and(|ex| ex.can_be_restarted);
                if restart {
                    msg.set_restarting();
                } else {
                    msg.inner.borrow_mut().metrics.response_end = Some(Instant::now());
                }
                core.finish_exchange(msg_id);
            }
            drop(core);
            drain_callouts(&self.core);
            return Err(err.clone());
        }
        drain_callouts(&self.core);
        result
    }

    /// Async variant of [`Session::run_until_read`]: registers a
    /// one-shot waiter completed when the exchange reaches the
    /// body-reading state or fails.
    pub fn run_until_read_async(
        &self,
        msg: &Message,
        cancel: Cancellable,
        done: impl FnOnce(Result<(), Error>) + 'static,
    ) {
        let msg_id = msg.id();
        {
            let mut core = self.core.borrow_mut();
            match core.st.exchanges.get_mut(&msg_id) {
                Some(ex) => {
                    ex.waiter = Some(Waiter {
                        done: Box::new(done),
                        cancel,
                    });
                    core.st.pending_waiters.push(msg_id);
                    core.check_status(msg_id);
                }
                None => {
                    core.callouts
                        .push(Box::new(move || done(Err(Error::Cancelled))));
                }
            }
        }
        drain_callouts(&self.core);
    }

    /// Consumer handle for the response body. For bodyless responses
    /// (e.g. `204 No Content`) the handle reports EOF immediately.
    pub fn response_body(&self, msg: &Message) -> ResponseBody {
        let core = self.core.borrow();
        let chain = core
            .st
            .exchanges
            .get(&msg.id())
            .and_then(|ex| ex.sink.clone());
        ResponseBody {
            session: core.weak.clone(),
            msg_id: msg.id(),
            chain,
            eof_reported: false,
        }
    }

    /// True iff the session has no terminal error, is not shutting
    /// down, and the engine still accepts new requests.
    pub fn is_open(&self) -> bool {
        let core = self.core.borrow();
        core.engine.is_request_allowed() && !core.st.is_shutdown && core.st.error.is_none()
    }

    /// Equivalent to [`Session::is_open`].
    pub fn is_reusable(&self) -> bool {
        self.is_open()
    }

    /// Initiate graceful shutdown. Returns false when a GOAWAY has
    /// already been sent. `done` fires on the loop turn after the
    /// GOAWAY is flushed.
    pub fn close_async(&self, done: impl FnOnce() + 'static) -> bool {
        let accepted = {
            let mut core = self.core.borrow_mut();
            if core.st.goaway_sent {
                false
            } else {
                core.st.close_waiter = Some(Box::new(done));
                core.maybe_terminate();
                true
            }
        };
        drain_callouts(&self.core);
        accepted
    }

    /// One turn of the event loop: run deferred work, wait for
    /// readiness (when the transport has an fd), and pump both
    /// directions.
    pub fn drive_once(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.core.borrow_mut().drive_once(timeout)?;
        drain_callouts(&self.core);
        Ok(())
    }

    /// Change a live exchange's priority: records it on the message and
    /// submits a PRIORITY frame (depends-on 0, not exclusive).
    pub fn set_priority(&self, msg: &Message, priority: crate::message::Priority) {
        {
            let mut core = self.core.borrow_mut();
            msg.inner.borrow_mut().priority = priority;
            let stream_id = core
                .st
                .exchanges
                .get(&msg.id())
                .and_then(|ex| ex.stream_id);
            if let Some(stream_id) = stream_id {
                debug!(
                    conn = core.st.conn_id,
                    stream = stream_id.value(),
                    weight = priority.weight(),
                    "priority changed"
                );
                let _ = core.engine.submit_priority(stream_id, priority.weight());
                core.try_write(false);
            }
        }
        drain_callouts(&self.core);
    }

    fn run_until(
        &self,
        msg_id: u64,
        target: ExchangeState,
        cancel: &Cancellable,
    ) -> Result<(), Error> {
        loop {
            {
                let mut core = self.core.borrow_mut();
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let session_error = core.st.error.clone();
                let Some(ex) = core.st.exchanges.get_mut(&msg_id) else {
                    return Err(Error::Cancelled);
                };
                if let Some(err) = ex.error.take() {
                    return Err(err);
                }
                if ex.state >= target {
                    return Ok(());
                }
                if ex.paused {
                    return Err(Error::Cancelled);
                }
                if let Some(err) = session_error {
                    return Err(err);
                }
            }

            let progress = self.core.borrow_mut().io_run_once(msg_id)?;
            if !progress {
                let mut core = self.core.borrow_mut();
                if let Some(err) = core
                    .st
                    .exchanges
                    .get_mut(&msg_id)
                    .and_then(|ex| ex.error.take())
                {
                    return Err(err);
                }
                if let Some(err) = core.st.error.clone() {
                    return Err(err);
                }
                if core
                    .st
                    .exchanges
                    .get(&msg_id)
                    .is_some_and(|ex| ex.state >= target)
                {
                    return Ok(());
                }
                return Err(Error::Disconnected);
            }
        }
    }
}

impl Drop for Session {
    /// Destroying the session cancels every pending waiter.
    fn drop(&mut self) {
        let mut waiters = Vec::new();
        {
            let mut core = self.core.borrow_mut();
            core.st.pending_waiters.clear();
            for ex in core.st.exchanges.values_mut() {
                if let Some(waiter) = ex.waiter.take() {
                    waiters.push(waiter);
                }
            }
        }
        for waiter in waiters {
            (waiter.done)(Err(Error::Cancelled));
        }
    }
}

/// Dispatch staged user callbacks with the session borrow released.
fn drain_callouts(core: &Rc<RefCell<SessionCore>>) {
    loop {
        let callouts = std::mem::take(&mut core.borrow_mut().callouts);
        if callouts.is_empty() {
            break;
        }
        for callout in callouts {
            callout();
        }
    }
}

impl SessionCore {
    // ── Engine pump wrappers ───────────────────────────────────────────

    fn feed_engine(&mut self, data: &[u8]) -> Result<usize, EngineError> {
        let SessionCore {
            engine,
            st,
            reactor,
            ..
        } = self;
        let mut hooks = Hooks { st, reactor };
        engine.feed_input(data, &mut hooks)
    }

    fn next_chunk(&mut self) -> Option<Bytes> {
        let SessionCore {
            engine,
            st,
            reactor,
            ..
        } = self;
        let mut hooks = Hooks { st, reactor };
        engine.next_output_chunk(&mut hooks)
    }

    /// Replay hook follow-ups until the queue is empty.
    fn settle(&mut self) {
        loop {
            let followups = std::mem::take(&mut self.st.followups);
            if followups.is_empty() {
                break;
            }
            for action in followups {
                self.run_action(action);
            }
        }
    }

    fn run_action(&mut self, action: Action) {
        match action {
            Action::TryWrite => self.try_write(false),
            Action::CheckStatus(msg_id) => self.check_status(msg_id),
            Action::ArmBody(stream_id) => {
                let _ = self.engine.submit_data(StreamId::new(stream_id));
                self.try_write(false);
            }
            Action::ResumeStream(stream_id) => {
                self.engine.resume_data(StreamId::new(stream_id));
                self.try_write(false);
            }
            Action::OpaqueRead { msg_id, len } => self.opaque_read(msg_id, len),
            Action::CloseDone => {
                if let Some(done) = self.st.close_waiter.take() {
                    self.callouts.push(done);
                }
            }
            Action::TerminateSession => self.maybe_terminate(),
        }
    }

    // ── Write path ─────────────────────────────────────────────────────

    /// Drain engine output to the transport. While a writable source is
    /// armed the wake continues the loop instead.
    fn try_write(&mut self, blocking: bool) {
        if self.write_blocked {
            return;
        }
        loop {
            match self.write_step(blocking) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    if self.transport.poll_fd().is_none() {
                        // No fd to watch: retry on the next loop turn.
                        self.reactor.defer(Action::TryWrite);
                        self.write_blocked = false;
                    }
                    break;
                }
                Err(e) => {
                    let err = Error::transport(&e);
                    self.set_session_error(err);
                    break;
                }
            }
        }
        self.settle();
    }

    /// Write one step: request a chunk if none is outstanding, then
    /// push bytes. Returns false when the engine has nothing to send.
    fn write_step(&mut self, blocking: bool) -> io::Result<bool> {
        if self.outbound.is_none() {
            match self.next_chunk() {
                Some(chunk) => self.outbound = Some(OutboundChunk { chunk, written: 0 }),
                None => return Ok(false),
            }
        }

        let out = self.outbound.as_mut().expect("outbound chunk");
        let data = &out.chunk[out.written..];
        let n = if blocking {
            self.transport.write_blocking(data)?
        } else {
            self.transport.write_nonblocking(data)?
        };
        metrics::BYTES_SENT.add(n as u64);
        out.written += n;
        debug_assert!(out.written <= out.chunk.len());
        if out.written == out.chunk.len() {
            self.outbound = None;
        }
        Ok(true)
    }

    // ── Read path ──────────────────────────────────────────────────────

    /// Non-blocking read loop: feed the engine until it stops wanting
    /// reads or the transport would block. Waiters are re-checked after
    /// every successful read.
    fn read_pump(&mut self) {
        if self.st.error.is_some() || self.st.read_eof {
            return;
        }
        let mut buf = [0u8; READ_BUFFER_SIZE];
        while self.engine.wants_read() {
            match self.transport.read_nonblocking(&mut buf) {
                Ok(0) => {
                    self.handle_eof();
                    return;
                }
                Ok(n) => {
                    metrics::BYTES_RECEIVED.add(n as u64);
                    match self.feed_engine(&buf[..n]) {
                        Ok(_) => {
                            self.settle();
                            self.walk_waiters();
                        }
                        Err(e) => {
                            debug!(conn = self.st.conn_id, "protocol engine error: {e}");
                            self.settle();
                            self.set_session_error(Error::Protocol(e.to_string()));
                            self.walk_waiters();
                            self.st.is_shutdown = true;
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Flush anything the engine queued in response
                    // (SETTINGS ACK, PING ACK, WINDOW_UPDATE).
                    self.try_write(false);
                    return;
                }
                Err(e) => {
                    let err = Error::transport(&e);
                    self.set_session_error(err);
                    self.walk_waiters();
                    self.st.is_shutdown = true;
                    return;
                }
            }
        }
        self.st.is_shutdown = true;
    }

    /// One blocking read for the synchronous paths. Returns whether
    /// progress was made.
    fn read_step_blocking(&mut self) -> Result<bool, Error> {
        if self.st.read_eof {
            return Ok(false);
        }
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = match self.transport.read_blocking(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                let err = Error::transport(&e);
                self.set_session_error(err.clone());
                self.st.is_shutdown = true;
                return Err(err);
            }
        };
        if n == 0 {
            self.handle_eof();
            return Ok(false);
        }
        metrics::BYTES_RECEIVED.add(n as u64);
        match self.feed_engine(&buf[..n]) {
            Ok(_) => {
                self.settle();
                self.walk_waiters();
                Ok(true)
            }
            Err(e) => {
                debug!(conn = self.st.conn_id, "protocol engine error: {e}");
                self.settle();
                self.set_session_error(Error::Protocol(e.to_string()));
                self.walk_waiters();
                self.st.is_shutdown = true;
                Ok(false)
            }
        }
    }

    fn handle_eof(&mut self) {
        debug!(conn = self.st.conn_id, "transport EOF");
        self.st.read_eof = true;
        self.st.is_shutdown = true;
        if !self.st.exchanges.is_empty() {
            self.set_session_error(Error::Disconnected);
            self.walk_waiters();
        }
    }

    // ── Exchange lifecycle ─────────────────────────────────────────────

    fn send_item(&mut self, msg: &Message, completion: CompletionFn) {
        let msg_id = msg.id();
        let mut ex = Exchange::new(msg.clone(), completion);
        metrics::STREAMS_OPENED.increment();

        let (headers, weight, target) = {
            let inner = msg.inner.borrow();
            let mut list = vec![
                HeaderField::new(":method", inner.method.as_bytes()),
                HeaderField::new(":scheme", inner.scheme.as_bytes()),
                HeaderField::new(":authority", inner.authority().into_bytes()),
                HeaderField::new(":path", inner.path_and_query().into_bytes()),
            ];
            for (name, value) in &inner.headers {
                if request_header_allowed(name) {
                    list.push(HeaderField::new(name.as_bytes(), value.as_bytes()));
                }
            }
            (
                list,
                inner.priority.weight(),
                format!("{}{}", inner.authority(), inner.path_and_query()),
            )
        };

        let body_mode = if ex.body.is_none() {
            RequestBody::None
        } else if ex.expect_continue {
            RequestBody::Withheld
        } else {
            RequestBody::Provided
        };

        match self.engine.submit_request(&headers, weight, body_mode) {
            Ok(stream_id) => {
                debug!(
                    conn = self.st.conn_id,
                    stream = stream_id.value(),
                    "request made for {target}"
                );
                ex.stream_id = Some(stream_id);
                self.st.by_stream.insert(stream_id.value(), msg_id);
                self.st.exchanges.insert(msg_id, ex);
                self.try_write(false);
            }
            Err(SubmitError::StreamIdUnavailable) => {
                ex.set_error(Error::StreamIdExhausted);
                ex.can_be_restarted = true;
                self.st.exchanges.insert(msg_id, ex);
            }
            Err(e) => {
                debug!(conn = self.st.conn_id, "submit failed: {e}");
                ex.set_error(Error::Disconnected);
                self.st.exchanges.insert(msg_id, ex);
            }
        }
    }

    fn finish_exchange(&mut self, msg_id: u64) {
        let Some(mut ex) = self.st.exchanges.remove(&msg_id) else {
            return;
        };
        let completion = if ex.state < ExchangeState::ReadDone {
            Completion::Interrupted
        } else {
            Completion::Complete
        };
        debug!(
            conn = self.st.conn_id,
            stream = ex.stream_id.map_or(0, |id| id.value()),
            "finished: {completion:?}"
        );
        match completion {
            Completion::Complete => metrics::STREAMS_COMPLETED.increment(),
            Completion::Interrupted => metrics::STREAMS_INTERRUPTED.increment(),
        };

        self.st.pending_waiters.retain(|&id| id != msg_id);
        if let Some(waiter) = ex.waiter.take() {
            self.callouts
                .push(Box::new(move || (waiter.done)(Err(Error::Cancelled))));
        }
        if let Some(token) = ex.body_watch.take() {
            self.reactor.unwatch(token);
        }

        let completion_cb = ex.completion.take();
        let msg = ex.msg.clone();

        if let Some(stream_id) = ex.stream_id {
            self.st.by_stream.remove(&stream_id.value());
            if !self.st.is_shutdown {
                let code = if completion == Completion::Complete {
                    ErrorCode::NoError
                } else {
                    ErrorCode::Cancel
                };
                self.engine.submit_rst_stream(stream_id, code);
                ex.close();
                self.st.closing.insert(stream_id.value(), ex);
            }
        }

        if let Some(cb) = completion_cb {
            self.callouts
                .push(Box::new(move || cb(&msg, completion)));
        }

        if self.st.is_shutdown {
            self.maybe_terminate();
            return;
        }
        self.try_write(false);
    }

    /// Submit GOAWAY once every active exchange is gone.
    fn maybe_terminate(&mut self) {
        if self.st.session_terminated || !self.st.exchanges.is_empty() {
            return;
        }
        self.st.session_terminated = true;
        self.engine.terminate_session(ErrorCode::NoError);
        self.try_write(false);
    }

    fn set_session_error(&mut self, error: Error) {
        if self.st.error.is_none() {
            debug!(conn = self.st.conn_id, %error, "session error");
            self.st.error = Some(error);
        }
    }

    // ── Waiters ────────────────────────────────────────────────────────

    fn walk_waiters(&mut self) {
        let pending = self.st.pending_waiters.clone();
        for msg_id in pending {
            self.check_status(msg_id);
        }
    }

    /// Re-evaluate one pending waiter against the exchange state.
    fn check_status(&mut self, msg_id: u64) {
        enum Verdict {
            Cancelled,
            Failed,
            Ready,
        }

        let session_error = self.st.error.clone();
        let verdict = {
            let Some(ex) = self.st.exchanges.get_mut(&msg_id) else {
                self.st.pending_waiters.retain(|&id| id != msg_id);
                return;
            };
            let Some(waiter) = ex.waiter.as_ref() else {
                return;
            };

            if waiter.cancel.is_cancelled() {
                Verdict::Cancelled
            } else if ex.paused {
                return;
            } else {
                if ex.error.is_none() {
                    if let Some(err) = session_error {
                        ex.set_error(err);
                    }
                }
                if ex.error.is_some() {
                    Verdict::Failed
                } else {
                    if ex.state == ExchangeState::ReadDataStart
                        && ex.msg.inner.borrow().sniffer.is_none()
                    {
                        ex.advance_from(ExchangeState::ReadDataStart, ExchangeState::ReadingBody);
                    }
                    if ex.state < ExchangeState::ReadingBody {
                        return;
                    }
                    Verdict::Ready
                }
            }
        };

        self.st.pending_waiters.retain(|&id| id != msg_id);

        match verdict {
            Verdict::Cancelled => {
                let ex = self.st.exchanges.get_mut(&msg_id).expect("exchange");
                let waiter = ex.waiter.take().expect("waiter");
                let not_done = ex.state < ExchangeState::ReadDone;
                self.callouts
                    .push(Box::new(move || (waiter.done)(Err(Error::Cancelled))));
                if not_done {
                    self.finish_exchange(msg_id);
                }
            }
            Verdict::Failed => {
                let ex = self.st.exchanges.get_mut(&msg_id).expect("exchange");
                let err = ex.error.take().expect("error");
                let waiter = ex.waiter.take().expect("waiter");
                if ex.can_be_restarted {
                    ex.msg.set_restarting();
                } else {
                    ex.msg.inner.borrow_mut().metrics.response_end = Some(Instant::now());
                }
                self.finish_exchange(msg_id);
                self.callouts
                    .push(Box::new(move || (waiter.done)(Err(err))));
            }
            Verdict::Ready => {
                let ex = self.st.exchanges.get_mut(&msg_id).expect("exchange");
                let waiter = ex.waiter.take().expect("waiter");
                self.callouts
                    .push(Box::new(move || (waiter.done)(Ok(()))));
            }
        }
    }

    // ── Request body (opaque sources) ──────────────────────────────────

    /// Off-path read of an opaque body source; latches the outcome and
    /// resumes the stream.
    fn opaque_read(&mut self, msg_id: u64, len: usize) {
        // The exchange may have finished while the read was queued.
        let Some(mut body) = self
            .st
            .exchanges
            .get_mut(&msg_id)
            .and_then(|ex| ex.body.take())
        else {
            return;
        };

        let mut buf = vec![0u8; len.max(1)];
        let result = match &mut body {
            RequestSource::Opaque(source) => source.read(&mut buf),
            RequestSource::Pollable(_) => {
                // Misfiled; put it back untouched.
                if let Some(ex) = self.st.exchanges.get_mut(&msg_id) {
                    ex.body = Some(body);
                }
                return;
            }
        };

        let Some(ex) = self.st.exchanges.get_mut(&msg_id) else {
            return;
        };
        ex.body = Some(body);
        ex.latch.read_pending = false;
        match result {
            Ok(0) => ex.latch.eof = true,
            Ok(n) => {
                buf.truncate(n);
                debug!(
                    conn = self.st.conn_id,
                    stream = ex.stream_id.map_or(0, |id| id.value()),
                    "read {n} body bytes, resuming send"
                );
                ex.latch.buffered = buf;
            }
            Err(e) => ex.latch.error = Some(e),
        }

        if let Some(stream_id) = ex.stream_id {
            self.engine.resume_data(stream_id);
            self.try_write(false);
        }
    }

    // ── Body sink support ──────────────────────────────────────────────

    /// One blocking read on behalf of a response body consumer whose
    /// sink ran dry.
    pub(crate) fn pump_for_body(&mut self) -> io::Result<()> {
        if let Some(err) = &self.st.error {
            return Err(io::Error::other(err.clone()));
        }
        if self.reactor.has_deferred() {
            for action in self.reactor.take_deferred() {
                self.run_action(action);
            }
            return Ok(());
        }
        if self.engine.wants_read() && !self.st.read_eof {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            let n = self.transport.read_blocking(&mut buf)?;
            if n == 0 {
                self.handle_eof();
                return Ok(());
            }
            metrics::BYTES_RECEIVED.add(n as u64);
            if let Err(e) = self.feed_engine(&buf[..n]) {
                debug!(conn = self.st.conn_id, "protocol engine error: {e}");
                self.set_session_error(Error::Protocol(e.to_string()));
            }
            self.settle();
            self.walk_waiters();
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "session shut down with body incomplete",
        ))
    }

    /// The consumer observed EOF on the body sink: terminal state.
    pub(crate) fn on_body_eof(&mut self, msg_id: u64) {
        let Some(ex) = self.st.exchanges.get_mut(&msg_id) else {
            return;
        };
        debug!(
            conn = self.st.conn_id,
            stream = ex.stream_id.map_or(0, |id| id.value()),
            "client stream EOF"
        );
        ex.msg.inner.borrow_mut().metrics.response_end = Some(Instant::now());
        ex.advance_from(ExchangeState::ReadingBody, ExchangeState::ReadDone);
    }

    // ── Loop driving ───────────────────────────────────────────────────

    fn drive_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        for action in self.reactor.take_deferred() {
            self.run_action(action);
        }
        self.settle();

        if self.reactor.has_watches() {
            let wakes = self.reactor.poll(timeout)?;
            for wake in wakes {
                match self.reactor.watch_kind(wake.token) {
                    Some(Watch::Transport) => {
                        if wake.readable {
                            self.read_pump();
                        }
                        if wake.writable && self.write_blocked {
                            self.write_blocked = false;
                            self.try_write(false);
                        }
                    }
                    Some(Watch::BodySource { stream_id }) => {
                        self.reactor.unwatch(wake.token);
                        if let Some(&msg_id) = self.st.by_stream.get(&stream_id) {
                            if let Some(ex) = self.st.exchanges.get_mut(&msg_id) {
                                ex.body_watch = None;
                            }
                        }
                        self.engine.resume_data(StreamId::new(stream_id));
                        self.try_write(false);
                    }
                    None => {}
                }
            }
        } else {
            // Fd-less transport (tests, in-memory pipes): pump
            // opportunistically.
            self.read_pump();
            self.try_write(false);
        }

        self.settle();
        Ok(())
    }

    /// One blocking step for the synchronous runner: deferred work
    /// first, then writes while the exchange is still uploading, then
    /// reads.
    fn io_run_once(&mut self, msg_id: u64) -> Result<bool, Error> {
        if self.reactor.has_deferred() {
            for action in self.reactor.take_deferred() {
                self.run_action(action);
            }
            self.settle();
            return Ok(true);
        }

        let state = match self.st.exchanges.get(&msg_id) {
            Some(ex) => ex.state,
            None => return Ok(false),
        };

        if state < ExchangeState::WriteDone
            && (self.engine.wants_write() || self.outbound.is_some())
        {
            let progress = self
                .write_once_blocking()
                .map_err(|e| Error::transport(&e))?;
            if progress {
                return Ok(true);
            }
        }
        if state < ExchangeState::ReadDone && self.engine.wants_read() {
            return self.read_step_blocking();
        }
        Ok(false)
    }

    fn write_once_blocking(&mut self) -> io::Result<bool> {
        let progress = self.write_step(true)?;
        self.settle();
        Ok(progress)
    }
}

/// Protocol hooks: the engine calls these synchronously from inside
/// `feed_input` and `next_output_chunk`. Everything here may touch the
/// registries but not the engine; engine-needing work is queued as a
/// follow-up.
struct Hooks<'a> {
    st: &'a mut SessionState,
    reactor: &'a mut Reactor,
}

impl Hooks<'_> {
    fn recv_headers_frame(&mut self, stream_id: StreamId, payload_len: usize, end_stream: bool) {
        let st = &mut *self.st;
        let Some(&msg_id) = st.by_stream.get(&stream_id.value()) else {
            return;
        };
        let Some(ex) = st.exchanges.get_mut(&msg_id) else {
            return;
        };

        ex.msg.inner.borrow_mut().metrics.response_header_bytes_received +=
            (payload_len + FRAME_HEADER_SIZE) as u64;

        let status = ex.msg.inner.borrow().status;
        debug!(
            conn = st.conn_id,
            stream = stream_id.value(),
            status,
            "response headers"
        );

        if (100..200).contains(&status) {
            if ex.expect_continue && status == 100 {
                st.followups.push(Action::ArmBody(stream_id.value()));
                st.followups.push(Action::TryWrite);
            }
            let hook = ex.msg.inner.borrow_mut().informational.take();
            if let Some(mut hook) = hook {
                hook(status);
                ex.msg.inner.borrow_mut().informational = Some(hook);
            }
            ex.msg.inner.borrow_mut().cleanup_response();
            return;
        }

        if ex.state >= ExchangeState::ReadDataStart {
            // Trailing header block; END_STREAM ends the body here.
            if end_stream {
                if let Some(chain) = ex.sink.clone() {
                    chain.borrow_mut().complete();
                }
                try_sniff(ex, true);
                st.followups.push(Action::CheckStatus(msg_id));
            }
            return;
        }

        if status == 204 || end_stream {
            debug!(conn = st.conn_id, stream = stream_id.value(), "stream done");
            ex.advance_from(ExchangeState::ReadHeaders, ExchangeState::ReadingBody);
        }
    }

    fn recv_data_frame(&mut self, stream_id: StreamId, payload_len: usize, end_stream: bool) {
        let st = &mut *self.st;
        if let Some(&msg_id) = st.by_stream.get(&stream_id.value()) {
            if let Some(ex) = st.exchanges.get_mut(&msg_id) {
                ex.msg.inner.borrow_mut().metrics.response_body_bytes_received +=
                    (payload_len + FRAME_HEADER_SIZE) as u64;
                if end_stream {
                    if let Some(chain) = ex.sink.clone() {
                        chain.borrow_mut().complete();
                    }
                    try_sniff(ex, true);
                    st.followups.push(Action::CheckStatus(msg_id));
                }
            }
        }
        // Write after every received DATA frame so WINDOW_UPDATEs go
        // out promptly.
        st.followups.push(Action::TryWrite);
    }

    fn recv_goaway(&mut self, last_stream_id: StreamId, error_code: ErrorCode) {
        metrics::GOAWAY_RECEIVED.increment();
        let st = &mut *self.st;
        debug!(
            conn = st.conn_id,
            last_stream = last_stream_id.value(),
            code = %error_code,
            "GOAWAY received"
        );

        for ex in st.exchanges.values_mut() {
            // Graceful shutdown lets acknowledged streams finish;
            // everything else fails with a session error.
            let acknowledged = error_code == ErrorCode::NoError
                && ex
                    .stream_id
                    .is_some_and(|id| id.value() <= last_stream_id.value());
            if !acknowledged && ex.state < ExchangeState::ReadDone {
                ex.set_error(Error::Session(error_code));
            }
        }

        st.is_shutdown = true;
        st.followups.push(Action::TerminateSession);
    }
}

impl EngineHooks for Hooks<'_> {
    fn on_begin_frame(&mut self, hd: &FrameHeader) {
        let st = &mut *self.st;
        let Some(&msg_id) = st.by_stream.get(&hd.stream_id.value()) else {
            return;
        };
        let Some(ex) = st.exchanges.get_mut(&msg_id) else {
            return;
        };

        match hd.known_type() {
            Some(FrameType::Headers) => {
                if ex.state == ExchangeState::WriteDone {
                    ex.msg.inner.borrow_mut().metrics.response_start = Some(Instant::now());
                    ex.advance_from(ExchangeState::WriteDone, ExchangeState::ReadHeaders);
                }
            }
            Some(FrameType::Data) => {
                if ex.state < ExchangeState::ReadDataStart {
                    let decoder = ex.msg.inner.borrow_mut().decoder.take();
                    ex.sink = Some(Rc::new(RefCell::new(SinkChain::new(decoder))));
                    ex.advance_from(ExchangeState::ReadHeaders, ExchangeState::ReadDataStart);
                }
            }
            _ => {}
        }
    }

    fn on_header(&mut self, stream_id: StreamId, name: &[u8], value: &[u8]) {
        let st = &mut *self.st;
        let Some(&msg_id) = st.by_stream.get(&stream_id.value()) else {
            return;
        };
        let Some(ex) = st.exchanges.get_mut(&msg_id) else {
            return;
        };

        if name.first() == Some(&b':') {
            if name == b":status" {
                if let Some(status) = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<u16>().ok())
                {
                    ex.msg.inner.borrow_mut().status = status;
                }
            } else {
                debug!(
                    "unknown pseudo-header: {} = {}",
                    String::from_utf8_lossy(name),
                    String::from_utf8_lossy(value)
                );
            }
            return;
        }

        ex.msg.inner.borrow_mut().response_headers.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }

    fn on_frame_received(&mut self, frame: &FrameInfo) {
        match &frame.detail {
            FrameDetail::Headers { end_stream, .. } => {
                self.recv_headers_frame(frame.stream_id, frame.payload_len, *end_stream);
            }
            FrameDetail::Data { end_stream } => {
                self.recv_data_frame(frame.stream_id, frame.payload_len, *end_stream);
            }
            FrameDetail::RstStream { error_code } => {
                if *error_code != ErrorCode::NoError {
                    let st = &mut *self.st;
                    if let Some(&msg_id) = st.by_stream.get(&frame.stream_id.value()) {
                        if let Some(ex) = st.exchanges.get_mut(&msg_id) {
                            let err = if *error_code == ErrorCode::RefusedStream {
                                Error::StreamRefused
                            } else {
                                Error::StreamReset(*error_code)
                            };
                            ex.set_error(err);
                        }
                    }
                }
            }
            FrameDetail::GoAway {
                last_stream_id,
                error_code,
            } => self.recv_goaway(*last_stream_id, *error_code),
            FrameDetail::WindowUpdate { .. } => {
                // The remote window may have opened; attempt a write.
                self.st.followups.push(Action::TryWrite);
            }
            _ => {}
        }
    }

    fn on_data_chunk(&mut self, stream_id: StreamId, data: &[u8]) {
        let st = &mut *self.st;
        let Some(&msg_id) = st.by_stream.get(&stream_id.value()) else {
            return;
        };
        let Some(ex) = st.exchanges.get_mut(&msg_id) else {
            return;
        };
        debug!(
            conn = st.conn_id,
            stream = stream_id.value(),
            len = data.len(),
            "data chunk"
        );
        if let Some(chain) = ex.sink.clone() {
            chain.borrow_mut().push(data);
        }
        try_sniff(ex, false);
    }

    fn on_before_frame_send(&mut self, frame: &FrameInfo) {
        if let FrameDetail::Headers { .. } = frame.detail {
            let st = &mut *self.st;
            if let Some(&msg_id) = st.by_stream.get(&frame.stream_id.value()) {
                if let Some(ex) = st.exchanges.get_mut(&msg_id) {
                    ex.advance_from(ExchangeState::None, ExchangeState::WriteHeaders);
                }
            }
        }
    }

    fn on_frame_sent(&mut self, frame: &FrameInfo) {
        let st = &mut *self.st;
        match &frame.detail {
            FrameDetail::Headers { .. } => {
                let Some(&msg_id) = st.by_stream.get(&frame.stream_id.value()) else {
                    return;
                };
                let Some(ex) = st.exchanges.get_mut(&msg_id) else {
                    return;
                };
                ex.msg.inner.borrow_mut().metrics.request_header_bytes_sent +=
                    (frame.payload_len + FRAME_HEADER_SIZE) as u64;
                if ex.body.is_none() {
                    ex.advance_from(ExchangeState::WriteHeaders, ExchangeState::WriteDone);
                }
            }
            FrameDetail::Data { end_stream } => {
                let Some(&msg_id) = st.by_stream.get(&frame.stream_id.value()) else {
                    return;
                };
                let Some(ex) = st.exchanges.get_mut(&msg_id) else {
                    return;
                };
                if ex.state < ExchangeState::WriteData {
                    ex.advance_from(ExchangeState::WriteHeaders, ExchangeState::WriteData);
                }
                debug!(
                    conn = st.conn_id,
                    stream = frame.stream_id.value(),
                    bytes = frame.payload_len,
                    finished = end_stream,
                    "sent body data"
                );
                {
                    let mut inner = ex.msg.inner.borrow_mut();
                    inner.metrics.request_body_bytes_sent +=
                        (frame.payload_len + FRAME_HEADER_SIZE) as u64;
                    inner.metrics.request_body_size += frame.payload_len as u64;
                }
                if *end_stream {
                    ex.advance_from(ExchangeState::WriteData, ExchangeState::WriteDone);
                }
            }
            FrameDetail::RstStream { .. } => {
                debug!(
                    conn = st.conn_id,
                    stream = frame.stream_id.value(),
                    "RST_STREAM sent"
                );
                st.closing.remove(&frame.stream_id.value());
            }
            FrameDetail::GoAway { .. } => {
                debug!(conn = st.conn_id, "GOAWAY sent");
                st.goaway_sent = true;
                if st.close_waiter.is_some() {
                    // Complete the close on the next loop turn so any
                    // trailing I/O bookkeeping runs first.
                    self.reactor.defer(Action::CloseDone);
                }
            }
            _ => {}
        }
    }

    fn on_frame_not_sent(&mut self, frame: &FrameInfo, error: &http2::EngineError) {
        debug!(
            conn = self.st.conn_id,
            stream = frame.stream_id.value(),
            "[{}] not sent: {error}",
            frame.type_name()
        );
    }

    fn on_stream_closed(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        let st = &mut *self.st;
        debug!(
            conn = st.conn_id,
            stream = stream_id.value(),
            code = %error_code,
            "stream closed"
        );
        let Some(&msg_id) = st.by_stream.get(&stream_id.value()) else {
            return;
        };
        let Some(ex) = st.exchanges.get_mut(&msg_id) else {
            return;
        };
        if error_code == ErrorCode::RefusedStream && ex.state < ExchangeState::ReadingBody {
            ex.can_be_restarted = true;
        }
    }

    fn pull_request_data(&mut self, stream_id: StreamId, buf: &mut [u8]) -> Pull {
        let st = &mut *self.st;
        let Some(&msg_id) = st.by_stream.get(&stream_id.value()) else {
            return Pull::TemporaryFailure;
        };
        let Some(ex) = st.exchanges.get_mut(&msg_id) else {
            return Pull::TemporaryFailure;
        };

        match &mut ex.body {
            Some(RequestSource::Pollable(source)) => {
                // Fill the engine's buffer as far as the source allows
                // so END_STREAM rides the final data-carrying frame.
                let mut filled = 0;
                let mut eof = false;
                loop {
                    match source.read_nonblocking(&mut buf[filled..]) {
                        Ok(0) => {
                            eof = true;
                            break;
                        }
                        Ok(n) => {
                            filled += n;
                            if filled == buf.len() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            if filled > 0 {
                                break;
                            }
                            debug!(
                                conn = st.conn_id,
                                stream = stream_id.value(),
                                "body polling"
                            );
                            match source.poll_fd() {
                                Some(fd) => {
                                    if ex.body_watch.is_none() {
                                        match self.reactor.watch_fd(
                                            fd,
                                            Interest::READABLE,
                                            Watch::BodySource {
                                                stream_id: stream_id.value(),
                                            },
                                        ) {
                                            Ok(token) => ex.body_watch = Some(token),
                                            Err(e) => {
                                                if ex.error.is_none() {
                                                    ex.error = Some(Error::body(&e));
                                                }
                                                return Pull::TemporaryFailure;
                                            }
                                        }
                                    }
                                }
                                None => {
                                    self.reactor
                                        .defer(Action::ResumeStream(stream_id.value()));
                                }
                            }
                            return Pull::Deferred;
                        }
                        Err(e) => {
                            if filled > 0 {
                                break;
                            }
                            if ex.error.is_none() {
                                ex.error = Some(Error::body(&e));
                            }
                            return Pull::TemporaryFailure;
                        }
                    }
                }
                if filled > 0 {
                    debug!(
                        conn = st.conn_id,
                        stream = stream_id.value(),
                        "read {filled} body bytes"
                    );
                    log_request_chunk(ex, buf, filled);
                } else if eof {
                    debug!(conn = st.conn_id, stream = stream_id.value(), "body EOF");
                }
                Pull::Data { len: filled, eof }
            }
            Some(RequestSource::Opaque(_)) => {
                if !ex.latch.buffered.is_empty() {
                    let n = ex.latch.buffered.len().min(buf.len());
                    buf[..n].copy_from_slice(&ex.latch.buffered[..n]);
                    ex.latch.buffered.drain(..n);
                    debug!(
                        conn = st.conn_id,
                        stream = stream_id.value(),
                        "sending {n} buffered body bytes"
                    );
                    log_request_chunk(ex, buf, n);
                    Pull::Data { len: n, eof: false }
                } else if ex.latch.eof {
                    debug!(conn = st.conn_id, stream = stream_id.value(), "body EOF");
                    Pull::Data { len: 0, eof: true }
                } else if let Some(err) = ex.latch.error.take() {
                    ex.set_error(Error::body(&err));
                    Pull::TemporaryFailure
                } else {
                    if !ex.latch.read_pending {
                        debug!(
                            conn = st.conn_id,
                            stream = stream_id.value(),
                            "reading body off-path"
                        );
                        ex.latch.read_pending = true;
                        self.reactor.defer(Action::OpaqueRead {
                            msg_id,
                            len: buf.len(),
                        });
                    }
                    Pull::Deferred
                }
            }
            None => Pull::Data { len: 0, eof: true },
        }
    }
}

/// Run the content sniffer against the buffered body head. Without a
/// sniffer the stream advances immediately; `force` commits at end of
/// body even if the sniffer stays undecided.
fn try_sniff(ex: &mut Exchange, force: bool) {
    if ex.in_sniff || ex.state != ExchangeState::ReadDataStart {
        return;
    }
    ex.in_sniff = true;

    let has_sniffer = ex.msg.inner.borrow().sniffer.is_some();
    let decided = if !has_sniffer {
        true
    } else if let Some(chain) = ex.sink.clone() {
        let data = chain.borrow().sink.buffered().to_vec();
        let mut inner = ex.msg.inner.borrow_mut();
        let sniffer = inner.sniffer.as_mut().expect("sniffer");
        match sniffer.try_sniff(&data, force) {
            Some(sniffed) => {
                debug!("sniffed content: {sniffed}");
                inner.sniffed_type = Some(sniffed);
                true
            }
            None => force,
        }
    } else {
        true
    };

    if decided {
        ex.advance_from(ExchangeState::ReadDataStart, ExchangeState::ReadingBody);
    }
    ex.in_sniff = false;
}

/// Fire the request-data logger for a dispatched chunk. Logged at
/// dispatch time, not flush time: actual wire transmission happens
/// inside the protocol engine.
fn log_request_chunk(ex: &mut Exchange, buf: &[u8], n: usize) {
    let logger = ex.msg.inner.borrow_mut().request_logger.take();
    if let Some(mut logger) = logger {
        logger(&buf[..n]);
        ex.msg.inner.borrow_mut().request_logger = Some(logger);
    }
}
