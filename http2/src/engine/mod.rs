//! The callback-driven HTTP/2 protocol engine.
//!
//! [`Engine`] owns HPACK state, framing, settings, and flow-control
//! windows. A session drives it through two pump entry points:
//!
//! - [`Engine::feed_input`] consumes bytes read from the transport and
//!   fires receive-side hooks (`on_begin_frame`, `on_header`,
//!   `on_data_chunk`, `on_frame_received`, `on_stream_closed`).
//! - [`Engine::next_output_chunk`] serializes pending frames into an
//!   outbound chunk, pulling request body data through
//!   [`EngineHooks::pull_request_data`] and firing send-side hooks
//!   (`on_before_frame_send`, `on_frame_sent`, `on_frame_not_sent`).
//!
//! Hooks must not re-enter the engine; the borrow rules make that
//! impossible here, so any follow-up work a hook wants (writes, new
//! submissions) has to be recorded by the hook owner and performed after
//! the pump call returns.

mod stream;

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::frame::{
    DEFAULT_INITIAL_WINDOW_SIZE, DataFrame, ErrorCode, Frame, FrameDecoder, FrameEncoder,
    FrameError, FrameHeader, GoAwayFrame, HeadersFrame, PingFrame, Priority, PriorityFrame,
    RstStreamFrame, Setting, SettingId, SettingsFrame, StreamId, WindowUpdateFrame,
    CONNECTION_PREFACE,
};
use crate::hpack::{HeaderField, HpackDecoder, HpackEncoder, HpackError};

use stream::{Provider, RecvWindow, StreamState};

/// Minimum priority weight.
pub const MIN_WEIGHT: u16 = 1;
/// Default priority weight.
pub const DEFAULT_WEIGHT: u16 = 16;
/// Maximum priority weight.
pub const MAX_WEIGHT: u16 = 256;

/// Target size for one outbound chunk.
const CHUNK_TARGET: usize = 16_384;

/// Result of a request-body pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// `len` bytes were written into the buffer; `eof` ends the stream.
    Data { len: usize, eof: bool },
    /// No data available right now. The stream is suspended until
    /// [`Engine::resume_data`] is called.
    Deferred,
    /// The source failed; the stream is reset with INTERNAL_ERROR.
    TemporaryFailure,
}

/// How the request body is supplied at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBody {
    /// No body: HEADERS carries END_STREAM.
    None,
    /// Body is pulled through the callback immediately.
    Provided,
    /// Body exists but is withheld (Expect: 100-continue); armed later
    /// with [`Engine::submit_data`].
    Withheld,
}

/// Frame summary passed to hooks on both the send and receive paths.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub stream_id: StreamId,
    /// Payload length on the wire (excluding the 9-byte frame header).
    pub payload_len: usize,
    pub detail: FrameDetail,
}

/// Per-type detail for [`FrameInfo`].
#[derive(Debug, Clone)]
pub enum FrameDetail {
    Data {
        end_stream: bool,
    },
    Headers {
        end_stream: bool,
        end_headers: bool,
    },
    Priority,
    RstStream {
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
    },
    Ping {
        ack: bool,
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
    WindowUpdate {
        increment: u32,
    },
    Other,
}

impl FrameInfo {
    /// Frame type name for debug logging.
    pub fn type_name(&self) -> &'static str {
        match self.detail {
            FrameDetail::Data { .. } => "DATA",
            FrameDetail::Headers { .. } => "HEADERS",
            FrameDetail::Priority => "PRIORITY",
            FrameDetail::RstStream { .. } => "RST_STREAM",
            FrameDetail::Settings { .. } => "SETTINGS",
            FrameDetail::Ping { .. } => "PING",
            FrameDetail::GoAway { .. } => "GOAWAY",
            FrameDetail::WindowUpdate { .. } => "WINDOW_UPDATE",
            FrameDetail::Other => "UNKNOWN",
        }
    }

    /// END_STREAM flag for DATA and HEADERS frames.
    pub fn end_stream(&self) -> bool {
        match self.detail {
            FrameDetail::Data { end_stream } => end_stream,
            FrameDetail::Headers { end_stream, .. } => end_stream,
            _ => false,
        }
    }
}

/// Receive-side and send-side protocol callbacks.
///
/// All methods are invoked synchronously from inside `feed_input` or
/// `next_output_chunk`.
pub trait EngineHooks {
    fn on_begin_frame(&mut self, _hd: &FrameHeader) {}
    fn on_header(&mut self, _stream_id: StreamId, _name: &[u8], _value: &[u8]) {}
    fn on_frame_received(&mut self, _frame: &FrameInfo) {}
    fn on_data_chunk(&mut self, _stream_id: StreamId, _data: &[u8]) {}
    fn on_before_frame_send(&mut self, _frame: &FrameInfo) {}
    fn on_frame_sent(&mut self, _frame: &FrameInfo) {}
    fn on_frame_not_sent(&mut self, _frame: &FrameInfo, _error: &EngineError) {}
    fn on_stream_closed(&mut self, _stream_id: StreamId, _error_code: ErrorCode) {}

    /// Pull up to `buf.len()` bytes of request body for `stream_id`.
    fn pull_request_data(&mut self, stream_id: StreamId, buf: &mut [u8]) -> Pull;
}

/// Errors from the engine pump.
#[derive(Debug)]
pub enum EngineError {
    Frame(FrameError),
    Hpack(HpackError),
    Protocol(&'static str),
    FlowControl,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Frame(e) => write!(f, "frame error: {e}"),
            EngineError::Hpack(e) => write!(f, "header compression error: {e}"),
            EngineError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            EngineError::FlowControl => write!(f, "flow control violation"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<FrameError> for EngineError {
    fn from(e: FrameError) -> Self {
        EngineError::Frame(e)
    }
}

impl From<HpackError> for EngineError {
    fn from(e: HpackError) -> Self {
        EngineError::Hpack(e)
    }
}

/// Errors from submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The connection has exhausted its stream id space.
    StreamIdUnavailable,
    /// Session is terminated or draining; no new requests.
    SessionClosed,
    /// The referenced stream does not exist.
    UnknownStream,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::StreamIdUnavailable => write!(f, "stream id space exhausted"),
            SubmitError::SessionClosed => write!(f, "session closed"),
            SubmitError::UnknownStream => write!(f, "unknown stream"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Frames queued for serialization. HEADERS blocks are HPACK-encoded at
/// submission time; the queue is strictly FIFO so the encoder state and
/// the wire order agree.
enum Outbound {
    Preface,
    Settings(SettingsFrame),
    SettingsAck,
    Headers {
        stream_id: StreamId,
        block: Bytes,
        end_stream: bool,
        priority: Priority,
    },
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    WindowUpdate(WindowUpdateFrame),
    PingAck([u8; 8]),
    GoAway(GoAwayFrame),
}

/// Client-side HTTP/2 protocol engine.
pub struct Engine {
    frame_encoder: FrameEncoder,
    frame_decoder: FrameDecoder,
    hpack_encoder: HpackEncoder,
    hpack_decoder: HpackDecoder,

    streams: HashMap<u32, StreamState>,
    next_stream_id: u32,

    /// Remote-controlled connection send window.
    conn_send_window: i64,
    /// Our connection receive window.
    conn_recv: RecvWindow,
    /// Peer's SETTINGS_INITIAL_WINDOW_SIZE (per-stream send windows).
    remote_initial_window: i64,
    /// Our SETTINGS_INITIAL_WINDOW_SIZE (per-stream receive windows).
    local_initial_window: u32,

    inbuf: BytesMut,
    outbox: std::collections::VecDeque<Outbound>,
    /// Scratch buffer the pull callback writes into.
    scratch: Vec<u8>,

    /// Stream id currently mid header block (CONTINUATION pending).
    continuation_stream: Option<StreamId>,

    goaway_received: bool,
    goaway_last_stream_id: StreamId,
    terminated: bool,
    goaway_serialized: bool,
}

impl Engine {
    /// Create a client engine. The connection preface is queued for the
    /// first output chunk; the session is expected to follow up with
    /// `submit_settings` and `set_local_window_size`.
    pub fn client() -> Self {
        let mut outbox = std::collections::VecDeque::new();
        outbox.push_back(Outbound::Preface);

        Self {
            frame_encoder: FrameEncoder::new(),
            frame_decoder: FrameDecoder::new(),
            hpack_encoder: HpackEncoder::new(),
            hpack_decoder: HpackDecoder::new(),
            streams: HashMap::new(),
            next_stream_id: 1,
            conn_send_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
            conn_recv: RecvWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            remote_initial_window: i64::from(DEFAULT_INITIAL_WINDOW_SIZE),
            local_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            inbuf: BytesMut::with_capacity(16_384),
            outbox,
            scratch: vec![0; CHUNK_TARGET],
            continuation_stream: None,
            goaway_received: false,
            goaway_last_stream_id: StreamId::CONNECTION,
            terminated: false,
            goaway_serialized: false,
        }
    }

    // ── Submissions ────────────────────────────────────────────────────

    /// Queue HEADERS for a new request. Returns the assigned stream id.
    pub fn submit_request(
        &mut self,
        headers: &[HeaderField],
        weight: u16,
        body: RequestBody,
    ) -> Result<StreamId, SubmitError> {
        if self.terminated {
            return Err(SubmitError::SessionClosed);
        }
        if self.next_stream_id > 0x7FFF_FFFF {
            return Err(SubmitError::StreamIdUnavailable);
        }

        let stream_id = StreamId::new(self.next_stream_id);
        self.next_stream_id += 2;

        let mut block = Vec::new();
        self.hpack_encoder.encode(headers, &mut block);

        let provider = match body {
            RequestBody::None => Provider::None,
            RequestBody::Provided => Provider::Armed,
            RequestBody::Withheld => Provider::Unarmed,
        };
        self.streams.insert(
            stream_id.value(),
            StreamState::new(
                self.remote_initial_window,
                self.local_initial_window,
                provider,
                weight,
            ),
        );

        self.outbox.push_back(Outbound::Headers {
            stream_id,
            block: Bytes::from(block),
            end_stream: body == RequestBody::None,
            priority: Priority::from_weight(weight),
        });

        Ok(stream_id)
    }

    /// Arm the withheld request body provider; END_STREAM follows the
    /// final pulled chunk.
    pub fn submit_data(&mut self, stream_id: StreamId) -> Result<(), SubmitError> {
        let stream = self
            .streams
            .get_mut(&stream_id.value())
            .ok_or(SubmitError::UnknownStream)?;
        stream.provider = Provider::Armed;
        Ok(())
    }

    /// Queue a PRIORITY frame for a live stream.
    pub fn submit_priority(&mut self, stream_id: StreamId, weight: u16) -> Result<(), SubmitError> {
        let stream = self
            .streams
            .get_mut(&stream_id.value())
            .ok_or(SubmitError::UnknownStream)?;
        stream.weight = weight;
        self.outbox.push_back(Outbound::Priority(PriorityFrame {
            stream_id,
            priority: Priority::from_weight(weight),
        }));
        Ok(())
    }

    /// Queue RST_STREAM. Further frames received on the stream are
    /// discarded (flow control is still accounted).
    pub fn submit_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if let Some(stream) = self.streams.get_mut(&stream_id.value()) {
            stream.reset_local = true;
            stream.local_closed = true;
        }
        self.outbox.push_back(Outbound::RstStream(RstStreamFrame {
            stream_id,
            error_code: error_code.to_u32(),
        }));
    }

    /// Queue our SETTINGS and apply the local side effects.
    pub fn submit_settings(&mut self, settings: &[Setting]) {
        for setting in settings {
            match setting.id {
                SettingId::InitialWindowSize => {
                    self.local_initial_window = setting.value;
                }
                SettingId::HeaderTableSize => {
                    self.hpack_decoder.set_max_table_size(setting.value as usize);
                }
                _ => {}
            }
        }
        self.outbox.push_back(Outbound::Settings(SettingsFrame {
            ack: false,
            settings: settings.to_vec(),
        }));
    }

    /// Raise the connection-level receive window (stream 0).
    pub fn set_local_window_size(&mut self, size: u32) {
        let current = self.conn_recv.window();
        let target = i64::from(size);
        if target > current {
            let increment = (target - current) as u32;
            self.conn_recv.grow(increment);
            self.outbox.push_back(Outbound::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId::CONNECTION,
                increment,
            }));
        }
    }

    /// Queue GOAWAY and stop accepting new requests. Idempotent.
    pub fn terminate_session(&mut self, error_code: ErrorCode) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.outbox.push_back(Outbound::GoAway(GoAwayFrame {
            // Client-side: no peer-initiated streams were processed.
            last_stream_id: StreamId::CONNECTION,
            error_code: error_code.to_u32(),
            debug_data: Bytes::new(),
        }));
    }

    /// Resume a stream whose provider previously returned `Deferred`.
    pub fn resume_data(&mut self, stream_id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&stream_id.value()) {
            if stream.provider == Provider::Deferred {
                stream.provider = Provider::Armed;
            }
        }
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// Whether a new request could be submitted.
    pub fn is_request_allowed(&self) -> bool {
        !self.terminated && !self.goaway_received && self.next_stream_id <= 0x7FFF_FFFF
    }

    /// Remote (send) window for a stream.
    pub fn stream_remote_window(&self, stream_id: StreamId) -> i64 {
        self.streams
            .get(&stream_id.value())
            .map_or(0, |s| s.send_window)
    }

    /// Remote (send) window for the connection.
    pub fn session_remote_window(&self) -> i64 {
        self.conn_send_window
    }

    /// Whether the peer sent GOAWAY.
    pub fn goaway_received(&self) -> bool {
        self.goaway_received
    }

    /// The engine wants transport reads until it is fully shut down.
    pub fn wants_read(&self) -> bool {
        !(self.terminated && self.goaway_serialized)
    }

    /// The engine has frames to serialize right now.
    pub fn wants_write(&self) -> bool {
        if !self.outbox.is_empty() {
            return true;
        }
        self.streams.values().any(|s| {
            s.wants_send() && (s.send_window > 0 && self.conn_send_window > 0)
        })
    }

    // ── Pump: input ────────────────────────────────────────────────────

    /// Feed bytes received from the transport, firing receive hooks for
    /// every complete frame.
    pub fn feed_input(
        &mut self,
        data: &[u8],
        hooks: &mut dyn EngineHooks,
    ) -> Result<usize, EngineError> {
        self.inbuf.extend_from_slice(data);

        loop {
            let Some(hd) = self.frame_decoder.peek_header(&self.inbuf) else {
                break;
            };
            if self.inbuf.len() < crate::frame::FRAME_HEADER_SIZE + hd.length as usize {
                break;
            }

            hooks.on_begin_frame(&hd);

            let frame = self
                .frame_decoder
                .decode(&mut self.inbuf)?
                .expect("frame was complete");
            self.handle_frame(frame, hooks)?;
        }

        Ok(data.len())
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), EngineError> {
        // A header block in progress admits only CONTINUATION frames for
        // the same stream (RFC 7540 Section 6.2).
        if let Some(expected) = self.continuation_stream {
            match &frame {
                Frame::Continuation(f) if f.stream_id == expected => {}
                _ => return Err(EngineError::Protocol("expected CONTINUATION")),
            }
        }

        match frame {
            Frame::Data(f) => self.recv_data(f, hooks),
            Frame::Headers(f) => self.recv_headers(f, hooks),
            Frame::Continuation(f) => self.recv_continuation(f, hooks),
            Frame::RstStream(f) => {
                let error_code = ErrorCode::from_u32(f.error_code);
                if let Some(mut stream) = self.streams.remove(&f.stream_id.value()) {
                    stream.local_closed = true;
                    stream.remote_closed = true;
                }
                hooks.on_frame_received(&FrameInfo {
                    stream_id: f.stream_id,
                    payload_len: 4,
                    detail: FrameDetail::RstStream { error_code },
                });
                hooks.on_stream_closed(f.stream_id, error_code);
                Ok(())
            }
            Frame::Settings(f) => self.recv_settings(f, hooks),
            Frame::Ping(f) => {
                if !f.ack {
                    self.outbox.push_back(Outbound::PingAck(f.data));
                }
                hooks.on_frame_received(&FrameInfo {
                    stream_id: StreamId::CONNECTION,
                    payload_len: 8,
                    detail: FrameDetail::Ping { ack: f.ack },
                });
                Ok(())
            }
            Frame::GoAway(f) => {
                self.goaway_received = true;
                self.goaway_last_stream_id = f.last_stream_id;
                hooks.on_frame_received(&FrameInfo {
                    stream_id: StreamId::CONNECTION,
                    payload_len: 8 + f.debug_data.len(),
                    detail: FrameDetail::GoAway {
                        last_stream_id: f.last_stream_id,
                        error_code: ErrorCode::from_u32(f.error_code),
                    },
                });
                Ok(())
            }
            Frame::WindowUpdate(f) => {
                if f.stream_id.is_connection_level() {
                    self.conn_send_window += i64::from(f.increment);
                } else if let Some(stream) = self.streams.get_mut(&f.stream_id.value()) {
                    stream.send_window += i64::from(f.increment);
                }
                hooks.on_frame_received(&FrameInfo {
                    stream_id: f.stream_id,
                    payload_len: 4,
                    detail: FrameDetail::WindowUpdate {
                        increment: f.increment,
                    },
                });
                Ok(())
            }
            Frame::PushPromise(_) => {
                // We always send ENABLE_PUSH=0.
                Err(EngineError::Protocol("PUSH_PROMISE with push disabled"))
            }
            Frame::Priority(_) | Frame::Unknown(_) => Ok(()),
        }
    }

    fn recv_data(&mut self, f: DataFrame, hooks: &mut dyn EngineHooks) -> Result<(), EngineError> {
        let len = f.data.len() as u32;

        // Connection-level accounting applies even to discarded streams.
        self.conn_recv.consume(len);
        if self.conn_recv.window() < 0 {
            return Err(EngineError::FlowControl);
        }
        if let Some(increment) = self.conn_recv.take_update() {
            self.outbox.push_back(Outbound::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId::CONNECTION,
                increment,
            }));
        }

        let mut deliver = false;
        if let Some(stream) = self.streams.get_mut(&f.stream_id.value()) {
            stream.recv.consume(len);
            if stream.recv.window() < 0 {
                return Err(EngineError::FlowControl);
            }
            deliver = !stream.reset_local;
            if deliver && !f.end_stream {
                if let Some(increment) = stream.recv.take_update() {
                    self.outbox.push_back(Outbound::WindowUpdate(WindowUpdateFrame {
                        stream_id: f.stream_id,
                        increment,
                    }));
                }
            }
            if f.end_stream {
                stream.remote_closed = true;
            }
        }

        if deliver {
            hooks.on_data_chunk(f.stream_id, &f.data);
            hooks.on_frame_received(&FrameInfo {
                stream_id: f.stream_id,
                payload_len: f.data.len(),
                detail: FrameDetail::Data {
                    end_stream: f.end_stream,
                },
            });
        }

        self.reap(f.stream_id, hooks);
        Ok(())
    }

    fn recv_headers(
        &mut self,
        f: HeadersFrame,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), EngineError> {
        if !self.streams.contains_key(&f.stream_id.value()) {
            // Stale stream; decode anyway to keep HPACK state coherent.
            if f.end_headers {
                self.hpack_decoder.decode(&f.header_block)?;
            }
            return Ok(());
        }

        if f.end_headers {
            let stream = self.streams.get_mut(&f.stream_id.value()).expect("stream");
            let block = if stream.header_buf.is_empty() {
                f.header_block.to_vec()
            } else {
                stream.header_buf.extend_from_slice(&f.header_block);
                std::mem::take(&mut stream.header_buf)
            };
            self.continuation_stream = None;
            self.finish_header_block(f.stream_id, &block, f.end_stream, hooks)
        } else {
            let stream = self.streams.get_mut(&f.stream_id.value()).expect("stream");
            stream.header_buf.extend_from_slice(&f.header_block);
            stream.headers_end_stream = f.end_stream;
            self.continuation_stream = Some(f.stream_id);
            Ok(())
        }
    }

    fn recv_continuation(
        &mut self,
        f: crate::frame::ContinuationFrame,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), EngineError> {
        let Some(stream) = self.streams.get_mut(&f.stream_id.value()) else {
            return Ok(());
        };
        stream.header_buf.extend_from_slice(&f.header_block);

        if f.end_headers {
            self.continuation_stream = None;
            let (block, end_stream) = {
                let stream = self.streams.get_mut(&f.stream_id.value()).expect("stream");
                (
                    std::mem::take(&mut stream.header_buf),
                    stream.headers_end_stream,
                )
            };
            self.finish_header_block(f.stream_id, &block, end_stream, hooks)?;
        }
        Ok(())
    }

    fn finish_header_block(
        &mut self,
        stream_id: StreamId,
        block: &[u8],
        end_stream: bool,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), EngineError> {
        let fields = self.hpack_decoder.decode(block)?;

        let deliver = self
            .streams
            .get(&stream_id.value())
            .is_some_and(|s| !s.reset_local);

        if deliver {
            for field in &fields {
                hooks.on_header(stream_id, &field.name, &field.value);
            }
        }

        if let Some(stream) = self.streams.get_mut(&stream_id.value()) {
            if end_stream {
                stream.remote_closed = true;
            }
        }

        if deliver {
            hooks.on_frame_received(&FrameInfo {
                stream_id,
                payload_len: block.len(),
                detail: FrameDetail::Headers {
                    end_stream,
                    end_headers: true,
                },
            });
        }

        self.reap(stream_id, hooks);
        Ok(())
    }

    fn recv_settings(
        &mut self,
        f: SettingsFrame,
        hooks: &mut dyn EngineHooks,
    ) -> Result<(), EngineError> {
        if f.ack {
            hooks.on_frame_received(&FrameInfo {
                stream_id: StreamId::CONNECTION,
                payload_len: 0,
                detail: FrameDetail::Settings { ack: true },
            });
            return Ok(());
        }

        for setting in &f.settings {
            match setting.id {
                SettingId::HeaderTableSize => {
                    self.hpack_encoder.set_table_size(setting.value as usize);
                }
                SettingId::InitialWindowSize => {
                    if setting.value > 0x7FFF_FFFF {
                        return Err(EngineError::FlowControl);
                    }
                    let delta = i64::from(setting.value) - self.remote_initial_window;
                    self.remote_initial_window = i64::from(setting.value);
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                SettingId::MaxFrameSize => {
                    self.frame_encoder.set_max_frame_size(setting.value);
                }
                _ => {}
            }
        }

        self.outbox.push_back(Outbound::SettingsAck);
        hooks.on_frame_received(&FrameInfo {
            stream_id: StreamId::CONNECTION,
            payload_len: f.settings.len() * 6,
            detail: FrameDetail::Settings { ack: false },
        });
        Ok(())
    }

    /// Drop fully closed streams and report their closure once.
    fn reap(&mut self, stream_id: StreamId, hooks: &mut dyn EngineHooks) {
        let closed = self
            .streams
            .get(&stream_id.value())
            .is_some_and(|s| s.is_closed());
        if closed {
            self.streams.remove(&stream_id.value());
            hooks.on_stream_closed(stream_id, ErrorCode::NoError);
        }
    }

    // ── Pump: output ───────────────────────────────────────────────────

    /// Serialize the next outbound chunk, or `None` when there is
    /// nothing to send. The previous chunk must be fully written before
    /// this is called again.
    pub fn next_output_chunk(&mut self, hooks: &mut dyn EngineHooks) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(CHUNK_TARGET);

        loop {
            // Control frames and queued HEADERS drain first, in FIFO
            // order (HPACK state and wire order must agree).
            while let Some(item) = self.outbox.pop_front() {
                self.serialize(item, &mut buf, hooks);
            }
            if buf.len() >= CHUNK_TARGET {
                break;
            }
            if !self.generate_data(&mut buf, hooks) {
                break;
            }
        }

        if buf.is_empty() {
            None
        } else {
            Some(buf.freeze())
        }
    }

    fn serialize(&mut self, item: Outbound, buf: &mut BytesMut, hooks: &mut dyn EngineHooks) {
        let (frame, info) = match item {
            Outbound::Preface => {
                buf.extend_from_slice(CONNECTION_PREFACE);
                return;
            }
            Outbound::Settings(f) => {
                let info = FrameInfo {
                    stream_id: StreamId::CONNECTION,
                    payload_len: f.settings.len() * 6,
                    detail: FrameDetail::Settings { ack: false },
                };
                (Frame::Settings(f), info)
            }
            Outbound::SettingsAck => {
                let info = FrameInfo {
                    stream_id: StreamId::CONNECTION,
                    payload_len: 0,
                    detail: FrameDetail::Settings { ack: true },
                };
                (
                    Frame::Settings(SettingsFrame {
                        ack: true,
                        settings: Vec::new(),
                    }),
                    info,
                )
            }
            Outbound::Headers {
                stream_id,
                block,
                end_stream,
                priority,
            } => {
                // A request queued behind a received GOAWAY will never be
                // processed by the peer; refuse it locally so the upper
                // layer can restart it elsewhere.
                if self.goaway_received && stream_id > self.goaway_last_stream_id {
                    let info = FrameInfo {
                        stream_id,
                        payload_len: block.len(),
                        detail: FrameDetail::Headers {
                            end_stream,
                            end_headers: true,
                        },
                    };
                    let error = EngineError::Protocol("session draining");
                    hooks.on_frame_not_sent(&info, &error);
                    self.streams.remove(&stream_id.value());
                    hooks.on_stream_closed(stream_id, ErrorCode::RefusedStream);
                    return;
                }
                let info = FrameInfo {
                    stream_id,
                    payload_len: block.len() + 5,
                    detail: FrameDetail::Headers {
                        end_stream,
                        end_headers: true,
                    },
                };
                (
                    Frame::Headers(HeadersFrame {
                        stream_id,
                        end_stream,
                        end_headers: true,
                        priority: Some(priority),
                        header_block: block,
                    }),
                    info,
                )
            }
            Outbound::Priority(f) => {
                let info = FrameInfo {
                    stream_id: f.stream_id,
                    payload_len: 5,
                    detail: FrameDetail::Priority,
                };
                (Frame::Priority(f), info)
            }
            Outbound::RstStream(f) => {
                let info = FrameInfo {
                    stream_id: f.stream_id,
                    payload_len: 4,
                    detail: FrameDetail::RstStream {
                        error_code: ErrorCode::from_u32(f.error_code),
                    },
                };
                (Frame::RstStream(f), info)
            }
            Outbound::WindowUpdate(f) => {
                let info = FrameInfo {
                    stream_id: f.stream_id,
                    payload_len: 4,
                    detail: FrameDetail::WindowUpdate {
                        increment: f.increment,
                    },
                };
                (Frame::WindowUpdate(f), info)
            }
            Outbound::PingAck(data) => {
                let info = FrameInfo {
                    stream_id: StreamId::CONNECTION,
                    payload_len: 8,
                    detail: FrameDetail::Ping { ack: true },
                };
                (Frame::Ping(PingFrame { ack: true, data }), info)
            }
            Outbound::GoAway(f) => {
                let info = FrameInfo {
                    stream_id: StreamId::CONNECTION,
                    payload_len: 8 + f.debug_data.len(),
                    detail: FrameDetail::GoAway {
                        last_stream_id: f.last_stream_id,
                        error_code: ErrorCode::from_u32(f.error_code),
                    },
                };
                self.goaway_serialized = true;
                (Frame::GoAway(f), info)
            }
        };

        hooks.on_before_frame_send(&info);
        self.frame_encoder.encode(&frame, buf);
        hooks.on_frame_sent(&info);
    }

    /// Generate one DATA frame from the highest-weight sendable stream.
    /// Returns false when no stream can make progress.
    fn generate_data(&mut self, buf: &mut BytesMut, hooks: &mut dyn EngineHooks) -> bool {
        let max_frame = self.frame_encoder.max_frame_size() as usize;

        let candidate = self
            .streams
            .iter()
            .filter(|(_, s)| s.wants_send() && s.send_window > 0)
            .max_by_key(|(_, s)| s.weight)
            .map(|(&id, s)| (id, s.send_window));

        let Some((id, stream_window)) = candidate else {
            return false;
        };
        if self.conn_send_window <= 0 {
            return false;
        }

        let budget = (stream_window.min(self.conn_send_window) as usize)
            .min(max_frame)
            .min(self.scratch.len());
        let stream_id = StreamId::new(id);

        match hooks.pull_request_data(stream_id, &mut self.scratch[..budget]) {
            Pull::Data { len, eof } => {
                let len = len.min(budget);
                if len == 0 && !eof {
                    // Nothing produced; treat like a deferral to avoid
                    // spinning on an empty source.
                    if let Some(stream) = self.streams.get_mut(&id) {
                        stream.provider = Provider::Deferred;
                    }
                    return true;
                }

                self.conn_send_window -= len as i64;
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.send_window -= len as i64;
                    if eof {
                        stream.provider = Provider::Done;
                        stream.local_closed = true;
                    }
                }

                let info = FrameInfo {
                    stream_id,
                    payload_len: len,
                    detail: FrameDetail::Data { end_stream: eof },
                };
                hooks.on_before_frame_send(&info);
                let frame = Frame::Data(DataFrame {
                    stream_id,
                    end_stream: eof,
                    data: Bytes::copy_from_slice(&self.scratch[..len]),
                });
                self.frame_encoder.encode(&frame, buf);
                hooks.on_frame_sent(&info);

                self.reap(stream_id, hooks);
                true
            }
            Pull::Deferred => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.provider = Provider::Deferred;
                }
                true
            }
            Pull::TemporaryFailure => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.provider = Provider::Done;
                }
                self.submit_rst_stream(stream_id, ErrorCode::InternalError);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests;
