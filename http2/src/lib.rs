//! http2 - client-side HTTP/2 protocol engine.
//!
//! This crate owns everything below the session layer: frame encoding and
//! decoding, HPACK header compression, settings, flow-control windows, and
//! the callback-driven [`Engine`] that a session drives with raw bytes.
//!
//! The engine is sans-I/O. Bytes read from the transport are handed to
//! [`Engine::feed_input`]; outgoing bytes are pulled with
//! [`Engine::next_output_chunk`]. Both entry points deliver protocol events
//! synchronously through an [`EngineHooks`] implementation supplied by the
//! caller, including the pull callback that asks for request body data.
//!
//! # Architecture
//!
//! - `frame`: frame types, encoding, and decoding
//! - `hpack`: HPACK header compression (RFC 7541)
//! - `engine`: connection-level protocol state, submissions, and the pump
//!
//! The engine never touches a socket and never blocks. Anything that looks
//! like scheduling (deferred body reads, write readiness) is the caller's
//! problem; the engine only reports "wants read" / "wants write".

pub mod engine;
pub mod frame;
pub mod hpack;

pub use frame::{
    CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE, DataFrame, ErrorCode, FRAME_HEADER_SIZE, Frame, FrameDecoder,
    FrameEncoder, FrameError, FrameHeader, FrameType, GoAwayFrame, HeadersFrame, PingFrame,
    Priority, RstStreamFrame, Setting, SettingId, SettingsFrame, StreamId, WindowUpdateFrame,
};

pub use hpack::{HeaderField, HpackDecoder, HpackEncoder};

pub use engine::{
    DEFAULT_WEIGHT, Engine, EngineError, EngineHooks, FrameDetail, FrameInfo, MAX_WEIGHT,
    MIN_WEIGHT, Pull, RequestBody, SubmitError,
};
