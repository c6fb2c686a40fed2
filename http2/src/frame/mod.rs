//! HTTP/2 framing (RFC 7540 Sections 4 and 6).
//!
//! Frames are modeled as one struct per type plus the [`Frame`] enum.
//! [`FrameEncoder`] serializes frames into a `BytesMut`; [`FrameDecoder`]
//! incrementally parses frames out of a receive buffer, returning
//! `Ok(None)` until a complete frame is available.

mod decode;
mod encode;
mod error;
mod types;

pub use decode::FrameDecoder;
pub use encode::FrameEncoder;
pub use error::{ErrorCode, FrameError};
pub use types::{
    ContinuationFrame, DataFrame, Frame, FrameHeader, FrameType, GoAwayFrame, HeadersFrame,
    PingFrame, Priority, PriorityFrame, PushPromiseFrame, RstStreamFrame, Setting, SettingId,
    SettingsFrame, StreamId, UnknownFrame, WindowUpdateFrame, flags,
};

/// Client connection preface (RFC 7540 Section 3.5).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default SETTINGS_MAX_FRAME_SIZE (RFC 7540 Section 6.5.2).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Default SETTINGS_INITIAL_WINDOW_SIZE.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// Default SETTINGS_HEADER_TABLE_SIZE.
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4_096;
