//! Session and stream error kinds.

use std::io;

use http2::ErrorCode;

/// Errors surfaced to waiters and completion callbacks.
///
/// The first error recorded on an exchange wins; session-level errors
/// are copied into each live exchange when its status is checked.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The operation was cancelled by the caller.
    #[error("operation was cancelled")]
    Cancelled,

    /// Reading or writing the transport failed.
    #[error("transport error: {message}")]
    Transport {
        kind: io::ErrorKind,
        message: String,
    },

    /// The transport reached EOF with exchanges still in flight.
    #[error("connection closed unexpectedly")]
    Disconnected,

    /// The protocol engine rejected the peer's bytes.
    #[error("HTTP/2 protocol error: {0}")]
    Protocol(String),

    /// Peer refused the stream before processing it; safe to retry on
    /// another connection.
    #[error("stream refused by peer")]
    StreamRefused,

    /// Peer reset the stream.
    #[error("stream reset by peer: {0}")]
    StreamReset(ErrorCode),

    /// Session-wide failure reported by GOAWAY.
    #[error("session error: {0}")]
    Session(ErrorCode),

    /// No stream ids left on this connection; retry on a fresh one.
    #[error("stream id space exhausted")]
    StreamIdExhausted,

    /// The request body source failed.
    #[error("request body error: {message}")]
    Body {
        kind: io::ErrorKind,
        message: String,
    },
}

impl Error {
    /// Build a transport error from an I/O error.
    pub(crate) fn transport(err: &io::Error) -> Self {
        Error::Transport {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Build a body-source error from an I/O error.
    pub(crate) fn body(err: &io::Error) -> Self {
        Error::Body {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Errors that flip the queue item to "restarting" rather than
    /// failing the request terminally.
    pub fn is_restartable(&self) -> bool {
        matches!(self, Error::StreamRefused | Error::StreamIdExhausted)
    }
}
