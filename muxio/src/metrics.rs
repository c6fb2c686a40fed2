//! Per-message metrics and session-wide counters.

use std::time::Instant;

use metriken::{metric, Counter};

/// Byte counters and timestamps for one request/response exchange.
///
/// Frame-header overhead is included in the `*_bytes_*` counters;
/// `request_body_size` counts payload bytes only. All counters are
/// monotone non-decreasing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageMetrics {
    pub request_header_bytes_sent: u64,
    pub request_body_bytes_sent: u64,
    pub request_body_size: u64,
    pub response_header_bytes_received: u64,
    pub response_body_bytes_received: u64,
    pub response_start: Option<Instant>,
    pub response_end: Option<Instant>,
}

#[metric(
    name = "muxio/bytes/received",
    description = "Bytes fed into the protocol engine"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "muxio/bytes/sent",
    description = "Bytes written to the transport"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "muxio/streams/opened",
    description = "Streams submitted to the protocol engine"
)]
pub static STREAMS_OPENED: Counter = Counter::new();

#[metric(
    name = "muxio/streams/completed",
    description = "Streams finished after a complete response"
)]
pub static STREAMS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "muxio/streams/interrupted",
    description = "Streams finished before a complete response"
)]
pub static STREAMS_INTERRUPTED: Counter = Counter::new();

#[metric(
    name = "muxio/session/goaway_received",
    description = "GOAWAY frames received from peers"
)]
pub static GOAWAY_RECEIVED: Counter = Counter::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_default_to_zero() {
        let metrics = MessageMetrics::default();
        assert_eq!(metrics.request_header_bytes_sent, 0);
        assert_eq!(metrics.response_body_bytes_received, 0);
        assert!(metrics.response_start.is_none());
        assert!(metrics.response_end.is_none());
    }

    #[test]
    fn counters_increment() {
        let before = BYTES_RECEIVED.value();
        BYTES_RECEIVED.add(42);
        assert_eq!(BYTES_RECEIVED.value(), before + 42);
    }
}
