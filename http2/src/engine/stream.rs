//! Per-stream protocol state and receive-window accounting.

/// State of the request body provider for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Provider {
    /// No request body; END_STREAM went out with HEADERS.
    None,
    /// Body exists but is withheld (Expect: 100-continue).
    Unarmed,
    /// Body is being pulled through the callback.
    Armed,
    /// The source reported no data; waiting for `resume_data`.
    Deferred,
    /// END_STREAM has been emitted.
    Done,
}

/// Receive-window accounting with automatic update generation.
///
/// Consumed bytes accumulate until half the window is used, at which
/// point a WINDOW_UPDATE restoring the full window is due.
#[derive(Debug)]
pub(crate) struct RecvWindow {
    window: i64,
    consumed: u32,
    threshold: u32,
}

impl RecvWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            window: i64::from(initial),
            consumed: 0,
            threshold: initial / 2,
        }
    }

    pub fn window(&self) -> i64 {
        self.window
    }

    /// Account for received payload bytes.
    pub fn consume(&mut self, amount: u32) {
        self.window -= i64::from(amount);
        self.consumed += amount;
    }

    /// Grow the window base (local SETTINGS or stream-0 update).
    pub fn grow(&mut self, delta: u32) {
        self.window += i64::from(delta);
        self.threshold = self.threshold.max(delta / 2);
    }

    /// Take the pending WINDOW_UPDATE increment, if the threshold was hit.
    pub fn take_update(&mut self) -> Option<u32> {
        if self.consumed < self.threshold.max(1) {
            return None;
        }
        let increment = self.consumed;
        self.consumed = 0;
        self.window += i64::from(increment);
        Some(increment)
    }
}

/// Protocol-level state for one HTTP/2 stream.
#[derive(Debug)]
pub(crate) struct StreamState {
    /// Remote-controlled send window.
    pub send_window: i64,
    /// Our receive window.
    pub recv: RecvWindow,
    /// Request body provider state.
    pub provider: Provider,
    /// Priority weight (1-256) used when scheduling DATA.
    pub weight: u16,
    /// We sent END_STREAM (or RST_STREAM).
    pub local_closed: bool,
    /// Peer sent END_STREAM (or RST_STREAM).
    pub remote_closed: bool,
    /// We submitted RST_STREAM; incoming frames are discarded.
    pub reset_local: bool,
    /// Header block fragments awaiting END_HEADERS.
    pub header_buf: Vec<u8>,
    /// END_STREAM flag seen on the HEADERS frame that opened the block.
    pub headers_end_stream: bool,
}

impl StreamState {
    pub fn new(send_window: i64, recv_window: u32, provider: Provider, weight: u16) -> Self {
        Self {
            send_window,
            recv: RecvWindow::new(recv_window),
            provider,
            weight,
            local_closed: provider == Provider::None,
            remote_closed: false,
            reset_local: false,
            header_buf: Vec::new(),
            headers_end_stream: false,
        }
    }

    /// Stream is fully closed on both sides.
    pub fn is_closed(&self) -> bool {
        self.local_closed && self.remote_closed
    }

    /// Stream has body data it could send right now (modulo windows).
    pub fn wants_send(&self) -> bool {
        self.provider == Provider::Armed && !self.reset_local
    }
}
