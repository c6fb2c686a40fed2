//! Per-exchange state: one in-flight request/response on the session.

use std::cell::RefCell;
use std::rc::Rc;

use http2::StreamId;

use crate::cancel::Cancellable;
use crate::error::Error;
use crate::message::Message;
use crate::pump::{RequestSource, SourceLatch};
use crate::sink::SinkChain;

/// Progress of one exchange. Strictly monotone; a backwards transition
/// is a defect and is refused with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExchangeState {
    None,
    WriteHeaders,
    WriteData,
    WriteDone,
    ReadHeaders,
    ReadDataStart,
    ReadingBody,
    ReadDone,
}

impl ExchangeState {
    pub fn name(self) -> &'static str {
        match self {
            ExchangeState::None => "NONE",
            ExchangeState::WriteHeaders => "WRITE_HEADERS",
            ExchangeState::WriteData => "WRITE_DATA",
            ExchangeState::WriteDone => "WRITE_DONE",
            ExchangeState::ReadHeaders => "READ_HEADERS",
            ExchangeState::ReadDataStart => "READ_DATA_START",
            ExchangeState::ReadingBody => "READING_BODY",
            ExchangeState::ReadDone => "READ_DONE",
        }
    }
}

/// How an exchange ended, reported to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The full response was read.
    Complete,
    /// The exchange ended before the response finished.
    Interrupted,
}

pub(crate) type CompletionFn = Box<dyn FnOnce(&Message, Completion)>;
pub(crate) type WaiterFn = Box<dyn FnOnce(Result<(), Error>)>;

/// A one-shot async waiter registered by the upper layer.
pub(crate) struct Waiter {
    pub done: WaiterFn,
    pub cancel: Cancellable,
}

/// Session-side state for one in-flight message.
pub(crate) struct Exchange {
    pub msg: Message,
    /// Assigned by the protocol engine at submission.
    pub stream_id: Option<StreamId>,
    pub state: ExchangeState,
    /// First error wins; later ones are dropped.
    pub error: Option<Error>,
    pub paused: bool,
    pub can_be_restarted: bool,
    pub expect_continue: bool,
    /// Re-entrancy guard for content sniffing.
    pub in_sniff: bool,

    pub waiter: Option<Waiter>,
    pub completion: Option<CompletionFn>,

    /// Request body source, moved out of the message at submission.
    pub body: Option<RequestSource>,
    /// Latched outcome of off-path opaque-source reads.
    pub latch: SourceLatch,
    /// Reactor token watching a pollable source's fd, if any.
    pub body_watch: Option<usize>,

    /// Response body sink, created when the first DATA frame begins.
    pub sink: Option<Rc<RefCell<SinkChain>>>,
}

impl Exchange {
    pub fn new(msg: Message, completion: CompletionFn) -> Self {
        let (expect_continue, body) = {
            let mut inner = msg.inner.borrow_mut();
            let body = inner.body.take();
            (body.is_some() && inner.expects_continue(), body)
        };
        Self {
            msg,
            stream_id: None,
            state: ExchangeState::None,
            error: None,
            paused: false,
            can_be_restarted: false,
            expect_continue,
            in_sniff: false,
            waiter: None,
            completion: Some(completion),
            body,
            latch: SourceLatch::default(),
            body_watch: None,
            sink: None,
        }
    }

    /// Record the first error; later errors are dropped.
    pub fn set_error(&mut self, error: Error) {
        if self.error.is_none() {
            tracing::debug!(
                stream = self.stream_id.map_or(0, |id| id.value()),
                %error,
                "exchange error"
            );
            self.error = Some(error);
        }
    }

    /// Advance the state machine. Warns when `from` does not match and
    /// refuses to move backwards.
    pub fn advance_from(&mut self, from: ExchangeState, to: ExchangeState) {
        if self.state != from {
            tracing::warn!(
                "unexpected state change {} -> {}, expected from {}",
                self.state.name(),
                to.name(),
                from.name()
            );
        }
        if to < self.state {
            tracing::warn!(
                "refusing backwards state change {} -> {}",
                self.state.name(),
                to.name()
            );
            return;
        }
        tracing::debug!(
            stream = self.stream_id.map_or(0, |id| id.value()),
            "state {} -> {}",
            self.state.name(),
            to.name()
        );
        self.state = to;
    }

    /// Strip everything but the stream id bookkeeping; the exchange is
    /// about to sit in the closing registry until its RST_STREAM is
    /// flushed.
    pub fn close(&mut self) {
        self.body = None;
        self.sink = None;
        self.latch = SourceLatch::default();
        self.waiter = None;
        self.completion = None;
    }
}
