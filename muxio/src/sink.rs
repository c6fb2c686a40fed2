//! Response body sink and the consumer-side reader.
//!
//! DATA payloads are pushed into a [`BodySink`] as they arrive from the
//! protocol engine; the consumer drains it through [`ResponseBody`]. A
//! read that finds the sink empty but not complete drives one blocking
//! read on the owning session and retries, so a consumer can pull a
//! body to EOF without running the loop itself.

use std::cell::RefCell;
use std::io::{self, Read};
use std::rc::{Rc, Weak};

use bytes::{Buf, BytesMut};

use crate::session::SessionCore;

/// Transforms response body bytes (content decoding). Identity when
/// absent.
pub trait ContentDecoder {
    /// Decode one chunk.
    fn decode(&mut self, chunk: &[u8]) -> Vec<u8>;

    /// Flush any buffered tail at end of body.
    fn finish(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

/// Decides a content type from the first decoded body bytes. The
/// stream does not advance to the reading state until the sniffer
/// commits (or end of body forces it).
pub trait ContentSniffer {
    /// Return the sniffed type once enough bytes are buffered. `force`
    /// is set at end of body; the sniffer must commit then.
    fn try_sniff(&mut self, data: &[u8], force: bool) -> Option<String>;
}

/// Demand-driven byte queue fed by DATA frames.
#[derive(Debug, Default)]
pub struct BodySink {
    buf: BytesMut,
    completed: bool,
}

impl BodySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append decoded body bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Mark end of body (END_STREAM observed).
    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// EOF: nothing buffered and the body is complete.
    pub fn is_eof(&self) -> bool {
        self.completed && self.buf.is_empty()
    }

    /// Currently buffered bytes (consumed by `read`).
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Drain up to `buf.len()` bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.buf.len().min(buf.len());
        buf[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        n
    }
}

/// A sink with its decoding stage. DATA payloads pass through the
/// decoder before they land in the sink.
pub(crate) struct SinkChain {
    pub sink: BodySink,
    decoder: Option<Box<dyn ContentDecoder>>,
}

impl SinkChain {
    pub fn new(decoder: Option<Box<dyn ContentDecoder>>) -> Self {
        Self {
            sink: BodySink::new(),
            decoder,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        match &mut self.decoder {
            Some(decoder) => {
                let decoded = decoder.decode(data);
                self.sink.push(&decoded);
            }
            None => self.sink.push(data),
        }
    }

    pub fn complete(&mut self) {
        if let Some(decoder) = &mut self.decoder {
            let tail = decoder.finish();
            self.sink.push(&tail);
        }
        self.sink.complete();
    }
}

/// Consumer handle for a response body.
///
/// Holds the session weakly: the reader must not keep the session
/// alive, and a read after the session is gone fails cleanly.
pub struct ResponseBody {
    pub(crate) session: Weak<RefCell<SessionCore>>,
    pub(crate) msg_id: u64,
    pub(crate) chain: Option<Rc<RefCell<SinkChain>>>,
    pub(crate) eof_reported: bool,
}

impl ResponseBody {
    /// Report EOF to the session once: advances the exchange to its
    /// terminal read state and stamps the response-end time.
    fn report_eof(&mut self) {
        if self.eof_reported {
            return;
        }
        self.eof_reported = true;
        if let Some(session) = self.session.upgrade() {
            session.borrow_mut().on_body_eof(self.msg_id);
        }
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(chain) = self.chain.clone() else {
            // Bodyless response (e.g. 204 No Content).
            self.report_eof();
            return Ok(0);
        };

        loop {
            {
                let mut chain = chain.borrow_mut();
                let n = chain.sink.read(buf);
                if n > 0 {
                    return Ok(n);
                }
                if chain.sink.is_completed() {
                    drop(chain);
                    self.report_eof();
                    return Ok(0);
                }
            }

            // Empty but not complete: drive one blocking read on the
            // session, then retry.
            let Some(session) = self.session.upgrade() else {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "session was destroyed",
                ));
            };
            session.borrow_mut().pump_for_body()?;
        }
    }
}
