//! muxio - client-side HTTP/2 multiplexing session engine.
//!
//! This crate sits between a high-level HTTP message API and a raw
//! bidirectional byte stream, and drives any number of concurrent
//! request/response exchanges over a single connection. It owns the
//! per-connection protocol session (via the `http2` engine), per-stream
//! lifecycles, request body pumping, response body assembly, flow
//! control driving, priorities, graceful shutdown, and error
//! propagation.
//!
//! # Architecture
//!
//! - [`Session`]: one per transport connection. Registers exchanges,
//!   pumps the protocol engine in both directions, and dispatches
//!   per-stream waiters.
//! - [`Message`]: the request/response handle, built with
//!   [`MessageBuilder`].
//! - [`driver::Transport`]: the byte stream the session drives;
//!   [`driver::TcpTransport`] for real sockets, anything else for
//!   tests and tunnels.
//! - [`sink::ResponseBody`]: demand-driven body reader that can pump
//!   the session itself when it runs dry.
//!
//! Everything runs on one thread: protocol callbacks, I/O, and waiter
//! completion all happen on the loop that owns the session.
//!
//! # Example
//!
//! ```rust,ignore
//! use muxio::{Cancellable, Message, Session};
//! use muxio::driver::TcpTransport;
//! use std::io::Read;
//!
//! let transport = TcpTransport::new(tcp_stream)?;
//! let session = Session::new(Box::new(transport), 1)?;
//!
//! let msg = Message::get("https", "example.com", "/");
//! session.send(&msg, |_, _| {});
//! session.run_until_read(&msg, &Cancellable::new())?;
//!
//! let mut body = Vec::new();
//! session.response_body(&msg).read_to_end(&mut body)?;
//! session.finished(&msg);
//! ```

pub mod driver;
pub mod metrics;
pub mod pump;
pub mod sink;

mod cancel;
mod error;
mod exchange;
mod message;
mod session;

pub use cancel::Cancellable;
pub use error::Error;
pub use exchange::{Completion, ExchangeState};
pub use message::{Message, MessageBuilder, Priority};
pub use metrics::MessageMetrics;
pub use pump::{BufSource, OpaqueSource, PollableSource, RequestSource};
pub use session::Session;
pub use sink::{BodySink, ContentDecoder, ContentSniffer, ResponseBody};
