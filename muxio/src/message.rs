//! The HTTP message handle the session multiplexes.
//!
//! A [`Message`] carries the request (method, target, headers, body
//! source, priority) and stages the response (status, headers) as the
//! exchange progresses. Handles are cheap clones sharing one interior;
//! the session keys its registries by [`Message::id`].

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::MessageMetrics;
use crate::pump::RequestSource;
use crate::sink::{ContentDecoder, ContentSniffer};

/// Five-level request priority, mapped onto HTTP/2 stream weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl Priority {
    /// Map to an HTTP/2 weight in `[MIN_WEIGHT..MAX_WEIGHT]`.
    pub fn weight(self) -> u16 {
        match self {
            Priority::VeryLow => http2::MIN_WEIGHT,
            Priority::Low => (http2::DEFAULT_WEIGHT - http2::MIN_WEIGHT) / 2,
            Priority::Normal => http2::DEFAULT_WEIGHT,
            Priority::High => (http2::MAX_WEIGHT - http2::DEFAULT_WEIGHT) / 2,
            Priority::VeryHigh => http2::MAX_WEIGHT,
        }
    }
}

/// Request headers that must not appear on an HTTP/2 wire
/// (RFC 7540 Section 8.1.2.2), compared case-insensitively.
const FORBIDDEN_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn request_header_allowed(name: &str) -> bool {
    !FORBIDDEN_REQUEST_HEADERS
        .iter()
        .any(|forbidden| name.eq_ignore_ascii_case(forbidden))
}

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct MessageInner {
    pub id: u64,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
    /// Server-wide OPTIONS ping: `:path` becomes `*`.
    pub options_ping: bool,
    pub priority: Priority,
    pub headers: Vec<(String, String)>,

    /// Request body; moved into the exchange at submission.
    pub body: Option<RequestSource>,
    /// Content decoding stage; moved into the sink when it is created.
    pub decoder: Option<Box<dyn ContentDecoder>>,
    pub sniffer: Option<Box<dyn ContentSniffer>>,
    /// Fired for 1xx responses.
    pub informational: Option<Box<dyn FnMut(u16)>>,
    /// Fired for each request body chunk dispatched to the engine.
    pub request_logger: Option<Box<dyn FnMut(&[u8])>>,

    // Staged response.
    pub status: u16,
    pub response_headers: Vec<(String, String)>,
    pub sniffed_type: Option<String>,

    pub metrics: MessageMetrics,
    /// Set when the exchange failed restartably; the owner should retry
    /// on a fresh connection.
    pub restarting: bool,
}

impl MessageInner {
    /// `:authority`, omitting the scheme's default port.
    pub fn authority(&self) -> String {
        let default_port = match self.scheme.as_str() {
            "https" => 443,
            "http" => 80,
            _ => 0,
        };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `:path`, with query; `*` for a server-wide OPTIONS ping.
    pub fn path_and_query(&self) -> String {
        if self.options_ping {
            return "*".to_string();
        }
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Whether the request carries `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("expect")
                && value.to_ascii_lowercase().contains("100-continue")
        })
    }

    /// Drop staged response state (used when a 1xx response arrives).
    pub fn cleanup_response(&mut self) {
        self.status = 0;
        self.response_headers.clear();
        self.sniffed_type = None;
    }
}

/// An HTTP request/response message handle.
#[derive(Clone)]
pub struct Message {
    pub(crate) inner: Rc<RefCell<MessageInner>>,
}

impl Message {
    /// Start building a message for `method` against `scheme://host`.
    pub fn builder(method: &str, scheme: &str, host: &str) -> MessageBuilder {
        let port = match scheme {
            "http" => 80,
            _ => 443,
        };
        MessageBuilder {
            inner: MessageInner {
                id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
                method: method.to_string(),
                scheme: scheme.to_string(),
                host: host.to_string(),
                port,
                path: "/".to_string(),
                query: None,
                options_ping: false,
                priority: Priority::Normal,
                headers: Vec::new(),
                body: None,
                decoder: None,
                sniffer: None,
                informational: None,
                request_logger: None,
                status: 0,
                response_headers: Vec::new(),
                sniffed_type: None,
                metrics: MessageMetrics::default(),
                restarting: false,
            },
        }
    }

    /// Shorthand for a bodyless GET.
    pub fn get(scheme: &str, host: &str, path: &str) -> Message {
        Message::builder("GET", scheme, host).path(path).build()
    }

    /// Stable identity for registry keys.
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    /// Response status, 0 until headers arrive.
    pub fn status(&self) -> u16 {
        self.inner.borrow().status
    }

    /// Copy of the response headers received so far.
    pub fn response_headers(&self) -> Vec<(String, String)> {
        self.inner.borrow().response_headers.clone()
    }

    /// First response header matching `name`, case-insensitively.
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.inner
            .borrow()
            .response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    /// Per-message metric counters and timestamps.
    pub fn metrics(&self) -> MessageMetrics {
        self.inner.borrow().metrics
    }

    pub fn priority(&self) -> Priority {
        self.inner.borrow().priority
    }

    /// Content type committed by the sniffer, if one ran.
    pub fn sniffed_type(&self) -> Option<String> {
        self.inner.borrow().sniffed_type.clone()
    }

    /// True when the exchange failed restartably and should be retried
    /// on a fresh connection.
    pub fn is_restarting(&self) -> bool {
        self.inner.borrow().restarting
    }

    pub(crate) fn set_restarting(&self) {
        self.inner.borrow_mut().restarting = true;
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Message")
            .field("id", &inner.id)
            .field("method", &inner.method)
            .field("host", &inner.host)
            .field("path", &inner.path)
            .field("status", &inner.status)
            .finish()
    }
}

/// Builder for [`Message`].
pub struct MessageBuilder {
    inner: MessageInner,
}

impl MessageBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.inner.port = port;
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.inner.path = path.to_string();
        self
    }

    pub fn query(mut self, query: &str) -> Self {
        self.inner.query = Some(query.to_string());
        self
    }

    /// Mark this as a server-wide OPTIONS ping (`:path` = `*`).
    pub fn options_ping(mut self) -> Self {
        self.inner.options_ping = true;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.inner.priority = priority;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.inner.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Attach a request body source.
    pub fn body(mut self, source: RequestSource) -> Self {
        self.inner.body = Some(source);
        self
    }

    /// Shorthand for an in-memory request body.
    pub fn body_bytes(self, data: impl Into<Vec<u8>>) -> Self {
        self.body(RequestSource::Pollable(Box::new(
            crate::pump::BufSource::new(data),
        )))
    }

    pub fn decoder(mut self, decoder: Box<dyn ContentDecoder>) -> Self {
        self.inner.decoder = Some(decoder);
        self
    }

    pub fn sniffer(mut self, sniffer: Box<dyn ContentSniffer>) -> Self {
        self.inner.sniffer = Some(sniffer);
        self
    }

    /// Hook fired for informational (1xx) responses.
    pub fn on_informational(mut self, hook: impl FnMut(u16) + 'static) -> Self {
        self.inner.informational = Some(Box::new(hook));
        self
    }

    /// Hook fired for each request body chunk dispatched to the engine.
    pub fn on_request_data(mut self, hook: impl FnMut(&[u8]) + 'static) -> Self {
        self.inner.request_logger = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Message {
        Message {
            inner: Rc::new(RefCell::new(self.inner)),
        }
    }
}
