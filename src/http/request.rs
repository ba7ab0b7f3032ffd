//! Requests and deferred reply handles.

use super::connection::Connection;
use super::types::{Method, Response, Version};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// A single HTTP request, owned by its connection for its entire lifetime.
///
/// Handlers reply either synchronously with [`reply`](Self::reply), or
/// later through a [`Responder`] taken before offloading work.
#[derive(Debug)]
pub struct Request {
    id: u64,
    method: Method,
    uri: String,
    version: Version,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    client: Option<SocketAddr>,
    response: Option<Response>,
    responder: Responder,
}

impl Request {
    /// Creates a request with a fresh monotonically assigned id.
    #[must_use]
    pub fn new(method: Method, uri: String, version: Version) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            method,
            uri,
            version,
            headers: Vec::new(),
            body: Vec::new(),
            client: None,
            response: None,
            responder: Responder { conn: Weak::new() },
        }
    }

    /// The request's process-wide monotonic id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// HTTP version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// All request headers in arrival order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value matching `name`, case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The peer's address.
    #[must_use]
    pub fn client_ip(&self) -> Option<SocketAddr> {
        self.client
    }

    /// Stores a synchronous reply, written once the handler returns.
    pub fn reply(&mut self, response: Response) {
        self.response = Some(response);
    }

    /// Replies with a bare status and its standard reason phrase as body.
    pub fn reply_status(&mut self, status: u16) {
        self.reply(Response::error(status, None));
    }

    /// Returns a handle for replying after the handler has returned, e.g.
    /// from a worker-task success callback.
    #[must_use]
    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }

    pub(crate) fn set_headers(&mut self, headers: Vec<(String, String)>) {
        self.headers = headers;
    }

    pub(crate) fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub(crate) fn set_client(&mut self, peer: SocketAddr) {
        self.client = Some(peer);
    }

    pub(crate) fn set_responder(&mut self, responder: Responder) {
        self.responder = responder;
    }

    pub(crate) fn take_response(&mut self) -> Option<Response> {
        self.response.take()
    }
}

/// Deferred reply handle for one request's connection.
///
/// Stays on the reactor thread. Responding after the connection has gone
/// away (timeout, peer reset) is a no-op.
#[derive(Clone)]
pub struct Responder {
    conn: Weak<RefCell<Connection>>,
}

impl Responder {
    pub(crate) fn new(conn: Weak<RefCell<Connection>>) -> Self {
        Self { conn }
    }

    /// Writes `response` on the owning connection.
    pub fn respond(&self, response: Response) {
        if let Some(conn) = self.conn.upgrade() {
            Connection::send_response(&conn, response);
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("connected", &(self.conn.strong_count() > 0))
            .finish()
    }
}
