//! The application-facing request handler contract.

use super::request::Request;
use super::types::{Method, Version};
use crate::error::Result;
use std::net::SocketAddr;
use std::time::Duration;

/// A snapshot of one live connection, handed to [`Handler::evict`].
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Stable id of the connection within its server.
    pub id: u64,
    /// Peer address.
    pub peer: SocketAddr,
    /// Time since the connection was accepted.
    pub age: Duration,
}

/// Application interface invoked by the server on its reactor thread.
///
/// `handle_request` may reply synchronously via [`Request::reply`], or
/// offload work to a [`WorkerPool`](crate::pool::WorkerPool) task that
/// replies later through [`Request::responder`] and return `Ok(true)`.
pub trait Handler {
    /// Constructs the request object for an incoming request line. The
    /// default builds a plain [`Request`]; override to seed it.
    fn create_request(&self, method: Method, uri: String, version: Version) -> Request {
        Request::new(method, uri, version)
    }

    /// Handles a fully parsed request.
    ///
    /// Returns `Ok(true)` if this handler took responsibility for the
    /// request (the reply may still be pending), `Ok(false)` if no route
    /// matched (the server replies 404).
    ///
    /// # Errors
    ///
    /// An [`Error::Status`](crate::Error::Status) with a code in
    /// `[400, 600)` becomes that reply; any other error becomes a 500-class
    /// reply derived from its message.
    fn handle_request(&self, req: &mut Request) -> Result<bool>;

    /// Called exactly once per `handle_request` entry, after the reply
    /// decision is made, even when the handler failed.
    fn end_request(&self, _req: &mut Request) {}

    /// Advisory hook invoked when the connection cap is reached: return the
    /// ids of connections to drop to make room. The default evicts nothing,
    /// leaving new peers to wait in the listen backlog.
    fn evict(&self, _connections: &[ConnectionInfo]) -> Vec<u64> {
        Vec::new()
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn create_request(&self, method: Method, uri: String, version: Version) -> Request {
        (**self).create_request(method, uri, version)
    }

    fn handle_request(&self, req: &mut Request) -> Result<bool> {
        (**self).handle_request(req)
    }

    fn end_request(&self, req: &mut Request) {
        (**self).end_request(req)
    }

    fn evict(&self, connections: &[ConnectionInfo]) -> Vec<u64> {
        (**self).evict(connections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NotFound;

    impl Handler for NotFound {
        fn handle_request(&self, _req: &mut Request) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn default_create_request_builds_plain_request() {
        let handler = NotFound;
        let req = handler.create_request(Method::Get, "/x".into(), Version::Http11);
        assert_eq!(req.uri(), "/x");
        assert!(req.headers().is_empty());
    }

    #[test]
    fn default_evict_drops_nothing() {
        let handler = NotFound;
        let info = ConnectionInfo {
            id: 1,
            peer: "127.0.0.1:9".parse().unwrap(),
            age: Duration::from_secs(5),
        };
        assert!(handler.evict(&[info]).is_empty());
    }
}
