//! HTTP server front: listener, connection table, TTL expiry, eviction,
//! connection cap, and handler dispatch.
//!
//! The server owns its connections in arrival order. When the connection
//! cap is reached the handler's `evict` hook may make room; failing that
//! the accept event is deregistered and new peers queue in the kernel's
//! listen backlog until a connection leaves.

use super::codec::DecodedRequest;
use super::connection::{ConnRef, Connection, ConnectionSettings, Transport};
use super::handler::Handler;
use super::listener::Listener;
use super::request::Responder;
use super::types::Response;
use crate::error::{Error, Result};
use crate::reactor::{EventHandle, Flags, Mask, Reactor};
use crate::stats::StatsSink;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on the TTL sweep interval.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Server-wide configuration applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Hard cap on live connections; 0 = unbounded.
    pub max_connections: usize,
    /// Drop connections older than this, regardless of activity;
    /// zero = disabled.
    pub max_connection_ttl: Duration,
    /// `listen(2)` backlog.
    pub connection_backlog: u32,
    /// Per-connection header block byte cap.
    pub max_header_size: usize,
    /// Per-connection body byte cap.
    pub max_body_size: usize,
    /// Deadline for reading a request.
    pub read_timeout: Option<Duration>,
    /// Deadline for writing a reply.
    pub write_timeout: Option<Duration>,
    /// Base reactor priority for this server's events. Accept and expiry
    /// run one above (numerically `priority - 1` when positive) so that
    /// housekeeping never starves behind connection work.
    pub priority: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 0,
            max_connection_ttl: Duration::ZERO,
            connection_backlog: 128,
            max_header_size: 64 * 1024,
            max_body_size: 16 * 1024 * 1024,
            read_timeout: Some(Duration::from_secs(60)),
            write_timeout: Some(Duration::from_secs(60)),
            priority: 0,
        }
    }
}

impl ServerOptions {
    /// Sets the connection cap.
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the connection TTL.
    #[must_use]
    pub fn max_connection_ttl(mut self, ttl: Duration) -> Self {
        self.max_connection_ttl = ttl;
        self
    }

    /// Sets the listen backlog.
    #[must_use]
    pub fn connection_backlog(mut self, backlog: u32) -> Self {
        self.connection_backlog = backlog;
        self
    }

    /// Sets the header block byte cap.
    #[must_use]
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// Sets the body byte cap.
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Sets the read deadline.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the write deadline.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the base event priority.
    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

pub(crate) struct ServerInner {
    reactor: Reactor,
    pub(crate) handler: Rc<dyn Handler>,
    pub(crate) options: ServerOptions,
    pub(crate) stats: Option<Arc<dyn StatsSink>>,
    #[cfg(feature = "tls")]
    tls: Option<crate::tls::TlsContext>,
    listener: Option<Listener>,
    accept_event: Option<EventHandle>,
    expire_event: Option<EventHandle>,
    pub(crate) connections: Vec<ConnRef>,
    next_conn_id: u64,
}

/// An event-driven HTTP server bound to one address.
///
/// Lives on its reactor's thread; all handler callbacks run there. Worker
/// offloading goes through [`WorkerPool`](crate::pool::WorkerPool).
pub struct Server {
    inner: Rc<RefCell<ServerInner>>,
}

impl Server {
    /// Creates an unbound server.
    pub fn new(reactor: &Reactor, handler: impl Handler + 'static, options: ServerOptions) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ServerInner {
                reactor: reactor.clone(),
                handler: Rc::new(handler),
                options,
                stats: None,
                #[cfg(feature = "tls")]
                tls: None,
                listener: None,
                accept_event: None,
                expire_event: None,
                connections: Vec::new(),
                next_conn_id: 0,
            })),
        }
    }

    /// Attaches a statistics sink. Must be internally thread-safe; it is
    /// written from both the reactor and worker threads.
    pub fn set_stats(&self, stats: Arc<dyn StatsSink>) {
        self.inner.borrow_mut().stats = Some(stats);
    }

    /// Configures TLS; every subsequently accepted connection performs the
    /// handshake as its first action.
    #[cfg(feature = "tls")]
    pub fn set_tls(&self, tls: crate::tls::TlsContext) {
        self.inner.borrow_mut().tls = Some(tls);
    }

    /// Binds and starts accepting. Returns the bound address (resolving an
    /// ephemeral port).
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadyBound`] on a second bind, or with the
    /// underlying socket error.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut inner = self.inner.borrow_mut();
        if inner.listener.is_some() {
            return Err(Error::AlreadyBound);
        }

        let listener = Listener::bind(addr, inner.options.connection_backlog)?;
        let local = listener.local_addr();

        let weak = Rc::downgrade(&self.inner);
        let accept_event = inner.reactor.new_fd_event(
            listener.raw_fd(),
            Mask::READ,
            Flags::PERSIST,
            move |_ready| {
                if let Some(inner) = weak.upgrade() {
                    on_accept(&inner);
                }
            },
        );
        accept_event.set_priority(elevated(inner.options.priority));
        accept_event.add(None)?;
        inner.accept_event = Some(accept_event);
        inner.listener = Some(listener);

        if inner.options.max_connection_ttl > Duration::ZERO {
            let weak = Rc::downgrade(&self.inner);
            let expire_event = inner.reactor.new_timer_event(Flags::PERSIST, move |_ready| {
                if let Some(inner) = weak.upgrade() {
                    on_expire(&inner);
                }
            });
            expire_event.set_priority(elevated(inner.options.priority));
            expire_event.add(Some(sweep_interval(inner.options.max_connection_ttl)))?;
            inner.expire_event = Some(expire_event);
        }

        info!(addr = %local, "listening");
        Ok(local)
    }

    /// The bound address, if any.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .borrow()
            .listener
            .as_ref()
            .map(Listener::local_addr)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.borrow().connections.len()
    }

    /// Stops accepting and drops every live connection.
    pub fn shutdown(&self) {
        let connections = {
            let mut inner = self.inner.borrow_mut();
            inner.accept_event = None;
            inner.expire_event = None;
            inner.listener = None;
            std::mem::take(&mut inner.connections)
        };
        for conn in &connections {
            conn.borrow_mut().teardown();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Server")
            .field(
                "bound",
                &inner.listener.as_ref().map(Listener::local_addr),
            )
            .field("connections", &inner.connections.len())
            .finish_non_exhaustive()
    }
}

/// Accept/expiry events run one above the server's base priority.
fn elevated(priority: u32) -> u32 {
    priority.saturating_sub(1)
}

/// TTL sweeps run once a minute, tightened for short TTLs so expiry stays
/// responsive when the limit itself is small.
fn sweep_interval(ttl: Duration) -> Duration {
    ttl.max(Duration::from_secs(1)).min(MAX_SWEEP_INTERVAL)
}

fn on_accept(inner_rc: &Rc<RefCell<ServerInner>>) {
    // Capacity check, with one eviction attempt before backing off.
    let at_cap = {
        let inner = inner_rc.borrow();
        let max = inner.options.max_connections;
        max > 0 && inner.connections.len() >= max
    };
    if at_cap {
        let (handler, infos) = {
            let inner = inner_rc.borrow();
            let infos = inner
                .connections
                .iter()
                .map(|c| c.borrow().info())
                .collect::<Vec<_>>();
            (Rc::clone(&inner.handler), infos)
        };
        let victims = handler.evict(&infos);
        if !victims.is_empty() {
            close_connections(inner_rc, &victims);
        }

        let still_at_cap = {
            let inner = inner_rc.borrow();
            let max = inner.options.max_connections;
            max > 0 && inner.connections.len() >= max
        };
        if still_at_cap {
            let inner = inner_rc.borrow();
            if let Some(stats) = &inner.stats {
                stats.event("rejected");
            }
            if let Some(ev) = &inner.accept_event {
                ev.del();
            }
            debug!("connection cap reached; accept paused");
            return;
        }
    }

    let accepted = {
        let inner = inner_rc.borrow();
        inner.listener.as_ref().map(Listener::accept)
    };
    let Some(accepted) = accepted else { return };
    let (stream, peer) = match accepted {
        Ok(pair) => pair,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
        Err(e) => {
            error!(error = %e, "failed to accept new socket");
            return;
        }
    };

    debug!(peer = %peer, "new connection");

    let (reactor, id, settings, transport) = {
        let mut inner = inner_rc.borrow_mut();
        inner.next_conn_id += 1;
        let id = inner.next_conn_id;
        if let Some(stats) = &inner.stats {
            stats.event("accepted");
        }
        let settings = ConnectionSettings {
            read_timeout: inner.options.read_timeout,
            write_timeout: inner.options.write_timeout,
            max_header_size: inner.options.max_header_size,
            max_body_size: inner.options.max_body_size,
            priority: inner.options.priority,
            stats: inner.stats.clone(),
        };

        #[cfg(feature = "tls")]
        let transport = match &inner.tls {
            Some(tls) => match tls.accept(stream) {
                Ok(t) => Transport::Tls(t),
                Err(e) => {
                    debug!(error = %e, peer = %peer, "TLS session setup failed");
                    return;
                }
            },
            None => Transport::Plain(stream),
        };
        #[cfg(not(feature = "tls"))]
        let transport = Transport::Plain(stream);

        (inner.reactor.clone(), id, settings, transport)
    };

    let conn = Connection::spawn(
        &reactor,
        Rc::downgrade(inner_rc),
        id,
        transport,
        peer,
        settings,
    );
    // The connection may already have closed itself (handshake failure,
    // instant peer reset); only live ones enter the table.
    if conn.borrow().phase != super::connection::Phase::Closing {
        inner_rc.borrow_mut().connections.push(conn);
    }
}

/// Drops the listed connections from the table.
fn close_connections(inner_rc: &Rc<RefCell<ServerInner>>, ids: &[u64]) {
    let removed = {
        let mut inner = inner_rc.borrow_mut();
        let mut removed = Vec::new();
        inner.connections.retain(|c| {
            if ids.contains(&c.borrow().id) {
                removed.push(Rc::clone(c));
                false
            } else {
                true
            }
        });
        removed
    };
    for conn in &removed {
        conn.borrow_mut().teardown();
    }
    if !removed.is_empty() {
        debug!(count = removed.len(), "evicted connections");
    }
}

/// Removes one connection and resumes accepting.
pub(crate) fn remove(inner_rc: &Rc<RefCell<ServerInner>>, id: u64) {
    let mut inner = inner_rc.borrow_mut();
    let before = inner.connections.len();
    inner.connections.retain(|c| c.borrow().id != id);
    if inner.connections.len() < before {
        if let Some(ev) = &inner.accept_event {
            if let Err(e) = ev.add(None) {
                error!(error = %e, "failed to re-arm accept event");
            }
        }
    }
}

/// TTL sweep over the table in arrival order.
fn on_expire(inner_rc: &Rc<RefCell<ServerInner>>) {
    let expired = {
        let mut inner = inner_rc.borrow_mut();
        let ttl = inner.options.max_connection_ttl;
        let now = Instant::now();
        let mut expired = Vec::new();
        inner.connections.retain(|c| {
            if now.duration_since(c.borrow().start_time) > ttl {
                expired.push(Rc::clone(c));
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            if let Some(stats) = &inner.stats {
                stats.count("timedout", expired.len() as u64);
            }
            if let Some(ev) = &inner.accept_event {
                let _ = ev.add(None);
            }
        }
        expired
    };
    for conn in &expired {
        conn.borrow_mut().teardown();
    }
    debug!(count = expired.len(), "dropped expired connections");
}

/// Dispatches a parsed request to the handler and applies the reply
/// decision. The handler's `end_request` runs exactly once on every path,
/// including handler failure.
pub(crate) fn dispatch(conn: &ConnRef, raw: DecodedRequest) {
    let Some(server) = conn.borrow().server.upgrade() else {
        Connection::close(conn);
        return;
    };
    let (handler, stats, connection_count) = {
        let inner = server.borrow();
        (
            Rc::clone(&inner.handler),
            inner.stats.clone(),
            inner.connections.len(),
        )
    };
    let peer = conn.borrow().peer;
    debug!(connections = connection_count, peer = %peer, "new request");

    let mut req = handler.create_request(raw.method, raw.uri, raw.version);
    req.set_headers(raw.headers);
    req.set_body(raw.body);
    req.set_client(peer);
    req.set_responder(Responder::new(Rc::downgrade(conn)));
    let request_id = req.id();

    let result = catch_unwind(AssertUnwindSafe(|| handler.handle_request(&mut req)));
    let reply = match result {
        Ok(Ok(true)) => req.take_response(),
        Ok(Ok(false)) => {
            let _ = req.take_response();
            Some(Response::error(404, None))
        }
        Ok(Err(e)) => {
            if let Some(stats) = &stats {
                stats.event("errors");
            }
            match e.code() {
                Some(code) if (400..600).contains(&code) => {
                    warn!(request = request_id, peer = %peer, error = %e, "request failed");
                    Some(Response::error(code, None))
                }
                _ => {
                    error!(request = request_id, peer = %peer, error = %e, "handler error");
                    Some(Response::error(500, Some(&e.to_string())))
                }
            }
        }
        Err(_panic) => {
            if let Some(stats) = &stats {
                stats.event("errors");
            }
            error!(request = request_id, peer = %peer, "handler panicked");
            Some(Response::error(500, None))
        }
    };

    if catch_unwind(AssertUnwindSafe(|| handler.end_request(&mut req))).is_err() {
        error!(request = request_id, "end_request panicked");
    }

    match reply {
        Some(response) => Connection::send_response(conn, response),
        None => trace!(request = request_id, "reply deferred"),
    }
}
