//! Per-socket connection state machine.
//!
//! A connection advances through the request lifecycle strictly
//! sequentially: read and parse, dispatch, write, then either close or
//! return to reading on keep-alive. It is driven by a single reactor fd
//! event whose interest and deadline are re-armed per phase: the read
//! timeout arms on entry to a reading phase and disarms at dispatch, the
//! write timeout arms while a reply is flushing. Any deadline firing moves
//! the connection to `Closing` and removes it from the server's table.

use super::codec::{encode_response, DecodeError, DecodedRequest, RequestDecoder};
use super::handler::ConnectionInfo;
use super::server::ServerInner;
use super::types::{Response, Version};
use crate::reactor::{EventHandle, Flags, Mask, Reactor, Ready};
use crate::stats::StatsSink;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Handshake,
    ReadingHeaders,
    ReadingBody,
    Dispatching,
    Writing,
    Closing,
}

/// TLS handshake progress for non-blocking transports.
pub(crate) enum HandshakeProgress {
    Done,
    WantRead,
    WantWrite,
}

/// The byte stream under a connection: plain TCP or TLS-wrapped.
pub(crate) enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(crate::tls::TlsTransport),
}

impl Transport {
    pub(crate) fn raw_fd(&self) -> RawFd {
        match self {
            Self::Plain(s) => s.as_raw_fd(),
            #[cfg(feature = "tls")]
            Self::Tls(t) => t.raw_fd(),
        }
    }

    fn needs_handshake(&self) -> bool {
        match self {
            Self::Plain(_) => false,
            #[cfg(feature = "tls")]
            Self::Tls(t) => t.is_handshaking(),
        }
    }

    fn handshake(&mut self) -> io::Result<HandshakeProgress> {
        match self {
            Self::Plain(_) => Ok(HandshakeProgress::Done),
            #[cfg(feature = "tls")]
            Self::Tls(t) => t.handshake(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Self::Tls(t) => t.read_plaintext(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Self::Tls(t) => t.write_plaintext(buf),
        }
    }

    /// Pushes any internally buffered bytes to the socket. Returns `false`
    /// if the socket backed up and a write-readiness wait is needed.
    fn flush_pending(&mut self) -> io::Result<bool> {
        match self {
            Self::Plain(_) => Ok(true),
            #[cfg(feature = "tls")]
            Self::Tls(t) => t.flush_pending(),
        }
    }
}

/// Per-connection settings applied by the server on accept.
pub(crate) struct ConnectionSettings {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub priority: u32,
    pub stats: Option<Arc<dyn StatsSink>>,
}

pub(crate) type ConnRef = Rc<RefCell<Connection>>;

/// One accepted socket and its request lifecycle state.
///
/// Owned exclusively by the server's connection table; event callbacks and
/// responders hold only weak references.
pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) peer: SocketAddr,
    pub(crate) start_time: Instant,
    pub(crate) phase: Phase,
    pub(crate) server: Weak<RefCell<ServerInner>>,
    transport: Transport,
    decoder: RequestDecoder,
    write_buf: Vec<u8>,
    write_pos: usize,
    request_version: Version,
    keep_alive_after_reply: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    stats: Option<Arc<dyn StatsSink>>,
    event: Option<EventHandle>,
}

enum ReadOutcome {
    Request(DecodedRequest),
    NeedMore,
    Eof,
    Protocol(DecodeError),
    Io(io::Error),
}

enum WriteOutcome {
    Rearm,
    Done,
    Failed(io::Error),
}

impl Connection {
    /// Builds a connection, registers its fd event, and starts the request
    /// cycle (TLS handshake first when the transport needs one).
    pub(crate) fn spawn(
        reactor: &Reactor,
        server: Weak<RefCell<ServerInner>>,
        id: u64,
        transport: Transport,
        peer: SocketAddr,
        settings: ConnectionSettings,
    ) -> ConnRef {
        let fd = transport.raw_fd();
        let needs_handshake = transport.needs_handshake();
        let conn = Rc::new(RefCell::new(Connection {
            id,
            peer,
            start_time: Instant::now(),
            phase: Phase::Idle,
            server,
            transport,
            decoder: RequestDecoder::new(settings.max_header_size, settings.max_body_size),
            write_buf: Vec::new(),
            write_pos: 0,
            request_version: Version::Http11,
            keep_alive_after_reply: false,
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
            stats: settings.stats,
            event: None,
        }));

        let weak = Rc::downgrade(&conn);
        let event = reactor.new_fd_event(fd, Mask::READ, Flags::NONE, move |ready| {
            if let Some(conn) = weak.upgrade() {
                Connection::on_event(&conn, ready);
            }
        });
        event.set_priority(settings.priority);
        conn.borrow_mut().event = Some(event);

        if needs_handshake {
            conn.borrow_mut().phase = Phase::Handshake;
            Self::drive_handshake(&conn);
        } else {
            Self::begin_read(&conn);
        }
        conn
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer: self.peer,
            age: self.start_time.elapsed(),
        }
    }

    /// Server-side removal: silences the event and marks the connection
    /// closed without re-entering the server table.
    pub(crate) fn teardown(&mut self) {
        self.phase = Phase::Closing;
        self.event = None;
    }

    fn on_event(conn: &ConnRef, ready: Ready) {
        let phase = conn.borrow().phase;
        match phase {
            Phase::Handshake => {
                if ready.is_timeout() {
                    debug!("TLS handshake timed out");
                    Self::close(conn);
                } else {
                    Self::drive_handshake(conn);
                }
            }
            Phase::ReadingHeaders | Phase::ReadingBody => {
                if ready.is_timeout() {
                    debug!("read timed out");
                    Self::close(conn);
                } else {
                    Self::drive_read(conn);
                }
            }
            Phase::Writing => {
                if ready.is_timeout() {
                    debug!("write timed out");
                    Self::close(conn);
                } else {
                    Self::drive_write(conn);
                }
            }
            Phase::Idle | Phase::Dispatching | Phase::Closing => {}
        }
    }

    fn drive_handshake(conn: &ConnRef) {
        let step = conn.borrow_mut().transport.handshake();
        match step {
            Ok(HandshakeProgress::Done) => {
                trace!("TLS handshake complete");
                Self::begin_read(conn);
            }
            Ok(HandshakeProgress::WantRead) => {
                let timeout = conn.borrow().read_timeout;
                if !Self::arm(conn, Mask::READ, timeout) {
                    Self::close(conn);
                }
            }
            Ok(HandshakeProgress::WantWrite) => {
                let timeout = conn.borrow().write_timeout;
                if !Self::arm(conn, Mask::WRITE, timeout) {
                    Self::close(conn);
                }
            }
            Err(e) => {
                debug!(error = %e, "TLS handshake failed");
                Self::close(conn);
            }
        }
    }

    fn begin_read(conn: &ConnRef) {
        conn.borrow_mut().phase = Phase::ReadingHeaders;
        Self::drive_read(conn);
    }

    fn drive_read(conn: &ConnRef) {
        let outcome = {
            let mut guard = conn.borrow_mut();
            let c = &mut *guard;
            let mut buf = [0u8; 8192];
            loop {
                // Decode before reading: keep-alive may have left a
                // pipelined request in the buffer.
                match c.decoder.poll() {
                    Ok(Some(req)) => break ReadOutcome::Request(req),
                    Ok(None) => {}
                    Err(e) => break ReadOutcome::Protocol(e),
                }
                c.phase = if c.decoder.is_in_body() {
                    Phase::ReadingBody
                } else {
                    Phase::ReadingHeaders
                };
                match c.transport.read(&mut buf) {
                    Ok(0) => break ReadOutcome::Eof,
                    Ok(n) => {
                        if let Some(stats) = &c.stats {
                            stats.count("bytes-in", n as u64);
                        }
                        c.decoder.feed(&buf[..n]);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break ReadOutcome::NeedMore,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break ReadOutcome::Io(e),
                }
            }
        };

        match outcome {
            ReadOutcome::Request(raw) => Self::begin_dispatch(conn, raw),
            ReadOutcome::NeedMore => {
                let timeout = conn.borrow().read_timeout;
                if !Self::arm(conn, Mask::READ, timeout) {
                    Self::close(conn);
                }
            }
            ReadOutcome::Eof => {
                trace!("peer closed connection");
                Self::close(conn);
            }
            ReadOutcome::Protocol(e) => {
                warn!(error = %e, status = e.status(), "protocol error");
                Self::reply_protocol_error(conn, &e);
            }
            ReadOutcome::Io(e) => {
                debug!(error = %e, "read failed");
                Self::close(conn);
            }
        }
    }

    fn begin_dispatch(conn: &ConnRef, raw: DecodedRequest) {
        {
            let mut c = conn.borrow_mut();
            c.phase = Phase::Dispatching;
            c.request_version = raw.version;
            c.keep_alive_after_reply = super::codec::keep_alive(raw.version, &raw.headers);
            // Reply pending: the read deadline disarms until the next cycle.
            if let Some(ev) = &c.event {
                ev.del();
            }
        }
        super::server::dispatch(conn, raw);
    }

    fn reply_protocol_error(conn: &ConnRef, err: &DecodeError) {
        {
            let mut c = conn.borrow_mut();
            if let Some(stats) = &c.stats {
                stats.event("errors");
            }
            c.keep_alive_after_reply = false;
        }
        Self::send_response(conn, Response::error(err.status(), Some(&err.to_string())));
    }

    /// Encodes `response` and starts flushing it. Invoked synchronously at
    /// dispatch or later through a [`Responder`](super::request::Responder).
    pub(crate) fn send_response(conn: &ConnRef, response: Response) {
        {
            let mut c = conn.borrow_mut();
            if c.phase == Phase::Closing {
                return;
            }
            c.write_buf = encode_response(&response, c.request_version, c.keep_alive_after_reply);
            c.write_pos = 0;
            c.phase = Phase::Writing;
        }
        Self::drive_write(conn);
    }

    fn drive_write(conn: &ConnRef) {
        let outcome = {
            let mut guard = conn.borrow_mut();
            let c = &mut *guard;
            loop {
                if c.write_pos < c.write_buf.len() {
                    match c.transport.write(&c.write_buf[c.write_pos..]) {
                        Ok(0) => {
                            break WriteOutcome::Failed(io::ErrorKind::WriteZero.into());
                        }
                        Ok(n) => {
                            c.write_pos += n;
                            if let Some(stats) = &c.stats {
                                stats.count("bytes-out", n as u64);
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            break WriteOutcome::Rearm;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => break WriteOutcome::Failed(e),
                    }
                } else {
                    match c.transport.flush_pending() {
                        Ok(true) => break WriteOutcome::Done,
                        Ok(false) => break WriteOutcome::Rearm,
                        Err(e) => break WriteOutcome::Failed(e),
                    }
                }
            }
        };

        match outcome {
            WriteOutcome::Rearm => {
                let timeout = conn.borrow().write_timeout;
                if !Self::arm(conn, Mask::WRITE, timeout) {
                    Self::close(conn);
                }
            }
            WriteOutcome::Done => Self::finish_reply(conn),
            WriteOutcome::Failed(e) => {
                debug!(error = %e, "write failed");
                Self::close(conn);
            }
        }
    }

    fn finish_reply(conn: &ConnRef) {
        let keep = {
            let mut c = conn.borrow_mut();
            if let Some(stats) = &c.stats {
                stats.event("completed");
            }
            c.write_buf = Vec::new();
            c.write_pos = 0;
            c.keep_alive_after_reply
        };
        if keep {
            Self::begin_read(conn);
        } else {
            Self::close(conn);
        }
    }

    /// Arms the connection's event with the given interest and deadline.
    fn arm(conn: &ConnRef, mask: Mask, timeout: Option<Duration>) -> bool {
        let c = conn.borrow();
        let Some(ev) = &c.event else { return false };
        ev.set_mask(mask);
        match ev.add(timeout) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "failed to arm connection event");
                false
            }
        }
    }

    /// Transitions to `Closing` and removes the connection from its
    /// server's table, which re-enables accepting when at the cap.
    pub(crate) fn close(conn: &ConnRef) {
        let (id, server) = {
            let mut c = conn.borrow_mut();
            if c.phase == Phase::Closing {
                return;
            }
            c.teardown();
            (c.id, c.server.clone())
        };
        trace!(connection = id, "closing connection");
        if let Some(server) = server.upgrade() {
            super::server::remove(&server, id);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}
