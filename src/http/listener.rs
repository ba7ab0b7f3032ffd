//! Bound server socket.

use crate::error::Result;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use tracing::trace;

/// Send/receive buffer hint applied to accepted sockets.
const SOCKET_BUF_SIZE: usize = 256 * 1024;

/// A non-blocking listening socket with `SO_REUSEADDR` set.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds `addr` and listens with the given backlog.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created, bound, or put into
    /// non-blocking mode.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;
        socket.set_nonblocking(true)?;

        let inner: TcpListener = socket.into();
        let local_addr = inner.local_addr()?;
        Ok(Self { inner, local_addr })
    }

    /// The address actually bound (resolves port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The listening socket's fd, for reactor registration.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Accepts one pending connection, returned in non-blocking mode with
    /// enlarged socket buffers.
    ///
    /// # Errors
    ///
    /// Returns `WouldBlock` when the kernel queue is empty; other errors
    /// as-is.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept()?;
        stream.set_nonblocking(true)?;

        let sock = socket2::SockRef::from(&stream);
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUF_SIZE) {
            trace!(error = %e, "could not enlarge receive buffer");
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUF_SIZE) {
            trace!(error = %e, "could not enlarge send buffer");
        }

        Ok((stream, peer))
    }
}
