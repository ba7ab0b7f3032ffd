//! TLS server support via rustls.
//!
//! [`TlsContext`] wraps a `rustls::ServerConfig`; the server hands it each
//! accepted socket and the connection drives the handshake as its first
//! action. All I/O stays non-blocking: the transport reports whether it
//! needs read or write readiness and the connection re-arms its reactor
//! event accordingly.

use crate::error::{Error, Result};
use crate::http::connection::HandshakeProgress;
use rustls::{ServerConfig, ServerConnection};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

/// Server-side TLS configuration, cheap to clone and reused across
/// connections.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ServerConfig>,
}

impl TlsContext {
    /// Wraps an existing rustls configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Builds a context from PEM-encoded certificate chain and private key
    /// files.
    ///
    /// # Errors
    ///
    /// Fails if either file cannot be read or contains no usable material.
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let mut cert_reader = BufReader::new(File::open(cert_path)?);
        let certs = rustls_pemfile::certs(&mut cert_reader)
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| Error::Tls(format!("bad certificate file: {e}")))?;
        if certs.is_empty() {
            return Err(Error::Tls("no certificates found".into()));
        }

        let mut key_reader = BufReader::new(File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| Error::Tls(format!("bad key file: {e}")))?
            .ok_or_else(|| Error::Tls("no private key found".into()))?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Self::new(config))
    }

    /// Starts a TLS session over an accepted socket.
    ///
    /// # Errors
    ///
    /// Fails if the session state cannot be created from this
    /// configuration.
    pub fn accept(&self, sock: TcpStream) -> Result<TlsTransport> {
        let conn = ServerConnection::new(Arc::clone(&self.config))
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(TlsTransport { conn, sock })
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

/// A non-blocking TLS session over one TCP socket.
pub struct TlsTransport {
    conn: ServerConnection,
    sock: TcpStream,
}

impl TlsTransport {
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Advances the handshake as far as the socket allows.
    pub(crate) fn handshake(&mut self) -> io::Result<HandshakeProgress> {
        loop {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut self.sock) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(HandshakeProgress::WantWrite);
                    }
                    Err(e) => return Err(e),
                }
            }
            if !self.conn.is_handshaking() {
                return Ok(HandshakeProgress::Done);
            }
            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeProgress::WantRead);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads decrypted bytes, pulling TLS records from the socket as
    /// needed. `Ok(0)` means the peer closed.
    pub(crate) fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            match self.conn.read_tls(&mut self.sock) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Buffers plaintext for encryption and opportunistically pushes
    /// records to the socket.
    pub(crate) fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        let _ = self.flush_pending()?;
        Ok(n)
    }

    /// Pushes buffered TLS records to the socket; `Ok(false)` means the
    /// socket backed up and write readiness is needed.
    pub(crate) fn flush_pending(&mut self) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}
