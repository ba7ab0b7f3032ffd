//! Error types for the server core.
//!
//! Errors never cross the reactor/worker boundary as unwound panics; a
//! worker captures whatever its task produced into a value and the reactor
//! observes it through the task's `error` callback. Within the reactor
//! thread, every callback is wrapped in a catch-all that logs and discards.

use std::io;

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A domain error carrying an HTTP status code. When returned from a
    /// handler with a code in `[400, 600)`, the server replies with that
    /// status.
    #[error("{message}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Human-readable description, used as the reply body.
        message: String,
    },

    /// An I/O error from a socket, poller, or listener.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Cross-thread reactor facilities were used without calling
    /// [`Reactor::enable_threads`](crate::reactor::Reactor::enable_threads)
    /// first.
    #[error(
        "threads not enabled; call Reactor::enable_threads() before using \
         cross-thread activation or creating a WorkerPool"
    )]
    ThreadsNotEnabled,

    /// `bind` was called on a server that is already bound.
    #[error("already bound")]
    AlreadyBound,

    /// A TLS configuration or handshake failure.
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(String),

    /// An error captured from a worker task that produced only a message.
    #[error("{0}")]
    Message(String),

    /// A worker task failed with a payload that carried no message.
    #[error("Unknown exception")]
    Unknown,
}

impl Error {
    /// Creates a domain error carrying an HTTP status code.
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// Returns the HTTP status code if this is a [`Error::Status`].
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// A specialized `Result` for server core operations.
pub type Result<T> = std::result::Result<T, Error>;
