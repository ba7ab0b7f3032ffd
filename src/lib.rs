//! Evhttp: a concurrent event-driven HTTP server core.
//!
//! # Overview
//!
//! The crate combines three pieces under one single-threaded event loop:
//!
//! - [`reactor`]: cooperative I/O multiplexing over fd readiness, timers,
//!   and explicitly activated events, drained in strict priority order.
//! - [`pool`]: a fixed-size worker pool for offloading blocking work, with
//!   completion callbacks delivered back on the reactor thread.
//! - [`http`]: the server front driving accepted sockets through a request
//!   lifecycle with TTL expiry, eviction, connection caps, and
//!   back-pressure at the kernel accept queue.
//!
//! # Threading model
//!
//! One reactor thread per [`http::Server`]; application handlers run
//! there. Blocking work moves to the [`pool::WorkerPool`] through
//! [`pool::AsyncTask`] and its results return to the reactor thread as
//! callbacks. Errors cross the thread boundary as captured values, never
//! as unwound panics.
//!
//! # Example
//!
//! ```no_run
//! use evhttp::http::{Handler, Request, Response, Server, ServerOptions};
//! use evhttp::reactor::Reactor;
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     fn handle_request(&self, req: &mut Request) -> evhttp::Result<bool> {
//!         req.reply(Response::new(200).body("ok"));
//!         Ok(true)
//!     }
//! }
//!
//! fn main() -> evhttp::Result<()> {
//!     let reactor = Reactor::new()?;
//!     let server = Server::new(&reactor, Hello, ServerOptions::default());
//!     server.bind("127.0.0.1:8080".parse().unwrap())?;
//!     reactor.run()
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

pub mod error;
pub mod http;
pub mod pool;
pub mod reactor;
pub mod stats;
#[cfg(feature = "tls")]
pub mod tls;

pub use error::{Error, Result};
pub use http::{Handler, Request, Responder, Response, Server, ServerOptions};
pub use pool::{AsyncTask, ShutdownToken, WorkerPool};
pub use reactor::Reactor;
pub use stats::{CounterStats, StatsSink};
