//! Event-driven HTTP/1.x server front.

pub mod codec;
pub(crate) mod connection;
pub mod handler;
pub mod listener;
pub mod request;
pub mod server;
pub mod types;

pub use handler::{ConnectionInfo, Handler};
pub use request::{Request, Responder};
pub use server::{Server, ServerOptions};
pub use types::{default_reason, Method, Response, Version};
