//! Shared helpers for integration tests.

#![allow(dead_code)]

use evhttp::http::{Handler, Server, ServerOptions};
use evhttp::reactor::{Reactor, StopHandle};
use evhttp::stats::StatsSink;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A server running on its own reactor thread.
pub struct TestServer {
    pub addr: SocketAddr,
    stop: StopHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Builds and runs a server. `build` is invoked on the reactor thread
    /// (with threads already enabled) to construct the handler.
    pub fn start<F>(options: ServerOptions, stats: Option<Arc<dyn StatsSink>>, build: F) -> Self
    where
        F: FnOnce(&Reactor) -> Box<dyn Handler> + Send + 'static,
    {
        init_logging();
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            let reactor = Reactor::new().expect("reactor");
            reactor.enable_threads();
            let handler = build(&reactor);
            let server = Server::new(&reactor, handler, options);
            if let Some(stats) = stats {
                server.set_stats(stats);
            }
            let addr = server
                .bind("127.0.0.1:0".parse().unwrap())
                .expect("bind");
            tx.send((addr, reactor.stop_handle())).expect("send addr");
            reactor.run().expect("run");
            server.shutdown();
        });
        let (addr, stop) = rx.recv().expect("server did not start");
        Self {
            addr,
            stop,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A parsed HTTP response.
#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("utf8 body")
    }
}

/// Reads one `Content-Length`-framed response off the stream, leaving the
/// connection usable for a follow-up request.
pub fn read_response(stream: &mut TcpStream) -> ClientResponse {
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    let mut status_line = String::new();
    reader.read_line(&mut status_line).expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("header line");
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').expect("header colon");
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }

    let length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().expect("content length"))
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).expect("body");

    ClientResponse {
        status,
        headers,
        body,
    }
}

/// Sends a request and reads the framed response on the same connection.
pub fn roundtrip(stream: &mut TcpStream, request: &[u8]) -> ClientResponse {
    stream.write_all(request).expect("write request");
    read_response(stream)
}

/// One-shot request on a fresh connection.
pub fn request(addr: SocketAddr, request: &[u8]) -> ClientResponse {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    roundtrip(&mut stream, request)
}
