//! End-to-end server scenarios over real sockets: request lifecycle,
//! handler error mapping, offloaded work, connection caps, eviction, TTL
//! expiry, and size limits.

mod common;

use common::{read_response, request, roundtrip, TestServer};
use evhttp::http::{ConnectionInfo, Handler, Method, Request, Response, ServerOptions};
use evhttp::pool::{AsyncTask, WorkerPool};
use evhttp::stats::{CounterStats, StatsSink};
use evhttp::{Error, Result};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Ok200;

impl Handler for Ok200 {
    fn handle_request(&self, req: &mut Request) -> Result<bool> {
        if req.method() == &Method::Get && req.uri() == "/" {
            req.reply(Response::new(200).body("ok"));
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

struct Echo;

impl Handler for Echo {
    fn handle_request(&self, req: &mut Request) -> Result<bool> {
        let body = req.body().to_vec();
        req.reply(Response::new(200).body(body));
        Ok(true)
    }
}

#[test]
fn simple_get() {
    let server = TestServer::start(ServerOptions::default(), None, |_| Box::new(Ok200));
    let resp = request(server.addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_str(), "ok");
}

#[test]
fn unrouted_request_gets_404() {
    let server = TestServer::start(ServerOptions::default(), None, |_| Box::new(Ok200));
    let resp = request(server.addr, b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 404);
}

#[test]
fn malformed_request_gets_400() {
    let server = TestServer::start(ServerOptions::default(), None, |_| Box::new(Ok200));
    let resp = request(server.addr, b"BOGUS\r\n\r\n");
    assert_eq!(resp.status, 400);
}

struct Teapot {
    ended: Arc<AtomicU32>,
}

impl Handler for Teapot {
    fn handle_request(&self, _req: &mut Request) -> Result<bool> {
        Err(Error::status(418, "short and stout"))
    }

    fn end_request(&self, _req: &mut Request) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn handler_domain_error_maps_to_status() {
    let ended = Arc::new(AtomicU32::new(0));
    let ended2 = Arc::clone(&ended);
    let server = TestServer::start(ServerOptions::default(), None, move |_| {
        Box::new(Teapot { ended: ended2 })
    });

    let resp = request(server.addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 418);
    assert_eq!(ended.load(Ordering::SeqCst), 1, "end_request fired once");
}

struct Panicker {
    ended: Arc<AtomicU32>,
}

impl Handler for Panicker {
    fn handle_request(&self, _req: &mut Request) -> Result<bool> {
        panic!("handler bug")
    }

    fn end_request(&self, _req: &mut Request) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn handler_panic_maps_to_500_and_still_ends_request() {
    let ended = Arc::new(AtomicU32::new(0));
    let ended2 = Arc::clone(&ended);
    let server = TestServer::start(ServerOptions::default(), None, move |_| {
        Box::new(Panicker { ended: ended2 })
    });

    let resp = request(server.addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 500);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
}

struct Offload {
    pool: WorkerPool,
}

impl Handler for Offload {
    fn handle_request(&self, req: &mut Request) -> Result<bool> {
        if req.uri() == "/slow" {
            let responder = req.responder();
            self.pool.submit(
                AsyncTask::new(|_| {
                    std::thread::sleep(Duration::from_millis(50));
                    Ok("done".to_owned())
                })
                .on_success(move |body: String| {
                    responder.respond(Response::new(200).body(body));
                }),
            );
            Ok(true)
        } else {
            req.reply(Response::new(200).body("fast"));
            Ok(true)
        }
    }
}

#[test]
fn offloaded_work_defers_reply_and_keeps_reactor_responsive() {
    let server = TestServer::start(ServerOptions::default(), None, |reactor| {
        Box::new(Offload {
            pool: WorkerPool::new(reactor, 2).expect("pool"),
        })
    });

    let mut slow = server.connect();
    let slow_start = Instant::now();
    slow.write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("write");

    // A second request served while the first sleeps on a pool thread.
    let mut fast = server.connect();
    let fast_start = Instant::now();
    let fast_resp = roundtrip(&mut fast, b"GET /fast HTTP/1.1\r\nHost: x\r\n\r\n");
    let fast_latency = fast_start.elapsed();
    assert_eq!(fast_resp.body_str(), "fast");
    assert!(
        fast_latency < Duration::from_millis(50),
        "reactor blocked behind offloaded work: {fast_latency:?}"
    );

    let slow_resp = read_response(&mut slow);
    assert!(slow_start.elapsed() >= Duration::from_millis(50));
    assert_eq!(slow_resp.status, 200);
    assert_eq!(slow_resp.body_str(), "done");
}

#[test]
fn connection_cap_applies_backpressure() {
    let stats = CounterStats::new();
    let server = TestServer::start(
        ServerOptions::default().max_connections(2),
        Some(Arc::clone(&stats) as Arc<dyn StatsSink>),
        |_| Box::new(Ok200),
    );

    let mut c1 = server.connect();
    assert_eq!(roundtrip(&mut c1, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").status, 200);
    let mut c2 = server.connect();
    assert_eq!(roundtrip(&mut c2, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").status, 200);

    // The third connect lands in the kernel queue; the server has stopped
    // accepting, so its request goes unanswered.
    let mut c3 = server.connect();
    c3.set_read_timeout(Some(Duration::from_millis(300)))
        .expect("read timeout");
    c3.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("write");
    let mut probe = [0u8; 1];
    let err = c3.read(&mut probe).expect_err("reply before capacity");
    assert!(
        matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
        "unexpected error: {err:?}"
    );

    // A departing connection resumes accepting and the third is served.
    drop(c1);
    c3.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let resp = read_response(&mut c3);
    assert_eq!(resp.status, 200);
    assert!(stats.get("rejected") >= 1);
    assert_eq!(stats.get("accepted"), 3);
}

struct EvictOldest;

impl Handler for EvictOldest {
    fn handle_request(&self, req: &mut Request) -> Result<bool> {
        req.reply(Response::new(200).body("ok"));
        Ok(true)
    }

    fn evict(&self, connections: &[ConnectionInfo]) -> Vec<u64> {
        connections.first().map(|c| c.id).into_iter().collect()
    }
}

#[test]
fn evict_hook_makes_room_at_cap() {
    let server = TestServer::start(
        ServerOptions::default().max_connections(1),
        None,
        |_| Box::new(EvictOldest),
    );

    let mut c1 = server.connect();
    assert_eq!(roundtrip(&mut c1, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").status, 200);

    // At the cap the handler evicts the oldest, so this is served at once.
    let mut c2 = server.connect();
    assert_eq!(roundtrip(&mut c2, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").status, 200);

    // The evicted connection observes a close.
    let mut probe = [0u8; 1];
    let n = c1.read(&mut probe);
    assert!(matches!(n, Ok(0) | Err(_)), "evicted connection still open");
}

#[test]
fn idle_connection_expires_after_ttl() {
    let stats = CounterStats::new();
    let server = TestServer::start(
        ServerOptions::default().max_connection_ttl(Duration::from_secs(1)),
        Some(Arc::clone(&stats) as Arc<dyn StatsSink>),
        |_| Box::new(Ok200),
    );

    let mut idle = server.connect();
    idle.set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");

    let start = Instant::now();
    let mut probe = [0u8; 1];
    let closed = idle.read(&mut probe);
    assert!(
        matches!(closed, Ok(0) | Err(_)),
        "expected server-side close, got {closed:?}"
    );
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(900), "closed too early: {waited:?}");
    assert!(waited < Duration::from_secs(5), "closed too late: {waited:?}");
    assert_eq!(stats.get("timedout"), 1);
}

#[test]
fn header_block_boundary() {
    let head = b"GET / HTTP/1.1\r\nHost: aaaa\r\n\r\n";

    let exact = TestServer::start(
        ServerOptions::default().max_header_size(head.len()),
        None,
        |_| Box::new(Ok200),
    );
    assert_eq!(request(exact.addr, head).status, 200);

    let under = TestServer::start(
        ServerOptions::default().max_header_size(head.len() - 1),
        None,
        |_| Box::new(Ok200),
    );
    assert_eq!(request(under.addr, head).status, 431);
}

#[test]
fn body_boundary_and_echo_roundtrip() {
    let server = TestServer::start(
        ServerOptions::default().max_body_size(8),
        None,
        |_| Box::new(Echo),
    );

    let at_limit = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 8\r\n\r\n12345678";
    let resp = request(server.addr, at_limit);
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"12345678");

    let over = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 9\r\n\r\n123456789";
    assert_eq!(request(server.addr, over).status, 413);
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = TestServer::start(ServerOptions::default(), None, |_| Box::new(Echo));

    let mut conn = server.connect();
    let first = roundtrip(
        &mut conn,
        b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc",
    );
    assert_eq!(first.body, b"abc");

    let second = roundtrip(
        &mut conn,
        b"POST /b HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nxyz",
    );
    assert_eq!(second.body, b"xyz");
}

#[test]
fn http10_connection_closes_after_reply() {
    let server = TestServer::start(ServerOptions::default(), None, |_| Box::new(Echo));

    let mut conn = server.connect();
    let resp = roundtrip(&mut conn, b"GET / HTTP/1.0\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("connection"), Some("close"));

    let mut probe = [0u8; 1];
    let n = conn.read(&mut probe);
    assert!(matches!(n, Ok(0) | Err(_)), "connection not closed");
}

#[test]
fn request_ids_and_client_ip_are_populated() {
    struct Introspect;

    impl Handler for Introspect {
        fn handle_request(&self, req: &mut Request) -> Result<bool> {
            let client = req.client_ip().expect("client ip");
            let body = format!("{}:{}", req.id(), client.ip());
            req.reply(Response::new(200).body(body));
            Ok(true)
        }
    }

    let server = TestServer::start(ServerOptions::default(), None, |_| Box::new(Introspect));
    let resp = request(server.addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(resp.status, 200);
    let (id, ip) = resp.body_str().split_once(':').expect("id:ip");
    assert!(id.parse::<u64>().expect("numeric id") > 0);
    assert_eq!(ip, "127.0.0.1");
}

#[test]
fn byte_counters_reach_stats_sink() {
    let stats = CounterStats::new();
    let server = TestServer::start(
        ServerOptions::default(),
        Some(Arc::clone(&stats) as Arc<dyn StatsSink>),
        |_| Box::new(Ok200),
    );

    let req = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let resp = request(server.addr, req);
    assert_eq!(resp.status, 200);

    // Counter writes race the client's read; spin briefly.
    let deadline = Instant::now() + Duration::from_secs(2);
    while stats.get("completed") == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(stats.get("completed"), 1);
    assert!(stats.get("bytes-in") >= req.len() as u64);
    assert!(stats.get("bytes-out") > 0);
}
