//! Reactor loop behavior: timer accuracy, priority ordering, stop
//! semantics, and cross-thread activation.

mod common;

use common::init_logging;
use evhttp::reactor::{Flags, Reactor};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn timer_never_fires_early() {
    init_logging();
    let reactor = Reactor::new().expect("reactor");

    let fired_at = Rc::new(RefCell::new(Vec::new()));
    let mut handles = Vec::new();
    let start = Instant::now();
    for delay_ms in [10u64, 25, 40] {
        let f = Rc::clone(&fired_at);
        let timer = reactor.new_timer_event(Flags::NONE, move |_| {
            f.borrow_mut().push((delay_ms, Instant::now()));
        });
        timer
            .add(Some(Duration::from_millis(delay_ms)))
            .expect("add");
        handles.push(timer);
    }
    reactor.run().expect("run");

    let fired = fired_at.borrow();
    assert_eq!(fired.len(), 3);
    for (delay_ms, at) in fired.iter() {
        assert!(
            at.duration_since(start) >= Duration::from_millis(*delay_ms),
            "timer {delay_ms}ms fired early"
        );
    }
    // Deadlines fire in order.
    let delays: Vec<u64> = fired.iter().map(|(d, _)| *d).collect();
    assert_eq!(delays, vec![10, 25, 40]);
}

#[test]
fn strict_priority_order_within_turn() {
    init_logging();
    let reactor = Reactor::new().expect("reactor");
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for (priority, tag) in [(3u32, "d"), (0, "a"), (2, "c"), (1, "b"), (0, "a2")] {
        let o = Rc::clone(&order);
        let ev = reactor.new_self_event(Flags::NONE, move |_| o.borrow_mut().push(tag));
        ev.set_priority(priority);
        ev.activate();
        handles.push(ev);
    }
    reactor.run().expect("run");
    assert_eq!(*order.borrow(), vec!["a", "a2", "b", "c", "d"]);
}

#[test]
fn activation_preempts_lower_priority_work() {
    init_logging();
    let reactor = Reactor::new().expect("reactor");
    let order = Rc::new(RefCell::new(Vec::new()));

    // A priority-0 event activated from inside a running priority-0
    // callback runs before the already-queued priority-1 event.
    let o = Rc::clone(&order);
    let urgent = Rc::new(reactor.new_self_event(Flags::NONE, move |_| {
        o.borrow_mut().push("urgent");
    }));
    urgent.set_priority(0);

    let o = Rc::clone(&order);
    let u = Rc::clone(&urgent);
    let first = reactor.new_self_event(Flags::NONE, move |_| {
        o.borrow_mut().push("first");
        u.activate();
    });
    first.set_priority(0);

    let o = Rc::clone(&order);
    let low = reactor.new_self_event(Flags::NONE, move |_| {
        o.borrow_mut().push("low");
    });
    low.set_priority(1);

    first.activate();
    low.activate();
    reactor.run().expect("run");
    assert_eq!(*order.borrow(), vec!["first", "urgent", "low"]);
}

#[test]
fn stop_handle_interrupts_blocking_run() {
    init_logging();
    let reactor = Reactor::new().expect("reactor");

    // A far-future self-ref timer keeps the loop waiting.
    let timer = reactor.new_timer_event(Flags::NONE, |_| {});
    timer.add(Some(Duration::from_secs(3600))).expect("add");

    let stop = reactor.stop_handle();
    let t = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        stop.stop();
    });

    let start = Instant::now();
    reactor.run().expect("run");
    t.join().expect("stopper");
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn del_then_readd_rearms() {
    init_logging();
    let reactor = Reactor::new().expect("reactor");
    let count = Rc::new(Cell::new(0u32));

    let c = Rc::clone(&count);
    let timer = reactor.new_timer_event(Flags::NONE, move |_| c.set(c.get() + 1));
    timer.add(Some(Duration::from_millis(10))).expect("add");
    assert!(timer.is_pending());
    timer.del();
    assert!(!timer.is_pending());
    reactor.run().expect("run");
    assert_eq!(count.get(), 0);

    timer.add(Some(Duration::from_millis(5))).expect("re-add");
    reactor.run().expect("run");
    assert_eq!(count.get(), 1);
}

#[test]
fn remote_activation_from_worker_thread() {
    init_logging();
    let reactor = Reactor::new().expect("reactor");
    reactor.enable_threads();

    let hits = Rc::new(Cell::new(0u32));
    let h = Rc::clone(&hits);
    let stop = reactor.stop_handle();
    let ev = reactor.new_self_event(Flags::NONE, move |_| {
        h.set(h.get() + 1);
        if h.get() == 4 {
            stop.stop();
        }
    });
    ev.add(None).expect("add");
    let remote = ev.remote().expect("remote");

    let mut threads = Vec::new();
    for _ in 0..4 {
        let r = remote.clone();
        threads.push(std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            r.activate().expect("activate");
        }));
    }
    reactor.run().expect("run");
    for t in threads {
        t.join().expect("thread");
    }
    assert_eq!(hits.get(), 4);
}
