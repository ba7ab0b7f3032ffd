//! Single-threaded event reactor.
//!
//! The reactor multiplexes fd readiness, timers, and explicitly activated
//! events onto one thread. Fired registrations are moved into per-priority
//! ready queues and drained in strict priority order: all priority-0
//! callbacks run before any priority-1 callback, and newly activated events
//! are absorbed between callbacks so a high-priority completion can preempt
//! lower-priority I/O within the same loop turn.
//!
//! # Thread safety
//!
//! Registration, arming, and `run()` must all happen on the reactor's own
//! thread; the handle types are deliberately not `Send`. The only
//! cross-thread operations are [`RemoteEvent::activate`] and
//! [`StopHandle::stop`], both of which enqueue a wakeup the reactor
//! observes on its next iteration. Cross-thread activation requires
//! [`Reactor::enable_threads`] first; acquiring a [`RemoteEvent`] without
//! it is a configuration error.
//!
//! # Lifetime
//!
//! A pending registration keeps [`Reactor::run`] alive unless it was
//! created with [`Flags::NO_SELF_REF`]. `run()` returns once nothing
//! self-referential is pending and the ready queues are empty.

mod event;
mod timer;

pub use event::{Flags, Mask, Ready};

use crate::error::{Error, Result};
use crossbeam_queue::SegQueue;
use polling::{Event as PollEvent, Poller};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use timer::TimerHeap;
use tracing::{error, trace};

type Callback = Rc<RefCell<dyn FnMut(Ready)>>;

/// State shared with worker threads: the poller (whose `notify` is the
/// wakeup primitive) and the lock-free activation channel.
struct Shared {
    poller: Poller,
    injected: SegQueue<u64>,
    threads_enabled: AtomicBool,
    stopped: AtomicBool,
}

struct Entry {
    fd: Option<RawFd>,
    mask: Mask,
    flags: Flags,
    priority: u32,
    pending: bool,
    in_poller: bool,
    /// Generation of the live deadline in the timer heap; 0 = none.
    timer_gen: u64,
    /// Re-arm interval for persistent timers.
    period: Option<Duration>,
    /// Bumped by `del()`; firings queued under an older epoch are dropped.
    epoch: u64,
    callback: Callback,
}

struct Firing {
    id: u64,
    ready: Ready,
    epoch: u64,
    from_io: bool,
}

struct Inner {
    entries: HashMap<u64, Entry>,
    next_id: u64,
    timers: TimerHeap,
    ready: BTreeMap<u32, VecDeque<Firing>>,
}

/// Single-threaded event demultiplexer.
///
/// Cloning is cheap and yields another handle to the same loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
    shared: Arc<Shared>,
}

impl Reactor {
    /// Creates a new reactor.
    ///
    /// # Errors
    ///
    /// Fails if the OS poller cannot be created.
    pub fn new() -> Result<Self> {
        let poller = Poller::new()?;
        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                entries: HashMap::new(),
                next_id: 1,
                timers: TimerHeap::new(),
                ready: BTreeMap::new(),
            })),
            shared: Arc::new(Shared {
                poller,
                injected: SegQueue::new(),
                threads_enabled: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Permits cross-thread activation. Must be called before any
    /// [`EventHandle::remote`] handle is created.
    pub fn enable_threads(&self) {
        self.shared.threads_enabled.store(true, Ordering::SeqCst);
    }

    /// Returns whether cross-thread activation is enabled.
    #[must_use]
    pub fn threads_enabled(&self) -> bool {
        self.shared.threads_enabled.load(Ordering::SeqCst)
    }

    /// Registers an event that fires on fd readiness, with an optional
    /// per-arm deadline (see [`EventHandle::add`]).
    pub fn new_fd_event(
        &self,
        fd: RawFd,
        mask: Mask,
        flags: Flags,
        callback: impl FnMut(Ready) + 'static,
    ) -> EventHandle {
        self.register(Some(fd), mask, flags, callback)
    }

    /// Registers a pure timer event; the deadline is supplied to
    /// [`EventHandle::add`]. With [`Flags::PERSIST`] the timer re-fires at
    /// the same interval until deleted.
    pub fn new_timer_event(
        &self,
        flags: Flags,
        callback: impl FnMut(Ready) + 'static,
    ) -> EventHandle {
        self.register(None, Mask::TIMER, flags, callback)
    }

    /// Registers a self-activated event: it fires only through
    /// [`EventHandle::activate`] or [`RemoteEvent::activate`].
    pub fn new_self_event(
        &self,
        flags: Flags,
        callback: impl FnMut(Ready) + 'static,
    ) -> EventHandle {
        self.register(None, Mask::NONE, flags, callback)
    }

    fn register(
        &self,
        fd: Option<RawFd>,
        mask: Mask,
        flags: Flags,
        callback: impl FnMut(Ready) + 'static,
    ) -> EventHandle {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                fd,
                mask,
                flags,
                priority: 0,
                pending: false,
                in_poller: false,
                timer_gen: 0,
                period: None,
                epoch: 0,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        EventHandle {
            id,
            inner: Rc::downgrade(&self.inner),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns a `Send + Sync` handle that makes [`Reactor::run`] return.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Makes [`Reactor::run`] return after the current iteration.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Runs the event loop until stopped or until no self-referential
    /// registration remains pending.
    ///
    /// # Errors
    ///
    /// Fails if the OS poller fails; callback panics are caught, logged,
    /// and do not abort the loop.
    pub fn run(&self) -> Result<()> {
        self.shared.stopped.store(false, Ordering::SeqCst);
        let mut poll_events: Vec<PollEvent> = Vec::with_capacity(64);

        loop {
            if self.shared.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.absorb_activations();
            self.expire_timers(Instant::now());

            let (ready_empty, timeout, keep_alive) = {
                let inner = self.inner.borrow();
                let ready_empty = inner.ready.values().all(VecDeque::is_empty);
                let timeout = inner
                    .timers
                    .peek_deadline()
                    .map(|d| d.saturating_duration_since(Instant::now()));
                let keep_alive = inner
                    .entries
                    .values()
                    .any(|e| e.pending && !e.flags.is_no_self_ref());
                (ready_empty, timeout, keep_alive)
            };

            if ready_empty {
                if !keep_alive && self.shared.injected.is_empty() {
                    break;
                }
                poll_events.clear();
                match self.shared.poller.wait(&mut poll_events, timeout) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
                self.enqueue_io(&poll_events);
                // Deadlines that elapsed while we were waiting.
                self.expire_timers(Instant::now());
            }

            loop {
                if self.shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                self.absorb_activations();
                let Some(firing) = self.pop_ready() else { break };
                self.fire(&firing);
            }
        }
        Ok(())
    }

    /// Moves cross-thread activations into the ready queues.
    fn absorb_activations(&self) {
        while let Some(id) = self.shared.injected.pop() {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if let Some(e) = inner.entries.get(&id) {
                let firing = Firing {
                    id,
                    ready: Ready::ACTIVATED,
                    epoch: e.epoch,
                    from_io: false,
                };
                inner.ready.entry(e.priority).or_default().push_back(firing);
            }
        }
    }

    fn expire_timers(&self, now: Instant) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        for (id, generation) in inner.timers.pop_expired(now) {
            let Some(e) = inner.entries.get_mut(&id) else {
                continue;
            };
            if e.timer_gen != generation {
                continue; // stale: re-armed or cancelled since
            }
            e.timer_gen = 0;
            if e.flags.is_persist() {
                if let Some(period) = e.period {
                    e.timer_gen = inner.timers.insert(id, now + period);
                }
            } else {
                e.pending = false;
            }
            let firing = Firing {
                id,
                ready: Ready::TIMEOUT,
                epoch: e.epoch,
                from_io: false,
            };
            inner.ready.entry(e.priority).or_default().push_back(firing);
        }
    }

    fn enqueue_io(&self, events: &[PollEvent]) {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        for pe in events {
            let id = pe.key as u64;
            let Some(e) = inner.entries.get_mut(&id) else {
                continue; // wakeup notification or a since-dropped entry
            };
            if !e.pending {
                continue;
            }
            let mut ready = None;
            if pe.readable {
                ready = Some(Ready::READ);
            }
            if pe.writable {
                ready = Some(ready.map_or(Ready::WRITE, |r| r | Ready::WRITE));
            }
            let Some(ready) = ready else { continue };
            e.timer_gen = 0; // readiness cancels the phase deadline
            if !e.flags.is_persist() {
                e.pending = false;
            }
            let firing = Firing {
                id,
                ready,
                epoch: e.epoch,
                from_io: true,
            };
            inner.ready.entry(e.priority).or_default().push_back(firing);
        }
    }

    fn pop_ready(&self) -> Option<Firing> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let priority = inner
            .ready
            .iter()
            .find(|(_, q)| !q.is_empty())
            .map(|(p, _)| *p)?;
        inner.ready.get_mut(&priority).and_then(VecDeque::pop_front)
    }

    fn fire(&self, firing: &Firing) {
        let callback = {
            let inner = self.inner.borrow();
            let Some(e) = inner.entries.get(&firing.id) else {
                return;
            };
            if e.epoch != firing.epoch {
                trace!(event = firing.id, "skipping deleted firing");
                return;
            }
            Rc::clone(&e.callback)
        };

        // No reactor borrow is held here: the callback may freely re-arm,
        // delete, or register events.
        let ready = firing.ready;
        if catch_unwind(AssertUnwindSafe(|| (&mut *callback.borrow_mut())(ready))).is_err() {
            error!(event = firing.id, "event callback panicked; continuing");
        }

        // The poller disarms after delivery; persistent fd events re-arm.
        if firing.from_io {
            let inner = self.inner.borrow();
            if let Some(e) = inner.entries.get(&firing.id) {
                if e.flags.is_persist() && e.pending {
                    if let Some(fd) = e.fd {
                        let _ = self.shared.poller.modify(fd, poll_interest(firing.id, e.mask));
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Reactor")
            .field("registrations", &inner.entries.len())
            .field("timers", &inner.timers.len())
            .finish_non_exhaustive()
    }
}

fn poll_interest(id: u64, mask: Mask) -> PollEvent {
    let key = id as usize;
    match (mask.is_read(), mask.is_write()) {
        (true, true) => PollEvent::all(key),
        (true, false) => PollEvent::readable(key),
        (false, true) => PollEvent::writable(key),
        (false, false) => PollEvent::none(key),
    }
}

/// Owner handle for a registered event.
///
/// Dropping the handle deregisters the event. Only [`EventHandle::remote`]
/// handles may leave the reactor thread.
pub struct EventHandle {
    id: u64,
    inner: Weak<RefCell<Inner>>,
    shared: Arc<Shared>,
}

impl EventHandle {
    /// Arms the event.
    ///
    /// For timer events `delay` is the deadline (default: immediate). For
    /// fd events an optional `delay` arms a readiness deadline alongside:
    /// whichever happens first fires the callback, with [`Ready::TIMEOUT`]
    /// distinguishing the deadline case. Self events become pending and
    /// wait for activation.
    ///
    /// Non-persistent events disarm after one firing and may be re-armed
    /// by calling `add` again.
    ///
    /// # Errors
    ///
    /// Fails if the fd cannot be registered with the OS poller.
    pub fn add(&self, delay: Option<Duration>) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let mut guard = inner.borrow_mut();
        let inner = &mut *guard;
        let Some(e) = inner.entries.get_mut(&self.id) else {
            return Ok(());
        };

        e.pending = true;
        e.timer_gen = 0;
        if e.mask.is_timer() {
            let period = delay.unwrap_or(Duration::ZERO);
            e.timer_gen = inner.timers.insert(self.id, Instant::now() + period);
            e.period = e.flags.is_persist().then_some(period);
            return Ok(());
        }
        if let Some(fd) = e.fd {
            let interest = poll_interest(self.id, e.mask);
            if e.in_poller {
                self.shared.poller.modify(fd, interest)?;
            } else {
                self.shared.poller.add(fd, interest)?;
                e.in_poller = true;
            }
            if let Some(d) = delay {
                e.timer_gen = inner.timers.insert(self.id, Instant::now() + d);
            }
        }
        Ok(())
    }

    /// Disarms the event. After `del` returns, no queued firing for this
    /// registration is delivered; the handle may be re-armed with
    /// [`add`](Self::add). An explicit [`activate`](Self::activate) after
    /// `del` still fires.
    pub fn del(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut guard = inner.borrow_mut();
        if let Some(e) = guard.entries.get_mut(&self.id) {
            e.pending = false;
            e.timer_gen = 0;
            e.epoch += 1;
            if e.in_poller {
                if let Some(fd) = e.fd {
                    let _ = self.shared.poller.modify(fd, PollEvent::none(self.id as usize));
                }
            }
        }
    }

    /// Sets the event's priority; lower numbers run first within a turn.
    pub fn set_priority(&self, priority: u32) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(e) = inner.borrow_mut().entries.get_mut(&self.id) {
                e.priority = priority;
            }
        }
    }

    /// Replaces the fd interest used the next time the event is armed.
    pub fn set_mask(&self, mask: Mask) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(e) = inner.borrow_mut().entries.get_mut(&self.id) {
                e.mask = mask;
            }
        }
    }

    /// Returns true if the event is armed and waiting to fire.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner
            .upgrade()
            .and_then(|inner| inner.borrow().entries.get(&self.id).map(|e| e.pending))
            .unwrap_or(false)
    }

    /// Force-fires the callback on the next loop turn with
    /// [`Ready::ACTIVATED`], regardless of whether the event is armed.
    pub fn activate(&self) {
        self.shared.injected.push(self.id);
    }

    /// Returns a `Send + Sync` activation handle for use from other
    /// threads.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ThreadsNotEnabled`] unless
    /// [`Reactor::enable_threads`] was called.
    pub fn remote(&self) -> Result<RemoteEvent> {
        if !self.shared.threads_enabled.load(Ordering::SeqCst) {
            return Err(Error::ThreadsNotEnabled);
        }
        Ok(RemoteEvent {
            id: self.id,
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let removed = inner.borrow_mut().entries.remove(&self.id);
        if let Some(e) = removed {
            if e.in_poller {
                if let Some(fd) = e.fd {
                    let _ = self.shared.poller.delete(fd);
                }
            }
        }
    }
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Cross-thread activation handle for one event.
#[derive(Clone)]
pub struct RemoteEvent {
    id: u64,
    shared: Arc<Shared>,
}

impl RemoteEvent {
    /// Queues an activation and wakes the reactor.
    ///
    /// # Errors
    ///
    /// Fails if the wakeup cannot be delivered.
    pub fn activate(&self) -> io::Result<()> {
        self.shared.injected.push(self.id);
        self.shared.poller.notify()
    }
}

impl std::fmt::Debug for RemoteEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEvent").field("id", &self.id).finish()
    }
}

/// Cross-thread handle that stops a running reactor.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Makes [`Reactor::run`] return after its current iteration.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _ = self.shared.poller.notify();
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle").finish()
    }
}
