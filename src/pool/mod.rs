//! Fixed-size worker pool with reactor-thread completion dispatch.
//!
//! The pool owns two priority queues behind a single mutex: `ready` holds
//! submitted tasks, `completed` holds finished ones. Worker threads park on
//! a condition variable, pop the highest-priority ready task, run it with
//! the lock released, capture any failure into the task, push it onto
//! `completed`, and activate a pre-registered reactor event. The reactor
//! then drains `completed` and fires each task's callbacks in order:
//! `success` or `error`, then `complete`.
//!
//! Stopping is cooperative: [`WorkerPool::stop`] raises the shutdown flag
//! and wakes every worker; workers finish draining the ready queue before
//! exiting, so every submitted task still reaches `complete`.

mod task;

pub use task::{AsyncTask, ShutdownToken, TaskState};

use crate::error::{Error, Result};
use crate::reactor::{EventHandle, Flags, Reactor, RemoteEvent};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// The shippable half of a task: travels to a worker and back.
struct PoolTask {
    id: u64,
    priority: u8,
    state: TaskState,
    error: Option<Error>,
    work: Option<Box<dyn FnOnce(&ShutdownToken) -> Result<()> + Send>>,
}

/// Heap entry ordered by priority (max first), ties broken FIFO by `seq`.
struct QueuedTask {
    seq: u64,
    task: PoolTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queues {
    ready: BinaryHeap<QueuedTask>,
    completed: BinaryHeap<QueuedTask>,
    ready_seq: u64,
    completed_seq: u64,
}

/// State shared between the reactor side and the worker threads.
struct PoolShared {
    queues: Mutex<Queues>,
    available: Condvar,
    shutdown: Arc<AtomicBool>,
}

/// Reactor-side callbacks held until the task's completion is drained.
struct TaskCallbacks {
    success: Box<dyn FnOnce()>,
    error: Box<dyn FnOnce(Error)>,
    complete: Box<dyn FnOnce()>,
}

type CallbackMap = Rc<RefCell<HashMap<u64, TaskCallbacks>>>;

/// Fixed-size pool of worker threads feeding completions back to a
/// [`Reactor`].
///
/// The pool lives on the reactor thread; only the work closures cross onto
/// the workers. Construction requires [`Reactor::enable_threads`].
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    callbacks: CallbackMap,
    workers: Mutex<Vec<JoinHandle<()>>>,
    // Held so completions keep being delivered; dropped with the pool.
    _completion_event: EventHandle,
    next_id: std::cell::Cell<u64>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool of `size` worker threads and registers its completion
    /// event with `reactor`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ThreadsNotEnabled`] if
    /// [`Reactor::enable_threads`] was not called first.
    pub fn new(reactor: &Reactor, size: usize) -> Result<Self> {
        if !reactor.threads_enabled() {
            return Err(Error::ThreadsNotEnabled);
        }
        assert!(size > 0, "worker pool size must be at least 1");

        let shared = Arc::new(PoolShared {
            queues: Mutex::new(Queues::default()),
            available: Condvar::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        let callbacks: CallbackMap = Rc::new(RefCell::new(HashMap::new()));

        let drain_shared = Arc::clone(&shared);
        let drain_callbacks = Rc::clone(&callbacks);
        let completion_event = reactor.new_self_event(Flags::NO_SELF_REF, move |_| {
            drain_completed(&drain_shared, &drain_callbacks);
        });
        let signal = completion_event.remote()?;

        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let worker_shared = Arc::clone(&shared);
            let worker_signal = signal.clone();
            let handle = thread::Builder::new()
                .name(format!("evhttp-worker-{n}"))
                .spawn(move || worker_loop(&worker_shared, &worker_signal))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Ok(Self {
            shared,
            callbacks,
            workers: Mutex::new(workers),
            _completion_event: completion_event,
            next_id: std::cell::Cell::new(1),
            size,
        })
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of tasks waiting to run.
    #[must_use]
    pub fn num_ready(&self) -> usize {
        self.shared.queues.lock().ready.len()
    }

    /// Returns the number of finished tasks not yet dispatched.
    #[must_use]
    pub fn num_completed(&self) -> usize {
        self.shared.queues.lock().completed.len()
    }

    /// Submits a task. Ownership passes to the pool until `complete` has
    /// fired on the reactor thread.
    pub fn submit<T: Send + 'static>(&self, task: AsyncTask<T>) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            warn!("task submitted to a stopped pool; it will not run");
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let AsyncTask {
            priority,
            work,
            on_success,
            on_error,
            on_complete,
        } = task;

        // The produced value crosses back through this slot; the callbacks
        // themselves never leave the reactor thread.
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let work_slot = Arc::clone(&slot);
        let send_work = Box::new(move |token: &ShutdownToken| -> Result<()> {
            let value = work(token)?;
            *work_slot.lock() = Some(value);
            Ok(())
        });

        self.callbacks.borrow_mut().insert(
            id,
            TaskCallbacks {
                success: Box::new(move || {
                    if let Some(value) = slot.lock().take() {
                        if let Some(f) = on_success {
                            f(value);
                        }
                    }
                }),
                error: Box::new(move |err| {
                    if let Some(f) = on_error {
                        f(err);
                    }
                }),
                complete: Box::new(move || {
                    if let Some(f) = on_complete {
                        f();
                    }
                }),
            },
        );

        let mut queues = self.shared.queues.lock();
        let seq = queues.ready_seq;
        queues.ready_seq += 1;
        queues.ready.push(QueuedTask {
            seq,
            task: PoolTask {
                id,
                priority,
                state: TaskState::Pending,
                error: None,
                work: Some(send_work),
            },
        });
        drop(queues);
        self.shared.available.notify_one();
    }

    /// Signals shutdown and wakes every worker. Already-queued tasks still
    /// run to completion.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
    }

    /// Stops the pool and blocks until all workers have exited. Completions
    /// already signaled are delivered on the next reactor turn.
    pub fn join(&self) {
        self.stop();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked outside task execution");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.shared.queues.lock();
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("ready", &queues.ready.len())
            .field("completed", &queues.completed.len())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &PoolShared, signal: &RemoteEvent) {
    let token = ShutdownToken {
        flag: Arc::clone(&shared.shutdown),
    };
    loop {
        let mut queued = {
            let mut queues = shared.queues.lock();
            loop {
                if let Some(t) = queues.ready.pop() {
                    break t;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.available.wait(&mut queues);
            }
        };

        queued.task.state = TaskState::Running;
        let work = queued.task.work.take();
        let outcome = catch_unwind(AssertUnwindSafe(|| match work {
            Some(work) => work(&token),
            None => Ok(()),
        }));
        match outcome {
            Ok(Ok(())) => queued.task.state = TaskState::Succeeded,
            Ok(Err(err)) => {
                queued.task.state = TaskState::Failed;
                queued.task.error = Some(err);
            }
            Err(payload) => {
                queued.task.state = TaskState::Failed;
                queued.task.error = Some(task::panic_to_error(payload.as_ref()));
            }
        }

        let mut queues = shared.queues.lock();
        let seq = queues.completed_seq;
        queues.completed_seq += 1;
        queued.seq = seq;
        queues.completed.push(queued);
        drop(queues);

        if signal.activate().is_err() {
            debug!("reactor gone; completion not deliverable");
        }
    }
}

/// Reactor-side completion drain: pops finished tasks with the lock
/// released around their callbacks and fires `success`/`error` then
/// `complete`. A panicking callback is logged and does not abort the drain.
fn drain_completed(shared: &PoolShared, callbacks: &CallbackMap) {
    loop {
        let queued = {
            let mut queues = shared.queues.lock();
            match queues.completed.pop() {
                Some(t) => t,
                None => break,
            }
        };
        let Some(cbs) = callbacks.borrow_mut().remove(&queued.task.id) else {
            continue;
        };

        let failed = queued.task.state == TaskState::Failed;
        let captured = queued.task.error;
        let first: Box<dyn FnOnce()> = if failed {
            let err = captured.unwrap_or(Error::Unknown);
            Box::new(move || (cbs.error)(err))
        } else {
            cbs.success
        };
        if catch_unwind(AssertUnwindSafe(first)).is_err() {
            error!(task = queued.task.id, "task completion callback panicked");
        }
        if catch_unwind(AssertUnwindSafe(cbs.complete)).is_err() {
            error!(task = queued.task.id, "task complete callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn pool_requires_enabled_threads() {
        let reactor = Reactor::new().expect("reactor");
        assert!(matches!(
            WorkerPool::new(&reactor, 2),
            Err(Error::ThreadsNotEnabled)
        ));
    }

    #[test]
    fn success_then_complete_on_reactor_thread() {
        let reactor = Reactor::new().expect("reactor");
        reactor.enable_threads();
        let pool = WorkerPool::new(&reactor, 2).expect("pool");

        let reactor_thread = thread::current().id();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = Rc::clone(&order);
        let o2 = Rc::clone(&order);
        pool.submit(
            AsyncTask::new(|_| Ok(41 + 1))
                .on_success(move |v: i32| {
                    assert_eq!(thread::current().id(), reactor_thread);
                    o1.borrow_mut().push(format!("success:{v}"));
                })
                .on_complete(move || {
                    assert_eq!(thread::current().id(), reactor_thread);
                    o2.borrow_mut().push("complete".to_owned());
                }),
        );

        pool.join();
        reactor.run().expect("run");
        assert_eq!(*order.borrow(), vec!["success:42", "complete"]);
    }

    #[test]
    fn error_is_captured_as_value() {
        let reactor = Reactor::new().expect("reactor");
        reactor.enable_threads();
        let pool = WorkerPool::new(&reactor, 1).expect("pool");

        let seen = Rc::new(RefCell::new(None));
        let s = Rc::clone(&seen);
        pool.submit(
            AsyncTask::<()>::new(|_| Err(Error::status(503, "overloaded")))
                .on_error(move |e| *s.borrow_mut() = Some(e.to_string()))
                .on_success(|()| panic!("must not fire")),
        );

        pool.join();
        reactor.run().expect("run");
        assert_eq!(seen.borrow().as_deref(), Some("overloaded"));
    }

    #[test]
    fn panic_becomes_unknown_exception() {
        let reactor = Reactor::new().expect("reactor");
        reactor.enable_threads();
        let pool = WorkerPool::new(&reactor, 1).expect("pool");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s1 = Rc::clone(&seen);
        let s2 = Rc::clone(&seen);
        pool.submit(
            AsyncTask::<()>::new(|_| std::panic::panic_any(17u32))
                .on_error(move |e| s1.borrow_mut().push(e.to_string())),
        );
        pool.submit(
            AsyncTask::<()>::new(|_| panic!("named failure"))
                .on_error(move |e| s2.borrow_mut().push(e.to_string())),
        );

        pool.join();
        reactor.run().expect("run");
        let mut seen = seen.borrow().clone();
        seen.sort();
        assert_eq!(seen, vec!["Unknown exception", "named failure"]);
    }

    #[test]
    fn join_drains_queued_tasks() {
        let reactor = Reactor::new().expect("reactor");
        reactor.enable_threads();
        let pool = WorkerPool::new(&reactor, 1).expect("pool");

        let completions = Rc::new(Cell::new(0u32));
        for _ in 0..20 {
            let c = Rc::clone(&completions);
            pool.submit(
                AsyncTask::new(|_| {
                    thread::sleep(Duration::from_millis(1));
                    Ok(())
                })
                .on_complete(move || c.set(c.get() + 1)),
            );
        }

        pool.join();
        reactor.run().expect("run");
        assert_eq!(completions.get(), 20);
    }

    #[test]
    fn higher_priority_runs_first() {
        let reactor = Reactor::new().expect("reactor");
        reactor.enable_threads();
        let pool = WorkerPool::new(&reactor, 1).expect("pool");

        // Occupy the single worker so the remaining tasks queue up.
        let gate = Arc::new(AtomicBool::new(false));
        let g = Arc::clone(&gate);
        pool.submit(AsyncTask::new(move |_| {
            while !g.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }));
        thread::sleep(Duration::from_millis(20));

        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [(0u8, "low"), (5, "high"), (2, "mid")] {
            let o = Arc::clone(&order);
            pool.submit(
                AsyncTask::new(move |_| {
                    o.lock().push(tag);
                    Ok(())
                })
                .priority(priority),
            );
        }

        gate.store(true, Ordering::Release);
        pool.join();
        reactor.run().expect("run");
        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn shutdown_token_visible_to_tasks() {
        let reactor = Reactor::new().expect("reactor");
        reactor.enable_threads();
        let pool = WorkerPool::new(&reactor, 1).expect("pool");

        let observed = Arc::new(AtomicBool::new(false));
        let o = Arc::clone(&observed);
        pool.submit(AsyncTask::new(move |token| {
            while !token.should_shutdown() {
                thread::sleep(Duration::from_millis(1));
            }
            o.store(true, Ordering::Release);
            Ok(())
        }));

        thread::sleep(Duration::from_millis(20));
        pool.join();
        assert!(observed.load(Ordering::Acquire));
        reactor.run().expect("run");
    }

    #[test]
    fn callback_panic_does_not_abort_drain() {
        let reactor = Reactor::new().expect("reactor");
        reactor.enable_threads();
        let pool = WorkerPool::new(&reactor, 1).expect("pool");

        let later = Rc::new(Cell::new(false));
        let l = Rc::clone(&later);
        pool.submit(AsyncTask::new(|_| Ok(())).on_success(|()| panic!("bad callback")));
        pool.submit(AsyncTask::new(|_| Ok(())).on_complete(move || l.set(true)));

        pool.join();
        reactor.run().expect("run");
        assert!(later.get());
    }
}
