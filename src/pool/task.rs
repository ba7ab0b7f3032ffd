//! Units of work submitted to the worker pool.
//!
//! An [`AsyncTask`] bundles a blocking `work` closure, executed on a pool
//! thread, with up to three callbacks that the pool fires back on the
//! reactor thread once the work completes: exactly one of `success` or
//! `error`, always followed by `complete`. The work closure must be `Send`;
//! the callbacks never leave the reactor thread and may capture
//! reactor-side state freely.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Execution state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// Currently executing on a pool thread.
    Running,
    /// `run` returned without error.
    Succeeded,
    /// `run` returned an error or panicked.
    Failed,
}

/// Cooperative shutdown signal observable from inside task work.
///
/// Long-running work should poll [`should_shutdown`](Self::should_shutdown)
/// and bail out early when the pool is stopping; tasks are never interrupted
/// mid-run.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    pub(crate) flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    /// Returns true once the pool has been asked to stop.
    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A unit of blocking work with reactor-thread completion callbacks.
///
/// `T` is the value produced by the work closure and handed to the
/// `success` callback.
///
/// ```ignore
/// let task = AsyncTask::new(|_token| Ok(expensive_lookup()?))
///     .priority(3)
///     .on_success(move |value| responder.respond(render(value)))
///     .on_error(|err| tracing::warn!(%err, "lookup failed"));
/// pool.submit(task);
/// ```
pub struct AsyncTask<T: Send + 'static = ()> {
    pub(crate) priority: u8,
    pub(crate) work: Box<dyn FnOnce(&ShutdownToken) -> Result<T> + Send>,
    pub(crate) on_success: Option<Box<dyn FnOnce(T)>>,
    pub(crate) on_error: Option<Box<dyn FnOnce(Error)>>,
    pub(crate) on_complete: Option<Box<dyn FnOnce()>>,
}

impl<T: Send + 'static> AsyncTask<T> {
    /// Creates a task around a blocking work closure.
    pub fn new(work: impl FnOnce(&ShutdownToken) -> Result<T> + Send + 'static) -> Self {
        Self {
            priority: 0,
            work: Box::new(work),
            on_success: None,
            on_error: None,
            on_complete: None,
        }
    }

    /// Sets the queue priority; higher values run first.
    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Callback fired on the reactor thread when the work succeeds.
    #[must_use]
    pub fn on_success(mut self, f: impl FnOnce(T) + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Callback fired on the reactor thread when the work fails.
    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(Error) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Callback fired on the reactor thread after `success` or `error`.
    #[must_use]
    pub fn on_complete(mut self, f: impl FnOnce() + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl<T: Send + 'static> std::fmt::Debug for AsyncTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTask")
            .field("priority", &self.priority)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Coerces a panic payload into a captured error value.
pub(crate) fn panic_to_error(payload: &(dyn std::any::Any + Send)) -> Error {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        Error::Message((*msg).to_owned())
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        Error::Message(msg.clone())
    } else {
        Error::Unknown
    }
}
