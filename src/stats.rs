//! Statistics sinks.
//!
//! The server and its connections emit named counter updates to an optional
//! [`StatsSink`]. Sinks must be internally thread-safe: worker threads and
//! the reactor thread both write to them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A sink for named event counters.
///
/// Counters emitted by the server core: `accepted`, `timedout`, `rejected`,
/// `completed`, `errors`, `bytes-in`, `bytes-out`.
pub trait StatsSink: Send + Sync {
    /// Records a single occurrence of `name`.
    fn event(&self, name: &str) {
        self.count(name, 1);
    }

    /// Adds `n` to the counter `name`.
    fn count(&self, name: &str, n: u64);
}

/// An in-memory [`StatsSink`] keyed by counter name.
#[derive(Debug, Default)]
pub struct CounterStats {
    counters: Mutex<HashMap<String, u64>>,
}

impl CounterStats {
    /// Creates an empty counter set.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the current value of `name`, or 0 if never written.
    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }
}

impl StatsSink for CounterStats {
    fn count(&self, name: &str, n: u64) {
        *self.counters.lock().entry(name.to_owned()).or_insert(0) += n;
    }
}
