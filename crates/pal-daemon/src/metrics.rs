//! Per-label decryption counters.
//!
//! The counters are the only cross-request shared mutable state in the
//! daemon. They count attempted accesses: a label is recorded before the
//! authorization check, so denied requests show up too.

use std::collections::HashMap;
use std::sync::Mutex;

/// Monotonic decryption counters keyed by label.
#[derive(Debug, Default)]
pub struct DecryptionCounters {
    counts: Mutex<HashMap<String, u64>>,
}

impl DecryptionCounters {
    /// An empty counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `label`.
    pub fn record(&self, label: &str) {
        let mut counts = self.counts.lock().expect("label counter lock poisoned");
        *counts.entry(label.to_string()).or_insert(0) += 1;
    }

    /// A point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts
            .lock()
            .expect("label counter lock poisoned")
            .clone()
    }
}
