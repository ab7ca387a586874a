use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Execution {
    pub(crate) worker_id: usize,
    /// Global order of the recording across all keys.
    pub(crate) seq: u64,
}

/// Records which worker ran which unit of work, keyed by a test-chosen id.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tracker {
    runs: Arc<DashMap<u64, Vec<Execution>>>,
    seq: Arc<AtomicU64>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, key: u64, worker_id: usize) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.runs
            .entry(key)
            .or_default()
            .push(Execution { worker_id, seq });
    }

    pub(crate) fn runs(&self, key: u64) -> Vec<Execution> {
        self.runs
            .get(&key)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, key: u64) -> usize {
        self.runs.get(&key).map_or(0, |r| r.len())
    }

    /// Number of distinct keys recorded.
    pub(crate) fn len(&self) -> usize {
        self.runs.len()
    }

    /// Total recordings across keys.
    pub(crate) fn total(&self) -> usize {
        self.runs.iter().map(|r| r.len()).sum()
    }

    /// Sequence number of the first run of `key`.
    pub(crate) fn first_seq(&self, key: u64) -> Option<u64> {
        self.runs(key).first().map(|e| e.seq)
    }

    #[track_caller]
    pub(crate) fn assert_exactly_once(&self, keys: impl IntoIterator<Item = u64>) {
        for key in keys {
            assert_eq!(self.count(key), 1, "key {} ran {} times", key, self.count(key));
        }
    }
}
