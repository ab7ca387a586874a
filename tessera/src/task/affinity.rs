use std::fmt;

/// Maximum number of workers an executor can manage. The limit comes from
/// using a `u64` as the worker selection bitmask.
pub const MAX_WORKERS: usize = 64;

/// Set of workers allowed to execute a task, one bit per worker id.
///
/// An empty or full mask means "any worker".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AffinityMask(u64);

impl AffinityMask {
    pub const ANY: AffinityMask = AffinityMask(u64::MAX);

    pub const fn from_bits(bits: u64) -> Self {
        AffinityMask(bits)
    }

    /// Mask selecting a single worker.
    #[track_caller]
    pub fn worker(id: usize) -> Self {
        assert!(id < MAX_WORKERS, "worker id {} out of range", id);
        AffinityMask(1 << id)
    }

    /// Adds `id` to the mask. Adding to an "any" mask narrows it to `id`.
    #[track_caller]
    pub fn with_worker(self, id: usize) -> Self {
        let bits = if self.0 == u64::MAX { 0 } else { self.0 };
        AffinityMask(bits | AffinityMask::worker(id).0)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn is_any(&self) -> bool {
        self.0 == 0 || self.0 == u64::MAX
    }

    #[inline]
    pub fn allows(&self, worker_id: usize) -> bool {
        self.is_any() || (worker_id < MAX_WORKERS && self.0 & (1 << worker_id) != 0)
    }

    /// Workers from `worker_bits` that may run the task. Zero means no live
    /// worker is eligible.
    #[inline]
    pub(crate) fn eligible(&self, worker_bits: u64) -> u64 {
        if self.is_any() {
            worker_bits
        } else {
            self.0 & worker_bits
        }
    }

    /// True when every live worker is eligible, so the task may go through
    /// the shared submission queue.
    #[inline]
    pub(crate) fn covers(&self, worker_bits: u64) -> bool {
        self.eligible(worker_bits) == worker_bits
    }
}

impl fmt::Debug for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            f.write_str("AffinityMask(any)")
        } else {
            write!(f, "AffinityMask({:#018x})", self.0)
        }
    }
}

/// Bits for workers `0..count`.
pub(crate) fn worker_bits(count: usize) -> u64 {
    debug_assert!(count > 0 && count <= MAX_WORKERS);
    if count == MAX_WORKERS {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}
