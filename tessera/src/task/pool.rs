use crate::error::SchedError;
use crate::scope::ScopeState;
use crate::task::header::Header;
use crate::task::{AffinityMask, Task, TaskData, TaskKind};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on recycled slots kept per kind. Anything beyond goes back to
/// the allocator so a burst of tasks does not pin memory forever.
const MAX_FREE_PER_KIND: usize = 4096;

#[derive(Debug, Default)]
struct PoolCounters {
    live: AtomicUsize,
}

/// Accounts for one live task against the pool bound.
#[derive(Debug)]
pub(crate) struct Lease(Arc<PoolCounters>);

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Task allocator with one free-list per task kind.
///
/// Retired tasks whose handle is no longer shared are reset and parked in the
/// free-list of their kind, so the steady state of a scheduler running many
/// short-lived slices and shards does not touch the global allocator.
pub(crate) struct TaskPool {
    free: [Mutex<Vec<Arc<Header>>>; TaskKind::COUNT],
    counters: Arc<PoolCounters>,
    max_tasks: Option<usize>,
}

impl TaskPool {
    pub(crate) fn new(max_tasks: Option<usize>) -> Self {
        Self {
            free: std::array::from_fn(|_| Mutex::new(Vec::new())),
            counters: Arc::new(PoolCounters::default()),
            max_tasks,
        }
    }

    /// Pre-allocates `count` slots in the free-list of `kind`.
    pub(crate) fn reserve(&self, kind: TaskKind, count: usize) {
        if count == 0 {
            return;
        }

        let scratch = ScopeState::detached();
        let mut free = self.free[kind.index()].lock();
        free.reserve(count);

        for _ in 0..count {
            let mut header = Header::new(
                TaskData::Nop,
                AffinityMask::ANY,
                &scratch,
                Lease(self.lease_unchecked()),
            );
            header.release();
            free.push(Arc::new(header));
        }
    }

    pub(crate) fn acquire(
        &self,
        data: TaskData,
        affinity: AffinityMask,
        scope: &Arc<ScopeState>,
    ) -> Result<Task, SchedError> {
        let lease = self.lease()?;
        let kind = data.kind();

        let recycled = self.free[kind.index()].lock().pop();
        let header = match recycled {
            Some(mut slot) => match Arc::get_mut(&mut slot) {
                Some(header) => {
                    *header = Header::new(data, affinity, scope, lease);
                    slot
                }
                // Free-list slots are never shared, but fall back to a fresh
                // allocation rather than trusting that blindly.
                None => Arc::new(Header::new(data, affinity, scope, lease)),
            },
            None => Arc::new(Header::new(data, affinity, scope, lease)),
        };

        Ok(Task(header))
    }

    /// Returns a retired task to its free-list when nobody else holds it.
    pub(crate) fn recycle(&self, task: Task) {
        let Task(mut slot) = task;

        if let Some(header) = Arc::get_mut(&mut slot) {
            header.release();

            let mut free = self.free[header.kind().index()].lock();
            if free.len() < MAX_FREE_PER_KIND {
                free.push(slot);
            }
        }
    }

    /// Number of tasks handed out and not yet released.
    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self, kind: TaskKind) -> usize {
        self.free[kind.index()].lock().len()
    }

    fn lease(&self) -> Result<Lease, SchedError> {
        let Some(max) = self.max_tasks else {
            return Ok(Lease(self.lease_unchecked()));
        };

        self.counters
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .map(|_| Lease(Arc::clone(&self.counters)))
            .map_err(|live| {
                SchedError::exhausted(format!("task pool at capacity ({} of {})", live, max))
            })
    }

    fn lease_unchecked(&self) -> Arc<PoolCounters> {
        self.counters.live.fetch_add(1, Ordering::AcqRel);
        Arc::clone(&self.counters)
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let free: [usize; TaskKind::COUNT] = std::array::from_fn(|i| self.free[i].lock().len());

        f.debug_struct("TaskPool")
            .field("live", &self.counters.live.load(Ordering::Acquire))
            .field("max_tasks", &self.max_tasks)
            .field("free", &free)
            .finish()
    }
}
