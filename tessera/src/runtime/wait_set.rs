use crate::error::{SchedError, TaskError, TaskStatus};
use crate::runtime::Event;
use crate::runtime::park::Signal;
use crate::task::Task;
use crate::utils::Deadline;
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Marker for "no designated waiter".
const NO_WAITER: usize = usize::MAX;

/// A WAIT task parked until its event is set or its deadline passes.
#[derive(Debug)]
pub(crate) struct PendingWait {
    pub(crate) task: Task,
    pub(crate) event: Event,
    pub(crate) deadline: Deadline,
}

impl PendingWait {
    fn resolve(&self) -> Option<TaskStatus> {
        if self.event.is_set() {
            Some(Ok(()))
        } else if self.deadline.has_elapsed() {
            Some(Err(TaskError::new(anyhow::Error::new(
                SchedError::DeadlineExceeded,
            ))))
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct WaitList {
    /// Waits promoted into the root wait-set, each subscribed to its event.
    slots: Slab<PendingWait>,

    /// Waits beyond the slot capacity. Promoted in FIFO order as slots free.
    overflow: VecDeque<PendingWait>,
}

pub(crate) type Resolved = SmallVec<[(Task, TaskStatus); 8]>;

/// Executor wait-set: up to `capacity` external events plus the reserved
/// internal wake handle.
///
/// Only the designated waiter blocks on it. The waiter role is a token taken
/// with a compare-and-set and released before the holder processes what woke
/// it, so no lock is held across the blocking wait.
#[derive(Debug)]
pub(crate) struct WaitSet {
    /// Reserved internal wake handle: new work, event signals, shutdown.
    wake: Arc<Signal>,

    waiter: AtomicBool,
    waiter_id: AtomicUsize,

    capacity: usize,
    waits: Mutex<WaitList>,
    pending: AtomicUsize,
}

impl WaitSet {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            wake: Arc::new(Signal::new()),
            waiter: AtomicBool::new(false),
            waiter_id: AtomicUsize::new(NO_WAITER),
            capacity,
            waits: Mutex::new(WaitList {
                slots: Slab::with_capacity(capacity),
                overflow: VecDeque::new(),
            }),
            pending: AtomicUsize::new(0),
        }
    }

    /// Parks a WAIT task until its event is set or its deadline passes.
    pub(crate) fn register(&self, wait: PendingWait) {
        {
            let mut waits = self.waits.lock();

            if waits.slots.len() < self.capacity {
                wait.event.subscribe(&self.wake);
                tracing::trace!(task = %wait.task.id(), "wait promoted to root wait-set");
                waits.slots.insert(wait);
            } else {
                tracing::warn!(
                    task = %wait.task.id(),
                    capacity = self.capacity,
                    "root wait-set full, deferring wait"
                );
                waits.overflow.push_back(wait);
            }

            self.pending.fetch_add(1, Ordering::AcqRel);
        }

        // The waiter must recompute its deadline and catch events that were
        // set before the subscription.
        self.wake.notify();
    }

    /// Removes and returns every wait that resolved, promoting deferred waits
    /// into freed slots. Non-blocking, callable from any worker.
    pub(crate) fn poll(&self) -> Resolved {
        let mut resolved = Resolved::new();
        let mut waits = self.waits.lock();

        loop {
            let done = waits
                .slots
                .iter()
                .filter_map(|(key, w)| w.resolve().map(|status| (key, status)))
                .collect::<SmallVec<[_; 8]>>();

            for (key, status) in done {
                let wait = waits.slots.remove(key);
                resolved.push((wait.task, status));
            }

            // Deferred waits still honor their deadline.
            let mut i = 0;
            while i < waits.overflow.len() {
                if waits.overflow[i].deadline.has_elapsed() {
                    if let Some(wait) = waits.overflow.remove(i) {
                        let status = wait.resolve().unwrap_or(Ok(()));
                        resolved.push((wait.task, status));
                    }
                } else {
                    i += 1;
                }
            }

            let mut promoted = false;
            while waits.slots.len() < self.capacity {
                let Some(wait) = waits.overflow.pop_front() else {
                    break;
                };
                wait.event.subscribe(&self.wake);
                waits.slots.insert(wait);
                promoted = true;
            }

            // Promoted waits may already be resolved, check them right away.
            if !promoted {
                break;
            }
        }

        self.pending.fetch_sub(resolved.len(), Ordering::AcqRel);
        resolved
    }

    /// Earliest deadline among promoted and deferred waits.
    pub(crate) fn next_deadline(&self) -> Deadline {
        let waits = self.waits.lock();

        waits
            .slots
            .iter()
            .map(|(_, w)| w.deadline)
            .chain(waits.overflow.iter().map(|w| w.deadline))
            .fold(Deadline::Infinite, Deadline::earliest)
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Posts to the reserved internal wake handle.
    pub(crate) fn wake(&self) {
        self.wake.notify();
    }

    /// Consumes a pending wake. Used by busy workers polling on behalf of
    /// an absent waiter.
    pub(crate) fn take_signal(&self) -> bool {
        self.wake.take()
    }

    /// Attempts to become the designated waiter.
    pub(crate) fn try_acquire_waiter(&self, worker_id: usize) -> Option<WaiterToken<'_>> {
        self.waiter
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| {
                self.waiter_id.store(worker_id, Ordering::SeqCst);
                WaiterToken { set: self }
            })
    }

    pub(crate) fn is_waiter(&self, worker_id: usize) -> bool {
        self.waiter_id.load(Ordering::SeqCst) == worker_id
    }

    pub(crate) fn has_waiter(&self) -> bool {
        self.waiter_id.load(Ordering::SeqCst) != NO_WAITER
    }

    /// Drains every registered wait. Used on shutdown.
    pub(crate) fn drain(&self) -> Vec<Task> {
        let mut guard = self.waits.lock();
        let waits = &mut *guard;
        let tasks = waits
            .slots
            .drain()
            .chain(waits.overflow.drain(..))
            .map(|w| w.task)
            .collect::<Vec<_>>();

        self.pending.store(0, Ordering::Release);
        tasks
    }
}

/// Proof of holding the designated waiter role. Released on drop.
pub(crate) struct WaiterToken<'a> {
    set: &'a WaitSet,
}

impl WaiterToken<'_> {
    /// Blocks on the wait-set until woken or the earliest wait deadline (or
    /// `deadline`, if sooner) passes.
    pub(crate) fn wait(&self, deadline: Deadline) -> bool {
        let deadline = deadline.earliest(self.set.next_deadline());
        self.set.wake.wait(deadline)
    }
}

impl Drop for WaiterToken<'_> {
    fn drop(&mut self) {
        self.set.waiter_id.store(NO_WAITER, Ordering::SeqCst);
        self.set.waiter.store(false, Ordering::SeqCst);
    }
}
