//! Thread-local worker identity.

use std::cell::Cell;

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Marks the current thread as worker `id` until the guard is dropped.
pub(crate) fn enter_worker(id: usize) -> WorkerGuard {
    let prev = WORKER_ID.with(|w| w.replace(Some(id)));
    debug_assert!(prev.is_none(), "thread already runs worker {:?}", prev);
    WorkerGuard { _p: () }
}

/// Id of the worker running on this thread, `None` on caller threads.
pub fn current_worker_id() -> Option<usize> {
    WORKER_ID.with(|w| w.get())
}

pub(crate) struct WorkerGuard {
    _p: (),
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        WORKER_ID.with(|w| w.set(None));
    }
}
