use crate::task::Task;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) type StolenBatch = SmallVec<[Task; 16]>;

/// Per-worker ready queue.
///
/// The owner pushes and pops at the back (LIFO, recently readied dependents
/// are cache-hot). Thieves take from the front (oldest first) so they rarely
/// touch the entries the owner is about to pop. The lock is only held for
/// the push/pop itself, never while a task runs.
///
/// A thief skips over tasks whose affinity excludes it and keeps scanning.
#[derive(Debug, Default)]
pub(crate) struct LocalQueue {
    tasks: Mutex<VecDeque<Task>>,

    /// Mirror of `tasks.len()` readable without the lock.
    len: AtomicUsize,
}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, task: Task) {
        let mut tasks = self.tasks.lock();
        tasks.push_back(task);
        self.len.store(tasks.len(), Ordering::SeqCst);
    }

    pub(crate) fn push_batch(&self, batch: impl IntoIterator<Item = Task>) {
        let mut tasks = self.tasks.lock();
        tasks.extend(batch);
        self.len.store(tasks.len(), Ordering::SeqCst);
    }

    /// Owner-side pop, newest first.
    pub(crate) fn pop(&self) -> Option<Task> {
        if self.is_empty() {
            return None;
        }

        let mut tasks = self.tasks.lock();
        let task = tasks.pop_back();
        self.len.store(tasks.len(), Ordering::SeqCst);
        task
    }

    /// Thief-side removal of up to `max` tasks `worker_id` may run, oldest
    /// first. Ineligible tasks are skipped, not a reason to stop scanning.
    pub(crate) fn steal(&self, worker_id: usize, max: usize) -> StolenBatch {
        let mut stolen = StolenBatch::new();
        if self.is_empty() || max == 0 {
            return stolen;
        }

        // One pass over the queue; skipped tasks keep their relative order.
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| {
            let take = stolen.len() < max && task.affinity().allows(worker_id);
            if take {
                stolen.push(task.clone());
            }
            !take
        });

        self.len.store(tasks.len(), Ordering::SeqCst);
        stolen
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn drain(&self) -> Vec<Task> {
        let mut tasks = self.tasks.lock();
        self.len.store(0, Ordering::SeqCst);
        tasks.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeState;
    use crate::task::{AffinityMask, TaskData, TaskPool};
    use rstest::rstest;
    use std::iter;
    use std::sync::Arc;

    fn make(pool: &TaskPool, scope: &Arc<ScopeState>, affinity: AffinityMask) -> Task {
        pool.acquire(TaskData::Nop, affinity, scope).unwrap()
    }

    #[test]
    fn test_owner_lifo_thief_fifo() {
        let pool = TaskPool::new(None);
        let scope = ScopeState::detached();
        let queue = LocalQueue::new();

        let tasks = (0..4)
            .map(|_| make(&pool, &scope, AffinityMask::ANY))
            .collect::<Vec<_>>();
        queue.push_batch(tasks.iter().cloned());
        assert_eq!(queue.len(), 4);

        let newest = queue.pop().unwrap();
        assert!(newest.ptr_eq(&tasks[3]));

        let stolen = queue.steal(1, 2);
        assert_eq!(stolen.len(), 2);
        assert!(stolen[0].ptr_eq(&tasks[0]));
        assert!(stolen[1].ptr_eq(&tasks[1]));

        assert_eq!(queue.len(), 1);
        assert!(queue.pop().unwrap().ptr_eq(&tasks[2]));
        assert!(queue.pop().is_none());
    }

    #[rstest]
    #[case::thief_1(1, 2)]
    #[case::thief_2(2, 1)]
    fn test_steal_skips_ineligible(#[case] thief: usize, #[case] expected: usize) {
        let pool = TaskPool::new(None);
        let scope = ScopeState::detached();
        let queue = LocalQueue::new();

        // Pinned task at the front must not block the scan.
        queue.push(make(&pool, &scope, AffinityMask::worker(0)));
        queue.push(make(&pool, &scope, AffinityMask::worker(1)));
        queue.push(make(&pool, &scope, AffinityMask::ANY));

        let stolen = queue.steal(thief, 8);
        assert_eq!(stolen.len(), expected);
        assert!(stolen.iter().all(|t| t.affinity().allows(thief)));
        assert_eq!(queue.len(), 3 - expected);
    }

    #[test]
    fn test_steal_keeps_order_of_skipped_tasks() {
        let pool = TaskPool::new(None);
        let scope = ScopeState::detached();
        let queue = LocalQueue::new();

        let pinned = AffinityMask::worker(0);
        let tasks = [pinned, AffinityMask::ANY, pinned, AffinityMask::ANY, AffinityMask::ANY]
            .map(|affinity| make(&pool, &scope, affinity));
        queue.push_batch(tasks.iter().cloned());

        let stolen = queue.steal(1, 2);
        assert_eq!(stolen.len(), 2);
        assert!(stolen[0].ptr_eq(&tasks[1]));
        assert!(stolen[1].ptr_eq(&tasks[3]));

        // Budget spent: the last eligible task stays behind.
        assert_eq!(queue.len(), 3);
        let left = iter::from_fn(|| queue.pop()).collect::<Vec<_>>();
        assert!(left[0].ptr_eq(&tasks[4]));
        assert!(left[1].ptr_eq(&tasks[2]));
        assert!(left[2].ptr_eq(&tasks[0]));
    }
}
