use crate::dispatch::ShardPayload;
use crate::error::{SchedError, TaskError, TaskStatus};
use crate::runtime::builder::{Builder, ExecutorConfig};
use crate::runtime::park::Signal;
use crate::runtime::pool::ThreadPool;
use crate::runtime::queue::LocalQueue;
use crate::runtime::wait_set::{PendingWait, WaitSet};
use crate::runtime::Event;
use crate::scope::Scope;
use crate::task::{
    AffinityMask, CallContext, Task, TaskData, TaskKind, TaskPool, TaskState, worker_bits,
};
use crate::utils::Deadline;
use anyhow::Result;
use crossbeam_deque::{Injector, Steal};
use smallvec::SmallVec;
use std::iter;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

/// What a worker is doing, as last published by the worker itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    Running = 0,
    Idle = 1,
    Parked = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Running,
            1 => WorkerState::Idle,
            2 => WorkerState::Parked,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: usize,
    pub state: WorkerState,
    /// Tasks executed by this worker.
    pub executed: u64,
    /// Tasks this worker took from a peer queue.
    pub stolen: u64,
}

/// Per-worker data reachable from every thread.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub(crate) queue: LocalQueue,
    pub(crate) signal: Signal,
    state: AtomicU8,
    executed: AtomicU64,
    stolen: AtomicU64,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            queue: LocalQueue::new(),
            signal: Signal::new(),
            state: AtomicU8::new(WorkerState::Idle as u8),
            executed: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn note_stolen(&self, count: usize) {
        self.stolen.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Where `submit` places roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Shared submission queue when every worker may run the root, otherwise
    /// an eligible worker's queue.
    Any,
    /// A specific worker's queue, peers steal from there.
    Worker(usize),
}

#[derive(Debug)]
pub struct Scheduler {
    pub(crate) cfg: ExecutorConfig,

    pub(crate) slots: Box<[WorkerSlot]>,

    /// Shared submission queue for roots any worker may run.
    pub(crate) injector: Injector<Task>,

    /// One bit per worker that is out of work and may be blocked.
    idle: AtomicU64,

    pub(crate) wait_set: WaitSet,

    pub(crate) pool: TaskPool,

    pub(crate) shutdown: AtomicBool,

    /// Round-robin cursor for posting pinned tasks to busy workers.
    post_cursor: AtomicUsize,

    /// Bits of the live workers, `0..worker_threads`.
    pub(crate) worker_bits: u64,
}

impl Scheduler {
    pub(crate) fn new(cfg: ExecutorConfig) -> Self {
        let workers = cfg.worker_threads;
        let pool = TaskPool::new(cfg.max_tasks);
        pool.reserve(
            TaskKind::Slice,
            workers * cfg.initial_slice_reservation_per_worker,
        );
        pool.reserve(
            TaskKind::Shard,
            workers * cfg.initial_shard_reservation_per_worker,
        );

        Self {
            slots: (0..workers).map(|_| WorkerSlot::new()).collect(),
            injector: Injector::new(),
            idle: AtomicU64::new(0),
            wait_set: WaitSet::new(cfg.max_outstanding_waits),
            pool,
            shutdown: AtomicBool::new(false),
            post_cursor: AtomicUsize::new(0),
            worker_bits: worker_bits(workers),
            cfg,
        }
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // --- Idle tracking ---

    pub(crate) fn mark_idle(&self, worker_id: usize) {
        self.idle.fetch_or(1 << worker_id, Ordering::SeqCst);
    }

    pub(crate) fn clear_idle(&self, worker_id: usize) {
        self.idle.fetch_and(!(1 << worker_id), Ordering::SeqCst);
    }

    /// Claims `worker_id`'s idle bit and wakes it. Returns false when the
    /// worker was not idle.
    fn wake_worker(&self, worker_id: usize) -> bool {
        let bit = 1 << worker_id;
        if self.idle.fetch_and(!bit, Ordering::SeqCst) & bit == 0 {
            return false;
        }

        self.notify(worker_id);
        true
    }

    /// Wakes one idle worker, if any.
    pub(crate) fn wake_one_idle(&self) -> bool {
        loop {
            let idle = self.idle.load(Ordering::SeqCst);
            if idle == 0 {
                return false;
            }

            let worker_id = idle.trailing_zeros() as usize;
            if self.wake_worker(worker_id) {
                return true;
            }
        }
    }

    fn notify(&self, worker_id: usize) {
        tracing::trace!(worker_id, "unpark worker");
        self.slots[worker_id].signal.notify();

        // The designated waiter blocks on the wait-set, not on its own signal.
        if self.wait_set.is_waiter(worker_id) {
            self.wait_set.wake();
        }
    }

    fn notify_all(&self) {
        for worker_id in 0..self.worker_count() {
            self.slots[worker_id].signal.notify();
        }
        self.wait_set.wake();
    }

    // --- Queueing ---

    pub(crate) fn pop_injector(&self) -> Option<Task> {
        iter::repeat_with(|| self.injector.steal())
            .find(|s| !s.is_retry())
            .and_then(Steal::success)
    }

    /// Hands `task` to an eligible worker: an idle one if possible, otherwise
    /// the next one in round-robin order.
    pub(crate) fn post(&self, task: Task) {
        let eligible = task.affinity().eligible(self.worker_bits);
        debug_assert!(eligible != 0, "task {} has no eligible worker", task.id());

        let idle = self.idle.load(Ordering::SeqCst) & eligible;
        let target = if idle != 0 {
            idle.trailing_zeros() as usize
        } else {
            let n = self.post_cursor.fetch_add(1, Ordering::Relaxed) % eligible.count_ones() as usize;
            nth_set_bit(eligible, n)
        };

        tracing::trace!(task = %task.id(), target, "post task");
        self.slots[target].queue.push(task);
        self.wake_worker(target);
    }

    /// Queues a ready task produced on `worker_id`: locally when allowed,
    /// posted otherwise.
    pub(crate) fn push_ready(&self, worker_id: usize, task: Task) {
        if task.affinity().allows(worker_id) {
            self.slots[worker_id].queue.push(task);
        } else {
            self.post(task);
        }
    }

    // --- Submission ---

    pub(crate) fn submit_with(
        &self,
        scope: &Scope,
        roots: impl IntoIterator<Item = Task>,
        placement: Placement,
    ) -> Result<(), SchedError> {
        let roots = roots.into_iter().collect::<SmallVec<[Task; 8]>>();
        let state = scope.state();

        if roots.is_empty() {
            return Ok(());
        }

        if self.is_shutdown() {
            return Err(SchedError::invalid_state("executor is shutting down"));
        }

        if let Placement::Worker(id) = placement
            && id >= self.worker_count()
        {
            return Err(SchedError::invalid_state(format!(
                "worker {} out of range",
                id
            )));
        }

        let graph = state.lock_graph();
        for root in &roots {
            if !root.belongs_to(state) {
                return Err(SchedError::invalid_state(format!(
                    "task {} does not belong to scope {}",
                    root.id(),
                    scope.name()
                )));
            }

            if root.state() != TaskState::Created {
                return Err(SchedError::invalid_state(format!(
                    "task {} was already submitted",
                    root.id()
                )));
            }

            let pending = root.pending_dependencies();
            if pending != 0 {
                return Err(SchedError::invalid_state(format!(
                    "root {} still waits on {} predecessors",
                    root.id(),
                    pending
                )));
            }
        }

        // The same root listed twice loses the second CAS.
        for (i, root) in roots.iter().enumerate() {
            if !root.transition(TaskState::Created, TaskState::Ready) {
                for prev in &roots[..i] {
                    prev.set_state(TaskState::Created);
                }
                return Err(SchedError::invalid_state(format!(
                    "task {} submitted twice",
                    root.id()
                )));
            }
        }

        // Groups shared by several roots, or submitted earlier through a
        // sibling root, count once. Accounting must be in place before any
        // root becomes visible.
        let mut count = 0;
        for root in &roots {
            if let Some(group) = root.group_root() {
                count += group.mark_submitted();
            }
        }
        state.account(count);
        drop(graph);

        tracing::debug!(
            scope = %scope.name(),
            roots = roots.len(),
            tasks = count,
            "submit"
        );

        let mut wakeups = 0;
        match placement {
            Placement::Any => {
                for root in roots {
                    if root.affinity().covers(self.worker_bits) {
                        self.injector.push(root);
                        wakeups += 1;
                    } else {
                        self.post(root);
                    }
                }
            }
            Placement::Worker(id) => {
                let (local, remote): (SmallVec<[Task; 8]>, SmallVec<[Task; 8]>) =
                    roots.into_iter().partition(|t| t.affinity().allows(id));

                wakeups = local.len().saturating_sub(1);
                let has_local = !local.is_empty();
                self.slots[id].queue.push_batch(local);

                if has_local && !self.wake_worker(id) {
                    wakeups += 1;
                }

                for root in remote {
                    self.post(root);
                }
            }
        }

        for _ in 0..wakeups {
            if !self.wake_one_idle() {
                break;
            }
        }

        Ok(())
    }

    // --- Execution ---

    /// Runs a ready task on `worker_id`. WAIT tasks may be deferred into the
    /// wait-set, every other task retires before this returns.
    pub(crate) fn execute(&self, worker_id: usize, task: Task) {
        if !task.transition(TaskState::Ready, TaskState::Running) {
            tracing::error!(task = %task.id(), state = ?task.state(), "task executed twice");
            debug_assert!(false, "task {} executed twice", task.id());
            return;
        }

        let Some(data) = task.take_payload() else {
            tracing::error!(task = %task.id(), "task payload missing");
            self.complete(
                worker_id,
                task,
                Err(TaskError::new(anyhow::anyhow!("task payload missing"))),
            );
            return;
        };

        self.slots[worker_id].executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(task = %task.id(), kind = ?task.kind(), worker_id, "execute");

        let status = match data {
            TaskData::Nop | TaskData::Barrier => Ok(()),
            TaskData::Call(f) => {
                let ctx = CallContext {
                    worker_id,
                    task_id: task.id(),
                    failed_predecessors: task.failed_predecessors(),
                };
                run_guarded(move || f(&ctx))
            }
            TaskData::Slice(slice) => {
                run_guarded(|| slice.state.run_range(&slice.range, worker_id))
            }
            TaskData::Shard(shard) => self.run_shard(worker_id, &task, shard),
            TaskData::Wait { event, deadline } => {
                match self.begin_wait(task.clone(), event, deadline) {
                    Some(status) => status,
                    None => return,
                }
            }
            TaskData::Fence { signal } => {
                if let Some(event) = signal {
                    event.set();
                }
                Ok(())
            }
        };

        self.complete(worker_id, task, status);
    }

    fn run_shard(
        &self,
        worker_id: usize,
        task: &Task,
        shard: ShardPayload,
    ) -> TaskStatus {
        let state = Arc::clone(&shard.state);
        let Some(range) = state.claim() else {
            return Ok(());
        };

        // Hand the rest of the grid to a continuation before running our
        // claim so peers can pick it up meanwhile.
        let continued = state.has_unclaimed() && self.continue_shard(worker_id, task, shard);

        run_guarded(|| {
            state.run_linear(range, worker_id)?;

            if !continued {
                while let Some(range) = state.claim() {
                    state.run_linear(range, worker_id)?;
                }
            }
            Ok(())
        })
    }

    /// Queues a SHARD continuation on `worker_id` that inherits the
    /// dependents of `task`. Returns false when none could be created.
    fn continue_shard(
        &self,
        worker_id: usize,
        task: &Task,
        shard: ShardPayload,
    ) -> bool {
        let Some(scope) = task.scope() else {
            return false;
        };

        let next = match self
            .pool
            .acquire(TaskData::Shard(shard), task.affinity(), &scope)
        {
            Ok(next) => next,
            Err(e) => {
                tracing::trace!(task = %task.id(), error = %e, "shard continues inline");
                return false;
            }
        };

        // `task` has not retired, so neither its dependents nor the scope
        // can drain while we wire the continuation in.
        for dependent in task.dependents() {
            next.link(&dependent);
        }
        scope.attach_running();
        next.set_state(TaskState::Ready);

        tracing::trace!(task = %task.id(), next = %next.id(), "shard continuation");
        self.push_ready(worker_id, next);
        self.wake_one_idle();
        true
    }

    /// Returns the status right away when the wait is already resolved,
    /// otherwise parks the task in the wait-set.
    fn begin_wait(&self, task: Task, event: Event, deadline: Deadline) -> Option<TaskStatus> {
        if event.is_set() {
            return Some(Ok(()));
        }

        if deadline.has_elapsed() {
            return Some(Err(TaskError::new(anyhow::Error::new(
                SchedError::DeadlineExceeded,
            ))));
        }

        self.wait_set
            .register(PendingWait {
                task,
                event,
                deadline,
            });

        // Somebody has to block on the wait-set for deadlines to fire.
        if !self.wait_set.has_waiter() {
            self.wake_one_idle();
        }
        None
    }

    /// Resolves finished waits on behalf of `worker_id`.
    pub(crate) fn poll_wait_set(&self, worker_id: usize) {
        for (task, status) in self.wait_set.poll() {
            tracing::trace!(task = %task.id(), ok = status.is_ok(), "wait resolved");
            self.complete(worker_id, task, status);
        }
    }

    /// Retires `task`: records its status, releases its dependents and
    /// queues the ones that became ready on `worker_id`.
    pub(crate) fn complete(&self, worker_id: usize, task: Task, status: TaskStatus) {
        let scope = task.scope();
        let failed = status.is_err();

        if let Err(err) = &status {
            tracing::debug!(task = %task.id(), error = %err, "task failed");
            if let Some(scope) = &scope {
                scope.record_failure(err);
            }
        }

        task.set_state(if failed {
            TaskState::Failed
        } else {
            TaskState::Completed
        });

        let mut readied = 0;
        for dependent in task.take_dependents() {
            if !dependent.release_dependency(failed) {
                continue;
            }

            if dependent.transition(TaskState::Created, TaskState::Ready) {
                readied += 1;
                self.push_ready(worker_id, dependent);
            } else {
                tracing::error!(
                    task = %dependent.id(),
                    state = ?dependent.state(),
                    "dependent readied from unexpected state"
                );
            }
        }

        // Keep one for ourselves, offer the rest to idle peers.
        for _ in 1..readied {
            if !self.wake_one_idle() {
                break;
            }
        }

        match scope {
            Some(scope) => scope.retire_one(),
            None => tracing::warn!(task = %task.id(), "task retired after its scope was dropped"),
        }

        self.pool.recycle(task);
    }

    // --- Shutdown ---

    pub(crate) fn begin_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::debug!(workers = self.worker_count(), "executor shutting down");
        }
        self.notify_all();
    }

    /// Retires every task left behind once the workers are gone, failing
    /// them so that their scopes drain instead of hanging `wait_idle`.
    pub(crate) fn abandon_remaining(&self) {
        let mut stack = Vec::new();

        for slot in self.slots.iter() {
            stack.extend(slot.queue.drain());
        }
        stack.extend(iter::from_fn(|| self.pop_injector()));
        stack.extend(self.wait_set.drain());

        if stack.is_empty() {
            return;
        }
        tracing::warn!(tasks = stack.len(), "abandoning queued tasks on shutdown");

        while let Some(task) = stack.pop() {
            let err = TaskError::new(anyhow::anyhow!(
                "executor shut down before task {} ran",
                task.id()
            ));
            let scope = task.scope();
            if let Some(scope) = &scope {
                scope.record_failure(&err);
            }
            task.set_state(TaskState::Failed);

            for dependent in task.take_dependents() {
                if dependent.release_dependency(true)
                    && dependent.transition(TaskState::Created, TaskState::Ready)
                {
                    stack.push(dependent);
                }
            }

            if let Some(scope) = scope {
                scope.retire_one();
            }
        }
    }

    pub(crate) fn worker_stats(&self) -> Vec<WorkerStats> {
        self.slots
            .iter()
            .enumerate()
            .map(|(id, slot)| WorkerStats {
                id,
                state: WorkerState::from_u8(slot.state.load(Ordering::Acquire)),
                executed: slot.executed.load(Ordering::Relaxed),
                stolen: slot.stolen.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Runs a task body, turning errors and panics into a task status.
fn run_guarded<F>(f: F) -> TaskStatus
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(res) => res.map_err(TaskError::new),
        Err(payload) => Err(TaskError::from_panic(payload)),
    }
}

fn nth_set_bit(mut bits: u64, n: usize) -> usize {
    for _ in 0..n {
        bits &= bits - 1;
    }
    bits.trailing_zeros() as usize
}

/// Cloneable handle used to build and submit task graphs.
#[derive(Debug, Clone)]
pub struct Handle(Arc<Scheduler>);

impl Handle {
    /// Creates an unsubmitted task in `scope`. The task runs once it is a
    /// submitted root or all its predecessors retired.
    pub fn create_task(
        &self,
        scope: &Scope,
        data: TaskData,
        affinity: AffinityMask,
    ) -> Result<Task, SchedError> {
        if affinity.eligible(self.worker_bits) == 0 {
            return Err(SchedError::invalid_state(format!(
                "{:?} selects none of the {} workers",
                affinity,
                self.worker_count()
            )));
        }

        let task = self.pool.acquire(data, affinity, scope.state())?;

        tracing::trace!(task = %task.id(), kind = ?task.kind(), scope = %scope.name(), "create task");
        Ok(task)
    }

    pub fn nop(&self, scope: &Scope) -> Result<Task, SchedError> {
        self.create_task(scope, TaskData::Nop, AffinityMask::ANY)
    }

    pub fn barrier(&self, scope: &Scope) -> Result<Task, SchedError> {
        self.create_task(scope, TaskData::Barrier, AffinityMask::ANY)
    }

    pub fn call<F>(&self, scope: &Scope, f: F) -> Result<Task, SchedError>
    where
        F: FnOnce(&CallContext) -> anyhow::Result<()> + Send + 'static,
    {
        self.create_task(scope, TaskData::call(f), AffinityMask::ANY)
    }

    /// Task that completes once `event` is set, or fails with
    /// `DeadlineExceeded` once `deadline` passes.
    pub fn wait(
        &self,
        scope: &Scope,
        event: &Event,
        deadline: impl Into<Deadline>,
    ) -> Result<Task, SchedError> {
        let data = TaskData::Wait {
            event: event.clone(),
            deadline: deadline.into(),
        };
        self.create_task(scope, data, AffinityMask::ANY)
    }

    /// Task that sets `signal`, if any, when it runs.
    pub fn fence(&self, scope: &Scope, signal: Option<Event>) -> Result<Task, SchedError> {
        self.create_task(scope, TaskData::Fence { signal }, AffinityMask::ANY)
    }

    /// Submits `roots` and every task reachable from them.
    ///
    /// Roots must not have predecessors. Tasks created in the scope but not
    /// connected to `roots` stay unsubmitted and can be submitted later. On
    /// error nothing was submitted.
    pub fn submit(
        &self,
        scope: &Scope,
        roots: impl IntoIterator<Item = Task>,
    ) -> Result<(), SchedError> {
        self.submit_with(scope, roots, Placement::Any)
    }

    pub fn worker_count(&self) -> usize {
        self.0.worker_count()
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.0.worker_stats()
    }
}

impl Deref for Handle {
    type Target = Arc<Scheduler>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Owns the worker threads. Dropping the executor shuts it down.
#[derive(Debug)]
pub struct Executor {
    handle: Handle,
    threads: ThreadPool,
}

impl Executor {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn try_new(cfg: ExecutorConfig) -> Result<Self> {
        let handle = Scheduler::new(cfg).into_handle();
        let threads = ThreadPool::spawn(&handle)?;

        tracing::debug!(workers = handle.worker_count(), "executor started");
        Ok(Self { handle, threads })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stops the workers and joins their threads. Queued tasks never run,
    /// they fail into their scopes.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&self) -> Result<()> {
        self.handle.begin_shutdown();
        let res = self.threads.join_all();
        self.handle.abandon_remaining();
        res
    }
}

impl Deref for Executor {
    type Target = Handle;
    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            tracing::error!(error = %e, "error during executor shutdown");
        }
    }
}
