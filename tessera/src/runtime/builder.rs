use crate::runtime::Executor;
use crate::task::MAX_WORKERS;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// One slot of the root wait-set is reserved for the internal wake handle.
pub(crate) const MAX_OUTSTANDING_WAITS: usize = 63;

const TILES_PER_SLICE: [u32; 3] = [8, 1, 1];

const MAX_TILES_PER_SHARD_RESERVATION: u32 = 8;

const MAX_RESIDENT_SLICES_PER_WORKER: usize = 16;

const THEFT_DIVISOR: usize = 1;

const MAX_THEFT_TASK_COUNT: usize = MAX_WORKERS;

const INITIAL_SLICE_RESERVATION_PER_WORKER: usize = 0;

const INITIAL_SHARD_RESERVATION_PER_WORKER: usize = 4;

/// Ticks between forced checks of the shared submission queue.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("tessera-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Defaults to one worker per core, capped at `MAX_WORKERS`.
    worker_threads: Option<usize>,

    thread_name: ThreadNameFn,

    thread_stack_size: Option<usize>,

    /// Tiles grouped into one SLICE task, per dimension.
    tiles_per_slice: [u32; 3],

    /// Tiles a SHARD claims per reservation.
    max_tiles_per_shard_reservation: u32,

    /// Above `workers * max_resident_slices_per_worker` slices, a dispatch is
    /// split into shards instead.
    max_resident_slices_per_worker: usize,

    /// Fraction of peers probed on a theft attempt: `(workers - 1) / divisor`.
    theft_divisor: usize,

    /// Tasks taken from one victim per theft.
    max_theft_task_count: usize,

    max_outstanding_waits: usize,

    max_tasks: Option<usize>,

    initial_slice_reservation_per_worker: usize,

    initial_shard_reservation_per_worker: usize,

    global_queue_interval: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            tiles_per_slice: TILES_PER_SLICE,
            max_tiles_per_shard_reservation: MAX_TILES_PER_SHARD_RESERVATION,
            max_resident_slices_per_worker: MAX_RESIDENT_SLICES_PER_WORKER,
            theft_divisor: THEFT_DIVISOR,
            max_theft_task_count: MAX_THEFT_TASK_COUNT,
            max_outstanding_waits: MAX_OUTSTANDING_WAITS,
            max_tasks: None,
            initial_slice_reservation_per_worker: INITIAL_SLICE_RESERVATION_PER_WORKER,
            initial_shard_reservation_per_worker: INITIAL_SHARD_RESERVATION_PER_WORKER,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
        }
    }

    /// The number of worker threads. Defaults to one per core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(
            val > 0 && val <= MAX_WORKERS,
            "worker_threads must be in 1..={}",
            MAX_WORKERS
        );
        self.worker_threads = Some(val);
        self
    }

    /// Sets name of worker threads. The default is "tessera-{id}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    #[track_caller]
    pub fn tiles_per_slice(mut self, val: [u32; 3]) -> Self {
        assert!(
            val.iter().all(|&n| n > 0),
            "tiles_per_slice must be greater than 0 in every dimension"
        );
        self.tiles_per_slice = val;
        self
    }

    #[track_caller]
    pub fn max_tiles_per_shard_reservation(mut self, val: u32) -> Self {
        assert!(
            val > 0,
            "max_tiles_per_shard_reservation must be greater than 0"
        );
        self.max_tiles_per_shard_reservation = val;
        self
    }

    #[track_caller]
    pub fn max_resident_slices_per_worker(mut self, val: usize) -> Self {
        assert!(val > 0, "max_resident_slices_per_worker must be greater than 0");
        self.max_resident_slices_per_worker = val;
        self
    }

    #[track_caller]
    pub fn theft_divisor(mut self, val: usize) -> Self {
        assert!(val > 0, "theft_divisor must be greater than 0");
        self.theft_divisor = val;
        self
    }

    #[track_caller]
    pub fn max_theft_task_count(mut self, val: usize) -> Self {
        assert!(val > 0, "max_theft_task_count must be greater than 0");
        self.max_theft_task_count = val;
        self
    }

    /// Waits beyond this many are deferred until a slot frees.
    #[track_caller]
    pub fn max_outstanding_waits(mut self, val: usize) -> Self {
        assert!(
            val > 0 && val <= MAX_OUTSTANDING_WAITS,
            "max_outstanding_waits must be in 1..={}",
            MAX_OUTSTANDING_WAITS
        );
        self.max_outstanding_waits = val;
        self
    }

    /// Bounds the number of live tasks. Creating a task beyond the bound
    /// fails with `ResourceExhausted`.
    #[track_caller]
    pub fn max_tasks(mut self, val: usize) -> Self {
        assert!(val > 0, "max_tasks must be greater than 0");
        self.max_tasks = Some(val);
        self
    }

    pub fn initial_slice_reservation_per_worker(mut self, val: usize) -> Self {
        self.initial_slice_reservation_per_worker = val;
        self
    }

    pub fn initial_shard_reservation_per_worker(mut self, val: usize) -> Self {
        self.initial_shard_reservation_per_worker = val;
        self
    }

    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    /// Creates the executor and starts its workers.
    pub fn try_build(self) -> Result<Executor> {
        let cfg = ExecutorConfig::try_from(self)?;
        Executor::try_new(cfg)
    }
}

/// Immutable executor configuration, shared by every worker.
#[derive(Debug, Clone)]
pub(crate) struct ExecutorConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) tiles_per_slice: [u32; 3],
    pub(crate) max_tiles_per_shard_reservation: u32,
    pub(crate) max_resident_slices_per_worker: usize,
    pub(crate) theft_divisor: usize,
    pub(crate) max_theft_task_count: usize,
    pub(crate) max_outstanding_waits: usize,
    pub(crate) max_tasks: Option<usize>,
    pub(crate) initial_slice_reservation_per_worker: usize,
    pub(crate) initial_shard_reservation_per_worker: usize,
    pub(crate) global_queue_interval: u32,
}

impl ExecutorConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 || self.worker_threads > MAX_WORKERS {
            return Err(anyhow!(
                "worker_threads ({}) must be in 1..={}",
                self.worker_threads,
                MAX_WORKERS
            ));
        }

        let reserved = self.worker_threads
            * (self.initial_slice_reservation_per_worker
                + self.initial_shard_reservation_per_worker);

        if let Some(max) = self.max_tasks
            && reserved > max
        {
            return Err(anyhow!(
                "initial task reservations ({}) exceed max_tasks ({})",
                reserved,
                max
            ));
        }

        Ok(())
    }

    /// Number of peers probed on one theft attempt.
    pub(crate) fn theft_victims(&self) -> usize {
        ((self.worker_threads - 1) / self.theft_divisor).max(1)
    }
}

impl TryFrom<Builder> for ExecutorConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get().min(MAX_WORKERS),
        };

        let cfg = ExecutorConfig {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            tiles_per_slice: builder.tiles_per_slice,
            max_tiles_per_shard_reservation: builder.max_tiles_per_shard_reservation,
            max_resident_slices_per_worker: builder.max_resident_slices_per_worker,
            theft_divisor: builder.theft_divisor,
            max_theft_task_count: builder.max_theft_task_count,
            max_outstanding_waits: builder.max_outstanding_waits,
            max_tasks: builder.max_tasks,
            initial_slice_reservation_per_worker: builder.initial_slice_reservation_per_worker,
            initial_shard_reservation_per_worker: builder.initial_shard_reservation_per_worker,
            global_queue_interval: builder.global_queue_interval,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
