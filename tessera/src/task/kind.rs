use crate::dispatch::{ShardPayload, SlicePayload};
use crate::runtime::Event;
use crate::task::TaskId;
use crate::utils::Deadline;
use std::fmt;

/// Discriminant of a task's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskKind {
    /// Does nothing. Useful as a DAG entry point.
    Nop = 0,
    /// Runs a user closure.
    Call,
    /// Join point: runs nothing, exists to fan-in and fan-out edges.
    Barrier,
    /// Contiguous block of dispatch grid tiles executed on one worker.
    Slice,
    /// Lazy reservation over the tiles of a dispatch grid.
    Shard,
    /// Completes once an external event is set or its deadline passes.
    Wait,
    /// Marks the end of a sub-DAG, optionally setting an event.
    Fence,
}

impl TaskKind {
    pub(crate) const COUNT: usize = 7;

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Closure run by a `Call` task.
pub type CallFn = Box<dyn FnOnce(&CallContext) -> anyhow::Result<()> + Send + 'static>;

/// Kind-specific data a task carries until it runs.
pub enum TaskData {
    Nop,
    Call(CallFn),
    Barrier,
    Slice(SlicePayload),
    Shard(ShardPayload),
    Wait { event: Event, deadline: Deadline },
    Fence { signal: Option<Event> },
}

impl TaskData {
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce(&CallContext) -> anyhow::Result<()> + Send + 'static,
    {
        TaskData::Call(Box::new(f))
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskData::Nop => TaskKind::Nop,
            TaskData::Call(_) => TaskKind::Call,
            TaskData::Barrier => TaskKind::Barrier,
            TaskData::Slice(_) => TaskKind::Slice,
            TaskData::Shard(_) => TaskKind::Shard,
            TaskData::Wait { .. } => TaskKind::Wait,
            TaskData::Fence { .. } => TaskKind::Fence,
        }
    }
}

impl fmt::Debug for TaskData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskData::Call(_) => f.write_str("Call(<closure>)"),
            TaskData::Slice(p) => f.debug_tuple("Slice").field(p).finish(),
            TaskData::Shard(p) => f.debug_tuple("Shard").field(p).finish(),
            TaskData::Wait { event, deadline } => f
                .debug_struct("Wait")
                .field("event", event)
                .field("deadline", deadline)
                .finish(),
            TaskData::Fence { signal } => f.debug_struct("Fence").field("signal", signal).finish(),
            other => fmt::Debug::fmt(&other.kind(), f),
        }
    }
}

/// Execution context handed to `Call` closures.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub(crate) worker_id: usize,
    pub(crate) task_id: TaskId,
    pub(crate) failed_predecessors: u32,
}

impl CallContext {
    /// Id of the worker running the task.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Number of predecessors that failed. Failures never cancel dependents,
    /// a task that must not run after a failure checks this and bails out.
    pub fn failed_predecessors(&self) -> u32 {
        self.failed_predecessors
    }
}
