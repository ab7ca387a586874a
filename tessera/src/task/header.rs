use crate::error::SchedError;
use crate::scope::ScopeState;
use crate::task::group::Group;
use crate::task::pool::Lease;
use crate::task::{AffinityMask, TaskData, TaskId, TaskKind};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle of a task.
///
/// `Created -> Ready -> Running -> {Completed, Failed}`. A WAIT task stays in
/// `Running` while it is parked in the executor wait-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Ready = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Ready,
            2 => TaskState::Running,
            3 => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

pub(crate) type Dependents = SmallVec<[Task; 4]>;

pub(crate) struct Header {
    id: TaskId,

    kind: TaskKind,

    affinity: AffinityMask,

    state: AtomicU8,

    /// Predecessors that have not retired yet. The task is ready at zero.
    pending: AtomicU32,

    failed_predecessors: AtomicU32,

    /// Tasks this one is connected to in the graph under construction.
    /// `None` once the slot is recycled.
    group: Option<Arc<Group>>,

    /// Back-reference only: the scope accounts for the task, the task never
    /// keeps the scope alive.
    scope: Weak<ScopeState>,

    /// Reverse edges, taken exactly once when the task retires.
    dependents: Mutex<Dependents>,

    /// Taken exactly once when the task runs.
    payload: Mutex<Option<TaskData>>,

    /// Live-task accounting against the pool bound. Dropped on recycle.
    lease: Option<Lease>,
}

impl Header {
    pub(super) fn new(
        data: TaskData,
        affinity: AffinityMask,
        scope: &Arc<ScopeState>,
        lease: Lease,
    ) -> Self {
        Self {
            id: TaskId::next(),
            kind: data.kind(),
            affinity,
            state: AtomicU8::new(TaskState::Created as u8),
            pending: AtomicU32::new(0),
            failed_predecessors: AtomicU32::new(0),
            group: Some(Group::new()),
            scope: Arc::downgrade(scope),
            dependents: Mutex::new(SmallVec::new()),
            payload: Mutex::new(Some(data)),
            lease: Some(lease),
        }
    }

    /// Drops every reference the retired task still holds so that its slot
    /// can sit in a free-list without pinning scopes, closures or leases.
    pub(super) fn release(&mut self) {
        self.lease = None;
        self.scope = Weak::new();
        self.group = None;
        self.payload.get_mut().take();
        self.dependents.get_mut().clear();
    }

    pub(super) fn kind(&self) -> TaskKind {
        self.kind
    }
}

/// Handle to a task. Cloning the handle does not clone the task.
#[derive(Clone)]
pub struct Task(pub(super) Arc<Header>);

impl Task {
    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn kind(&self) -> TaskKind {
        self.0.kind
    }

    pub fn affinity(&self) -> AffinityMask {
        self.0.affinity
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub fn pending_dependencies(&self) -> u32 {
        self.0.pending.load(Ordering::Acquire)
    }

    pub fn failed_predecessors(&self) -> u32 {
        self.0.failed_predecessors.load(Ordering::Acquire)
    }

    /// Makes `dependent` wait for this task to retire.
    ///
    /// Both tasks must belong to the same scope, still be `Created` and must
    /// not be reachable from a submitted root, otherwise `InvalidState` is
    /// returned and the graph is left untouched.
    pub fn add_dependent(&self, dependent: &Task) -> Result<(), SchedError> {
        if self.ptr_eq(dependent) {
            return Err(SchedError::invalid_state(format!(
                "task {} cannot depend on itself",
                self.id()
            )));
        }

        let scope = self.scope().ok_or_else(|| {
            SchedError::invalid_state(format!("scope of task {} was dropped", self.id()))
        })?;

        if !dependent.belongs_to(&scope) {
            return Err(SchedError::invalid_state(format!(
                "tasks {} and {} belong to different scopes",
                self.id(),
                dependent.id()
            )));
        }

        let _graph = scope.lock_graph();
        for task in [self, dependent] {
            if task.state() != TaskState::Created || task.group_submitted() {
                return Err(SchedError::invalid_state(format!(
                    "task {} was already submitted",
                    task.id()
                )));
            }
        }

        if let (Some(a), Some(b)) = (&self.0.group, &dependent.0.group) {
            Group::union(a, b);
        }
        self.link(dependent);
        Ok(())
    }

    /// Adds the edge without lifecycle checks. Only valid while `self` cannot
    /// retire concurrently, i.e. during construction or from the worker
    /// running it.
    pub(crate) fn link(&self, dependent: &Task) {
        dependent.0.pending.fetch_add(1, Ordering::AcqRel);
        self.0.dependents.lock().push(dependent.clone());
    }

    pub(crate) fn dependents(&self) -> Dependents {
        self.0.dependents.lock().clone()
    }

    pub(crate) fn take_dependents(&self) -> Dependents {
        std::mem::take(&mut *self.0.dependents.lock())
    }

    pub(crate) fn take_payload(&self) -> Option<TaskData> {
        self.0.payload.lock().take()
    }

    /// Records that one predecessor retired. Returns true when this was the
    /// last one and the task became ready.
    pub(crate) fn release_dependency(&self, predecessor_failed: bool) -> bool {
        if predecessor_failed {
            self.0.failed_predecessors.fetch_add(1, Ordering::AcqRel);
        }

        let prev = self.0.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "task {} dependency count underflow", self.id());

        prev == 1
    }

    #[inline]
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn set_state(&self, to: TaskState) {
        self.0.state.store(to as u8, Ordering::Release);
    }

    pub(crate) fn scope(&self) -> Option<Arc<ScopeState>> {
        self.0.scope.upgrade()
    }

    pub(crate) fn belongs_to(&self, scope: &Arc<ScopeState>) -> bool {
        std::ptr::eq(self.0.scope.as_ptr(), Arc::as_ptr(scope))
    }

    /// Root of the task's group. Callers hold the scope graph lock.
    pub(crate) fn group_root(&self) -> Option<Arc<Group>> {
        self.0.group.as_ref().map(Group::root)
    }

    pub(crate) fn group_submitted(&self) -> bool {
        self.group_root().is_none_or(|root| root.is_submitted())
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("pending", &self.pending_dependencies())
            .field("affinity", &self.affinity())
            .finish()
    }
}
