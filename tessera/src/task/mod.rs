//! Task data model: handles, kinds, affinity and the recycling pool.

mod affinity;
pub use affinity::{AffinityMask, MAX_WORKERS};
pub(crate) use affinity::worker_bits;

mod group;

mod header;
pub use header::{Task, TaskState};

mod id;
pub use id::TaskId;

mod kind;
pub use kind::{CallContext, CallFn, TaskData, TaskKind};

pub(crate) mod pool;
pub(crate) use pool::TaskPool;
