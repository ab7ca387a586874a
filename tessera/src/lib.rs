//! Low-latency work-stealing scheduler for DAGs of fine-grained tasks.
//!
//! Build an [`Executor`](runtime::Executor), create tasks against a
//! [`Scope`](scope::Scope), wire them with [`Task::add_dependent`](task::Task::add_dependent),
//! submit the roots and block on [`Scope::wait_idle`](scope::Scope::wait_idle).
//! Large data-parallel work goes through [`dispatch::DispatchGrid`].

mod context;
pub use context::current_worker_id;

pub mod dispatch;

pub mod error;
pub use error::{SchedError, TaskError};

pub mod runtime;
pub use runtime::{Builder, Event, Executor, Handle};

pub mod scope;
pub use scope::Scope;

pub mod task;

pub mod utils;
pub use utils::Deadline;

#[cfg(test)]
mod test_utils;
