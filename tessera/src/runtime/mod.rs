//! Work-stealing executor: worker threads, queues, wait-set and the handle
//! used to create and submit tasks.

// Public API
mod builder;
pub use builder::Builder;

mod event;
pub use event::Event;

mod executor;
pub use executor::{Executor, Handle, WorkerState, WorkerStats};

// Internals
pub(crate) mod park;

mod pool;

mod queue;

mod ticker;

mod wait_set;

mod worker;
