//! Completion and failure accounting for a set of tasks.

use crate::context;
use crate::error::{SchedError, TaskError};
use crate::utils::Deadline;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub(crate) struct ScopeState {
    name: String,

    /// Submitted tasks that have not retired yet.
    outstanding: AtomicUsize,

    /// Serializes edge insertion against submission.
    graph: Mutex<()>,

    /// First-error-wins latch guarding `status`.
    failed: AtomicBool,
    status: Mutex<Option<TaskError>>,
    failures: AtomicUsize,

    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl ScopeState {
    fn new(name: String) -> Self {
        Self {
            name,
            outstanding: AtomicUsize::new(0),
            graph: Mutex::new(()),
            failed: AtomicBool::new(false),
            status: Mutex::new(None),
            failures: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    /// State that no `Scope` handle owns. Used for pool pre-allocation.
    pub(crate) fn detached() -> Arc<Self> {
        Arc::new(Self::new(String::from("detached")))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock_graph(&self) -> MutexGuard<'_, ()> {
        self.graph.lock()
    }

    /// Accounts for `count` newly submitted tasks. Must run before any of
    /// their roots becomes visible to workers.
    pub(crate) fn account(&self, count: usize) {
        self.outstanding.fetch_add(count, Ordering::AcqRel);
    }

    /// Accounts for a task attached while the scope is already draining. The
    /// caller must itself be an outstanding task of this scope so the count
    /// cannot touch zero in between.
    pub(crate) fn attach_running(&self) {
        let prev = self.outstanding.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "scope {} attached to while idle", self.name);
    }

    pub(crate) fn record_failure(&self, err: &TaskError) {
        self.failures.fetch_add(1, Ordering::AcqRel);

        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.status.lock() = Some(err.clone());
        }
    }

    /// Retires one task; wakes `wait_idle` callers when the scope drains.
    pub(crate) fn retire_one(&self) {
        let res = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match res {
            Ok(1) => {
                tracing::debug!(scope = %self.name, "scope drained");
                let _guard = self.idle_lock.lock();
                self.idle.notify_all();
            }
            Ok(_) => {}
            Err(_) => {
                tracing::error!(scope = %self.name, "outstanding count underflow");
                debug_assert!(false, "scope {} outstanding count underflow", self.name);
            }
        }
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn status(&self) -> Result<(), SchedError> {
        match &*self.status.lock() {
            Some(err) => Err(SchedError::Task(err.clone())),
            None => Ok(()),
        }
    }
}

/// A batch of tasks sharing completion and failure accounting.
///
/// Tasks are created against a scope, wired into a DAG and submitted through
/// the executor. `wait_idle` blocks until every submitted task retired and
/// reports the first failure, if any.
pub struct Scope {
    state: Arc<ScopeState>,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(ScopeState::new(name.into())),
        }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Submitted tasks that have not completed or failed yet.
    pub fn outstanding(&self) -> usize {
        self.state.outstanding()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// First failure recorded in the scope, without clearing it.
    pub fn status(&self) -> Result<(), SchedError> {
        self.state.status()
    }

    /// Takes the first failure and resets the scope status so the scope can
    /// be reused for an unrelated batch.
    pub fn consume_status(&self) -> Result<(), SchedError> {
        let taken = self.state.status.lock().take();
        self.state.failed.store(false, Ordering::Release);

        match taken {
            Some(err) => Err(SchedError::Task(err)),
            None => Ok(()),
        }
    }

    /// Total number of failed tasks, including the ones hidden behind the
    /// first error.
    pub fn failure_count(&self) -> usize {
        self.state.failures.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until every submitted task retired or
    /// `deadline` passes.
    ///
    /// Returns the scope status once idle, `DeadlineExceeded` on timeout (in
    /// flight tasks keep running), or `InvalidState` when called from a worker
    /// thread, which could otherwise deadlock the pool.
    pub fn wait_idle(&self, deadline: impl Into<Deadline>) -> Result<(), SchedError> {
        if let Some(worker) = context::current_worker_id() {
            return Err(SchedError::invalid_state(format!(
                "wait_idle on scope {} called from worker {}",
                self.name(),
                worker
            )));
        }

        let deadline = deadline.into();
        let state = &self.state;

        let mut guard = state.idle_lock.lock();
        while state.outstanding() != 0 {
            match deadline.instant() {
                None => state.idle.wait(&mut guard),
                Some(at) => {
                    if state.idle.wait_until(&mut guard, at).timed_out() && state.outstanding() != 0
                    {
                        return Err(SchedError::DeadlineExceeded);
                    }
                }
            }
        }
        drop(guard);

        state.status()
    }

    pub(crate) fn state(&self) -> &Arc<ScopeState> {
        &self.state
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name())
            .field("outstanding", &self.outstanding())
            .field("failures", &self.failure_count())
            .finish()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            tracing::warn!(
                scope = %self.name(),
                outstanding,
                "scope dropped with tasks in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(Scope: Send, Sync);
    assert_impl_all!(ScopeState: Send, Sync);

    fn task_error(msg: &'static str) -> TaskError {
        TaskError::new(anyhow::anyhow!(msg))
    }

    #[test]
    fn test_empty_scope_is_idle() {
        let scope = Scope::new("empty");
        assert!(scope.is_idle());
        assert!(scope.wait_idle(Deadline::immediate()).is_ok());
        assert!(scope.wait_idle(Deadline::Infinite).is_ok());
    }

    #[test]
    fn test_first_error_wins() {
        let scope = Scope::new("errors");
        scope.state().record_failure(&task_error("first"));
        scope.state().record_failure(&task_error("second"));

        assert_eq!(scope.failure_count(), 2);
        let err = scope.status().unwrap_err();
        assert_eq!(err.to_string(), "first");

        // Peeking is idempotent.
        assert_eq!(scope.status().unwrap_err().to_string(), "first");

        assert!(scope.consume_status().is_err());
        assert!(scope.status().is_ok());

        scope.state().record_failure(&task_error("third"));
        assert_eq!(scope.status().unwrap_err().to_string(), "third");
    }

    #[test]
    fn test_outstanding_accounting() {
        let scope = Scope::new("accounting");
        let state = scope.state();

        state.account(2);
        assert_eq!(scope.outstanding(), 2);
        assert!(!scope.is_idle());

        state.account(1);
        state.retire_one();
        state.retire_one();
        assert_eq!(scope.outstanding(), 1);
        state.retire_one();
        assert!(scope.is_idle());
    }

    #[test]
    fn test_wait_idle_deadline_exceeded() {
        let scope = Scope::new("stuck");
        scope.state().account(1);

        let res = scope.wait_idle(Duration::from_millis(20));
        assert!(matches!(res, Err(SchedError::DeadlineExceeded)));

        // The scope stays valid and drains later.
        scope.state().retire_one();
        assert!(scope.wait_idle(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn test_wait_idle_wakes_on_drain() {
        let scope = Arc::new(Scope::new("drain"));
        scope.state().account(1);

        let retirer = {
            let scope = Arc::clone(&scope);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                scope.state().retire_one();
            })
        };

        assert!(scope.wait_idle(Duration::from_secs(5)).is_ok());
        retirer.join().unwrap();
    }
}
