use std::fmt;
use std::sync::Arc;

/// A centralized error type for all scheduler operations.
///
/// Structural misuse (`InvalidState`, `ResourceExhausted`) is returned
/// synchronously from the API that detected it. Task failures are recorded
/// into the owning scope and only surface through `Scope::wait_idle`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SchedError {
    /// The operation is not valid for the current lifecycle state of a task or
    /// scope, e.g. linking tasks after submission or submitting twice.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A caller-controlled bound was hit (task pool, wait-set).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A deadline elapsed before the awaited condition was met. This is not a
    /// task failure when returned from `wait_idle`: in-flight work continues.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// First failure reported by a task in the scope.
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl SchedError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        SchedError::InvalidState(msg.into())
    }

    pub(crate) fn exhausted(msg: impl Into<String>) -> Self {
        SchedError::ResourceExhausted(msg.into())
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, SchedError::DeadlineExceeded)
    }

    pub fn is_task_failure(&self) -> bool {
        matches!(self, SchedError::Task(_))
    }

    /// Returns the task-reported status, if this error carries one.
    pub fn as_task_error(&self) -> Option<&TaskError> {
        match self {
            SchedError::Task(e) => Some(e),
            _ => None,
        }
    }
}

/// Application status reported by a failed task. Opaque to the scheduler.
///
/// Cheap to clone so the first error of a scope can be handed to every
/// observer of `wait_idle`.
#[derive(Clone)]
pub struct TaskError(Arc<anyhow::Error>);

impl TaskError {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };

        Self::new(anyhow::anyhow!("task panicked: {}", msg))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to downcast the underlying application error.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Status returned by a task payload.
pub type TaskStatus = Result<(), TaskError>;
