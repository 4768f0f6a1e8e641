use std::error::Error;
use std::rc::Rc;

use thiserror::Error;

use crate::task::TaskId;

/// Programmer/configuration errors, reported synchronously by the call that
/// detected them. None of these are recoverable at runtime; they exist to
/// fail fast during development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("preempt cannot be combined with a greater-than-zero delay")]
    PreemptWithDelay,
    #[error("preempt cannot be combined with persistent")]
    PreemptWithPersistent,
    #[error("cannot queue a persistent task on the microtask queue")]
    PersistentOnMicroTask,
    #[error("task {0} was not found in any list of this queue")]
    TaskNotFound(TaskId),
    #[error("task {0} already belongs to this queue")]
    TaskAlreadyOwned(TaskId),
}

/// Runtime failure of a scheduled task.
///
/// Cloneable so that a memoized result can reject every awaiter; the callback
/// error value is shared behind an `Rc` for the same reason.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task was canceled while still pending.
    #[error("task {0} was aborted")]
    Aborted(TaskId),
    /// The task's callback failed.
    #[error("task {0} failed: {1}")]
    Callback(TaskId, Rc<dyn Error>),
}

impl TaskError {
    /// Id of the task this error belongs to.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Aborted(id) | Self::Callback(id, _) => *id,
        }
    }

    /// Whether this is the distinguished abort error produced by
    /// cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}
