use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use smallvec::SmallVec;

use crate::error::TaskError;
use crate::queue::{QueueInner, TaskQueue};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonically increasing task id. Diagnostics and ordering
/// only; task identity is the `Rc` allocation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a task.
///
/// `Pending → Running → {Completed | Canceled}`; a persistent task cycles
/// back from `Running` to `Pending` until it is canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Canceled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Canceled => f.write_str("canceled"),
        }
    }
}

/// Type-erased value produced by a task callback, shared so every awaiter of
/// a memoized result can observe it.
pub type TaskValue = Rc<dyn Any>;

/// What a callback did when it was invoked.
pub enum TaskOutcome {
    /// Finished synchronously; the value settles the task's result.
    Complete(TaskValue),
    /// Started asynchronous work. Completion is reported back later through
    /// [`TaskQueue::complete_async_task`]; whether the queue keeps running
    /// other tasks in the meantime is governed by the task's `suspend` flag.
    Pending,
    /// Failed. Rejects the task's result if anyone requested it, otherwise
    /// the error propagates out of the flush pass.
    Fault(Rc<dyn Error>),
}

impl TaskOutcome {
    /// Synchronous completion carrying no interesting value.
    pub fn done() -> Self {
        Self::Complete(Rc::new(()))
    }

    pub fn value<T: Any>(value: T) -> Self {
        Self::Complete(Rc::new(value))
    }

    pub fn fault<E: Error + 'static>(err: E) -> Self {
        Self::Fault(Rc::new(err))
    }
}

pub type TaskCallback = Box<dyn FnMut(f64) -> TaskOutcome>;

pub(crate) enum ResultState {
    Pending { wakers: SmallVec<[Waker; 2]> },
    Settled(Result<TaskValue, TaskError>),
}

/// Shared settlement cell behind a task's memoized result.
pub(crate) struct ResultCell {
    state: RefCell<ResultState>,
}

impl ResultCell {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(ResultState::Pending {
                wakers: SmallVec::new(),
            }),
        })
    }

    pub(crate) fn settle(&self, result: Result<TaskValue, TaskError>) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                ResultState::Pending { wakers } => {
                    let wakers = std::mem::take(wakers);
                    *state = ResultState::Settled(result);
                    wakers
                }
                // settled results are immutable
                ResultState::Settled(_) => return,
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<Result<TaskValue, TaskError>> {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            ResultState::Pending { wakers } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            ResultState::Settled(result) => Poll::Ready(result.clone()),
        }
    }
}

/// Future returned by [`Task::result`]. Resolves with the callback's value on
/// completion, or with [`TaskError`] on cancellation or callback failure.
pub struct TaskResult {
    cell: Rc<ResultCell>,
}

impl Future for TaskResult {
    type Output = Result<TaskValue, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.cell.poll_settled(cx)
    }
}

pub(crate) struct TaskInner {
    /// Back-reference to the owning queue; the queue owns the task, not the
    /// other way around.
    pub(crate) queue: Weak<RefCell<QueueInner>>,
    pub(crate) created_time: f64,
    pub(crate) queue_time: f64,
    pub(crate) preempt: bool,
    pub(crate) persistent: bool,
    pub(crate) suspend: bool,
    pub(crate) reusable: bool,
    pub(crate) status: TaskStatus,
    pub(crate) callback: Option<TaskCallback>,
    pub(crate) result: Option<Rc<ResultCell>>,
    /// Set when `cancel()` catches the task mid-run; that run then terminates
    /// as canceled instead of completed.
    pub(crate) cancel_requested: bool,
}

/// A single schedulable unit of work.
///
/// Created by [`TaskQueue::queue_task`] and handed back to the caller, who
/// may await [`Task::result`] or call [`Task::cancel`]. Tasks are compared by
/// `Rc` identity.
pub struct Task {
    id: TaskId,
    inner: RefCell<TaskInner>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: Weak<RefCell<QueueInner>>,
        created_time: f64,
        delay: f64,
        preempt: bool,
        persistent: bool,
        suspend: bool,
        reusable: bool,
        callback: TaskCallback,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: TaskId::next(),
            inner: RefCell::new(TaskInner {
                queue,
                created_time,
                queue_time: created_time + delay,
                preempt,
                persistent,
                suspend,
                reusable,
                status: TaskStatus::Pending,
                callback: Some(callback),
                result: None,
                cancel_requested: false,
            }),
        })
    }

    /// Reinitialize a pooled task for a fresh round of work. The allocation
    /// (and its id) is recycled; everything else starts over.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reinit(
        &self,
        queue: Weak<RefCell<QueueInner>>,
        created_time: f64,
        delay: f64,
        preempt: bool,
        persistent: bool,
        suspend: bool,
        reusable: bool,
        callback: TaskCallback,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.queue = queue;
        inner.created_time = created_time;
        inner.queue_time = created_time + delay;
        inner.preempt = preempt;
        inner.persistent = persistent;
        inner.suspend = suspend;
        inner.reusable = reusable;
        inner.status = TaskStatus::Pending;
        inner.callback = Some(callback);
        inner.result = None;
        inner.cancel_requested = false;
    }

    pub(crate) fn inner(&self) -> Ref<'_, TaskInner> {
        self.inner.borrow()
    }

    pub(crate) fn inner_mut(&self) -> RefMut<'_, TaskInner> {
        self.inner.borrow_mut()
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.borrow().status
    }

    /// Time of creation, in the owning queue's clock.
    pub fn created_time(&self) -> f64 {
        self.inner.borrow().created_time
    }

    /// Time at which the task becomes eligible to run (`created + delay`).
    pub fn queue_time(&self) -> f64 {
        self.inner.borrow().queue_time
    }

    pub fn is_preempt(&self) -> bool {
        self.inner.borrow().preempt
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.borrow().persistent
    }

    /// Whether this task blocks its queue while its async work is in flight.
    pub fn suspends(&self) -> bool {
        self.inner.borrow().suspend
    }

    /// The task's result, lazily created and memoized: every call before
    /// settlement observes the same cell. Resolves with the callback's value,
    /// rejects with [`TaskError::Aborted`] on cancellation of a pending task
    /// or [`TaskError::Callback`] on failure.
    ///
    /// Requested for the first time after the task already terminated, the
    /// result settles immediately; the callback's value is no longer held at
    /// that point, so a completed task resolves with a unit value.
    pub fn result(&self) -> TaskResult {
        let mut inner = self.inner.borrow_mut();
        if inner.result.is_none() {
            match inner.status {
                TaskStatus::Completed => {
                    let cell = ResultCell::new();
                    cell.settle(Ok(Rc::new(()) as TaskValue));
                    return TaskResult { cell };
                }
                TaskStatus::Canceled => {
                    let cell = ResultCell::new();
                    cell.settle(Err(TaskError::Aborted(self.id)));
                    return TaskResult { cell };
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }
        }
        let cell = inner.result.get_or_insert_with(ResultCell::new).clone();
        TaskResult { cell }
    }

    /// Cancel the task.
    ///
    /// Pending: removed from its list, terminates as canceled, the result
    /// rejects with an abort error; returns `true`. Running and persistent:
    /// flips persistence off so the in-flight run terminates the task;
    /// returns `true`. Anything else is a no-op returning `false`, so calling
    /// twice is safe. The underlying work of an in-flight async task is never
    /// interrupted, only the queue's bookkeeping.
    pub fn cancel(self: &Rc<Self>) -> bool {
        let (status, queue) = {
            let inner = self.inner.borrow();
            (inner.status, inner.queue.upgrade())
        };
        match status {
            TaskStatus::Pending => {
                let Some(queue) = queue else {
                    return false;
                };
                let queue = TaskQueue::from_inner(queue);
                queue.cancel_pending_task(self)
            }
            TaskStatus::Running => {
                let mut inner = self.inner.borrow_mut();
                if inner.persistent {
                    inner.persistent = false;
                    inner.cancel_requested = true;
                    tracing::debug!("canceled persistent task {} mid-run", self.id);
                    true
                } else {
                    false
                }
            }
            TaskStatus::Completed | TaskStatus::Canceled => false,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("queue_time", &inner.queue_time)
            .field("preempt", &inner.preempt)
            .field("persistent", &inner.persistent)
            .finish_non_exhaustive()
    }
}
