use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use smallvec::SmallVec;

use crate::clock::Clock;
use crate::error::{ScheduleError, TaskError};
use crate::flush::{FlushRequestor, FlushRequestorFactory};
use crate::task::{Task, TaskCallback, TaskOutcome, TaskStatus, TaskValue};

/// The five fixed priority levels, ordered by intended execution cadence
/// (microtask soonest, idle last). Used purely as routing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskQueuePriority {
    MicroTask,
    Render,
    MacroTask,
    PostRender,
    Idle,
}

impl TaskQueuePriority {
    pub const ALL: [TaskQueuePriority; 5] = [
        TaskQueuePriority::MicroTask,
        TaskQueuePriority::Render,
        TaskQueuePriority::MacroTask,
        TaskQueuePriority::PostRender,
        TaskQueuePriority::Idle,
    ];
}

/// Options accepted by [`TaskQueue::queue_task`].
#[derive(Debug, Clone, Copy)]
pub struct QueueTaskOptions {
    /// Minimum delay in milliseconds before the task is eligible to run.
    pub delay: f64,
    /// Jump the line: run on the next flush ahead of already-pending
    /// non-preempt tasks. Cannot combine with a delay or with persistence.
    pub preempt: bool,
    /// Re-queue after every run until explicitly canceled. Forbidden on the
    /// microtask queue.
    pub persistent: bool,
    /// Return the task object to the queue's pool once it terminates.
    pub reusable: bool,
    /// When the callback reports asynchronous work, block this queue until
    /// the work settles instead of running subsequent tasks concurrently.
    pub suspend: bool,
}

impl Default for QueueTaskOptions {
    fn default() -> Self {
        Self {
            delay: 0.0,
            preempt: false,
            persistent: false,
            reusable: true,
            suspend: false,
        }
    }
}

/// Tunables for a single queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Bounded polling interval, in milliseconds, used for clamped flush
    /// requests while waiting on delayed or async work.
    pub clamp_interval: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { clamp_interval: 5.0 }
    }
}

pub(crate) enum YieldState {
    Waiting(SmallVec<[Waker; 2]>),
    Resolved,
}

/// Shared cell behind an in-progress yield. Resolved exclusively by the
/// flush/completion paths observing that no finite work remains.
pub(crate) struct YieldCell {
    state: RefCell<YieldState>,
}

impl YieldCell {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(YieldState::Waiting(SmallVec::new())),
        })
    }

    pub(crate) fn resolve(&self) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                YieldState::Waiting(wakers) => {
                    let wakers = std::mem::take(wakers);
                    *state = YieldState::Resolved;
                    wakers
                }
                YieldState::Resolved => return,
            }
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn poll_resolved(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            YieldState::Waiting(wakers) => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            YieldState::Resolved => Poll::Ready(()),
        }
    }
}

/// Future returned by [`TaskQueue::settled`]. Resolves once the queue has no
/// more finite work outstanding; persistent tasks may keep cycling.
pub struct Settled {
    cell: Option<Rc<YieldCell>>,
}

impl Future for Settled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &self.cell {
            // the queue was already drained when this future was created
            None => Poll::Ready(()),
            Some(cell) => cell.poll_resolved(cx),
        }
    }
}

pub(crate) struct QueueInner {
    priority: TaskQueuePriority,
    clock: Rc<dyn Clock>,
    /// Tasks being run this flush cycle.
    processing: VecDeque<Rc<Task>>,
    /// Tasks due now, awaiting the next flush.
    pending: VecDeque<Rc<Task>>,
    /// Tasks due in the future, ascending `queue_time` by construction.
    delayed: VecDeque<Rc<Task>>,
    /// Free-list of terminated reusable tasks.
    task_pool: Vec<Rc<Task>>,
    /// The suspending async task currently blocking this queue, if any.
    suspender_task: Option<Rc<Task>>,
    /// In-flight async tasks that do not block the queue.
    pending_async_count: usize,
    flush_requested: bool,
    yield_cell: Option<Rc<YieldCell>>,
    requestor: Option<Rc<dyn FlushRequestor>>,
    clamp_interval: f64,
    last_flush: f64,
    /// Weak self-reference handed to tasks as their back-pointer.
    pub(crate) self_ref: Weak<RefCell<QueueInner>>,
}

impl QueueInner {
    fn is_lists_empty(&self) -> bool {
        self.processing.is_empty() && self.pending.is_empty() && self.delayed.is_empty()
    }

    fn has_async_in_flight(&self) -> bool {
        self.pending_async_count > 0 || self.suspender_task.is_some()
    }

    fn has_no_more_finite_work(&self) -> bool {
        !self.has_async_in_flight()
            && self.processing.iter().all(|t| t.is_persistent())
            && self.pending.iter().all(|t| t.is_persistent())
            && self.delayed.iter().all(|t| t.is_persistent())
    }

    fn promote_pending(&mut self) {
        self.processing.append(&mut self.pending);
    }

    /// Move the due prefix of `delayed` into `processing`, stable.
    fn promote_due_delayed(&mut self, now: f64) {
        loop {
            let due = matches!(self.delayed.front(), Some(t) if t.queue_time() <= now);
            if !due {
                break;
            }
            if let Some(task) = self.delayed.pop_front() {
                self.processing.push_back(task);
            }
        }
    }

    /// Detach a task from whichever list currently holds it. Guesses by the
    /// task's own shape first; the full scan across all three lists is a
    /// deliberate O(n) fallback for the rare movement/cancellation cases.
    pub(crate) fn remove_task(&mut self, task: &Rc<Task>) -> Result<(), ScheduleError> {
        if task.is_preempt() {
            if remove_from(&mut self.processing, task) {
                return Ok(());
            }
        } else if task.queue_time() > self.last_flush {
            if remove_from(&mut self.delayed, task) {
                return Ok(());
            }
        }
        if remove_from(&mut self.pending, task)
            || remove_from(&mut self.processing, task)
            || remove_from(&mut self.delayed, task)
        {
            return Ok(());
        }
        Err(ScheduleError::TaskNotFound(task.id()))
    }
}

fn remove_from(list: &mut VecDeque<Rc<Task>>, task: &Rc<Task>) -> bool {
    if let Some(index) = list.iter().position(|t| Rc::ptr_eq(t, task)) {
        list.remove(index);
        true
    } else {
        false
    }
}

/// A priority-ordered task queue driving the flush/processing cycle for one
/// of the five priority levels.
///
/// Cheaply cloneable handle; all clones refer to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Rc<RefCell<QueueInner>>,
}

impl TaskQueue {
    pub fn new(
        priority: TaskQueuePriority,
        clock: Rc<dyn Clock>,
        factory: &dyn FlushRequestorFactory,
    ) -> TaskQueue {
        Self::with_config(priority, clock, factory, QueueConfig::default())
    }

    pub fn with_config(
        priority: TaskQueuePriority,
        clock: Rc<dyn Clock>,
        factory: &dyn FlushRequestorFactory,
        config: QueueConfig,
    ) -> TaskQueue {
        let inner = Rc::new(RefCell::new(QueueInner {
            priority,
            clock,
            processing: VecDeque::new(),
            pending: VecDeque::new(),
            delayed: VecDeque::new(),
            task_pool: Vec::new(),
            suspender_task: None,
            pending_async_count: 0,
            flush_requested: false,
            yield_cell: None,
            requestor: None,
            clamp_interval: config.clamp_interval,
            last_flush: 0.0,
            self_ref: Weak::new(),
        }));
        inner.borrow_mut().self_ref = Rc::downgrade(&inner);
        let queue = TaskQueue { inner };
        let requestor = factory.create(&queue);
        queue.inner.borrow_mut().requestor = Some(requestor);
        queue
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<QueueInner>>) -> TaskQueue {
        TaskQueue { inner }
    }

    pub fn priority(&self) -> TaskQueuePriority {
        self.inner.borrow().priority
    }

    /// Whether all three task lists are empty. In-flight async work is not
    /// counted; see [`TaskQueue::settled`] for full quiescence.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_lists_empty()
    }

    /// Time of the most recent flush, in the queue's clock.
    pub fn last_flush(&self) -> f64 {
        self.inner.borrow().last_flush
    }

    /// Create a task and place it for execution.
    ///
    /// The first task of a new burst eagerly arms a flush request. Preempting
    /// tasks go straight into `processing`, zero-delay tasks into `pending`,
    /// delayed tasks into `delayed`. Returns the task handle; the caller may
    /// await [`Task::result`] or call [`Task::cancel`].
    pub fn queue_task(
        &self,
        callback: impl FnMut(f64) -> TaskOutcome + 'static,
        opts: QueueTaskOptions,
    ) -> Result<Rc<Task>, ScheduleError> {
        self.queue_task_boxed(Box::new(callback), opts)
    }

    fn queue_task_boxed(
        &self,
        callback: TaskCallback,
        opts: QueueTaskOptions,
    ) -> Result<Rc<Task>, ScheduleError> {
        let QueueTaskOptions {
            delay,
            preempt,
            persistent,
            reusable,
            suspend,
        } = opts;
        let delay = delay.max(0.0);
        {
            let inner = self.inner.borrow();
            if preempt {
                if delay > 0.0 {
                    return Err(ScheduleError::PreemptWithDelay);
                }
                if persistent {
                    return Err(ScheduleError::PreemptWithPersistent);
                }
            }
            if persistent && inner.priority == TaskQueuePriority::MicroTask {
                return Err(ScheduleError::PersistentOnMicroTask);
            }
        }
        // first task of a burst arms the flush before placement
        if self.inner.borrow().processing.is_empty() {
            self.request_flush();
        }
        let mut inner = self.inner.borrow_mut();
        let now = inner.clock.now();
        let task = if reusable {
            match inner.task_pool.pop() {
                Some(task) => {
                    task.reinit(
                        inner.self_ref.clone(),
                        now,
                        delay,
                        preempt,
                        persistent,
                        suspend,
                        reusable,
                        callback,
                    );
                    task
                }
                None => Task::new(
                    inner.self_ref.clone(),
                    now,
                    delay,
                    preempt,
                    persistent,
                    suspend,
                    reusable,
                    callback,
                ),
            }
        } else {
            Task::new(
                inner.self_ref.clone(),
                now,
                delay,
                preempt,
                persistent,
                suspend,
                reusable,
                callback,
            )
        };
        tracing::debug!(
            "queued task {} on {:?} queue (delay={}, preempt={}, persistent={})",
            task.id(),
            inner.priority,
            delay,
            preempt,
            persistent
        );
        if preempt {
            inner.processing.push_back(task.clone());
        } else if delay > 0.0 {
            inner.delayed.push_back(task.clone());
        } else {
            inner.pending.push_back(task.clone());
        }
        Ok(task)
    }

    /// Run one flush pass: promote due work and run everything runnable in
    /// FIFO order, then re-arm if work remains.
    ///
    /// Invoked by the flush-scheduling host when a request fires. An `Err` is
    /// an unobserved callback failure surfacing to that host; queue
    /// bookkeeping is already consistent when it propagates.
    pub fn flush(&self) -> Result<(), TaskError> {
        let now = {
            let mut inner = self.inner.borrow_mut();
            let now = inner.clock.now();
            inner.flush_requested = false;
            inner.last_flush = now;
            if inner.suspender_task.is_some() {
                // blocked on a suspending async task; poll again later
                drop(inner);
                self.request_flush_clamped();
                return Ok(());
            }
            inner.promote_pending();
            inner.promote_due_delayed(now);
            now
        };
        tracing::trace!("flushing {:?} queue at {now}", self.priority());
        loop {
            let task = self.inner.borrow_mut().processing.pop_front();
            let Some(task) = task else { break };
            run_task(self, &task, now)?;
            if task.status() == TaskStatus::Running {
                // the callback reported asynchronous work
                if task.suspends() {
                    self.inner.borrow_mut().suspender_task = Some(task);
                    self.request_flush_clamped();
                    return Ok(());
                }
                self.inner.borrow_mut().pending_async_count += 1;
            }
        }
        // promote anything that became due mid-flush, then re-arm
        let (resolve, rearm) = {
            let mut inner = self.inner.borrow_mut();
            inner.promote_pending();
            inner.promote_due_delayed(now);
            let rearm = if !inner.processing.is_empty() {
                Rearm::Immediate
            } else if !inner.delayed.is_empty() || inner.pending_async_count > 0 {
                Rearm::Clamped
            } else {
                Rearm::None
            };
            let resolve = if inner.yield_cell.is_some() && inner.has_no_more_finite_work() {
                inner.yield_cell.take()
            } else {
                None
            };
            (resolve, rearm)
        };
        match rearm {
            Rearm::Immediate => self.request_flush(),
            Rearm::Clamped => self.request_flush_clamped(),
            Rearm::None => {}
        }
        if let Some(cell) = resolve {
            cell.resolve();
        }
        Ok(())
    }

    /// Wait until the queue has no more finite work outstanding: every
    /// remaining listed task is persistent and no async task is in flight.
    ///
    /// Resolves immediately when the queue is already drained. Concurrent
    /// calls share one memoized signal; once it resolves, the next call
    /// starts a fresh round, so repeated awaits drain successive rounds of
    /// persistent work.
    pub fn settled(&self) -> Settled {
        let mut inner = self.inner.borrow_mut();
        if inner.is_lists_empty() && !inner.has_async_in_flight() {
            return Settled { cell: None };
        }
        let cell = inner.yield_cell.get_or_insert_with(YieldCell::new).clone();
        Settled { cell: Some(cell) }
    }

    /// Remove a task from this queue outright, whatever list holds it.
    pub fn remove(&self, task: &Rc<Task>) -> Result<(), ScheduleError> {
        self.inner.borrow_mut().remove_task(task)
    }

    /// Claim a pending task owned by another queue, e.g. when its priority
    /// changes. The task is detached from its current queue and placed here
    /// exactly as a fresh `queue_task` call would place it.
    pub fn take(&self, task: &Rc<Task>) -> Result<(), ScheduleError> {
        let Some(source) = task.inner().queue.upgrade() else {
            return Err(ScheduleError::TaskNotFound(task.id()));
        };
        if Rc::ptr_eq(&source, &self.inner) {
            return Err(ScheduleError::TaskAlreadyOwned(task.id()));
        }
        if task.status() != TaskStatus::Pending {
            return Err(ScheduleError::TaskNotFound(task.id()));
        }
        if task.is_persistent() && self.priority() == TaskQueuePriority::MicroTask {
            return Err(ScheduleError::PersistentOnMicroTask);
        }
        source.borrow_mut().remove_task(task)?;
        {
            let self_ref = self.inner.borrow().self_ref.clone();
            task.inner_mut().queue = self_ref;
        }
        if self.inner.borrow().processing.is_empty() {
            self.request_flush();
        }
        let mut inner = self.inner.borrow_mut();
        let now = inner.clock.now();
        if task.is_preempt() {
            inner.processing.push_back(task.clone());
        } else if task.queue_time() > now {
            inner.delayed.push_back(task.clone());
        } else {
            inner.pending.push_back(task.clone());
        }
        tracing::debug!("took task {} onto {:?} queue", task.id(), inner.priority);
        Ok(())
    }

    /// Report completion of an async task previously left `Running` by its
    /// callback. Settles the task, unblocks or decrements the queue's async
    /// bookkeeping, and withdraws the flush request if the queue is now
    /// fully quiet.
    ///
    /// Panics if the task is not an in-flight async task of this queue; that
    /// is a programmer error in the completion plumbing.
    pub fn complete_async_task(
        &self,
        task: &Rc<Task>,
        result: Result<TaskValue, TaskError>,
    ) -> Result<(), TaskError> {
        {
            let owner = task.inner().queue.upgrade();
            assert!(
                owner.is_some_and(|q| Rc::ptr_eq(&q, &self.inner)),
                "task {} does not belong to this queue",
                task.id()
            );
        }
        assert!(
            task.status() == TaskStatus::Running,
            "task {} is not in flight (status: {})",
            task.id(),
            task.status()
        );
        let (now, was_suspender) = {
            let mut inner = self.inner.borrow_mut();
            let was_suspender = inner
                .suspender_task
                .as_ref()
                .is_some_and(|t| Rc::ptr_eq(t, task));
            if was_suspender {
                inner.suspender_task = None;
            } else {
                debug_assert!(inner.pending_async_count > 0);
                inner.pending_async_count = inner.pending_async_count.saturating_sub(1);
            }
            (inner.clock.now(), was_suspender)
        };
        let finalized = finalize_run(self, task, result, now);
        let (resolve, quiet) = {
            let mut inner = self.inner.borrow_mut();
            let resolve = if inner.yield_cell.is_some() && inner.has_no_more_finite_work() {
                inner.yield_cell.take()
            } else {
                None
            };
            (resolve, inner.is_lists_empty() && !inner.has_async_in_flight())
        };
        if quiet {
            self.cancel_flush();
        } else if was_suspender {
            // resume the queue now that the blocker settled
            self.request_flush();
        }
        if let Some(cell) = resolve {
            cell.resolve();
        }
        finalized
    }

    /// Withdraw an outstanding flush request, if any.
    pub fn cancel_flush(&self) {
        let requestor = {
            let mut inner = self.inner.borrow_mut();
            if !inner.flush_requested {
                None
            } else {
                inner.flush_requested = false;
                inner.requestor.clone()
            }
        };
        if let Some(requestor) = requestor {
            requestor.cancel();
        }
    }

    fn request_flush(&self) {
        let requestor = {
            let mut inner = self.inner.borrow_mut();
            if inner.flush_requested {
                None
            } else {
                inner.flush_requested = true;
                inner.requestor.clone()
            }
        };
        if let Some(requestor) = requestor {
            requestor.request();
        }
    }

    fn request_flush_clamped(&self) {
        let requestor = {
            let mut inner = self.inner.borrow_mut();
            if inner.flush_requested {
                None
            } else {
                inner.flush_requested = true;
                inner.requestor.clone().map(|r| (r, inner.clamp_interval))
            }
        };
        if let Some((requestor, clamp)) = requestor {
            requestor.request_clamped(clamp);
        }
    }

    /// Cancel a pending task on behalf of [`Task::cancel`].
    pub(crate) fn cancel_pending_task(&self, task: &Rc<Task>) -> bool {
        if self.inner.borrow_mut().remove_task(task).is_err() {
            return false;
        }
        let (cell, reusable) = {
            let mut t = task.inner_mut();
            t.status = TaskStatus::Canceled;
            t.persistent = false;
            t.callback = None;
            (t.result.take(), t.reusable)
        };
        if let Some(cell) = cell {
            cell.settle(Err(TaskError::Aborted(task.id())));
        }
        if reusable {
            self.inner.borrow_mut().task_pool.push(task.clone());
        }
        tracing::debug!("canceled pending task {}", task.id());
        let quiet = {
            let inner = self.inner.borrow();
            inner.is_lists_empty() && !inner.has_async_in_flight()
        };
        if quiet {
            self.cancel_flush();
        }
        true
    }
}

enum Rearm {
    Immediate,
    Clamped,
    None,
}

/// Run one task. The caller has already detached it from list bookkeeping;
/// by the time the callback executes, no queue state refers to it.
fn run_task(queue: &TaskQueue, task: &Rc<Task>, now: f64) -> Result<(), TaskError> {
    let (callback, elapsed) = {
        let mut t = task.inner_mut();
        assert!(
            t.status == TaskStatus::Pending,
            "cannot run task {}: status is {}, expected pending",
            task.id(),
            t.status
        );
        t.status = TaskStatus::Running;
        (t.callback.take(), now - t.created_time)
    };
    let Some(mut callback) = callback else {
        unreachable!("pending task {} has no callback", task.id());
    };
    let outcome = callback(elapsed);
    // keep the callback around; persistent tasks run it again, disposal
    // clears it
    task.inner_mut().callback = Some(callback);
    match outcome {
        TaskOutcome::Pending => Ok(()),
        TaskOutcome::Complete(value) => finalize_run(queue, task, Ok(value), now),
        TaskOutcome::Fault(err) => {
            finalize_run(queue, task, Err(TaskError::Callback(task.id(), err)), now)
        }
    }
}

/// Settle a task that just finished a run (synchronously or via async
/// completion): re-arm it when persistent, otherwise terminate, dispose and
/// pool it. An `Err` return is a callback failure nobody observed through
/// the result; the caller lets it surface.
fn finalize_run(
    queue: &TaskQueue,
    task: &Rc<Task>,
    result: Result<TaskValue, TaskError>,
    now: f64,
) -> Result<(), TaskError> {
    let persistent = task.is_persistent();
    if persistent && result.is_ok() {
        let cell = task.inner_mut().result.take();
        reset_persistent_task(queue, task, now);
        if let Some(cell) = cell {
            cell.settle(result);
        }
        return Ok(());
    }
    let (cell, reusable, canceled) = {
        let mut t = task.inner_mut();
        let canceled = t.cancel_requested;
        t.status = if canceled {
            TaskStatus::Canceled
        } else {
            TaskStatus::Completed
        };
        t.persistent = false;
        t.cancel_requested = false;
        t.callback = None;
        (t.result.take(), t.reusable, canceled)
    };
    if canceled {
        tracing::debug!("task {} terminated after mid-run cancel", task.id());
    }
    if reusable {
        queue.inner.borrow_mut().task_pool.push(task.clone());
    }
    match (cell, result) {
        (Some(cell), result) => {
            cell.settle(result);
            Ok(())
        }
        (None, Ok(_)) => Ok(()),
        (None, Err(err)) => {
            tracing::error!("task {} failed with no result observer: {err}", task.id());
            Err(err)
        }
    }
}

/// Re-arm a persistent task for its next cycle, preserving the original
/// delay offset.
fn reset_persistent_task(queue: &TaskQueue, task: &Rc<Task>, now: f64) {
    let delay = {
        let mut t = task.inner_mut();
        let delay = t.queue_time - t.created_time;
        t.created_time = now;
        t.queue_time = now + delay;
        t.status = TaskStatus::Pending;
        t.cancel_requested = false;
        delay
    };
    let mut inner = queue.inner.borrow_mut();
    if delay > 0.0 {
        inner.delayed.push_back(task.clone());
    } else {
        inner.pending.push_back(task.clone());
    }
}
