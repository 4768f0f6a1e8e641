use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::clock::Clock;
use crate::error::ScheduleError;
use crate::flush::FlushRequestorFactory;
use crate::queue::{QueueConfig, QueueTaskOptions, Settled, TaskQueue, TaskQueuePriority};
use crate::task::{Task, TaskOutcome};

/// The single entry point external callers use: owns exactly five task
/// queues, one per priority, created once at construction and never
/// replaced.
pub struct Scheduler {
    micro_task: TaskQueue,
    render: TaskQueue,
    macro_task: TaskQueue,
    post_render: TaskQueue,
    idle: TaskQueue,
}

impl Scheduler {
    pub fn new(clock: Rc<dyn Clock>, factory: &dyn FlushRequestorFactory) -> Self {
        Self::with_config(clock, factory, QueueConfig::default())
    }

    pub fn with_config(
        clock: Rc<dyn Clock>,
        factory: &dyn FlushRequestorFactory,
        config: QueueConfig,
    ) -> Self {
        let queue = |priority| TaskQueue::with_config(priority, clock.clone(), factory, config);
        Self {
            micro_task: queue(TaskQueuePriority::MicroTask),
            render: queue(TaskQueuePriority::Render),
            macro_task: queue(TaskQueuePriority::MacroTask),
            post_render: queue(TaskQueuePriority::PostRender),
            idle: queue(TaskQueuePriority::Idle),
        }
    }

    pub fn get_task_queue(&self, priority: TaskQueuePriority) -> &TaskQueue {
        match priority {
            TaskQueuePriority::MicroTask => &self.micro_task,
            TaskQueuePriority::Render => &self.render,
            TaskQueuePriority::MacroTask => &self.macro_task,
            TaskQueuePriority::PostRender => &self.post_render,
            TaskQueuePriority::Idle => &self.idle,
        }
    }

    pub fn get_micro_task_queue(&self) -> &TaskQueue {
        &self.micro_task
    }

    pub fn get_render_task_queue(&self) -> &TaskQueue {
        &self.render
    }

    pub fn get_macro_task_queue(&self) -> &TaskQueue {
        &self.macro_task
    }

    pub fn get_post_render_task_queue(&self) -> &TaskQueue {
        &self.post_render
    }

    pub fn get_idle_task_queue(&self) -> &TaskQueue {
        &self.idle
    }

    pub fn queue_micro_task(
        &self,
        callback: impl FnMut(f64) -> TaskOutcome + 'static,
        opts: QueueTaskOptions,
    ) -> Result<Rc<Task>, ScheduleError> {
        self.micro_task.queue_task(callback, opts)
    }

    pub fn queue_render_task(
        &self,
        callback: impl FnMut(f64) -> TaskOutcome + 'static,
        opts: QueueTaskOptions,
    ) -> Result<Rc<Task>, ScheduleError> {
        self.render.queue_task(callback, opts)
    }

    pub fn queue_macro_task(
        &self,
        callback: impl FnMut(f64) -> TaskOutcome + 'static,
        opts: QueueTaskOptions,
    ) -> Result<Rc<Task>, ScheduleError> {
        self.macro_task.queue_task(callback, opts)
    }

    pub fn queue_post_render_task(
        &self,
        callback: impl FnMut(f64) -> TaskOutcome + 'static,
        opts: QueueTaskOptions,
    ) -> Result<Rc<Task>, ScheduleError> {
        self.post_render.queue_task(callback, opts)
    }

    pub fn queue_idle_task(
        &self,
        callback: impl FnMut(f64) -> TaskOutcome + 'static,
        opts: QueueTaskOptions,
    ) -> Result<Rc<Task>, ScheduleError> {
        self.idle.queue_task(callback, opts)
    }

    pub fn yield_micro_task(&self) -> Settled {
        self.micro_task.settled()
    }

    pub fn yield_render_task(&self) -> Settled {
        self.render.settled()
    }

    pub fn yield_macro_task(&self) -> Settled {
        self.macro_task.settled()
    }

    pub fn yield_post_render_task(&self) -> Settled {
        self.post_render.settled()
    }

    pub fn yield_idle_task(&self) -> Settled {
        self.idle.settled()
    }

    /// Await settlement of every queue, slowest cadence first (idle down to
    /// microtask), `repeat` times over. Draining in that order lets work
    /// queued by late-settling queues onto faster ones still be caught, so
    /// this is the full-quiescence primitive tests reach for.
    pub async fn yield_all(&self, repeat: usize) {
        for _ in 0..repeat {
            self.idle.settled().await;
            self.post_render.settled().await;
            self.macro_task.settled().await;
            self.render.settled().await;
            self.micro_task.settled().await;
        }
    }
}

static NEXT_HOST_KEY: AtomicU64 = AtomicU64::new(1);

/// Opaque token associating a [`Scheduler`] with a host context in a
/// [`SchedulerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostKey(u64);

impl HostKey {
    /// Mint a fresh key, unique for the life of the process.
    pub fn next() -> Self {
        Self(NEXT_HOST_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Keyed map of scheduler instances, owned by whichever composition root
/// constructs the application. Supports multiple independent schedulers
/// (e.g. multi-window embedding) without a process-wide global.
#[derive(Default)]
pub struct SchedulerRegistry {
    entries: FxHashMap<HostKey, Rc<Scheduler>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: HostKey, scheduler: Rc<Scheduler>) {
        self.entries.insert(key, scheduler);
    }

    pub fn get(&self, key: HostKey) -> Option<Rc<Scheduler>> {
        self.entries.get(&key).cloned()
    }

    pub fn remove(&mut self, key: HostKey) -> Option<Rc<Scheduler>> {
        self.entries.remove(&key)
    }
}
