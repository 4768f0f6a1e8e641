//! Cooperative multi-priority task scheduler for the Luma framework.
//!
//! Single-threaded by design: five priority queues order, defer, coalesce
//! and await units of work, with persistent (repeating) tasks, delayed
//! tasks, preemption and async task suspension. The host supplies the
//! flush-scheduling mechanism through [`FlushRequestorFactory`].

pub mod clock;
pub mod error;
pub mod flush;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use clock::{Clock, MonotonicClock, VirtualClock};
pub use error::{ScheduleError, TaskError};
pub use flush::{ControlledFlushHost, FlushRequestor, FlushRequestorFactory};
pub use queue::{QueueConfig, QueueTaskOptions, Settled, TaskQueue, TaskQueuePriority};
pub use scheduler::{HostKey, Scheduler, SchedulerRegistry};
pub use task::{Task, TaskCallback, TaskId, TaskOutcome, TaskResult, TaskStatus, TaskValue};
