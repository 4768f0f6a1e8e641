use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt;
use std::rc::Rc;

use luma_scheduler::{
    ControlledFlushHost, QueueTaskOptions, ScheduleError, Task, TaskError, TaskOutcome, TaskQueue,
    TaskQueuePriority, TaskStatus, VirtualClock,
};

fn make_queue() -> (Rc<VirtualClock>, ControlledFlushHost, TaskQueue) {
    let clock = VirtualClock::new();
    let host = ControlledFlushHost::new();
    let queue = TaskQueue::new(TaskQueuePriority::Render, clock.clone(), &host);
    (clock, host, queue)
}

#[derive(Debug)]
struct Boom;

impl fmt::Display for Boom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("boom")
    }
}

impl Error for Boom {}

#[test]
fn persistent_task_reruns_until_canceled() {
    let (_clock, host, queue) = make_queue();
    let count = Rc::new(Cell::new(0));

    let task = {
        let count = count.clone();
        queue
            .queue_task(
                move |_| {
                    count.set(count.get() + 1);
                    TaskOutcome::done()
                },
                QueueTaskOptions {
                    persistent: true,
                    ..Default::default()
                },
            )
            .unwrap()
    };

    for _ in 0..3 {
        host.tick().unwrap();
    }
    assert_eq!(count.get(), 3);
    assert_eq!(task.status(), TaskStatus::Pending);

    assert!(task.cancel());
    assert_eq!(task.status(), TaskStatus::Canceled);
    host.tick().unwrap();
    assert_eq!(count.get(), 3);
    assert!(queue.is_empty());
}

#[test]
fn cancel_during_own_run_ends_persistence() {
    let (_clock, host, queue) = make_queue();
    let count = Rc::new(Cell::new(0));
    let slot: Rc<RefCell<Option<Rc<Task>>>> = Rc::new(RefCell::new(None));

    let task = {
        let count = count.clone();
        let slot = slot.clone();
        queue
            .queue_task(
                move |_| {
                    count.set(count.get() + 1);
                    if let Some(me) = slot.borrow().as_ref() {
                        // canceling a running persistent task reports success
                        assert!(me.cancel());
                        assert!(!me.is_persistent());
                    }
                    TaskOutcome::done()
                },
                QueueTaskOptions {
                    persistent: true,
                    ..Default::default()
                },
            )
            .unwrap()
    };
    *slot.borrow_mut() = Some(task.clone());

    host.tick().unwrap();
    assert_eq!(count.get(), 1);
    assert_eq!(task.status(), TaskStatus::Canceled);

    // no further runs and nothing left armed
    assert!(!host.tick().unwrap());
    assert_eq!(count.get(), 1);
}

#[test]
fn cancel_of_pending_task_rejects_its_result() {
    let (_clock, host, queue) = make_queue();

    let task = queue
        .queue_task(|_| TaskOutcome::done(), QueueTaskOptions::default())
        .unwrap();
    let result = task.result();

    assert!(task.cancel());
    assert!(!task.cancel());
    assert_eq!(task.status(), TaskStatus::Canceled);

    let Err(err) = host.drive(result).unwrap() else {
        panic!("expected the result to reject");
    };
    assert!(err.is_abort());
    assert!(matches!(err, TaskError::Aborted(id) if id == task.id()));
}

#[test]
fn cancel_of_terminal_task_is_a_noop() {
    let (_clock, host, queue) = make_queue();

    let task = queue
        .queue_task(|_| TaskOutcome::done(), QueueTaskOptions::default())
        .unwrap();
    host.tick().unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    assert!(!task.cancel());
}

#[test]
fn invalid_option_combinations_are_rejected_synchronously() {
    let (clock, host, queue) = make_queue();

    let err = queue
        .queue_task(
            |_| TaskOutcome::done(),
            QueueTaskOptions {
                preempt: true,
                delay: 10.0,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err, ScheduleError::PreemptWithDelay);

    let err = queue
        .queue_task(
            |_| TaskOutcome::done(),
            QueueTaskOptions {
                preempt: true,
                persistent: true,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err, ScheduleError::PreemptWithPersistent);

    let micro = TaskQueue::new(TaskQueuePriority::MicroTask, clock.clone(), &host);
    let err = micro
        .queue_task(
            |_| TaskOutcome::done(),
            QueueTaskOptions {
                persistent: true,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err, ScheduleError::PersistentOnMicroTask);

    // nothing was created or armed by the rejected calls
    assert!(queue.is_empty());
    assert!(micro.is_empty());
}

#[test]
fn completed_reusable_task_is_recycled_from_the_pool() {
    let (_clock, host, queue) = make_queue();

    let first = queue
        .queue_task(|_| TaskOutcome::done(), QueueTaskOptions::default())
        .unwrap();
    host.tick().unwrap();
    assert_eq!(first.status(), TaskStatus::Completed);

    // advisory: this implementation reuses the same allocation
    let second = queue
        .queue_task(|_| TaskOutcome::done(), QueueTaskOptions::default())
        .unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(second.status(), TaskStatus::Pending);

    host.tick().unwrap();

    let third = queue
        .queue_task(
            |_| TaskOutcome::done(),
            QueueTaskOptions {
                reusable: false,
                ..Default::default()
            },
        )
        .unwrap();
    host.tick().unwrap();

    // non-reusable tasks never enter the pool
    let fourth = queue
        .queue_task(|_| TaskOutcome::done(), QueueTaskOptions::default())
        .unwrap();
    assert!(!Rc::ptr_eq(&third, &fourth));
}

#[test]
fn callback_failure_rejects_an_observed_result() {
    let (_clock, host, queue) = make_queue();

    let task = queue
        .queue_task(|_| TaskOutcome::fault(Boom), QueueTaskOptions::default())
        .unwrap();
    let result = task.result();

    // the failure was observed through the result, so the flush succeeds
    host.tick().unwrap();

    let Err(err) = host.drive(result).unwrap() else {
        panic!("expected the result to reject");
    };
    assert!(matches!(err, TaskError::Callback(id, _) if id == task.id()));
}

#[test]
fn unobserved_callback_failure_surfaces_from_the_flush() {
    let (_clock, host, queue) = make_queue();

    let task = queue
        .queue_task(|_| TaskOutcome::fault(Boom), QueueTaskOptions::default())
        .unwrap();

    let err = host.tick().unwrap_err();
    assert!(matches!(err, TaskError::Callback(id, _) if id == task.id()));
}

#[test]
fn result_is_memoized_across_calls() {
    let (_clock, host, queue) = make_queue();

    let task = queue
        .queue_task(|_| TaskOutcome::value(7i32), QueueTaskOptions::default())
        .unwrap();
    let first = task.result();
    let second = task.result();
    host.tick().unwrap();

    // both handles observe the same settlement
    let a = host.drive(first).unwrap().unwrap();
    let b = host.drive(second).unwrap().unwrap();
    assert_eq!(a.downcast_ref::<i32>(), Some(&7));
    assert_eq!(b.downcast_ref::<i32>(), Some(&7));

    // a result requested after termination settles immediately, but the
    // callback's value is gone by then
    let late = host.drive(task.result()).unwrap().unwrap();
    assert!(late.downcast_ref::<()>().is_some());
}
