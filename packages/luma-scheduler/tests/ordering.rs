use std::cell::RefCell;
use std::rc::Rc;

use luma_scheduler::{
    ControlledFlushHost, QueueTaskOptions, TaskOutcome, TaskQueue, TaskQueuePriority, VirtualClock,
};

fn make_queue() -> (Rc<VirtualClock>, ControlledFlushHost, TaskQueue) {
    let clock = VirtualClock::new();
    let host = ControlledFlushHost::new();
    let queue = TaskQueue::new(TaskQueuePriority::Render, clock.clone(), &host);
    (clock, host, queue)
}

#[test]
fn fifo_within_a_priority() {
    let (_clock, host, queue) = make_queue();
    let log = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b", "c"] {
        let log = log.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push(name);
                    TaskOutcome::done()
                },
                QueueTaskOptions::default(),
            )
            .unwrap();
    }

    host.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
}

#[test]
fn preempt_runs_before_already_pending_tasks() {
    let (_clock, host, queue) = make_queue();
    let log = Rc::new(RefCell::new(Vec::new()));

    for name in ["a", "b"] {
        let log = log.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push(name);
                    TaskOutcome::done()
                },
                QueueTaskOptions::default(),
            )
            .unwrap();
    }
    {
        let log = log.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push("p");
                    TaskOutcome::done()
                },
                QueueTaskOptions {
                    preempt: true,
                    ..Default::default()
                },
            )
            .unwrap();
    }

    host.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["p", "a", "b"]);
}

#[test]
fn preempts_keep_fifo_among_themselves() {
    let (_clock, host, queue) = make_queue();
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push("a");
                    TaskOutcome::done()
                },
                QueueTaskOptions::default(),
            )
            .unwrap();
    }
    for name in ["p1", "p2"] {
        let log = log.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push(name);
                    TaskOutcome::done()
                },
                QueueTaskOptions {
                    preempt: true,
                    ..Default::default()
                },
            )
            .unwrap();
    }

    host.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["p1", "p2", "a"]);
}

#[test]
fn tasks_queued_mid_flush_run_on_the_next_flush() {
    let (_clock, host, queue) = make_queue();
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        let queue2 = queue.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push("first");
                    let log = log.clone();
                    queue2
                        .queue_task(
                            move |_| {
                                log.borrow_mut().push("second");
                                TaskOutcome::done()
                            },
                            QueueTaskOptions::default(),
                        )
                        .unwrap();
                    TaskOutcome::done()
                },
                QueueTaskOptions::default(),
            )
            .unwrap();
    }

    host.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["first"]);

    host.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["first", "second"]);
}

#[test]
fn preempt_queued_mid_flush_runs_in_the_same_pass() {
    let (_clock, host, queue) = make_queue();
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        let queue2 = queue.clone();
        queue
            .queue_task(
                move |_| {
                    log.borrow_mut().push("first");
                    let log = log.clone();
                    queue2
                        .queue_task(
                            move |_| {
                                log.borrow_mut().push("preempt");
                                TaskOutcome::done()
                            },
                            QueueTaskOptions {
                                preempt: true,
                                ..Default::default()
                            },
                        )
                        .unwrap();
                    TaskOutcome::done()
                },
                QueueTaskOptions::default(),
            )
            .unwrap();
    }

    host.tick().unwrap();
    assert_eq!(*log.borrow(), vec!["first", "preempt"]);
}

#[test]
fn queues_of_different_priorities_are_independent() {
    let clock = VirtualClock::new();
    let host = ControlledFlushHost::new();
    let render = TaskQueue::new(TaskQueuePriority::Render, clock.clone(), &host);
    let idle = TaskQueue::new(TaskQueuePriority::Idle, clock.clone(), &host);
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log = log.clone();
        idle.queue_task(
            move |_| {
                log.borrow_mut().push("idle");
                TaskOutcome::done()
            },
            QueueTaskOptions::default(),
        )
        .unwrap();
    }
    {
        let log = log.clone();
        render
            .queue_task(
                move |_| {
                    log.borrow_mut().push("render");
                    TaskOutcome::done()
                },
                QueueTaskOptions::default(),
            )
            .unwrap();
    }

    host.tick().unwrap();
    assert!(render.is_empty());
    assert!(idle.is_empty());
    assert_eq!(log.borrow().len(), 2);
}
