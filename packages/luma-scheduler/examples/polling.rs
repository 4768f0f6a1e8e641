//! A small polling workload: a persistent delayed task ticking on a
//! controlled host, alongside one-shot work, until the poller is canceled.

use std::cell::Cell;
use std::error::Error;
use std::rc::Rc;

use luma_scheduler::{
    ControlledFlushHost, QueueTaskOptions, Scheduler, TaskOutcome, VirtualClock,
};

fn main() -> Result<(), Box<dyn Error>> {
    let clock = VirtualClock::new();
    let host = ControlledFlushHost::new();
    let scheduler = Scheduler::new(clock.clone(), &host);

    let polls = Rc::new(Cell::new(0u32));
    let poller = {
        let polls = polls.clone();
        scheduler.queue_macro_task(
            move |elapsed| {
                polls.set(polls.get() + 1);
                println!("poll #{} ({elapsed}ms after re-arm)", polls.get());
                TaskOutcome::done()
            },
            QueueTaskOptions {
                persistent: true,
                delay: 100.0,
                ..Default::default()
            },
        )?
    };

    scheduler.queue_render_task(
        |_| {
            println!("one-shot render work");
            TaskOutcome::done()
        },
        QueueTaskOptions::default(),
    )?;

    for _ in 0..5 {
        clock.advance(100.0);
        host.tick()?;
    }

    poller.cancel();
    host.run_until_idle()?;
    println!("done after {} polls", polls.get());
    Ok(())
}
