use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::task::noop_waker;

use crate::error::TaskError;
use crate::queue::TaskQueue;

/// Per-queue collaborator that schedules "please flush me soon" on some
/// externally supplied mechanism. The scheduler core treats the mechanism as
/// opaque: a host may back it with a microtask hook, a timer, an
/// animation-frame-like hook, or a hand-driven tick loop.
pub trait FlushRequestor {
    /// Ask for a flush as soon as the host allows.
    fn request(&self);

    /// Ask for a flush within a bounded polling interval of `max_delay`
    /// milliseconds, used while waiting on delayed or async work. Hosts
    /// without a distinct bounded mechanism treat it as a plain request.
    fn request_clamped(&self, max_delay: f64) {
        let _ = max_delay;
        self.request();
    }

    /// Withdraw an outstanding request.
    fn cancel(&self);
}

/// Factory producing one [`FlushRequestor`] per queue at construction time.
pub trait FlushRequestorFactory {
    fn create(&self, queue: &TaskQueue) -> Rc<dyn FlushRequestor>;
}

struct Slot {
    queue: TaskQueue,
    requested: Rc<Cell<bool>>,
}

/// The requestor half holds only the armed flag, never the queue, so queues
/// and their requestors do not form an `Rc` cycle.
struct ControlledFlushRequestor {
    requested: Rc<Cell<bool>>,
}

impl FlushRequestor for ControlledFlushRequestor {
    fn request(&self) {
        self.requested.set(true);
    }

    fn cancel(&self) {
        self.requested.set(false);
    }
}

/// Deterministic flush host: records which queues asked to be flushed and
/// fires them only when the embedder calls [`ControlledFlushHost::tick`].
/// Pairs with [`VirtualClock`](crate::clock::VirtualClock) for fully
/// simulated scheduling in tests and host event loops that own their own
/// cadence.
#[derive(Clone, Default)]
pub struct ControlledFlushHost {
    slots: Rc<RefCell<Vec<Slot>>>,
}

impl ControlledFlushHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every armed flush request once. Returns whether any queue
    /// flushed; a queue that re-armed itself (delayed or persistent work)
    /// will fire again on the next tick.
    pub fn tick(&self) -> Result<bool, TaskError> {
        let armed: Vec<TaskQueue> = {
            let slots = self.slots.borrow();
            slots
                .iter()
                .filter(|slot| slot.requested.get())
                .map(|slot| {
                    slot.requested.set(false);
                    slot.queue.clone()
                })
                .collect()
        };
        let fired = !armed.is_empty();
        for queue in armed {
            queue.flush()?;
        }
        Ok(fired)
    }

    /// Tick until no queue asks for another flush.
    ///
    /// Suitable for bursts of immediate work. A queue holding persistent or
    /// delayed work re-arms itself each pass, so such workloads want
    /// [`ControlledFlushHost::tick`] combined with clock control instead.
    pub fn run_until_idle(&self) -> Result<(), TaskError> {
        while self.tick()? {}
        Ok(())
    }

    /// Poll `future` to completion, firing armed flushes between polls.
    ///
    /// Panics if the future is still pending while no flush is armed: the
    /// host has no way left to make progress, which means the caller is
    /// waiting on work (e.g. an unreported async completion) that will never
    /// arrive through this host.
    pub fn drive<F: Future>(&self, future: F) -> Result<F::Output, TaskError> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            if !self.tick()? {
                panic!("drive stalled: future is pending but no flush is armed");
            }
        }
    }
}

impl FlushRequestorFactory for ControlledFlushHost {
    fn create(&self, queue: &TaskQueue) -> Rc<dyn FlushRequestor> {
        let requested = Rc::new(Cell::new(false));
        self.slots.borrow_mut().push(Slot {
            queue: queue.clone(),
            requested: requested.clone(),
        });
        Rc::new(ControlledFlushRequestor { requested })
    }
}
