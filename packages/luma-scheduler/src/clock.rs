use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Monotonic time source. All scheduler timestamps are milliseconds as `f64`.
pub trait Clock {
    /// Get the current time in milliseconds (monotonic).
    fn now(&self) -> f64;
}

/// Clock backed by `Instant`, measuring from its own creation.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Manually advanced clock for tests and deterministic embeddings.
///
/// Time only moves when the owner calls [`VirtualClock::set`] or
/// [`VirtualClock::advance`], so delayed-task eligibility can be exercised
/// without real waiting.
#[derive(Default)]
pub struct VirtualClock {
    time: Cell<f64>,
}

impl VirtualClock {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn set(&self, time: f64) {
        self.time.set(time);
    }

    pub fn advance(&self, delta: f64) {
        self.time.set(self.time.get() + delta);
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> f64 {
        self.time.get()
    }
}
