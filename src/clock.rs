//! Clock - the capability shared by the virtual and the real clock

use crate::error::ClockError;
use crate::system::SystemClock;
use crate::ticker::Ticker;
use crate::timer::Timer;
use crate::Time;
use chrono::TimeDelta;
use once_cell::sync::Lazy;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// A source of time and timers.
pub trait Clock: Send + Sync {
    fn now(&self) -> Time;

    /// A channel receiving the fire time once, `d` from now.
    fn after(&self, d: TimeDelta) -> Receiver<Time>;

    /// Run `f` on its own thread once `d` has elapsed.
    fn after_func(&self, d: TimeDelta, f: Box<dyn Fn() + Send + Sync>) -> Timer;

    fn new_timer(&self, d: TimeDelta) -> Timer;

    /// Fails when `d <= 0`.
    fn new_ticker(&self, d: TimeDelta) -> Result<Ticker, ClockError>;

    /// Block the calling thread for `d`.
    fn sleep(&self, d: TimeDelta);

    /// A ticker channel with no handle to stop it. `None` when `d <= 0`.
    fn tick(&self, d: TimeDelta) -> Option<Receiver<Time>>;

    fn since(&self, t: Time) -> TimeDelta;

    fn until(&self, t: Time) -> TimeDelta;
}

static SYSTEM_CLOCK: Lazy<Arc<dyn Clock>> = Lazy::new(|| Arc::new(SystemClock));

/// The process-wide real clock.
pub fn system_clock() -> Arc<dyn Clock> {
    SYSTEM_CLOCK.clone()
}
