//! SystemClock - the real clock
//!
//! Each timer or ticker is driven by its own thread that sleeps on a condvar
//! until the fire time or until it is stopped, reset or released.

use crate::clock::Clock;
use crate::error::ClockError;
use crate::tickable::{Backing, Delivery, TickableKind};
use crate::ticker::Ticker;
use crate::timer::Timer;
use crate::Time;
use chrono::{TimeDelta, Utc};
use log::{trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Wall-clock time and real timers.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

fn to_std(d: TimeDelta) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

/// Stand-in fire delay for durations `Instant` cannot represent.
const NEVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn due_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d)
        .or_else(|| now.checked_add(NEVER))
        .unwrap_or(now)
}

struct RealState {
    due: Option<Instant>,
    period: Option<Duration>,
    delivery: Delivery,
    /// No handle remains; the driver exits once nothing is due.
    released: bool,
}

pub(crate) struct RealTimer {
    state: Mutex<RealState>,
    wake: Condvar,
}

impl RealTimer {
    fn spawn(
        d: Duration,
        period: Option<Duration>,
        delivery: Delivery,
        released: bool,
    ) -> Arc<Self> {
        let timer = Arc::new(Self {
            state: Mutex::new(RealState {
                due: Some(due_after(d)),
                period,
                delivery,
                released,
            }),
            wake: Condvar::new(),
        });

        let driver = timer.clone();
        if let Err(e) = thread::Builder::new()
            .name("real-timer".to_string())
            .spawn(move || driver.run())
        {
            warn!("could not spawn real timer thread: {}", e);
        }
        timer
    }

    fn run(&self) {
        let mut st = self.state.lock();
        loop {
            let Some(due) = st.due else {
                if st.released {
                    return;
                }
                self.wake.wait(&mut st);
                continue;
            };

            let now = Instant::now();
            if now < due {
                self.wake.wait_until(&mut st, due);
                continue;
            }

            // Re-arm past every missed boundary; missed ticks are dropped.
            st.due = st.period.and_then(|p| {
                let mut next = due.checked_add(p)?;
                while next <= now {
                    next = next.checked_add(p)?;
                }
                Some(next)
            });

            let delivery = st.delivery.clone();
            let connected = MutexGuard::unlocked(&mut st, || {
                delivery.offer(Utc::now().fixed_offset())
            });
            if !connected {
                trace!("real timer receiver gone, exiting");
                return;
            }
        }
    }

    pub(crate) fn stop(&self) -> bool {
        let was_active = self.state.lock().due.take().is_some();
        self.wake.notify_one();
        was_active
    }

    pub(crate) fn reset(&self, d: TimeDelta) -> bool {
        let was_active = {
            let mut st = self.state.lock();
            st.due.replace(due_after(to_std(d))).is_some()
        };
        self.wake.notify_one();
        was_active
    }

    pub(crate) fn reset_period(&self, d: TimeDelta) {
        {
            let mut st = self.state.lock();
            let period = to_std(d);
            st.period = Some(period);
            st.due = Some(due_after(period));
        }
        self.wake.notify_one();
    }

    /// The handle went away. A pending one-shot still fires; a ticker stops.
    pub(crate) fn release(&self) {
        {
            let mut st = self.state.lock();
            st.released = true;
            if st.period.is_some() {
                st.due = None;
            }
        }
        self.wake.notify_one();
    }
}

impl SystemClock {
    fn timer(&self, d: TimeDelta, delivery: Delivery, rx: Option<Receiver<Time>>) -> Timer {
        let timer = RealTimer::spawn(to_std(d), None, delivery, false);
        Timer::new(Backing::Real(timer), rx)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Time {
        Utc::now().fixed_offset()
    }

    fn after(&self, d: TimeDelta) -> Receiver<Time> {
        let (tx, rx) = sync_channel(1);
        RealTimer::spawn(to_std(d), None, Delivery::Channel(tx), true);
        rx
    }

    fn after_func(&self, d: TimeDelta, f: Box<dyn Fn() + Send + Sync>) -> Timer {
        self.timer(d, Delivery::Callback(Arc::from(f)), None)
    }

    fn new_timer(&self, d: TimeDelta) -> Timer {
        let (tx, rx) = sync_channel(1);
        self.timer(d, Delivery::Channel(tx), Some(rx))
    }

    fn new_ticker(&self, d: TimeDelta) -> Result<Ticker, ClockError> {
        if d <= TimeDelta::zero() {
            return Err(ClockError::NonPositiveInterval(TickableKind::Ticker));
        }
        let (tx, rx) = sync_channel(1);
        let period = to_std(d);
        let timer = RealTimer::spawn(period, Some(period), Delivery::Channel(tx), false);
        Ok(Ticker::new(Backing::Real(timer), Some(rx)))
    }

    fn sleep(&self, d: TimeDelta) {
        if d > TimeDelta::zero() {
            spin_sleep::sleep(to_std(d));
        }
    }

    fn tick(&self, d: TimeDelta) -> Option<Receiver<Time>> {
        if d <= TimeDelta::zero() {
            return None;
        }
        let (tx, rx) = sync_channel(1);
        let period = to_std(d);
        RealTimer::spawn(period, Some(period), Delivery::Channel(tx), true);
        Some(rx)
    }

    fn since(&self, t: Time) -> TimeDelta {
        self.now() - t
    }

    fn until(&self, t: Time) -> TimeDelta {
        t - self.now()
    }
}
