//! Engine - the virtual clock
//!
//! Owns the current virtual time, the running/stopped counter and the
//! registry of timers and tickers, and drives the advance loop.
//! - Stopped (the default): time moves only via `advance_by` / `advance_to`
//! - Running: time follows real elapsed time, folded in lazily on `now()`
//!   and `update()`
//!
//! All state sits behind one reader/writer lock. Deliveries are decided
//! under the lock and carried out on detached threads after it is released,
//! so a fired callback may call back into the clock.

use crate::clock::Clock;
use crate::error::ClockError;
use crate::registry::Registry;
use crate::tickable::{Backing, Delivery, Dispatch, TickState, Tickable, TickableKind};
use crate::ticker::Ticker;
use crate::timer::Timer;
use crate::{checked_add, epoch, saturating_add, Location, Time};
use chrono::{Offset, TimeDelta, Utc};
use log::{debug, trace};
use parking_lot::RwLock;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

static CLOCK_SERIAL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_clock_serial() -> u64 {
    CLOCK_SERIAL_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// Serials of the clocks whose lock the current thread holds.
thread_local! {
    static HELD_LOCKS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks a clock's lock as held by this thread for as long as it lives.
struct Held(u64);

impl Held {
    fn enter(serial: u64) -> Self {
        HELD_LOCKS.with(|h| h.borrow_mut().push(serial));
        Held(serial)
    }
}

impl Drop for Held {
    fn drop(&mut self) {
        HELD_LOCKS.with(|h| {
            let mut h = h.borrow_mut();
            if let Some(pos) = h.iter().rposition(|s| *s == self.0) {
                h.remove(pos);
            }
        });
    }
}

/// Options for constructing a `MockClock`, applied in order.
#[derive(Clone, Debug)]
pub enum ClockOption {
    /// Start at the given time (converted to the clock's location).
    AtTime(Time),
    /// Start at the current real time.
    AtNow,
    /// Report times in the given location. Default: UTC.
    InLocation(Location),
    /// Collapse ticks that fall within one advance into a single tick at
    /// the last elapsed boundary.
    DropsTicks,
    /// Real-time suspension around clock mutations. Default: 1ms.
    Yielding(Duration),
    /// Start in running mode.
    StartRunning,
}

pub(crate) struct ClockState {
    pub now: Time,
    /// Real instant at which `now` was last synced.
    pub synced_at: Instant,
    /// Running when zero.
    pub stop_count: u32,
    pub yield_for: Duration,
    pub drops_ticks: bool,
    pub location: Location,
    pub created_at: Time,
    pub registry: Registry,
}

impl ClockState {
    fn new() -> Self {
        Self {
            now: epoch(),
            synced_at: Instant::now(),
            stop_count: 1,
            yield_for: Duration::from_millis(1),
            drops_ticks: false,
            location: Utc.fix(),
            created_at: epoch(),
            registry: Registry::new(),
        }
    }

    fn apply(&mut self, option: ClockOption) {
        match option {
            ClockOption::AtTime(t) => {
                self.now = t.with_timezone(&self.location);
                self.synced_at = Instant::now();
            }
            ClockOption::AtNow => self.apply(ClockOption::AtTime(Utc::now().fixed_offset())),
            ClockOption::InLocation(loc) => {
                self.location = loc;
                self.now = self.now.with_timezone(&loc);
            }
            ClockOption::DropsTicks => self.drops_ticks = true,
            ClockOption::Yielding(d) => self.yield_for = d,
            ClockOption::StartRunning => self.stop_count = self.stop_count.saturating_sub(1),
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_count == 0
    }

    /// Fold real elapsed time into virtual time when running.
    fn sync(&mut self) -> Time {
        if self.is_running() {
            let wall = Instant::now();
            let elapsed = TimeDelta::from_std(wall.duration_since(self.synced_at))
                .unwrap_or_else(|_| TimeDelta::zero());
            self.now = saturating_add(self.now, elapsed);
            self.synced_at = wall;
        }
        self.now
    }
}

/// Shared core of a `MockClock`; timer and ticker handles point here.
pub(crate) struct ClockInner {
    serial: u64,
    state: RwLock<ClockState>,
}

impl ClockInner {
    /// Fail loudly if this thread already holds the lock.
    fn check_reentry(&self) {
        if HELD_LOCKS.with(|h| h.borrow().contains(&self.serial)) {
            panic!("{}", ClockError::ClockLocked);
        }
    }

    /// Run `f` under the shared lock. `f` must not call back into the clock.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&ClockState) -> T) -> T {
        self.check_reentry();
        let _held = Held::enter(self.serial);
        let state = self.state.read();
        f(&state)
    }

    /// Run `f` under the exclusive lock. `f` must not call back into the clock.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut ClockState) -> T) -> T {
        self.check_reentry();
        let (out, retired) = {
            let _held = Held::enter(self.serial);
            let mut state = self.state.write();
            let out = f(&mut state);
            (out, state.registry.take_retired())
        };
        drop(retired);
        out
    }

    fn yield_now(&self) {
        let d = self.read(|s| s.yield_for);
        if !d.is_zero() {
            spin_sleep::sleep(d);
        }
    }

    /// Carry out a delivery and give its receiver a chance to run.
    fn dispatch(&self, dispatch: Dispatch) {
        dispatch.spawn();
        self.yield_now();
    }

    /// Deliver every tickable due at or before `target`, earliest first.
    /// Virtual time steps forward to each fire time as it is dispatched.
    fn run_until(&self, target: Time) -> Result<usize, ClockError> {
        let mut fired = 0;
        loop {
            let next = self.write(|st| {
                let Some(d) = st.registry.fire_due(target, st.drops_ticks)? else {
                    return Ok(None);
                };
                if d.at > st.now {
                    st.now = d.at.with_timezone(&st.location);
                }
                Ok(Some(d))
            })?;
            match next {
                Some(d) => {
                    self.dispatch(d);
                    fired += 1;
                }
                None => return Ok(fired),
            }
        }
    }

    fn register(
        &self,
        kind: TickableKind,
        d: TimeDelta,
        delivery: Delivery,
        orphaned: bool,
    ) -> Result<u64, ClockError> {
        let (id, dispatch) = self.write(|st| {
            let now = st.sync();
            let id = st.registry.alloc_id();
            let next = saturating_add(now, d.max(TimeDelta::zero()));
            let mut t = match kind {
                TickableKind::Timer => Tickable::timer(id, next, delivery),
                TickableKind::Ticker => Tickable::ticker(id, next, d, delivery),
            };
            t.orphaned = orphaned;
            st.registry.activate(t);
            trace!("{} {} registered to fire at {}", kind, id, next);

            let dispatch = if d <= TimeDelta::zero() {
                st.registry.fire(id, now, st.drops_ticks)?
            } else {
                None
            };
            Ok((id, dispatch))
        })?;
        if let Some(d) = dispatch {
            self.dispatch(d);
        }
        Ok(id)
    }

    pub(crate) fn stop_tickable(&self, id: u64) -> bool {
        self.write(|st| {
            let active = st
                .registry
                .get(id)
                .is_some_and(|t| t.state == TickState::Active);
            active && st.registry.enter_state(id, TickState::Stopped).unwrap_or(false)
        })
    }

    /// Re-arm a timer at now+d. Returns whether it was active beforehand.
    pub(crate) fn reset_timer(&self, id: u64, d: TimeDelta) -> Result<bool, ClockError> {
        let (was_active, dispatch) = self.write(|st| {
            let now = st.sync();
            let Some(t) = st.registry.get_mut(id) else {
                return Ok((false, None));
            };
            let was_active = t.state == TickState::Active;
            t.next = saturating_add(now, d);
            st.registry.enter_state(id, TickState::Active)?;
            st.registry.resort();

            let dispatch = if d <= TimeDelta::zero() {
                st.registry.fire(id, now, st.drops_ticks)?
            } else {
                None
            };
            Ok((was_active, dispatch))
        })?;
        if let Some(d) = dispatch {
            self.dispatch(d);
        }
        Ok(was_active)
    }

    pub(crate) fn reset_ticker(&self, id: u64, d: TimeDelta) -> Result<(), ClockError> {
        if d <= TimeDelta::zero() {
            return Err(ClockError::NonPositiveInterval(TickableKind::Ticker));
        }
        self.write(|st| {
            let now = st.sync();
            let Some(t) = st.registry.get_mut(id) else {
                return Ok(());
            };
            t.period = d;
            t.next = saturating_add(now, d);
            st.registry.enter_state(id, TickState::Active)?;
            st.registry.resort();
            Ok(())
        })
    }

    /// The handle for `id` was dropped.
    pub(crate) fn release(&self, id: u64) {
        self.write(|st| st.registry.release(id));
    }

    #[cfg(test)]
    pub(crate) fn next_fire(&self, id: u64) -> Option<Time> {
        self.read(|st| st.registry.get(id).map(|t| t.next))
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, id: u64) -> Option<TickState> {
        self.read(|st| st.registry.get(id).map(|t| t.state))
    }

    #[cfg(test)]
    pub(crate) fn registry_sizes(&self) -> (usize, usize) {
        self.read(|st| (st.registry.active_len(), st.registry.inactive_len()))
    }
}

/// A controllable clock for tests.
///
/// Cloning a `MockClock` yields another handle to the same clock.
#[derive(Clone)]
pub struct MockClock {
    pub(crate) inner: Arc<ClockInner>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (now, running) = self.inner.read(|st| (st.now, st.is_running()));
        f.debug_struct("MockClock")
            .field("now", &now)
            .field("running", &running)
            .finish()
    }
}

impl MockClock {
    /// A stopped clock at the UNIX epoch (UTC), not dropping ticks, with a
    /// 1ms yield.
    pub fn new() -> Self {
        Self::with_options([])
    }

    pub fn with_options(options: impl IntoIterator<Item = ClockOption>) -> Self {
        let mut state = ClockState::new();
        for option in options {
            state.apply(option);
        }
        state.created_at = state.now;
        state.synced_at = Instant::now();

        Self {
            inner: Arc::new(ClockInner {
                serial: next_clock_serial(),
                state: RwLock::new(state),
            }),
        }
    }

    /// Move the clock forward by `d`, firing everything that falls due.
    /// Fails if `now + d` is not a representable time.
    pub fn advance_by(&self, d: TimeDelta) -> Result<(), ClockError> {
        let target = self.inner.read(|st| {
            checked_add(st.now, d).ok_or(ClockError::TimeOverflow {
                current: st.now,
                delta: d,
            })
        })?;
        self.advance_to(target)
    }

    /// Move the clock to `target`, firing everything that falls due in
    /// next-fire order. Fails if `target` is in the past or the clock is
    /// running.
    pub fn advance_to(&self, target: Time) -> Result<(), ClockError> {
        // Let observers on other threads settle before time moves.
        self.inner.yield_now();

        self.inner.read(|st| {
            if st.is_running() {
                return Err(ClockError::ClockIsRunning);
            }
            if target < st.now {
                return Err(ClockError::NotATimeMachine {
                    current: st.now,
                    target,
                });
            }
            Ok(())
        })?;

        debug!("advancing clock to {}", target);
        let fired = self.inner.run_until(target)?;

        self.inner.write(|st| {
            st.now = target.with_timezone(&st.location);
            st.synced_at = Instant::now();
        });
        debug!("clock advanced to {} ({} fired)", target, fired);

        self.inner.yield_now();
        Ok(())
    }

    /// Fold in real elapsed time and fire everything that falls due.
    /// Only valid while running.
    pub fn update(&self) -> Result<(), ClockError> {
        let target = self.inner.write(|st| {
            if !st.is_running() {
                return Err(ClockError::ClockNotRunning);
            }
            Ok(st.sync())
        })?;

        self.inner.yield_now();
        let fired = self.inner.run_until(target)?;
        debug!("clock updated to {} ({} fired)", target, fired);
        self.inner.yield_now();
        Ok(())
    }

    /// Undo one `stop`. When the count reaches zero the clock runs again
    /// and immediately folds in the real time elapsed since its last sync.
    pub fn start(&self) -> Result<(), ClockError> {
        self.inner.write(|st| {
            if st.stop_count == 0 {
                return Err(ClockError::ClockIsRunning);
            }
            st.stop_count -= 1;
            if st.stop_count == 0 {
                let now = st.sync();
                debug!("clock started at {}", now);
            }
            Ok(())
        })
    }

    /// Stop automatic advancement. Every `stop` must be matched by a
    /// `start` before the clock runs again.
    pub fn stop(&self) {
        self.inner.write(|st| {
            st.stop_count += 1;
            trace!("clock stop count {}", st.stop_count);
        });
    }

    pub fn is_running(&self) -> bool {
        self.inner.read(|st| st.is_running())
    }

    /// The virtual time at which the clock was created.
    pub fn created_at(&self) -> Time {
        self.inner.read(|st| st.created_at)
    }

    pub fn since_created(&self) -> TimeDelta {
        self.since(self.created_at())
    }

    pub fn location(&self) -> Location {
        self.inner.read(|st| st.location)
    }

    pub fn drops_ticks(&self) -> bool {
        self.inner.read(|st| st.drops_ticks)
    }

    fn timer(&self, d: TimeDelta, delivery: Delivery, rx: Option<Receiver<Time>>) -> Timer {
        // A timer never fails to enter the expired state.
        match self.inner.register(TickableKind::Timer, d, delivery, false) {
            Ok(id) => Timer::new(
                Backing::Mock {
                    clock: self.inner.clone(),
                    id,
                },
                rx,
            ),
            Err(e) => unreachable!("timer registration failed: {}", e),
        }
    }
}

impl Clock for MockClock {
    /// Current virtual time; a running clock first folds in real elapsed
    /// time.
    fn now(&self) -> Time {
        if self.is_running() {
            self.inner.write(|st| st.sync())
        } else {
            self.inner.read(|st| st.now)
        }
    }

    fn after(&self, d: TimeDelta) -> Receiver<Time> {
        let (tx, rx) = sync_channel(1);
        if let Err(e) = self
            .inner
            .register(TickableKind::Timer, d, Delivery::Channel(tx), true)
        {
            unreachable!("timer registration failed: {}", e);
        }
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
        let id = self
            .inner
            .register(TickableKind::Ticker, d, Delivery::Channel(tx), false)?;
        Ok(Ticker::new(
            Backing::Mock {
                clock: self.inner.clone(),
                id,
            },
            Some(rx),
        ))
    }

    /// A stopped clock blocks until another thread advances it past the
    /// wake-up time; a running clock sleeps for real.
    fn sleep(&self, d: TimeDelta) {
        if d <= TimeDelta::zero() {
            return;
        }
        if self.is_running() {
            if let Ok(d) = d.to_std() {
                spin_sleep::sleep(d);
            }
            return;
        }
        let _ = self.after(d).recv();
    }

    fn tick(&self, d: TimeDelta) -> Option<Receiver<Time>> {
        if d <= TimeDelta::zero() {
            return None;
        }
        let (tx, rx) = sync_channel(1);
        self.inner
            .register(TickableKind::Ticker, d, Delivery::Channel(tx), true)
            .ok()?;
        Some(rx)
    }

    fn since(&self, t: Time) -> TimeDelta {
        self.now() - t
    }

    fn until(&self, t: Time) -> TimeDelta {
        t - self.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    fn quiet(options: impl IntoIterator<Item = ClockOption>) -> MockClock {
        MockClock::with_options(
            [ClockOption::Yielding(Duration::ZERO)]
                .into_iter()
                .chain(options),
        )
    }

    #[test]
    fn test_defaults() {
        let clock = MockClock::new();
        assert_eq!(clock.now(), epoch());
        assert_eq!(clock.created_at(), epoch());
        assert!(!clock.is_running());
        assert!(!clock.drops_ticks());
        assert_eq!(clock.location(), Utc.fix());
        assert_eq!(clock.inner.read(|st| st.yield_for), Duration::from_millis(1));
    }

    #[test]
    fn test_at_time_and_location() {
        let start = epoch() + TimeDelta::days(365);
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let clock = quiet([ClockOption::AtTime(start), ClockOption::InLocation(tz)]);

        assert_eq!(clock.now(), start);
        assert_eq!(clock.now().offset(), &tz);
        assert_eq!(clock.created_at(), start);
    }

    #[test]
    fn test_at_now_is_close_to_real_time() {
        let clock = quiet([ClockOption::AtNow]);
        let drift = Utc::now().fixed_offset() - clock.now();
        assert!(drift >= TimeDelta::zero() && drift < secs(5));
    }

    #[test]
    fn test_advance_by_moves_time() {
        let clock = quiet([]);
        clock.advance_by(secs(10)).unwrap();
        assert_eq!(clock.now(), epoch() + secs(10));
        assert_eq!(clock.since_created(), secs(10));
        assert_eq!(clock.until(epoch() + secs(15)), secs(5));
    }

    #[test]
    fn test_advance_backwards_fails_and_changes_nothing() {
        let clock = quiet([]);
        clock.advance_by(secs(10)).unwrap();
        let t = clock.new_timer(secs(5));

        let err = clock.advance_to(epoch() + secs(9)).unwrap_err();
        assert_eq!(
            err,
            ClockError::NotATimeMachine {
                current: epoch() + secs(10),
                target: epoch() + secs(9)
            }
        );
        assert_eq!(clock.now(), epoch() + secs(10));
        assert!(t.receiver().unwrap().try_recv().is_err());
        assert!(clock.advance_by(secs(-1)).is_err());
    }

    #[test]
    fn test_advance_while_running_fails() {
        let clock = quiet([ClockOption::StartRunning]);
        assert_eq!(clock.advance_by(secs(1)), Err(ClockError::ClockIsRunning));
    }

    #[test]
    fn test_start_stop_counting() {
        let clock = quiet([]);
        assert!(!clock.is_running());
        clock.start().unwrap();
        assert!(clock.is_running());
        assert_eq!(clock.start(), Err(ClockError::ClockIsRunning));

        clock.stop();
        clock.stop();
        clock.start().unwrap();
        assert!(!clock.is_running());
        clock.start().unwrap();
        assert!(clock.is_running());
    }

    #[test]
    fn test_update_requires_running() {
        let clock = quiet([]);
        assert_eq!(clock.update(), Err(ClockError::ClockNotRunning));
    }

    #[test]
    fn test_running_clock_follows_real_time() {
        let clock = quiet([ClockOption::StartRunning]);
        let before = clock.now();
        spin_sleep::sleep(Duration::from_millis(10));
        clock.update().unwrap();
        assert!(clock.now() - before >= TimeDelta::milliseconds(10));
    }

    #[test]
    fn test_stopped_clock_is_frozen_until_restarted() {
        let clock = quiet([ClockOption::StartRunning]);
        clock.stop();
        let frozen = clock.now();
        spin_sleep::sleep(Duration::from_millis(50));
        assert_eq!(clock.now(), frozen);

        // Restarting folds in the real time elapsed since the last sync.
        clock.start().unwrap();
        assert!(clock.now() - frozen >= TimeDelta::milliseconds(50));
    }

    #[test]
    fn test_nested_stop_syncs_only_on_last_start() {
        let clock = quiet([ClockOption::StartRunning]);
        clock.stop();
        clock.stop();
        let frozen = clock.now();
        spin_sleep::sleep(Duration::from_millis(20));

        clock.start().unwrap();
        assert_eq!(clock.now(), frozen);
        clock.start().unwrap();
        assert!(clock.now() - frozen >= TimeDelta::milliseconds(20));
    }

    #[test]
    fn test_advance_by_overflow_fails() {
        let clock = quiet([]);
        let err = clock.advance_by(TimeDelta::MAX).unwrap_err();
        assert_eq!(
            err,
            ClockError::TimeOverflow {
                current: epoch(),
                delta: TimeDelta::MAX
            }
        );
        assert_eq!(clock.now(), epoch());
    }

    #[test]
    fn test_huge_timer_saturates() {
        let clock = quiet([]);
        let timer = clock.new_timer(TimeDelta::MAX);
        let next = clock.inner.next_fire(timer.mock_id().unwrap()).unwrap();
        assert!(next > epoch() + TimeDelta::days(365 * 100_000));

        clock.advance_by(TimeDelta::days(365)).unwrap();
        assert!(timer.receiver().unwrap().try_recv().is_err());
        assert!(timer.reset(TimeDelta::MAX).unwrap());
        assert!(timer.stop().unwrap());
    }

    #[test]
    #[should_panic(expected = "clock is locked")]
    fn test_reentrant_lock_panics() {
        let clock = quiet([]);
        let inner = clock.inner.clone();
        inner.read(|_| clock.now());
    }

    #[test]
    fn test_lock_marker_cleared_after_use() {
        let clock = quiet([]);
        clock.inner.read(|_| ());
        clock.inner.write(|_| ());
        // Would panic if the marker leaked.
        assert_eq!(clock.now(), epoch());
    }

    #[test]
    fn test_clones_share_state() {
        let a = quiet([]);
        let b = a.clone();
        a.advance_by(secs(3)).unwrap();
        assert_eq!(b.now(), epoch() + secs(3));
    }

    #[test]
    fn test_tick_non_positive_is_none() {
        let clock = quiet([]);
        assert!(clock.tick(TimeDelta::zero()).is_none());
        assert!(clock.tick(secs(-1)).is_none());
        assert_eq!(
            clock.new_ticker(TimeDelta::zero()).unwrap_err(),
            ClockError::NonPositiveInterval(TickableKind::Ticker)
        );
    }

    #[test]
    fn test_sleep_negative_returns_immediately() {
        let clock = quiet([]);
        clock.sleep(secs(-1));
        clock.sleep(TimeDelta::zero());
        assert_eq!(clock.now(), epoch());
    }
}
