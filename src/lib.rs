//! Rust Mock Clock
//!
//! A deterministic, controllable substitute for wall-clock time, for testing
//! time-dependent concurrent code without real delay:
//! - Virtual clock: advance by arbitrary amounts and observe exactly which
//!   timers and tickers fire, in next-fire order
//! - Running mode that follows real elapsed time lazily
//! - Optional tick dropping for periodic tickers
//! - Cancellable and deadline contexts driven by the carried clock
//! - A real-clock implementation of the same `Clock` capability

pub mod clock;
pub mod context;
pub mod done;
pub mod engine;
pub mod error;
mod registry;
pub mod system;
pub mod tickable;
pub mod ticker;
pub mod timer;


use chrono::{DateTime, FixedOffset, TimeDelta, Utc};

/// A point in time with the offset it is reported in.
pub type Time = DateTime<FixedOffset>;

/// The offset a clock reports its times in.
pub type Location = FixedOffset;

/// 1970-01-01T00:00:00Z, where a `MockClock` starts by default.
pub fn epoch() -> Time {
    DateTime::<Utc>::UNIX_EPOCH.fixed_offset()
}

// Kept two days inside chrono's range so any offset can still be applied.
fn far_future() -> Time {
    (DateTime::<Utc>::MAX_UTC - TimeDelta::days(2)).fixed_offset()
}

fn far_past() -> Time {
    (DateTime::<Utc>::MIN_UTC + TimeDelta::days(2)).fixed_offset()
}

/// `t + d`, saturating at the ends of the representable range.
pub(crate) fn saturating_add(t: Time, d: TimeDelta) -> Time {
    match t.checked_add_signed(d) {
        Some(sum) if sum >= far_past() && sum <= far_future() => sum,
        _ if d > TimeDelta::zero() => far_future().with_timezone(t.offset()),
        _ => far_past().with_timezone(t.offset()),
    }
}

/// `t + d`, or `None` past the representable range.
pub(crate) fn checked_add(t: Time, d: TimeDelta) -> Option<Time> {
    t.checked_add_signed(d)
        .filter(|sum| *sum >= far_past() && *sum <= far_future())
}

pub use clock::{system_clock, Clock};
pub use context::{
    background, clock_from, try_clock_from, with_clock, with_mock_clock, CancelHandle, Context,
};
pub use done::DoneSignal;
pub use engine::{ClockOption, MockClock};
pub use error::{Cause, ClockError, ContextError};
pub use system::SystemClock;
pub use tickable::{TickState, TickableKind};
pub use ticker::Ticker;
pub use timer::Timer;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_add_clamps() {
        assert_eq!(saturating_add(epoch(), TimeDelta::MAX), far_future());
        assert_eq!(saturating_add(epoch(), TimeDelta::MIN), far_past());
        assert_eq!(
            saturating_add(epoch(), TimeDelta::seconds(1)),
            epoch() + TimeDelta::seconds(1)
        );
    }

    #[test]
    fn test_checked_add_rejects_overflow() {
        assert!(checked_add(epoch(), TimeDelta::MAX).is_none());
        assert!(checked_add(far_future(), TimeDelta::milliseconds(1)).is_none());
        assert_eq!(checked_add(epoch(), TimeDelta::zero()), Some(epoch()));
    }
}
