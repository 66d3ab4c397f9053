//! Timer - a one-shot tickable handle
//!
//! Obtained from `Clock::new_timer` or `Clock::after_func`. Dropping the
//! handle does not cancel an armed timer; it fires once more and is then
//! forgotten by its clock.

use crate::error::ClockError;
use crate::tickable::{Backing, TickableKind};
use crate::Time;
use chrono::TimeDelta;
use std::fmt;
use std::sync::mpsc::Receiver;

pub struct Timer {
    backing: Backing,
    rx: Option<Receiver<Time>>,
}

impl Default for Timer {
    /// An uninitialized timer; every operation on it fails.
    fn default() -> Self {
        Self {
            backing: Backing::Uninitialized,
            rx: None,
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match &self.backing {
            Backing::Uninitialized => "uninitialized".to_string(),
            Backing::Mock { id, .. } => format!("mock #{}", id),
            Backing::Real(_) => "real".to_string(),
        };
        f.debug_struct("Timer").field("backing", &backing).finish()
    }
}

impl Timer {
    pub(crate) fn new(backing: Backing, rx: Option<Receiver<Time>>) -> Self {
        Self { backing, rx }
    }

    /// Delivery channel; `None` for timers created by `after_func`.
    pub fn receiver(&self) -> Option<&Receiver<Time>> {
        self.rx.as_ref()
    }

    /// Re-arm to fire at now + `d`, firing at once when `d <= 0`.
    /// Returns whether the timer was active before the call.
    pub fn reset(&self, d: TimeDelta) -> Result<bool, ClockError> {
        match &self.backing {
            Backing::Uninitialized => Err(ClockError::ResetUninitialized(TickableKind::Timer)),
            Backing::Mock { clock, id } => clock.reset_timer(*id, d),
            Backing::Real(timer) => Ok(timer.reset(d)),
        }
    }

    /// Prevent the timer from firing. Returns whether this call stopped an
    /// active timer; `false` means it had already fired or been stopped.
    pub fn stop(&self) -> Result<bool, ClockError> {
        match &self.backing {
            Backing::Uninitialized => Err(ClockError::ResetUninitialized(TickableKind::Timer)),
            Backing::Mock { clock, id } => Ok(clock.stop_tickable(*id)),
            Backing::Real(timer) => Ok(timer.stop()),
        }
    }

    #[cfg(test)]
    pub(crate) fn mock_id(&self) -> Option<u64> {
        match &self.backing {
            Backing::Mock { id, .. } => Some(*id),
            _ => None,
        }
    }
}
