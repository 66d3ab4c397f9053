//! Ticker - a periodic tickable handle

use crate::error::ClockError;
use crate::tickable::{Backing, TickableKind};
use crate::Time;
use chrono::TimeDelta;
use std::fmt;
use std::sync::mpsc::Receiver;

/// Delivers the fire time on its channel once per period until stopped.
/// The channel holds one value; the clock blocks a delivery thread on a full
/// channel, the real clock drops the tick instead.
pub struct Ticker {
    backing: Backing,
    rx: Option<Receiver<Time>>,
}

impl Default for Ticker {
    fn default() -> Self {
        Self {
            backing: Backing::Uninitialized,
            rx: None,
        }
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initialized = !matches!(self.backing, Backing::Uninitialized);
        f.debug_struct("Ticker")
            .field("initialized", &initialized)
            .finish()
    }
}

impl Ticker {
    pub(crate) fn new(backing: Backing, rx: Option<Receiver<Time>>) -> Self {
        Self { backing, rx }
    }

    pub fn receiver(&self) -> Option<&Receiver<Time>> {
        self.rx.as_ref()
    }

    /// Change the period to `d` and restart counting from now.
    pub fn reset(&self, d: TimeDelta) -> Result<(), ClockError> {
        match &self.backing {
            Backing::Uninitialized => Err(ClockError::ResetUninitialized(TickableKind::Ticker)),
            _ if d <= TimeDelta::zero() => {
                Err(ClockError::NonPositiveInterval(TickableKind::Ticker))
            }
            Backing::Mock { clock, id } => clock.reset_ticker(*id, d),
            Backing::Real(timer) => {
                timer.reset_period(d);
                Ok(())
            }
        }
    }

    /// Stop ticking. Returns whether the ticker was active.
    pub fn stop(&self) -> Result<bool, ClockError> {
        match &self.backing {
            Backing::Uninitialized => Err(ClockError::ResetUninitialized(TickableKind::Ticker)),
            Backing::Mock { clock, id } => Ok(clock.stop_tickable(*id)),
            Backing::Real(timer) => Ok(timer.stop()),
        }
    }
}
