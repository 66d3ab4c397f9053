//! Tickables - timers and tickers as seen by the engine
//!
//! A tickable is anything with a next fire time and a delivery action.
//! Timers fire once and expire; tickers re-arm themselves by their period.
//! Both are one flat type so the registry can sort and look them up
//! without caring which kind it holds.

use crate::engine::ClockInner;
use crate::error::ClockError;
use crate::system::RealTimer;
use crate::{checked_add, Time};
use chrono::TimeDelta;
use log::{trace, warn};
use std::fmt;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

/// Lifecycle state of a timer or ticker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickState {
    /// Eligible to fire.
    Active,
    /// Fired and not reset (timers only).
    Expired,
    /// Deactivated by `stop`.
    Stopped,
}

impl fmt::Display for TickState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickState::Active => write!(f, "active"),
            TickState::Expired => write!(f, "expired"),
            TickState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickableKind {
    Timer,
    Ticker,
}

impl fmt::Display for TickableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickableKind::Timer => write!(f, "Timer"),
            TickableKind::Ticker => write!(f, "Ticker"),
        }
    }
}

/// What happens when a tickable fires.
#[derive(Clone)]
pub(crate) enum Delivery {
    Channel(SyncSender<Time>),
    Callback(Arc<dyn Fn() + Send + Sync>),
}

impl Delivery {
    /// Deliver on the current thread, blocking until a channel has room.
    pub(crate) fn deliver(&self, at: Time) {
        match self {
            Delivery::Channel(tx) => {
                if tx.send(at).is_err() {
                    trace!("tick at {} not delivered: receiver dropped", at);
                }
            }
            Delivery::Callback(f) => f(),
        }
    }

    /// Deliver without blocking: a full channel drops the tick and a
    /// callback runs on its own thread. Returns false once the receiver is
    /// gone.
    pub(crate) fn offer(&self, at: Time) -> bool {
        match self {
            Delivery::Channel(tx) => match tx.try_send(at) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!("tick at {} dropped: receiver is behind", at);
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    trace!("tick at {} not delivered: receiver dropped", at);
                    false
                }
            },
            Delivery::Callback(_) => {
                Dispatch {
                    id: 0,
                    at,
                    delivery: self.clone(),
                }
                .spawn();
                true
            }
        }
    }
}

/// A delivery that has been decided under the clock lock and is carried
/// out after the lock is released.
pub(crate) struct Dispatch {
    pub id: u64,
    pub at: Time,
    delivery: Delivery,
}

impl Dispatch {
    /// Hand the delivery to a detached thread.
    pub(crate) fn spawn(self) {
        let Dispatch { id, at, delivery } = self;
        let spawned = thread::Builder::new()
            .name(format!("clock-delivery-{}", id))
            .spawn(move || delivery.deliver(at));
        if let Err(e) = spawned {
            warn!("could not spawn delivery thread for tickable {}: {}", id, e);
        }
    }
}

/// A timer or ticker owned by a clock's registry.
pub(crate) struct Tickable {
    pub id: u64,
    pub kind: TickableKind,
    pub state: TickState,
    pub next: Time,
    /// Zero for timers.
    pub period: TimeDelta,
    pub delivery: Delivery,
    /// Set once no handle refers to this tickable any more; it is removed
    /// rather than kept when it leaves the active list.
    pub orphaned: bool,
}

impl Tickable {
    pub fn timer(id: u64, next: Time, delivery: Delivery) -> Self {
        Self {
            id,
            kind: TickableKind::Timer,
            state: TickState::Active,
            next,
            period: TimeDelta::zero(),
            delivery,
            orphaned: false,
        }
    }

    pub fn ticker(id: u64, next: Time, period: TimeDelta, delivery: Delivery) -> Self {
        Self {
            id,
            kind: TickableKind::Ticker,
            state: TickState::Active,
            next,
            period,
            delivery,
            orphaned: false,
        }
    }

    /// Move to `state`. Returns whether the state changed.
    pub fn enter_state(&mut self, state: TickState) -> Result<bool, ClockError> {
        if self.state == state {
            return Ok(false);
        }
        if self.kind == TickableKind::Ticker && state == TickState::Expired {
            return Err(ClockError::InvalidTransition {
                kind: self.kind,
                state,
            });
        }
        self.state = state;
        Ok(true)
    }

    pub fn is_due(&self, now: Time) -> bool {
        self.state == TickState::Active && self.next <= now
    }

    /// Fire if due at `now`, returning the delivery to carry out.
    ///
    /// A timer expires. A ticker re-arms by its period; with `drop_ticks`
    /// it skips every boundary at or before `now` and delivers only the
    /// last of them. A ticker whose next boundary is past the representable
    /// range stops after this delivery.
    pub fn tick(&mut self, now: Time, drop_ticks: bool) -> Result<Option<Dispatch>, ClockError> {
        if !self.is_due(now) {
            return Ok(None);
        }

        let at = match self.kind {
            TickableKind::Timer => {
                self.enter_state(TickState::Expired)?;
                self.next
            }
            TickableKind::Ticker => {
                let mut at = self.next;
                loop {
                    let Some(next) = checked_add(at, self.period) else {
                        self.enter_state(TickState::Stopped)?;
                        break;
                    };
                    self.next = next;
                    if !drop_ticks || next > now {
                        break;
                    }
                    at = next;
                }
                at
            }
        };

        trace!("{} {} fired at {}", self.kind, self.id, at);
        Ok(Some(Dispatch {
            id: self.id,
            at,
            delivery: self.delivery.clone(),
        }))
    }
}

/// What a `Timer` or `Ticker` handle is attached to.
pub(crate) enum Backing {
    /// Never obtained from a clock.
    Uninitialized,
    Mock { clock: Arc<ClockInner>, id: u64 },
    Real(Arc<RealTimer>),
}

impl Drop for Backing {
    fn drop(&mut self) {
        match self {
            Backing::Uninitialized => {}
            Backing::Mock { clock, id } => clock.release(*id),
            Backing::Real(timer) => timer.release(),
        }
    }
}
