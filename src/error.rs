//! Error conditions
//!
//! Misuse of a clock is reported as a `ClockError`. Context resolution
//! values are a separate, ordinary type: `ContextError`.

use crate::tickable::{TickState, TickableKind};
use crate::Time;
use chrono::TimeDelta;
use std::error::Error;
use std::sync::Arc;
use thiserror::Error;

/// An error supplied by a caller as the underlying reason for a deadline.
pub type Cause = Arc<dyn Error + Send + Sync>;

/// Programmer errors raised by a clock, its timers and tickers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("clock already exists")]
    ClockAlreadyPresent,

    #[error("clock is running")]
    ClockIsRunning,

    #[error("clock is stopped")]
    ClockNotRunning,

    #[error("not a time machine (cannot go back from {current} to {target})")]
    NotATimeMachine { current: Time, target: Time },

    #[error("time overflow (cannot advance {current} by {delta})")]
    TimeOverflow { current: Time, delta: TimeDelta },

    #[error("reset called on uninitialized {0}")]
    ResetUninitialized(TickableKind),

    #[error("non-positive interval for {0}")]
    NonPositiveInterval(TickableKind),

    #[error("invalid state transition: {kind} cannot enter {state}")]
    InvalidTransition { kind: TickableKind, state: TickState },

    #[error("clock is locked")]
    ClockLocked,
}

/// The resolved error of a cancellable context.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded{}", cause_suffix(.cause))]
    DeadlineExceeded {
        #[source]
        cause: Option<Cause>,
    },
}

fn cause_suffix(cause: &Option<Cause>) -> String {
    match cause {
        Some(c) => format!(": {}", c),
        None => String::new(),
    }
}

impl ContextError {
    pub fn deadline_exceeded() -> Self {
        ContextError::DeadlineExceeded { cause: None }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ContextError::Canceled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, ContextError::DeadlineExceeded { .. })
    }

    /// The caller-supplied cause of a deadline, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            ContextError::DeadlineExceeded { cause } => cause.as_ref(),
            ContextError::Canceled => None,
        }
    }
}
