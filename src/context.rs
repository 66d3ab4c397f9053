//! Context
//!
//! Cancellation scopes that carry a clock. A deadline context resolves
//! through a timer obtained from its carrier's clock, so under a mock clock
//! it expires only when a test advances virtual time.
//!
//! Resolution is one-way: the first of deadline, explicit cancel or parent
//! resolution wins and every later attempt is ignored.

use crate::clock::{system_clock, Clock};
use crate::done::DoneSignal;
use crate::engine::{ClockOption, MockClock};
use crate::error::{Cause, ClockError, ContextError};
use crate::ticker::Ticker;
use crate::timer::Timer;
use crate::{saturating_add, Time};
use chrono::TimeDelta;
use log::{debug, trace};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

/// A scope that may carry a clock, a deadline and a cancellation signal.
pub trait Context: Send + Sync {
    fn deadline(&self) -> Option<Time> {
        None
    }

    /// Closed once the context is resolved. `None` for contexts that can
    /// never be resolved.
    fn done(&self) -> Option<&DoneSignal> {
        None
    }

    fn err(&self) -> Option<ContextError> {
        None
    }

    fn clock(&self) -> Option<Arc<dyn Clock>> {
        None
    }
}

struct Background;

impl Context for Background {}

static BACKGROUND: Lazy<Arc<dyn Context>> = Lazy::new(|| Arc::new(Background));

/// The empty root context: no clock, no deadline, never resolved.
pub fn background() -> Arc<dyn Context> {
    BACKGROUND.clone()
}

struct ClockCarrier {
    parent: Arc<dyn Context>,
    clock: Arc<dyn Clock>,
}

impl Context for ClockCarrier {
    fn deadline(&self) -> Option<Time> {
        self.parent.deadline()
    }

    fn done(&self) -> Option<&DoneSignal> {
        self.parent.done()
    }

    fn err(&self) -> Option<ContextError> {
        self.parent.err()
    }

    fn clock(&self) -> Option<Arc<dyn Clock>> {
        Some(self.clock.clone())
    }
}

/// Attach `clock` to a child of `parent`. Fails if `parent` already
/// carries one.
pub fn with_clock(
    parent: &Arc<dyn Context>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Context>, ClockError> {
    if parent.clock().is_some() {
        return Err(ClockError::ClockAlreadyPresent);
    }
    Ok(Arc::new(ClockCarrier {
        parent: parent.clone(),
        clock,
    }))
}

/// Attach a new `MockClock` built from `options`, returning it alongside
/// the child.
pub fn with_mock_clock(
    parent: &Arc<dyn Context>,
    options: impl IntoIterator<Item = ClockOption>,
) -> Result<(Arc<dyn Context>, MockClock), ClockError> {
    let clock = MockClock::with_options(options);
    let ctx = with_clock(parent, Arc::new(clock.clone()))?;
    Ok((ctx, clock))
}

pub fn try_clock_from(ctx: &Arc<dyn Context>) -> Option<Arc<dyn Clock>> {
    ctx.clock()
}

/// The clock carried by `ctx`, or the real clock.
pub fn clock_from(ctx: &Arc<dyn Context>) -> Arc<dyn Clock> {
    ctx.clock().unwrap_or_else(system_clock)
}

struct CancelState {
    err: Option<ContextError>,
    /// The timer backing the deadline, held until resolution.
    timer: Option<Timer>,
    /// Subscription on the parent's done signal.
    parent_watch: Option<u64>,
}

struct CancelContext {
    parent: Arc<dyn Context>,
    deadline: Option<Time>,
    done: DoneSignal,
    state: Mutex<CancelState>,
}

impl CancelContext {
    fn new(parent: &Arc<dyn Context>, deadline: Option<Time>) -> Arc<Self> {
        Arc::new(Self {
            parent: parent.clone(),
            deadline,
            done: DoneSignal::new(),
            state: Mutex::new(CancelState {
                err: None,
                timer: None,
                parent_watch: None,
            }),
        })
    }

    /// Set the error if none is set yet, then release the timer, stop
    /// watching the parent and close `done`.
    fn resolve(&self, err: ContextError) {
        let (timer, watch) = {
            let mut st = self.state.lock();
            if st.err.is_some() {
                trace!("context already resolved, ignoring {}", err);
                return;
            }
            debug!("context resolved: {}", err);
            st.err = Some(err);
            (st.timer.take(), st.parent_watch.take())
        };

        if let Some(timer) = timer {
            let _ = timer.stop();
        }
        if let (Some(id), Some(done)) = (watch, self.parent.done()) {
            done.unsubscribe(id);
        }
        self.done.close();
    }

    /// Resolve with the parent's error as soon as the parent resolves.
    fn watch_parent(self: &Arc<Self>) {
        let Some(parent_done) = self.parent.done() else {
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let watch = parent_done.subscribe(move || {
            if let Some(ctx) = weak.upgrade() {
                let err = ctx.parent.err().unwrap_or(ContextError::Canceled);
                ctx.resolve(err);
            }
        });

        let Some(id) = watch else {
            return;
        };
        let mut st = self.state.lock();
        if st.err.is_none() {
            st.parent_watch = Some(id);
        } else {
            drop(st);
            parent_done.unsubscribe(id);
        }
    }
}

impl Context for CancelContext {
    fn deadline(&self) -> Option<Time> {
        self.deadline.or_else(|| self.parent.deadline())
    }

    fn done(&self) -> Option<&DoneSignal> {
        Some(&self.done)
    }

    fn err(&self) -> Option<ContextError> {
        self.state.lock().err.clone()
    }

    fn clock(&self) -> Option<Arc<dyn Clock>> {
        self.parent.clock()
    }
}

impl fmt::Debug for CancelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelContext")
            .field("deadline", &self.deadline)
            .field("err", &self.err())
            .finish()
    }
}

/// Resolves its context to `Canceled`. Cancelling a resolved context does
/// nothing.
#[derive(Clone)]
pub struct CancelHandle(Option<Arc<CancelContext>>);

impl CancelHandle {
    fn noop() -> Self {
        CancelHandle(None)
    }

    pub fn cancel(&self) {
        if let Some(ctx) = &self.0 {
            ctx.resolve(ContextError::Canceled);
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelHandle")
            .field(&self.0.as_ref().map(|c| c.deadline))
            .finish()
    }
}

/// A child that resolves when cancelled or when `parent` resolves.
pub fn with_cancel(parent: &Arc<dyn Context>) -> (Arc<dyn Context>, CancelHandle) {
    let ctx = CancelContext::new(parent, None);
    ctx.watch_parent();
    let child: Arc<dyn Context> = ctx.clone();
    (child, CancelHandle(Some(ctx)))
}

pub fn with_deadline(
    parent: &Arc<dyn Context>,
    deadline: Time,
) -> (Arc<dyn Context>, CancelHandle) {
    deadline_context(parent, deadline, None)
}

/// Like `with_deadline`, reporting `cause` alongside the deadline error.
pub fn with_deadline_cause(
    parent: &Arc<dyn Context>,
    deadline: Time,
    cause: Cause,
) -> (Arc<dyn Context>, CancelHandle) {
    deadline_context(parent, deadline, Some(cause))
}

/// A deadline `timeout` from now. Timeouts past the representable range
/// saturate, so a huge timeout never fires.
pub fn with_timeout(
    parent: &Arc<dyn Context>,
    timeout: TimeDelta,
) -> (Arc<dyn Context>, CancelHandle) {
    let deadline = saturating_add(clock_from(parent).now(), timeout);
    deadline_context(parent, deadline, None)
}

pub fn with_timeout_cause(
    parent: &Arc<dyn Context>,
    timeout: TimeDelta,
    cause: Cause,
) -> (Arc<dyn Context>, CancelHandle) {
    let deadline = saturating_add(clock_from(parent).now(), timeout);
    deadline_context(parent, deadline, Some(cause))
}

fn deadline_context(
    parent: &Arc<dyn Context>,
    deadline: Time,
    cause: Option<Cause>,
) -> (Arc<dyn Context>, CancelHandle) {
    // An earlier deadline upstream always fires first.
    if parent.deadline().is_some_and(|cur| cur < deadline) {
        return with_cancel(parent);
    }

    let clock = clock_from(parent);
    let ctx = CancelContext::new(parent, Some(deadline));

    let remaining = clock.until(deadline);
    if remaining <= TimeDelta::zero() {
        ctx.resolve(ContextError::DeadlineExceeded { cause });
        let child: Arc<dyn Context> = ctx;
        return (child, CancelHandle::noop());
    }

    ctx.watch_parent();

    let weak = Arc::downgrade(&ctx);
    let mut st = ctx.state.lock();
    if st.err.is_none() {
        st.timer = Some(clock.after_func(
            remaining,
            Box::new(move || {
                if let Some(ctx) = weak.upgrade() {
                    ctx.resolve(ContextError::DeadlineExceeded {
                        cause: cause.clone(),
                    });
                }
            }),
        ));
        trace!("deadline context armed for {}", deadline);
    }
    drop(st);

    let child: Arc<dyn Context> = ctx.clone();
    (child, CancelHandle(Some(ctx)))
}

/// Current time on the carrier's clock.
pub fn now(ctx: &Arc<dyn Context>) -> Time {
    clock_from(ctx).now()
}

pub fn after_func(
    ctx: &Arc<dyn Context>,
    d: TimeDelta,
    f: Box<dyn Fn() + Send + Sync>,
) -> Timer {
    clock_from(ctx).after_func(d, f)
}

pub fn new_timer(ctx: &Arc<dyn Context>, d: TimeDelta) -> Timer {
    clock_from(ctx).new_timer(d)
}

pub fn new_ticker(ctx: &Arc<dyn Context>, d: TimeDelta) -> Result<Ticker, ClockError> {
    clock_from(ctx).new_ticker(d)
}

pub fn tick(ctx: &Arc<dyn Context>, d: TimeDelta) -> Option<Receiver<Time>> {
    clock_from(ctx).tick(d)
}

pub fn sleep(ctx: &Arc<dyn Context>, d: TimeDelta) {
    clock_from(ctx).sleep(d)
}
