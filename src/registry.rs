//! Registry of timers and tickers
//!
//! Two disjoint lists: `active`, kept sorted by next fire time, and
//! `inactive` (stopped or expired), kept so that a tickable can be reset.
//! Ids are allocated in creation order, so ties on the fire time are broken
//! by id: simultaneous fires come out in the order the tickables were first
//! created, however often they were reset. Every operation is a linear
//! scan; a test only ever has a handful of live tickables.

use crate::error::ClockError;
use crate::tickable::{Dispatch, TickState, Tickable, TickableKind};
use crate::Time;
use log::trace;

#[derive(Default)]
pub(crate) struct Registry {
    active: Vec<Tickable>,
    inactive: Vec<Tickable>,
    next_id: u64,
    /// Entries removed since the last `take_retired`. They are dropped by
    /// the engine once its lock is released, since a callback they own may
    /// hold a handle back to the clock.
    retired: Vec<Tickable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id. Ids are never reused.
    pub fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Add a tickable to the active list.
    pub fn activate(&mut self, t: Tickable) {
        self.active.push(t);
        self.resort();
    }

    /// Move a tickable from active to inactive. Orphans are removed instead.
    pub fn deactivate(&mut self, id: u64) -> bool {
        let Some(t) = take(&mut self.active, id) else {
            return false;
        };
        trace!("tickable {} deactivated ({})", id, t.state);
        if t.orphaned {
            self.retired.push(t);
        } else {
            self.inactive.push(t);
        }
        true
    }

    /// Move a tickable from inactive back to active.
    pub fn reactivate(&mut self, id: u64) -> bool {
        let Some(t) = take(&mut self.inactive, id) else {
            return false;
        };
        trace!("tickable {} reactivated", id);
        self.activate(t);
        true
    }

    pub fn get(&self, id: u64) -> Option<&Tickable> {
        self.active
            .iter()
            .chain(self.inactive.iter())
            .find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Tickable> {
        self.active
            .iter_mut()
            .chain(self.inactive.iter_mut())
            .find(|t| t.id == id)
    }

    /// Remove a tickable from whichever list holds it.
    pub fn remove(&mut self, id: u64) -> bool {
        match take(&mut self.active, id).or_else(|| take(&mut self.inactive, id)) {
            Some(t) => {
                self.retired.push(t);
                true
            }
            None => false,
        }
    }

    /// Called when the handle to a tickable goes away. An active timer
    /// keeps its pending fire and is removed when it expires; anything else
    /// can never be reset or stopped again, so it is removed now.
    pub fn release(&mut self, id: u64) {
        let pending = self
            .get(id)
            .map(|t| t.state == TickState::Active && t.kind == TickableKind::Timer);
        match pending {
            Some(true) => {
                if let Some(t) = self.get_mut(id) {
                    t.orphaned = true;
                }
            }
            Some(false) => {
                self.remove(id);
            }
            None => {}
        }
    }

    /// Change the state of a tickable and move it to the matching list.
    pub fn enter_state(&mut self, id: u64, state: TickState) -> Result<bool, ClockError> {
        let Some(t) = self.get_mut(id) else {
            return Ok(false);
        };
        if !t.enter_state(state)? {
            return Ok(false);
        }
        match state {
            TickState::Active => self.reactivate(id),
            TickState::Expired | TickState::Stopped => self.deactivate(id),
        };
        Ok(true)
    }

    /// Fire the earliest active tickable if it is due at `target`.
    pub fn fire_due(
        &mut self,
        target: Time,
        drop_ticks: bool,
    ) -> Result<Option<Dispatch>, ClockError> {
        let id = match self.active.first() {
            Some(t) if t.is_due(target) => t.id,
            _ => return Ok(None),
        };
        self.fire(id, target, drop_ticks)
    }

    /// Fire one tickable by id. An unknown id fires nothing.
    pub fn fire(
        &mut self,
        id: u64,
        now: Time,
        drop_ticks: bool,
    ) -> Result<Option<Dispatch>, ClockError> {
        let Some(t) = self.active.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        let dispatch = t.tick(now, drop_ticks)?;
        if t.state != TickState::Active {
            self.deactivate(id);
        } else {
            self.resort();
        }
        Ok(dispatch)
    }

    /// Restore next-fire order after a next fire time changed.
    pub fn resort(&mut self) {
        self.active.sort_by_key(|t| (t.next, t.id));
    }

    pub fn take_retired(&mut self) -> Vec<Tickable> {
        std::mem::take(&mut self.retired)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn inactive_len(&self) -> usize {
        self.inactive.len()
    }
}

fn take(list: &mut Vec<Tickable>, id: u64) -> Option<Tickable> {
    let idx = list.iter().position(|t| t.id == id)?;
    Some(list.remove(idx))
}
