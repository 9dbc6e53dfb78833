//! Coalescing lock that serializes rebuilds.
//!
//! The lock has three states: free, held, and held with a pending request.
//! Any number of acquisition attempts made while the lock is held collapse into
//! a single pending flag, so the holder owes exactly one more run when it
//! releases.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{trace, warn};

/// Observable state of a [`CoalescingLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    /// Nobody holds the lock.
    #[default]
    Free,
    /// One holder is running the work; nothing has arrived since it started.
    Held,
    /// One holder is running the work and at least one attempt arrived since.
    HeldPending,
}

/// Outcome of [`CoalescingLock::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Acquire {
    /// The caller is now the exclusive holder and must do the work.
    Holder,
    /// The current holder has been told to run once more. Do nothing.
    Queued,
}

impl Acquire {
    /// `true` when the work is already queued on another holder.
    pub fn is_queued(self) -> bool {
        matches!(self, Acquire::Queued)
    }
}

/// Outcome of [`CoalescingLock::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Release {
    /// No attempt arrived during the run. The lock is free.
    Free,
    /// An attempt arrived during the run. The lock is still held and the
    /// caller must run the work again before releasing once more.
    Rerun,
}

/// Mutual exclusion with event coalescing.
///
/// Unlike a mutex, `acquire` never waits for the holder: a second caller is
/// told the work is queued and returns immediately.
#[derive(Debug, Default)]
pub struct CoalescingLock {
    state: Mutex<LockState>,
}

impl CoalescingLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&self) -> MutexGuard<'_, LockState> {
        // The critical sections below cannot panic halfway through a transition.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> LockState {
        *self.state_mut()
    }

    /// Attempts to become the holder.
    ///
    /// Free becomes held and the caller is the holder. Held (with or without a
    /// pending request) becomes held-pending and the caller is told the work
    /// is queued.
    pub fn acquire(&self) -> Acquire {
        let mut state = self.state_mut();
        let current = *state;
        let outcome = match current {
            LockState::Free => {
                *state = LockState::Held;
                Acquire::Holder
            }
            LockState::Held | LockState::HeldPending => {
                *state = LockState::HeldPending;
                Acquire::Queued
            }
        };
        trace!("acquire -> {:?} (state now {:?})", outcome, *state);
        outcome
    }

    /// Signals that the holder finished one run of the work.
    ///
    /// # Panics
    /// Panics if the lock is free. Releasing without holding is a driver bug.
    pub fn release(&self) -> Release {
        let mut state = self.state_mut();
        let current = *state;
        let outcome = match current {
            LockState::Free => {
                drop(state);
                panic!("CoalescingLock::release called while the lock is free");
            }
            LockState::Held => {
                *state = LockState::Free;
                Release::Free
            }
            LockState::HeldPending => {
                *state = LockState::Held;
                Release::Rerun
            }
        };
        trace!("release -> {:?} (state now {:?})", outcome, *state);
        outcome
    }

    /// Scoped form of [`acquire`](Self::acquire).
    ///
    /// Returns `None` when the work was queued on the current holder.
    pub fn try_enter(&self) -> Option<Turn<'_>> {
        match self.acquire() {
            Acquire::Holder => Some(Turn {
                lock: self,
                released: false,
            }),
            Acquire::Queued => None,
        }
    }

    /// Forces the lock back to free. Returns `true` if a pending run was dropped.
    fn abandon(&self) -> bool {
        let mut state = self.state_mut();
        let had_pending = *state == LockState::HeldPending;
        *state = LockState::Free;
        had_pending
    }
}

/// Exclusive right to run the work, handed out by [`CoalescingLock::try_enter`].
///
/// A turn that is dropped without [`release`](Turn::release) frees the lock.
#[must_use = "dropping a Turn frees the lock and discards any pending run"]
#[derive(Debug)]
pub struct Turn<'a> {
    lock: &'a CoalescingLock,
    released: bool,
}

impl<'a> Turn<'a> {
    /// Releases the lock after one run.
    ///
    /// Returns the turn again if a rerun is owed, `None` once the lock is free.
    pub fn release(mut self) -> Option<Turn<'a>> {
        match self.lock.release() {
            Release::Rerun => Some(self),
            Release::Free => {
                self.released = true;
                None
            }
        }
    }

    /// Frees the lock without running an owed rerun.
    ///
    /// Returns `true` if a pending run was discarded.
    pub fn discard(mut self) -> bool {
        self.released = true;
        self.lock.abandon()
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.lock.abandon() {
            warn!("Build turn dropped before release; the pending rebuild was discarded");
        } else {
            warn!("Build turn dropped before release; lock freed");
        }
    }
}
