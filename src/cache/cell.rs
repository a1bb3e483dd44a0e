//! The per-handle state machine. One cell exists per distinct [`crate::handle::Handle`]
//! and it is never dropped before the whole cache shuts down, so everyone may keep shared
//! references to it for the manager's lifetime.
//!
//! The entire protocol lives in one atomic word. The three highest values are the
//! transition/quiescent sentinels, everything below [`MAX_REFS`] is a plain reference
//! count of a loaded resource:
//!
//! ```text
//! LOADING   = u32::MAX       exclusive, transient
//! UNLOADING = u32::MAX - 1   exclusive, transient
//! UNLOADED  = u32::MAX - 2   quiescent, unreferenced
//! MAX_REFS  = u32::MAX - 3   loaded, saturated: no further references
//! 0                          loaded, zero references
//! 1 ..< MAX_REFS             loaded, n references
//! ```
//!
//! "May I read the resource" is therefore a single unsigned comparison against the lowest
//! sentinel. Whoever wins the CAS into `LOADING`/`UNLOADING` owns the loader exclusively
//! until it commits or rolls back; everyone else either retries the CAS loop or parks on
//! the cell until the word changes.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use log::{trace, warn};

use crate::error::AssetError;
use crate::loader::{AssetLoader, LoadContext};
use crate::memory::scratch::ScratchArena;

pub(crate) const LOADING: u32 = u32::MAX;
pub(crate) const UNLOADING: u32 = u32::MAX - 1;
pub(crate) const UNLOADED: u32 = u32::MAX - 2;
pub(crate) const MAX_REFS: u32 = u32::MAX - 3;

/// Externally observable cell state at some instant. Transition states are visible here
/// for diagnostics, but only `Unloaded` and `Loaded(_)` are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Unloaded,
    Loading,
    Unloading,
    /// Loaded with the given number of outstanding references.
    Loaded(u32),
}

pub(crate) enum RefAcquire {
    Acquired,
    /// Loading, unloading or unloaded; the caller has to (wait for a) load first.
    Unavailable,
    /// At [`MAX_REFS`]. Not an error, but no further references can be handed out.
    Saturated,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LoadOutcome {
    /// This thread ran the loader body.
    Performed,
    /// Someone else already did (or is doing) the work.
    AlreadyLoaded,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UnloadOutcome {
    Performed,
    AlreadyUnloaded,
    /// References outstanding, nothing happened.
    Referenced,
}

/// Aligned so neighbouring cells never share a cache line under concurrent CAS traffic.
#[repr(align(64))]
pub struct AssetCell<L: AssetLoader> {
    state: AtomicU32,
    loader: UnsafeCell<L>,
    // Condvar rendition of a futex wait keyed on `state`: waiters park here and re-check
    // the word after every wake, wakes may be spurious.
    wait_lock: Mutex<()>,
    wake: Condvar,
}

// Safety: `loader` is only ever mutated by the single thread that won the CAS into
// `LOADING`/`UNLOADING`, and shared reads require an observed refcount state, which
// excludes both transitions. The state word carries the release/acquire edge.
unsafe impl<L: AssetLoader> Sync for AssetCell<L> {}

impl<L: AssetLoader> AssetCell<L> {
    pub(crate) fn new(loader: L) -> Self {
        Self {
            state: AtomicU32::new(UNLOADED),
            loader: UnsafeCell::new(loader),
            wait_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> CellState {
        match self.state.load(Ordering::Acquire) {
            LOADING => CellState::Loading,
            UNLOADING => CellState::Unloading,
            UNLOADED => CellState::Unloaded,
            refs => CellState::Loaded(refs),
        }
    }

    /// Drives the cell into a loaded state. Idempotent: if the resource is loaded or
    /// being loaded elsewhere this succeeds without running the loader body again. Only
    /// the thread that wins the `UNLOADED -> LOADING` transition executes the body, and a
    /// failing body always rolls the cell back to `UNLOADED`.
    pub(crate) fn load(&self, ctx: &mut LoadContext<'_>) -> Result<LoadOutcome, AssetError> {
        loop {
            match self.state.load(Ordering::Acquire) {
                UNLOADED => {
                    if self
                        .state
                        .compare_exchange(UNLOADED, LOADING, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        // Lost the race, re-evaluate from whatever the winner made of it.
                        continue;
                    }

                    let rollback = TransitionGuard {
                        cell: self,
                        fallback: UNLOADED,
                        armed: true,
                    };
                    // Safety: the CAS above made this thread the sole owner of the
                    // loading transition.
                    let loader = unsafe { &mut *self.loader.get() };
                    loader.load(ctx)?;
                    rollback.commit(0);
                    return Ok(LoadOutcome::Performed);
                }
                UNLOADING => self.wait_while(UNLOADING),
                _ => return Ok(LoadOutcome::AlreadyLoaded),
            }
        }
    }

    /// Mirror of [`Self::load`], but never fails: with references outstanding it reports
    /// [`UnloadOutcome::Referenced`] and leaves the cell alone.
    pub(crate) fn unload(&self, scratch: &mut ScratchArena) -> UnloadOutcome {
        loop {
            match self.state.load(Ordering::Acquire) {
                UNLOADED => return UnloadOutcome::AlreadyUnloaded,
                LOADING => self.wait_while(LOADING),
                UNLOADING => self.wait_while(UNLOADING),
                0 => {
                    if self
                        .state
                        .compare_exchange(0, UNLOADING, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }

                    // Safety: sole owner of the unloading transition, see above.
                    let loader = unsafe { &mut *self.loader.get() };
                    loader.unload(scratch);
                    self.finish_transition(UNLOADED);
                    return UnloadOutcome::Performed;
                }
                refs => {
                    trace!("Not unloading cell, {} references outstanding", refs);
                    return UnloadOutcome::Referenced;
                }
            }
        }
    }

    /// Takes a reference, cooperatively waiting out an in-flight load. Fails when the
    /// cell is unloaded/unloading (the caller must load first) or saturated.
    pub(crate) fn add_reference(&self) -> RefAcquire {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            match state {
                LOADING => {
                    self.wait_while(LOADING);
                    state = self.state.load(Ordering::Acquire);
                }
                UNLOADING | UNLOADED => return RefAcquire::Unavailable,
                MAX_REFS => {
                    warn!("Reference count saturated, refusing another reference");
                    return RefAcquire::Saturated;
                }
                refs => {
                    debug_assert!(refs < MAX_REFS);
                    match self.state.compare_exchange_weak(
                        refs,
                        refs + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return RefAcquire::Acquired,
                        Err(actual) => state = actual,
                    }
                }
            }
        }
    }

    /// Non-blocking variant: anything that is not a plain loaded state counts as
    /// unavailable right now. This backs the once-per-frame fast path, it must never park.
    pub(crate) fn add_reference_if_cached(&self) -> RefAcquire {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            match state {
                LOADING | UNLOADING | UNLOADED => return RefAcquire::Unavailable,
                MAX_REFS => {
                    warn!("Reference count saturated, refusing another reference");
                    return RefAcquire::Saturated;
                }
                refs => {
                    match self.state.compare_exchange_weak(
                        refs,
                        refs + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return RefAcquire::Acquired,
                        Err(actual) => state = actual,
                    }
                }
            }
        }
    }

    /// Gives a reference back. Idempotent for every state that holds none: releasing into
    /// `unloaded`, a transition, or an already zero count is a logged no-op.
    pub(crate) fn remove_reference(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            match state {
                LOADING | UNLOADING | UNLOADED | 0 => {
                    trace!("Ignoring reference removal, none outstanding");
                    return;
                }
                refs => {
                    debug_assert!(refs <= MAX_REFS);
                    match self.state.compare_exchange_weak(
                        refs,
                        refs - 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(actual) => state = actual,
                    }
                }
            }
        }
    }

    /// Read access to the loaded resource.
    ///
    /// Safety: the caller must hold one of the references counted in the state word for
    /// as long as the returned borrow lives.
    pub(crate) unsafe fn loader_ref(&self) -> &L {
        unsafe { &*self.loader.get() }
    }

    fn finish_transition(&self, new_state: u32) {
        self.state.store(new_state, Ordering::Release);
        // Taking the lock orders the store before the notify: a parked thread has either
        // re-checked the word already or sits in wait() and receives the wake.
        let _guard = self.wait_lock.lock().expect("cell wait lock poisoned");
        self.wake.notify_all();
    }

    fn wait_while(&self, observed: u32) {
        let mut guard = self.wait_lock.lock().expect("cell wait lock poisoned");
        while self.state.load(Ordering::Acquire) == observed {
            guard = self.wake.wait(guard).expect("cell wait lock poisoned");
        }
    }

    #[cfg(test)]
    fn force_state(&self, state: u32) {
        self.state.store(state, Ordering::Release);
    }
}

/// Guaranteed rollback for a claimed transition: runs unless the happy path committed.
struct TransitionGuard<'a, L: AssetLoader> {
    cell: &'a AssetCell<L>,
    fallback: u32,
    armed: bool,
}

impl<L: AssetLoader> TransitionGuard<'_, L> {
    fn commit(mut self, state: u32) {
        self.armed = false;
        self.cell.finish_transition(state);
    }
}

impl<L: AssetLoader> Drop for TransitionGuard<'_, L> {
    fn drop(&mut self) {
        if self.armed {
            self.cell.finish_transition(self.fallback);
        }
    }
}
