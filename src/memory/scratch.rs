//! Scratch memory for loader bodies. Every load/unload call leases one arena for its
//! duration, so decode buffers never contend on a single global allocator lock while total
//! scratch memory stays bounded. Arenas are reset between uses, not freed: buffers keep
//! their capacity up to a retained-size ceiling.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{trace, warn};

/// A small set of recycled byte buffers handed to exactly one loader invocation at a time.
pub struct ScratchArena {
    spare: Vec<Vec<u8>>,
    retain_limit: usize,
}

impl ScratchArena {
    pub fn with_retain_limit(retain_limit: usize) -> Self {
        Self {
            spare: Vec::new(),
            retain_limit,
        }
    }

    /// Hands out a cleared buffer, reusing retained capacity when available.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        match self.spare.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::new(),
        }
    }

    /// Returns a buffer for later reuse. Capacity is kept until the next [`Self::reset`].
    pub fn recycle(&mut self, buf: Vec<u8>) {
        self.spare.push(buf);
    }

    /// Drops buffers until the retained capacity fits under the ceiling again. Buffers
    /// that survive keep their allocation.
    pub fn reset(&mut self) {
        let mut kept = 0usize;
        self.spare.retain(|buf| {
            if kept + buf.capacity() <= self.retain_limit {
                kept += buf.capacity();
                true
            } else {
                false
            }
        });
    }

    pub fn retained_bytes(&self) -> usize {
        self.spare.iter().map(|buf| buf.capacity()).sum()
    }
}

struct PoolSlots {
    free_mask: u32,
    arenas: Vec<Option<ScratchArena>>,
}

/// Fixed set of pooled arenas plus one shared overflow arena. Acquisition flips a bit in
/// the availability mask under a short lock; when every slot is taken, leases fall through
/// to the overflow arena, whose spare buffers are shared between all overflow users and
/// trimmed only once the last of them releases.
pub struct ScratchPool {
    slots: Mutex<PoolSlots>,
    overflow: Mutex<ScratchArena>,
    overflow_users: AtomicUsize,
    retain_limit: usize,
}

/// How many spare buffers an overflow lease pulls out of the shared arena up front.
const OVERFLOW_SEED_BUFFERS: usize = 2;

impl ScratchPool {
    pub fn new(arenas: usize, retain_limit: usize) -> Self {
        assert!(arenas >= 1 && arenas <= 32, "pool supports 1..=32 arenas");
        let slots = PoolSlots {
            free_mask: if arenas == 32 { u32::MAX } else { (1u32 << arenas) - 1 },
            arenas: (0..arenas)
                .map(|_| Some(ScratchArena::with_retain_limit(retain_limit)))
                .collect(),
        };
        Self {
            slots: Mutex::new(slots),
            overflow: Mutex::new(ScratchArena::with_retain_limit(retain_limit)),
            overflow_users: AtomicUsize::new(0),
            retain_limit,
        }
    }

    /// Leases an arena for one load/unload call. Never blocks on other loaders beyond the
    /// short bookkeeping sections.
    pub fn acquire(&self) -> ScratchLease<'_> {
        {
            let mut slots = self.slots.lock().expect("scratch pool slots poisoned");
            if slots.free_mask != 0 {
                let index = slots.free_mask.trailing_zeros() as usize;
                slots.free_mask &= !(1 << index);
                let arena = slots.arenas[index]
                    .take()
                    .expect("free slot bit set but arena missing");
                return ScratchLease {
                    pool: self,
                    slot: Some(index),
                    arena: Some(arena),
                };
            }
        }

        // All pooled arenas busy. Draw from the shared overflow arena instead; its spare
        // buffers migrate into the lease and back, the arena itself stays put.
        self.overflow_users.fetch_add(1, Ordering::AcqRel);
        trace!("Scratch pool exhausted, leasing from the overflow arena");
        let mut arena = ScratchArena::with_retain_limit(self.retain_limit);
        {
            let mut overflow = self.overflow.lock().expect("overflow arena poisoned");
            for _ in 0..OVERFLOW_SEED_BUFFERS {
                let buf = overflow.take_buffer();
                if buf.capacity() == 0 {
                    break;
                }
                arena.recycle(buf);
            }
        }
        ScratchLease {
            pool: self,
            slot: None,
            arena: Some(arena),
        }
    }

    /// Number of leases currently served by the overflow arena. Diagnostic only.
    pub fn overflow_in_use(&self) -> usize {
        self.overflow_users.load(Ordering::Acquire)
    }

    fn release(&self, slot: Option<usize>, mut arena: ScratchArena) {
        match slot {
            Some(index) => {
                arena.reset();
                let mut slots = self.slots.lock().expect("scratch pool slots poisoned");
                slots.arenas[index] = Some(arena);
                slots.free_mask |= 1 << index;
            }
            None => {
                let mut overflow = self.overflow.lock().expect("overflow arena poisoned");
                for buf in arena.spare.drain(..) {
                    overflow.recycle(buf);
                }
                // Trim only when the last overflow user leaves, otherwise a burst of
                // concurrent leases would throw away capacity it is about to need again.
                if self.overflow_users.fetch_sub(1, Ordering::AcqRel) == 1 {
                    overflow.reset();
                }
            }
        }
    }
}

/// Exclusive access to one arena for the duration of a single loader call.
pub struct ScratchLease<'a> {
    pool: &'a ScratchPool,
    slot: Option<usize>,
    arena: Option<ScratchArena>,
}

impl Deref for ScratchLease<'_> {
    type Target = ScratchArena;

    fn deref(&self) -> &ScratchArena {
        self.arena.as_ref().expect("lease arena already released")
    }
}

impl DerefMut for ScratchLease<'_> {
    fn deref_mut(&mut self) -> &mut ScratchArena {
        self.arena.as_mut().expect("lease arena already released")
    }
}

impl Drop for ScratchLease<'_> {
    fn drop(&mut self) {
        match self.arena.take() {
            Some(arena) => self.pool.release(self.slot, arena),
            None => warn!("Scratch lease dropped twice"),
        }
    }
}
