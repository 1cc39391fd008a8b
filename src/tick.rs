//! The scheduler's logical tick counter (spec §3, "History entry").
//!
//! Modeled on the teacher's `Revision` counter (`runtime.rs`'s
//! `AtomicRevision`): a monotonically increasing value that the store
//! stamps onto committed writes and flushes so that history entries and
//! recorder events can be ordered without a wall clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point in the store's logical time, incremented once per completed
/// flush.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(u64);

impl Tick {
    /// The tick before any flush has occurred.
    pub const START: Tick = Tick(0);

    /// Returns the next tick.
    pub fn next(self) -> Tick {
        Tick(self.0 + 1)
    }

    /// Returns the raw counter value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// An atomically-updated [`Tick`], shared between the scheduler and any
/// reader that needs to observe the current logical time without
/// synchronizing on the store's main lock.
#[derive(Debug, Default)]
pub struct AtomicTick(AtomicU64);

impl AtomicTick {
    /// Creates a counter starting at [`Tick::START`].
    pub fn new() -> Self {
        AtomicTick(AtomicU64::new(0))
    }

    /// Reads the current tick.
    pub fn load(&self) -> Tick {
        Tick(self.0.load(Ordering::SeqCst))
    }

    /// Advances the counter by one and returns the new tick.
    pub fn advance(&self) -> Tick {
        let prev = self.0.fetch_add(1, Ordering::SeqCst);
        Tick(prev + 1)
    }
}
