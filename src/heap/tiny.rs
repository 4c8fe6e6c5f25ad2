//! Tiny block front-end.
//!
//! The smallest size classes are replicated into several arenas. A
//! process-wide counter advances once per allocation and picks the starting
//! arena; the allocator probes that arena's class with a non-blocking lock
//! attempt, walks the remaining arenas on failure, and finally falls back to
//! the default class arena (blocking). Quasi-fair spreading for the cost of
//! one atomic increment on the fast path.
//!
//! Frees need no arena logic: the block header points at the owning pool,
//! which points at its replica.

use super::small::{self, SizeClassRt};
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

/// Classes covered by the fan-out: payloads up to 128 B (8 classes), or
/// 256 B (16 classes) in the boosted configurations.
#[cfg(not(feature = "boost"))]
pub(crate) const TINY_CLASS_COUNT: usize = 8;
#[cfg(feature = "boost")]
pub(crate) const TINY_CLASS_COUNT: usize = 16;

/// Arena replication factor (power of two so the modulo is a mask).
#[cfg(not(feature = "boost"))]
pub(crate) const TINY_ARENA_COUNT: usize = 8;
#[cfg(all(feature = "boost", not(feature = "booster")))]
pub(crate) const TINY_ARENA_COUNT: usize = 16;
#[cfg(feature = "booster")]
pub(crate) const TINY_ARENA_COUNT: usize = 32;

const _: () = assert!(TINY_ARENA_COUNT.is_power_of_two());

const ARENA_INIT: [SizeClassRt; TINY_CLASS_COUNT] = [SizeClassRt::NEW; TINY_CLASS_COUNT];

/// The replicated tiny arenas.
pub(crate) static TINY_ARENAS: [[SizeClassRt; TINY_CLASS_COUNT]; TINY_ARENA_COUNT] =
    [ARENA_INIT; TINY_ARENA_COUNT];

// Round-robin arena selector, advanced once per tiny allocation.
crate::sync::static_atomic! {
    static TINY_CURRENT_ARENA: AtomicUsize = AtomicUsize::new(0);
}

/// Allocate a tiny block of class `idx`.
pub(crate) fn tiny_get(idx: usize) -> Option<NonNull<u8>> {
    debug_assert!(idx < TINY_CLASS_COUNT);

    let start = TINY_CURRENT_ARENA.fetch_add(1, Ordering::Relaxed);
    for probe in 0..TINY_ARENA_COUNT {
        let arena = (start + probe) & (TINY_ARENA_COUNT - 1);
        if let Some(result) = small::try_get(&TINY_ARENAS[arena][idx], idx) {
            return result;
        }
    }

    // Every arena lock was busy: fall through to the default class arena,
    // which blocks (and yields) until it succeeds.
    small::blocking_get(idx)
}
