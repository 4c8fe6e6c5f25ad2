//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., cumulative bytes may briefly disagree with current
//! bytes). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use crate::sync::thread;

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize) as isize
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0) as usize
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one arena's counters, taken by [`current_heap_status`].
///
/// [`current_heap_status`]: crate::heap::api::current_heap_status
#[derive(Clone, Copy, Debug, Default)]
pub struct ArenaStatus {
    /// Bytes currently held from the page provider.
    pub current_bytes: usize,
    /// Cumulative bytes ever acquired (monotonic).
    pub cumulative_bytes: u64,
    /// Times a thread exhausted its spin window on this arena's lock.
    pub sleep_count: usize,
    /// High-water mark of `current_bytes` (best-effort).
    #[cfg(debug_assertions)]
    pub peak_bytes: usize,
    /// Cumulative page-provider acquire calls.
    #[cfg(debug_assertions)]
    pub acquire_calls: u64,
    /// Cumulative page-provider release calls.
    #[cfg(debug_assertions)]
    pub release_calls: u64,
    /// Total microseconds spent yielded on this arena's lock.
    #[cfg(debug_assertions)]
    pub sleep_micros: u64,
}

/// Per-arena byte and operation counters (one arena for Medium, one for
/// Large). Updated on every page-provider interaction.
pub struct Arena {
    current: Counter,
    cumulative: AtomicU64,
    sleeps: AtomicUsize,
    #[cfg(debug_assertions)]
    peak: AtomicUsize,
    #[cfg(debug_assertions)]
    acquires: AtomicU64,
    #[cfg(debug_assertions)]
    releases: AtomicU64,
    #[cfg(debug_assertions)]
    sleep_micros: AtomicU64,
}

impl Arena {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            current: Counter::new(),
            cumulative: AtomicU64::new(0),
            sleeps: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            peak: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            acquires: AtomicU64::new(0),
            #[cfg(debug_assertions)]
            releases: AtomicU64::new(0),
            #[cfg(debug_assertions)]
            sleep_micros: AtomicU64::new(0),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            current: Counter::new(),
            cumulative: AtomicU64::new(0),
            sleeps: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            peak: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            acquires: AtomicU64::new(0),
            #[cfg(debug_assertions)]
            releases: AtomicU64::new(0),
            #[cfg(debug_assertions)]
            sleep_micros: AtomicU64::new(0),
        }
    }

    pub fn on_acquire(&self, bytes: usize) {
        self.current.add(bytes);
        self.cumulative.fetch_add(bytes as u64, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        {
            self.acquires.fetch_add(1, Ordering::Relaxed);
            // Advisory peak: load-compare-store is fine because small
            // divergences under concurrent load are tolerated.
            let cur = self.current.get();
            if cur > self.peak.load(Ordering::Relaxed) {
                self.peak.store(cur, Ordering::Relaxed);
            }
        }
    }

    pub fn on_release(&self, bytes: usize) {
        self.current.sub(bytes);
        #[cfg(debug_assertions)]
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(dead_code)]
    pub fn current_bytes(&self) -> usize {
        self.current.get()
    }

    /// Spin window exhausted on this arena's lock: count it, then yield the
    /// CPU to another runnable thread.
    pub fn sleep_and_yield(&self) {
        self.sleeps.fetch_add(1, Ordering::Relaxed);
        TOTAL_SLEEPS.fetch_add(1, Ordering::Relaxed);

        #[cfg(debug_assertions)]
        {
            let start = std::time::Instant::now();
            thread::yield_now();
            self.sleep_micros
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        }
        #[cfg(not(debug_assertions))]
        thread::yield_now();
    }

    pub fn snapshot(&self) -> ArenaStatus {
        ArenaStatus {
            current_bytes: self.current.get(),
            cumulative_bytes: self.cumulative.load(Ordering::Relaxed),
            sleep_count: self.sleeps.load(Ordering::Relaxed),
            #[cfg(debug_assertions)]
            peak_bytes: self.peak.load(Ordering::Relaxed),
            #[cfg(debug_assertions)]
            acquire_calls: self.acquires.load(Ordering::Relaxed),
            #[cfg(debug_assertions)]
            release_calls: self.releases.load(Ordering::Relaxed),
            #[cfg(debug_assertions)]
            sleep_micros: self.sleep_micros.load(Ordering::Relaxed),
        }
    }
}

// Medium-pool bookkeeping arena.
crate::sync::static_atomic! {
    pub static MEDIUM_ARENA: Arena = Arena::new();
}
// Large-block bookkeeping arena.
crate::sync::static_atomic! {
    pub static LARGE_ARENA: Arena = Arena::new();
}

// Overall sleep count across every lock in the heap.
crate::sync::static_atomic! {
    pub static TOTAL_SLEEPS: AtomicUsize = AtomicUsize::new(0);
}
// Sleeps on the small-class get path, summed over all classes.
crate::sync::static_atomic! {
    pub static SMALL_GET_SLEEPS: AtomicUsize = AtomicUsize::new(0);
}
// Sleeps on the small-class free path, summed over all classes.
crate::sync::static_atomic! {
    pub static SMALL_FREE_SLEEPS: AtomicUsize = AtomicUsize::new(0);
}

/// Sleep accounting for a small size class: per-class counter plus the
/// direction-wide global, then yield.
pub(crate) fn small_sleep_and_yield(per_class: &AtomicUsize, direction: &AtomicUsize) {
    per_class.fetch_add(1, Ordering::Relaxed);
    direction.fetch_add(1, Ordering::Relaxed);
    TOTAL_SLEEPS.fetch_add(1, Ordering::Relaxed);
    thread::yield_now();
}

/// Full heap counter snapshot. Assembled by
/// [`current_heap_status`](crate::heap::api::current_heap_status); the small
/// block totals are derived by summing per-class counters on demand.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapStatus {
    pub medium: ArenaStatus,
    pub large: ArenaStatus,
    /// Sleeps across every heap lock.
    pub total_sleep_count: usize,
    /// Sleeps on small-class get paths.
    pub small_get_sleep_count: usize,
    /// Sleeps on small-class free paths.
    pub small_free_sleep_count: usize,
    /// Live small allocations across all classes and arenas.
    pub small_block_count: u64,
    /// Bytes held by live small allocations (class sizes, headers included).
    pub small_block_bytes: u64,
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative_transients() {
        let c = Counter::new();
        c.sub(10);
        assert_eq!(c.get(), 0, "negative raw value must read as zero");
        c.add(25);
        assert_eq!(c.get(), 15);
    }

    #[test]
    fn test_arena_acquire_release_cycle() {
        let arena = Arena::new();
        arena.on_acquire(4096);
        arena.on_acquire(8192);
        assert_eq!(arena.current_bytes(), 12288);

        arena.on_release(4096);
        assert_eq!(arena.current_bytes(), 8192);

        let snap = arena.snapshot();
        assert_eq!(snap.current_bytes, 8192);
        assert_eq!(snap.cumulative_bytes, 12288);
        #[cfg(debug_assertions)]
        {
            assert_eq!(snap.peak_bytes, 12288);
            assert_eq!(snap.acquire_calls, 2);
            assert_eq!(snap.release_calls, 1);
        }
    }

    #[test]
    fn test_arena_sleep_counts() {
        let arena = Arena::new();
        arena.sleep_and_yield();
        arena.sleep_and_yield();
        assert_eq!(arena.snapshot().sleep_count, 2);
    }
}
