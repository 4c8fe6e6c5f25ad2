//! Allocator entry points.
//!
//! Requests dispatch by size — tiny/small up to 2,608-byte payloads, medium
//! up to the large threshold, large beyond — and frees dispatch by the flag
//! bits of the header word in front of every payload.

use super::header::{
    read_header, HEADER_SIZE, IS_FREE, IS_LARGE_OR_POOL_IN_USE, IS_MEDIUM, SIZE_MASK,
};
use super::large;
use super::medium::{self, round_medium, MAX_MEDIUM_BLOCK, MIN_MEDIUM_BLOCK};
use super::small::{self, class_for_size, CLASS_COUNT, CLASS_SIZES, DEFAULT_CLASSES, MAX_SMALL_USER};
use super::stats::{self, HeapStatus};
use super::tiny::{TINY_ARENAS, TINY_CLASS_COUNT};
use crate::sync::atomic::Ordering;
use std::ptr::NonNull;

/// Largest payload served from the medium pools.
pub(crate) const MAX_MEDIUM_USER: usize = MAX_MEDIUM_BLOCK - HEADER_SIZE;

// ---------------------------------------------------------------------------
// get / alloc-zero
// ---------------------------------------------------------------------------

/// Allocate `size` bytes. Returns null on out-of-memory or `size == 0`.
/// The returned pointer is 16-byte aligned.
pub fn get_mem(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }
    let result = if size <= MAX_SMALL_USER {
        small::small_get(class_for_size(size))
    } else if size <= MAX_MEDIUM_USER {
        medium::medium_get(size)
    } else {
        large::large_get(size)
    };
    match result {
        Some(p) => p.as_ptr(),
        None => {
            log::warn!("get_mem({size}): out of memory");
            std::ptr::null_mut()
        }
    }
}

/// As [`get_mem`], but the first `size` payload bytes are zero-filled.
/// Large blocks skip the fill: the page provider returns zeroed pages.
pub fn alloc_mem(size: usize) -> *mut u8 {
    let ptr = get_mem(size);
    if !ptr.is_null() && size <= MAX_MEDIUM_USER {
        // Safety: ptr is a fresh allocation of at least `size` bytes.
        unsafe { zero_payload(ptr, size) };
    }
    ptr
}

/// Zero `len` payload bytes with aligned 16-byte stores where available.
/// Stays strictly within `len` — a slot's neighbor begins right after the
/// payload capacity.
#[cfg(target_arch = "x86_64")]
unsafe fn zero_payload(ptr: *mut u8, len: usize) {
    use std::arch::x86_64::{__m128i, _mm_setzero_si128, _mm_store_si128};

    // Safety: allocator payloads are 16-byte aligned; bounds upheld by
    // caller.
    unsafe {
        let zero = _mm_setzero_si128();
        let chunks = len / 16;
        for i in 0..chunks {
            _mm_store_si128(ptr.add(i * 16).cast::<__m128i>(), zero);
        }
        let done = chunks * 16;
        std::ptr::write_bytes(ptr.add(done), 0, len - done);
    }
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn zero_payload(ptr: *mut u8, len: usize) {
    // Safety: bounds upheld by caller.
    unsafe { std::ptr::write_bytes(ptr, 0, len) }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// Free a block. Returns 0 on success and -1 when the header shows the block
/// is not currently live (stale or double free) — the block is not touched
/// in that case. A null pointer is a no-op returning 0.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this allocator
/// whose memory has not been returned to the OS (a freed small/medium block
/// is recognized and rejected; a pointer into unmapped memory is undefined
/// behavior, as with C `free`).
pub unsafe fn free_mem(ptr: *mut u8) -> i32 {
    if ptr.is_null() {
        return 0;
    }
    // Safety: contract — the header word precedes every live payload, and
    // freed blocks keep a readable header carrying IS_FREE.
    unsafe {
        let header = read_header(ptr);
        if header & IS_FREE != 0 {
            return -1;
        }
        if header & IS_MEDIUM != 0 {
            if header & IS_LARGE_OR_POOL_IN_USE != 0 {
                // A small-pool host block; user code never holds this.
                return -1;
            }
            #[cfg(feature = "report-leaks")]
            poison_payload(ptr);
            medium::medium_free(ptr);
        } else if header & IS_LARGE_OR_POOL_IN_USE != 0 {
            #[cfg(feature = "report-leaks")]
            poison_payload(ptr);
            large::large_free(ptr);
        } else {
            #[cfg(feature = "report-leaks")]
            poison_payload(ptr);
            small::small_free(ptr);
        }
        0
    }
}

/// Zero the first payload word so a dangling virtual-method pointer faults
/// instead of dispatching into freed memory.
#[cfg(feature = "report-leaks")]
unsafe fn poison_payload(ptr: *mut u8) {
    // Safety: every payload is at least one word.
    unsafe { ptr.cast::<usize>().write(0) }
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// Resize the allocation `*ptr` to `size` bytes, updating `*ptr` in place.
///
/// - null `*ptr`: behaves as [`get_mem`].
/// - `size == 0`: behaves as [`free_mem`]; stores null and returns `None`.
/// - on success returns the (possibly moved) payload with the first
///   `min(old, size)` bytes preserved.
/// - on out-of-memory returns `None` and leaves `*ptr` and its contents
///   untouched.
///
/// # Safety
/// `*ptr` must be null or a live pointer from this allocator, exclusively
/// owned by the caller.
pub unsafe fn realloc_mem(ptr: &mut *mut u8, size: usize) -> Option<NonNull<u8>> {
    let old = *ptr;
    if old.is_null() {
        *ptr = get_mem(size);
        return NonNull::new(*ptr);
    }
    if size == 0 {
        // Safety: old is live per contract.
        unsafe { free_mem(old) };
        *ptr = std::ptr::null_mut();
        return None;
    }

    // Safety: old is live per contract.
    let result = unsafe {
        let header = read_header(old);
        debug_assert!(header & IS_FREE == 0, "realloc of a freed block");
        if header & IS_MEDIUM != 0 {
            realloc_medium(old, header, size)
        } else if header & IS_LARGE_OR_POOL_IN_USE != 0 {
            realloc_large(old, size)
        } else {
            realloc_small(old, size)
        }
    };
    if let Some(p) = result {
        *ptr = p.as_ptr();
    }
    result
}

/// # Safety
/// `old` is a live small payload pointer owned by the caller.
unsafe fn realloc_small(old: *mut u8, size: usize) -> Option<NonNull<u8>> {
    // Safety: upheld by caller.
    unsafe {
        let avail = small::small_mem_size(old);
        if size <= avail {
            if size >= avail / 4 {
                return Some(NonNull::new_unchecked(old));
            }
            // Deep shrink: move to a right-sized class. Tolerate OOM by
            // keeping the oversized block — the data still fits.
            let new_ptr = get_mem(size);
            let Some(new_ptr) = NonNull::new(new_ptr) else {
                return Some(NonNull::new_unchecked(old));
            };
            std::ptr::copy_nonoverlapping(old, new_ptr.as_ptr(), size);
            small::small_free(old);
            return Some(new_ptr);
        }

        // Upsize: grow to whatever class accommodates double plus change, so
        // a doubling-realloc loop settles into O(log n) moves.
        let target = size.max(avail * 2 + 32);
        let new_ptr = NonNull::new(get_mem(target))?;
        std::ptr::copy_nonoverlapping(old, new_ptr.as_ptr(), avail);
        small::small_free(old);
        Some(new_ptr)
    }
}

/// # Safety
/// `old` is a live medium payload pointer owned by the caller; `header` is
/// its header word.
unsafe fn realloc_medium(old: *mut u8, header: usize, size: usize) -> Option<NonNull<u8>> {
    // Safety: upheld by caller.
    unsafe {
        let block = old.sub(HEADER_SIZE);
        let cur = header & SIZE_MASK;
        let avail = cur - HEADER_SIZE;

        if size <= avail {
            // In-place downsize when the surplus can stand alone as a block.
            let needed = round_medium(size + HEADER_SIZE);
            if cur - needed >= MIN_MEDIUM_BLOCK {
                medium::lock().shrink_in_place(block, needed);
            }
            return Some(NonNull::new_unchecked(old));
        }

        if size <= MAX_MEDIUM_USER {
            // Upsize into an adjacent free neighbor when possible.
            let needed = round_medium(size + HEADER_SIZE);
            if medium::lock().try_grow_in_place(block, needed).is_some() {
                return Some(NonNull::new_unchecked(old));
            }
        }

        // Copy growth of at least 25%.
        let target = size.max(avail + avail / 4);
        let new_ptr = NonNull::new(get_mem(target))?;
        std::ptr::copy_nonoverlapping(old, new_ptr.as_ptr(), avail);
        medium::medium_free(old);
        Some(new_ptr)
    }
}

/// # Safety
/// `old` is a live large payload pointer owned by the caller.
unsafe fn realloc_large(old: *mut u8, size: usize) -> Option<NonNull<u8>> {
    // Safety: upheld by caller.
    unsafe {
        let avail = large::large_mem_size(old);

        if size <= avail {
            if size >= avail / 2 {
                // Keep the block unless more than half of it would idle.
                large::large_set_user_size(old, size);
                return Some(NonNull::new_unchecked(old));
            }
            // Deep shrink: move to a right-sized block (possibly out of the
            // large range entirely). Only the surviving bytes move.
            let Some(new_ptr) = NonNull::new(get_mem(size)) else {
                large::large_set_user_size(old, size);
                return Some(NonNull::new_unchecked(old));
            };
            large::copy_non_temporal(new_ptr.as_ptr(), old, size);
            large::large_free(old);
            return Some(new_ptr);
        }

        // Growth padding: an eighth beyond 128 MiB, a quarter below.
        let growth = if avail > 128 * 1024 * 1024 {
            avail / 8
        } else {
            avail / 4
        };
        let target = size.max(avail + growth);

        if let Some(new_ptr) = large::large_try_remap(old, target) {
            large::large_set_user_size(new_ptr.as_ptr(), size);
            return Some(new_ptr);
        }

        // Copy fallback with cache-bypassing stores.
        let new_ptr = large::large_get(target)?;
        large::copy_non_temporal(new_ptr.as_ptr(), old, avail);
        large::large_set_user_size(new_ptr.as_ptr(), size);
        large::large_free(old);
        Some(new_ptr)
    }
}

// ---------------------------------------------------------------------------
// mem_size
// ---------------------------------------------------------------------------

/// True payload capacity of a live block (at least the requested size).
///
/// # Safety
/// `ptr` must be null (returns 0) or a live pointer from this allocator.
pub unsafe fn mem_size(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    // Safety: upheld by caller.
    unsafe {
        let header = read_header(ptr);
        debug_assert!(header & IS_FREE == 0, "mem_size of a freed block");
        if header & IS_MEDIUM != 0 {
            (header & SIZE_MASK) - HEADER_SIZE
        } else if header & IS_LARGE_OR_POOL_IN_USE != 0 {
            large::large_mem_size(ptr)
        } else {
            small::small_mem_size(ptr)
        }
    }
}

// ---------------------------------------------------------------------------
// diagnostics
// ---------------------------------------------------------------------------

/// Sum a class's counters across the default arena and every tiny replica.
fn class_totals(idx: usize) -> (u64, u64) {
    let rt = &DEFAULT_CLASSES[idx];
    let mut gets = rt.gets.load(Ordering::Relaxed);
    let mut frees = rt.frees.load(Ordering::Relaxed);
    if idx < TINY_CLASS_COUNT {
        for arena in TINY_ARENAS.iter() {
            gets += arena[idx].gets.load(Ordering::Relaxed);
            frees += arena[idx].frees.load(Ordering::Relaxed);
        }
    }
    (gets, frees)
}

fn class_sleeps(idx: usize) -> (usize, usize) {
    let rt = &DEFAULT_CLASSES[idx];
    let mut get_sleeps = rt.get_sleeps.load(Ordering::Relaxed);
    let mut free_sleeps = rt.free_sleeps.load(Ordering::Relaxed);
    if idx < TINY_CLASS_COUNT {
        for arena in TINY_ARENAS.iter() {
            get_sleeps += arena[idx].get_sleeps.load(Ordering::Relaxed);
            free_sleeps += arena[idx].free_sleeps.load(Ordering::Relaxed);
        }
    }
    (get_sleeps, free_sleeps)
}

/// Snapshot every heap counter. Lock-free; cross-counter values may be
/// transiently inconsistent under concurrent load.
pub fn current_heap_status() -> HeapStatus {
    let mut small_count = 0u64;
    let mut small_bytes = 0u64;
    for idx in 0..CLASS_COUNT {
        let (gets, frees) = class_totals(idx);
        let live = gets.saturating_sub(frees);
        small_count += live;
        small_bytes += live * CLASS_SIZES[idx] as u64;
    }

    HeapStatus {
        medium: stats::MEDIUM_ARENA.snapshot(),
        large: stats::LARGE_ARENA.snapshot(),
        total_sleep_count: stats::TOTAL_SLEEPS.load(Ordering::Relaxed),
        small_get_sleep_count: stats::SMALL_GET_SLEEPS.load(Ordering::Relaxed),
        small_free_sleep_count: stats::SMALL_FREE_SLEEPS.load(Ordering::Relaxed),
        small_block_count: small_count,
        small_block_bytes: small_bytes,
    }
}

/// Sort column for [`small_block_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmallBlockOrder {
    TotalAllocations,
    LiveAllocations,
    ClassSize,
}

/// One row of [`small_block_status`].
#[derive(Clone, Copy, Debug)]
pub struct SmallBlockUsage {
    pub total_allocations: u64,
    pub live_allocations: u64,
    /// Slot size of the class, header included.
    pub class_size: u32,
}

/// Usage of each size class with a non-zero allocation count, sorted
/// descending by the chosen column, truncated to `max` rows.
pub fn small_block_status(max: usize, order_by: SmallBlockOrder) -> Vec<SmallBlockUsage> {
    let mut rows = Vec::new();
    for idx in 0..CLASS_COUNT {
        let (gets, frees) = class_totals(idx);
        if gets == 0 {
            continue;
        }
        rows.push(SmallBlockUsage {
            total_allocations: gets,
            live_allocations: gets.saturating_sub(frees),
            class_size: CLASS_SIZES[idx],
        });
    }
    rows.sort_by(|a, b| match order_by {
        SmallBlockOrder::TotalAllocations => b.total_allocations.cmp(&a.total_allocations),
        SmallBlockOrder::LiveAllocations => b.live_allocations.cmp(&a.live_allocations),
        SmallBlockOrder::ClassSize => b.class_size.cmp(&a.class_size),
    });
    rows.truncate(max);
    rows
}

/// One row of [`small_block_contention`]: a (class, direction) pair. Exactly
/// one of the class-size columns is non-zero, naming the direction.
#[derive(Clone, Copy, Debug)]
pub struct SmallBlockContention {
    pub sleep_count: usize,
    /// Class size when this row counts get-path sleeps, else 0.
    pub get_class_size: u32,
    /// Class size when this row counts free-path sleeps, else 0.
    pub free_class_size: u32,
}

/// Per-(class, direction) sleep counts, descending, truncated to `max` rows.
/// Classes that never slept are omitted.
pub fn small_block_contention(max: usize) -> Vec<SmallBlockContention> {
    let mut rows = Vec::new();
    for idx in 0..CLASS_COUNT {
        let (get_sleeps, free_sleeps) = class_sleeps(idx);
        if get_sleeps > 0 {
            rows.push(SmallBlockContention {
                sleep_count: get_sleeps,
                get_class_size: CLASS_SIZES[idx],
                free_class_size: 0,
            });
        }
        if free_sleeps > 0 {
            rows.push(SmallBlockContention {
                sleep_count: free_sleeps,
                get_class_size: 0,
                free_class_size: CLASS_SIZES[idx],
            });
        }
    }
    rows.sort_by(|a, b| b.sleep_count.cmp(&a.sleep_count));
    rows.truncate(max);
    rows
}

/// One row of [`leak_summary`].
#[cfg(feature = "report-leaks")]
#[derive(Clone, Copy, Debug)]
pub struct LeakRecord {
    /// Slot size of the class, header included.
    pub class_size: u32,
    pub live_allocations: u64,
}

/// Classes still holding live allocations, largest live count first. Meant
/// for an end-of-run report once the program believes everything is freed.
#[cfg(feature = "report-leaks")]
pub fn leak_summary() -> Vec<LeakRecord> {
    let mut rows = Vec::new();
    for idx in 0..CLASS_COUNT {
        let (gets, frees) = class_totals(idx);
        let live = gets.saturating_sub(frees);
        if live > 0 {
            rows.push(LeakRecord {
                class_size: CLASS_SIZES[idx],
                live_allocations: live,
            });
        }
    }
    rows.sort_by(|a, b| b.live_allocations.cmp(&a.live_allocations));
    rows
}

// ---------------------------------------------------------------------------
// runtime hook
// ---------------------------------------------------------------------------

/// `GlobalAlloc` adapter. Nothing is installed implicitly — opting in is the
/// user's `#[global_allocator] static A: ScaleAlloc = ScaleAlloc;`.
///
/// Alignments above 16 are not supported (alignment beyond the block-size
/// granularity is out of scope) and make `alloc` return null.
pub struct ScaleAlloc;

// Safety: get_mem/free_mem/realloc_mem satisfy the GlobalAlloc contract for
// layouts with align <= 16; larger alignments are refused with null.
unsafe impl std::alloc::GlobalAlloc for ScaleAlloc {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        if layout.align() > 16 {
            return std::ptr::null_mut();
        }
        get_mem(layout.size().max(1))
    }

    unsafe fn alloc_zeroed(&self, layout: std::alloc::Layout) -> *mut u8 {
        if layout.align() > 16 {
            return std::ptr::null_mut();
        }
        alloc_mem(layout.size().max(1))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        // Safety: GlobalAlloc contract — ptr came from this allocator.
        unsafe { free_mem(ptr) };
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        _layout: std::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        let mut p = ptr;
        // Safety: GlobalAlloc contract — ptr came from this allocator and
        // new_size is non-zero.
        match unsafe { realloc_mem(&mut p, new_size) } {
            Some(nn) => nn.as_ptr(),
            None => std::ptr::null_mut(),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_get_mem_zero_returns_null() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        assert!(get_mem(0).is_null());
    }

    #[test]
    fn test_free_null_is_noop() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        assert_eq!(unsafe { free_mem(std::ptr::null_mut()) }, 0);
    }

    #[test]
    fn test_round_trip_law() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        for &size in &[1usize, 7, 16, 32, 100, 2608, 2609, 50_000, MAX_MEDIUM_USER, 300_000] {
            let p = get_mem(size);
            assert!(!p.is_null(), "get_mem({size}) failed");
            assert_eq!(p as usize % 16, 0, "alignment violated for {size}");
            // Safety: Test code.
            unsafe {
                assert!(mem_size(p) >= size, "mem_size below request for {size}");
                assert_eq!(free_mem(p), 0);
            }
        }
    }

    #[test]
    fn test_double_free_detected() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        // Freed small and medium blocks keep a readable IS_FREE header as
        // long as their pool stays mapped; the anchor pins the pool.
        for &size in &[48usize, 10_000] {
            let p = get_mem(size);
            let anchor = get_mem(size);
            // Safety: Test code.
            unsafe {
                assert_eq!(free_mem(p), 0);
                assert_eq!(free_mem(p), -1, "double free must report -1 for size {size}");
                assert_eq!(free_mem(anchor), 0);
            }
        }
    }

    #[test]
    fn test_alloc_mem_zeroes() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        for &size in &[1usize, 33, 500, 10_000, 300_000] {
            // Dirty a block first so recycled memory is non-zero.
            let dirty = get_mem(size);
            // Safety: Test code.
            unsafe {
                std::ptr::write_bytes(dirty, 0xDD, size);
                free_mem(dirty);

                let p = alloc_mem(size);
                assert!(!p.is_null());
                let payload = std::slice::from_raw_parts(p, size);
                assert!(
                    payload.iter().all(|&b| b == 0),
                    "alloc_mem({size}) returned non-zero bytes"
                );
                free_mem(p);
            }
        }
    }

    #[test]
    fn test_size_class_boundary() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let small = get_mem(2608);
        let medium = get_mem(2609);
        // Safety: Test code.
        unsafe {
            // The small block's capacity is its class size minus the header.
            assert_eq!(mem_size(small), 2624 - HEADER_SIZE);
            // The medium block's capacity reflects medium rounding.
            let medium_cap = mem_size(medium);
            assert!(medium_cap >= 2609);
            assert_eq!(read_header(medium) & IS_MEDIUM, IS_MEDIUM);
            assert_eq!(read_header(small) & (IS_MEDIUM | IS_LARGE_OR_POOL_IN_USE), 0);

            free_mem(small);
            free_mem(medium);
        }
    }

    #[test]
    fn test_realloc_identity_law() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        // Cross every manager boundary: small -> medium -> large and back.
        let sizes = [100usize, 2_000, 40_000, 300_000, 40_000, 100];
        let mut p = get_mem(64);
        // Safety: Test code.
        unsafe {
            for i in 0..64 {
                *p.add(i) = (i % 251) as u8;
            }
            let mut old_size = 64usize;
            for &size in &sizes {
                let kept = old_size.min(size);
                let r = realloc_mem(&mut p, size);
                assert!(r.is_some(), "realloc to {size} failed");
                for i in 0..kept.min(64) {
                    assert_eq!(*p.add(i), (i % 251) as u8, "byte {i} lost at size {size}");
                }
                old_size = size;
            }
            realloc_mem(&mut p, 0);
            assert!(p.is_null());
        }
    }

    #[test]
    fn test_realloc_null_acts_as_get() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let mut p: *mut u8 = std::ptr::null_mut();
        // Safety: Test code.
        unsafe {
            let r = realloc_mem(&mut p, 1234);
            assert!(r.is_some());
            assert!(!p.is_null());
            assert!(mem_size(p) >= 1234);
            free_mem(p);
        }
    }

    #[test]
    fn test_large_shrink_keeps_block() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let mut p = get_mem(10_000_000);
        let original = p;
        // Safety: Test code.
        unsafe {
            *p = 0x77;
            // Less than half dropped: same mapping.
            let r = realloc_mem(&mut p, 9_000_000);
            assert!(r.is_some());
            assert_eq!(p, original, "shrink below 50% must not move the block");
            assert_eq!(*p, 0x77);
            assert!(mem_size(p) >= 9_000_000);
            free_mem(p);
        }
    }

    #[test]
    fn test_large_deep_shrink_preserves_payload() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let large_before = stats::LARGE_ARENA.current_bytes();

        let mut p = get_mem(10_000_000);
        // Safety: Test code.
        unsafe {
            for i in (0..4_000_000usize).step_by(4096) {
                *p.add(i) = (i % 200) as u8;
            }
            // More than half dropped: the allocator may move the block.
            let r = realloc_mem(&mut p, 4_000_000);
            assert!(r.is_some());
            for i in (0..4_000_000usize).step_by(4096) {
                assert_eq!(*p.add(i), (i % 200) as u8);
            }
            free_mem(p);
        }
        assert_eq!(stats::LARGE_ARENA.current_bytes(), large_before);
    }

    #[test]
    fn test_small_realloc_grows_generously() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let mut p = get_mem(100);
        // Safety: Test code.
        unsafe {
            let before = mem_size(p);
            let r = realloc_mem(&mut p, before + 1);
            assert!(r.is_some());
            // Growth lands in a class covering at least double plus change.
            assert!(mem_size(p) >= before * 2 + 32 - HEADER_SIZE);
            free_mem(p);
        }
    }

    #[test]
    fn test_status_counts_live_small_blocks() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let before = current_heap_status();
        let ptrs: Vec<*mut u8> = (0..10).map(|_| get_mem(32)).collect();
        let during = current_heap_status();
        assert!(during.small_block_count >= before.small_block_count + 10);

        // Safety: Test code.
        unsafe {
            for p in ptrs {
                free_mem(p);
            }
        }
        let after = current_heap_status();
        assert_eq!(after.small_block_count, before.small_block_count);
        assert_eq!(after.small_block_bytes, before.small_block_bytes);
    }

    #[test]
    fn test_small_block_status_ordering() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        // Generate traffic in a distinctive class.
        let ptrs: Vec<*mut u8> = (0..50).map(|_| get_mem(2000)).collect();

        let rows = small_block_status(usize::MAX, SmallBlockOrder::TotalAllocations);
        assert!(!rows.is_empty());
        for w in rows.windows(2) {
            assert!(w[0].total_allocations >= w[1].total_allocations);
        }
        assert!(rows.iter().any(|r| r.class_size == 2032));

        let rows = small_block_status(3, SmallBlockOrder::ClassSize);
        assert!(rows.len() <= 3);
        for w in rows.windows(2) {
            assert!(w[0].class_size >= w[1].class_size);
        }

        // Safety: Test code.
        unsafe {
            for p in ptrs {
                free_mem(p);
            }
        }
    }

    #[test]
    fn test_small_block_contention_shape() {
        let _guard = crate::heap::TEST_MUTEX.read().unwrap();
        for row in small_block_contention(usize::MAX) {
            assert!(row.sleep_count > 0);
            assert!((row.get_class_size == 0) != (row.free_class_size == 0));
        }
    }

    #[test]
    fn test_global_alloc_adapter() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        use std::alloc::{GlobalAlloc, Layout};

        let a = ScaleAlloc;
        // Safety: Test code.
        unsafe {
            let layout = Layout::from_size_align(100, 16).unwrap();
            let p = a.alloc(layout);
            assert!(!p.is_null());
            let p = a.realloc(p, layout, 5000);
            assert!(!p.is_null());
            a.dealloc(p, Layout::from_size_align(5000, 16).unwrap());

            let z = a.alloc_zeroed(layout);
            assert!(std::slice::from_raw_parts(z, 100).iter().all(|&b| b == 0));
            a.dealloc(z, layout);

            // Over-aligned layouts are refused.
            let over = Layout::from_size_align(64, 64).unwrap();
            assert!(a.alloc(over).is_null());
        }
    }
}
