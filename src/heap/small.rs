//! Small block manager.
//!
//! 46 fixed size classes from 16 to 2,624 bytes (slot sizes, header
//! included). Each class owns a spin lock, a list of partially-free pools,
//! and a sequential-feed cursor into its newest pool. Pools are equal-size
//! slot arrays hosted inside medium blocks; the free slots of a pool form a
//! singly-linked list threaded through the slot headers themselves.

use super::header::{read_at, write_at, HEADER_SIZE, IS_FREE};
use super::lock::{SpinLock, SPIN_SMALL_FREE, SPIN_SMALL_GET};
use super::medium::{self, bin_index, round_medium, MIN_MEDIUM_BLOCK};
use super::stats;
use super::tiny;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;
use std::ptr::NonNull;

pub(crate) const CLASS_COUNT: usize = 46;

/// Largest payload served by a size class. One byte more goes to the medium
/// manager.
pub(crate) const MAX_SMALL_USER: usize = 2608;

/// Slot sizes, header included. 16-byte granular below 256 bytes, then a
/// roughly 8% geometric progression up to the top class.
pub(crate) const CLASS_SIZES: [u32; CLASS_COUNT] = [
    16, 32, 48, 64, 80, 96, 112, 128, //
    144, 160, 176, 192, 208, 224, 240, 256, //
    272, 288, 304, 320, 336, 352, 384, 416, //
    448, 480, 528, 576, 624, 672, 736, 800, //
    864, 944, 1024, 1120, 1216, 1328, 1440, 1568, //
    1712, 1856, 2032, 2208, 2400, 2624,
];

/// Medium block header plus the in-band pool header; slots start past both.
pub(crate) const SMALL_POOL_OVERHEAD: usize = HEADER_SIZE + SMALL_POOL_HEADER_SIZE;
pub(crate) const SMALL_POOL_HEADER_SIZE: usize = 56;

const SMALL_POOL_SIGNATURE: u32 = 0x534D_504C;

/// Per-class compile-time configuration.
#[derive(Clone, Copy)]
pub(crate) struct ClassConfig {
    pub block_size: u32,
    /// Smallest acceptable backing medium block (rounded).
    pub min_pool_size: u32,
    /// Preferred backing medium block (rounded).
    pub optimal_pool_size: u32,
    /// Bin groups this class may draw pools from, so small pools never
    /// starve large medium requests.
    pub allowed_groups: u32,
}

const fn allowed_groups_for(optimal_pool: usize) -> u32 {
    // Admit groups whose smallest bin stays within twice the optimal pool
    // size; the sequential feed covers everything beyond that.
    let limit = optimal_pool * 2;
    let idx = if limit <= MIN_MEDIUM_BLOCK {
        0
    } else {
        bin_index(limit)
    };
    let g = idx / 32;
    if g >= 31 {
        u32::MAX
    } else {
        (1u32 << (g + 1)) - 1
    }
}

const fn build_class_config() -> [ClassConfig; CLASS_COUNT] {
    let mut out = [ClassConfig {
        block_size: 0,
        min_pool_size: 0,
        optimal_pool_size: 0,
        allowed_groups: 0,
    }; CLASS_COUNT];
    let mut i = 0;
    while i < CLASS_COUNT {
        let c = CLASS_SIZES[i] as usize;
        // At least four slots per pool; optimally around 64 KiB of slots.
        let mut blocks = 65536 / c;
        if blocks < 8 {
            blocks = 8;
        }
        if blocks > 2048 {
            blocks = 2048;
        }
        let min = round_medium(SMALL_POOL_OVERHEAD + 4 * c);
        let optimal = round_medium(SMALL_POOL_OVERHEAD + blocks * c);
        out[i] = ClassConfig {
            block_size: c as u32,
            min_pool_size: min as u32,
            optimal_pool_size: optimal as u32,
            allowed_groups: allowed_groups_for(optimal),
        };
        i += 1;
    }
    out
}

pub(crate) static CLASS_CONFIG: [ClassConfig; CLASS_COUNT] = build_class_config();

// Lookup table routing a needed slot size (payload + header) to the smallest
// class that fits, indexed by (needed - 1) / 16. Built once at compile time.
const LUT_SIZE: usize = (MAX_SMALL_USER + HEADER_SIZE - 1) / 16 + 1;

static SMALL_CLASS_LUT: [u8; LUT_SIZE] = build_small_class_lut();

const fn build_small_class_lut() -> [u8; LUT_SIZE] {
    let mut table = [0u8; LUT_SIZE];
    let mut q = 0;
    while q < LUT_SIZE {
        // Largest slot size falling into this 16-byte bucket.
        let needed = (q + 1) * 16;
        let mut sc = 0;
        while (CLASS_SIZES[sc] as usize) < needed {
            sc += 1;
        }
        table[q] = sc as u8;
        q += 1;
    }
    table
}

/// Class index serving a user payload of `size` bytes.
#[inline]
pub(crate) fn class_for_size(size: usize) -> usize {
    debug_assert!(size >= 1 && size <= MAX_SMALL_USER);
    SMALL_CLASS_LUT[(size + HEADER_SIZE - 1) >> 4] as usize
}

// ---------------------------------------------------------------------------
// pool layout
// ---------------------------------------------------------------------------

/// In-band header of a small-block pool, stored at the start of the hosting
/// medium block's payload. Slots follow immediately after.
#[repr(C)]
pub(crate) struct SmallPool {
    /// Owning size class (possibly a tiny-arena replica).
    owner: *const SizeClassRt,
    /// Links in the owner's partially-free pool list.
    prev: *mut SmallPool,
    next: *mut SmallPool,
    /// Head of the free-slot list threaded through slot headers.
    first_free: *mut u8,
    /// Header address of the hosting medium block.
    medium_block: *mut u8,
    blocks_in_use: u32,
    capacity: u32,
    block_size: u32,
    signature: u32,
}

const _: () = assert!(std::mem::size_of::<SmallPool>() == SMALL_POOL_HEADER_SIZE);

/// Mutable per-class state, guarded by the class lock.
pub(crate) struct ClassState {
    /// Partially-free pools (null-terminated doubly-linked list). The
    /// sequential-feed pool is listed here as long as it has room.
    partial_head: *mut SmallPool,
    /// Pool currently being sequentially fed (null when none).
    feed_pool: *mut SmallPool,
    /// Next unfed slot in the feed pool.
    next_feed: *mut u8,
    /// One past the last slot of the feed pool.
    max_feed: *mut u8,
}

/// Runtime state of one size class: one cache line of lock, list heads and
/// counters. Replicated per tiny arena for the smallest classes.
#[repr(align(64))]
pub(crate) struct SizeClassRt {
    pub(crate) lock: SpinLock,
    pub(crate) state: UnsafeCell<ClassState>,
    pub(crate) gets: AtomicU64,
    pub(crate) frees: AtomicU64,
    pub(crate) get_sleeps: AtomicUsize,
    pub(crate) free_sleeps: AtomicUsize,
}

impl SizeClassRt {
    pub(crate) const NEW: Self = Self {
        lock: SpinLock::new(),
        state: UnsafeCell::new(ClassState {
            partial_head: std::ptr::null_mut(),
            feed_pool: std::ptr::null_mut(),
            next_feed: std::ptr::null_mut(),
            max_feed: std::ptr::null_mut(),
        }),
        gets: AtomicU64::new(0),
        frees: AtomicU64::new(0),
        get_sleeps: AtomicUsize::new(0),
        free_sleeps: AtomicUsize::new(0),
    };
}

// Safety: the interior state is only mutated under the class spin lock; the
// counters are atomics.
unsafe impl Sync for SizeClassRt {}

/// The default (non-replicated) arena: one runtime state per class.
pub(crate) static DEFAULT_CLASSES: [SizeClassRt; CLASS_COUNT] = [SizeClassRt::NEW; CLASS_COUNT];

// ---------------------------------------------------------------------------
// partial list maintenance
// ---------------------------------------------------------------------------

/// # Safety
/// Class lock held; `pool` is on the partial list.
unsafe fn partial_delink(st: &mut ClassState, pool: *mut SmallPool) {
    // Safety: upheld by caller.
    unsafe {
        let prev = (*pool).prev;
        let next = (*pool).next;
        if prev.is_null() {
            debug_assert!(std::ptr::eq(st.partial_head, pool));
            st.partial_head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*pool).prev = std::ptr::null_mut();
        (*pool).next = std::ptr::null_mut();
    }
}

/// # Safety
/// Class lock held; `pool` is not on the partial list.
unsafe fn partial_push_front(st: &mut ClassState, pool: *mut SmallPool) {
    // Safety: upheld by caller.
    unsafe {
        (*pool).prev = std::ptr::null_mut();
        (*pool).next = st.partial_head;
        if !st.partial_head.is_null() {
            (*st.partial_head).prev = pool;
        }
        st.partial_head = pool;
    }
}

// ---------------------------------------------------------------------------
// allocation / free under the class lock
// ---------------------------------------------------------------------------

/// Allocate one slot from the class. The class lock must be held.
///
/// # Safety
/// `rt` is the runtime state for class `idx` and its lock is held by the
/// caller.
pub(crate) unsafe fn alloc_locked(rt: &SizeClassRt, idx: usize) -> Option<NonNull<u8>> {
    let cfg = &CLASS_CONFIG[idx];
    let block_size = cfg.block_size as usize;
    // Safety: lock held.
    let st = unsafe { &mut *rt.state.get() };

    let pool = st.partial_head;
    if !pool.is_null() {
        // Safety: pools on the partial list are live and owned by this class.
        unsafe {
            debug_assert_eq!((*pool).signature, SMALL_POOL_SIGNATURE);
            let slot = (*pool).first_free;
            if !slot.is_null() {
                // Pop the free list; a free slot's header holds the next
                // free slot's address with the IS_FREE bit mixed in (slot
                // addresses never use the low three bits).
                let next = (read_at(slot) & !7) as *mut u8;
                (*pool).first_free = next;
                (*pool).blocks_in_use += 1;
                write_at(slot, pool as usize);
                if next.is_null()
                    && !(std::ptr::eq(pool, st.feed_pool) && st.next_feed < st.max_feed)
                {
                    // Pool is now full: take it off the partial list.
                    partial_delink(st, pool);
                }
                rt.gets.fetch_add(1, Ordering::Relaxed);
                return Some(NonNull::new_unchecked(slot.add(HEADER_SIZE)));
            }
            // A listed pool with an empty free list must be the sequential
            // feed pool with unfed slots remaining.
            debug_assert!(std::ptr::eq(pool, st.feed_pool) && st.next_feed < st.max_feed);
        }
    }

    // Sequential feed: hand out the next virgin slot of the feed pool.
    if st.next_feed < st.max_feed {
        let pool = st.feed_pool;
        // Safety: the feed cursor stays inside the feed pool's slot array.
        unsafe {
            let slot = st.next_feed;
            st.next_feed = slot.add(block_size);
            (*pool).blocks_in_use += 1;
            write_at(slot, pool as usize);
            if st.next_feed >= st.max_feed && (*pool).first_free.is_null() {
                partial_delink(st, pool);
            }
            rt.gets.fetch_add(1, Ordering::Relaxed);
            return Some(NonNull::new_unchecked(slot.add(HEADER_SIZE)));
        }
    }

    // New pool from the medium manager. The small lock stays held while the
    // medium lock is taken inside — the only sanctioned lock nesting.
    let (mb, msize) = medium::small_pool_alloc(
        cfg.min_pool_size as usize,
        cfg.optimal_pool_size as usize,
        cfg.allowed_groups,
    )?;
    let capacity = ((msize - SMALL_POOL_OVERHEAD) / block_size) as u32;
    debug_assert!(capacity >= 4);

    // Safety: mb heads a fresh medium block of msize bytes granted to us.
    unsafe {
        let pool = mb.add(HEADER_SIZE).cast::<SmallPool>();
        pool.write(SmallPool {
            owner: rt as *const SizeClassRt,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            first_free: std::ptr::null_mut(),
            medium_block: mb,
            blocks_in_use: 1,
            capacity,
            block_size: block_size as u32,
            signature: SMALL_POOL_SIGNATURE,
        });

        let base = mb.add(SMALL_POOL_OVERHEAD);
        st.feed_pool = pool;
        st.next_feed = base.add(block_size);
        st.max_feed = base.add(capacity as usize * block_size);
        partial_push_front(st, pool);

        write_at(base, pool as usize);
        rt.gets.fetch_add(1, Ordering::Relaxed);
        Some(NonNull::new_unchecked(base.add(HEADER_SIZE)))
    }
}

/// Free one slot back to its pool. The class lock must be held.
///
/// # Safety
/// `rt` owns `pool`, its lock is held, and `slot` is a live slot of `pool`.
unsafe fn free_locked(rt: &SizeClassRt, pool: *mut SmallPool, slot: *mut u8) {
    // Safety: lock held.
    let st = unsafe { &mut *rt.state.get() };

    // Safety: pool header and slot are live under the class lock.
    unsafe {
        debug_assert_eq!((*pool).signature, SMALL_POOL_SIGNATURE);
        #[cfg(debug_assertions)]
        {
            let base = (*pool).medium_block.add(SMALL_POOL_OVERHEAD) as usize;
            let off = slot as usize - base;
            debug_assert_eq!(off % (*pool).block_size as usize, 0, "slot misaligned in pool");
        }

        let was_empty = (*pool).first_free.is_null();
        write_at(slot, ((*pool).first_free as usize) | IS_FREE);
        (*pool).first_free = slot;
        (*pool).blocks_in_use -= 1;

        if (*pool).blocks_in_use == 0 {
            // Drained: return the backing block to the medium manager. A
            // drained feed pool also stops sequential feeding.
            #[cfg(debug_assertions)]
            debug_check_free_list(pool, st);
            partial_delink(st, pool);
            if std::ptr::eq(pool, st.feed_pool) {
                st.feed_pool = std::ptr::null_mut();
                st.next_feed = std::ptr::null_mut();
                st.max_feed = std::ptr::null_mut();
            }
            let mb = (*pool).medium_block;
            medium::small_pool_release(mb);
        } else if was_empty && !(std::ptr::eq(pool, st.feed_pool) && st.next_feed < st.max_feed) {
            // Was full; give it back to the partial list.
            partial_push_front(st, pool);
        }
    }
    rt.frees.fetch_add(1, Ordering::Relaxed);
}

/// Walk a pool's free list checking for cycles, double links and stray
/// pointers. Runs when a pool drains in debug builds.
#[cfg(debug_assertions)]
unsafe fn debug_check_free_list(pool: *mut SmallPool, st: &ClassState) {
    use fixedbitset::FixedBitSet;

    // Safety: caller holds the class lock over a live pool.
    unsafe {
        let block_size = (*pool).block_size as usize;
        let capacity = (*pool).capacity as usize;
        let base = (*pool).medium_block.add(SMALL_POOL_OVERHEAD);

        let fed = if std::ptr::eq(pool, st.feed_pool) {
            (st.next_feed as usize - base as usize) / block_size
        } else {
            capacity
        };

        let mut seen = FixedBitSet::with_capacity(capacity);
        let mut count = 0usize;
        let mut cursor = (*pool).first_free;
        while !cursor.is_null() {
            let off = cursor as usize - base as usize;
            assert!(
                off % block_size == 0 && off / block_size < capacity,
                "free slot {cursor:p} outside pool"
            );
            let idx = off / block_size;
            assert!(!seen.contains(idx), "slot {idx} linked twice on the free list");
            seen.insert(idx);
            count += 1;
            cursor = (read_at(cursor) & !7) as *mut u8;
        }
        assert_eq!(
            count,
            fed - (*pool).blocks_in_use as usize,
            "free-list length disagrees with fed/in-use accounting"
        );
    }
}

// ---------------------------------------------------------------------------
// entry points
// ---------------------------------------------------------------------------

/// Allocate from default-arena class `idx`, blocking on its lock with the
/// spin-then-yield protocol. On prolonged contention the next two classes up
/// are probed opportunistically — a slightly larger block is still correct.
pub(crate) fn blocking_get(idx: usize) -> Option<NonNull<u8>> {
    let rt = &DEFAULT_CLASSES[idx];
    loop {
        if rt.lock.try_acquire_spin(SPIN_SMALL_GET) {
            // Safety: lock just acquired for this class.
            let result = unsafe { alloc_locked(rt, idx) };
            rt.lock.release();
            return result;
        }

        for step in 1..=2usize {
            let up = idx + step;
            if up < CLASS_COUNT {
                let rt_up = &DEFAULT_CLASSES[up];
                if rt_up.lock.try_acquire() {
                    // Safety: lock just acquired for the larger class.
                    let result = unsafe { alloc_locked(rt_up, up) };
                    rt_up.lock.release();
                    return result;
                }
            }
        }

        stats::small_sleep_and_yield(&rt.get_sleeps, &stats::SMALL_GET_SLEEPS);
    }
}

/// Non-blocking probe used by the tiny front-end: `None` when the class lock
/// is busy, otherwise the allocation result.
pub(crate) fn try_get(rt: &SizeClassRt, idx: usize) -> Option<Option<NonNull<u8>>> {
    if !rt.lock.try_acquire() {
        return None;
    }
    // Safety: lock just acquired.
    let result = unsafe { alloc_locked(rt, idx) };
    rt.lock.release();
    Some(result)
}

/// Allocate a small block of class `idx`. Tiny classes fan out over the
/// replicated arenas first.
pub(crate) fn small_get(idx: usize) -> Option<NonNull<u8>> {
    debug_assert!(idx < CLASS_COUNT);
    if idx < tiny::TINY_CLASS_COUNT {
        tiny::tiny_get(idx)
    } else {
        blocking_get(idx)
    }
}

/// Free a small block. Routed by the pool pointer stored in the header, so
/// tiny-arena blocks find their replica without any arena logic.
///
/// # Safety
/// `user` must be a live small payload pointer from this allocator.
pub(crate) unsafe fn small_free(user: *mut u8) {
    // Safety: a used small block's header is the owning pool's address.
    unsafe {
        let slot = user.sub(HEADER_SIZE);
        let pool = read_at(slot) as *mut SmallPool;
        let rt = &*(*pool).owner;

        rt.lock.acquire(SPIN_SMALL_FREE, || {
            stats::small_sleep_and_yield(&rt.free_sleeps, &stats::SMALL_FREE_SLEEPS)
        });
        free_locked(rt, pool, slot);
        rt.lock.release();
    }
}

/// Payload capacity of a live small block.
///
/// # Safety
/// `user` must be a live small payload pointer from this allocator.
pub(crate) unsafe fn small_mem_size(user: *const u8) -> usize {
    // Safety: upheld by caller; block_size is immutable after pool init.
    unsafe {
        let pool = read_at(user.sub(HEADER_SIZE)) as *const SmallPool;
        (*pool).block_size as usize - HEADER_SIZE
    }
}
