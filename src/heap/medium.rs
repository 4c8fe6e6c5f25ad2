//! Medium block manager.
//!
//! Medium blocks live inside fixed-size pools mapped straight from the page
//! provider. Each pool is carved from its high end downward ("sequential
//! feed"); freed blocks are coalesced with their neighbors via boundary tags
//! and kept in 1,024 size-segregated bins indexed by a two-level bitmap for
//! O(1) best-fit-upward search. A pool whose blocks are all free is returned
//! to the page provider.

use super::header::{
    read_at, write_at, HEADER_SIZE, IS_FREE, IS_LARGE_OR_POOL_IN_USE, IS_MEDIUM, PREV_MEDIUM_FREE,
    SIZE_MASK,
};
use super::lock::{SpinLock, SPIN_MEDIUM};
use super::stats;
use super::vm::{PageOps, PlatformPageOps};
use crate::sync::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

pub(crate) const MEDIUM_GRANULARITY: usize = 256;
pub(crate) const MEDIUM_SIZE_OFFSET: usize = 48;

/// Smallest medium block, headers included.
pub(crate) const MIN_MEDIUM_BLOCK: usize = 11 * MEDIUM_GRANULARITY + MEDIUM_SIZE_OFFSET; // 2,864

pub(crate) const BIN_COUNT: usize = 1024;
pub(crate) const BIN_GROUP_COUNT: usize = 32;
pub(crate) const BINS_PER_GROUP: usize = 32;

/// Largest medium block; anything bigger goes to the large manager.
pub(crate) const MAX_MEDIUM_BLOCK: usize =
    MIN_MEDIUM_BLOCK + (BIN_COUNT - 1) * MEDIUM_GRANULARITY; // 264,752

/// Fixed pool size: 20 x 64 KiB.
pub(crate) const MEDIUM_POOL_SIZE: usize = 20 * 64 * 1024; // 1,310,720

/// Pool header: prev/next links in the global pool list plus a reserved word
/// keeping the first block header at 8 mod 16 (user payloads land on 16).
pub(crate) const MEDIUM_POOL_HEADER_SIZE: usize = 24;

/// Block bytes in a pool with nothing allocated: everything between the pool
/// header and the zero-size sentinel header at the top.
pub(crate) const FULL_POOL_FREE_SIZE: usize =
    MEDIUM_POOL_SIZE - MEDIUM_POOL_HEADER_SIZE - HEADER_SIZE; // 1,310,688

/// Group mask admitting every bin group.
pub(crate) const ALL_GROUPS: u32 = u32::MAX;

/// Round a needed byte count (header included) up to a valid medium block
/// size: a multiple of the granularity plus the size offset, at least
/// [`MIN_MEDIUM_BLOCK`].
pub(crate) const fn round_medium(needed: usize) -> usize {
    if needed <= MIN_MEDIUM_BLOCK {
        MIN_MEDIUM_BLOCK
    } else {
        ((needed - MEDIUM_SIZE_OFFSET + MEDIUM_GRANULARITY - 1) & !(MEDIUM_GRANULARITY - 1))
            + MEDIUM_SIZE_OFFSET
    }
}

/// Bin covering blocks of the given size. Allocation requests always land
/// exactly on their bin's lower bound (request sizes are `round_medium`ed);
/// split remainders may fall anywhere inside a bin's range, which is sound
/// because the mapping floors.
pub(crate) const fn bin_index(size: usize) -> usize {
    let idx = (size - MIN_MEDIUM_BLOCK) / MEDIUM_GRANULARITY;
    if idx >= BIN_COUNT {
        BIN_COUNT - 1
    } else {
        idx
    }
}

/// All mutable medium bookkeeping. Guarded by the medium spin lock; only
/// [`MediumGuard`] hands out references.
pub(crate) struct MediumState {
    /// First pool base in the global pool list (null-terminated, links in
    /// the pool headers).
    pool_head: *mut u8,
    /// Head block header of each bin's free list (null when empty). Free
    /// blocks carry their own prev/next link words just past the header.
    bins: [*mut u8; BIN_COUNT],
    /// Bit `b` of `bin_bitmaps[g]` set iff bin `g * 32 + b` is non-empty.
    bin_bitmaps: [u32; BIN_GROUP_COUNT],
    /// Bit `g` set iff `bin_bitmaps[g] != 0`.
    group_bitmap: u32,
    /// Pool currently being sequentially fed (null when none).
    feed_pool: *mut u8,
    /// Lowest carved block header in the feed pool; the unformatted feed
    /// region spans `[feed_pool + POOL_HEADER, next_feed)`.
    next_feed: *mut u8,
    /// Bytes remaining in the unformatted feed region.
    feed_bytes_left: usize,
}

pub(crate) struct MediumHeap {
    lock: SpinLock,
    state: UnsafeCell<MediumState>,
}

// Safety: the interior state is only reachable through MediumGuard, which
// holds the spin lock for its lifetime.
unsafe impl Sync for MediumHeap {}

static MEDIUM: MediumHeap = MediumHeap {
    lock: SpinLock::new(),
    state: UnsafeCell::new(MediumState {
        pool_head: std::ptr::null_mut(),
        bins: [std::ptr::null_mut(); BIN_COUNT],
        bin_bitmaps: [0; BIN_GROUP_COUNT],
        group_bitmap: 0,
        feed_pool: std::ptr::null_mut(),
        next_feed: std::ptr::null_mut(),
        feed_bytes_left: 0,
    }),
};

/// RAII guard over the global medium state.
pub(crate) struct MediumGuard {
    _priv: (),
}

/// Acquire the medium lock (spin-then-yield, accounted against the medium
/// arena's sleep counters).
pub(crate) fn lock() -> MediumGuard {
    MEDIUM
        .lock
        .acquire(SPIN_MEDIUM, || stats::MEDIUM_ARENA.sleep_and_yield());
    MediumGuard { _priv: () }
}

impl Deref for MediumGuard {
    type Target = MediumState;

    fn deref(&self) -> &MediumState {
        // Safety: the guard holds the medium lock.
        unsafe { &*MEDIUM.state.get() }
    }
}

impl DerefMut for MediumGuard {
    fn deref_mut(&mut self) -> &mut MediumState {
        // Safety: the guard holds the medium lock exclusively.
        unsafe { &mut *MEDIUM.state.get() }
    }
}

impl Drop for MediumGuard {
    fn drop(&mut self) {
        MEDIUM.lock.release();
    }
}

// Free-block link words live just past the header: next at +8, prev at +16.
const LINK_NEXT: usize = 8;
const LINK_PREV: usize = 16;

impl MediumState {
    // -----------------------------------------------------------------
    // bins + bitmaps
    // -----------------------------------------------------------------

    #[inline]
    fn set_bin_bit(&mut self, idx: usize) {
        let g = idx / BINS_PER_GROUP;
        self.bin_bitmaps[g] |= 1 << (idx % BINS_PER_GROUP);
        self.group_bitmap |= 1 << g;
    }

    #[inline]
    fn clear_bin_bit(&mut self, idx: usize) {
        let g = idx / BINS_PER_GROUP;
        self.bin_bitmaps[g] &= !(1 << (idx % BINS_PER_GROUP));
        if self.bin_bitmaps[g] == 0 {
            self.group_bitmap &= !(1 << g);
        }
    }

    /// Insert a free block at the head of its bin.
    ///
    /// # Safety
    /// `block` must be a formatted free medium block of `size` bytes whose
    /// header and trailing tag are already written.
    unsafe fn insert_bin(&mut self, block: *mut u8, size: usize) {
        debug_assert!(size >= MIN_MEDIUM_BLOCK);
        let idx = bin_index(size);
        let old = self.bins[idx];
        // Safety: free blocks are at least MIN_MEDIUM_BLOCK, so the link
        // words are in bounds.
        unsafe {
            write_at(block.add(LINK_NEXT), old as usize);
            write_at(block.add(LINK_PREV), 0);
            if !old.is_null() {
                write_at(old.add(LINK_PREV), block as usize);
            }
        }
        self.bins[idx] = block;
        self.set_bin_bit(idx);
    }

    /// Unlink a specific free block from its bin.
    ///
    /// # Safety
    /// `block` must currently be linked into the bin for `size`.
    unsafe fn unlink_bin(&mut self, block: *mut u8, size: usize) {
        let idx = bin_index(size);
        // Safety: linked free blocks carry valid link words.
        unsafe {
            let next = read_at(block.add(LINK_NEXT)) as *mut u8;
            let prev = read_at(block.add(LINK_PREV)) as *mut u8;
            if prev.is_null() {
                debug_assert!(std::ptr::eq(self.bins[idx], block));
                self.bins[idx] = next;
            } else {
                write_at(prev.add(LINK_NEXT), next as usize);
            }
            if !next.is_null() {
                write_at(next.add(LINK_PREV), prev as usize);
            }
        }
        if self.bins[idx].is_null() {
            self.clear_bin_bit(idx);
        }
    }

    /// Best-fit-upward bin search restricted to `allowed_groups`. Returns the
    /// popped block and its size.
    fn search_bins(&mut self, rounded: usize, allowed_groups: u32) -> Option<(*mut u8, usize)> {
        let want = bin_index(rounded);
        let g0 = want / BINS_PER_GROUP;
        let b0 = (want % BINS_PER_GROUP) as u32;

        // Bins >= the target within the target's own group.
        if allowed_groups & (1 << g0) != 0 {
            let masked = self.bin_bitmaps[g0] & (u32::MAX << b0);
            if masked != 0 {
                let idx = g0 * BINS_PER_GROUP + masked.trailing_zeros() as usize;
                return Some(self.pop_bin(idx));
            }
        }

        // Strictly higher groups.
        let above = if g0 + 1 >= BIN_GROUP_COUNT {
            0
        } else {
            u32::MAX << (g0 + 1)
        };
        let groups = self.group_bitmap & allowed_groups & above;
        if groups != 0 {
            let g = groups.trailing_zeros() as usize;
            let bits = self.bin_bitmaps[g];
            debug_assert!(bits != 0, "group bitmap bit set for empty group {g}");
            let idx = g * BINS_PER_GROUP + bits.trailing_zeros() as usize;
            return Some(self.pop_bin(idx));
        }

        None
    }

    fn pop_bin(&mut self, idx: usize) -> (*mut u8, usize) {
        let block = self.bins[idx];
        debug_assert!(!block.is_null(), "pop from empty bin {idx}");
        // Safety: the bin invariant guarantees block is a linked free block.
        let size = unsafe { read_at(block) } & SIZE_MASK;
        debug_assert_eq!(bin_index(size), idx);
        // Safety: as above.
        unsafe { self.unlink_bin(block, size) };
        (block, size)
    }

    // -----------------------------------------------------------------
    // pools + sequential feed
    // -----------------------------------------------------------------

    /// Map a fresh pool and make it the sequential-feed pool.
    fn new_pool(&mut self) -> Option<()> {
        // Safety: plain page acquisition; the region is exclusively ours.
        let base = match unsafe { PlatformPageOps::acquire(MEDIUM_POOL_SIZE) } {
            Ok(p) => p.as_ptr(),
            Err(e) => {
                log::warn!("medium pool acquisition failed: {e}");
                return None;
            }
        };
        stats::MEDIUM_ARENA.on_acquire(MEDIUM_POOL_SIZE);
        log::debug!("medium pool acquired: {base:p} ({MEDIUM_POOL_SIZE} bytes)");

        // Safety: base spans MEDIUM_POOL_SIZE zeroed bytes.
        unsafe {
            // Link at the front of the pool list.
            write_at(base, 0);
            write_at(base.add(8), self.pool_head as usize);
            if !self.pool_head.is_null() {
                write_at(self.pool_head, base as usize);
            }
            // Zero-size sentinel header terminating block traversal.
            write_at(base.add(MEDIUM_POOL_SIZE - HEADER_SIZE), IS_MEDIUM);
        }
        self.pool_head = base;

        self.feed_pool = base;
        // Safety: in-bounds offset arithmetic.
        self.next_feed = unsafe { base.add(MEDIUM_POOL_SIZE - HEADER_SIZE) };
        self.feed_bytes_left = FULL_POOL_FREE_SIZE;
        Some(())
    }

    /// Unmap a fully-free pool.
    fn release_pool(&mut self, pool: *mut u8) {
        // Safety: pool is a live pool base; header links are valid.
        unsafe {
            let prev = read_at(pool) as *mut u8;
            let next = read_at(pool.add(8)) as *mut u8;
            if prev.is_null() {
                debug_assert!(std::ptr::eq(self.pool_head, pool));
                self.pool_head = next;
            } else {
                write_at(prev.add(8), next as usize);
            }
            if !next.is_null() {
                write_at(next, prev as usize);
            }
        }

        stats::MEDIUM_ARENA.on_release(MEDIUM_POOL_SIZE);
        log::debug!("medium pool released: {pool:p}");
        // Safety: the pool was acquired with this exact size and no live
        // block references remain.
        if let Err(e) =
            unsafe { PlatformPageOps::release(NonNull::new_unchecked(pool), MEDIUM_POOL_SIZE) }
        {
            log::warn!("medium pool release failed: {e}");
        }
    }

    /// Carve a block of `rounded` bytes from the top of the feed region.
    fn carve_feed(&mut self, rounded: usize, extra_flags: usize) -> *mut u8 {
        debug_assert!(self.feed_bytes_left >= rounded);
        // Safety: the feed region has at least `rounded` unformatted bytes
        // directly below `next_feed`.
        let block = unsafe { self.next_feed.sub(rounded) };
        // Safety: block header is inside the feed region.
        unsafe { write_at(block, rounded | IS_MEDIUM | extra_flags) };
        self.next_feed = block;
        self.feed_bytes_left -= rounded;
        block
    }

    /// Convert the remaining feed region into a block before switching pools.
    /// A remainder of at least [`MIN_MEDIUM_BLOCK`] is binned; anything
    /// smaller becomes an unbinned free block that coalesces away when its
    /// upper neighbor is freed.
    fn retire_feed_remainder(&mut self) {
        if self.feed_pool.is_null() {
            return;
        }
        let remainder = self.feed_bytes_left;
        if remainder != 0 {
            // Safety: the remainder spans [feed_pool + header, next_feed).
            unsafe {
                let block = self.feed_pool.add(MEDIUM_POOL_HEADER_SIZE);
                debug_assert_eq!(block.add(remainder), self.next_feed);
                write_at(block, remainder | IS_MEDIUM | IS_FREE);
                write_at(block.add(remainder - HEADER_SIZE), remainder);
                let above = self.next_feed;
                write_at(above, read_at(above) | PREV_MEDIUM_FREE);
                if remainder >= MIN_MEDIUM_BLOCK {
                    self.insert_bin(block, remainder);
                }
            }
        }
        self.feed_pool = std::ptr::null_mut();
        self.next_feed = std::ptr::null_mut();
        self.feed_bytes_left = 0;
    }

    // -----------------------------------------------------------------
    // allocate / free
    // -----------------------------------------------------------------

    /// Either split `block` so the lower part is exactly `used` bytes, or
    /// grant the whole block when the excess is below [`MIN_MEDIUM_BLOCK`].
    /// Returns the (now in-use) block header.
    fn split_or_grant(
        &mut self,
        block: *mut u8,
        block_size: usize,
        used: usize,
        extra_flags: usize,
    ) -> *mut u8 {
        debug_assert!(used <= block_size);
        if block_size - used >= MIN_MEDIUM_BLOCK {
            let rem_size = block_size - used;
            // Safety: remainder lies inside the block being split.
            unsafe {
                let rem = block.add(used);
                write_at(rem, rem_size | IS_MEDIUM | IS_FREE);
                write_at(rem.add(rem_size - HEADER_SIZE), rem_size);
                // The upper neighbor already carries PREV_MEDIUM_FREE from
                // when the whole block was free.
                self.insert_bin(rem, rem_size);
                write_at(block, used | IS_MEDIUM | extra_flags);
            }
        } else {
            // Safety: the upper neighbor header is a formatted block or the
            // pool sentinel.
            unsafe {
                let above = block.add(block_size);
                write_at(above, read_at(above) & !PREV_MEDIUM_FREE);
                write_at(block, block_size | IS_MEDIUM | extra_flags);
            }
        }
        block
    }

    /// Allocate a medium block of exactly `rounded` bytes (or the whole
    /// granted block when splitting is not worthwhile). Returns the block
    /// header address.
    pub(crate) fn allocate(&mut self, rounded: usize, extra_flags: usize) -> Option<*mut u8> {
        debug_assert!(rounded >= MIN_MEDIUM_BLOCK && rounded <= MAX_MEDIUM_BLOCK);
        debug_assert_eq!((rounded - MEDIUM_SIZE_OFFSET) % MEDIUM_GRANULARITY, 0);

        if let Some((block, size)) = self.search_bins(rounded, ALL_GROUPS) {
            return Some(self.split_or_grant(block, size, rounded, extra_flags));
        }
        if self.feed_bytes_left >= rounded {
            return Some(self.carve_feed(rounded, extra_flags));
        }
        self.retire_feed_remainder();
        self.new_pool()?;
        Some(self.carve_feed(rounded, extra_flags))
    }

    /// Allocate the backing block for a small-block pool: bin search is
    /// restricted to `allowed_groups` so small pools never consume the high
    /// bins, and oversized picks are split back to the optimal size.
    /// Returns the block header and the granted size.
    pub(crate) fn allocate_small_pool(
        &mut self,
        min_rounded: usize,
        optimal_rounded: usize,
        allowed_groups: u32,
    ) -> Option<(*mut u8, usize)> {
        debug_assert!(min_rounded <= optimal_rounded);

        if let Some((block, size)) = self.search_bins(min_rounded, allowed_groups) {
            let used = if size >= optimal_rounded + MIN_MEDIUM_BLOCK {
                optimal_rounded
            } else {
                size
            };
            let block = self.split_or_grant(block, size, used, IS_LARGE_OR_POOL_IN_USE);
            return Some((block, used));
        }
        if self.feed_bytes_left >= optimal_rounded {
            return Some((
                self.carve_feed(optimal_rounded, IS_LARGE_OR_POOL_IN_USE),
                optimal_rounded,
            ));
        }
        self.retire_feed_remainder();
        self.new_pool()?;
        Some((
            self.carve_feed(optimal_rounded, IS_LARGE_OR_POOL_IN_USE),
            optimal_rounded,
        ))
    }

    /// Free a medium block: coalesce with both neighbors, give the most
    /// recently fed block back to the feed region, release a fully-free
    /// pool, and bin everything else.
    pub(crate) fn free_block(&mut self, block: *mut u8) {
        // Safety: block is a live medium block header owned by the caller.
        let hdr = unsafe { read_at(block) };
        debug_assert!(hdr & IS_MEDIUM != 0, "free_block on non-medium header");
        debug_assert!(hdr & IS_FREE == 0, "free_block on already-free header");

        let mut start = block;
        let mut size = hdr & SIZE_MASK;

        // Merge the upper neighbor. The pool sentinel is never IS_FREE.
        // Safety: the upper neighbor header is inside the same pool.
        unsafe {
            let above = start.add(size);
            let above_hdr = read_at(above);
            if above_hdr & IS_FREE != 0 {
                let above_size = above_hdr & SIZE_MASK;
                debug_assert!(above_size != 0);
                if above_size >= MIN_MEDIUM_BLOCK {
                    self.unlink_bin(above, above_size);
                }
                size += above_size;
            }
        }

        // Merge the lower neighbor via its trailing size word.
        if hdr & PREV_MEDIUM_FREE != 0 {
            // Safety: PREV_MEDIUM_FREE guarantees the word below the header
            // is the lower neighbor's trailing size tag.
            unsafe {
                let below_size = read_at(start.sub(HEADER_SIZE));
                let below = start.sub(below_size);
                debug_assert!(read_at(below) & IS_FREE != 0);
                debug_assert_eq!(read_at(below) & SIZE_MASK, below_size);
                if below_size >= MIN_MEDIUM_BLOCK {
                    self.unlink_bin(below, below_size);
                }
                start = below;
                size += below_size;
            }
        }

        // The most recently fed block flows back into the feed region.
        if std::ptr::eq(start, self.next_feed) {
            // Safety: the region and the header above it stay mapped.
            unsafe {
                // Stamp the stale header free so the double-free guard keeps
                // working on pointers into the returned region, and restore
                // the invariant that the lowest carved block never borders
                // free space from below (the feed region is not a block).
                write_at(start, size | IS_MEDIUM | IS_FREE);
                let above = start.add(size);
                write_at(above, read_at(above) & !PREV_MEDIUM_FREE);
            }
            // Safety: in-bounds offset arithmetic.
            self.next_feed = unsafe { start.add(size) };
            self.feed_bytes_left += size;
            if self.feed_bytes_left == FULL_POOL_FREE_SIZE {
                let pool = self.feed_pool;
                self.feed_pool = std::ptr::null_mut();
                self.next_feed = std::ptr::null_mut();
                self.feed_bytes_left = 0;
                self.release_pool(pool);
            }
            return;
        }

        // A free region spanning the whole pool goes back to the OS.
        if size == FULL_POOL_FREE_SIZE {
            // Safety: a full-pool region starts at the first block header.
            let pool = unsafe { start.sub(MEDIUM_POOL_HEADER_SIZE) };
            if std::ptr::eq(pool, self.feed_pool) {
                debug_assert_eq!(self.feed_bytes_left, 0);
                self.feed_pool = std::ptr::null_mut();
                self.next_feed = std::ptr::null_mut();
            }
            self.release_pool(pool);
            return;
        }

        // Safety: start/size describe a coalesced region inside one pool.
        unsafe {
            write_at(start, size | IS_MEDIUM | IS_FREE);
            write_at(start.add(size - HEADER_SIZE), size);
            let above = start.add(size);
            write_at(above, read_at(above) | PREV_MEDIUM_FREE);
            self.insert_bin(start, size);
        }
    }

    // -----------------------------------------------------------------
    // in-place reallocation
    // -----------------------------------------------------------------

    /// Shrink a used block to `new_rounded` bytes, freeing the tail. The
    /// caller has verified the surplus is at least [`MIN_MEDIUM_BLOCK`].
    pub(crate) fn shrink_in_place(&mut self, block: *mut u8, new_rounded: usize) {
        // Safety: block is a live medium header owned by the caller.
        let hdr = unsafe { read_at(block) };
        let size = hdr & SIZE_MASK;
        debug_assert!(size - new_rounded >= MIN_MEDIUM_BLOCK);

        // Safety: header rewrite of an owned block, then the tail is handed
        // to the free path.
        unsafe {
            write_at(block, new_rounded | IS_MEDIUM | (hdr & PREV_MEDIUM_FREE));
            self.release_tail(block.add(new_rounded), size - new_rounded);
        }
    }

    /// Free a tail region split off a used block. Merges with the upper
    /// neighbor only — the lower neighbor is the still-used block.
    unsafe fn release_tail(&mut self, start: *mut u8, mut size: usize) {
        debug_assert!(size >= MIN_MEDIUM_BLOCK);
        // Safety: the upper neighbor header is a formatted block or sentinel.
        unsafe {
            let above = start.add(size);
            let above_hdr = read_at(above);
            if above_hdr & IS_FREE != 0 {
                let above_size = above_hdr & SIZE_MASK;
                if above_size >= MIN_MEDIUM_BLOCK {
                    self.unlink_bin(above, above_size);
                }
                size += above_size;
            }
            write_at(start, size | IS_MEDIUM | IS_FREE);
            write_at(start.add(size - HEADER_SIZE), size);
            let above = start.add(size);
            write_at(above, read_at(above) | PREV_MEDIUM_FREE);
            self.insert_bin(start, size);
        }
    }

    /// Grow a used block in place by absorbing a free upper neighbor.
    /// Returns the new block size on success.
    pub(crate) fn try_grow_in_place(&mut self, block: *mut u8, new_rounded: usize) -> Option<usize> {
        // Safety: block is a live medium header owned by the caller.
        let hdr = unsafe { read_at(block) };
        let size = hdr & SIZE_MASK;
        debug_assert!(new_rounded > size);

        // Safety: the upper neighbor header is inside the same pool.
        let (above, above_hdr) = unsafe {
            let above = block.add(size);
            (above, read_at(above))
        };
        if above_hdr & IS_FREE == 0 {
            return None;
        }
        let above_size = above_hdr & SIZE_MASK;
        let combined = size + above_size;
        if combined < new_rounded {
            return None;
        }

        if above_size >= MIN_MEDIUM_BLOCK {
            // Safety: the neighbor is binned (it is free and big enough).
            unsafe { self.unlink_bin(above, above_size) };
        }

        let prev_bit = hdr & PREV_MEDIUM_FREE;
        if combined - new_rounded >= MIN_MEDIUM_BLOCK {
            let rem_size = combined - new_rounded;
            // Safety: the remainder lies within the absorbed region.
            unsafe {
                let rem = block.add(new_rounded);
                write_at(rem, rem_size | IS_MEDIUM | IS_FREE);
                write_at(rem.add(rem_size - HEADER_SIZE), rem_size);
                // The block above the absorbed neighbor keeps its
                // PREV_MEDIUM_FREE bit: its lower neighbor is still free.
                self.insert_bin(rem, rem_size);
                write_at(block, new_rounded | IS_MEDIUM | prev_bit);
            }
            Some(new_rounded)
        } else {
            // Safety: header rewrites of owned/adjacent formatted blocks.
            unsafe {
                let top = block.add(combined);
                write_at(top, read_at(top) & !PREV_MEDIUM_FREE);
                write_at(block, combined | IS_MEDIUM | prev_bit);
            }
            Some(combined)
        }
    }

    // -----------------------------------------------------------------
    // debug validation
    // -----------------------------------------------------------------

    /// Bin bitmap invariant: a bitmap bit is set iff the bin list is
    /// non-empty.
    #[cfg(test)]
    pub(crate) fn check_bin_bitmaps(&self) {
        for idx in 0..BIN_COUNT {
            let g = idx / BINS_PER_GROUP;
            let bit = self.bin_bitmaps[g] & (1 << (idx % BINS_PER_GROUP)) != 0;
            assert_eq!(
                bit,
                !self.bins[idx].is_null(),
                "bin {idx}: bitmap bit {bit} disagrees with list head"
            );
            let group_bit = self.group_bitmap & (1 << g) != 0;
            assert_eq!(group_bit, self.bin_bitmaps[g] != 0, "group {g} bitmap mismatch");
        }
    }

    /// Walk the formatted part of the feed pool from `next_feed` to the
    /// sentinel, returning the byte sum of traversed blocks.
    #[cfg(test)]
    pub(crate) fn walk_feed_pool(&self) -> usize {
        if self.feed_pool.is_null() {
            return 0;
        }
        let mut total = 0usize;
        let mut cursor = self.next_feed;
        // Safety: traversal over formatted headers terminates at the
        // zero-size sentinel.
        unsafe {
            loop {
                let hdr = read_at(cursor);
                let size = hdr & SIZE_MASK;
                if size == 0 {
                    break;
                }
                total += size;
                cursor = cursor.add(size);
            }
        }
        total
    }

    #[cfg(test)]
    pub(crate) fn feed_bytes_left(&self) -> usize {
        self.feed_bytes_left
    }
}

// ---------------------------------------------------------------------------
// crate-level entry points
// ---------------------------------------------------------------------------

/// Allocate a medium block for a user payload of `size` bytes.
pub(crate) fn medium_get(size: usize) -> Option<NonNull<u8>> {
    let rounded = round_medium(size + HEADER_SIZE);
    debug_assert!(rounded <= MAX_MEDIUM_BLOCK);
    let mut guard = lock();
    let block = guard.allocate(rounded, 0)?;
    drop(guard);
    // Safety: allocate returned a valid block header; the payload starts
    // just past it.
    Some(unsafe { NonNull::new_unchecked(block.add(HEADER_SIZE)) })
}

/// Free the medium block whose payload starts at `user`.
///
/// # Safety
/// `user` must be a live medium payload pointer from this allocator.
pub(crate) unsafe fn medium_free(user: *mut u8) {
    // Safety: upheld by caller.
    let block = unsafe { user.sub(HEADER_SIZE) };
    lock().free_block(block);
}

/// Carve a medium block to host a small-block pool. Returns the block header
/// and granted size.
pub(crate) fn small_pool_alloc(
    min_rounded: usize,
    optimal_rounded: usize,
    allowed_groups: u32,
) -> Option<(*mut u8, usize)> {
    lock().allocate_small_pool(min_rounded, optimal_rounded, allowed_groups)
}

/// Return a drained small-block pool's backing block to the medium manager.
///
/// # Safety
/// `block` must be the header of a live pool-in-use medium block with no
/// remaining small allocations.
pub(crate) unsafe fn small_pool_release(block: *mut u8) {
    lock().free_block(block);
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn medium_current_bytes() -> usize {
        stats::MEDIUM_ARENA.current_bytes()
    }

    #[test]
    fn test_round_medium() {
        assert_eq!(round_medium(16), MIN_MEDIUM_BLOCK);
        assert_eq!(round_medium(MIN_MEDIUM_BLOCK), MIN_MEDIUM_BLOCK);
        assert_eq!(round_medium(MIN_MEDIUM_BLOCK + 1), MIN_MEDIUM_BLOCK + 256);
        assert_eq!(round_medium(3120), 3120);
        assert_eq!(round_medium(3121), 3376);
        // Every rounded size is granularity-aligned at the size offset.
        for needed in (MIN_MEDIUM_BLOCK..MIN_MEDIUM_BLOCK + 4096).step_by(97) {
            let r = round_medium(needed);
            assert!(r >= needed);
            assert_eq!((r - MEDIUM_SIZE_OFFSET) % MEDIUM_GRANULARITY, 0);
            assert!(r - needed < MEDIUM_GRANULARITY);
        }
    }

    #[test]
    fn test_bin_index_mapping() {
        assert_eq!(bin_index(MIN_MEDIUM_BLOCK), 0);
        assert_eq!(bin_index(MIN_MEDIUM_BLOCK + 255), 0);
        assert_eq!(bin_index(MIN_MEDIUM_BLOCK + 256), 1);
        assert_eq!(bin_index(MAX_MEDIUM_BLOCK), BIN_COUNT - 1);
        assert_eq!(bin_index(FULL_POOL_FREE_SIZE), BIN_COUNT - 1);
    }

    #[test]
    fn test_pool_geometry() {
        assert_eq!(MEDIUM_POOL_SIZE, 1_310_720);
        assert_eq!(FULL_POOL_FREE_SIZE, 1_310_688);
        assert_eq!(MAX_MEDIUM_BLOCK, 264_752);
        // First block header must land at 8 mod 16 so payloads land on 16.
        assert_eq!(MEDIUM_POOL_HEADER_SIZE % 16, 8);
        assert_eq!(FULL_POOL_FREE_SIZE % 16, 0);
    }

    #[test]
    fn test_alloc_free_releases_pool() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let before = medium_current_bytes();

        let p = medium_get(10_000).expect("medium alloc failed");
        assert_eq!(p.as_ptr() as usize % 16, 0);
        assert_eq!(medium_current_bytes(), before + MEDIUM_POOL_SIZE);

        // Write through the whole payload.
        // Safety: Test code.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xAB, 10_000);
            medium_free(p.as_ptr());
        }
        assert_eq!(medium_current_bytes(), before, "sole block freed => pool released");
    }

    #[test]
    fn test_freed_block_is_reused_from_bin() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let a = medium_get(50_000).unwrap();
        let b = medium_get(50_000).unwrap();
        // a sits above b (feed carves downward).
        assert!((a.as_ptr() as usize) > (b.as_ptr() as usize));

        // Safety: Test code.
        unsafe {
            // a is not the most recently fed block, so it lands in a bin.
            medium_free(a.as_ptr());
            let a2 = medium_get(50_000).unwrap();
            assert_eq!(a2, a, "bin reuse should hand back the identical block");
            medium_free(a2.as_ptr());
            medium_free(b.as_ptr());
        }
    }

    #[test]
    fn test_triple_coalesce_single_bin_entry() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let before = medium_current_bytes();

        // Block size 3,120 (user 3,112 + header rounds to it).
        let user = 3120 - HEADER_SIZE;
        let a = medium_get(user).unwrap();
        let b = medium_get(user).unwrap();
        let c = medium_get(user).unwrap();
        // Blocker below c keeps c away from the feed region.
        let d = medium_get(user).unwrap();

        // Safety: Test code.
        unsafe {
            medium_free(a.as_ptr());
            medium_free(c.as_ptr());
            medium_free(b.as_ptr());

            // The three blocks must have merged into one 9,360-byte free
            // block starting at c's header, sitting in exactly one bin.
            let merged = c.as_ptr().sub(HEADER_SIZE);
            let hdr = read_at(merged);
            assert_eq!(hdr & SIZE_MASK, 3 * 3120);
            assert!(hdr & IS_FREE != 0);

            {
                let st = lock();
                st.check_bin_bitmaps();
                let idx = bin_index(3 * 3120);
                assert!(std::ptr::eq(st.bins[idx], merged));
                // Single entry: no next link.
                assert_eq!(read_at(merged.add(LINK_NEXT)), 0);
            }

            // A request mapping to the merged block's bin gets it back whole
            // (9,256 + header rounds to 9,264, the bin's lower bound; the
            // 96-byte excess is below the split threshold).
            let merged_user = medium_get(9256).unwrap();
            assert_eq!(merged_user.as_ptr(), c.as_ptr());
            assert_eq!(read_at(merged) & SIZE_MASK, 3 * 3120);

            medium_free(merged_user.as_ptr());
            medium_free(d.as_ptr());
        }
        assert_eq!(medium_current_bytes(), before);
    }

    #[test]
    fn test_feed_return_in_reverse_free_order() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();
        let before = medium_current_bytes();

        let mut ptrs = Vec::new();
        for _ in 0..8 {
            ptrs.push(medium_get(20_000).unwrap());
        }
        // Reverse order: each freed block is the most recently fed one and
        // flows straight back into the feed region.
        // Safety: Test code.
        unsafe {
            for p in ptrs.into_iter().rev() {
                medium_free(p.as_ptr());
            }
        }
        assert_eq!(medium_current_bytes(), before, "feed-return must drain the pool");
    }

    #[test]
    fn test_split_remainder_is_binned() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let big = medium_get(100_000).unwrap();
        let blocker = medium_get(5_000).unwrap();
        // Safety: Test code.
        unsafe {
            medium_free(big.as_ptr());

            // A much smaller request splits the binned 100_048-byte block.
            let small = medium_get(10_000).unwrap();
            assert_eq!(small.as_ptr(), big.as_ptr(), "split grants the lower part");

            {
                let st = lock();
                st.check_bin_bitmaps();
            }

            medium_free(small.as_ptr());
            medium_free(blocker.as_ptr());
        }
    }

    #[test]
    fn test_pool_traversal_terminates_and_sums() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let a = medium_get(30_000).unwrap();
        let b = medium_get(40_000).unwrap();
        {
            let st = lock();
            let walked = st.walk_feed_pool();
            assert_eq!(
                walked + st.feed_bytes_left(),
                FULL_POOL_FREE_SIZE,
                "formatted blocks + feed region must cover the whole pool"
            );
        }
        // Safety: Test code.
        unsafe {
            medium_free(b.as_ptr());
            medium_free(a.as_ptr());
        }
    }

    #[test]
    fn test_grow_in_place_into_free_neighbor() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let a = medium_get(10_000).unwrap();
        let b = medium_get(10_000).unwrap();
        let blocker = medium_get(5_000).unwrap();

        // Safety: Test code.
        unsafe {
            // a sits directly above b; freeing it gives b a free upper
            // neighbor to absorb.
            medium_free(a.as_ptr());

            let b_block = b.as_ptr().sub(HEADER_SIZE);
            let grown = {
                let mut st = lock();
                st.try_grow_in_place(b_block, round_medium(18_000 + HEADER_SIZE))
            };
            assert!(grown.is_some(), "free upper neighbor should allow in-place growth");
            assert_eq!(read_at(b_block) & SIZE_MASK, grown.unwrap());

            medium_free(b.as_ptr());
            medium_free(blocker.as_ptr());
        }
    }

    #[test]
    fn test_shrink_in_place_bins_tail() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let p = medium_get(60_000).unwrap();
        let blocker = medium_get(5_000).unwrap();
        // Safety: Test code.
        unsafe {
            let block = p.as_ptr().sub(HEADER_SIZE);
            let new_rounded = round_medium(20_000 + HEADER_SIZE);
            {
                let mut st = lock();
                st.shrink_in_place(block, new_rounded);
            }
            assert_eq!(read_at(block) & SIZE_MASK, new_rounded);
            {
                let st = lock();
                st.check_bin_bitmaps();
            }
            medium_free(p.as_ptr());
            medium_free(blocker.as_ptr());
        }
    }

    #[test]
    fn test_boundary_tags_on_free_blocks() {
        let _guard = crate::heap::TEST_MUTEX.write().unwrap();

        let a = medium_get(8_000).unwrap();
        let b = medium_get(8_000).unwrap();
        let blocker = medium_get(5_000).unwrap();
        // Safety: Test code.
        unsafe {
            medium_free(a.as_ptr());

            let a_block = a.as_ptr().sub(HEADER_SIZE);
            let size = read_at(a_block) & SIZE_MASK;
            // Trailing word mirrors the header size.
            assert_eq!(read_at(a_block.add(size - HEADER_SIZE)), size);
            // Upper neighbor sees a free lower neighbor.
            let above = read_at(a_block.add(size));
            assert!(above & PREV_MEDIUM_FREE != 0);

            // b (below a) is used and its header says so.
            let b_block = b.as_ptr().sub(HEADER_SIZE);
            assert_eq!(read_at(b_block) & IS_FREE, 0);

            medium_free(b.as_ptr());
            medium_free(blocker.as_ptr());
        }
    }
}
