//! Large block manager.
//!
//! Blocks above the medium range map OS pages directly, rounded up to 64 KiB.
//! Live blocks hang off a doubly-linked list so diagnostics can account for
//! them; resizing prefers the page provider's remap primitive and falls back
//! to allocate/copy/release with cache-bypassing stores.

use super::header::{HEADER_SIZE, IS_LARGE_OR_POOL_IN_USE, SIZE_MASK};
use super::lock::{SpinLock, SPIN_LARGE};
use super::stats;
use super::vm::{PageOps, PlatformPageOps, VmError};
use crate::sync::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

pub(crate) const LARGE_GRANULARITY: usize = 64 * 1024;

/// List links, the user-requested size and the size+flags word. The payload
/// starts right after, so the size+flags word doubles as the block header at
/// `payload - 8`.
#[repr(C)]
pub(crate) struct LargeHeader {
    prev: *mut LargeHeader,
    next: *mut LargeHeader,
    user_size: usize,
    size_flags: usize,
}

pub(crate) const LARGE_HEADER_SIZE: usize = 32;

const _: () = assert!(std::mem::size_of::<LargeHeader>() == LARGE_HEADER_SIZE);

/// Total overhead of a large block: header struct plus the slack word kept
/// above the payload.
pub(crate) const LARGE_OVERHEAD: usize = LARGE_HEADER_SIZE + HEADER_SIZE;

/// Rounded mapping size for a payload of `size` bytes.
pub(crate) const fn round_large(size: usize) -> usize {
    (size + LARGE_OVERHEAD + LARGE_GRANULARITY - 1) & !(LARGE_GRANULARITY - 1)
}

struct LargeState {
    head: *mut LargeHeader,
}

pub(crate) struct LargeHeap {
    lock: SpinLock,
    state: UnsafeCell<LargeState>,
}

// Safety: the interior state is only reachable through LargeGuard, which
// holds the spin lock for its lifetime.
unsafe impl Sync for LargeHeap {}

static LARGE: LargeHeap = LargeHeap {
    lock: SpinLock::new(),
    state: UnsafeCell::new(LargeState {
        head: std::ptr::null_mut(),
    }),
};

struct LargeGuard {
    _priv: (),
}

fn lock() -> LargeGuard {
    LARGE
        .lock
        .acquire(SPIN_LARGE, || stats::LARGE_ARENA.sleep_and_yield());
    LargeGuard { _priv: () }
}

impl Deref for LargeGuard {
    type Target = LargeState;

    fn deref(&self) -> &LargeState {
        // Safety: the guard holds the large lock.
        unsafe { &*LARGE.state.get() }
    }
}

impl DerefMut for LargeGuard {
    fn deref_mut(&mut self) -> &mut LargeState {
        // Safety: the guard holds the large lock exclusively.
        unsafe { &mut *LARGE.state.get() }
    }
}

impl Drop for LargeGuard {
    fn drop(&mut self) {
        LARGE.lock.release();
    }
}

impl LargeState {
    /// # Safety
    /// Lock held; `block` is initialized and not on the list.
    unsafe fn push(&mut self, block: *mut LargeHeader) {
        // Safety: upheld by caller.
        unsafe {
            (*block).prev = std::ptr::null_mut();
            (*block).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = block;
            }
        }
        self.head = block;
    }

    /// # Safety
    /// Lock held; `block` is on the list.
    unsafe fn delink(&mut self, block: *mut LargeHeader) {
        // Safety: upheld by caller.
        unsafe {
            let prev = (*block).prev;
            let next = (*block).next;
            if prev.is_null() {
                debug_assert!(std::ptr::eq(self.head, block));
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
    }
}

/// Allocate a large block for a `size`-byte payload.
pub(crate) fn large_get(size: usize) -> Option<NonNull<u8>> {
    let rounded = round_large(size);
    // Safety: plain page acquisition; the region is exclusively ours.
    let base = match unsafe { PlatformPageOps::acquire(rounded) } {
        Ok(p) => p.as_ptr(),
        Err(e) => {
            log::warn!("large block acquisition failed ({size} bytes): {e}");
            return None;
        }
    };
    stats::LARGE_ARENA.on_acquire(rounded);
    log::debug!("large block acquired: {base:p} ({rounded} bytes)");

    let block = base.cast::<LargeHeader>();
    // Safety: base spans `rounded` zeroed bytes.
    unsafe {
        (*block).user_size = size;
        (*block).size_flags = rounded | IS_LARGE_OR_POOL_IN_USE;
        lock().push(block);
        Some(NonNull::new_unchecked(base.add(LARGE_HEADER_SIZE)))
    }
}

/// Free a large block.
///
/// # Safety
/// `user` must be a live large payload pointer from this allocator.
pub(crate) unsafe fn large_free(user: *mut u8) {
    // Safety: upheld by caller.
    unsafe {
        let block = user.sub(LARGE_HEADER_SIZE).cast::<LargeHeader>();
        let rounded = (*block).size_flags & SIZE_MASK;

        lock().delink(block);

        stats::LARGE_ARENA.on_release(rounded);
        log::debug!("large block released: {block:p}");
        if let Err(e) = PlatformPageOps::release(NonNull::new_unchecked(block.cast()), rounded) {
            log::warn!("large block release failed: {e}");
        }
    }
}

/// Payload capacity of a live large block.
///
/// # Safety
/// `user` must be a live large payload pointer from this allocator.
pub(crate) unsafe fn large_mem_size(user: *const u8) -> usize {
    // Safety: upheld by caller.
    unsafe {
        let block = user.sub(LARGE_HEADER_SIZE).cast::<LargeHeader>();
        ((*block).size_flags & SIZE_MASK) - LARGE_OVERHEAD
    }
}

/// User-requested size recorded for a live large block.
///
/// # Safety
/// `user` must be a live large payload pointer from this allocator.
#[allow(dead_code)]
pub(crate) unsafe fn large_user_size(user: *const u8) -> usize {
    // Safety: upheld by caller.
    unsafe {
        let block = user.sub(LARGE_HEADER_SIZE).cast::<LargeHeader>();
        (*block).user_size
    }
}

/// Record a new user-requested size on an in-place kept block.
///
/// # Safety
/// `user` must be a live large payload pointer exclusively owned by the
/// caller.
pub(crate) unsafe fn large_set_user_size(user: *mut u8, size: usize) {
    // Safety: upheld by caller; the block is not mutated concurrently.
    unsafe {
        let block = user.sub(LARGE_HEADER_SIZE).cast::<LargeHeader>();
        (*block).user_size = size;
    }
}

/// Grow a large block in place through the page provider's remap primitive.
/// Returns the (possibly moved) payload pointer, or `None` when remapping is
/// unsupported or failed — the block is then back on the list untouched and
/// the caller falls back to allocate/copy/release.
///
/// # Safety
/// `user` must be a live large payload pointer exclusively owned by the
/// caller.
pub(crate) unsafe fn large_try_remap(user: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
    // Safety: upheld by caller.
    unsafe {
        let block = user.sub(LARGE_HEADER_SIZE).cast::<LargeHeader>();
        let old_rounded = (*block).size_flags & SIZE_MASK;
        let new_rounded = round_large(new_size);
        debug_assert!(new_rounded > old_rounded);

        // Off the list while the mapping may move.
        lock().delink(block);

        match PlatformPageOps::remap(
            NonNull::new_unchecked(block.cast()),
            old_rounded,
            new_rounded,
        ) {
            Ok(moved) => {
                let block = moved.as_ptr().cast::<LargeHeader>();
                (*block).user_size = new_size;
                (*block).size_flags = new_rounded | IS_LARGE_OR_POOL_IN_USE;
                stats::LARGE_ARENA.on_release(old_rounded);
                stats::LARGE_ARENA.on_acquire(new_rounded);
                lock().push(block);
                Some(NonNull::new_unchecked(moved.as_ptr().add(LARGE_HEADER_SIZE)))
            }
            Err(VmError::RemapUnsupported) => {
                lock().push(block);
                None
            }
            Err(e) => {
                log::warn!("large block remap failed: {e}");
                lock().push(block);
                None
            }
        }
    }
}

/// Copy `len` bytes with cache-bypassing 16-byte stores where the target
/// supports them. Both pointers are 16-byte aligned (allocator payloads
/// always are); `len` need not be.
///
/// # Safety
/// `src` and `dst` must be valid for `len` bytes and must not overlap.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn copy_non_temporal(dst: *mut u8, src: *const u8, len: usize) {
    use std::arch::x86_64::{__m128i, _mm_load_si128, _mm_sfence, _mm_stream_si128};

    // Safety: 16-byte aligned pointers, bounds upheld by caller.
    unsafe {
        let chunks = len / 16;
        for i in 0..chunks {
            let v = _mm_load_si128(src.add(i * 16).cast::<__m128i>());
            _mm_stream_si128(dst.add(i * 16).cast::<__m128i>(), v);
        }
        // One fence ahead of the scalar tail so the streamed stores are
        // globally ordered before it.
        _mm_sfence();
        let done = chunks * 16;
        std::ptr::copy_nonoverlapping(src.add(done), dst.add(done), len - done);
    }
}

/// Portable fallback.
#[cfg(not(target_arch = "x86_64"))]
pub(crate) unsafe fn copy_non_temporal(dst: *mut u8, src: *const u8, len: usize) {
    // Safety: bounds upheld by caller.
    unsafe { std::ptr::copy_nonoverlapping(src, dst, len) }
}
