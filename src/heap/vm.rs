use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    AcquireFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    RemapFailed(std::io::Error),
    /// The platform (or the `no-remap` feature) has no in-place remap
    /// primitive; callers fall back to acquire/copy/release.
    RemapUnsupported,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::AcquireFailed(e) => write!(f, "page acquire failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "page release failed: {e}"),
            VmError::RemapFailed(e) => write!(f, "page remap failed: {e}"),
            VmError::RemapUnsupported => write!(f, "page remap not supported on this platform"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::AcquireFailed(e) | VmError::ReleaseFailed(e) | VmError::RemapFailed(e) => {
                Some(e)
            }
            VmError::RemapUnsupported => None,
        }
    }
}

/// Abstract interface for the OS page provider.
pub(crate) trait PageOps {
    /// Map a zero-initialized, readable+writable, page-aligned region of at
    /// least `size` bytes. The caller treats an error as out-of-memory.
    unsafe fn acquire(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Unmap the entire region previously returned by [`acquire`](Self::acquire).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Grow or shrink a mapping in place where the OS supports it. The
    /// returned pointer may differ from `ptr` (the region moved). Platforms
    /// without this capability return [`VmError::RemapUnsupported`].
    unsafe fn remap(ptr: NonNull<u8>, old_size: usize, new_size: usize)
        -> Result<NonNull<u8>, VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformPageOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PageOps, PlatformPageOps, VmError};
    use std::io;

    impl PageOps for PlatformPageOps {
        unsafe fn acquire(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::AcquireFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::AcquireFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        #[cfg(all(target_os = "linux", not(feature = "no-remap")))]
        unsafe fn remap(
            ptr: NonNull<u8>,
            old_size: usize,
            new_size: usize,
        ) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mremap. MREMAP_MAYMOVE lets the kernel
            // relocate the mapping when it cannot grow in place.
            let new_ptr = unsafe {
                libc::mremap(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    old_size,
                    new_size,
                    libc::MREMAP_MAYMOVE,
                )
            };

            if new_ptr == libc::MAP_FAILED {
                return Err(VmError::RemapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(new_ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::RemapFailed(io::Error::other("mremap returned null"))),
            }
        }

        // macOS has no mremap equivalent; the Mach vm_remap call changes
        // sharing semantics and cannot grow a private anonymous mapping.
        #[cfg(any(not(target_os = "linux"), feature = "no-remap"))]
        unsafe fn remap(
            _ptr: NonNull<u8>,
            _old_size: usize,
            _new_size: usize,
        ) -> Result<NonNull<u8>, VmError> {
            Err(VmError::RemapUnsupported)
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page
                // size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed PageOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead every acquisition is
// backed by a plain zeroed heap allocation. `remap` is modelled as
// allocate-copy-free so the realloc paths stay exercisable.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl PageOps for PlatformPageOps {
    unsafe fn acquire(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::AcquireFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size acquisition",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::AcquireFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::AcquireFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `acquire`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn remap(
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, VmError> {
        // Safety: modelled as acquire/copy/release; sizes are caller-checked.
        unsafe {
            let new_ptr = Self::acquire(new_size)?;
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_size.min(new_size),
            );
            Self::release(ptr, old_size)?;
            Ok(new_ptr)
        }
    }

    fn page_size() -> usize {
        4096
    }
}
