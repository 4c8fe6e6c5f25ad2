//! scalemem — a scalable heap allocator for 64-bit multi-threaded processes.
//!
//! Requests are classified by size: tiny allocations fan out round-robin over
//! replicated size-class arenas, small allocations go to per-class slot pools,
//! medium allocations come from binned 1.25 MiB pools with boundary-tag
//! coalescing, and large allocations map OS pages directly (resized in place
//! via page remapping where the OS supports it).

#[cfg(not(target_pointer_width = "64"))]
compile_error!("scalemem supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod heap;

// allocator entry points
#[cfg(not(loom))]
pub use heap::api::{
    alloc_mem, current_heap_status, free_mem, get_mem, mem_size, realloc_mem, ScaleAlloc,
};

// diagnostics
#[cfg(not(loom))]
pub use heap::api::{
    small_block_contention, small_block_status, SmallBlockContention, SmallBlockOrder,
    SmallBlockUsage,
};
#[cfg(not(loom))]
pub use heap::stats::{ArenaStatus, HeapStatus};

#[cfg(all(not(loom), feature = "report-leaks"))]
pub use heap::api::{leak_summary, LeakRecord};

// errors
pub use heap::vm::VmError;
