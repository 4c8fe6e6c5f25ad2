//! End-to-end allocator scenarios across all managers.
