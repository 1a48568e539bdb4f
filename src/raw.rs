//! The raw memory source underneath a [`Pool`](crate::Pool).
//!
//! The pool never talks to the operating system directly. Block memory,
//! large buffers and aligned slabs all come from a [`RawAlloc`], which makes
//! it possible to swap the global heap for something else (or, in tests, for
//! an allocator that counts and fails on purpose).

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Page size used when the platform does not report one.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// A source of aligned memory blocks.
///
/// # Safety
///
/// `allocate` must return either `None` or a pointer to at least
/// `layout.size()` bytes aligned to `layout.align()`, valid until passed to
/// `release` with the same layout. `page_size` must return a power of two.
pub unsafe trait RawAlloc {
    /// Allocate a block for `layout`, or `None` if the request cannot be met.
    ///
    /// `layout.size()` is never zero.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block obtained from [`allocate`](RawAlloc::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate` on this allocator with the same
    /// `layout`, and must not be released twice.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);

    /// Size of one virtual memory page.
    fn page_size(&self) -> usize {
        page_size()
    }
}

/// The global Rust heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct System;

unsafe impl RawAlloc for System {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert_ne!(layout.size(), 0);
        // SAFETY: layout has a non-zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr/layout came from `allocate`.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

unsafe impl<A: RawAlloc + ?Sized> RawAlloc for &A {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: forwarded contract.
        unsafe { (**self).release(ptr, layout) }
    }

    #[inline]
    fn page_size(&self) -> usize {
        (**self).page_size()
    }
}

/// Page size reported by the platform, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 && (size as usize).is_power_of_two() {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}
