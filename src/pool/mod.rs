//! Region allocator.
//!
//! A [`Pool`] owns a chain of equally sized blocks and serves small requests
//! by bumping a pointer inside the first block that has room. Requests larger
//! than [`Pool::max_small`] go straight to the raw allocator and are tracked
//! individually so they can be released early with [`Pool::free`] or in bulk
//! when the pool goes away. Small allocations are never freed one by one.
//!
//! Memory layout of each block:
//!
//! ```text
//! +--------------+----------------------------------+
//! | Block header | allocations ...  | unused        |
//! +--------------+----------------------------------+
//! ^ block        ^ block + HEADER   ^ last          ^ end
//! ```
//!
//! Bookkeeping records for large allocations and cleanup handlers are carved
//! out of the blocks themselves, so a pool only ever talks to the raw
//! allocator for blocks and for large buffers.

mod cleanup;

pub use cleanup::{Cleanup, CleanupHandler};

use std::alloc::Layout;
use std::cell::Cell;
use std::fmt;
use std::iter;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::str;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::raw::{RawAlloc, System};
use cleanup::CleanupRecord;

/// Alignment of every block handed out by the raw allocator.
pub const POOL_ALIGNMENT: usize = 16;

/// Alignment of [`Pool::alloc`] results (one machine word).
pub const ALIGNMENT: usize = mem::size_of::<usize>();

/// Block size used by [`PoolConfig::default`].
pub const DEFAULT_POOL_SIZE: usize = 16 * 1024;

/// Header at the start of every block.
#[repr(C)]
struct Block {
    /// First free byte.
    last: *mut u8,
    /// One past the last usable byte.
    end: *mut u8,
    next: Option<NonNull<Block>>,
    /// Searches this block could not satisfy since creation or last reset.
    failed: usize,
}

/// Tracks one buffer obtained directly from the raw allocator.
struct Large {
    /// `None` once freed; the record stays linked for reuse.
    alloc: Option<NonNull<u8>>,
    layout: Layout,
    next: Option<NonNull<Large>>,
}

const HEADER_SIZE: usize = align_up(mem::size_of::<Block>(), POOL_ALIGNMENT);

/// A block must at least fit its header plus one bookkeeping record.
const MIN_POOL_SIZE: usize = HEADER_SIZE
    + align_up(
        max_usize(mem::size_of::<Large>(), mem::size_of::<CleanupRecord>()),
        POOL_ALIGNMENT,
    );

const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

const fn max_usize(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

#[inline]
fn align_ptr(p: *mut u8, align: usize) -> *mut u8 {
    let addr = p as usize;
    p.wrapping_add(align_up(addr, align) - addr)
}

/// Tuning knobs for a [`Pool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Total size of every block, header included.
    pub size: usize,
    /// A block stops being the search start once it has failed more than
    /// this many times.
    pub skip_after_failures: usize,
    /// Large records probed for an empty slot before a new record is linked.
    pub large_reuse_probes: usize,
}

impl PoolConfig {
    /// Default heuristics with the given block size.
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            skip_after_failures: 4,
            large_reuse_probes: 5,
        }
    }
}

/// A region allocator.
///
/// Allocation methods take `&self` and return memory that lives as long as
/// the borrow of the pool. [`reset`](Pool::reset) takes `&mut self`, so it can
/// only run once every such borrow has ended. Dropping the pool runs the
/// registered cleanup handlers, then releases all large buffers and blocks.
///
/// The pool does no locking; it is `Send` but not `Sync`.
pub struct Pool<A: RawAlloc = System> {
    head: NonNull<Block>,
    /// Block where the next small search starts.
    current: Cell<NonNull<Block>>,
    large: Cell<Option<NonNull<Large>>>,
    cleanup: Cell<Option<NonNull<CleanupRecord>>>,
    max: usize,
    layout: Layout,
    config: PoolConfig,
    raw: A,
}

// SAFETY: the pool exclusively owns every block, record and buffer it points
// to, and cleanup handlers are required to be `Send`.
unsafe impl<A: RawAlloc + Send> Send for Pool<A> {}

impl Pool<System> {
    /// Create a pool with blocks of `size` bytes on the global heap.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_config_in(PoolConfig::with_size(size), System)
    }

    /// Create a pool from a full configuration on the global heap.
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        Self::with_config_in(config, System)
    }
}

impl<A: RawAlloc> Pool<A> {
    /// Create a pool with blocks of `size` bytes taken from `raw`.
    pub fn new_in(size: usize, raw: A) -> Result<Self> {
        Self::with_config_in(PoolConfig::with_size(size), raw)
    }

    /// Create a pool from a full configuration, taking memory from `raw`.
    pub fn with_config_in(config: PoolConfig, raw: A) -> Result<Self> {
        if config.size < MIN_POOL_SIZE {
            return Err(Error::PoolTooSmall {
                size: config.size,
                min: MIN_POOL_SIZE,
            });
        }
        let layout =
            Layout::from_size_align(config.size, POOL_ALIGNMENT).map_err(|_| {
                Error::InvalidLayout {
                    size: config.size,
                    align: POOL_ALIGNMENT,
                }
            })?;
        let head = Self::new_block(&raw, layout)?;
        let max = (config.size - HEADER_SIZE).min(raw.page_size() - 1);

        debug!(block = ?head, size = config.size, max, "pool created");

        Ok(Self {
            head,
            current: Cell::new(head),
            large: Cell::new(None),
            cleanup: Cell::new(None),
            max,
            layout,
            config,
            raw,
        })
    }

    fn new_block(raw: &A, layout: Layout) -> Result<NonNull<Block>> {
        let base = raw.allocate(layout).ok_or(Error::Exhausted {
            size: layout.size(),
            align: layout.align(),
        })?;
        let block = base.cast::<Block>();
        // SAFETY: `base` points to `layout.size() >= MIN_POOL_SIZE` bytes
        // aligned to POOL_ALIGNMENT, enough for the header.
        unsafe {
            block.as_ptr().write(Block {
                last: base.as_ptr().add(HEADER_SIZE),
                end: base.as_ptr().add(layout.size()),
                next: None,
                failed: 0,
            });
        }
        Ok(block)
    }

    /// Largest request served from blocks; anything bigger is a large
    /// allocation.
    pub fn max_small(&self) -> usize {
        self.max
    }

    /// Total size of each block, header included.
    pub fn block_size(&self) -> usize {
        self.layout.size()
    }

    /// Number of blocks in the chain.
    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    /// Number of live large allocations.
    pub fn large_count(&self) -> usize {
        self.large_records()
            // SAFETY: records stay valid until reset or drop.
            .filter(|l| unsafe { (*l.as_ptr()).alloc.is_some() })
            .count()
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Page size reported by the raw allocator.
    pub fn page_size(&self) -> usize {
        self.raw.page_size()
    }

    /// The raw allocator backing this pool.
    pub fn raw(&self) -> &A {
        &self.raw
    }

    /// Allocate `size` bytes aligned to [`ALIGNMENT`].
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        if size <= self.max {
            self.alloc_small(size, ALIGNMENT)
        } else {
            self.alloc_large(size)
        }
    }

    /// Allocate `size` bytes with no alignment guarantee.
    ///
    /// Packs byte strings tighter than [`alloc`](Pool::alloc).
    pub fn alloc_unaligned(&self, size: usize) -> Result<NonNull<u8>> {
        if size <= self.max {
            self.alloc_small(size, 1)
        } else {
            self.alloc_large(size)
        }
    }

    /// Allocate `size` zeroed bytes aligned to [`ALIGNMENT`].
    pub fn calloc(&self, size: usize) -> Result<NonNull<u8>> {
        let p = self.alloc(size)?;
        // SAFETY: `p` is valid for `size` bytes.
        unsafe { ptr::write_bytes(p.as_ptr(), 0, size) };
        Ok(p)
    }

    /// Allocate `size` bytes aligned to `align` straight from the raw
    /// allocator, whatever the size.
    ///
    /// The buffer is tracked as a large allocation and can be released early
    /// with [`free`](Pool::free).
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let layout = match Layout::from_size_align(size, align) {
            Ok(layout) if size > 0 => layout,
            _ => return Err(Error::InvalidLayout { size, align }),
        };
        let p = self.raw.allocate(layout).ok_or(Error::Exhausted { size, align })?;
        self.link_large(p, layout)
    }

    /// Allocate memory for `layout`.
    ///
    /// Requests that fit in a block and need no more than [`POOL_ALIGNMENT`]
    /// are served from blocks; the rest become large allocations.
    pub fn alloc_layout(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            // SAFETY: alignments are non-zero.
            return Ok(unsafe { NonNull::new_unchecked(layout.align() as *mut u8) });
        }
        if layout.size() <= self.max && layout.align() <= POOL_ALIGNMENT {
            return self.alloc_small(layout.size(), layout.align());
        }
        let layout = layout
            .align_to(ALIGNMENT)
            .map_err(|_| Error::InvalidLayout {
                size: layout.size(),
                align: layout.align(),
            })?;
        self.alloc_large_layout(layout)
    }

    /// Move `value` into the pool.
    ///
    /// The value is never dropped; the memory is reclaimed with the pool.
    pub fn alloc_value<T>(&self, value: T) -> Result<&mut T> {
        let p = self.alloc_layout(Layout::new::<T>())?.cast::<T>();
        // SAFETY: `p` is valid and aligned for `T` and not aliased.
        unsafe {
            p.as_ptr().write(value);
            Ok(&mut *p.as_ptr())
        }
    }

    /// Copy `src` into the pool.
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> Result<&mut [T]> {
        let layout = Layout::array::<T>(src.len()).map_err(|_| Error::InvalidLayout {
            size: src.len().saturating_mul(mem::size_of::<T>()),
            align: mem::align_of::<T>(),
        })?;
        let p = self.alloc_layout(layout)?.cast::<T>();
        // SAFETY: `p` is valid for `src.len()` elements and does not overlap `src`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), p.as_ptr(), src.len());
            Ok(slice::from_raw_parts_mut(p.as_ptr(), src.len()))
        }
    }

    /// Copy `s` into the pool.
    pub fn alloc_str(&self, s: &str) -> Result<&mut str> {
        let bytes = self.alloc_slice_copy(s.as_bytes())?;
        // SAFETY: copied from a valid `str`.
        Ok(unsafe { str::from_utf8_unchecked_mut(bytes) })
    }

    /// Release a large allocation before the pool goes away.
    ///
    /// Small allocations cannot be freed individually; passing one (or any
    /// other untracked pointer) reports [`Error::InvalidFree`].
    ///
    /// # Safety
    ///
    /// No reference into the buffer may be used after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        for l in self.large_records() {
            let l = l.as_ptr();
            // SAFETY: records stay valid until reset or drop.
            unsafe {
                if (*l).alloc == Some(ptr) {
                    trace!(ptr = ?ptr, "free large");
                    (*l).alloc = None;
                    self.raw.release(ptr, (*l).layout);
                    return Ok(());
                }
            }
        }
        Err(Error::InvalidFree)
    }

    /// Forget every allocation while keeping the blocks.
    ///
    /// Large buffers are released and every block is rewound. Cleanup
    /// handlers are dropped **without** being run; only dropping the pool
    /// runs them.
    pub fn reset(&mut self) {
        self.release_large();
        self.discard_cleanups();
        for b in self.blocks() {
            let b = b.as_ptr();
            // SAFETY: blocks are owned by the pool and alive.
            unsafe {
                (*b).last = b.cast::<u8>().add(HEADER_SIZE);
                (*b).failed = 0;
            }
        }
        self.current.set(self.head);
        debug!(blocks = self.block_count(), "pool reset");
    }

    fn blocks(&self) -> impl Iterator<Item = NonNull<Block>> + '_ {
        // SAFETY: every block in the chain is alive while `self` is.
        iter::successors(Some(self.head), |b| unsafe { (*b.as_ptr()).next })
    }

    fn large_records(&self) -> impl Iterator<Item = NonNull<Large>> + '_ {
        // SAFETY: records live in blocks and stay valid until reset or drop.
        iter::successors(self.large.get(), |l| unsafe { (*l.as_ptr()).next })
    }

    /// Bump-allocate from the first block with room, growing the chain if
    /// none has any. `size` may exceed `max` for internal records.
    fn alloc_small(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        debug_assert!(align <= POOL_ALIGNMENT);
        let mut block = Some(self.current.get());
        while let Some(b) = block {
            let b = b.as_ptr();
            // SAFETY: blocks are alive; `m` stays inside the block when it fits.
            unsafe {
                let m = align_ptr((*b).last, align);
                let room = ((*b).end as usize).checked_sub(m as usize);
                if room.is_some_and(|room| room >= size) {
                    (*b).last = m.add(size);
                    return Ok(NonNull::new_unchecked(m));
                }
                block = (*b).next;
            }
        }
        self.alloc_block(size, align)
    }

    /// Append a new block and serve `size` bytes from it.
    fn alloc_block(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let new = Self::new_block(&self.raw, self.layout)?;
        let m;
        // SAFETY: the new block starts POOL_ALIGNMENT-aligned after its header
        // and `size` fits in `layout.size() - HEADER_SIZE`.
        unsafe {
            let n = new.as_ptr();
            m = align_ptr((*n).last, align);
            (*n).last = m.add(size);
        }

        // Every block from `current` on missed this request.
        let mut current = self.current.get();
        let mut p = self.current.get();
        // SAFETY: blocks are alive.
        unsafe {
            loop {
                let b = p.as_ptr();
                let failed = (*b).failed;
                (*b).failed = failed + 1;
                if failed > self.config.skip_after_failures {
                    current = (*b).next.unwrap_or(new);
                }
                match (*b).next {
                    Some(next) => p = next,
                    None => break,
                }
            }
            (*p.as_ptr()).next = Some(new);
        }
        self.current.set(current);

        debug!(block = ?new, size = self.layout.size(), "pool grown");

        // SAFETY: `m` points into the new block.
        Ok(unsafe { NonNull::new_unchecked(m) })
    }

    fn alloc_large(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, ALIGNMENT)
            .map_err(|_| Error::InvalidLayout { size, align: ALIGNMENT })?;
        self.alloc_large_layout(layout)
    }

    fn alloc_large_layout(&self, layout: Layout) -> Result<NonNull<u8>> {
        let p = self.raw.allocate(layout).ok_or(Error::Exhausted {
            size: layout.size(),
            align: layout.align(),
        })?;

        for l in self.large_records().take(self.config.large_reuse_probes) {
            let l = l.as_ptr();
            // SAFETY: records stay valid until reset or drop.
            unsafe {
                if (*l).alloc.is_none() {
                    (*l).alloc = Some(p);
                    (*l).layout = layout;
                    trace!(ptr = ?p, size = layout.size(), "large reused record");
                    return Ok(p);
                }
            }
        }

        self.link_large(p, layout)
    }

    /// Track `p` in a fresh record at the head of the large list. Releases
    /// `p` if the record cannot be allocated.
    fn link_large(&self, p: NonNull<u8>, layout: Layout) -> Result<NonNull<u8>> {
        let record = match self.alloc_small(mem::size_of::<Large>(), mem::align_of::<Large>()) {
            Ok(record) => record.cast::<Large>(),
            Err(e) => {
                // SAFETY: `p` was just allocated with `layout` and never shared.
                unsafe { self.raw.release(p, layout) };
                return Err(e);
            }
        };
        // SAFETY: `record` is valid and aligned for `Large`.
        unsafe {
            record.as_ptr().write(Large {
                alloc: Some(p),
                layout,
                next: self.large.get(),
            });
        }
        self.large.set(Some(record));
        trace!(ptr = ?p, size = layout.size(), align = layout.align(), "large");
        Ok(p)
    }

    fn release_large(&mut self) {
        for l in self.large_records() {
            let l = l.as_ptr();
            // SAFETY: records are alive; each buffer is released once because
            // the slot is cleared.
            unsafe {
                if let Some(p) = (*l).alloc.take() {
                    trace!(ptr = ?p, "free large");
                    self.raw.release(p, (*l).layout);
                }
            }
        }
        self.large.set(None);
    }

    /// `(first usable byte, last, end)` of every block, as addresses.
    #[cfg(test)]
    pub(crate) fn block_spans(&self) -> Vec<(usize, usize, usize)> {
        self.blocks()
            .map(|b| {
                let p = b.as_ptr();
                // SAFETY: blocks are alive.
                unsafe { (p as usize + HEADER_SIZE, (*p).last as usize, (*p).end as usize) }
            })
            .collect()
    }

    /// Position of `current` in the chain.
    #[cfg(test)]
    pub(crate) fn current_index(&self) -> usize {
        let current = self.current.get();
        self.blocks().position(|b| b == current).unwrap_or(usize::MAX)
    }

    /// `failed` counter of every block.
    #[cfg(test)]
    pub(crate) fn failed_counts(&self) -> Vec<usize> {
        // SAFETY: blocks are alive.
        self.blocks().map(|b| unsafe { (*b.as_ptr()).failed }).collect()
    }
}

impl<A: RawAlloc> Drop for Pool<A> {
    fn drop(&mut self) {
        self.run_cleanups();
        self.release_large();

        let mut block = Some(self.head);
        while let Some(b) = block {
            // SAFETY: each block is read before it is released and released once.
            unsafe {
                let p = b.as_ptr();
                block = (*p).next;
                trace!(block = ?b, unused = (*p).end as usize - (*p).last as usize, "free block");
                self.raw.release(b.cast(), self.layout);
            }
        }
        debug!("pool destroyed");
    }
}

impl<A: RawAlloc> fmt::Debug for Pool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("block_size", &self.layout.size())
            .field("max", &self.max)
            .field("blocks", &self.block_count())
            .field("large", &self.large_count())
            .field("cleanups", &self.cleanup_count())
            .finish()
    }
}
