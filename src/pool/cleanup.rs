//! Deferred actions run when a pool is dropped.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::slice;

use tracing::{debug, trace};

use super::Pool;
use crate::error::Result;
use crate::raw::RawAlloc;

/// Action run against a cleanup payload.
pub type CleanupHandler = Box<dyn FnOnce(&mut [u8]) + Send>;

/// Lives inside a pool block, linked from `Pool::cleanup`.
pub(super) struct CleanupRecord {
    /// `None` if never set or already run.
    handler: Option<CleanupHandler>,
    data: NonNull<u8>,
    len: usize,
    next: Option<NonNull<CleanupRecord>>,
}

/// Handle to a registered cleanup.
///
/// Handlers run at most once: when the pool is dropped (most recently added
/// first), or earlier through [`run_now`](Cleanup::run_now). Resetting the
/// pool drops pending handlers without running them.
pub struct Cleanup<'p> {
    record: NonNull<CleanupRecord>,
    _pool: PhantomData<&'p ()>,
}

impl Cleanup<'_> {
    /// The zero-initialized payload reserved for this cleanup.
    pub fn data(&mut self) -> &mut [u8] {
        // SAFETY: the record and its payload live as long as the pool borrow,
        // and this handle is the only way to reach them until drop.
        unsafe {
            let r = self.record.as_ptr();
            slice::from_raw_parts_mut((*r).data.as_ptr(), (*r).len)
        }
    }

    /// Install (or replace) the handler.
    pub fn set_handler<F>(&mut self, handler: F)
    where
        F: FnOnce(&mut [u8]) + Send + 'static,
    {
        // SAFETY: see `data`.
        unsafe { (*self.record.as_ptr()).handler = Some(Box::new(handler)) };
    }

    /// Whether a handler is installed and has not run yet.
    pub fn is_armed(&self) -> bool {
        // SAFETY: see `data`.
        unsafe { (*self.record.as_ptr()).handler.is_some() }
    }

    /// Remove the handler without running it.
    pub fn disarm(&mut self) {
        // SAFETY: see `data`.
        unsafe { (*self.record.as_ptr()).handler = None };
    }

    /// Run the handler now so that dropping the pool skips it.
    ///
    /// Returns `false` if no handler was armed.
    pub fn run_now(self) -> bool {
        // SAFETY: see `data`.
        unsafe { run(self.record) }
    }
}

/// Take and run the handler of `record`, if any.
///
/// # Safety
///
/// `record` must point to a live record whose payload is not borrowed.
unsafe fn run(record: NonNull<CleanupRecord>) -> bool {
    let r = record.as_ptr();
    // SAFETY: guaranteed by the caller.
    unsafe {
        match (*r).handler.take() {
            Some(handler) => {
                trace!(cleanup = ?record, "run cleanup");
                handler(slice::from_raw_parts_mut((*r).data.as_ptr(), (*r).len));
                true
            }
            None => false,
        }
    }
}

impl<A: RawAlloc> Pool<A> {
    /// Register a cleanup with a zeroed payload of `size` bytes.
    ///
    /// The handler starts unset; install it with
    /// [`Cleanup::set_handler`].
    pub fn add_cleanup(&self, size: usize) -> Result<Cleanup<'_>> {
        let record = self
            .alloc_small(mem::size_of::<CleanupRecord>(), mem::align_of::<CleanupRecord>())?
            .cast::<CleanupRecord>();
        let data = if size > 0 {
            self.calloc(size)?
        } else {
            NonNull::dangling()
        };

        // SAFETY: `record` is valid and aligned for `CleanupRecord`.
        unsafe {
            record.as_ptr().write(CleanupRecord {
                handler: None,
                data,
                len: size,
                next: self.cleanup.get(),
            });
        }
        self.cleanup.set(Some(record));

        debug!(cleanup = ?record, size, "add cleanup");

        Ok(Cleanup {
            record,
            _pool: PhantomData,
        })
    }

    /// Register a cleanup and install its handler in one step.
    pub fn add_cleanup_with<F>(&self, size: usize, handler: F) -> Result<Cleanup<'_>>
    where
        F: FnOnce(&mut [u8]) + Send + 'static,
    {
        let mut cleanup = self.add_cleanup(size)?;
        cleanup.set_handler(handler);
        Ok(cleanup)
    }

    /// Number of registered cleanups, armed or not.
    pub fn cleanup_count(&self) -> usize {
        let mut n = 0;
        let mut c = self.cleanup.get();
        while let Some(record) = c {
            n += 1;
            // SAFETY: records stay valid until reset or drop.
            c = unsafe { (*record.as_ptr()).next };
        }
        n
    }

    /// Run every armed handler, most recently added first.
    pub(super) fn run_cleanups(&mut self) {
        let mut c = self.cleanup.take();
        while let Some(record) = c {
            // SAFETY: `&mut self` means no `Cleanup` handle is alive; records
            // live in blocks that are released only after this.
            unsafe {
                run(record);
                c = (*record.as_ptr()).next;
            }
        }
    }

    /// Drop every pending handler without running it.
    pub(super) fn discard_cleanups(&mut self) {
        let mut c = self.cleanup.take();
        while let Some(record) = c {
            // SAFETY: see `run_cleanups`.
            unsafe {
                let r = record.as_ptr();
                (*r).handler = None;
                c = (*r).next;
            }
        }
    }
}
