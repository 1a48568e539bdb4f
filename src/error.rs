//! Error type shared by the pool and the radix tree.

use thiserror::Error;

/// Errors reported by [`Pool`](crate::Pool) and [`RadixTree`](crate::RadixTree).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The raw allocator declined the request.
    #[error("raw allocator could not provide {size} bytes aligned to {align}")]
    Exhausted {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },
    /// The prefix already carries a value.
    #[error("prefix already holds a value")]
    Busy,
    /// The addressed prefix was never populated.
    #[error("prefix not found")]
    NotFound,
    /// The pointer is not a live large allocation of this pool.
    #[error("pointer is not a tracked large allocation")]
    InvalidFree,
    /// The requested pool size cannot hold a block header.
    #[error("pool size {size} is smaller than the minimum of {min} bytes")]
    PoolTooSmall {
        /// Requested total block size.
        size: usize,
        /// Smallest size accepted.
        min: usize,
    },
    /// Size and alignment do not form a valid allocation layout.
    #[error("invalid layout: {size} bytes aligned to {align}")]
    InvalidLayout {
        /// Requested size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        align: usize,
    },
    /// Preallocation depth is negative (other than the default sentinel) or
    /// deeper than the key width.
    #[error("invalid preallocation depth {0}")]
    InvalidDepth(i64),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
