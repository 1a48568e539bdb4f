//! # radix-pool
//!
//! A region allocator and a longest-prefix-match radix tree built on it.
//!
//! - [`Pool`] serves small allocations by bumping a pointer through a chain of
//!   equally sized blocks, sends large ones to the raw allocator, and runs
//!   registered cleanup handlers when it is dropped. Nothing allocated from a
//!   pool is freed individually except large buffers.
//! - [`RadixTree`] is a binary trie over 32-bit or 128-bit keys. Each stored
//!   prefix is a `(key, mask)` pair; [`RadixTree::find`] returns the value of
//!   the longest stored prefix of a key. Nodes are taken from page-sized slabs
//!   of the pool and recycled through a free list on delete.
//!
//! Neither type locks: share them across threads only behind your own
//! synchronization.
//!
//! ## Example
//!
//! ```rust
//! use radix_pool::{Pool, Preallocate, Radix32Tree, RadixTree};
//!
//! let pool = Pool::new(16 * 1024).unwrap();
//! let mut tree: Radix32Tree<u32> = RadixTree::new(&pool, Preallocate::Default).unwrap();
//!
//! tree.insert(0x0A00_0000, 0xFF00_0000, 1).unwrap(); // 10.0.0.0/8
//! tree.insert(0x0A01_0000, 0xFFFF_0000, 2).unwrap(); // 10.1.0.0/16
//!
//! assert_eq!(tree.find(0x0A01_0203), Some(2));
//! assert_eq!(tree.find(0x0A02_0203), Some(1));
//! assert_eq!(tree.find(0x0B00_0000), None);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod pool;
pub mod radix;
pub mod raw;

pub use error::{Error, Result};
pub use pool::{Cleanup, CleanupHandler, Pool, PoolConfig};
pub use radix::{Preallocate, Radix128Tree, Radix32Tree, RadixKey, RadixTree};
pub use raw::{RawAlloc, System};

#[cfg(test)]
mod proptests;
