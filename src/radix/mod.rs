//! Binary radix tree for longest-prefix matching.
//!
//! Every node sits at one bit position of the key space: the root matches the
//! empty prefix, its children the first bit, and so on. A node may carry a
//! value (a stored prefix) or be a pure branch point. Lookups walk the key
//! bit by bit and return the deepest value passed on the way.
//!
//! Nodes are carved out of page-sized, page-aligned slabs taken from a
//! [`Pool`]. They are never returned to the pool: nodes removed by
//! [`RadixTree::delete`] go onto a free stack and are reused by later inserts,
//! and the slabs themselves are reclaimed when the pool is reset or dropped.

mod key;

pub use key::RadixKey;

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::raw::{RawAlloc, System};

/// Deepest complete subtree [`Preallocate::Depth`] accepts.
pub const MAX_PREALLOCATE_DEPTH: u32 = 32;

/// How much of the tree to build up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preallocate {
    /// Only the root.
    #[default]
    None,
    /// A complete subtree sized to fill about one page with nodes.
    Default,
    /// A complete subtree of the given depth.
    Depth(u32),
}

impl Preallocate {
    /// Decode the classic signed convention: `0` for none, `-1` for the
    /// default depth, a positive number for an explicit depth.
    pub fn from_raw(depth: i64) -> Result<Self> {
        match depth {
            0 => Ok(Self::None),
            -1 => Ok(Self::Default),
            1..=i64::MAX => u32::try_from(depth)
                .map(Self::Depth)
                .map_err(|_| Error::InvalidDepth(depth)),
            _ => Err(Error::InvalidDepth(depth)),
        }
    }
}

/// Index of a node across all slabs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeId(u32);

struct Node<V> {
    left: Option<NodeId>,
    right: Option<NodeId>,
    parent: Option<NodeId>,
    value: Option<V>,
}

impl<V> Node<V> {
    #[inline]
    fn child(&self, bit: bool) -> Option<NodeId> {
        if bit {
            self.right
        } else {
            self.left
        }
    }

    #[inline]
    fn has_children(&self) -> bool {
        self.left.is_some() || self.right.is_some()
    }
}

/// A longest-prefix-match tree over keys of type `K`, storing `V`.
///
/// The tree borrows its pool; all node memory belongs to the pool. Values are
/// `Copy` because node memory is reclaimed without running destructors.
pub struct RadixTree<'p, K, V, A: RawAlloc = System> {
    pool: &'p Pool<A>,
    root: NodeId,
    /// Recycled nodes, reused before any fresh slab space.
    free: Vec<NodeId>,
    slabs: Vec<NonNull<Node<V>>>,
    slab_bytes: usize,
    slab_align: usize,
    nodes_per_slab: usize,
    /// Fresh nodes left in the newest slab.
    remaining: usize,
    len: usize,
    _key: PhantomData<fn(K) -> K>,
}

/// Tree over 32-bit integer keys.
pub type Radix32Tree<'p, V, A = System> = RadixTree<'p, u32, V, A>;

/// Tree over 128-bit byte-array keys.
pub type Radix128Tree<'p, V, A = System> = RadixTree<'p, [u8; 16], V, A>;

impl<'p, K: RadixKey, V: Copy, A: RawAlloc> RadixTree<'p, K, V, A> {
    /// Create a tree whose nodes come from `pool`.
    pub fn new(pool: &'p Pool<A>, preallocate: Preallocate) -> Result<Self> {
        let node_size = mem::size_of::<Node<V>>();
        let page = pool.page_size();
        let slab_bytes = page.max(node_size).next_multiple_of(page);

        let depth = match preallocate {
            Preallocate::None => 0,
            Preallocate::Default => default_depth(page / node_size),
            Preallocate::Depth(depth) => depth,
        };
        if depth > K::BITS.min(MAX_PREALLOCATE_DEPTH) {
            return Err(Error::InvalidDepth(i64::from(depth)));
        }

        let mut tree = Self {
            pool,
            root: NodeId(0),
            free: Vec::new(),
            slabs: Vec::new(),
            slab_bytes,
            slab_align: page,
            nodes_per_slab: slab_bytes / node_size,
            remaining: 0,
            len: 0,
            _key: PhantomData,
        };
        tree.root = tree.alloc_node(None)?;

        // Level by level: 0, 1, 00, 01, 10, 11, 000, ...
        for level in 1..=depth {
            let mask = K::prefix_mask(level);
            for prefix in 0..(1u64 << level) {
                tree.insert_value(K::from_prefix(prefix, level), mask, None)?;
            }
        }
        if depth > 0 {
            debug!(depth, nodes = tree.node_count(), "radix tree preallocated");
        }

        Ok(tree)
    }

    /// Store `value` at the prefix of `key` selected by `mask`.
    ///
    /// Reports [`Error::Busy`] if the prefix already holds a value (the old
    /// value is kept), and [`Error::Exhausted`] if a node could not be
    /// allocated. Nodes created before an exhaustion stay in the tree.
    pub fn insert(&mut self, key: K, mask: K, value: V) -> Result<()> {
        self.insert_value(key, mask, Some(value))
    }

    fn insert_value(&mut self, key: K, mask: K, value: Option<V>) -> Result<()> {
        let mut node = self.root;
        let mut depth = 0;

        while significant(&mask, depth) {
            match self.node(node).child(key.bit(depth)) {
                Some(next) => {
                    node = next;
                    depth += 1;
                }
                None => break,
            }
        }

        if !significant(&mask, depth) {
            let n = self.node_mut(node);
            if n.value.is_some() {
                return Err(Error::Busy);
            }
            n.value = value;
            if value.is_some() {
                self.len += 1;
            }
            return Ok(());
        }

        while significant(&mask, depth) {
            let next = self.alloc_node(Some(node))?;
            let bit = key.bit(depth);
            let n = self.node_mut(node);
            if bit {
                n.right = Some(next);
            } else {
                n.left = Some(next);
            }
            node = next;
            depth += 1;
        }

        self.node_mut(node).value = value;
        if value.is_some() {
            self.len += 1;
        }
        Ok(())
    }

    /// Remove the value stored at the prefix of `key` selected by `mask`.
    ///
    /// A node that still has children only loses its value. A childless node
    /// is recycled, together with every ancestor left without value or
    /// children; the root is never recycled.
    pub fn delete(&mut self, key: K, mask: K) -> Result<()> {
        let mut node = self.root;
        let mut depth = 0;

        while significant(&mask, depth) {
            node = self
                .node(node)
                .child(key.bit(depth))
                .ok_or(Error::NotFound)?;
            depth += 1;
        }

        let root = self.root;
        let n = self.node_mut(node);
        if n.has_children() || node == root {
            if n.value.take().is_none() {
                return Err(Error::NotFound);
            }
            self.len -= 1;
            return Ok(());
        }

        if n.value.take().is_some() {
            self.len -= 1;
        }

        while let Some(parent) = self.node(node).parent {
            let p = self.node_mut(parent);
            if p.right == Some(node) {
                p.right = None;
            } else {
                p.left = None;
            }
            self.free.push(node);
            trace!(node = node.0, depth, "radix node recycled");

            node = parent;
            depth = depth.saturating_sub(1);
            let n = self.node(node);
            if n.has_children() || n.value.is_some() || n.parent.is_none() {
                break;
            }
        }

        Ok(())
    }

    /// Longest-prefix match: the value of the deepest valued node on the
    /// path of `key`.
    pub fn find(&self, key: K) -> Option<V> {
        let mut value = None;
        let mut node = Some(self.root);
        let mut depth = 0;

        while let Some(id) = node {
            let n = self.node(id);
            if n.value.is_some() {
                value = n.value;
            }
            if depth == K::BITS {
                break;
            }
            node = n.child(key.bit(depth));
            depth += 1;
        }

        value
    }

    /// The value stored at exactly this prefix, ignoring shorter ones.
    pub fn get(&self, key: K, mask: K) -> Option<V> {
        let mut node = self.root;
        let mut depth = 0;
        while significant(&mask, depth) {
            node = self.node(node).child(key.bit(depth))?;
            depth += 1;
        }
        self.node(node).value
    }

    /// Number of stored prefixes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no prefix is stored.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Nodes currently linked into the tree, root included.
    pub fn node_count(&self) -> usize {
        self.slabs.len() * self.nodes_per_slab - self.remaining - self.free.len()
    }

    /// Recycled nodes waiting for reuse.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Slabs obtained from the pool so far.
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// The pool nodes are allocated from.
    pub fn pool(&self) -> &'p Pool<A> {
        self.pool
    }

    fn alloc_node(&mut self, parent: Option<NodeId>) -> Result<NodeId> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => self.bump_node()?,
        };
        // SAFETY: `id` addresses node memory inside one of our slabs.
        unsafe {
            self.node_ptr(id).write(Node {
                left: None,
                right: None,
                parent,
                value: None,
            });
        }
        Ok(id)
    }

    /// Take a fresh node from the newest slab, fetching a slab if needed.
    fn bump_node(&mut self) -> Result<NodeId> {
        if self.remaining == 0 {
            let slab = self.pool.alloc_aligned(self.slab_bytes, self.slab_align)?;
            self.slabs.push(slab.cast());
            self.remaining = self.nodes_per_slab;
            debug!(slab = ?slab, nodes = self.nodes_per_slab, "radix slab");
        }
        let next = self.slabs.len() * self.nodes_per_slab - self.remaining;
        let id = u32::try_from(next).map_err(|_| Error::Exhausted {
            size: mem::size_of::<Node<V>>(),
            align: mem::align_of::<Node<V>>(),
        })?;
        self.remaining -= 1;
        Ok(NodeId(id))
    }

    #[inline]
    fn node_ptr(&self, id: NodeId) -> *mut Node<V> {
        let i = id.0 as usize;
        let slab = self.slabs[i / self.nodes_per_slab];
        // SAFETY: the offset is below `nodes_per_slab`, inside the slab.
        unsafe { slab.as_ptr().add(i % self.nodes_per_slab) }
    }

    #[inline]
    fn node(&self, id: NodeId) -> &Node<V> {
        // SAFETY: ids handed out by `alloc_node` point to initialized nodes
        // that only this tree can reach.
        unsafe { &*self.node_ptr(id) }
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut Node<V> {
        // SAFETY: as in `node`, and `&mut self` makes the access exclusive.
        unsafe { &mut *self.node_ptr(id) }
    }

    /// Check structural invariants, panicking on the first violation.
    #[cfg(test)]
    pub(crate) fn validate(&self) {
        assert!(self.node(self.root).parent.is_none(), "root has a parent");

        let mut stack = vec![(self.root, 0u32)];
        let mut reachable = 0usize;
        let mut valued = 0usize;
        while let Some((id, depth)) = stack.pop() {
            reachable += 1;
            assert!(depth <= K::BITS, "node below the key width");
            assert!(!self.free.contains(&id), "linked node is on the free list");
            let n = self.node(id);
            if n.value.is_some() {
                valued += 1;
            }
            for child in [n.left, n.right].into_iter().flatten() {
                assert_eq!(self.node(child).parent, Some(id), "broken parent link");
                stack.push((child, depth + 1));
            }
        }

        assert_eq!(reachable, self.node_count(), "node accounting");
        assert_eq!(valued, self.len, "value accounting");
    }

    /// Whether any non-root node has neither value nor children.
    #[cfg(test)]
    pub(crate) fn has_dead_leaves(&self) -> bool {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let n = self.node(id);
            if id != self.root && !n.has_children() && n.value.is_none() {
                return true;
            }
            stack.extend([n.left, n.right].into_iter().flatten());
        }
        false
    }
}

impl<K: RadixKey, V: Copy, A: RawAlloc> fmt::Debug for RadixTree<'_, K, V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadixTree")
            .field("key_bits", &K::BITS)
            .field("len", &self.len)
            .field("nodes", &self.node_count())
            .field("free", &self.free.len())
            .field("slabs", &self.slabs.len())
            .finish()
    }
}

#[inline]
fn significant<K: RadixKey>(mask: &K, depth: u32) -> bool {
    depth < K::BITS && mask.bit(depth)
}

/// Depth whose complete subtree fills about one page.
fn default_depth(nodes_per_page: usize) -> u32 {
    match nodes_per_page {
        128 => 6,
        256 => 7,
        _ => 8,
    }
}
