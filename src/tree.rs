//! The buddy status tree.
//!
//! A complete binary tree with one node per power-of-two block of the arena.
//! Level 0 is the whole arena and level `depth` holds single pages. The tree
//! knows nothing about bytes; it works purely with `(level, index)`
//! coordinates.
//!
//! Each node is in one of three states:
//! - free: available as a whole block,
//! - allocated: handed out as a whole block,
//! - split: divided into two children, at least one of which is in use.
//!
//! Allocated and split nodes are both *committed*. Only the children of split
//! nodes are meaningful; the search never descends into any other node.

use core::{fmt, ptr::NonNull};

use crate::bitmap::Bitmap;

/// Which end of the arena an allocation should favor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    /// Prefer the block covering the lowest addresses.
    Low,
    /// Prefer the block covering the highest addresses.
    High,
}

/// The coordinate of a single node in the tree.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    level: u32,
    index: usize,
}

impl Path {
    /// The path to the root node, which spans the whole arena.
    pub const ROOT: Path = Path { level: 0, index: 0 };

    /// Reconstructs a path from its level and its index within that level.
    #[inline]
    pub fn new(level: u32, index: usize) -> Path {
        debug_assert!(level < usize::BITS);
        debug_assert!(index < 1 << level, "index out of range for level");

        Path { level, index }
    }

    #[inline]
    pub fn level(self) -> u32 {
        self.level
    }

    /// Returns the index of the node within its level.
    #[inline]
    pub fn index(self) -> usize {
        self.index
    }

    /// Returns the position of the node in a flat, level-ordered layout of
    /// the whole tree.
    #[inline]
    fn flat(self) -> usize {
        (1 << self.level) - 1 + self.index
    }

    #[inline]
    pub fn parent(self) -> Option<Path> {
        let level = self.level.checked_sub(1)?;

        Some(Path {
            level,
            index: self.index >> 1,
        })
    }

    #[inline]
    pub fn left(self) -> Path {
        Path {
            level: self.level + 1,
            index: self.index << 1,
        }
    }

    #[inline]
    pub fn right(self) -> Path {
        Path {
            level: self.level + 1,
            index: (self.index << 1) | 1,
        }
    }

    /// Returns the buddy of this node, or `None` for the root.
    #[inline]
    pub fn sibling(self) -> Option<Path> {
        (self.level > 0).then(|| Path {
            level: self.level,
            index: self.index ^ 1,
        })
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({}, {})", self.level, self.index)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum NodeState {
    Free,
    Allocated,
    Split,
}

/// Per-node allocation state for a tree of `depth + 1` levels.
///
/// The state lives in two bitmaps placed back to back in memory borrowed
/// from the arena: one bit marking committed nodes, one bit marking split
/// nodes.
pub struct BuddyTree {
    depth: u32,
    committed: Bitmap,
    split: Bitmap,
}

impl BuddyTree {
    /// Returns the number of nodes in a tree of the given depth.
    #[inline]
    pub fn num_nodes(depth: u32) -> Option<usize> {
        let levels = depth.checked_add(1)?;
        let width = 1_usize.checked_shl(levels)?;

        Some(width - 1)
    }

    /// Returns the number of bytes of metadata needed by a tree of the given
    /// depth, or `None` if it overflows a `usize`.
    pub fn size_for_depth(depth: u32) -> Option<usize> {
        let num_nodes = Self::num_nodes(depth)?;

        Bitmap::map_size(num_nodes).checked_mul(2)
    }

    /// Constructs a tree of the given depth in `map`, with every node free.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `map` must be valid for reads and writes for `len` bytes.
    /// - No other pointer may access those bytes while the tree exists.
    ///
    /// # Panics
    ///
    /// Panics if `len` is smaller than `BuddyTree::size_for_depth(depth)`.
    pub unsafe fn new(depth: u32, map: NonNull<u8>, len: usize) -> BuddyTree {
        let num_nodes = Self::num_nodes(depth).expect("tree depth overflows usize");
        let size = Self::size_for_depth(depth).expect("tree size overflows usize");
        assert!(len >= size, "tree metadata region is too small");

        let map_size = Bitmap::map_size(num_nodes);

        unsafe {
            // SAFETY: `map` spans at least `2 * map_size` bytes.
            let split_map = NonNull::new_unchecked(map.as_ptr().add(map_size));

            BuddyTree {
                depth,
                committed: Bitmap::new(num_nodes, map),
                split: Bitmap::new(num_nodes, split_map),
            }
        }
    }

    #[inline]
    fn state(&self, path: Path) -> NodeState {
        debug_assert!(path.level <= self.depth);

        let flat = path.flat();
        match (self.committed.get(flat), self.split.get(flat)) {
            (false, _) => NodeState::Free,
            (true, false) => NodeState::Allocated,
            (true, true) => NodeState::Split,
        }
    }

    #[inline]
    fn set_state(&mut self, path: Path, state: NodeState) {
        debug_assert!(path.level <= self.depth);

        let flat = path.flat();
        self.committed.set(flat, state != NodeState::Free);
        self.split.set(flat, state == NodeState::Split);
    }

    /// Returns `true` if the node is allocated or split.
    #[inline]
    pub fn is_committed(&self, path: Path) -> bool {
        self.state(path) != NodeState::Free
    }

    /// Returns `true` if the node was handed out as a whole block.
    #[inline]
    pub fn is_allocated(&self, path: Path) -> bool {
        self.state(path) == NodeState::Allocated
    }

    /// Marks a node as handed out as a whole block.
    #[inline]
    pub fn alloc_node(&mut self, path: Path) {
        self.set_state(path, NodeState::Allocated);
    }

    /// Marks a node as divided into its two children.
    #[inline]
    pub fn split_node(&mut self, path: Path) {
        debug_assert!(path.level < self.depth, "cannot split a page-level node");

        self.set_state(path, NodeState::Split);
    }

    #[inline]
    pub fn free_node(&mut self, path: Path) {
        self.set_state(path, NodeState::Free);
    }

    /// Searches for a free node no deeper than `target_level`.
    ///
    /// The search only visits nodes reachable from the root through split
    /// nodes. The first free node found in address order (or reverse address
    /// order, for [`Placement::High`]) is returned; it may be shallower than
    /// `target_level`, in which case the caller is expected to split it.
    pub fn find_free(&self, target_level: u32, placement: Placement) -> Option<Path> {
        debug_assert!(target_level <= self.depth);

        self.find_free_from(Path::ROOT, target_level, placement)
    }

    fn find_free_from(&self, path: Path, target_level: u32, placement: Placement) -> Option<Path> {
        match self.state(path) {
            NodeState::Free => Some(path),
            NodeState::Allocated => None,
            NodeState::Split if path.level >= target_level => None,
            NodeState::Split => {
                let (first, second) = match placement {
                    Placement::Low => (path.left(), path.right()),
                    Placement::High => (path.right(), path.left()),
                };

                self.find_free_from(first, target_level, placement)
                    .or_else(|| self.find_free_from(second, target_level, placement))
            }
        }
    }
}

impl fmt::Debug for BuddyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyTree")
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    struct VecTree {
        tree: BuddyTree,
        // Backing storage for `tree`; never accessed directly.
        _map: Vec<u8>,
    }

    impl VecTree {
        fn new(depth: u32) -> VecTree {
            let size = BuddyTree::size_for_depth(depth).unwrap();
            let mut map = std::vec![0xAA; size];
            let ptr = NonNull::new(map.as_mut_ptr()).unwrap();
            let tree = unsafe { BuddyTree::new(depth, ptr, size) };

            VecTree { tree, _map: map }
        }
    }

    #[test]
    fn navigation() {
        let p = Path::new(2, 1);

        assert_eq!(p.parent(), Some(Path::new(1, 0)));
        assert_eq!(p.sibling(), Some(Path::new(2, 0)));
        assert_eq!(p.left(), Path::new(3, 2));
        assert_eq!(p.right(), Path::new(3, 3));
        assert_eq!(p.left().parent(), Some(p));
        assert_eq!(p.right().sibling(), Some(p.left()));

        assert_eq!(Path::ROOT.parent(), None);
        assert_eq!(Path::ROOT.sibling(), None);
    }

    #[test]
    fn flat_indices_are_dense() {
        let depth = 4;
        let mut seen = Vec::new();
        for level in 0..=depth {
            for index in 0..(1 << level) {
                seen.push(Path::new(level, index).flat());
            }
        }

        let expected: Vec<usize> = (0..BuddyTree::num_nodes(depth).unwrap()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn size_for_depth() {
        // 1 node.
        assert_eq!(BuddyTree::size_for_depth(0), Some(2));
        // 15 nodes.
        assert_eq!(BuddyTree::size_for_depth(3), Some(4));
        // 31 nodes.
        assert_eq!(BuddyTree::size_for_depth(4), Some(8));
        assert_eq!(BuddyTree::size_for_depth(usize::BITS), None);
    }

    #[test]
    fn fresh_tree_offers_root() {
        let t = VecTree::new(3);

        assert!(!t.tree.is_committed(Path::ROOT));
        assert_eq!(t.tree.find_free(3, Placement::Low), Some(Path::ROOT));
        assert_eq!(t.tree.find_free(0, Placement::High), Some(Path::ROOT));
    }

    #[test]
    fn search_honors_placement() {
        let mut t = VecTree::new(2);
        let tree = &mut t.tree;

        tree.split_node(Path::ROOT);
        tree.free_node(Path::new(1, 0));
        tree.free_node(Path::new(1, 1));

        assert_eq!(tree.find_free(2, Placement::Low), Some(Path::new(1, 0)));
        assert_eq!(tree.find_free(2, Placement::High), Some(Path::new(1, 1)));
    }

    #[test]
    fn search_skips_allocated_subtrees() {
        let mut t = VecTree::new(2);
        let tree = &mut t.tree;

        tree.split_node(Path::ROOT);
        tree.alloc_node(Path::new(1, 0));
        tree.free_node(Path::new(1, 1));

        // Children of an allocated node are never offered, even if free.
        tree.free_node(Path::new(2, 0));
        tree.free_node(Path::new(2, 1));

        assert_eq!(tree.find_free(2, Placement::Low), Some(Path::new(1, 1)));

        tree.alloc_node(Path::new(1, 1));
        assert_eq!(tree.find_free(2, Placement::Low), None);
        assert_eq!(tree.find_free(2, Placement::High), None);
    }

    #[test]
    fn search_stops_at_target_level() {
        let mut t = VecTree::new(2);
        let tree = &mut t.tree;

        tree.split_node(Path::ROOT);
        tree.split_node(Path::new(1, 0));
        tree.alloc_node(Path::new(2, 0));
        tree.free_node(Path::new(2, 1));
        tree.alloc_node(Path::new(1, 1));

        // A page is available, but nothing of level 1 or larger.
        assert_eq!(tree.find_free(1, Placement::Low), None);
        assert_eq!(tree.find_free(2, Placement::Low), Some(Path::new(2, 1)));
    }

    #[test]
    fn committed_states() {
        let mut t = VecTree::new(1);
        let tree = &mut t.tree;

        tree.split_node(Path::ROOT);
        assert!(tree.is_committed(Path::ROOT));
        assert!(!tree.is_allocated(Path::ROOT));

        tree.alloc_node(Path::ROOT);
        assert!(tree.is_committed(Path::ROOT));
        assert!(tree.is_allocated(Path::ROOT));

        tree.free_node(Path::ROOT);
        assert!(!tree.is_committed(Path::ROOT));
    }
}
