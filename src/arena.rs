//! A binary-buddy allocator over a single fixed region.

use core::{alloc::Layout, ptr::NonNull};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    base::BasePtr,
    tree::{BuddyTree, Path, Placement},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

#[inline]
fn log2(x: usize) -> u32 {
    usize::BITS - 1 - x.leading_zeros()
}

/// Validates the page size and capacity and returns the layout of a region
/// with those parameters.
fn region_layout(total: usize, page: usize) -> Result<Layout, AllocInitError> {
    if !page.is_power_of_two() {
        return Err(AllocInitError::InvalidConfig);
    }

    if total < page {
        return Err(AllocInitError::CapacityTooSmall);
    }

    Layout::from_size_align(total, page).map_err(|_| AllocInitError::InvalidConfig)
}

/// A binary-buddy allocator governing one contiguous region of memory.
///
/// The region is divided into a tree of power-of-two blocks, from a single
/// block spanning `page_size() << depth()` bytes down to single pages. The
/// tree's bookkeeping is stored inside the region, directly after the bytes
/// the caller declared as already used, and both are reserved before the
/// arena accepts any requests.
///
/// Bytes past `page_size() << depth()` are never handed out.
///
/// Arenas do not track the length of their allocations; blocks must be
/// released with exactly the length they were granted.
#[derive(Debug)]
pub struct BuddyArena<A: BackingAllocator> {
    parts: BuddyArenaParts,
    region_layout: Layout,
    backing_allocator: A,
}

impl BuddyArena<Raw> {
    /// Constructs a new `BuddyArena` from a raw pointer.
    ///
    /// The arena governs the largest power-of-two multiple of `page` bytes at
    /// the start of the region. Its first `used` bytes are left untouched and
    /// are never handed out, and the tree metadata is placed right after them.
    ///
    /// # Errors
    ///
    /// - [`AllocInitError::InvalidConfig`] if `page` is not a power of two.
    /// - [`AllocInitError::CapacityTooSmall`] if `total < page`.
    /// - [`AllocInitError::UsedExceedsArena`] if `used` exceeds the governed
    ///   size.
    /// - [`AllocInitError::BootstrapFailed`] if the governed size cannot hold
    ///   `used` bytes plus the tree metadata.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `total` bytes.
    /// - The memory in `region[used..total]` must not be accessed except
    ///   through blocks allocated by the arena for as long as it exists.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        total: usize,
        used: usize,
        page: usize,
    ) -> Result<BuddyArena<Raw>, AllocInitError> {
        let region_layout = region_layout(total, page)?;

        unsafe {
            BuddyArenaParts::new(region, total, used, page)
                .map(|parts| parts.with_backing_allocator(Raw, region_layout))
        }
    }

    /// Decomposes the arena into the pointer it was constructed from.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is called;
    /// the returned region pointer becomes the sole owner of the region that
    /// was used to construct the arena.
    pub unsafe fn into_raw_parts(self) -> NonNull<u8> {
        self.parts.base.ptr()
    }
}

#[cfg(any(feature = "alloc", test))]
impl BuddyArena<Global> {
    /// Constructs a new `BuddyArena` over `total` bytes obtained from the
    /// global allocator.
    ///
    /// The region is aligned to `page`. Its first `used` bytes are reserved
    /// and never handed out.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`BuddyArena::new_raw`], or
    /// [`AllocInitError::AllocFailed`] if the region could not be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(
        total: usize,
        used: usize,
        page: usize,
    ) -> Result<BuddyArena<Global>, AllocInitError> {
        let region_layout = region_layout(total, page)?;

        unsafe {
            // SAFETY: `region_layout` has a nonzero size, as `total >= page > 0`.
            let region = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            match BuddyArenaParts::new(region, total, used, page) {
                Ok(parts) => Ok(parts.with_backing_allocator(Global, region_layout)),
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> Drop for BuddyArena<A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.parts.base.ptr(), self.region_layout)
        };
    }
}

impl<A: BackingAllocator> BuddyArena<A> {
    /// Returns a pointer to the start of the region.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.parts.base.ptr()
    }

    /// Returns the size of the smallest block the arena hands out.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.parts.page
    }

    /// Returns the number of times the arena's root block can be halved.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.parts.depth
    }

    /// Returns the number of bytes governed by the arena.
    ///
    /// This is `page_size() << depth()`, and may be less than the size of the
    /// region passed to the constructor.
    #[inline]
    pub fn size(&self) -> usize {
        self.parts.size()
    }

    /// Returns the number of bytes the tree metadata occupies in the region.
    #[inline]
    pub fn metadata_size(&self) -> usize {
        self.parts.metadata_size
    }

    /// Returns the number of bytes reserved at the start of the region during
    /// construction.
    ///
    /// This covers the bytes declared as used plus the tree metadata, rounded
    /// up to whole pages.
    #[inline]
    pub fn reserved(&self) -> usize {
        self.parts.reserved
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] whose length is the granted
    /// size: the smallest power-of-two multiple of the page size that holds
    /// `size` bytes. A `size` of zero is granted one page. The same length must
    /// be passed to [`deallocate`](Self::deallocate).
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` exceeds [`size()`](Self::size) or no suitable
    /// block is free.
    pub fn allocate(&mut self, size: usize, placement: Placement) -> Result<NonNull<[u8]>, AllocError> {
        self.parts.allocate(size, placement)
    }

    /// Deallocates the block at `ptr`, merging it with its free buddies.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this arena, and `len`
    /// must be the length it was granted. Debug builds check this; release
    /// builds do not.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, len: usize) {
        unsafe { self.parts.deallocate(ptr, len) }
    }

    /// Attempts to resize the block at `ptr`, moving it if necessary.
    ///
    /// Reallocation is not supported; this always returns `Err` and leaves the
    /// block untouched. Callers should allocate a new block, copy, and release
    /// the old one instead.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this arena, and `len`
    /// must be the length it was granted.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, len: usize) -> Result<NonNull<[u8]>, AllocError> {
        let _ = (ptr, len);
        Err(AllocError)
    }

    /// Attempts to resize the block at `ptr` without moving it.
    ///
    /// Reallocation is not supported; this always returns `Err` and leaves the
    /// block untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this arena, and `len`
    /// must be the length it was granted.
    pub unsafe fn reallocate_in_place(&mut self, ptr: NonNull<u8>, len: usize) -> Result<usize, AllocError> {
        let _ = (ptr, len);
        Err(AllocError)
    }

    #[cfg(test)]
    pub(crate) fn tree(&self) -> &BuddyTree {
        &self.parts.tree
    }
}

/// Like a `BuddyArena`, but without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter because this struct can be
/// moved out of, while `BuddyArena` itself cannot.
#[derive(Debug)]
struct BuddyArenaParts {
    base: BasePtr,
    tree: BuddyTree,
    page: usize,
    depth: u32,
    metadata_size: usize,
    reserved: usize,
}

impl BuddyArenaParts {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
        region_layout: Layout,
    ) -> BuddyArena<A> {
        BuddyArena {
            parts: self,
            region_layout,
            backing_allocator,
        }
    }

    /// Lays out and bootstraps an arena in `region`.
    ///
    /// # Safety
    ///
    /// See [`BuddyArena::new_raw`]. `page` must be a power of two no larger
    /// than `total`.
    unsafe fn new(
        region: NonNull<u8>,
        total: usize,
        used: usize,
        page: usize,
    ) -> Result<BuddyArenaParts, AllocInitError> {
        debug_assert!(page.is_power_of_two() && page <= total);

        let base = BasePtr::new(region, total).ok_or(AllocInitError::InvalidConfig)?;

        let depth = log2(total) - log2(page);
        let size = page << depth;

        if size < used {
            warn!(
                "buddy arena: {} used bytes exceed arena of {} bytes",
                used, size
            );
            return Err(AllocInitError::UsedExceedsArena);
        }

        let metadata_size = BuddyTree::size_for_depth(depth).ok_or(AllocInitError::InvalidConfig)?;
        let to_reserve = match used.checked_add(metadata_size) {
            Some(n) if n <= size => n,
            _ => {
                warn!(
                    "buddy arena: {} used bytes and {} metadata bytes do not fit in {} bytes",
                    used, metadata_size, size
                );
                return Err(AllocInitError::BootstrapFailed);
            }
        };

        let tree_ptr = base.with_offset(used).ok_or(AllocInitError::InvalidConfig)?;
        let tree = unsafe { BuddyTree::new(depth, tree_ptr, metadata_size) };

        let mut parts = BuddyArenaParts {
            base,
            tree,
            page,
            depth,
            metadata_size,
            reserved: 0,
        };

        if !parts.reserve_prefix(to_reserve) {
            warn!("buddy arena: failed to reserve {} bytes", to_reserve);
            return Err(AllocInitError::BootstrapFailed);
        }

        debug!(
            "buddy arena: region={:#x} size={:#x} page={:#x} depth={} reserved={:#x}",
            base.addr(),
            size,
            page,
            depth,
            parts.reserved
        );

        Ok(parts)
    }

    #[inline]
    fn size(&self) -> usize {
        self.page << self.depth
    }

    /// Returns the smallest `e` such that `page << e >= size`, or `None` if
    /// that block would exceed the arena.
    fn exponent_for(&self, size: usize) -> Option<u32> {
        if size <= self.page {
            return Some(0);
        }

        let pages = (size - 1) / self.page + 1;
        let exp = pages.checked_next_power_of_two()?.trailing_zeros();

        (exp <= self.depth).then(|| exp)
    }

    /// Reserves `amount` bytes at the start of the arena.
    ///
    /// The bytes are covered by a run of blocks of decreasing size, one per
    /// set bit of `amount` rounded up to whole pages. Each block's exponent is
    /// strictly smaller than the last, so this takes at most `depth + 1`
    /// allocations.
    fn reserve_prefix(&mut self, amount: usize) -> bool {
        let mut remaining = amount;

        for _ in 0..=self.depth {
            if remaining == 0 {
                break;
            }

            let exp = match self.exponent_for(remaining) {
                Some(e) => e,
                None => return false,
            };

            let request = if exp == 0 || self.page << exp == remaining {
                self.page << exp
            } else {
                self.page << (exp - 1)
            };

            let block = match self.allocate(request, Placement::Low) {
                Ok(b) if b.len() == request => b,
                _ => return false,
            };

            debug_assert_eq!(
                self.base.offset_to(block.cast::<u8>().addr()),
                self.reserved,
                "reserved blocks must be contiguous"
            );

            self.reserved += request;
            remaining = remaining.saturating_sub(request);
        }

        remaining == 0
    }

    fn allocate(&mut self, size: usize, placement: Placement) -> Result<NonNull<[u8]>, AllocError> {
        let exp = self.exponent_for(size).ok_or(AllocError)?;
        let target_level = self.depth - exp;

        let mut path = self
            .tree
            .find_free(target_level, placement)
            .ok_or(AllocError)?;

        // Split the free block down to the requested size, keeping the half
        // on the preferred side.
        while path.level() < target_level {
            self.tree.split_node(path);

            path = match placement {
                Placement::Low => {
                    self.tree.free_node(path.right());
                    path.left()
                }
                Placement::High => {
                    self.tree.free_node(path.left());
                    path.right()
                }
            };
        }

        self.tree.alloc_node(path);
        if target_level < self.depth {
            self.tree.free_node(path.left());
            self.tree.free_node(path.right());
        }

        let block_size = self.page << exp;
        let offset = path.index() * block_size;

        trace!(
            "buddy arena: allocated {:#x} bytes at offset {:#x}",
            block_size,
            offset
        );

        // The block lies within the arena by construction.
        self.base
            .with_offset_and_size(offset, block_size)
            .ok_or(AllocError)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, len: usize) {
        let exp = match self.exponent_for(len) {
            Some(e) => e,
            None => {
                debug_assert!(false, "deallocated length exceeds the arena");
                return;
            }
        };

        let block_size = self.page << exp;
        let offset = self.base.offset_to(ptr.addr());
        debug_assert_eq!(offset % block_size, 0, "misaligned block");

        let mut path = Path::new(self.depth - exp, offset / block_size);
        debug_assert!(
            self.tree.is_allocated(path),
            "deallocated block is not currently allocated"
        );

        trace!(
            "buddy arena: freeing {:#x} bytes at offset {:#x}",
            block_size,
            offset
        );

        self.tree.free_node(path);

        // Coalesce with free buddies as far up the tree as possible.
        while let (Some(parent), Some(sibling)) = (path.parent(), path.sibling()) {
            if self.tree.is_committed(sibling) {
                break;
            }

            self.tree.free_node(parent);
            path = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    fn offset_of(arena: &BuddyArena<Global>, block: NonNull<[u8]>) -> usize {
        block.cast::<u8>().addr().get() - arena.base().addr().get()
    }

    #[test]
    fn rejects_bad_configs() {
        assert_eq!(
            BuddyArena::try_new(128, 0, 24).unwrap_err(),
            AllocInitError::InvalidConfig
        );
        assert_eq!(
            BuddyArena::try_new(128, 0, 0).unwrap_err(),
            AllocInitError::InvalidConfig
        );
        assert_eq!(
            BuddyArena::try_new(8, 0, 16).unwrap_err(),
            AllocInitError::CapacityTooSmall
        );
        assert_eq!(
            BuddyArena::try_new(200, 129, 16).unwrap_err(),
            AllocInitError::UsedExceedsArena
        );
        // 128 used bytes leave no room for the tree.
        assert_eq!(
            BuddyArena::try_new(200, 128, 16).unwrap_err(),
            AllocInitError::BootstrapFailed
        );
        // 15 used bytes plus 2 metadata bytes overflow the single page.
        assert_eq!(
            BuddyArena::try_new(16, 15, 16).unwrap_err(),
            AllocInitError::BootstrapFailed
        );
    }

    #[test]
    fn depth_is_maximal() {
        for total in [16, 17, 31, 32, 100, 128, 1000, 4096, 5000] {
            let arena = BuddyArena::try_new(total, 0, 16).unwrap();
            assert!(arena.size() <= total);
            assert!(arena.size() << 1 > total);
            assert_eq!(arena.size(), 16 << arena.depth());
        }
    }

    #[test]
    fn size_is_rounded_up() {
        let mut arena = BuddyArena::try_new(4096, 0, 16).unwrap();

        for (request, granted) in [(0, 16), (1, 16), (16, 16), (17, 32), (100, 128), (1024, 1024)] {
            let block = arena.allocate(request, Placement::Low).unwrap();
            assert_eq!(block.len(), granted);
            unsafe { arena.deallocate(block.cast(), block.len()) };
        }
    }

    #[test]
    fn oversized_requests_fail() {
        let mut arena = BuddyArena::try_new(128, 0, 16).unwrap();

        assert_eq!(arena.allocate(129, Placement::Low), Err(AllocError));
        assert_eq!(arena.allocate(usize::MAX, Placement::High), Err(AllocError));

        let block = arena.allocate(16, Placement::Low).unwrap();
        assert_eq!(arena.allocate(129, Placement::Low), Err(AllocError));
        unsafe { arena.deallocate(block.cast(), block.len()) };
        assert_eq!(arena.allocate(129, Placement::Low), Err(AllocError));
    }

    #[test]
    fn metadata_is_reserved() {
        // page = 16, total = 128: depth 3, 15 nodes, 4 bytes of metadata.
        let mut arena = BuddyArena::try_new(128, 0, 16).unwrap();
        assert_eq!(arena.depth(), 3);
        assert_eq!(arena.metadata_size(), 4);
        assert_eq!(arena.reserved(), 16);

        // The first page holds the tree, and the whole arena is unavailable.
        assert_eq!(arena.allocate(128, Placement::Low), Err(AllocError));

        let block = arena.allocate(16, Placement::Low).unwrap();
        assert_eq!(offset_of(&arena, block), 16);
    }

    #[test]
    fn irregular_used_prefix() {
        let mut arena = BuddyArena::try_new(256, 8, 16).unwrap();
        assert_eq!(arena.reserved(), 16);
        let block = arena.allocate(16, Placement::Low).unwrap();
        assert_eq!(offset_of(&arena, block), 16);

        // 100 used bytes plus 32 metadata bytes are covered by 128 + 16.
        let mut arena = BuddyArena::try_new(1024, 100, 16).unwrap();
        assert_eq!(arena.metadata_size(), 32);
        assert_eq!(arena.reserved(), 144);

        let block = arena.allocate(16, Placement::Low).unwrap();
        assert_eq!(offset_of(&arena, block), 144);
    }

    #[test]
    fn exact_power_of_two_prefix() {
        // 60 used bytes plus 4 metadata bytes are exactly one 64-byte block.
        let mut arena = BuddyArena::try_new(128, 60, 16).unwrap();
        assert_eq!(arena.reserved(), 64);

        let block = arena.allocate(64, Placement::Low).unwrap();
        assert_eq!(offset_of(&arena, block), 64);
        assert_eq!(arena.allocate(16, Placement::Low), Err(AllocError));
    }

    #[test]
    fn buddies_merge_only_when_both_free() {
        let mut arena = BuddyArena::try_new(128, 0, 16).unwrap();

        // Fill every page after the reserved one.
        let pages: Vec<_> = (0..7)
            .map(|_| arena.allocate(16, Placement::Low).unwrap())
            .collect();
        let offsets: Vec<_> = pages.iter().map(|&p| offset_of(&arena, p)).collect();
        assert_eq!(offsets, [16, 32, 48, 64, 80, 96, 112]);
        assert_eq!(arena.allocate(16, Placement::Low), Err(AllocError));

        // Free the page at 32; its buddy at 48 is still allocated.
        unsafe { arena.deallocate(pages[1].cast(), 16) };
        assert_eq!(arena.allocate(32, Placement::Low), Err(AllocError));

        unsafe { arena.deallocate(pages[2].cast(), 16) };
        let merged = arena.allocate(32, Placement::Low).unwrap();
        assert_eq!(offset_of(&arena, merged), 32);
        assert_eq!(merged.len(), 32);
    }

    #[test]
    fn coalescing_is_transitive() {
        let mut arena = BuddyArena::try_new(256, 0, 16).unwrap();

        let blocks: Vec<_> = (0..4)
            .map(|_| arena.allocate(32, Placement::High).unwrap())
            .collect();
        let offsets: Vec<_> = blocks.iter().map(|&b| offset_of(&arena, b)).collect();
        assert_eq!(offsets, [224, 192, 160, 128]);

        for block in blocks {
            unsafe { arena.deallocate(block.cast(), block.len()) };
        }

        let half = arena.allocate(128, Placement::Low).unwrap();
        assert_eq!(offset_of(&arena, half), 128);
    }

    #[test]
    fn placement_orders_addresses() {
        let mut arena = BuddyArena::try_new(1024, 0, 16).unwrap();
        let mut last = 0;
        while let Ok(block) = arena.allocate(16, Placement::Low) {
            let ofs = offset_of(&arena, block);
            assert!(ofs >= last);
            last = ofs;
        }

        let mut arena = BuddyArena::try_new(1024, 0, 16).unwrap();
        let mut last = usize::MAX;
        while let Ok(block) = arena.allocate(16, Placement::High) {
            let ofs = offset_of(&arena, block);
            assert!(ofs <= last);
            last = ofs;
        }
        assert_eq!(last, arena.reserved());
    }

    #[test]
    fn reallocation_is_unsupported() {
        let mut arena = BuddyArena::try_new(256, 0, 16).unwrap();
        let block = arena.allocate(32, Placement::Low).unwrap();

        unsafe {
            assert_eq!(arena.reallocate(block.cast(), block.len()), Err(AllocError));
            assert_eq!(
                arena.reallocate_in_place(block.cast(), block.len()),
                Err(AllocError)
            );

            // The block is still allocated and can be released normally.
            arena.deallocate(block.cast(), block.len());
        }
    }

    #[test]
    fn raw_region_round_trip() {
        let mut region = std::vec![0u8; 512];
        let ptr = NonNull::new(region.as_mut_ptr()).unwrap();

        let mut arena = unsafe { BuddyArena::new_raw(ptr, region.len(), 32, 32).unwrap() };
        assert_eq!(arena.base(), ptr);

        let block = arena.allocate(64, Placement::High).unwrap();
        unsafe {
            block.cast::<u8>().as_ptr().write_bytes(0x5A, block.len());
            arena.deallocate(block.cast(), block.len());
        }

        let reclaimed = unsafe { arena.into_raw_parts() };
        assert_eq!(reclaimed, ptr);

        // The caller's prefix is left untouched.
        assert!(region[..32].iter().all(|&b| b == 0));
        assert!(region[448..].iter().all(|&b| b == 0x5A));
    }
}
