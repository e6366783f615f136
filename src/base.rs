use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

#[cfg(feature = "sptr")]
use crate::polyfill::NonNullStrict;

/// A pointer to the base of the region of memory governed by an arena.
///
/// Every pointer handed out by the arena is derived from this one, so that
/// all blocks share the provenance of the original region.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`. Returns `None` if
    /// the end of the region would overflow the address space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[inline]
    pub fn limit(self) -> usize {
        self.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.addr() <= addr && addr.get() < self.limit()
    }

    /// Calculates the offset from `self` to `block`.
    #[inline]
    pub fn offset_to(self, block: NonZeroUsize) -> usize {
        debug_assert!(self.contains_addr(block));

        block.get() - self.addr().get()
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> Option<NonNull<u8>> {
        let raw = self.addr().get().checked_add(offset)?;
        let addr = NonZeroUsize::new(raw)?;

        debug_assert!(self.contains_addr(addr));

        Some(self.ptr.with_addr(addr))
    }

    /// Creates a slice pointer of `len` bytes starting `offset` bytes past
    /// the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset_and_size(self, offset: usize, len: usize) -> Option<NonNull<[u8]>> {
        debug_assert!(offset.checked_add(len).map_or(false, |end| end <= self.extent));

        let ptr = self.with_offset(offset)?;
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len);

        NonNull::new(raw_slice)
    }
}
