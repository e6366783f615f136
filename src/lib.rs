//! A fixed-arena binary-buddy allocator.
//!
//! A [`BuddyArena`] governs a single contiguous region of memory. It divides
//! the region into power-of-two multiples of a page size, hands those blocks
//! out on request and merges them back together when they are released. All
//! bookkeeping lives inside the region itself, so constructing an arena never
//! requires a second allocator.
//!
//! ```
//! use core::ptr::NonNull;
//!
//! use buddy_arena::{BuddyArena, Placement};
//!
//! # fn main() -> Result<(), buddy_arena::AllocInitError> {
//! let mut region = vec![0u8; 4096];
//! let ptr = NonNull::new(region.as_mut_ptr()).unwrap();
//!
//! // SAFETY: `region` outlives the arena and is not accessed while it exists.
//! let mut arena = unsafe { BuddyArena::new_raw(ptr, region.len(), 0, 64)? };
//!
//! let block = arena.allocate(100, Placement::Low).unwrap();
//! assert_eq!(block.len(), 128);
//!
//! unsafe { arena.deallocate(block.cast(), block.len()) };
//! # Ok(())
//! # }
//! ```
//!
//! # Thread safety
//!
//! Arenas do no internal locking. Every mutating operation takes `&mut self`,
//! and sharing an arena between threads is the caller's responsibility.

#![doc(html_root_url = "https://docs.rs/buddy_arena/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by the standard library.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

#[macro_use]
mod macros;

mod arena;
mod base;
mod bitmap;
mod tree;

#[cfg(feature = "sptr")]
mod polyfill;


use core::{alloc::Layout, ptr::NonNull};

pub use crate::{arena::BuddyArena, tree::Placement};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate the
    /// managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when the page size is zero or not a power of
    /// two, or when the region's size overflows the address space.
    InvalidConfig,

    /// The region is smaller than a single page.
    CapacityTooSmall,

    /// The bytes declared as already in use exceed the governed arena.
    UsedExceedsArena,

    /// The arena could not reserve its metadata and pre-used bytes.
    ///
    /// This happens when the arena is too small to hold its own bookkeeping in
    /// addition to the bytes declared as already in use.
    BootstrapFailed,
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

/// Types which provide memory which backs an allocator.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
