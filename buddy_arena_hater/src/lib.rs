#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use buddy_arena::{AllocInitError, BuddyArena, Global, Placement};

/// Operations specific to `BuddyArena`.
#[derive(Clone, Debug, arbitrary::Arbitrary)]
pub enum ArenaOp {
    /// Serve subsequent requests from the low end of the arena.
    PreferLow,
    /// Serve subsequent requests from the high end of the arena.
    PreferHigh,
}

pub struct ArenaSubject {
    arena: BuddyArena<Global>,
    placement: Placement,
}

impl ArenaSubject {
    pub fn new(total: usize, used: usize, page: usize) -> Result<Self, AllocInitError> {
        let arena = BuddyArena::try_new(total, used, page)?;

        Ok(ArenaSubject {
            arena,
            placement: Placement::Low,
        })
    }

    pub fn arena(&self) -> &BuddyArena<Global> {
        &self.arena
    }
}

impl Subject for ArenaSubject {
    type Op = ArenaOp;
    type AllocError = buddy_arena::AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        let block = self.arena.allocate(size, self.placement)?;

        // Blocks never overlap the bytes reserved during construction.
        let base = self.arena.base().as_ptr() as usize;
        let ofs = block.cast::<u8>().as_ptr() as usize - base;
        assert!(ofs >= self.arena.reserved(), "block overlaps reserved prefix");
        assert!(ofs + block.len() <= self.arena.size(), "block exceeds arena");

        Ok(block)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, len: usize) {
        unsafe {
            // Reallocation is never supported and must leave the block intact.
            assert!(self.arena.reallocate_in_place(ptr, len).is_err());

            self.arena.deallocate(ptr, len);
        }
    }

    fn handle_custom_op(&mut self, op: ArenaOp) {
        self.placement = match op {
            ArenaOp::PreferLow => Placement::Low,
            ArenaOp::PreferHigh => Placement::High,
        };
    }
}
