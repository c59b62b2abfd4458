//! # Memory management
//!
//! SV39 page-based virtual-memory architecture for RV64 systems, and
//! everything about memory management, like:
//! - [`frame_allocator`], physical memory as a list of holes
//! - [`slab`], small fixed-size kernel objects carved out of single pages
//! - [`page_table`], the three-level table walk
//! - [`vm`], per-process address spaces and the I/O mapping window
//!
//! The allocators are bundled in [`Mm`], which the virtual memory manager and
//! the process table borrow for every operation that needs memory.

mod address;
mod direct_map;
pub mod frame_allocator;
pub mod page_table;
pub mod slab;
pub mod vm;

pub use address::{round_down, round_up, PhysAddr, PhysPageNum, VirtAddr};
pub use direct_map::DirectMap;
pub use frame_allocator::FrameAllocator;
pub use page_table::{Entry, PTEFlags, PageTable, PageTableEntry};
pub use slab::SlabAllocator;
pub use vm::{AddressSpace, Region, Regions, Vm};

use core::ptr::NonNull;
use thiserror::Error;

/// Failures of the allocators and of the mapping calls.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Zero length, inverted range or an object size the slab cannot serve.
    #[error("invalid argument")]
    InvalidArgument,
    /// No hole or pool large enough.
    #[error("out of memory")]
    OutOfMemory,
    /// The virtual range overlaps a region of the address space.
    #[error("virtual range already mapped")]
    AlreadyMapped,
}

/// Physical memory of the kernel: frames, slab pools and the linear window
/// used to touch both.
pub struct Mm {
    /// Page and byte allocator.
    pub frames: FrameAllocator,
    /// Small object allocator.
    pub slab: SlabAllocator,
    /// Kernel view of physical memory.
    pub map: DirectMap,
}

impl Mm {
    /// Empty allocators over the given direct map.
    pub const fn new(map: DirectMap) -> Self {
        Self {
            frames: FrameAllocator::new(),
            slab: SlabAllocator::new(),
            map,
        }
    }

    /// Allocate `n` zeroed pages.
    pub fn alloc_zeroed_pages(&mut self, n: usize) -> Option<PhysAddr> {
        let (va, pa) = self.frames.valloc_pages(n, self.map)?;
        // SAFETY: the pages were just handed out and are mapped at `va`.
        unsafe { core::ptr::write_bytes(va as *mut u8, 0, n * crate::config::PAGE_SIZE) };
        Some(pa)
    }

    /// Allocate a slab object of `size` bytes.
    ///
    /// # Errors
    /// See [`SlabAllocator::alloc`].
    pub fn slab_alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        self.slab.alloc(&mut self.frames, self.map, size)
    }

    /// Return a slab object allocated with the same `size`.
    pub fn slab_free(&mut self, ptr: NonNull<u8>, size: usize) {
        self.slab.free(self.map, ptr, size);
    }
}
