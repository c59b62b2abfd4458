//! The kernel's linear view of physical memory.
//!
//! Every physical page the allocators hand out is reachable at
//! `pa + offset` in the kernel address space. Page-table pages, slab pools,
//! region records and process memory are all read and written through it.

use super::{PageTableEntry, PhysAddr, PhysPageNum};
use crate::config::PTES_PER_PAGE;

/// `va = pa + offset` translation for kernel accesses to physical memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    /// # Safety
    /// Every physical address the allocators manage must be mapped, readable
    /// and writable at `pa + offset` for as long as this map is used.
    pub const unsafe fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Kernel virtual address of `pa`.
    pub fn va(self, pa: PhysAddr) -> usize {
        pa.0.wrapping_add(self.offset)
    }

    /// Physical address behind the kernel virtual address `va`.
    pub fn pa(self, va: usize) -> PhysAddr {
        PhysAddr(va.wrapping_sub(self.offset))
    }

    /// `len` bytes starting at `pa`.
    pub fn bytes(self, pa: PhysAddr, len: usize) -> &'static mut [u8] {
        // SAFETY: guaranteed by the contract of `DirectMap::new`.
        unsafe { core::slice::from_raw_parts_mut(self.va(pa) as *mut u8, len) }
    }

    /// The page `ppn` seen as a page-table level.
    pub fn pte_array(self, ppn: PhysPageNum) -> &'static mut [PageTableEntry] {
        let pa: PhysAddr = ppn.into();
        // SAFETY: page-table pages are page aligned and `PageTableEntry` is a
        // plain `usize`.
        unsafe {
            core::slice::from_raw_parts_mut(self.va(pa) as *mut PageTableEntry, PTES_PER_PAGE)
        }
    }

    /// A `T` stored at `pa`.
    ///
    /// # Safety
    /// `pa` must be suitably aligned for `T` and hold a valid `T`, and no
    /// other reference to it may be live.
    pub unsafe fn as_mut<T>(self, pa: PhysAddr) -> &'static mut T {
        unsafe { &mut *(self.va(pa) as *mut T) }
    }

    /// Copy `len` bytes from physical `src` to physical `dst`.
    pub fn copy(self, dst: PhysAddr, src: PhysAddr, len: usize) {
        // SAFETY: both ranges are managed memory; callers never overlap them.
        unsafe {
            core::ptr::copy_nonoverlapping(self.va(src) as *const u8, self.va(dst) as *mut u8, len);
        }
    }
}
