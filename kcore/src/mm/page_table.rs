//! Implementation of [`PageTableEntry`] and [`PageTable`].
//!
//! A [`PageTable`] is a view over a tree of page-table pages rooted at a
//! directory page. It does not own the pages: address spaces do.

use super::{DirectMap, FrameAllocator, MemError, PhysAddr, PhysPageNum, VirtAddr};
use crate::config::PAGE_SIZE;
use bitflags::bitflags;
use log::trace;

bitflags! {
    /// [`PageTableEntry`] flags
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PTEFlags: u8 {
        /// Valid
        const V = 1 << 0;
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User accessible
        const U = 1 << 4;
        /// Global
        const G = 1 << 5;
        /// Accessed
        const A = 1 << 6;
        /// Dirty
        const D = 1 << 7;
    }
}

impl PTEFlags {
    /// Pointer to the next level.
    pub const TABLE: Self = Self::V;
    /// User page, readable, writable and executable.
    pub const PROT_EXEC_WRITE: Self = Self::V
        .union(Self::A)
        .union(Self::D)
        .union(Self::U)
        .union(Self::R)
        .union(Self::W)
        .union(Self::X);
    /// Kernel-only data page.
    pub const PROT_KERNEL: Self = Self::V
        .union(Self::R)
        .union(Self::W)
        .union(Self::A)
        .union(Self::D);
    /// Kernel-only page that may also hold code.
    pub const PROT_KERNEL_EXEC: Self = Self::PROT_KERNEL.union(Self::X);
}

/// Page Table Entry
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PageTableEntry {
    bits: usize,
}

/// What a [`PageTableEntry`] holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    /// Not present.
    Absent,
    /// Present, points to the next level.
    Table(PhysPageNum),
    /// Present, maps a frame.
    Leaf(PhysPageNum, PTEFlags),
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PTE({:?})", self.kind())
    }
}

impl PageTableEntry {
    /// Entry pointing at `ppn` with `flags`.
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        Self {
            bits: (ppn.0 << 10) | flags.bits() as usize,
        }
    }

    /// Not-present entry.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Frame or next-level table number.
    pub fn ppn(self) -> PhysPageNum {
        ((self.bits >> 10) & ((1usize << 44) - 1)).into()
    }

    /// Permission and status bits.
    pub fn flags(self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }

    /// Whether the entry is present.
    pub fn is_valid(self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    /// Decode the entry.
    pub fn kind(self) -> Entry {
        let flags = self.flags();
        if !flags.contains(PTEFlags::V) {
            Entry::Absent
        } else if flags.intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X) {
            Entry::Leaf(self.ppn(), flags)
        } else {
            Entry::Table(self.ppn())
        }
    }
}

/// Three-level page table rooted at a directory page.
pub struct PageTable {
    root_ppn: PhysPageNum,
    map: DirectMap,
}

impl PageTable {
    /// View the tree whose directory lives at `root`.
    pub fn from_root(root: PhysAddr, map: DirectMap) -> Self {
        Self {
            root_ppn: root.into(),
            map,
        }
    }

    /// The directory entries.
    pub fn directory(&self) -> &'static mut [PageTableEntry] {
        self.map.pte_array(self.root_ppn)
    }

    /// Leaf slot for `va`, allocating zeroed middle and leaf tables on the
    /// way down.
    ///
    /// # Errors
    /// [`MemError::OutOfMemory`] if a table page cannot be allocated,
    /// [`MemError::AlreadyMapped`] if a large-page leaf covers `va`.
    pub fn walk_alloc(
        &mut self,
        frames: &mut FrameAllocator,
        va: VirtAddr,
    ) -> Result<&'static mut PageTableEntry, MemError> {
        let idxs = va.indexes();
        let mut ppn = self.root_ppn;

        for &idx in &idxs[..2] {
            let pte = &mut self.map.pte_array(ppn)[idx];
            ppn = match pte.kind() {
                Entry::Table(next) => next,
                Entry::Leaf(..) => return Err(MemError::AlreadyMapped),
                Entry::Absent => {
                    let table = frames.alloc_pages(1).ok_or(MemError::OutOfMemory)?;
                    self.map.bytes(table, PAGE_SIZE).fill(0);
                    trace!("mm: new page table {table:?} for {va:?}");
                    *pte = PageTableEntry::new(table.into(), PTEFlags::TABLE);
                    table.into()
                }
            };
        }
        Ok(&mut self.map.pte_array(ppn)[idxs[2]])
    }

    /// Leaf slot for `va` if every level above it is present.
    pub fn walk(&self, va: VirtAddr) -> Option<&'static mut PageTableEntry> {
        let idxs = va.indexes();
        let mut ppn = self.root_ppn;

        for &idx in &idxs[..2] {
            match self.map.pte_array(ppn)[idx].kind() {
                Entry::Table(next) => ppn = next,
                Entry::Absent | Entry::Leaf(..) => return None,
            }
        }
        Some(&mut self.map.pte_array(ppn)[idxs[2]])
    }

    /// Physical address and flags `va` resolves to, large pages included.
    pub fn translate(&self, va: VirtAddr) -> Option<(PhysAddr, PTEFlags)> {
        let idxs = va.indexes();
        let mut ppn = self.root_ppn;

        for (level, &idx) in idxs.iter().enumerate() {
            match self.map.pte_array(ppn)[idx].kind() {
                Entry::Absent => return None,
                Entry::Table(next) if level < 2 => ppn = next,
                Entry::Table(_) => return None,
                Entry::Leaf(frame, flags) => {
                    let span = PAGE_SIZE << (9 * (2 - level));
                    let base: PhysAddr = frame.into();
                    return Some((base + (va.0 & (span - 1)), flags));
                }
            }
        }
        None
    }

    /// Map `[va, va_end)` page by page onto consecutive frames from `pa`.
    ///
    /// # Errors
    /// See [`PageTable::walk_alloc`].
    pub fn map_range(
        &mut self,
        frames: &mut FrameAllocator,
        mut pa: PhysAddr,
        mut va: VirtAddr,
        va_end: VirtAddr,
        flags: PTEFlags,
    ) -> Result<(), MemError> {
        while va < va_end {
            let pte = self.walk_alloc(frames, va)?;
            *pte = PageTableEntry::new(pa.floor(), flags);
            va = va + PAGE_SIZE;
            pa = pa + PAGE_SIZE;
        }
        Ok(())
    }

    /// Clear the leaf entries of `[va, va_end)`. Tables are kept.
    pub fn unmap_range(&self, mut va: VirtAddr, va_end: VirtAddr) {
        while va < va_end {
            if let Some(pte) = self.walk(va) {
                *pte = PageTableEntry::empty();
            }
            va = va + PAGE_SIZE;
        }
    }

    /// Free every middle and leaf table reachable from a directory entry
    /// that differs from the same entry in `shared`.
    pub fn release_tables(&self, frames: &mut FrameAllocator, shared: &[PageTableEntry]) {
        for (i, pde) in self.directory().iter_mut().enumerate() {
            let Entry::Table(middle) = pde.kind() else {
                continue;
            };
            if shared.get(i) == Some(&*pde) {
                continue;
            }
            for pmde in self.map.pte_array(middle).iter() {
                if let Entry::Table(leaf) = pmde.kind() {
                    let _ = frames.free(leaf.into(), PAGE_SIZE);
                }
            }
            let _ = frames.free(middle.into(), PAGE_SIZE);
            *pde = PageTableEntry::empty();
        }
    }
}
