//! Implementation of [`AddressSpace`] and [`Vm`].
//!
//! An address space is a directory page plus a list of [`Region`] records.
//! Records are slab objects chained by physical address, newest first.
//! [`Vm`] holds what every address space shares: the kernel directory whose
//! upper half is copied into each space, and the I/O mapping window.

use super::{
    round_down, round_up, DirectMap, Mm, MemError, PTEFlags, PageTable, PageTableEntry, PhysAddr,
    VirtAddr,
};
use crate::config::{IOMAP_BASE, IOMAP_MAX, KERNEL_VMA, PAGE_SIZE, PGD_SHIFT, PGD_SIZE, PTES_PER_PAGE};
use crate::hart::Hart;
use core::mem::size_of;
use core::ptr::NonNull;
use log::{debug, info};

/// A mapped virtual range and the physical range behind it.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct Region {
    next: usize,
    /// First mapped virtual address.
    pub vir_base: VirtAddr,
    /// Physical address `vir_base` maps to.
    pub phys_base: PhysAddr,
    /// Mapped bytes, a multiple of the page size.
    pub size: usize,
    /// The frames were allocated for this region and go back on teardown.
    pub owned: bool,
}

const REGION_BYTES: usize = size_of::<Region>();

impl Region {
    fn next_record(&self) -> Option<PhysAddr> {
        (self.next != 0).then_some(PhysAddr(self.next))
    }

    fn overlaps(&self, start: VirtAddr, size: usize) -> bool {
        start.0 < self.vir_base.0.saturating_add(self.size)
            && self.vir_base.0 < start.0.saturating_add(size)
    }
}

/// A process address space.
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysAddr,
    regions: Option<PhysAddr>,
}

impl AddressSpace {
    /// Space with no directory, owned by unused process slots.
    pub const fn empty() -> Self {
        Self {
            root: PhysAddr(0),
            regions: None,
        }
    }

    /// Whether the space has no directory.
    pub fn is_empty(&self) -> bool {
        self.root.0 == 0
    }

    /// Physical address of the directory page.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// The regions of the space, newest first.
    pub fn regions(&self, map: DirectMap) -> Regions {
        Regions {
            map,
            cur: self.regions,
        }
    }
}

/// Iterator over the [`Region`]s of an [`AddressSpace`].
pub struct Regions {
    map: DirectMap,
    cur: Option<PhysAddr>,
}

impl Iterator for Regions {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        // SAFETY: region records are written by `Vm::map` before they are
        // linked and stay valid until teardown unlinks them.
        let region = unsafe { *self.map.as_mut::<Region>(self.cur?) };
        self.cur = region.next_record();
        Some(region)
    }
}

#[derive(Copy, Clone, Debug)]
struct IoMap {
    phys: PhysAddr,
    vir: VirtAddr,
    size: usize,
}

const NO_IOMAP: IoMap = IoMap {
    phys: PhysAddr(0),
    vir: VirtAddr(0),
    size: 0,
};

/// Virtual memory manager.
pub struct Vm {
    kernel_root: PhysAddr,
    kernel_pa_start: PhysAddr,
    phys_mem_end: PhysAddr,
    iomaps: [IoMap; IOMAP_MAX],
    num_iomaps: usize,
    iomap_next: usize,
}

impl Vm {
    /// Manager over the kernel directory at `kernel_root`, which maps
    /// `[kernel_pa_start, phys_mem_end)` at [`KERNEL_VMA`].
    pub const fn new(kernel_root: PhysAddr, kernel_pa_start: PhysAddr, phys_mem_end: PhysAddr) -> Self {
        Self {
            kernel_root,
            kernel_pa_start,
            phys_mem_end,
            iomaps: [NO_IOMAP; IOMAP_MAX],
            num_iomaps: 0,
            iomap_next: IOMAP_BASE,
        }
    }

    /// Directory page of the kernel.
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel_root
    }

    /// Map `[start, end)` of `space`, rounded out to whole pages.
    ///
    /// With `phys == None` zeroed frames are allocated and owned by the new
    /// region; otherwise `phys` is rounded up to a page and mapped as is.
    /// Returns the physical base of the mapping.
    ///
    /// # Errors
    /// [`MemError::InvalidArgument`] for an empty range, a range running
    /// past the top of the address space or a space with no directory,
    /// [`MemError::AlreadyMapped`] if the range overlaps a region of `space`,
    /// [`MemError::OutOfMemory`] if frames, tables or the record run out.
    pub fn map(
        &self,
        mm: &mut Mm,
        space: &mut AddressSpace,
        phys: Option<PhysAddr>,
        start: VirtAddr,
        end: VirtAddr,
    ) -> Result<PhysAddr, MemError> {
        if space.is_empty() || end <= start {
            return Err(MemError::InvalidArgument);
        }
        let start = start.align_down();
        let size = (end.0 - start.0)
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(MemError::InvalidArgument)?;
        let end = VirtAddr(start.0.checked_add(size).ok_or(MemError::InvalidArgument)?);
        if space.regions(mm.map).any(|r| r.overlaps(start, size)) {
            return Err(MemError::AlreadyMapped);
        }

        let (phys_base, owned) = match phys {
            Some(pa) => (PhysAddr(round_up(pa.0, PAGE_SIZE)), false),
            None => {
                let pa = mm.alloc_zeroed_pages(size / PAGE_SIZE).ok_or(MemError::OutOfMemory)?;
                (pa, true)
            }
        };
        let undo = |mm: &mut Mm| {
            PageTable::from_root(space.root, mm.map).unmap_range(start, end);
            if owned {
                let _ = mm.frames.free(phys_base, size);
            }
        };

        let mut pt = PageTable::from_root(space.root, mm.map);
        if let Err(e) = pt.map_range(&mut mm.frames, phys_base, start, end, PTEFlags::PROT_EXEC_WRITE) {
            undo(mm);
            return Err(e);
        }
        let record = match mm.slab_alloc(REGION_BYTES) {
            Ok(ptr) => ptr.cast::<Region>(),
            Err(e) => {
                undo(mm);
                return Err(e);
            }
        };
        // SAFETY: a fresh slab slot of `REGION_BYTES`, 8-byte aligned.
        unsafe {
            record.as_ptr().write(Region {
                next: space.regions.map_or(0, |pa| pa.0),
                vir_base: start,
                phys_base,
                size,
                owned,
            });
        }
        space.regions = Some(mm.map.pa(record.as_ptr() as usize));
        debug!("vm: map {start:?}..{end:?} -> {phys_base:?} owned={owned}");
        Ok(phys_base)
    }

    /// Share the kernel half of the kernel directory with `space` and
    /// rebuild the I/O window inside it.
    ///
    /// # Errors
    /// [`MemError::InvalidArgument`] if `space` has no directory,
    /// [`MemError::OutOfMemory`] if a table for the I/O window cannot be
    /// allocated.
    pub fn map_kernel(&self, mm: &mut Mm, space: &mut AddressSpace) -> Result<(), MemError> {
        if space.is_empty() {
            return Err(MemError::InvalidArgument);
        }
        let kernel_dir = PageTable::from_root(self.kernel_root, mm.map).directory();
        let mut pt = PageTable::from_root(space.root, mm.map);

        let first = (KERNEL_VMA >> PGD_SHIFT) % PTES_PER_PAGE;
        let span = round_up(self.phys_mem_end.0 - self.kernel_pa_start.0, PGD_SIZE) >> PGD_SHIFT;
        let last = (first + span).min(PTES_PER_PAGE);
        pt.directory()[first..last].copy_from_slice(&kernel_dir[first..last]);

        for io in &self.iomaps[..self.num_iomaps] {
            pt.map_range(&mut mm.frames, io.phys, io.vir, io.vir + io.size, PTEFlags::PROT_KERNEL_EXEC)?;
        }
        Ok(())
    }

    /// Map device memory into the I/O window of the kernel directory and
    /// return the virtual address of `phys`.
    ///
    /// Mappings are never removed. Panics once [`IOMAP_MAX`] are installed.
    ///
    /// # Errors
    /// [`MemError::InvalidArgument`] for a zero size or one that runs past
    /// the end of the window,
    /// [`MemError::OutOfMemory`] if a table page cannot be allocated.
    pub fn map_io(&mut self, mm: &mut Mm, hart: &impl Hart, phys: PhysAddr, size: usize) -> Result<usize, MemError> {
        if self.num_iomaps == IOMAP_MAX {
            panic!("too many io mappings");
        }
        if size == 0 {
            return Err(MemError::InvalidArgument);
        }
        let base = PhysAddr(round_down(phys.0, PAGE_SIZE));
        let offset = phys.0 - base.0;
        let size = size
            .checked_add(offset)
            .and_then(|bytes| bytes.checked_next_multiple_of(PAGE_SIZE))
            .ok_or(MemError::InvalidArgument)?;
        let vir = VirtAddr(self.iomap_next);
        let next = self
            .iomap_next
            .checked_add(size)
            .ok_or(MemError::InvalidArgument)?;

        PageTable::from_root(self.kernel_root, mm.map).map_range(
            &mut mm.frames,
            base,
            vir,
            vir + size,
            PTEFlags::PROT_KERNEL,
        )?;
        hart.flush_tlb();

        self.iomaps[self.num_iomaps] = IoMap { phys: base, vir, size };
        self.num_iomaps += 1;
        self.iomap_next = next;
        info!("vm: io {base:?} ({size:#x} bytes) at {vir:?}");
        Ok(vir.0 + offset)
    }

    /// Number of I/O mappings installed.
    pub fn io_mappings(&self) -> usize {
        self.num_iomaps
    }

    /// A fresh directory sharing the kernel half.
    ///
    /// # Errors
    /// [`MemError::OutOfMemory`]
    pub fn new_space(&self, mm: &mut Mm) -> Result<AddressSpace, MemError> {
        let root = mm.alloc_zeroed_pages(1).ok_or(MemError::OutOfMemory)?;
        let mut space = AddressSpace { root, regions: None };
        if let Err(e) = self.map_kernel(mm, &mut space) {
            self.teardown(mm, &mut space);
            return Err(e);
        }
        Ok(space)
    }

    /// Make `space` the translation in use.
    pub fn switch_address_space(&self, hart: &impl Hart, space: &AddressSpace) {
        hart.write_ptbr(space.root);
    }

    /// Physical address `va` translates to in `space`.
    pub fn translate(&self, map: DirectMap, space: &AddressSpace, va: VirtAddr) -> Option<PhysAddr> {
        PageTable::from_root(space.root, map).translate(va).map(|(pa, _)| pa)
    }

    /// Give `child` a private copy of every region of `parent`.
    ///
    /// # Errors
    /// See [`Vm::map`]. Regions copied before the failure stay in `child`.
    pub fn duplicate(&self, mm: &mut Mm, parent: &AddressSpace, child: &mut AddressSpace) -> Result<(), MemError> {
        for region in parent.regions(mm.map) {
            let end = region.vir_base + region.size;
            let pa = self.map(mm, child, None, region.vir_base, end)?;
            mm.map.copy(pa, region.phys_base, region.size);
        }
        Ok(())
    }

    /// Release everything `space` holds: owned frames, region records,
    /// tables not shared with the kernel directory, then the directory.
    pub fn teardown(&self, mm: &mut Mm, space: &mut AddressSpace) {
        if space.is_empty() {
            return;
        }
        let mut cur = space.regions.take();
        while let Some(record) = cur {
            // SAFETY: see `Regions::next`.
            let region = unsafe { *mm.map.as_mut::<Region>(record) };
            if region.owned {
                let _ = mm.frames.free(region.phys_base, region.size);
            }
            if let Some(ptr) = NonNull::new(mm.map.va(record) as *mut u8) {
                mm.slab_free(ptr, REGION_BYTES);
            }
            cur = region.next_record();
        }

        let shared: &[PageTableEntry] = PageTable::from_root(self.kernel_root, mm.map).directory();
        PageTable::from_root(space.root, mm.map).release_tables(&mut mm.frames, shared);
        let _ = mm.frames.free(space.root, PAGE_SIZE);
        debug!("vm: released space {:?}", space.root);
        *space = AddressSpace::empty();
    }
}
