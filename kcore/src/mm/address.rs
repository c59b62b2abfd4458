//! Implementation of physical and virtual address and page number.

use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS, PTES_PER_PAGE};
use core::fmt::{self, Debug, Formatter};
use core::ops::Add;

//              Virtual Address (Sv39, sign-extended to 64 bits)
// 38        30 29        21 20        12 11           0
// +-----------+------------+------------+-------------+
// | directory |   middle   |   table    | Page Offset |
// +-----------+------------+------------+-------------+
//
//              Physical Address (56 bits)
// 55                               12 11           0
// +----------------------------------+-------------+
// |       Physical Page Number       | Page Offset |
// +----------------------------------+-------------+
const PA_WIDTH_SV39: usize = 56;
const PPN_WIDTH_SV39: usize = PA_WIDTH_SV39 - PAGE_SIZE_BITS;

/// physical address
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default, Hash)]
pub struct PhysAddr(pub usize);

/// virtual address
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default, Hash)]
pub struct VirtAddr(pub usize);

/// physical page number
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Default, Hash)]
pub struct PhysPageNum(pub usize);

impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("VA:{:#x}", self.0))
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PA:{:#x}", self.0))
    }
}

impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PPN:{:#x}", self.0))
    }
}

impl From<usize> for PhysPageNum {
    fn from(value: usize) -> Self {
        Self(value & ((1 << PPN_WIDTH_SV39) - 1))
    }
}

impl From<PhysPageNum> for PhysAddr {
    fn from(value: PhysPageNum) -> Self {
        Self(value.0 << PAGE_SIZE_BITS)
    }
}

impl From<PhysAddr> for PhysPageNum {
    fn from(value: PhysAddr) -> Self {
        assert!(value.is_aligned(), "{value:?} is not page aligned");
        value.floor()
    }
}

impl Add<usize> for PhysAddr {
    type Output = Self;
    fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;
    fn add(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl PhysAddr {
    /// Offset inside the page.
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the address is page-aligned.
    pub fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Page containing this address.
    pub fn floor(self) -> PhysPageNum {
        PhysPageNum(self.0 / PAGE_SIZE)
    }
}

impl VirtAddr {
    /// Offset inside the page.
    pub fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Checks if the address is page-aligned.
    pub fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// The address rounded down to its page.
    #[must_use]
    pub fn align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// - `id[0]`: VA[38..=30]
    /// - `id[1]`: VA[29..=21]
    /// - `id[2]`: VA[20..=12]
    pub fn indexes(self) -> [usize; 3] {
        let mask = PTES_PER_PAGE - 1;
        [
            (self.0 >> 30) & mask,
            (self.0 >> 21) & mask,
            (self.0 >> 12) & mask,
        ]
    }
}

/// Round `value` up to a multiple of `align`.
pub const fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Round `value` down to a multiple of `align`.
pub const fn round_down(value: usize, align: usize) -> usize {
    value - value % align
}
