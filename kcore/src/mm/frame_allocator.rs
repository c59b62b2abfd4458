//! Implementation of [`FrameAllocator`]
//!
//! Physical memory is tracked as a list of holes, free ranges kept in
//! ascending order of base address. The list lives in a fixed table of
//! [`NR_HOLES`] records linked by index; unused records are chained on a
//! separate free-slot list.

use super::{DirectMap, MemError, PhysAddr};
use crate::config::{NR_HOLES, PAGE_SIZE};
use log::{debug, warn};

#[derive(Copy, Clone, Debug)]
struct Hole {
    next: Option<usize>,
    base: usize,
    len: usize,
}

const EMPTY_HOLE: Hole = Hole {
    next: None,
    base: 0,
    len: 0,
};

/// First-fit physical memory allocator over a hole list.
pub struct FrameAllocator {
    holes: [Hole; NR_HOLES],
    head: Option<usize>,
    free_slots: Option<usize>,
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator {
    /// An allocator with no free memory. Call [`FrameAllocator::init`] first.
    pub const fn new() -> Self {
        Self {
            holes: [EMPTY_HOLE; NR_HOLES],
            head: None,
            free_slots: None,
        }
    }

    /// Reset the hole table and seed it with `[base, base + size)`.
    ///
    /// # Errors
    /// [`MemError::InvalidArgument`] if `size` is zero.
    pub fn init(&mut self, base: PhysAddr, size: usize) -> Result<(), MemError> {
        for (i, hole) in self.holes.iter_mut().enumerate() {
            *hole = Hole {
                next: Some(i + 1),
                ..EMPTY_HOLE
            };
        }
        self.holes[NR_HOLES - 1].next = None;
        self.head = None;
        self.free_slots = Some(0);

        self.free(base, size)
    }

    /// Give `[base, base + len)` back, coalescing with the neighbouring holes.
    ///
    /// # Errors
    /// [`MemError::InvalidArgument`] if `len` is zero.
    ///
    /// # Panics
    /// When the hole table has no free record left.
    pub fn free(&mut self, base: PhysAddr, len: usize) -> Result<(), MemError> {
        if len == 0 {
            return Err(MemError::InvalidArgument);
        }
        let Some(new) = self.take_slot() else {
            panic!("hole table full");
        };
        self.holes[new].base = base.0;
        self.holes[new].len = len;

        match self.head {
            Some(head) if base.0 > self.holes[head].base => {
                let mut prev = head;
                while let Some(next) = self.holes[prev].next {
                    if self.holes[next].base >= base.0 {
                        break;
                    }
                    prev = next;
                }
                self.holes[new].next = self.holes[prev].next;
                self.holes[prev].next = Some(new);
                self.merge(prev);
            }
            _ => {
                self.holes[new].next = self.head;
                self.head = Some(new);
                self.merge(new);
            }
        }
        Ok(())
    }

    /// Carve `n` bytes from the front of the first hole large enough.
    pub fn alloc_bytes(&mut self, n: usize) -> Option<PhysAddr> {
        if n == 0 {
            return None;
        }
        let mut prev = None;
        let mut cur = self.head;
        while let Some(hp) = cur {
            let hole = &mut self.holes[hp];
            if hole.len >= n {
                let base = hole.base;
                hole.base += n;
                hole.len -= n;
                if hole.len == 0 {
                    self.delete_slot(prev, hp);
                }
                return Some(PhysAddr(base));
            }
            prev = cur;
            cur = hole.next;
        }
        None
    }

    /// Allocate `n` contiguous pages starting on a page boundary.
    ///
    /// A misaligned hole pays for the alignment padding as well. The padding
    /// is folded into the previous hole when that one ends exactly where the
    /// padding starts, otherwise it stays behind as a hole of its own.
    pub fn alloc_pages(&mut self, n: usize) -> Option<PhysAddr> {
        let memsize = n.checked_mul(PAGE_SIZE)?;
        if memsize == 0 {
            return None;
        }

        let mut prev: Option<usize> = None;
        let mut cur = self.head;
        while let Some(hp) = cur {
            let Hole { next, base, len } = self.holes[hp];
            let padding = (PAGE_SIZE - base % PAGE_SIZE) % PAGE_SIZE;
            if len >= memsize + padding {
                let start = base + padding;
                let rest = len - padding - memsize;
                let prev_touches = prev.is_some_and(|p| {
                    let p = &self.holes[p];
                    p.base + p.len == base
                });

                if padding == 0 || prev_touches {
                    if let Some(p) = prev.filter(|_| padding != 0) {
                        self.holes[p].len += padding;
                    }
                    self.holes[hp].base = start + memsize;
                    self.holes[hp].len = rest;
                    if rest == 0 {
                        self.delete_slot(prev, hp);
                    }
                } else if rest == 0 {
                    self.holes[hp].len = padding;
                } else if let Some(tail) = self.take_slot() {
                    self.holes[tail] = Hole {
                        next,
                        base: start + memsize,
                        len: rest,
                    };
                    self.holes[hp].len = padding;
                    self.holes[hp].next = Some(tail);
                } else {
                    warn!("mm: hole table full, dropping {padding:#x} bytes of alignment padding at {base:#x}");
                    self.holes[hp].base = start + memsize;
                    self.holes[hp].len = rest;
                }

                debug!("mm: alloc_pages({n}) -> {start:#x}");
                return Some(PhysAddr(start));
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// [`FrameAllocator::alloc_pages`], also returning the kernel virtual
    /// address of the pages.
    pub fn valloc_pages(&mut self, n: usize, map: DirectMap) -> Option<(usize, PhysAddr)> {
        let pa = self.alloc_pages(n)?;
        Some((map.va(pa), pa))
    }

    /// Free ranges in ascending order, as `(base, len)`.
    pub fn holes(&self) -> Holes<'_> {
        Holes {
            allocator: self,
            cur: self.head,
        }
    }

    /// Total number of free bytes.
    pub fn free_bytes(&self) -> usize {
        self.holes().map(|(_, len)| len).sum()
    }

    /// Number of holes currently tracked.
    pub fn hole_count(&self) -> usize {
        self.holes().count()
    }

    fn take_slot(&mut self) -> Option<usize> {
        let slot = self.free_slots?;
        self.free_slots = self.holes[slot].next;
        self.holes[slot].next = None;
        Some(slot)
    }

    fn delete_slot(&mut self, prev: Option<usize>, hp: usize) {
        let next = self.holes[hp].next;
        match prev {
            Some(p) if self.head != Some(hp) => self.holes[p].next = next,
            _ => self.head = next,
        }
        self.holes[hp] = Hole {
            next: self.free_slots,
            ..EMPTY_HOLE
        };
        self.free_slots = Some(hp);
    }

    /// Merge `hp` with its successor, then look one hole further.
    fn merge(&mut self, mut hp: usize) {
        for _ in 0..2 {
            let Some(next) = self.holes[hp].next else {
                return;
            };
            if self.holes[hp].base + self.holes[hp].len == self.holes[next].base {
                self.holes[hp].len += self.holes[next].len;
                self.delete_slot(Some(hp), next);
            } else {
                hp = next;
            }
        }
    }
}

/// Iterator over the holes of a [`FrameAllocator`].
pub struct Holes<'a> {
    allocator: &'a FrameAllocator,
    cur: Option<usize>,
}

impl Iterator for Holes<'_> {
    type Item = (PhysAddr, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let hole = &self.allocator.holes[self.cur?];
        self.cur = hole.next;
        Some((PhysAddr(hole.base), hole.len))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASE: usize = 0x8000_0000;
    const SIZE: usize = 0x400_0000;

    fn seeded() -> FrameAllocator {
        let mut frames = FrameAllocator::new();
        frames.init(PhysAddr(BASE), SIZE).unwrap();
        frames
    }

    fn holes(frames: &FrameAllocator) -> Vec<(usize, usize)> {
        frames.holes().map(|(b, l)| (b.0, l)).collect()
    }

    #[test]
    fn boot_seed() {
        let mut frames = seeded();
        assert_eq!(frames.alloc_pages(1), Some(PhysAddr(0x8000_0000)));
        assert_eq!(frames.alloc_pages(1), Some(PhysAddr(0x8000_1000)));
        frames.free(PhysAddr(0x8000_0000), PAGE_SIZE).unwrap();
        assert_eq!(frames.hole_count(), 2);
        frames.free(PhysAddr(0x8000_1000), PAGE_SIZE).unwrap();
        assert_eq!(holes(&frames), vec![(BASE, SIZE)]);
    }

    #[test]
    fn valloc_pages_reports_both_addresses() {
        let mut frames = seeded();
        // SAFETY: only used for address arithmetic.
        let map = unsafe { DirectMap::new(0x1_0000_0000) };
        let (va, pa) = frames.valloc_pages(2, map).unwrap();
        assert!(pa.is_aligned());
        assert_eq!(va, map.va(pa));
        assert_eq!(va, pa.0 + 0x1_0000_0000);
        assert_eq!(frames.valloc_pages(SIZE / PAGE_SIZE, map), None);
    }

    #[test]
    fn zero_length_free_is_rejected() {
        let mut frames = seeded();
        assert_eq!(
            frames.free(PhysAddr(0x9000_0000), 0),
            Err(MemError::InvalidArgument)
        );
        assert_eq!(holes(&frames), vec![(BASE, SIZE)]);
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let mut frames = FrameAllocator::new();
        frames.init(PhysAddr(0x1_0000), 0x1000).unwrap();
        // Pairwise disjoint pieces of [0x1_0000, 0x1_a000) plus one far away,
        // freed out of order.
        for (base, len) in [
            (0x1_4000, 0x2000),
            (0x1_8000, 0x2000),
            (0x4_0000, 0x1000),
            (0x1_1000, 0x1000),
            (0x1_6000, 0x2000),
            (0x1_2000, 0x2000),
        ] {
            frames.free(PhysAddr(base), len).unwrap();
        }
        assert_eq!(holes(&frames), vec![(0x1_0000, 0xa000), (0x4_0000, 0x1000)]);
    }

    #[test]
    fn first_fit_carves_from_front() {
        let mut frames = FrameAllocator::new();
        frames.init(PhysAddr(0x1000), 0x100).unwrap();
        frames.free(PhysAddr(0x5000), 0x1000).unwrap();
        assert_eq!(frames.alloc_bytes(0x200), Some(PhysAddr(0x5000)));
        assert_eq!(frames.alloc_bytes(0x100), Some(PhysAddr(0x1000)));
        assert_eq!(holes(&frames), vec![(0x5200, 0xe00)]);
        assert_eq!(frames.alloc_bytes(0x1000), None);
        assert_eq!(frames.alloc_bytes(0), None);
    }

    #[test]
    fn pages_are_aligned_and_disjoint() {
        let mut frames = seeded();
        let mut live: Vec<(usize, usize)> = Vec::new();
        for n in [1, 3, 1, 7, 2] {
            frames.alloc_bytes(n * 24).unwrap();
            let pa = frames.alloc_pages(n).unwrap().0;
            assert_eq!(pa % PAGE_SIZE, 0);
            let len = n * PAGE_SIZE;
            assert!(live.iter().all(|&(b, l)| pa + len <= b || b + l <= pa));
            live.push((pa, len));
        }
        assert_eq!(frames.alloc_pages(SIZE / PAGE_SIZE), None);
    }

    #[test]
    fn padding_stays_behind_as_a_hole() {
        let mut frames = FrameAllocator::new();
        frames.init(PhysAddr(0x8000_0100), 0x3000).unwrap();
        assert_eq!(frames.alloc_pages(1), Some(PhysAddr(0x8000_1000)));
        assert_eq!(
            holes(&frames),
            vec![(0x8000_0100, 0xf00), (0x8000_2000, 0x1100)]
        );
        frames.free(PhysAddr(0x8000_1000), PAGE_SIZE).unwrap();
        assert_eq!(holes(&frames), vec![(0x8000_0100, 0x3000)]);
    }

    #[test]
    fn padding_skips_a_gapped_predecessor() {
        let mut frames = FrameAllocator::new();
        frames.init(PhysAddr(0x1000), 0x800).unwrap();
        frames.free(PhysAddr(0x3000), 0x3000).unwrap();
        assert_eq!(frames.alloc_bytes(0x800), Some(PhysAddr(0x1000)));
        assert_eq!(frames.alloc_bytes(0x80), Some(PhysAddr(0x3000)));
        frames.free(PhysAddr(0x3000), 0x40).unwrap();
        assert_eq!(holes(&frames), vec![(0x3000, 0x40), (0x3080, 0x2f80)]);
        assert_eq!(frames.alloc_pages(1), Some(PhysAddr(0x4000)));
        assert_eq!(
            holes(&frames),
            vec![(0x3000, 0x40), (0x3080, 0xf80), (0x5000, 0x1000)]
        );
    }

    #[test]
    fn padding_folds_into_touching_predecessor() {
        let mut frames = FrameAllocator::new();
        frames.init(PhysAddr(0x3000), 0x80).unwrap();
        // `free` never leaves two holes touching, so link one in by hand.
        let slot = frames.take_slot().unwrap();
        frames.holes[slot] = Hole {
            next: None,
            base: 0x3080,
            len: 0x2f80,
        };
        let head = frames.head.unwrap();
        frames.holes[head].next = Some(slot);

        assert_eq!(frames.alloc_pages(1), Some(PhysAddr(0x4000)));
        assert_eq!(holes(&frames), vec![(0x3000, 0x1000), (0x5000, 0x1000)]);
        assert_eq!(frames.alloc_pages(1), Some(PhysAddr(0x3000)));
        assert_eq!(holes(&frames), vec![(0x5000, 0x1000)]);
    }

    #[test]
    fn conservation_under_mixed_traffic() {
        let mut frames = seeded();
        let mut live: Vec<(PhysAddr, usize)> = Vec::new();
        let mut seed = 0x2545_f491_u32;
        let mut rand = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed as usize
        };

        for step in 0..400 {
            if step % 3 == 2 && !live.is_empty() {
                let (base, len) = live.swap_remove(rand() % live.len());
                frames.free(base, len).unwrap();
            } else if rand() % 2 == 0 {
                let n = 1 + rand() % 4;
                if let Some(pa) = frames.alloc_pages(n) {
                    live.push((pa, n * PAGE_SIZE));
                }
            } else {
                let n = 8 + rand() % 0x300;
                if let Some(pa) = frames.alloc_bytes(n) {
                    live.push((pa, n));
                }
            }
            let used: usize = live.iter().map(|&(_, l)| l).sum();
            assert_eq!(frames.free_bytes() + used, SIZE, "step {step}");
        }

        for (base, len) in live.drain(..) {
            frames.free(base, len).unwrap();
        }
        assert_eq!(holes(&frames), vec![(BASE, SIZE)]);
    }

    #[test]
    #[should_panic(expected = "hole table full")]
    fn hole_table_exhaustion_is_fatal() {
        let mut frames = FrameAllocator::new();
        frames.init(PhysAddr(0), 0x10).unwrap();
        for i in 1..=NR_HOLES {
            frames.free(PhysAddr(i * 0x100), 0x10).unwrap();
        }
    }
}
