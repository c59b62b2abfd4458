//! Implementation of [`SlabAllocator`]
//!
//! Each pool is one physical page: a pool header followed by the data
//! area, cut into equal slots. Pools serving the same rounded object size
//! are chained through the physical address stored in their header, one
//! chain per size class. Pools are never handed back to the frame
//! allocator, even when they become empty.

use super::{round_up, DirectMap, FrameAllocator, MemError, PhysAddr};
use crate::config::PAGE_SIZE;
use core::mem::size_of;
use core::ptr::NonNull;
use log::{debug, warn};

/// Object sizes are rounded up to this.
pub const OBJ_ALIGN: usize = 4;
/// Smallest object the slab serves.
pub const MIN_OBJECT: usize = 8;
/// Largest object the slab serves.
pub const MAX_OBJECT: usize = 204;

const NR_BUCKETS: usize = (MAX_OBJECT - MIN_OBJECT) / OBJ_ALIGN + 1;
const MASK_WORDS: usize = PAGE_SIZE / MIN_OBJECT / u64::BITS as usize;

#[repr(C)]
struct PoolHeader {
    /// Physical address of the next pool of the size class, 0 ends the chain.
    next: usize,
    used_mask: [u64; MASK_WORDS],
    free_guess: u16,
    used: u16,
    phys: usize,
}

const HEADER_BYTES: usize = round_up(size_of::<PoolHeader>(), size_of::<usize>());
/// Bytes available for objects in one pool.
pub const DATA_BYTES: usize = PAGE_SIZE - HEADER_BYTES;

impl PoolHeader {
    fn is_set(&self, slot: usize) -> bool {
        self.used_mask[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn set(&mut self, slot: usize) {
        self.used_mask[slot / 64] |= 1 << (slot % 64);
    }

    fn clear(&mut self, slot: usize) {
        self.used_mask[slot / 64] &= !(1 << (slot % 64));
    }

    /// Take a clear slot, probing from the hint to the end and then from the
    /// start up to the hint.
    fn claim(&mut self, max_objs: usize) -> Option<usize> {
        if usize::from(self.used) == max_objs {
            return None;
        }
        let guess = usize::from(self.free_guess).min(max_objs);
        let slot = (guess..max_objs)
            .chain(0..guess)
            .find(|&slot| !self.is_set(slot))?;
        self.set(slot);
        self.free_guess = (slot + 1) as u16;
        self.used += 1;
        Some(slot)
    }

    fn next_pool(&self) -> Option<PhysAddr> {
        (self.next != 0).then_some(PhysAddr(self.next))
    }
}

/// Size-class slab allocator for small kernel objects.
pub struct SlabAllocator {
    buckets: [Option<PhysAddr>; NR_BUCKETS],
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAllocator {
    /// Allocator with every size class empty.
    pub const fn new() -> Self {
        Self {
            buckets: [None; NR_BUCKETS],
        }
    }

    /// Forget every pool.
    pub fn init(&mut self) {
        self.buckets = [None; NR_BUCKETS];
    }

    /// Objects one pool holds for `size`-byte requests.
    pub const fn capacity(size: usize) -> usize {
        DATA_BYTES / round_up(size, OBJ_ALIGN)
    }

    fn bucket(size: usize) -> Option<(usize, usize)> {
        if !(MIN_OBJECT..=MAX_OBJECT).contains(&size) {
            return None;
        }
        let bytes = round_up(size, OBJ_ALIGN);
        Some(((bytes - MIN_OBJECT) / OBJ_ALIGN, bytes))
    }

    fn header(map: DirectMap, pool: PhysAddr) -> &'static mut PoolHeader {
        // SAFETY: `pool` is a page this allocator obtained from the frame
        // allocator and initialised with a header.
        unsafe { map.as_mut(pool) }
    }

    fn slot_ptr(
        map: DirectMap,
        pool: PhysAddr,
        slot: usize,
        bytes: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let va = map.va(pool) + HEADER_BYTES + slot * bytes;
        NonNull::new(va as *mut u8).ok_or(MemError::OutOfMemory)
    }

    /// Allocate an object of `size` bytes.
    ///
    /// # Errors
    /// [`MemError::InvalidArgument`] when `size` lies outside
    /// `[MIN_OBJECT, MAX_OBJECT]`, [`MemError::OutOfMemory`] when a new pool
    /// is needed and no page is left.
    pub fn alloc(
        &mut self,
        frames: &mut FrameAllocator,
        map: DirectMap,
        size: usize,
    ) -> Result<NonNull<u8>, MemError> {
        let Some((bucket, bytes)) = Self::bucket(size) else {
            warn!("mm: slab_alloc: invalid size ({size} bytes)");
            return Err(MemError::InvalidArgument);
        };
        let max_objs = DATA_BYTES / bytes;

        let mut cur = self.buckets[bucket];
        while let Some(pool) = cur {
            let header = Self::header(map, pool);
            if let Some(slot) = header.claim(max_objs) {
                return Self::slot_ptr(map, pool, slot, bytes);
            }
            cur = header.next_pool();
        }

        let pool = frames.alloc_pages(1).ok_or(MemError::OutOfMemory)?;
        let header = Self::header(map, pool);
        *header = PoolHeader {
            next: self.buckets[bucket].map_or(0, |p| p.0),
            used_mask: [0; MASK_WORDS],
            free_guess: 0,
            used: 0,
            phys: pool.0,
        };
        self.buckets[bucket] = Some(pool);
        debug!("mm: new slab pool {pool:?} for {bytes}-byte objects");

        let slot = header.claim(max_objs).ok_or(MemError::OutOfMemory)?;
        Self::slot_ptr(map, pool, slot, bytes)
    }

    /// Release an object. `size` must be the size passed to
    /// [`SlabAllocator::alloc`]; unknown sizes and pointers are ignored.
    pub fn free(&mut self, map: DirectMap, ptr: NonNull<u8>, size: usize) {
        let Some((bucket, bytes)) = Self::bucket(size) else {
            return;
        };
        let max_objs = DATA_BYTES / bytes;
        let addr = ptr.as_ptr() as usize;

        let mut cur = self.buckets[bucket];
        while let Some(pool) = cur {
            let header = Self::header(map, pool);
            let data = map.va(PhysAddr(header.phys)) + HEADER_BYTES;
            if header.used != 0 && (data..data + DATA_BYTES).contains(&addr) {
                let slot = (addr - data) / bytes;
                if slot < max_objs && header.is_set(slot) {
                    header.clear(slot);
                    header.used -= 1;
                    header.free_guess = slot as u16;
                }
                return;
            }
            cur = header.next_pool();
        }
    }

    /// Number of pools serving `size`-byte objects.
    pub fn pool_count(&self, map: DirectMap, size: usize) -> usize {
        let Some((bucket, _)) = Self::bucket(size) else {
            return 0;
        };
        let mut count = 0;
        let mut cur = self.buckets[bucket];
        while let Some(pool) = cur {
            count += 1;
            cur = Self::header(map, pool).next_pool();
        }
        count
    }
}
