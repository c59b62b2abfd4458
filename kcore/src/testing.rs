//! Host stand-ins for physical memory and the hart, for unit tests.

use crate::config::PAGE_SIZE;
use crate::hart::Hart;
use crate::mm::{round_up, DirectMap, Mm, PhysAddr};
use crate::task::TrapFrame;
use std::cell::Cell;

/// A heap buffer posing as RAM at `0x8000_0000`.
pub(crate) struct TestMemory {
    _buf: Vec<u8>,
    pub base: PhysAddr,
    pub size: usize,
    pub map: DirectMap,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        let mut buf = vec![0u8; size + PAGE_SIZE];
        let aligned = round_up(buf.as_mut_ptr() as usize, PAGE_SIZE);
        let base = PhysAddr(0x8000_0000);
        // SAFETY: `[base, base + size)` lands inside `buf`, which lives as
        // long as `self`.
        let map = unsafe { DirectMap::new(aligned.wrapping_sub(base.0)) };
        Self {
            _buf: buf,
            base,
            size,
            map,
        }
    }

    /// Allocators seeded with the whole buffer.
    pub fn mm(&self) -> Mm {
        let mut mm = Mm::new(self.map);
        mm.frames.init(self.base, self.size).unwrap();
        mm
    }
}

/// A hart whose clock only moves when told to.
pub(crate) struct MockHart {
    cycles: Cell<u64>,
    freq: u64,
    ptbr: Cell<Option<PhysAddr>>,
    tlb_flushes: Cell<usize>,
    timer_restarts: Cell<usize>,
}

impl MockHart {
    pub fn new(freq: u64) -> Self {
        Self {
            cycles: Cell::new(0),
            freq,
            ptbr: Cell::new(None),
            tlb_flushes: Cell::new(0),
            timer_restarts: Cell::new(0),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.cycles.set(self.cycles.get() + self.freq * ms / 1000);
    }

    pub fn ptbr(&self) -> Option<PhysAddr> {
        self.ptbr.get()
    }

    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes.get()
    }

    pub fn timer_restarts(&self) -> usize {
        self.timer_restarts.get()
    }
}

impl Hart for MockHart {
    fn write_ptbr(&self, root: PhysAddr) {
        self.ptbr.set(Some(root));
    }

    fn flush_tlb(&self) {
        self.tlb_flushes.set(self.tlb_flushes.get() + 1);
    }

    fn read_cycles(&self) -> u64 {
        self.cycles.get()
    }

    fn timebase_freq(&self) -> u64 {
        self.freq
    }

    fn restart_timer(&self) {
        self.timer_restarts.set(self.timer_restarts.get() + 1);
    }

    unsafe fn restore_user_context(&self, frame: *const TrapFrame) -> ! {
        panic!("return to user mode at {:#x}", unsafe { (*frame).sepc });
    }
}
