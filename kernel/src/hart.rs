//! [`Hart`] over the supervisor CSRs and the SBI timer.

use crate::board::{CLOCK_FREQ, TICKS_PER_SEC};
use crate::sbi::set_timer;
use core::arch::asm;
use kcore::config::PAGE_SIZE_BITS;
use kcore::mm::PhysAddr;
use kcore::task::TrapFrame;
use kcore::Hart;
use riscv::register::{mtvec::TrapMode, satp, stvec, time};

/// `satp.MODE` for Sv39.
const SATP_SV39: usize = 8 << 60;

/// The hart the kernel runs on.
pub struct RiscvHart;

impl Hart for RiscvHart {
    fn write_ptbr(&self, root: PhysAddr) {
        unsafe {
            satp::write(SATP_SV39 | (root.0 >> PAGE_SIZE_BITS));
            asm!("sfence.vma");
        }
    }

    fn flush_tlb(&self) {
        unsafe {
            asm!("sfence.vma");
        }
    }

    fn read_cycles(&self) -> u64 {
        time::read() as u64
    }

    fn timebase_freq(&self) -> u64 {
        CLOCK_FREQ as u64
    }

    fn restart_timer(&self) {
        set_timer((time::read() + CLOCK_FREQ / TICKS_PER_SEC) as u64);
    }

    unsafe fn restore_user_context(&self, frame: *const TrapFrame) -> ! {
        extern "C" {
            fn __alltraps();
            fn __restore();
        }
        unsafe {
            stvec::write(__alltraps as usize, TrapMode::Direct);
            asm!(
                "fence.i",
                "jr {restore}",
                restore = in(reg) __restore as usize,
                in("a0") frame,
                options(noreturn)
            )
        }
    }
}
