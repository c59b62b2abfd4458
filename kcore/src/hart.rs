//! The hardware the core needs from the hart it runs on.

use crate::mm::PhysAddr;
use crate::task::TrapFrame;

/// Per-hart control registers and timer.
///
/// The kernel implements this over the supervisor CSRs and SBI; tests use a
/// mock with a settable clock.
pub trait Hart {
    /// Install the directory at `root` as the translation in use and flush
    /// the TLB.
    fn write_ptbr(&self, root: PhysAddr);

    /// Flush every cached translation.
    fn flush_tlb(&self);

    /// Free-running cycle counter.
    fn read_cycles(&self) -> u64;

    /// Ticks of [`Hart::read_cycles`] per second.
    fn timebase_freq(&self) -> u64;

    /// Arm the timer interrupt for the next tick.
    fn restart_timer(&self);

    /// Load the user registers saved in `frame` and return to user mode.
    ///
    /// # Safety
    /// `frame` must point to a frame that stays valid until the next trap
    /// and the address space it was saved in must be installed.
    unsafe fn restore_user_context(&self, frame: *const TrapFrame) -> !;
}
