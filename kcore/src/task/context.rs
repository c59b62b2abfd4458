//! Implementation of [`TrapFrame`]

/// `sstatus.SPIE`: interrupts come back on after `sret`.
const SSTATUS_SPIE: usize = 1 << 5;

/// User registers saved on trap entry and loaded on return to user mode.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// General-Purpose Register x0-31
    pub x: [usize; 32],
    /// Supervisor Exception Program Counter
    pub sepc: usize,
    /// Supervisor Status Register
    pub sstatus: usize,
    /// Top of the kernel stack of the process
    pub kernel_sp: usize,
}

impl TrapFrame {
    /// Index of `sp` in [`TrapFrame::x`].
    pub const SP: usize = 2;
    /// Index of `a0` in [`TrapFrame::x`].
    pub const A0: usize = 10;
    /// Index of `a7` in [`TrapFrame::x`].
    pub const A7: usize = 17;

    /// Frame that enters user mode at `entry` with stack `sp`.
    pub fn app_init_context(entry: usize, sp: usize, kernel_sp: usize) -> Self {
        let mut cx = Self {
            sepc: entry,
            // SPP clear: `sret` lands in user mode.
            sstatus: SSTATUS_SPIE,
            kernel_sp,
            ..Self::default()
        };
        cx.set_sp(sp);
        cx
    }

    /// Set the user stack pointer.
    pub fn set_sp(&mut self, sp: usize) {
        self.x[Self::SP] = sp;
    }

    /// The user stack pointer.
    pub fn sp(&self) -> usize {
        self.x[Self::SP]
    }
}
