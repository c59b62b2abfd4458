//! Trap Handling Module
//!
//! - Set CSR `stvec` to `__alltraps` before entering user mode.
//! - On trap, `__alltraps` saves the user registers into the frame of the
//!   running process (`sscratch` points to it), switches to the process's
//!   kernel stack and calls [`trap_handler`].
//! - Handle [`Exception`] and [`Interrupt`], then resume a process through
//!   `__restore`.

use crate::hart::RiscvHart;
use crate::syscall::syscall;
use crate::KERNEL;
use core::arch::global_asm;
use kcore::task::TrapFrame;
use kcore::Hart;
use log::{debug, warn};
use riscv::register::{
    mtvec::TrapMode,
    scause::{self, Exception, Interrupt, Trap},
    sie, stval, stvec,
};

global_asm!(include_str!("trap.S"));

/// initialize CSR `stvec` as the entry of kernel-mode traps
pub fn init() {
    set_kernel_trap_entry();
}

/// timer interrupt enabled
pub fn enable_timer_interrupt() {
    unsafe {
        sie::set_stimer();
    }
}

/// handle an interrupt, exception, or system call from user space
#[no_mangle]
pub extern "C" fn trap_handler() -> ! {
    set_kernel_trap_entry();
    let scause = scause::read();
    let stval = stval::read();

    match scause.cause() {
        Trap::Exception(Exception::UserEnvCall) => {
            let (id, args) = {
                let mut kernel = KERNEL.exclusive_access();
                let Some(cx) = kernel.current_frame() else {
                    panic!("system call with no running process");
                };
                // jump to next instruction anyway
                cx.sepc += 4;
                (cx.x[TrapFrame::A7], [cx.x[10], cx.x[11], cx.x[12]])
            };
            let result = syscall(id, args);
            // the caller may be gone after exit
            if let Some(cx) = KERNEL.exclusive_access().current_frame() {
                cx.x[TrapFrame::A0] = result as usize;
            }
            leave()
        }
        Trap::Exception(
            Exception::StoreFault
            | Exception::StorePageFault
            | Exception::InstructionFault
            | Exception::InstructionPageFault
            | Exception::LoadFault
            | Exception::LoadPageFault
            | Exception::IllegalInstruction,
        ) => {
            let mut kernel = KERNEL.exclusive_access();
            if let Some(slot) = kernel.procs.current() {
                warn!(
                    "[kernel] {:?} in process {slot}, bad addr = {:#x}, bad instruction = {:#x}, kernel killed it.",
                    scause.cause(),
                    stval,
                    kernel.procs.get(slot).regs.sepc,
                );
                kernel.exit(slot);
            }
            drop(kernel);
            switch_to_user()
        }
        Trap::Interrupt(Interrupt::SupervisorTimer) => switch_to_user(),
        _ => {
            panic!(
                "Unsupported trap {:?}, stval = {:#x}!",
                scause.cause(),
                stval
            );
        }
    }
}

/// Resume the running process, or schedule if it is gone.
pub fn leave() -> ! {
    let frame = {
        let mut kernel = KERNEL.exclusive_access();
        match kernel.procs.current() {
            Some(slot) => core::ptr::from_ref(&kernel.procs.get(slot).regs),
            None => kernel.schedule(),
        }
    };
    resume(frame)
}

/// Charge the running process, pick the next one and enter it.
pub fn switch_to_user() -> ! {
    let frame = KERNEL.exclusive_access().schedule();
    debug!("trap: resume at {:#x}", unsafe { (*frame).sepc });
    resume(frame)
}

fn resume(frame: *const TrapFrame) -> ! {
    // SAFETY: frames live in the process table inside `KERNEL`, which is
    // mapped in every address space, and the borrow is released.
    unsafe { RiscvHart.restore_user_context(frame) }
}

/// Unimplement: traps/interrupts/exceptions from kernel mode
#[no_mangle]
pub extern "C" fn kernel_trap_handler() -> ! {
    use riscv::register::sepc;
    debug!("stval = {:#x}, sepc = {:#x}", stval::read(), sepc::read());
    panic!("a trap {:?} from kernel!", scause::read().cause());
}

fn set_kernel_trap_entry() {
    unsafe {
        stvec::write(kernel_trap_handler as usize, TrapMode::Direct);
    }
}
