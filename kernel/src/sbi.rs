//! SBI calls the kernel makes to the firmware.

/// Print one byte on the firmware console.
pub fn console_putchar(c: usize) {
    #[allow(deprecated)]
    sbi_rt::legacy::console_putchar(c);
}

/// Program the next timer interrupt at absolute time `timer`.
pub fn set_timer(timer: u64) {
    sbi_rt::set_timer(timer);
}

/// Power the machine off.
pub fn shutdown(failure: bool) -> ! {
    use sbi_rt::{system_reset, NoReason, Shutdown, SystemFailure};
    if failure {
        system_reset(Shutdown, SystemFailure);
    } else {
        system_reset(Shutdown, NoReason);
    }
    unreachable!()
}
