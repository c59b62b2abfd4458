//! # Kernel Entrypoint
//!
//! ## Overview
//!
//! - Include `entry.asm`: turn paging on with the boot page table and jump
//!   to [`rust_main`] in the `KERNEL_VMA` mapping.
//! - Zero out the .bss section.
//! - Hand the RAM after the kernel image to the frame allocator.
//! - Map the board's devices into the I/O window.
//! - Create the init process from the image linked into `.user.*`.
//! - Enable the timer interrupt and enter user mode.

#![deny(missing_docs)]
#![deny(warnings)]
#![no_std]
#![no_main]

#[cfg(feature = "board_qemu")]
#[path = "boards/qemu.rs"]
mod board;

#[macro_use]
mod console;
mod hart;
mod lang_items;
mod logging;
mod sbi;
mod sync;
mod syscall;
mod trap;

use core::arch::global_asm;
use hart::RiscvHart;
use kcore::config::KERNEL_VMA;
use kcore::mm::{DirectMap, PhysAddr, Vm};
use kcore::{InitImage, Kernel};
use lazy_static::lazy_static;
use log::info;
use sync::UPIntrFreeCell;

global_asm!(include_str!("entry.asm"));
global_asm!(include_str!("init.S"));

/// RAM at `pa` is at `pa + offset` in the kernel.
// SAFETY: the boot page table maps all of RAM at `KERNEL_VMA`.
const DIRECT_MAP: DirectMap = unsafe { DirectMap::new(KERNEL_VMA.wrapping_sub(board::MEMORY_START)) };

lazy_static! {
    /// Allocators, address spaces and processes.
    pub static ref KERNEL: UPIntrFreeCell<Kernel<RiscvHart>> = unsafe {
        UPIntrFreeCell::new(Kernel::new(
            RiscvHart,
            DIRECT_MAP,
            Vm::new(
                kernel_root(),
                PhysAddr(board::MEMORY_START),
                PhysAddr(board::MEMORY_END),
            ),
        ))
    };
}

/// the rust entrypoint of OS
#[no_mangle]
pub extern "C" fn rust_main(hart_id: usize, _dtb: usize) -> ! {
    clear_bss();
    logging::init();
    info!("[kernel] hart {hart_id} booting");
    trap::init();
    init_memory();
    map_devices();
    spawn_init();
    trap::enable_timer_interrupt();
    trap::switch_to_user()
}

/// clear BSS segment
fn clear_bss() {
    extern "C" {
        fn sbss();
        fn ebss();
    }

    unsafe {
        core::slice::from_raw_parts_mut(sbss as usize as *mut u8, ebss as usize - sbss as usize)
            .fill(0);
    }
}

/// Physical address of the boot page table, the kernel directory.
fn kernel_root() -> PhysAddr {
    extern "C" {
        fn boot_page_table();
    }
    DIRECT_MAP.pa(boot_page_table as usize)
}

fn init_memory() {
    extern "C" {
        fn ekernel();
    }
    let start = DIRECT_MAP.pa(ekernel as usize);
    let mut kernel = KERNEL.exclusive_access();
    if let Err(e) = kernel.init_frame_allocator(start, board::MEMORY_END - start.0) {
        panic!("no memory after the kernel image: {e}");
    }
}

fn map_devices() {
    let mut kernel = KERNEL.exclusive_access();
    for &(base, len) in board::MMIO {
        if let Err(e) = kernel.vm_map_io(PhysAddr(base), len) {
            panic!("cannot map device at {base:#x}: {e}");
        }
    }
}

fn spawn_init() {
    extern "C" {
        fn suser_text();
        fn euser_text();
        fn suser_data();
        fn euser_data();
    }
    let image = InitImage {
        text: DIRECT_MAP.pa(suser_text as usize),
        text_len: euser_text as usize - suser_text as usize,
        data: DIRECT_MAP.pa(suser_data as usize),
        data_len: euser_data as usize - suser_data as usize,
    };
    let mut kernel = KERNEL.exclusive_access();
    kernel.init_process_table();
    if let Err(e) = kernel.spawn_init(&image) {
        panic!("cannot create init: {e}");
    }
}
