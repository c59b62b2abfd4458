//! The QEMU `virt` machine.

/// Frequency of the `time` CSR.
pub const CLOCK_FREQ: usize = 10_000_000;
/// Timer interrupts per second.
pub const TICKS_PER_SEC: usize = 100;

/// First byte of RAM, mapped at `KERNEL_VMA`.
pub const MEMORY_START: usize = 0x8000_0000;
/// End of RAM (128 MiB).
pub const MEMORY_END: usize = 0x8800_0000;

// https://github.com/qemu/qemu/blob/master/hw/riscv/virt.c
/// Device windows mapped into the I/O window at boot.
pub const MMIO: &[(usize, usize)] = &[
    (0x0010_0000, 0x00_2000), // VIRT_TEST/RTC  in virt machine
    (0x0C00_0000, 0x21_0000), // VIRT_PLIC in virt machine
    (0x1000_0000, 0x00_9000), // VIRT_UART0 in virt machine
];
