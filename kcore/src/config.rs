//! Constants used in the memory manager and the scheduler

/// Size of a page and of every page-table level.
pub const PAGE_SIZE: usize = 0x1000;
/// `log2(PAGE_SIZE)`
pub const PAGE_SIZE_BITS: usize = 12;

/// Entries per page-table page (8-byte entries).
pub const PTES_PER_PAGE: usize = PAGE_SIZE / 8;
/// Shift of the directory index inside a virtual address.
pub const PGD_SHIFT: usize = 30;
/// Bytes covered by one directory entry.
pub const PGD_SIZE: usize = 1 << PGD_SHIFT;

/// Virtual address the kernel image is linked at.
pub const KERNEL_VMA: usize = 0xffff_ffe0_0000_0000;
/// First virtual address of the I/O mapping window.
pub const IOMAP_BASE: usize = 0xffff_ffff_0000_0000;
/// Capacity of the I/O mapping table.
pub const IOMAP_MAX: usize = 20;

/// Capacity of the hole table.
pub const NR_HOLES: usize = 512;

/// Entry point of the init process (its text is mapped there).
pub const INIT_ENTRY_POINT: usize = PAGE_SIZE;
/// Top of every user stack.
pub const USER_STACK_TOP: usize = 0x20_0000_0000;
/// Size of the initial user stack.
pub const USER_STACK_SIZE: usize = PAGE_SIZE;
/// Size of a per-process kernel stack.
pub const KERNEL_STACK_SIZE: usize = PAGE_SIZE;

/// Number of slots in the process table.
pub const PROC_MAX: usize = 256;
/// Maximum length of a process name, in bytes.
pub const PROC_NAME_MAX: usize = 16;
/// Time slice given to processes that do not configure their own.
pub const DEFAULT_QUANTUM_MS: u64 = 100;
