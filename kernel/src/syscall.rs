//! System calls: `write`, `exit` and `fork`.
//!
//! Arguments come in `a0`-`a2`, the call number in `a7`; the result goes
//! back in `a0`, negative for an error.

use crate::console::write_bytes;
use crate::sbi::shutdown;
use crate::KERNEL;
use kcore::config::PAGE_SIZE;
use kcore::mm::{PTEFlags, PageTable, VirtAddr};
use kcore::task::ProcError;
use log::{info, trace, warn};

const SYSCALL_WRITE: usize = 64;
const SYSCALL_EXIT: usize = 93;
const SYSCALL_FORK: usize = 220;

const EAGAIN: isize = 11;
const ENOMEM: isize = 12;
const EFAULT: isize = 14;
const EBADF: isize = 9;
const ENOSYS: isize = 38;

const FD_STDOUT: usize = 1;
const FD_STDERR: usize = 2;

/// Dispatch system call `id`.
pub fn syscall(id: usize, args: [usize; 3]) -> isize {
    match id {
        SYSCALL_WRITE => sys_write(args[0], args[1], args[2]),
        SYSCALL_EXIT => sys_exit(args[0] as i32),
        SYSCALL_FORK => sys_fork(),
        _ => {
            warn!("[kernel] Unsupported syscall_id: {id}");
            -ENOSYS
        }
    }
}

/// Write `len` bytes at user address `buf` to the console.
fn sys_write(fd: usize, buf: usize, len: usize) -> isize {
    if fd != FD_STDOUT && fd != FD_STDERR {
        return -EBADF;
    }
    let kernel = KERNEL.exclusive_access();
    let Some(slot) = kernel.procs.current() else {
        return -EFAULT;
    };
    let map = kernel.mm.map;
    let pt = PageTable::from_root(kernel.procs.get(slot).vm.root(), map);

    let end = buf.saturating_add(len);
    let mut va = buf;
    while va < end {
        let chunk = (VirtAddr(va).align_down().0 + PAGE_SIZE).min(end) - va;
        match pt.translate(VirtAddr(va)) {
            Some((pa, flags)) if flags.contains(PTEFlags::U) => {
                write_bytes(map.bytes(pa, chunk));
            }
            _ => return -EFAULT,
        }
        va += chunk;
    }
    len as isize
}

/// Terminate the calling process.
fn sys_exit(exit_code: i32) -> isize {
    let mut kernel = KERNEL.exclusive_access();
    if let Some(slot) = kernel.procs.current() {
        trace!("[kernel] process {slot} exited with code {exit_code}");
        kernel.exit(slot);
    }
    if kernel.procs.active_count() == 0 {
        info!("[kernel] all processes exited");
        shutdown(false);
    }
    0
}

/// Duplicate the calling process. The parent gets the child's slot, the
/// child gets 0.
fn sys_fork() -> isize {
    let mut kernel = KERNEL.exclusive_access();
    let Some(parent) = kernel.procs.current() else {
        return -EFAULT;
    };
    match kernel.fork(parent) {
        Ok(child) => child as isize,
        Err(ProcError::NoFreeSlot) => -EAGAIN,
        Err(ProcError::OutOfMemory(e)) => {
            warn!("[kernel] fork of {parent} failed: {e}");
            -ENOMEM
        }
    }
}
