//! Task management implementation
//!
//! Processes live in a fixed table of [`PROC_MAX`] slots. Each active slot
//! carries a time budget in nanoseconds that the running process burns
//! down; [`ProcTable::pick_proc`] always runs the process with the most
//! budget left and refills every budget from its quantum once all are spent.
//!
//! Creating and destroying processes needs memory as well as a slot, so it
//! lives on [`crate::Kernel`].

mod context;

pub use context::TrapFrame;

use crate::config::{PROC_MAX, PROC_NAME_MAX};
use crate::mm::{AddressSpace, MemError, PhysAddr};
use log::debug;
use thiserror::Error;

/// Failures of process creation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// Every slot of the process table is in use.
    #[error("process table full")]
    NoFreeSlot,
    /// Not enough memory for the new address space or kernel stack.
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] MemError),
}

/// Slot state
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcState {
    /// Unused
    FreeSlot,
    /// Runnable
    Active,
}

/// Process control block
pub struct Proc {
    /// User registers while the process is not running.
    pub regs: TrapFrame,
    /// Address space of the process.
    pub vm: AddressSpace,
    /// Kernel stack page.
    pub kernel_stack: Option<PhysAddr>,
    /// Budget left in the current round, in nanoseconds.
    pub counter_ns: u64,
    /// Budget granted at every refill, in milliseconds.
    pub quantum_ms: u64,
    /// Slot state.
    pub state: ProcState,
    pub(crate) name: [u8; PROC_NAME_MAX],
}

impl Proc {
    fn empty() -> Self {
        Self {
            regs: TrapFrame::default(),
            vm: AddressSpace::empty(),
            kernel_stack: None,
            counter_ns: 0,
            quantum_ms: 0,
            state: ProcState::FreeSlot,
            name: [0; PROC_NAME_MAX],
        }
    }

    /// Process name.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(PROC_NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    /// Set the name, cut to [`PROC_NAME_MAX`] bytes.
    pub fn set_name(&mut self, name: &str) {
        let mut len = name.len().min(PROC_NAME_MAX);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.name = [0; PROC_NAME_MAX];
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    /// Whether the slot holds a process.
    pub fn is_active(&self) -> bool {
        self.state == ProcState::Active
    }
}

/// The process table and the scheduler state.
pub struct ProcTable {
    procs: [Proc; PROC_MAX],
    current: Option<usize>,
    switch_clock: u64,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTable {
    /// Table with every slot free.
    pub fn new() -> Self {
        Self {
            procs: core::array::from_fn(|_| Proc::empty()),
            current: None,
            switch_clock: 0,
        }
    }

    /// Mark every slot free and forget the running process.
    pub fn init(&mut self) {
        for proc in &mut self.procs {
            *proc = Proc::empty();
        }
        self.current = None;
        self.switch_clock = 0;
    }

    /// The process in `slot`.
    pub fn get(&self, slot: usize) -> &Proc {
        &self.procs[slot]
    }

    /// The process in `slot`, mutably.
    pub fn get_mut(&mut self, slot: usize) -> &mut Proc {
        &mut self.procs[slot]
    }

    /// Slot of the running process.
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Lowest free slot.
    pub fn free_slot(&self) -> Option<usize> {
        self.procs.iter().position(|p| p.state == ProcState::FreeSlot)
    }

    /// Number of active processes.
    pub fn active_count(&self) -> usize {
        self.procs.iter().filter(|p| p.is_active()).count()
    }

    /// Slot of the active process with the most budget left, the lowest
    /// slot on ties. Refills every budget once all are spent.
    ///
    /// Panics when no process is active, or when every quantum is zero.
    pub fn pick_proc(&mut self) -> usize {
        let mut refilled = false;
        loop {
            let best = self
                .procs
                .iter()
                .enumerate()
                .filter(|(_, p)| p.is_active())
                .fold(None, |best, (slot, p)| match best {
                    Some((_, counter)) if counter >= p.counter_ns => best,
                    _ => Some((slot, p.counter_ns)),
                });
            let Some((slot, counter)) = best else {
                panic!("no runnable process");
            };
            if counter > 0 {
                return slot;
            }
            assert!(!refilled, "every runnable process has a zero quantum");

            for proc in self.procs.iter_mut().filter(|p| p.is_active()) {
                proc.counter_ns = proc.quantum_ms.saturating_mul(1_000_000);
            }
            refilled = true;
            debug!("sched: budgets refilled");
        }
    }

    /// Charge the running process for the time since it was switched to.
    pub fn stop_context(&mut self, now: u64, freq: u64) {
        let delta = now.wrapping_sub(self.switch_clock);
        let ns = u128::from(delta) * 1_000_000_000 / u128::from(freq.max(1));
        let ns = u64::try_from(ns).unwrap_or(u64::MAX);
        if let Some(proc) = self.current.map(|slot| &mut self.procs[slot]) {
            proc.counter_ns = proc.counter_ns.saturating_sub(ns);
        }
        self.switch_clock = now;
    }

    /// Make `slot` the running process from `now` on.
    pub fn start_context(&mut self, slot: usize, now: u64) {
        self.current = Some(slot);
        self.switch_clock = now;
    }

    /// Forget the running process, after it left the table.
    pub fn clear_current(&mut self) {
        self.current = None;
    }
}
