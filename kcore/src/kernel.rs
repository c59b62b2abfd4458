//! The state of one kernel instance and the operations other kernel code
//! calls into.

use crate::config::{
    DEFAULT_QUANTUM_MS, INIT_ENTRY_POINT, KERNEL_STACK_SIZE, PAGE_SIZE, USER_STACK_SIZE,
    USER_STACK_TOP,
};
use crate::hart::Hart;
use crate::mm::{round_up, AddressSpace, DirectMap, MemError, Mm, PhysAddr, VirtAddr, Vm};
use crate::task::{ProcError, ProcState, ProcTable, TrapFrame};
use core::ptr::NonNull;
use log::{debug, info};

/// Where the init program sits in physical memory.
#[derive(Copy, Clone, Debug)]
pub struct InitImage {
    /// Start of the code.
    pub text: PhysAddr,
    /// Bytes of code.
    pub text_len: usize,
    /// Start of the initialised data.
    pub data: PhysAddr,
    /// Bytes of initialised data, may be zero.
    pub data_len: usize,
}

/// Allocators, address spaces and processes of one hart.
pub struct Kernel<H: Hart> {
    /// Frame and slab allocators.
    pub mm: Mm,
    /// Virtual memory manager.
    pub vm: Vm,
    /// Process table and scheduler.
    pub procs: ProcTable,
    /// The hart the kernel runs on.
    pub hart: H,
}

impl<H: Hart> Kernel<H> {
    /// Kernel over `hart` with empty allocators and process table.
    pub fn new(hart: H, map: DirectMap, vm: Vm) -> Self {
        Self {
            mm: Mm::new(map),
            vm,
            procs: ProcTable::new(),
            hart,
        }
    }

    /// Hand `[base, base + size)` to the frame allocator and reset the slab.
    ///
    /// # Errors
    /// [`MemError::InvalidArgument`] if `size` is zero.
    pub fn init_frame_allocator(&mut self, base: PhysAddr, size: usize) -> Result<(), MemError> {
        self.mm.frames.init(base, size)?;
        self.mm.slab.init();
        info!("mm: {size:#x} bytes free from {base:?}");
        Ok(())
    }

    /// Allocate `n` contiguous pages.
    pub fn alloc_pages(&mut self, n: usize) -> Option<PhysAddr> {
        self.mm.frames.alloc_pages(n)
    }

    /// Return `n` pages starting at `base`.
    ///
    /// # Errors
    /// [`MemError::InvalidArgument`] if `n` is zero.
    pub fn free_pages(&mut self, base: PhysAddr, n: usize) -> Result<(), MemError> {
        self.mm.frames.free(base, n * PAGE_SIZE)
    }

    /// See [`Mm::slab_alloc`].
    ///
    /// # Errors
    /// See [`Mm::slab_alloc`].
    pub fn slab_alloc(&mut self, size: usize) -> Result<NonNull<u8>, MemError> {
        self.mm.slab_alloc(size)
    }

    /// See [`Mm::slab_free`].
    pub fn slab_free(&mut self, ptr: NonNull<u8>, size: usize) {
        self.mm.slab_free(ptr, size);
    }

    /// Map `[start, end)` into the address space of process `slot`.
    ///
    /// # Errors
    /// See [`Vm::map`].
    pub fn vm_map(
        &mut self,
        slot: usize,
        phys: Option<PhysAddr>,
        start: VirtAddr,
        end: VirtAddr,
    ) -> Result<PhysAddr, MemError> {
        let space = &mut self.procs.get_mut(slot).vm;
        self.vm.map(&mut self.mm, space, phys, start, end)
    }

    /// Install the kernel mappings into the address space of process `slot`.
    ///
    /// # Errors
    /// See [`Vm::map_kernel`].
    pub fn vm_map_kernel(&mut self, slot: usize) -> Result<(), MemError> {
        let space = &mut self.procs.get_mut(slot).vm;
        self.vm.map_kernel(&mut self.mm, space)
    }

    /// See [`Vm::map_io`].
    ///
    /// # Errors
    /// See [`Vm::map_io`].
    pub fn vm_map_io(&mut self, phys: PhysAddr, size: usize) -> Result<usize, MemError> {
        self.vm.map_io(&mut self.mm, &self.hart, phys, size)
    }

    /// Mark every process slot free.
    pub fn init_process_table(&mut self) {
        self.procs.init();
    }

    /// Saved registers of the running process.
    pub fn current_frame(&mut self) -> Option<&mut TrapFrame> {
        let slot = self.procs.current()?;
        Some(&mut self.procs.get_mut(slot).regs)
    }

    /// Charge the running process, pick the next one and install its
    /// address space. Returns the frame to resume it from.
    pub fn schedule(&mut self) -> *const TrapFrame {
        self.procs
            .stop_context(self.hart.read_cycles(), self.hart.timebase_freq());
        let slot = self.procs.pick_proc();
        let proc = self.procs.get(slot);
        debug!("sched: run {} ({slot}), {} ns left", proc.name(), proc.counter_ns);
        self.vm.switch_address_space(&self.hart, &proc.vm);
        self.hart.restart_timer();
        self.procs.start_context(slot, self.hart.read_cycles());
        &self.procs.get(slot).regs
    }

    /// [`Kernel::schedule`], then return to user mode.
    pub fn switch_to_user(&mut self) -> ! {
        let frame = self.schedule();
        // SAFETY: the frame lives in the process table and its address space
        // was just installed.
        unsafe { self.hart.restore_user_context(frame) }
    }

    /// Create the first process in slot 0.
    ///
    /// # Errors
    /// [`ProcError::NoFreeSlot`] if slot 0 is taken,
    /// [`ProcError::OutOfMemory`] if its memory cannot be set up.
    pub fn spawn_init(&mut self, image: &InitImage) -> Result<usize, ProcError> {
        const SLOT: usize = 0;
        if self.procs.get(SLOT).is_active() {
            return Err(ProcError::NoFreeSlot);
        }
        let (mut space, stack) = self.new_process_memory()?;
        if let Err(e) = self.map_init_image(&mut space, image) {
            self.release_process_memory(&mut space, stack);
            return Err(e.into());
        }

        let kernel_sp = self.mm.map.va(stack) + KERNEL_STACK_SIZE;
        let proc = self.procs.get_mut(SLOT);
        proc.regs = TrapFrame::app_init_context(INIT_ENTRY_POINT, USER_STACK_TOP, kernel_sp);
        proc.vm = space;
        proc.kernel_stack = Some(stack);
        proc.counter_ns = 0;
        proc.quantum_ms = DEFAULT_QUANTUM_MS;
        proc.set_name("init");
        proc.state = ProcState::Active;
        info!("task: spawned init, root {:?}", proc.vm.root());
        Ok(SLOT)
    }

    /// Copy process `parent` into a free slot. The child resumes where the
    /// parent trapped, seeing 0 in `a0`. Returns the child's slot.
    ///
    /// # Errors
    /// [`ProcError::NoFreeSlot`] if the table is full,
    /// [`ProcError::OutOfMemory`] if the copy does not fit; nothing of the
    /// child is left behind.
    pub fn fork(&mut self, parent: usize) -> Result<usize, ProcError> {
        let slot = self.procs.free_slot().ok_or(ProcError::NoFreeSlot)?;
        let (mut space, stack) = self.new_process_memory()?;
        let parent = self.procs.get(parent);
        if let Err(e) = self.vm.duplicate(&mut self.mm, &parent.vm, &mut space) {
            self.release_process_memory(&mut space, stack);
            return Err(e.into());
        }

        let mut regs = parent.regs;
        regs.x[TrapFrame::A0] = 0;
        regs.kernel_sp = self.mm.map.va(stack) + KERNEL_STACK_SIZE;
        let (quantum_ms, name) = (parent.quantum_ms, parent.name);

        let child = self.procs.get_mut(slot);
        child.regs = regs;
        child.vm = space;
        child.kernel_stack = Some(stack);
        child.counter_ns = 0;
        child.quantum_ms = quantum_ms;
        child.name = name;
        child.state = ProcState::Active;
        debug!("task: forked {slot}");
        Ok(slot)
    }

    /// Release process `slot`: its address space, kernel stack and slot.
    pub fn exit(&mut self, slot: usize) {
        if !self.procs.get(slot).is_active() {
            return;
        }
        if self.procs.current() == Some(slot) {
            self.hart.write_ptbr(self.vm.kernel_root());
            self.procs.clear_current();
        }
        let proc = self.procs.get_mut(slot);
        self.vm.teardown(&mut self.mm, &mut proc.vm);
        if let Some(stack) = proc.kernel_stack.take() {
            let _ = self.mm.frames.free(stack, KERNEL_STACK_SIZE);
        }
        proc.counter_ns = 0;
        proc.state = ProcState::FreeSlot;
        info!("task: {} ({slot}) exited", proc.name());
    }

    fn new_process_memory(&mut self) -> Result<(AddressSpace, PhysAddr), MemError> {
        let mut space = self.vm.new_space(&mut self.mm)?;
        let Some(stack) = self.mm.alloc_zeroed_pages(KERNEL_STACK_SIZE / PAGE_SIZE) else {
            self.vm.teardown(&mut self.mm, &mut space);
            return Err(MemError::OutOfMemory);
        };
        Ok((space, stack))
    }

    fn release_process_memory(&mut self, space: &mut AddressSpace, stack: PhysAddr) {
        self.vm.teardown(&mut self.mm, space);
        let _ = self.mm.frames.free(stack, KERNEL_STACK_SIZE);
    }

    fn map_init_image(&mut self, space: &mut AddressSpace, image: &InitImage) -> Result<(), MemError> {
        let text_size = round_up(image.text_len, PAGE_SIZE);
        let text_start = VirtAddr(INIT_ENTRY_POINT);
        let data_start = text_start + text_size;
        self.vm
            .map(&mut self.mm, space, Some(image.text), text_start, data_start)?;
        if image.data_len > 0 {
            let data_end = data_start + round_up(image.data_len, PAGE_SIZE);
            self.vm
                .map(&mut self.mm, space, Some(image.data), data_start, data_end)?;
        }
        let stack_base = VirtAddr(USER_STACK_TOP - USER_STACK_SIZE);
        self.vm
            .map(&mut self.mm, space, None, stack_base, VirtAddr(USER_STACK_TOP))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{KERNEL_VMA, PROC_MAX};
    use crate::mm::{PTEFlags, PageTable, PageTableEntry};
    use crate::testing::{MockHart, TestMemory};

    const FREQ: u64 = 10_000_000;

    /// Seeded allocators, a kernel directory mapping all of `mem` at
    /// `KERNEL_VMA`, and an empty process table.
    fn boot(mem: &TestMemory) -> Kernel<MockHart> {
        let vm = Vm::new(PhysAddr(0), mem.base, mem.base + mem.size);
        let mut kernel = Kernel::new(MockHart::new(FREQ), mem.map, vm);
        kernel.init_frame_allocator(mem.base, mem.size).unwrap();
        let root = kernel.mm.alloc_zeroed_pages(1).unwrap();
        PageTable::from_root(root, mem.map).directory()[384] =
            PageTableEntry::new(mem.base.floor(), PTEFlags::PROT_KERNEL_EXEC);
        kernel.vm = Vm::new(root, mem.base, mem.base + mem.size);
        kernel.init_process_table();
        kernel
    }

    fn init_image(kernel: &mut Kernel<MockHart>) -> InitImage {
        let text = kernel.alloc_pages(1).unwrap();
        kernel.mm.map.bytes(text, 4).copy_from_slice(&[0x13, 0, 0, 0]);
        InitImage {
            text,
            text_len: 4,
            data: PhysAddr(0),
            data_len: 0,
        }
    }

    #[test]
    fn boot_seed() {
        let mem = TestMemory::new(64 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        assert_eq!(kernel.procs.active_count(), 0);

        let pages = kernel.alloc_pages(2).unwrap();
        assert!(pages.is_aligned());
        kernel.free_pages(pages, 2).unwrap();
        assert_eq!(kernel.free_pages(pages, 0), Err(MemError::InvalidArgument));

        let obj = kernel.slab_alloc(64).unwrap();
        kernel.slab_free(obj, 64);
        assert_eq!(kernel.slab_alloc(64).unwrap(), obj);
    }

    #[test]
    fn init_starts_at_its_entry_point() {
        let mem = TestMemory::new(64 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let image = init_image(&mut kernel);
        assert_eq!(kernel.spawn_init(&image), Ok(0));

        let init = kernel.procs.get(0);
        assert_eq!(init.name(), "init");
        assert_eq!(init.quantum_ms, DEFAULT_QUANTUM_MS);
        assert_eq!(init.regs.sepc, INIT_ENTRY_POINT);
        assert_eq!(init.regs.sp(), USER_STACK_TOP);
        let space = &init.vm;
        assert_eq!(
            kernel.vm.translate(mem.map, space, VirtAddr(INIT_ENTRY_POINT)),
            Some(image.text)
        );
        assert!(kernel
            .vm
            .translate(mem.map, space, VirtAddr(USER_STACK_TOP - 8))
            .is_some());
        assert_eq!(kernel.spawn_init(&image), Err(ProcError::NoFreeSlot));

        let frame = kernel.schedule();
        assert_eq!(unsafe { (*frame).sepc }, INIT_ENTRY_POINT);
        assert_eq!(kernel.procs.current(), Some(0));
        assert_eq!(kernel.hart.ptbr(), Some(kernel.procs.get(0).vm.root()));
        assert_eq!(kernel.hart.timer_restarts(), 1);
        assert_eq!(kernel.current_frame().unwrap().sepc, INIT_ENTRY_POINT);
    }

    #[test]
    #[should_panic(expected = "return to user mode at 0x1000")]
    fn switch_to_user_resumes_the_picked_process() {
        let mem = TestMemory::new(64 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let image = init_image(&mut kernel);
        kernel.spawn_init(&image).unwrap();
        kernel.switch_to_user();
    }

    #[test]
    fn free_slots_have_nothing_to_map() {
        let mem = TestMemory::new(64 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let free = kernel.mm.frames.free_bytes();
        let va = VirtAddr(0x40_0000);

        assert!(kernel.procs.get(5).vm.is_empty());
        assert_eq!(
            kernel.vm_map(5, None, va, va + PAGE_SIZE),
            Err(MemError::InvalidArgument)
        );
        assert_eq!(kernel.vm_map_kernel(5), Err(MemError::InvalidArgument));
        assert_eq!(kernel.mm.frames.free_bytes(), free);
    }

    #[test]
    fn map_kernel_brings_in_new_io_mappings() {
        let mem = TestMemory::new(64 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let image = init_image(&mut kernel);
        kernel.spawn_init(&image).unwrap();
        let uart = kernel.vm_map_io(PhysAddr(0x1000_0000), 0x100).unwrap();

        let space = &kernel.procs.get(0).vm;
        assert_eq!(kernel.vm.translate(mem.map, space, VirtAddr(uart)), None);
        kernel.vm_map_kernel(0).unwrap();

        let space = &kernel.procs.get(0).vm;
        assert_eq!(
            kernel.vm.translate(mem.map, space, VirtAddr(uart)),
            Some(PhysAddr(0x1000_0000))
        );
        assert_eq!(
            kernel.vm.translate(mem.map, space, VirtAddr(KERNEL_VMA + 0x10)),
            Some(mem.base + 0x10)
        );
        // User mappings are untouched.
        assert_eq!(
            kernel.vm.translate(mem.map, space, VirtAddr(INIT_ENTRY_POINT)),
            Some(image.text)
        );
    }

    #[test]
    fn fork_duplicates_memory() {
        const V: VirtAddr = VirtAddr(0x40_0000);
        let mem = TestMemory::new(128 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let image = init_image(&mut kernel);
        kernel.spawn_init(&image).unwrap();
        let parent_pa = kernel.vm_map(0, None, V, V + PAGE_SIZE).unwrap();
        let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 7) as u8).collect();
        mem.map.bytes(parent_pa, PAGE_SIZE).copy_from_slice(&pattern);
        kernel.procs.get_mut(0).regs.x[TrapFrame::A0] = 0x55;
        kernel.procs.get_mut(0).quantum_ms = 30;

        let child = kernel.fork(0).unwrap();
        assert_eq!(child, 1);
        let (parent, kid) = (kernel.procs.get(0), kernel.procs.get(child));
        assert!(kid.is_active());
        assert_eq!(kid.quantum_ms, 30);
        assert_eq!(kid.name(), "init");
        assert_eq!(kid.regs.x[TrapFrame::A0], 0);
        assert_eq!(kid.regs.sepc, parent.regs.sepc);
        assert_ne!(kid.regs.kernel_sp, parent.regs.kernel_sp);

        let child_pa = kernel.vm.translate(mem.map, &kid.vm, V).unwrap();
        assert_ne!(child_pa, parent_pa);
        assert_eq!(mem.map.bytes(child_pa, PAGE_SIZE), &pattern[..]);
        mem.map.bytes(child_pa, PAGE_SIZE).fill(0);
        assert_eq!(mem.map.bytes(parent_pa, PAGE_SIZE), &pattern[..]);
        // Text is copied too, so the child owns all its frames.
        assert!(kid.vm.regions(mem.map).all(|r| r.owned));
    }

    #[test]
    fn fork_needs_a_free_slot() {
        let mem = TestMemory::new(64 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let image = init_image(&mut kernel);
        kernel.spawn_init(&image).unwrap();
        for slot in 1..PROC_MAX {
            kernel.procs.get_mut(slot).state = ProcState::Active;
        }
        let free = kernel.mm.frames.free_bytes();
        assert_eq!(kernel.fork(0), Err(ProcError::NoFreeSlot));
        assert_eq!(kernel.mm.frames.free_bytes(), free);
    }

    #[test]
    fn failed_fork_leaves_nothing_behind() {
        let mem = TestMemory::new(128 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let image = init_image(&mut kernel);
        kernel.spawn_init(&image).unwrap();

        let mut failures = 0;
        for spare in 0.. {
            let mut hog = Vec::new();
            while let Some(pa) = kernel.alloc_pages(1) {
                hog.push(pa);
            }
            for pa in hog.drain(..spare) {
                kernel.free_pages(pa, 1).unwrap();
            }
            let free = kernel.mm.frames.free_bytes();
            let result = kernel.fork(0);
            if let Ok(child) = result {
                assert_eq!(kernel.procs.active_count(), 2);
                kernel.exit(child);
                break;
            }
            assert!(matches!(result, Err(ProcError::OutOfMemory(MemError::OutOfMemory))));
            assert_eq!(kernel.mm.frames.free_bytes(), free);
            assert_eq!(kernel.procs.active_count(), 1);
            failures += 1;
            for pa in hog {
                kernel.free_pages(pa, 1).unwrap();
            }
        }
        assert!(failures > 0);
    }

    #[test]
    fn exit_returns_every_page() {
        let mem = TestMemory::new(128 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let image = init_image(&mut kernel);
        kernel.spawn_init(&image).unwrap();
        let free = kernel.mm.frames.free_bytes();

        let child = kernel.fork(0).unwrap();
        kernel.procs.get_mut(0).quantum_ms = 0;
        kernel.schedule();
        assert_eq!(kernel.procs.current(), Some(child));

        kernel.exit(child);
        assert_eq!(kernel.procs.get(child).state, ProcState::FreeSlot);
        assert!(kernel.procs.get(child).vm.is_empty());
        assert_eq!(kernel.procs.current(), None);
        assert_eq!(kernel.hart.ptbr(), Some(kernel.vm.kernel_root()));
        assert_eq!(kernel.mm.frames.free_bytes(), free);
        // Exiting a free slot does nothing.
        kernel.exit(child);
        assert_eq!(kernel.procs.free_slot(), Some(child));
    }

    #[test]
    fn budgets_follow_quanta() {
        let mem = TestMemory::new(128 * PAGE_SIZE);
        let mut kernel = boot(&mem);
        let image = init_image(&mut kernel);
        kernel.spawn_init(&image).unwrap();
        kernel.procs.get_mut(0).quantum_ms = 10;
        let other = kernel.fork(0).unwrap();
        kernel.procs.get_mut(other).quantum_ms = 30;

        let mut runs = [0usize; 2];
        for _ in 0..40 {
            kernel.schedule();
            runs[kernel.procs.current().unwrap()] += 1;
            kernel.hart.advance_ms(10);
        }
        assert_eq!(runs, [10, 30]);
    }
}
