//! Uniprocessor interior mutability with interrupts masked while borrowed.

use core::{
    cell::{RefCell, RefMut, UnsafeCell},
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

use lazy_static::lazy_static;
use riscv::register::sstatus;

struct UPSafeCellRaw<T> {
    inner: UnsafeCell<T>,
}

unsafe impl<T> Sync for UPSafeCellRaw<T> {}

impl<T> UPSafeCellRaw<T> {
    unsafe fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn as_mut(&self) -> &mut T {
        unsafe { &mut *self.inner.get() }
    }
}

#[derive(Default)]
struct IntrMaskingInfo {
    nested_level: usize,
    sie_before_masking: bool,
}

lazy_static! {
    static ref INTR_MASKING_INFO: UPSafeCellRaw<IntrMaskingInfo> =
        unsafe { UPSafeCellRaw::new(IntrMaskingInfo::default()) };
}

impl IntrMaskingInfo {
    fn enter(&mut self) {
        let sie = sstatus::read().sie();
        unsafe {
            sstatus::clear_sie();
        }
        if self.nested_level == 0 {
            self.sie_before_masking = sie;
        }
        self.nested_level += 1;
    }

    fn exit(&mut self) {
        self.nested_level -= 1;
        if self.nested_level == 0 && self.sie_before_masking {
            unsafe {
                sstatus::set_sie();
            }
        }
    }
}

/// A `RefCell` for statics on one hart; supervisor interrupts stay off
/// while it is borrowed.
pub struct UPIntrFreeCell<T> {
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPIntrFreeCell<T> {}

/// Borrow of an [`UPIntrFreeCell`].
pub struct UPIntrRefMut<'a, T>(ManuallyDrop<RefMut<'a, T>>);

impl<T> UPIntrFreeCell<T> {
    /// # Safety
    /// Only one hart may ever touch the cell.
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// Panic if the data has been borrowed.
    pub fn exclusive_access(&self) -> UPIntrRefMut<'_, T> {
        INTR_MASKING_INFO.as_mut().enter();
        UPIntrRefMut(ManuallyDrop::new(self.inner.borrow_mut()))
    }
}

impl<T> Drop for UPIntrRefMut<'_, T> {
    fn drop(&mut self) {
        // SAFETY: dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.0) };
        INTR_MASKING_INFO.as_mut().exit();
    }
}

impl<T> Deref for UPIntrRefMut<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for UPIntrRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
