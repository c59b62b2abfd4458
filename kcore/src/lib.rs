//! # Memory management and scheduling core
//!
//! Everything here is hardware independent: physical memory is reached
//! through a [`mm::DirectMap`] and the few privileged operations the core
//! needs go through the [`Hart`] trait. The boot crate supplies both.
//!
//! - [`mm`]: frame allocator, slab allocator, page tables, address spaces
//! - [`task`]: process table and scheduler
//! - [`Kernel`]: the two bound together, with process creation and exit

#![cfg_attr(not(test), no_std)]

pub mod config;
mod hart;
mod kernel;
pub mod mm;
pub mod task;

#[cfg(test)]
mod testing;

pub use hart::Hart;
pub use kernel::{InitImage, Kernel};
