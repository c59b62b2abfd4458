//! Synchronization for the single-hart kernel.

mod up;

pub use up::UPIntrFreeCell;
