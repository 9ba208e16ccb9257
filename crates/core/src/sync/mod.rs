//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`], suitable for use in `static` items and usable
//! before any allocator or scheduler is available. Every lock in the memory
//! stack — physical memory, resource managers, heap pools, slab pools,
//! amaps, anons, and VM maps — is built from this single primitive; none of
//! those subsystems run atop a blocking scheduler in this repository.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
