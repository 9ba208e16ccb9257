//! Anonymous memory: one physical page, shared copy-on-write across amaps
//! after a `vm_map_clone` (fork).
//!
//! An [`Anon`] is always reached through an [`AnonRef`] (`Arc<SpinLock<Anon>>`);
//! the `Arc`'s strong count *is* the reference count, so "anon shared
//! by two amaps" and "`Arc::strong_count == 2`" are the same fact rather
//! than two things that have to be kept in sync by hand.

use alloc::sync::Arc;
use core::fmt;

use talus_core::paging::{PhysFrame, Size4KiB};
use talus_core::sync::SpinLock;

use crate::mapper::PmapOps;
use crate::pmm;

/// Errors that can abort a fault mid-resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No VM entry covers the faulting address, or protection forbids the
    /// requested access.
    SegV,
    /// A VM entry covers the address but the fault could not be serviced
    /// (e.g. physical memory exhausted).
    BusErr,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::SegV => write!(f, "segmentation violation"),
            FaultError::BusErr => write!(f, "bus error servicing page fault"),
        }
    }
}

/// A single physical page owned by one or more VM entries through a shared
/// amap slot.
pub struct Anon {
    frame: PhysFrame<Size4KiB>,
}

/// A shared handle to an [`Anon`]. Cloning an `AnonRef` and storing the
/// clone in another amap slot is, by construction, incrementing the anon's
/// reference count.
pub type AnonRef = Arc<SpinLock<Anon>>;

impl Anon {
    /// Allocates and zeroes a fresh physical page, wrapped as a new,
    /// singly-referenced anon.
    pub fn new_zeroed<P: PmapOps>(pmap: &P) -> Result<AnonRef, FaultError> {
        let frame = pmm::alloc_pages(1).map_err(|_| FaultError::BusErr)?;
        // SAFETY: `frame` was just allocated and is owned exclusively by
        // this anon; no other mapping can alias it yet.
        unsafe { pmap.pmap_zero_page(frame) };
        Ok(Arc::new(SpinLock::new(Anon { frame })))
    }

    /// Allocates a fresh page and copies `self`'s contents into it — the
    /// copy taken on a write fault against a shared (`ref_count > 1`) anon.
    pub fn copy<P: PmapOps>(&self, pmap: &P) -> Result<AnonRef, FaultError> {
        let frame = pmm::alloc_pages(1).map_err(|_| FaultError::BusErr)?;
        // SAFETY: `self.frame` is a live owned frame and `frame` was just
        // allocated, so the two cannot alias.
        unsafe { pmap.pmap_copy_page(self.frame, frame) };
        Ok(Arc::new(SpinLock::new(Anon { frame })))
    }

    /// The physical frame this anon owns.
    pub fn frame(&self) -> PhysFrame<Size4KiB> {
        self.frame
    }
}

impl Drop for Anon {
    fn drop(&mut self) {
        pmm::free_pages(self.frame, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::tests::FakePmap;
    use talus_core::addr::PhysAddr;

    fn fresh_pmm(pages: usize) {
        pmm::init(
            &[crate::PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: (pages * crate::PAGE_SIZE) as u64,
                usable: true,
            }],
            &[],
        );
    }

    #[test]
    fn new_zeroed_allocates_and_drop_frees() {
        fresh_pmm(4);
        let pmap = FakePmap::new();
        let free_before = pmm::with(|m| m.free_pages());
        let anon = Anon::new_zeroed(&pmap).unwrap();
        assert_eq!(pmm::with(|m| m.free_pages()), free_before - 1);
        drop(anon);
        assert_eq!(pmm::with(|m| m.free_pages()), free_before);
    }

    #[test]
    fn strong_count_tracks_ref_count() {
        fresh_pmm(4);
        let pmap = FakePmap::new();
        let anon = Anon::new_zeroed(&pmap).unwrap();
        assert_eq!(Arc::strong_count(&anon), 1);
        let shared = Arc::clone(&anon);
        assert_eq!(Arc::strong_count(&anon), 2);
        drop(shared);
        assert_eq!(Arc::strong_count(&anon), 1);
    }

    #[test]
    fn copy_creates_an_independent_frame() {
        fresh_pmm(4);
        let pmap = FakePmap::new();
        let anon = Anon::new_zeroed(&pmap).unwrap();
        let copied = { anon.lock().copy(&pmap).unwrap() };
        assert_ne!(anon.lock().frame(), copied.lock().frame());
    }
}
