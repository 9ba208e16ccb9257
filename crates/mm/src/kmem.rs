//! Kernel virtual memory bootstrap layer: reserves kernel VA through an
//! [`Rman`], backs it with physical pages from [`pmm`], and maps it through
//! a [`PmapOps`] implementation. [`kmalloc`](crate::kmalloc) arenas and
//! [`pool`](crate::pool) slabs are both built on top of this.

use core::fmt;
use core::marker::PhantomData;

use talus_core::addr::VirtAddr;
use talus_core::paging::{Page, PhysFrame, Size4KiB};
use talus_core::{kerr, kinfo};

use crate::mapper::{MapFlags, MapFlush, PmapOps};
use crate::pmm::{self, PmmError};
use crate::rman::{Resource, Rman, ResourceFlags, ResourceHandle};
use crate::PAGE_SIZE;

/// Allocation flags recognized by every layer in this crate that can block
/// or zero its result: kmem, kmalloc, and pool.
pub mod flags {
    bitflags::bitflags! {
        /// Memory-allocation request flags.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct AllocFlags: u32 {
            /// The caller may be put to sleep awaiting memory.
            const WAITOK = 1 << 0;
            /// The caller must never block; return failure instead.
            const NOWAIT = 1 << 1;
            /// Zero the returned memory before returning it.
            const ZERO   = 1 << 2;
        }
    }

    impl AllocFlags {
        /// Validates that exactly one of WAITOK/NOWAIT is set.
        pub fn validate(self) -> Result<(), super::KmemError> {
            let wait = self.contains(AllocFlags::WAITOK);
            let nowait = self.contains(AllocFlags::NOWAIT);
            if wait == nowait {
                return Err(super::KmemError::InvalidFlags);
            }
            Ok(())
        }

        /// Whether the caller is allowed to block for this request.
        pub fn may_block(self) -> bool {
            self.contains(AllocFlags::WAITOK)
        }

        /// Whether the returned memory must be zeroed.
        pub fn zero(self) -> bool {
            self.contains(AllocFlags::ZERO)
        }
    }
}

pub use flags::AllocFlags;

/// Errors from kernel VA allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmemError {
    /// Both or neither of WAITOK/NOWAIT were set.
    InvalidFlags,
    /// The kernel VA `Rman` has no range large enough.
    AddressSpaceExhausted,
    /// Physical pages could not be allocated to back the request.
    OutOfMemory,
}

impl fmt::Display for KmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KmemError::InvalidFlags => write!(f, "exactly one of WAITOK/NOWAIT must be set"),
            KmemError::AddressSpaceExhausted => write!(f, "kernel virtual address space exhausted"),
            KmemError::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

impl From<PmmError> for KmemError {
    fn from(e: PmmError) -> Self {
        match e {
            PmmError::OutOfMemory => KmemError::OutOfMemory,
            _ => KmemError::OutOfMemory,
        }
    }
}

/// A virtually-contiguous, physically-backed kernel allocation.
///
/// Dropping this value does **not** unmap or free it — kmem allocations are
/// long-lived arenas owned by [`kmalloc`](crate::kmalloc)/[`pool`](crate::pool);
/// callers reverse an allocation explicitly with [`KmemAllocator::free`].
#[derive(Debug, Clone, Copy)]
pub struct KmemRegion {
    /// Start of the mapped virtual range.
    pub start: VirtAddr,
    /// Size in bytes (always a multiple of [`PAGE_SIZE`]).
    pub size: usize,
    handle: ResourceHandle,
}

/// Ties the kernel VA [`Rman`] and the physical allocator together behind a
/// [`PmapOps`] implementation.
pub struct KmemAllocator<P: PmapOps> {
    va: Rman,
    _marker: PhantomData<P>,
}

impl<P: PmapOps> KmemAllocator<P> {
    /// Creates a kmem allocator that will hand out ranges of `[base, base +
    /// size)` kernel virtual address space.
    pub fn new(base: VirtAddr, size: u64) -> Self {
        let mut va = Rman::new("kmem-va");
        va.manage_region(base.as_u64(), size)
            .expect("kmem: initial VA region must not overlap anything");
        Self {
            va,
            _marker: PhantomData,
        }
    }

    /// Reserves `size` bytes of kernel VA (rounded up to whole pages),
    /// allocates that many physical pages from the global PMM, and maps
    /// them in order through `pmap`.
    ///
    /// On any failure partway through mapping, all pages mapped so far are
    /// unmapped and freed, and the VA reservation is released, leaving no
    /// partial allocation behind.
    pub fn alloc(
        &mut self,
        pmap: &P,
        size: usize,
        flags: AllocFlags,
    ) -> Result<KmemRegion, KmemError> {
        flags.validate()?;
        let pages = crate::round_up_to_page(size) / PAGE_SIZE;
        let byte_size = (pages * PAGE_SIZE) as u64;

        let bound_start = self.va.resources().first().map(Resource::start).unwrap_or(0);
        let handle = self
            .va
            .reserve(
                bound_start,
                u64::MAX,
                byte_size,
                PAGE_SIZE as u64,
                ResourceFlags::ACTIVE,
            )
            .map_err(|_| KmemError::AddressSpaceExhausted)?;
        let start = VirtAddr::new(self.va.get(handle).expect("just reserved").start());

        let mut mapped = 0usize;
        for i in 0..pages {
            let frame = match pmm::alloc_pages(1) {
                Ok(f) => f,
                Err(_) => {
                    self.unwind(pmap, start, mapped);
                    let _ = self.va.release(handle);
                    if flags.may_block() {
                        panic!("kmem: out of physical memory under M_WAITOK");
                    }
                    return Err(KmemError::OutOfMemory);
                }
            };
            if flags.zero() {
                unsafe { pmap.pmap_zero_page(frame) };
            }
            let page = Page::<Size4KiB>::containing_address(start + (i as u64) * PAGE_SIZE as u64);
            unsafe { pmap.pmap_kenter(page, frame, MapFlags::WRITABLE).flush() };
            mapped += 1;
        }

        kinfo!("kmem: mapped {} bytes at {:#x}", byte_size, start.as_u64());
        Ok(KmemRegion {
            start,
            size: byte_size as usize,
            handle,
        })
    }

    fn unwind(&mut self, pmap: &P, start: VirtAddr, mapped_pages: usize) {
        for i in 0..mapped_pages {
            let page = Page::<Size4KiB>::containing_address(start + (i as u64) * PAGE_SIZE as u64);
            if let Ok((frame, flush)) = unsafe { pmap.pmap_kremove(page) } {
                flush.flush();
                pmm::free_pages(frame, 1);
            }
        }
    }

    /// Reverses an allocation from [`alloc`](Self::alloc): unmaps every
    /// page, frees the physical frames, and releases the VA reservation.
    pub fn free(&mut self, pmap: &P, region: KmemRegion) {
        let pages = region.size / PAGE_SIZE;
        self.unwind(pmap, region.start, pages);
        self.va
            .deactivate(region.handle)
            .expect("kmem: region handle must still be reserved");
        self.va
            .release(region.handle)
            .unwrap_or_else(|e| {
                kerr!("kmem: failed to release VA region: {e}");
                panic!("kmem: corrupt VA resource manager");
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::tests::FakePmap;

    fn fresh_pmm(pages: usize) {
        pmm::init(
            &[crate::PhysMemoryRegion {
                start: talus_core::addr::PhysAddr::new(0),
                size: (pages * PAGE_SIZE) as u64,
                usable: true,
            }],
            &[],
        );
    }

    #[test]
    fn alloc_then_free_roundtrip() {
        fresh_pmm(16);
        let pmap = FakePmap::new();
        let mut kmem = KmemAllocator::<FakePmap>::new(VirtAddr::new(0x1_0000_0000), 0x10_0000);
        let region = kmem
            .alloc(&pmap, 3 * PAGE_SIZE, AllocFlags::WAITOK)
            .unwrap();
        assert_eq!(region.size, 3 * PAGE_SIZE);
        let page0 = Page::<Size4KiB>::containing_address(region.start);
        assert!(pmap.is_mapped(page0));

        let free_before = pmm::with(|mgr| mgr.free_pages());
        kmem.free(&pmap, region);
        let free_after = pmm::with(|mgr| mgr.free_pages());
        assert_eq!(free_after, free_before + 3);
        assert!(!pmap.is_mapped(page0));
    }

    #[test]
    fn flags_must_pick_exactly_one() {
        assert!((AllocFlags::WAITOK | AllocFlags::NOWAIT).validate().is_err());
        assert!(AllocFlags::empty().validate().is_err());
        assert!(AllocFlags::WAITOK.validate().is_ok());
    }

    #[test]
    fn nowait_returns_err_on_oom() {
        fresh_pmm(1);
        let pmap = FakePmap::new();
        let mut kmem = KmemAllocator::<FakePmap>::new(VirtAddr::new(0x2_0000_0000), 0x10_0000);
        // First page succeeds, second has no physical memory left.
        let _ = kmem.alloc(&pmap, PAGE_SIZE, AllocFlags::NOWAIT).unwrap();
        let err = kmem.alloc(&pmap, PAGE_SIZE, AllocFlags::NOWAIT);
        assert_eq!(err, Err(KmemError::OutOfMemory));
    }
}
