//! The MMU-ops contract: the seam the architecture layer implements and
//! every other module in this crate calls through.
//!
//! Nothing in this crate ever manipulates page table bits directly. Instead
//! everything above this module talks to a `&dyn PmapOps`, so the whole
//! stack is host-testable with [`tests::FakePmap`] standing in for real
//! hardware.
//!
//! # TLB Flush Decoupling
//!
//! Architecture-specific TLB invalidation is registered at boot via
//! [`register_tlb_flush`]. Before registration, flushes are no-ops — correct
//! for early boot, where no stale TLB entries can yet exist, and for host
//! tests.

use core::sync::atomic::{AtomicPtr, Ordering};

use talus_core::addr::{PhysAddr, VirtAddr};
use talus_core::paging::{Page, PhysFrame, Size4KiB};

bitflags::bitflags! {
    /// Architecture-independent page protection/mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is executable (if unset, no-execute is implied where the
        /// architecture supports it).
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Global page (not flushed on address-space switch).
        const GLOBAL        = 1 << 3;
        /// Caching disabled for this page (used for MMIO mappings).
        const CACHE_DISABLE = 1 << 4;
    }
}

impl MapFlags {
    /// Returns the subset of `self` that corresponds to requested access.
    #[must_use]
    pub fn grants(self, access: AccessType) -> bool {
        match access {
            AccessType::Read => true,
            AccessType::Write => self.contains(MapFlags::WRITABLE),
            AccessType::Execute => self.contains(MapFlags::EXECUTABLE),
        }
    }
}

/// The kind of access that triggered a page fault, or that a caller is
/// requesting permission to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// A load.
    Read,
    /// A store.
    Write,
    /// An instruction fetch.
    Execute,
}

/// Error from unmap / protect / update_flags operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// The page is not mapped.
    NotMapped,
    /// The entry maps a different page size than requested.
    SizeMismatch,
}

impl core::fmt::Display for UnmapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UnmapError::NotMapped => write!(f, "page not mapped"),
            UnmapError::SizeMismatch => write!(f, "page size mismatch"),
        }
    }
}

// ---------------------------------------------------------------------------
// Registered TLB flush callback
// ---------------------------------------------------------------------------

static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

/// Registers the architecture-specific TLB flush function.
///
/// Must be called during early boot before any page table modifications
/// that require TLB invalidation.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: the pointer was stored via `register_tlb_flush`, which takes a
    // valid `fn(VirtAddr)`, or it is the initial `nop_flush`.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

// ---------------------------------------------------------------------------
// MapFlush
// ---------------------------------------------------------------------------

/// A pending TLB flush for a single page.
///
/// Flushes the TLB entry on drop unless [`.flush()`](Self::flush) or
/// [`.ignore()`](Self::ignore) is called first.
#[must_use = "TLB flush is pending; call .flush() or .ignore()"]
pub struct MapFlush {
    virt: VirtAddr,
    needs_flush: bool,
}

impl MapFlush {
    /// Creates a new pending flush for the given virtual address.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            needs_flush: true,
        }
    }

    /// Flushes the TLB entry immediately.
    pub fn flush(mut self) {
        self.needs_flush = false;
        arch_flush_page(self.virt);
    }

    /// Explicitly opts out of flushing (e.g. fresh mappings not yet in the
    /// TLB, or batched flushes handled by the caller).
    pub fn ignore(mut self) {
        self.needs_flush = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.needs_flush {
            arch_flush_page(self.virt);
        }
    }
}

// ---------------------------------------------------------------------------
// PmapOps — the MMU-ops contract
// ---------------------------------------------------------------------------

/// The interface the architecture layer provides to the memory core.
///
/// Every operation is named after its role in the fault/alloc paths it
/// serves rather than any particular hardware instruction, since the same
/// trait is implemented once per target (MIPS, RISC-V, AArch64).
///
/// # Safety
///
/// Implementations must correctly manipulate the hardware page tables
/// rooted at `pmap` for the architecture they target, and must never alias
/// a physical frame into two virtual addresses with incompatible
/// protections without the caller's knowledge.
pub unsafe trait PmapOps {
    /// Opaque per-address-space page table root.
    type Pmap: Copy;

    /// Establishes a mapping for a single kernel page. Used by `kmem` to
    /// back freshly reserved kernel VA with physical pages.
    ///
    /// # Safety
    ///
    /// `frame` must not already be mapped elsewhere with conflicting flags.
    unsafe fn pmap_kenter(
        &self,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
    ) -> MapFlush;

    /// Removes a kernel mapping previously installed by [`pmap_kenter`].
    ///
    /// Returns the frame that was mapped there, so the caller can return it
    /// to the physical allocator.
    ///
    /// # Safety
    ///
    /// `page` must currently be mapped by a prior `pmap_kenter` call for the
    /// same page size.
    unsafe fn pmap_kremove(
        &self,
        page: Page<Size4KiB>,
    ) -> Result<(PhysFrame<Size4KiB>, MapFlush), UnmapError>;

    /// Zeroes a physical page through whatever identity/HHDM window the
    /// architecture uses to access physical memory directly.
    ///
    /// # Safety
    ///
    /// `frame` must be a valid, owned physical frame.
    unsafe fn pmap_zero_page(&self, frame: PhysFrame<Size4KiB>);

    /// Copies one physical page's contents into another.
    ///
    /// # Safety
    ///
    /// Both frames must be valid, owned physical frames, and `dst` must not
    /// alias `src`.
    unsafe fn pmap_copy_page(&self, src: PhysFrame<Size4KiB>, dst: PhysFrame<Size4KiB>);

    /// Changes the protection of a single mapped page within `pmap`.
    ///
    /// # Safety
    ///
    /// `page` must currently be mapped within `pmap`.
    unsafe fn pmap_protect(
        &self,
        pmap: Self::Pmap,
        page: Page<Size4KiB>,
        flags: MapFlags,
    ) -> Result<MapFlush, UnmapError>;

    /// Establishes a user mapping within `pmap`, allocating intermediate
    /// page-table frames as needed via `alloc`.
    ///
    /// # Safety
    ///
    /// `pmap` must be a valid, live address space root. `alloc` must return
    /// zeroed 4 KiB frames.
    unsafe fn pmap_enter(
        &self,
        pmap: Self::Pmap,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> Result<MapFlush, UnmapError>;

    /// Removes a mapping within `pmap` over `[page, page + count)`.
    ///
    /// # Safety
    ///
    /// `pmap` must be a valid, live address space root.
    unsafe fn pmap_unmap(&self, pmap: Self::Pmap, page: Page<Size4KiB>, count: u64);

    /// Translates a virtual address to a physical address within `pmap`.
    ///
    /// # Safety
    ///
    /// `pmap` must be a valid, live address space root.
    unsafe fn translate(&self, pmap: Self::Pmap, virt: VirtAddr) -> Option<PhysAddr>;

    /// Installs the bootstrap mapping for the kernel image and any
    /// early-boot identity/HHDM window, before the real allocators are
    /// available. Called exactly once.
    ///
    /// # Safety
    ///
    /// May only be called once, before any other `PmapOps` method, and the
    /// caller must not yet rely on any virtual mapping other than the one
    /// the bootloader itself installed.
    unsafe fn pmap_bootstrap(&self);

    /// Switches the live MMU root to `pmap` (loads the arch's page-table
    /// base register), making it the address space this CPU translates
    /// through. Used by `vm_map_activate` when scheduling a process in.
    ///
    /// # Safety
    ///
    /// `pmap` must be a valid, live address space root produced by
    /// `pmap_bootstrap` or by a prior `VmMap`.
    unsafe fn pmap_activate(&self, pmap: Self::Pmap);
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use talus_core::sync::SpinLock;

    /// An in-memory stand-in for a real page table, used to exercise the
    /// memory core's algorithms without real hardware.
    pub struct FakePmap {
        mappings: SpinLock<BTreeMap<u64, (PhysFrame<Size4KiB>, MapFlags)>>,
        activate_count: AtomicUsize,
    }

    impl FakePmap {
        pub fn new() -> Self {
            Self {
                mappings: SpinLock::new(BTreeMap::new()),
                activate_count: AtomicUsize::new(0),
            }
        }

        pub fn is_mapped(&self, page: Page<Size4KiB>) -> bool {
            self.mappings
                .lock()
                .contains_key(&page.start_address().as_u64())
        }

        /// Number of times `pmap_activate` has been called on this double.
        pub fn activate_count(&self) -> usize {
            self.activate_count.load(Ordering::SeqCst)
        }
    }

    impl Default for FakePmap {
        fn default() -> Self {
            Self::new()
        }
    }

    // SAFETY: `FakePmap` is a test double; it only ever records mappings in
    // a `BTreeMap` and never touches real hardware page tables.
    unsafe impl PmapOps for FakePmap {
        type Pmap = ();

        unsafe fn pmap_kenter(
            &self,
            page: Page<Size4KiB>,
            frame: PhysFrame<Size4KiB>,
            flags: MapFlags,
        ) -> MapFlush {
            self.mappings
                .lock()
                .insert(page.start_address().as_u64(), (frame, flags));
            MapFlush::new(page.start_address())
        }

        unsafe fn pmap_kremove(
            &self,
            page: Page<Size4KiB>,
        ) -> Result<(PhysFrame<Size4KiB>, MapFlush), UnmapError> {
            let (frame, _) = self
                .mappings
                .lock()
                .remove(&page.start_address().as_u64())
                .ok_or(UnmapError::NotMapped)?;
            Ok((frame, MapFlush::new(page.start_address())))
        }

        unsafe fn pmap_zero_page(&self, _frame: PhysFrame<Size4KiB>) {}

        unsafe fn pmap_copy_page(&self, _src: PhysFrame<Size4KiB>, _dst: PhysFrame<Size4KiB>) {}

        unsafe fn pmap_protect(
            &self,
            _pmap: Self::Pmap,
            page: Page<Size4KiB>,
            flags: MapFlags,
        ) -> Result<MapFlush, UnmapError> {
            let mut guard = self.mappings.lock();
            let entry = guard
                .get_mut(&page.start_address().as_u64())
                .ok_or(UnmapError::NotMapped)?;
            entry.1 = flags;
            Ok(MapFlush::new(page.start_address()))
        }

        unsafe fn pmap_enter(
            &self,
            _pmap: Self::Pmap,
            page: Page<Size4KiB>,
            frame: PhysFrame<Size4KiB>,
            flags: MapFlags,
            _alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
        ) -> Result<MapFlush, UnmapError> {
            self.mappings
                .lock()
                .insert(page.start_address().as_u64(), (frame, flags));
            Ok(MapFlush::new(page.start_address()))
        }

        unsafe fn pmap_unmap(&self, _pmap: Self::Pmap, page: Page<Size4KiB>, count: u64) {
            let mut guard = self.mappings.lock();
            for i in 0..count {
                guard.remove(&(page + i).start_address().as_u64());
            }
        }

        unsafe fn translate(&self, _pmap: Self::Pmap, virt: VirtAddr) -> Option<PhysAddr> {
            let page = Page::<Size4KiB>::containing_address(virt);
            self.mappings
                .lock()
                .get(&page.start_address().as_u64())
                .map(|(frame, _)| PhysAddr::new(frame.start_address().as_u64() + virt.page_offset()))
        }

        unsafe fn pmap_bootstrap(&self) {}

        unsafe fn pmap_activate(&self, _pmap: Self::Pmap) {
            self.activate_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn mapflags_combination() {
        let flags = MapFlags::WRITABLE | MapFlags::USER;
        assert!(flags.contains(MapFlags::WRITABLE));
        assert!(flags.contains(MapFlags::USER));
        assert!(!flags.contains(MapFlags::EXECUTABLE));
    }

    #[test]
    fn mapflags_grants_write_requires_writable() {
        assert!(MapFlags::WRITABLE.grants(AccessType::Write));
        assert!(!MapFlags::empty().grants(AccessType::Write));
        assert!(MapFlags::empty().grants(AccessType::Read));
    }

    #[test]
    fn fake_pmap_enter_remove_roundtrip() {
        let pmap = FakePmap::new();
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(0x1000));
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(0x5000));
        unsafe { pmap.pmap_kenter(page, frame, MapFlags::WRITABLE).ignore() };
        assert!(pmap.is_mapped(page));
        let (removed, flush) = unsafe { pmap.pmap_kremove(page).unwrap() };
        flush.ignore();
        assert_eq!(removed, frame);
        assert!(!pmap.is_mapped(page));
    }

    #[test]
    fn fake_pmap_translate() {
        let pmap = FakePmap::new();
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(0x2000));
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(0x9000));
        unsafe { pmap.pmap_kenter(page, frame, MapFlags::empty()).ignore() };
        let translated = unsafe { pmap.translate((), VirtAddr::new(0x2048)) };
        assert_eq!(translated, Some(PhysAddr::new(0x9048)));
    }
}
