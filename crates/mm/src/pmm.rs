//! Physical page allocator: a per-segment buddy scheme.
//!
//! RAM is split into [`PhysSegment`]s (typically one per contiguous usable
//! range reported by the boot memory map). Each segment tracks its pages in
//! a [`Page`] array and threads free runs onto 16 order-indexed free lists
//! (`order` 0..=15, i.e. runs of 1..=32768 pages). Allocation splits a
//! larger run down to the requested order; freeing walks back up, merging
//! with the buddy at each level while one exists.

use alloc::vec::Vec;
use core::fmt;

use talus_core::addr::PhysAddr;
use talus_core::paging::{PhysFrame, Size4KiB};
use talus_core::sync::{SpinLock, SpinLockGuard};
use talus_core::{kerr, kinfo};

use crate::{PhysMemoryRegion, PAGE_SIZE};

/// Number of order-indexed free lists per segment (orders 0..=15, i.e. up to
/// 2^15 = 32768 contiguous pages).
pub const NUM_ORDERS: usize = 16;

/// Maximum run length, in pages, that a single allocation may request.
pub const MAX_ORDER_PAGES: usize = 1 << (NUM_ORDERS - 1);

bitflags::bitflags! {
    /// Per-page metadata flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The page (as the head of some run) currently sits on a free list.
        const MANAGED    = 1 << 0;
        /// The page has been handed out by `alloc` and not yet freed.
        const ALLOCATED  = 1 << 1;
        /// The page is permanently withheld from the allocator (e.g. holds
        /// the kernel image, a boot-time structure, or firmware memory).
        const RESERVED   = 1 << 2;
        /// Soft-dirty: referenced since last cleared.
        const REFERENCED = 1 << 3;
        /// Soft-dirty: modified since last cleared.
        const MODIFIED   = 1 << 4;
    }
}

/// Per-physical-frame metadata.
///
/// One `Page` exists per frame in its owning segment for the lifetime of
/// the kernel; only its `order`, `flags`, and free-list linkage ever change.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// When this page is the head of a run (free or allocated), the order
    /// (`log2` of the run length in pages) of that run. Meaningless for
    /// non-head pages.
    order: u8,
    flags: PageFlags,
    /// Index, within the segment, of the next page on the same free list, or
    /// `NIL` if this is the list tail. Only meaningful while `MANAGED`.
    free_next: u32,
    /// Index of the previous page on the same free list, or `NIL`.
    free_prev: u32,
}

const NIL: u32 = u32::MAX;

impl Page {
    const fn new() -> Self {
        Self {
            order: 0,
            flags: PageFlags::empty(),
            free_next: NIL,
            free_prev: NIL,
        }
    }

    /// The flags recorded for this page.
    pub fn flags(&self) -> PageFlags {
        self.flags
    }
}

/// Errors from physical memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No run of the requested order was available anywhere.
    OutOfMemory,
    /// The requested allocation size is not representable (zero, not a
    /// power of two, or exceeds [`MAX_ORDER_PAGES`]).
    InvalidSize,
    /// `init` was called more than once.
    AlreadyInitialized,
    /// A physical address did not fall within any managed segment.
    InvalidFrame,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmmError::OutOfMemory => write!(f, "out of physical memory"),
            PmmError::InvalidSize => write!(f, "invalid allocation size"),
            PmmError::AlreadyInitialized => write!(f, "physical memory manager already initialized"),
            PmmError::InvalidFrame => write!(f, "address does not belong to a managed segment"),
        }
    }
}

/// A contiguous range of physical RAM managed as one buddy arena.
pub struct PhysSegment {
    base: PhysAddr,
    /// Number of 4 KiB frames in this segment.
    num_pages: usize,
    pages: Vec<Page>,
    /// `free_lists[order]` is the frame index of the head of that order's
    /// free list, or `NIL`.
    free_lists: [u32; NUM_ORDERS],
    free_pages: usize,
}

impl PhysSegment {
    fn new(base: PhysAddr, num_pages: usize) -> Self {
        Self {
            base,
            num_pages,
            pages: alloc::vec![Page::new(); num_pages],
            free_lists: [NIL; NUM_ORDERS],
            free_pages: 0,
        }
    }

    #[inline]
    fn contains(&self, frame: PhysFrame<Size4KiB>) -> bool {
        let idx = self.frame_index(frame);
        idx.is_some_and(|i| i < self.num_pages)
    }

    #[inline]
    fn frame_index(&self, frame: PhysFrame<Size4KiB>) -> Option<usize> {
        let offset = frame.start_address().as_u64().checked_sub(self.base.as_u64())?;
        usize::try_from(offset / PAGE_SIZE as u64).ok()
    }

    #[inline]
    fn frame_at(&self, index: usize) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(self.base + (index as u64) * PAGE_SIZE as u64)
    }

    /// Marks `[start, start+count)` as permanently reserved and never places
    /// them on a free list. Must be called before any page in the range has
    /// been inserted into a free list.
    fn reserve_initial(&mut self, start: usize, count: usize) {
        for i in start..(start + count).min(self.num_pages) {
            self.pages[i].flags |= PageFlags::RESERVED;
        }
    }

    /// Inserts every not-yet-reserved page as order-0 free runs, then lets
    /// `free_run` coalesce them upward. Called once at init.
    fn seed_free_lists(&mut self) {
        let mut i = 0;
        while i < self.num_pages {
            if self.pages[i].flags.contains(PageFlags::RESERVED) {
                i += 1;
                continue;
            }
            self.pages[i].order = 0;
            self.free_pages += 1;
            self.link_front(0, i);
            i += 1;
        }
        // Coalesce bottom-up once so boot-time reservations don't leave the
        // allocator needlessly fragmented at order 0.
        for order in 0..NUM_ORDERS - 1 {
            self.coalesce_order(order);
        }
    }

    /// Merges every mergeable pair of free runs at `order`, promoting each
    /// to `order + 1`. A single pass over the list only catches a buddy
    /// pair if the scan happens to reach both halves adjacently, so this
    /// keeps rescanning the whole list until a full pass finds nothing left
    /// to merge — the list is short-lived (one segment's free runs at one
    /// order) so the quadratic worst case is acceptable here.
    fn coalesce_order(&mut self, order: usize) {
        let size = 1usize << order;
        loop {
            let mut merged = false;
            let mut cur = self.free_lists[order];
            while cur != NIL {
                let idx = cur as usize;
                let buddy = buddy_index(idx, size);
                if buddy < self.num_pages && self.is_free_head_of_order(buddy, order) {
                    let lower = idx.min(buddy);
                    let upper = idx.max(buddy);
                    if lower + size == upper {
                        self.unlink(order, lower as u32);
                        self.unlink(order, upper as u32);
                        self.pages[lower].order = (order + 1) as u8;
                        self.link_front(order + 1, lower);
                        merged = true;
                        break;
                    }
                }
                cur = self.pages[idx].free_next;
            }
            if !merged {
                return;
            }
        }
    }

    fn is_free_head_of_order(&self, index: usize, order: usize) -> bool {
        index < self.num_pages
            && self.pages[index].flags.contains(PageFlags::MANAGED)
            && self.pages[index].order as usize == order
    }

    fn link_front(&mut self, order: usize, index: usize) {
        let old_head = self.free_lists[order];
        self.pages[index].free_next = old_head;
        self.pages[index].free_prev = NIL;
        if old_head != NIL {
            self.pages[old_head as usize].free_prev = index as u32;
        }
        self.free_lists[order] = index as u32;
        self.pages[index].flags |= PageFlags::MANAGED;
    }

    fn unlink(&mut self, order: usize, index: u32) {
        let (prev, next) = (self.pages[index as usize].free_prev, self.pages[index as usize].free_next);
        if prev != NIL {
            self.pages[prev as usize].free_next = next;
        } else {
            self.free_lists[order] = next;
        }
        if next != NIL {
            self.pages[next as usize].free_prev = prev;
        }
        self.pages[index as usize].free_next = NIL;
        self.pages[index as usize].free_prev = NIL;
        self.pages[index as usize].flags.remove(PageFlags::MANAGED);
    }

    /// Attempts to allocate a run of `1 << order` pages from this segment.
    fn alloc_order(&mut self, order: usize) -> Option<usize> {
        let mut found_order = None;
        for o in order..NUM_ORDERS {
            if self.free_lists[o] != NIL {
                found_order = Some(o);
                break;
            }
        }
        let mut cur_order = found_order?;
        let mut index = self.free_lists[cur_order];
        self.unlink(cur_order, index);

        while cur_order > order {
            cur_order -= 1;
            let half = 1usize << cur_order;
            let buddy = index as usize + half;
            self.pages[buddy].order = cur_order as u8;
            self.link_front(cur_order, buddy);
        }

        self.pages[index as usize].order = order as u8;
        self.pages[index as usize].flags.remove(PageFlags::MANAGED);
        self.pages[index as usize].flags.insert(PageFlags::ALLOCATED);
        self.pages[index as usize].flags.remove(PageFlags::REFERENCED | PageFlags::MODIFIED);
        self.free_pages -= 1 << order;
        Some(index as usize)
    }

    /// Returns a previously allocated run (headed at `index`, of `order`)
    /// to the free lists, merging with its buddy while possible.
    fn free_order(&mut self, mut index: usize, order: usize) {
        self.pages[index].flags.remove(PageFlags::ALLOCATED);
        self.free_pages += 1 << order;
        let mut cur_order = order;
        loop {
            if cur_order + 1 >= NUM_ORDERS {
                break;
            }
            let size = 1usize << cur_order;
            let buddy = buddy_index(index, size);
            if buddy >= self.num_pages || !self.is_free_head_of_order(buddy, cur_order) {
                break;
            }
            let lower = index.min(buddy);
            let upper = index.max(buddy);
            self.unlink(cur_order, lower as u32);
            self.unlink(cur_order, upper as u32);
            index = lower;
            cur_order += 1;
        }
        self.pages[index].order = cur_order as u8;
        self.link_front(cur_order, index);
    }

    /// Withdraws every page in `[start, end)` from the free lists, splitting
    /// runs that straddle either boundary, and marks them `RESERVED`.
    /// Pages already `ALLOCATED` are left untouched (the caller owns them).
    fn reserve_range(&mut self, start: usize, end: usize) {
        for order in (0..NUM_ORDERS).rev() {
            loop {
                let Some(head) = self.find_free_run_overlapping(order, start, end) else {
                    break;
                };
                let size = 1usize << order;
                let run_start = head;
                let run_end = head + size;
                self.unlink(order, head as u32);

                // Re-insert the part before [start,end) and after it as
                // smaller free runs; the overlapping middle is reserved.
                self.split_and_keep_outside(run_start, run_end, start, end);
            }
        }
    }

    fn find_free_run_overlapping(&self, order: usize, start: usize, end: usize) -> Option<usize> {
        let mut cur = self.free_lists[order];
        while cur != NIL {
            let idx = cur as usize;
            let size = 1usize << order;
            if idx < end && idx + size > start {
                return Some(idx);
            }
            cur = self.pages[idx].free_next;
        }
        None
    }

    /// Splits the free run `[run_start, run_end)` down to order-0 pieces
    /// conceptually, keeping the pieces outside `[start, end)` as new free
    /// runs (re-coalesced where possible) and marking the overlap reserved.
    fn split_and_keep_outside(&mut self, run_start: usize, run_end: usize, start: usize, end: usize) {
        let mut i = run_start;
        while i < run_end {
            if i >= start && i < end {
                self.pages[i].flags.insert(PageFlags::RESERVED);
                self.free_pages -= 1;
                i += 1;
            } else {
                // This page was already free (part of the run we just
                // unlinked); re-seed it at order 0 without touching the
                // free-page count, which only tracks transitions into/out
                // of the free pool.
                self.pages[i].order = 0;
                self.link_front(0, i);
                i += 1;
            }
        }
        // Re-coalesce everything we just seeded at order 0.
        for order in 0..NUM_ORDERS - 1 {
            self.coalesce_order(order);
        }
    }
}

fn buddy_index(index: usize, size: usize) -> usize {
    index ^ size
}

/// The physical memory manager: an ordered collection of [`PhysSegment`]s
/// plus the global lock guarding all of them.
pub struct PhysMemoryManager {
    segments: Vec<PhysSegment>,
}

impl PhysMemoryManager {
    const fn new() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Builds the manager from firmware-reported regions. Usable regions
    /// become segments; unusable ones are skipped entirely (never even
    /// addressable by this allocator). `reserved` additionally withholds
    /// physical ranges within usable regions (e.g. the kernel image and the
    /// `Page` arrays themselves, which must be allocated by a boot bump
    /// allocator before this call).
    pub fn init(&mut self, regions: &[PhysMemoryRegion], reserved: &[(PhysAddr, u64)]) {
        self.segments.clear();
        for region in regions.iter().filter(|r| r.usable) {
            let num_pages = (region.size as usize) / PAGE_SIZE;
            if num_pages == 0 {
                continue;
            }
            let mut segment = PhysSegment::new(region.start, num_pages);
            for &(addr, size) in reserved {
                if let (Some(s), Some(e)) = (
                    segment.frame_index(PhysFrame::containing_address(addr)),
                    segment.frame_index(PhysFrame::containing_address(
                        addr + size.saturating_sub(1),
                    )),
                ) {
                    segment.reserve_initial(s, e + 1 - s);
                }
            }
            segment.seed_free_lists();
            kinfo!(
                "pmm: segment base={:#x} pages={} free={}",
                segment.base.as_u64(),
                segment.num_pages,
                segment.free_pages
            );
            self.segments.push(segment);
        }
    }

    /// Allocates a naturally-aligned, physically contiguous run of
    /// `npages` pages (must be a power of two, `1..=MAX_ORDER_PAGES`).
    pub fn alloc(&mut self, npages: usize) -> Result<PhysFrame<Size4KiB>, PmmError> {
        if npages == 0 || npages > MAX_ORDER_PAGES || !npages.is_power_of_two() {
            return Err(PmmError::InvalidSize);
        }
        let order = npages.trailing_zeros() as usize;
        for segment in &mut self.segments {
            if let Some(index) = segment.alloc_order(order) {
                return Ok(segment.frame_at(index));
            }
        }
        Err(PmmError::OutOfMemory)
    }

    /// Frees a run previously returned by [`alloc`](Self::alloc) with the
    /// same `npages`.
    ///
    /// Freeing a page that is `RESERVED`, or that was not the head of an
    /// allocated run, is a programming error and panics rather than
    /// silently corrupting the free lists.
    pub fn free(&mut self, frame: PhysFrame<Size4KiB>, npages: usize) {
        assert!(npages.is_power_of_two(), "pmm::free: npages not a power of two");
        let order = npages.trailing_zeros() as usize;
        for segment in &mut self.segments {
            if !segment.contains(frame) {
                continue;
            }
            let index = segment.frame_index(frame).expect("contains() implies frame_index");
            assert!(
                !segment.pages[index].flags.contains(PageFlags::RESERVED),
                "pmm: attempted to free reserved page {:#x}",
                frame.start_address().as_u64()
            );
            assert!(
                segment.pages[index].flags.contains(PageFlags::ALLOCATED),
                "pmm: double free of page {:#x}",
                frame.start_address().as_u64()
            );
            segment.free_order(index, order);
            return;
        }
        kerr!("pmm: free of frame {:#x} outside any segment", frame.start_address().as_u64());
        panic!("pmm: free of untracked frame");
    }

    /// Withdraws `[start, end)` from the free lists across every segment it
    /// overlaps, marking the pages permanently `RESERVED`. Used to hand a
    /// fixed physical range (e.g. for MMIO shadow pages or DMA buffers with
    /// hardware address constraints) to a caller outside the buddy system.
    pub fn reserve(&mut self, start: PhysAddr, end: PhysAddr) {
        for segment in &mut self.segments {
            let seg_start = segment.base.as_u64();
            let seg_end = seg_start + (segment.num_pages * PAGE_SIZE) as u64;
            let lo = start.as_u64().max(seg_start);
            let hi = end.as_u64().min(seg_end);
            if lo >= hi {
                continue;
            }
            let start_idx = ((lo - seg_start) / PAGE_SIZE as u64) as usize;
            let end_idx = ((hi - seg_start).div_ceil(PAGE_SIZE as u64)) as usize;
            segment.reserve_range(start_idx, end_idx);
        }
    }

    /// Returns the flags recorded for the page at `addr`, if it is tracked
    /// by any segment.
    pub fn page_flags(&self, frame: PhysFrame<Size4KiB>) -> Option<PageFlags> {
        for segment in &self.segments {
            if let Some(index) = segment.frame_index(frame) {
                if index < segment.num_pages {
                    return Some(segment.pages[index].flags);
                }
            }
        }
        None
    }

    /// Sets `REFERENCED` (and `MODIFIED` when `write` is set) on the page
    /// backing `frame`. Called by the VM fault path; a no-op if the frame
    /// is untracked.
    pub fn mark_accessed(&mut self, frame: PhysFrame<Size4KiB>, write: bool) {
        for segment in &mut self.segments {
            if let Some(index) = segment.frame_index(frame) {
                if index < segment.num_pages {
                    segment.pages[index].flags.insert(PageFlags::REFERENCED);
                    if write {
                        segment.pages[index].flags.insert(PageFlags::MODIFIED);
                    }
                    return;
                }
            }
        }
    }

    /// Total pages currently free across all segments.
    pub fn free_pages(&self) -> usize {
        self.segments.iter().map(|s| s.free_pages).sum()
    }
}

static PMM: SpinLock<PhysMemoryManager> = SpinLock::new(PhysMemoryManager::new());

/// Initializes the global physical memory manager. Must be called exactly
/// once at boot, after a boot bump allocator has carved out space for any
/// structures (page tables, the `Page` arrays themselves) that must not be
/// handed out by the buddy allocator.
pub fn init(regions: &[PhysMemoryRegion], reserved: &[(PhysAddr, u64)]) {
    PMM.lock().init(regions, reserved);
}

/// Runs `f` with exclusive access to the global physical memory manager.
pub fn with<R>(f: impl FnOnce(&mut PhysMemoryManager) -> R) -> R {
    f(&mut with_guard())
}

fn with_guard() -> SpinLockGuard<'static, PhysMemoryManager> {
    PMM.lock()
}

/// Allocates `npages` physically contiguous pages from the global manager.
pub fn alloc_pages(npages: usize) -> Result<PhysFrame<Size4KiB>, PmmError> {
    with(|pmm| pmm.alloc(npages))
}

/// Frees `npages` physically contiguous pages previously returned by
/// [`alloc_pages`].
pub fn free_pages(frame: PhysFrame<Size4KiB>, npages: usize) {
    with(|pmm| pmm.free(frame, npages));
}

/// Marks a page referenced (and modified, on a write) in the global manager.
pub fn mark_accessed(frame: PhysFrame<Size4KiB>, write: bool) {
    with(|pmm| pmm.mark_accessed(frame, write));
}
