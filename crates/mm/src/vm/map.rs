//! The per-address-space VM map: a sorted, non-overlapping list of entries
//! each pointing into an amap, plus the demand-paging fault handler and the
//! fork/protect/split operations that mutate the list.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

use talus_core::addr::VirtAddr;
use talus_core::kinfo;
use talus_core::paging::Page;
use talus_core::paging::Size4KiB;

use crate::mapper::{AccessType, MapFlags, PmapOps};
use crate::PAGE_SIZE;

use super::amap::Amap;
use super::anon::{Anon, FaultError};

bitflags::bitflags! {
    /// Page protection requested for a VM entry; a subset of read/write/execute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        /// Loads are permitted.
        const READ    = 1 << 0;
        /// Stores are permitted.
        const WRITE   = 1 << 1;
        /// Instruction fetches are permitted.
        const EXECUTE = 1 << 2;
    }
}

impl Prot {
    /// Whether this protection set covers the requested access.
    #[must_use]
    pub fn allows(self, access: AccessType) -> bool {
        match access {
            AccessType::Read => self.contains(Prot::READ),
            AccessType::Write => self.contains(Prot::WRITE),
            AccessType::Execute => self.contains(Prot::EXECUTE),
        }
    }

    fn to_map_flags(self) -> MapFlags {
        let mut flags = MapFlags::USER;
        if self.contains(Prot::WRITE) {
            flags |= MapFlags::WRITABLE;
        }
        if self.contains(Prot::EXECUTE) {
            flags |= MapFlags::EXECUTABLE;
        }
        flags
    }
}

/// A reference into an amap: which amap, and the slot offset at which this
/// entry's own page 0 begins.
///
/// `amap` starts `None` and is lazily allocated on the entry's first fault,
/// matching the source behavior that a null aref is simply "nothing
/// resident yet", not an error.
#[derive(Clone)]
pub struct Aref {
    pub(crate) amap: Option<super::amap::AmapRef>,
    pub(crate) offset: usize,
}

impl Aref {
    fn none() -> Self {
        Self {
            amap: None,
            offset: 0,
        }
    }
}

/// Errors from VM map entry-list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmMapError {
    /// The requested range overlaps an existing entry.
    Overlap,
    /// `start`/`size` is misaligned, zero, or otherwise nonsensical.
    InvalidArgument,
    /// No entry covers the requested range.
    NotFound,
}

impl fmt::Display for VmMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmMapError::Overlap => write!(f, "range overlaps an existing entry"),
            VmMapError::InvalidArgument => write!(f, "invalid range"),
            VmMapError::NotFound => write!(f, "no entry covers the requested range"),
        }
    }
}

/// One `[start, end)` range of virtual addresses within a map.
pub struct VmEntry {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub prot: Prot,
    pub(crate) aref: Aref,
}

impl VmEntry {
    fn contains(&self, va: VirtAddr) -> bool {
        va >= self.start && va < self.end
    }

    fn page_count(&self) -> u64 {
        (self.end.as_u64() - self.start.as_u64()) / PAGE_SIZE as u64
    }
}

fn page_aligned(addr: VirtAddr) -> bool {
    addr.as_u64() % PAGE_SIZE as u64 == 0
}

/// A process's virtual address space: a sorted, non-overlapping list of
/// [`VmEntry`] values plus the hardware page table root they are mapped
/// into.
pub struct VmMap<P: PmapOps> {
    entries: Vec<VmEntry>,
    root: P::Pmap,
    _marker: PhantomData<P>,
}

impl<P: PmapOps> VmMap<P> {
    /// Creates an empty map rooted at `root` (a fresh, already-bootstrapped
    /// page table with no user mappings).
    pub fn new(root: P::Pmap) -> Self {
        Self {
            entries: Vec::new(),
            root,
            _marker: PhantomData,
        }
    }

    /// The hardware page table root this map is mapped into.
    pub fn root(&self) -> P::Pmap {
        self.root
    }

    /// Makes this map the active address space on the current CPU by
    /// loading its root into the MMU.
    pub fn activate(&self, pmap: &P) {
        // SAFETY: `self.root` is either the bootstrapped root passed to
        // `new`, or a root this map was handed by `clone_map`'s caller —
        // both are required to be valid, live address space roots.
        unsafe { pmap.pmap_activate(self.root) };
    }

    /// Entries in address order. Exposed for tests and diagnostics.
    pub fn entries(&self) -> &[VmEntry] {
        &self.entries
    }

    /// Inserts a new, unpopulated entry `[start, start+size)` with
    /// protection `prot`. No anon/amap is allocated; pages are faulted in
    /// lazily.
    pub fn insert(&mut self, start: VirtAddr, size: u64, prot: Prot) -> Result<(), VmMapError> {
        if size == 0 || !page_aligned(start) || size % PAGE_SIZE as u64 != 0 {
            return Err(VmMapError::InvalidArgument);
        }
        let end = start + size;
        let pos = self.entries.partition_point(|e| e.end <= start);
        if pos < self.entries.len() && self.entries[pos].start < end {
            return Err(VmMapError::Overlap);
        }
        self.entries.insert(
            pos,
            VmEntry {
                start,
                end,
                prot,
                aref: Aref::none(),
            },
        );
        Ok(())
    }

    fn find_index(&self, va: VirtAddr) -> Option<usize> {
        let pos = self.entries.partition_point(|e| e.end <= va);
        (pos < self.entries.len() && self.entries[pos].contains(va)).then_some(pos)
    }

    /// Removes `[start, start+size)`, dropping every anon reference the
    /// range held and asking the MMU-ops to unmap the corresponding PTEs.
    ///
    /// `[start, start+size)` must fall within a single existing entry;
    /// [`split`](Self::split) is called at both boundaries first so a
    /// sub-range of a larger entry can be removed without disturbing its
    /// neighbors.
    pub fn remove(&mut self, pmap: &P, start: VirtAddr, size: u64) -> Result<(), VmMapError> {
        if size == 0 || !page_aligned(start) || size % PAGE_SIZE as u64 != 0 {
            return Err(VmMapError::InvalidArgument);
        }
        let end = start + size;
        self.split(start)?;
        self.split(end)?;

        let idx = self
            .entries
            .iter()
            .position(|e| e.start == start && e.end == end)
            .ok_or(VmMapError::NotFound)?;
        let entry = self.entries.remove(idx);

        if let Some(amap) = &entry.aref.amap {
            let mut guard = amap.lock();
            for slot in entry.aref.offset..entry.aref.offset + entry.page_count() as usize {
                guard.clear(slot);
            }
        }
        let page = Page::<Size4KiB>::containing_address(entry.start);
        // SAFETY: `root` is this map's own live page table root, and the
        // range being unmapped is exactly the entry just removed.
        unsafe { pmap.pmap_unmap(self.root, page, entry.page_count()) };
        Ok(())
    }

    /// Splits the entry containing `addr` into two entries at `addr`, if
    /// `addr` falls strictly inside one. A no-op if `addr` is already a
    /// boundary or outside every entry.
    ///
    /// The right half keeps the same amap reference with its slot offset
    /// advanced past the pages that stayed in the left half.
    pub fn split(&mut self, addr: VirtAddr) -> Result<(), VmMapError> {
        let Some(idx) = self.find_index(addr) else {
            return Ok(());
        };
        if self.entries[idx].start == addr {
            return Ok(());
        }
        let left = &self.entries[idx];
        let advance = ((addr.as_u64() - left.start.as_u64()) / PAGE_SIZE as u64) as usize;

        let right = VmEntry {
            start: addr,
            end: left.end,
            prot: left.prot,
            aref: Aref {
                amap: left.aref.amap.clone(),
                offset: left.aref.offset + advance,
            },
        };
        self.entries[idx].end = addr;
        self.entries.insert(idx + 1, right);
        Ok(())
    }

    /// Changes the protection of `[start, start+size)`, which must exactly
    /// match one entry's bounds (call [`split`](Self::split) first to carve
    /// out a sub-range).
    ///
    /// If the entry's amap is shared (ref count > 1), privatizes it first
    /// via [`amap_copy_on_need`] so the protection change cannot be
    /// observed by a sibling that forked from the same amap.
    pub fn protect(
        &mut self,
        pmap: &P,
        start: VirtAddr,
        size: u64,
        new_prot: Prot,
    ) -> Result<(), VmMapError> {
        let end = start + size;
        let idx = self
            .entries
            .iter()
            .position(|e| e.start == start && e.end == end)
            .ok_or(VmMapError::NotFound)?;

        let page_count = self.entries[idx].page_count() as usize;
        amap_copy_on_need(&mut self.entries[idx].aref, page_count);

        let entry = &mut self.entries[idx];
        entry.prot = new_prot;
        if let Some(amap) = entry.aref.amap.clone() {
            let guard = amap.lock();
            for (slot, _anon) in guard.present() {
                let page_offset = slot - entry.aref.offset;
                let va = entry.start + (page_offset as u64) * PAGE_SIZE as u64;
                let page = Page::<Size4KiB>::containing_address(va);
                // SAFETY: `page` is currently mapped (it is a present anon
                // slot for this live entry).
                if let Ok(flush) = unsafe { pmap.pmap_protect(self.root, page, new_prot.to_map_flags()) } {
                    flush.flush();
                }
            }
        }
        Ok(())
    }

    /// Services a page fault at `va` with the given `access`: locate the
    /// entry, check protection, lazily allocate the amap, resolve or
    /// allocate the anon, and install the PTE — copying the page first if
    /// it is shared and being written.
    pub fn fault(&mut self, pmap: &P, va: VirtAddr, access: AccessType) -> Result<(), FaultError> {
        let idx = self.find_index(va).ok_or(FaultError::SegV)?;
        let entry = &mut self.entries[idx];
        if !entry.prot.allows(access) {
            return Err(FaultError::SegV);
        }

        let slot_in_entry = ((va.as_u64() - entry.start.as_u64()) / PAGE_SIZE as u64) as usize;

        if entry.aref.amap.is_none() {
            entry.aref.amap = Some(Amap::new(entry.page_count() as usize));
            entry.aref.offset = 0;
        }
        let amap = entry.aref.amap.clone().expect("just allocated above");
        let amap_slot = entry.aref.offset + slot_in_entry;
        let page_va = entry.start + (slot_in_entry as u64) * PAGE_SIZE as u64;
        let page = Page::<Size4KiB>::containing_address(page_va);
        let prot_flags = entry.prot.to_map_flags();

        let existing = amap.lock().get(amap_slot);
        let new_anon = match existing {
            None => {
                let anon = Anon::new_zeroed(pmap)?;
                amap.lock().set(amap_slot, Arc::clone(&anon));
                Some((anon, true))
            }
            Some(anon) => {
                // `anon` is a clone taken via `Amap::get` above, on top of
                // the one the amap slot itself holds — subtract it back out
                // so `ref_count` reflects actual sharers, not this local.
                let ref_count = Arc::strong_count(&anon) - 1;
                if access != AccessType::Write || ref_count == 1 {
                    None
                } else {
                    let copied = anon.lock().copy(pmap)?;
                    amap.lock().set(amap_slot, Arc::clone(&copied));
                    Some((copied, false))
                }
            }
        };

        let frame = match &new_anon {
            Some((anon, _)) => anon.lock().frame(),
            None => amap
                .lock()
                .get(amap_slot)
                .expect("slot just confirmed present")
                .lock()
                .frame(),
        };

        let alloc_page_table_frame = &mut || crate::pmm::alloc_pages(1).ok();
        // SAFETY: `self.root` is a live address space root owned by this
        // map; `frame` is an owned frame (freshly allocated or already
        // installed in this amap).
        let flush = unsafe {
            pmap.pmap_enter(self.root, page, frame, prot_flags, alloc_page_table_frame)
                .map_err(|_| FaultError::BusErr)?
        };
        flush.flush();

        crate::pmm::mark_accessed(frame, access == AccessType::Write);
        Ok(())
    }

    /// Forks this map: every entry in the returned child gets its own
    /// private amap snapshot holding an `Arc::clone` of each of the
    /// parent's present anons (so each anon's ref count reflects its
    /// shared, read-only-after-fork state), and any writable parent page
    /// already mapped is downgraded to read-only so the next parent write
    /// takes the copy-on-write fault path instead of silently mutating a
    /// page the child's snapshot still points at.
    ///
    /// The child's own page table starts empty; its first touch of an
    /// inherited page goes through [`fault`](Self::fault) like any other
    /// demand-paged access.
    pub fn clone_map(&mut self, pmap: &P, child_root: P::Pmap) -> Result<Self, FaultError> {
        let mut child_entries = Vec::with_capacity(self.entries.len());

        for entry in &mut self.entries {
            let page_count = entry.page_count() as usize;
            let child_amap = entry
                .aref
                .amap
                .as_ref()
                .map(|_| amap_snapshot(&entry.aref, page_count));

            if entry.prot.contains(Prot::WRITE) {
                if let Some(amap) = &entry.aref.amap {
                    let guard = amap.lock();
                    let present_slots: Vec<usize> = guard.present().map(|(s, _)| s).collect();
                    drop(guard);
                    for slot in present_slots {
                        let page_offset = slot - entry.aref.offset;
                        let va = entry.start + (page_offset as u64) * PAGE_SIZE as u64;
                        let page = Page::<Size4KiB>::containing_address(va);
                        let ro_flags = entry.prot.to_map_flags() - MapFlags::WRITABLE;
                        // SAFETY: `page` is currently mapped read-write in
                        // the parent; downgrading it to read-only cannot
                        // corrupt the mapping, only restrict it.
                        if let Ok(flush) = unsafe { pmap.pmap_protect(self.root, page, ro_flags) } {
                            flush.flush();
                        }
                    }
                }
            }

            child_entries.push(VmEntry {
                start: entry.start,
                end: entry.end,
                prot: entry.prot,
                aref: Aref {
                    amap: child_amap,
                    offset: 0,
                },
            });
        }

        kinfo!("vm: cloned map with {} entries", child_entries.len());
        Ok(Self {
            entries: child_entries,
            root: child_root,
            _marker: PhantomData,
        })
    }
}

/// Builds a fresh, private amap of `slots` capacity holding an
/// `Arc::clone` of every anon present in `aref`'s current amap within
/// `[aref.offset, aref.offset + slots)`, renumbered to start at slot 0.
fn amap_snapshot(aref: &Aref, slots: usize) -> super::amap::AmapRef {
    let new_amap = Amap::new(slots);
    if let Some(old) = &aref.amap {
        let old_guard = old.lock();
        let mut new_guard = new_amap.lock();
        for (slot, anon) in old_guard.present() {
            if slot >= aref.offset {
                let new_slot = slot - aref.offset;
                if new_slot < slots {
                    new_guard.set(new_slot, Arc::clone(anon));
                }
            }
        }
    }
    new_amap
}

/// Ensures `aref`'s amap is privately held (ref count 1) before the caller
/// mutates the entry it belongs to, copy-holding every present anon into a
/// fresh amap of `slots` capacity if it was shared.
///
/// A null `aref` (no amap yet) is left untouched — per the source behavior,
/// the next fault allocates lazily, so there is nothing to privatize yet.
pub fn amap_copy_on_need(aref: &mut Aref, slots: usize) {
    let shared = aref.amap.as_ref().is_some_and(|amap| Arc::strong_count(amap) > 1);
    if !shared {
        return;
    }
    aref.amap = Some(amap_snapshot(aref, slots));
    aref.offset = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::tests::FakePmap;
    use talus_core::addr::PhysAddr;

    fn fresh_pmm(pages: usize) {
        crate::pmm::init(
            &[crate::PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: (pages * crate::PAGE_SIZE) as u64,
                usable: true,
            }],
            &[],
        );
    }

    #[test]
    fn insert_then_remove_is_noop_on_entry_list() {
        let pmap = FakePmap::new();
        let mut map = VmMap::<FakePmap>::new(());
        map.insert(VirtAddr::new(0x1000), 2 * PAGE_SIZE as u64, Prot::READ | Prot::WRITE)
            .unwrap();
        assert_eq!(map.entries().len(), 1);
        map.remove(&pmap, VirtAddr::new(0x1000), 2 * PAGE_SIZE as u64)
            .unwrap();
        assert!(map.entries().is_empty());
    }

    #[test]
    fn insert_overlap_rejected() {
        let mut map = VmMap::<FakePmap>::new(());
        map.insert(VirtAddr::new(0x1000), PAGE_SIZE as u64, Prot::READ)
            .unwrap();
        assert_eq!(
            map.insert(VirtAddr::new(0x1000), PAGE_SIZE as u64, Prot::READ),
            Err(VmMapError::Overlap)
        );
    }

    #[test]
    fn fault_on_unmapped_entry_allocates_zero_page() {
        fresh_pmm(8);
        let pmap = FakePmap::new();
        let mut map = VmMap::<FakePmap>::new(());
        map.insert(VirtAddr::new(0x2000), 2 * PAGE_SIZE as u64, Prot::READ | Prot::WRITE)
            .unwrap();
        map.fault(&pmap, VirtAddr::new(0x2000), AccessType::Write).unwrap();
        assert!(pmap.is_mapped(Page::<Size4KiB>::containing_address(VirtAddr::new(0x2000))));
    }

    #[test]
    fn fault_outside_any_entry_is_segv() {
        let pmap = FakePmap::new();
        let mut map = VmMap::<FakePmap>::new(());
        let err = map.fault(&pmap, VirtAddr::new(0x9000), AccessType::Read);
        assert_eq!(err, Err(FaultError::SegV));
    }

    #[test]
    fn repeated_write_fault_on_unshared_anon_does_not_copy() {
        fresh_pmm(8);
        let pmap = FakePmap::new();
        let mut map = VmMap::<FakePmap>::new(());
        map.insert(VirtAddr::new(0x5000), PAGE_SIZE as u64, Prot::READ | Prot::WRITE)
            .unwrap();
        map.fault(&pmap, VirtAddr::new(0x5000), AccessType::Write).unwrap();
        let frame = map.entries()[0].aref.amap.as_ref().unwrap().lock().get(0).unwrap().lock().frame();

        // Not shared with anyone (no fork happened); a second write fault
        // must reuse the same anon rather than taking a spurious copy.
        map.fault(&pmap, VirtAddr::new(0x5000), AccessType::Write).unwrap();
        let frame_again = map.entries()[0].aref.amap.as_ref().unwrap().lock().get(0).unwrap().lock().frame();
        assert_eq!(frame, frame_again);
    }

    #[test]
    fn activate_delegates_to_pmap_activate() {
        let pmap = FakePmap::new();
        let map = VmMap::<FakePmap>::new(());
        map.activate(&pmap);
        assert_eq!(pmap.activate_count(), 1);
    }

    #[test]
    fn write_fault_outside_prot_is_segv() {
        fresh_pmm(8);
        let pmap = FakePmap::new();
        let mut map = VmMap::<FakePmap>::new(());
        map.insert(VirtAddr::new(0x3000), PAGE_SIZE as u64, Prot::READ)
            .unwrap();
        let err = map.fault(&pmap, VirtAddr::new(0x3000), AccessType::Write);
        assert_eq!(err, Err(FaultError::SegV));
    }

    /// Scenario S5: fork then write in the parent triggers a private copy,
    /// leaving the child's anon untouched and the old anon singly-owned.
    #[test]
    fn fork_then_write_triggers_copy_on_write() {
        fresh_pmm(8);
        let pmap = FakePmap::new();
        let mut parent = VmMap::<FakePmap>::new(());
        parent
            .insert(VirtAddr::new(0x1000), 2 * PAGE_SIZE as u64, Prot::READ | Prot::WRITE)
            .unwrap();
        parent.fault(&pmap, VirtAddr::new(0x1000), AccessType::Read).unwrap();

        let original_frame = parent.entries()[0]
            .aref
            .amap
            .as_ref()
            .unwrap()
            .lock()
            .get(0)
            .unwrap()
            .lock()
            .frame();

        let mut child = parent.clone_map(&pmap, ()).unwrap();

        // `get` hands back its own clone, so the real sharer count (parent's
        // slot + child's snapshot slot) is one less than what this local
        // reports.
        let shared_anon = parent.entries()[0].aref.amap.as_ref().unwrap().lock().get(0).unwrap();
        assert_eq!(Arc::strong_count(&shared_anon) - 1, 2);
        drop(shared_anon);

        parent.fault(&pmap, VirtAddr::new(0x1000), AccessType::Write).unwrap();

        let new_frame = parent.entries()[0]
            .aref
            .amap
            .as_ref()
            .unwrap()
            .lock()
            .get(0)
            .unwrap()
            .lock()
            .frame();
        assert_ne!(new_frame, original_frame);

        let child_anon = child.entries()[0].aref.amap.as_ref().unwrap().lock().get(0).unwrap();
        assert_eq!(child_anon.lock().frame(), original_frame);
        assert_eq!(Arc::strong_count(&child_anon) - 1, 1);

        child.fault(&pmap, VirtAddr::new(0x1000), AccessType::Write).unwrap();
    }

    #[test]
    fn split_advances_right_half_amap_offset() {
        fresh_pmm(8);
        let pmap = FakePmap::new();
        let mut map = VmMap::<FakePmap>::new(());
        map.insert(VirtAddr::new(0x1000), 2 * PAGE_SIZE as u64, Prot::READ | Prot::WRITE)
            .unwrap();
        map.fault(&pmap, VirtAddr::new(0x1000), AccessType::Read).unwrap();
        map.split(VirtAddr::new(0x1000) + PAGE_SIZE as u64).unwrap();
        assert_eq!(map.entries().len(), 2);
        assert_eq!(map.entries()[1].aref.offset, 1);
    }
}
