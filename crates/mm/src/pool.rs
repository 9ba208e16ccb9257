//! Slab allocator for fixed-size objects.
//!
//! Each [`Pool`] carves pages obtained from [`kmem`](crate::kmem) into
//! [`Slab`]s: a header, an occupancy bitmap, and an item array. Slabs move
//! between the pool's empty/partial/full lists as their occupancy changes.
//! Every item carries a small header (canary + back-pointer to its slab) so
//! `pool_free` can detect corruption and double-frees without the caller
//! passing back anything but the payload pointer.

use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use talus_core::sync::SpinLock;
use talus_core::{kerr, kinfo};

use crate::kmem::{AllocFlags, KmemAllocator, KmemError, KmemRegion};
use crate::mapper::PmapOps;
use crate::PAGE_SIZE;

const ITEM_CANARY: u32 = 0x1357_9BDF;

/// Per-item header, stored immediately before the payload.
#[repr(C)]
struct ItemHeader {
    canary: u32,
    /// Index of this item within its slab.
    index: u32,
    /// Pointer back to the owning slab's header, for `pool_free`.
    slab: NonNull<SlabHeader>,
}

/// Header stored at the start of the page backing one [`Slab`].
struct SlabHeader {
    nused: usize,
    ntotal: usize,
    /// Offset, in bytes from the page base, to the start of the item array.
    items_offset: usize,
    item_stride: usize,
    /// Offset to the occupancy bitmap.
    bitmap_offset: usize,
}

/// One page, carved into a header, a bitmap, and an item array.
struct Slab {
    page: NonNull<u8>,
    /// The kmem reservation backing `page`, kept so `Pool::destroy` can hand
    /// it back.
    region: KmemRegion,
}

// SAFETY: a `Slab` is only ever touched while its owning `Pool`'s lock is
// held.
unsafe impl Send for Slab {}

impl Slab {
    fn header(&self) -> &SlabHeader {
        unsafe { &*self.page.as_ptr().cast::<SlabHeader>() }
    }

    fn header_mut(&mut self) -> &mut SlabHeader {
        unsafe { &mut *self.page.as_ptr().cast::<SlabHeader>() }
    }

    fn bitmap(&self) -> &[u8] {
        let h = self.header();
        let nbytes = h.ntotal.div_ceil(8);
        unsafe {
            core::slice::from_raw_parts(self.page.as_ptr().add(h.bitmap_offset), nbytes)
        }
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        let h = self.header();
        let nbytes = h.ntotal.div_ceil(8);
        let offset = h.bitmap_offset;
        unsafe {
            core::slice::from_raw_parts_mut(self.page.as_ptr().add(offset), nbytes)
        }
    }

    fn item_ptr(&self, index: usize) -> *mut u8 {
        let h = self.header();
        unsafe { self.page.as_ptr().add(h.items_offset + index * h.item_stride) }
    }

    fn bit_is_set(&self, index: usize) -> bool {
        let bm = self.bitmap();
        (bm[index / 8] >> (index % 8)) & 1 == 1
    }

    fn set_bit(&mut self, index: usize, value: bool) {
        let bm = self.bitmap_mut();
        if value {
            bm[index / 8] |= 1 << (index % 8);
        } else {
            bm[index / 8] &= !(1 << (index % 8));
        }
    }

    fn first_free_index(&self) -> Option<usize> {
        let h = self.header();
        (0..h.ntotal).find(|&i| !self.bit_is_set(i))
    }
}

/// Occupancy bucket a slab belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupancy {
    Empty,
    Partial,
    Full,
}

fn occupancy_of(nused: usize, ntotal: usize) -> Occupancy {
    if nused == 0 {
        Occupancy::Empty
    } else if nused == ntotal {
        Occupancy::Full
    } else {
        Occupancy::Partial
    }
}

/// Errors from pool (slab) allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Growing the pool by one slab failed (no kernel memory available).
    OutOfMemory(KmemError),
    /// `item_size` is too large to fit even one item in a page alongside
    /// the slab header and bitmap.
    ItemTooLarge,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::OutOfMemory(e) => write!(f, "pool: {e}"),
            PoolError::ItemTooLarge => write!(f, "pool: item size exceeds one page"),
        }
    }
}

/// A fixed-size-object slab allocator.
pub struct Pool {
    name: &'static str,
    item_size: usize,
    item_stride: usize,
    items_per_slab: usize,
    empty: Vec<Slab>,
    partial: Vec<Slab>,
    full: Vec<Slab>,
}

impl Pool {
    /// Computes layout for a pool of `item_size`-byte items and creates an
    /// empty pool (no slabs yet; the first `alloc` triggers growth).
    pub fn new(name: &'static str, item_size: usize) -> Result<Self, PoolError> {
        let item_stride = size_of::<ItemHeader>() + item_size;
        // Solve for the largest n with header + ceil(n/8) + n*stride <= PAGE_SIZE.
        let mut n = 0;
        loop {
            let bitmap_bytes = (n + 1).div_ceil(8);
            let items_offset = (size_of::<SlabHeader>() + bitmap_bytes + 7) & !7;
            let used = items_offset + (n + 1) * item_stride;
            if used > PAGE_SIZE {
                break;
            }
            n += 1;
        }
        if n == 0 {
            return Err(PoolError::ItemTooLarge);
        }
        Ok(Self {
            name,
            item_size,
            item_stride,
            items_per_slab: n,
            empty: Vec::new(),
            partial: Vec::new(),
            full: Vec::new(),
        })
    }

    fn build_slab(&self, page: NonNull<u8>, region: KmemRegion) -> Slab {
        let ntotal = self.items_per_slab;
        let bitmap_offset = size_of::<SlabHeader>();
        let bitmap_bytes = ntotal.div_ceil(8);
        let items_offset = (bitmap_offset + bitmap_bytes + 7) & !7;
        unsafe {
            core::ptr::write(
                page.as_ptr().cast::<SlabHeader>(),
                SlabHeader {
                    nused: 0,
                    ntotal,
                    items_offset,
                    item_stride: self.item_stride,
                    bitmap_offset,
                },
            );
            core::ptr::write_bytes(page.as_ptr().add(bitmap_offset), 0, bitmap_bytes);
        }
        Slab { page, region }
    }

    /// Allocates one item. Picks a partial slab first, then an empty one;
    /// if none exist, grows the pool by requesting a fresh page from kmem.
    pub fn alloc<P: PmapOps>(
        &mut self,
        kmem: &mut KmemAllocator<P>,
        pmap: &P,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, PoolError> {
        if self.partial.is_empty() && self.empty.is_empty() {
            self.grow(kmem, pmap, flags)?;
        }

        let mut slab = if !self.partial.is_empty() {
            self.partial.pop().unwrap()
        } else {
            self.empty.pop().unwrap()
        };

        let index = slab
            .first_free_index()
            .expect("pool: chosen slab unexpectedly full");
        slab.set_bit(index, true);
        let h = slab.header_mut();
        h.nused += 1;
        let new_occ = occupancy_of(h.nused, h.ntotal);

        let item_ptr = slab.item_ptr(index);
        let slab_header_ptr = NonNull::new(slab.page.as_ptr().cast::<SlabHeader>()).unwrap();
        unsafe {
            core::ptr::write(
                item_ptr.cast::<ItemHeader>(),
                ItemHeader {
                    canary: ITEM_CANARY,
                    index: index as u32,
                    slab: slab_header_ptr,
                },
            );
        }
        let payload = unsafe { item_ptr.add(size_of::<ItemHeader>()) };

        match new_occ {
            Occupancy::Partial => self.partial.push(slab),
            Occupancy::Full => self.full.push(slab),
            Occupancy::Empty => unreachable!("an item was just allocated"),
        }

        if flags.zero() {
            unsafe { core::ptr::write_bytes(payload, 0, self.item_size) };
        }
        Ok(NonNull::new(payload).expect("item pointer is never null"))
    }

    fn grow<P: PmapOps>(
        &mut self,
        kmem: &mut KmemAllocator<P>,
        pmap: &P,
        flags: AllocFlags,
    ) -> Result<(), PoolError> {
        let region = kmem
            .alloc(pmap, PAGE_SIZE, flags)
            .map_err(PoolError::OutOfMemory)?;
        let page = NonNull::new(region.start.as_mut_ptr::<u8>()).expect("kmem region is non-null");
        let slab = self.build_slab(page, region);
        kinfo!("pool[{}]: grew by one slab", self.name);
        self.empty.push(slab);
        Ok(())
    }

    /// Frees a previously allocated item. Validates the canary and the
    /// slab's occupancy bit; corruption or a double-free panics rather than
    /// silently proceeding.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let item_ptr = unsafe { ptr.as_ptr().sub(size_of::<ItemHeader>()) };
        let header = unsafe { &*item_ptr.cast::<ItemHeader>() };
        if header.canary != ITEM_CANARY {
            kerr!("pool[{}]: corrupt item header at {:p}", self.name, ptr.as_ptr());
            panic!("pool: item canary corrupted");
        }
        let index = header.index as usize;
        let slab_header_ptr = header.slab;

        let list = if let Some(pos) = self
            .partial
            .iter()
            .position(|s| core::ptr::eq(s.page.as_ptr().cast(), slab_header_ptr.as_ptr()))
        {
            (&mut self.partial, pos)
        } else if let Some(pos) = self
            .full
            .iter()
            .position(|s| core::ptr::eq(s.page.as_ptr().cast(), slab_header_ptr.as_ptr()))
        {
            (&mut self.full, pos)
        } else {
            panic!("pool[{}]: freed item does not belong to a tracked slab", self.name);
        };

        let (vec, pos) = list;
        let mut slab = vec.swap_remove(pos);

        if !slab.bit_is_set(index) {
            panic!("pool[{}]: double free of item at index {}", self.name, index);
        }
        slab.set_bit(index, false);
        let h = slab.header_mut();
        h.nused -= 1;
        let new_occ = occupancy_of(h.nused, h.ntotal);

        match new_occ {
            Occupancy::Empty => self.empty.push(slab),
            Occupancy::Partial => self.partial.push(slab),
            Occupancy::Full => unreachable!("an item was just freed"),
        }
    }

    /// Total items currently allocated across every slab.
    pub fn used_items(&self) -> usize {
        self.partial.iter().map(|s| s.header().nused).sum::<usize>()
            + self.full.iter().map(|s| s.header().nused).sum::<usize>()
    }

    /// Number of slabs on the empty list.
    pub fn empty_slabs(&self) -> usize {
        self.empty.len()
    }

    /// Number of slabs on the full list.
    pub fn full_slabs(&self) -> usize {
        self.full.len()
    }

    /// Number of slabs on the partial list.
    pub fn partial_slabs(&self) -> usize {
        self.partial.len()
    }

    /// Items that fit in one slab, for callers sizing test scenarios.
    pub fn items_per_slab(&self) -> usize {
        self.items_per_slab
    }

    /// Tears the pool down: runs `item_dtor` on every still-allocated item,
    /// then hands every slab's page back to `kmem` and scrubs the pool
    /// descriptor. Consumes the pool, since there is nothing left to
    /// allocate from afterward.
    pub fn destroy<P: PmapOps>(
        mut self,
        kmem: &mut KmemAllocator<P>,
        pmap: &P,
        mut item_dtor: impl FnMut(NonNull<u8>),
    ) {
        let slabs = self
            .empty
            .drain(..)
            .chain(self.partial.drain(..))
            .chain(self.full.drain(..));
        let mut freed = 0usize;
        for slab in slabs {
            let h = slab.header();
            for index in 0..h.ntotal {
                if slab.bit_is_set(index) {
                    let item_ptr = slab.item_ptr(index);
                    let payload = unsafe { item_ptr.add(size_of::<ItemHeader>()) };
                    item_dtor(NonNull::new(payload).expect("item pointer is never null"));
                }
            }
            kmem.free(pmap, slab.region);
            freed += 1;
        }
        kinfo!("pool[{}]: destroyed, freed {} slab page(s)", self.name, freed);
    }
}

/// A global, lockable [`Pool`] for use as a `static`.
pub struct GlobalPool(SpinLock<Option<Pool>>);

impl GlobalPool {
    /// Creates an uninitialized global pool slot.
    pub const fn new() -> Self {
        Self(SpinLock::new(None))
    }

    /// Initializes the pool. Panics if already initialized.
    pub fn init(&self, name: &'static str, item_size: usize) -> Result<(), PoolError> {
        let mut guard = self.0.lock();
        assert!(guard.is_none(), "pool already initialized");
        *guard = Some(Pool::new(name, item_size)?);
        Ok(())
    }

    /// Runs `f` with exclusive access to the underlying [`Pool`].
    pub fn with<R>(&self, f: impl FnOnce(&mut Pool) -> R) -> R {
        let mut guard = self.0.lock();
        f(guard.as_mut().expect("pool used before init"))
    }
}

impl Default for GlobalPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::tests::FakePmap;
    use crate::kmem::KmemAllocator;
    use talus_core::addr::{PhysAddr, VirtAddr};

    fn setup(pages: usize) -> (KmemAllocator<FakePmap>, FakePmap) {
        pmm::fresh(pages);
        (
            KmemAllocator::new(VirtAddr::new(0x4_0000_0000), 0x100_0000),
            FakePmap::new(),
        )
    }

    // Thin wrapper so tests can (re)initialize a fresh global PMM without
    // depending on module-private details of `crate::pmm`.
    mod pmm {
        pub fn fresh(pages: usize) {
            crate::pmm::init(
                &[crate::PhysMemoryRegion {
                    start: super::PhysAddr::new(0),
                    size: (pages * crate::PAGE_SIZE) as u64,
                    usable: true,
                }],
                &[],
            );
        }
    }

    #[test]
    fn item_layout_fits_in_one_page() {
        let pool = Pool::new("test", 64).unwrap();
        assert!(pool.items_per_slab() > 0);
        assert!(pool.items_per_slab() * pool.item_stride <= PAGE_SIZE);
    }

    #[test]
    fn alloc_free_roundtrip() {
        let (mut kmem, pmap) = setup(16);
        let mut pool = Pool::new("test", 64).unwrap();
        let item = pool.alloc(&mut kmem, &pmap, AllocFlags::WAITOK).unwrap();
        assert_eq!(pool.used_items(), 1);
        pool.free(item);
        assert_eq!(pool.used_items(), 0);
        assert_eq!(pool.empty_slabs(), 1);
    }

    /// Scenario S4: fill a slab, spill into a second, then free the last
    /// allocation and observe the second slab return to the empty list.
    #[test]
    fn fill_spills_to_second_slab() {
        let (mut kmem, pmap) = setup(16);
        let mut pool = Pool::new("test", 64).unwrap();
        let per_slab = pool.items_per_slab();

        let mut items = alloc::vec::Vec::new();
        for _ in 0..per_slab {
            items.push(pool.alloc(&mut kmem, &pmap, AllocFlags::WAITOK).unwrap());
        }
        assert_eq!(pool.full_slabs(), 1);
        assert_eq!(pool.partial_slabs(), 0);

        let extra = pool.alloc(&mut kmem, &pmap, AllocFlags::WAITOK).unwrap();
        assert_eq!(pool.empty_slabs() + pool.partial_slabs(), 1);
        assert_eq!(pool.used_items(), per_slab + 1);

        pool.free(extra);
        assert_eq!(pool.empty_slabs(), 1);
        assert_eq!(pool.used_items(), per_slab);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let (mut kmem, pmap) = setup(16);
        let mut pool = Pool::new("test", 64).unwrap();
        let item = pool.alloc(&mut kmem, &pmap, AllocFlags::WAITOK).unwrap();
        pool.free(item);
        pool.free(item);
    }

    #[test]
    fn destroy_frees_every_slab_page() {
        let (mut kmem, pmap) = setup(16);
        let mut pool = Pool::new("test", 64).unwrap();
        let per_slab = pool.items_per_slab();
        for _ in 0..per_slab + 1 {
            let _ = pool.alloc(&mut kmem, &pmap, AllocFlags::WAITOK).unwrap();
        }
        assert_eq!(pool.full_slabs() + pool.partial_slabs(), 2);

        let free_before = crate::pmm::with(|m| m.free_pages());
        let mut destroyed = 0usize;
        pool.destroy(&mut kmem, &pmap, |_item| destroyed += 1);
        assert_eq!(destroyed, per_slab + 1);
        assert_eq!(crate::pmm::with(|m| m.free_pages()), free_before + 2);
    }

    #[test]
    fn zero_flag_zeroes_payload() {
        let (mut kmem, pmap) = setup(16);
        let mut pool = Pool::new("test", 16).unwrap();
        let item = pool
            .alloc(&mut kmem, &pmap, AllocFlags::WAITOK | AllocFlags::ZERO)
            .unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(item.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
