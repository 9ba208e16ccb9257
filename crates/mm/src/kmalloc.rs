//! General-purpose kernel heap: named, independently-capped pools of
//! variable-size allocations.
//!
//! Each [`KmallocPool`] owns one or more arenas obtained from
//! [`kmem`](crate::kmem). Within an arena, free space is tracked as an
//! address-sorted, self-coalescing list of blocks. Every block (free or
//! allocated) carries an in-band header: a magic constant for corruption
//! detection and a signed size whose sign distinguishes free (positive)
//! from allocated (negative). This mirrors how the free list and allocated
//! blocks share one address-ordered chain, so neighbors can always be
//! found and merged without a separate side table.

use alloc::vec::Vec;
use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use talus_core::addr::VirtAddr;
use talus_core::sync::SpinLock;
use talus_core::{kerr, kinfo};

use crate::kmem::{AllocFlags, KmemAllocator, KmemError};
use crate::mapper::PmapOps;

const BLOCK_MAGIC: u32 = 0xDEAD_BEEF;
const ARENA_MAGIC: u32 = 0xFACE_FEED;
const MIN_BLOCK_SIZE: usize = size_of::<BlockHeader>() + 16;

/// Header prefixing every block, free or allocated, in an arena.
///
/// `size` is positive while the block is free and its bitwise negation
/// minus one (`!n` trick avoiding `i64::MIN` asymmetry is unnecessary here
/// since sizes never approach `i64::MAX`) while allocated: `-size` for an
/// allocated block of `size` usable bytes excluding the header.
#[repr(C)]
struct BlockHeader {
    magic: u32,
    _pad: u32,
    size: i64,
}

impl BlockHeader {
    fn is_free(&self) -> bool {
        self.size > 0
    }

    fn payload_size(&self) -> usize {
        self.size.unsigned_abs() as usize
    }

    fn total_size(&self) -> usize {
        size_of::<BlockHeader>() + self.payload_size()
    }

    fn check_magic(&self) {
        assert_eq!(self.magic, BLOCK_MAGIC, "kmalloc: corrupt block header");
    }
}

/// One kmem-backed region, subdivided into an address-sorted block chain.
struct Arena {
    magic: u32,
    base: VirtAddr,
    size: usize,
    kmem_handle: crate::kmem::KmemRegion,
    /// Sorted by address; contiguous with no gaps between entries.
    free_offsets: Vec<usize>,
}

impl Arena {
    fn header_at(&self, offset: usize) -> &BlockHeader {
        unsafe { &*self.base.as_ptr::<BlockHeader>().byte_add(offset) }
    }

    fn header_at_mut(&self, offset: usize) -> &mut BlockHeader {
        unsafe { &mut *(self.base.as_mut_ptr::<BlockHeader>().byte_add(offset)) }
    }

    fn payload_ptr(&self, offset: usize) -> *mut u8 {
        unsafe { self.base.as_mut_ptr::<u8>().add(offset + size_of::<BlockHeader>()) }
    }

    /// Inserts `offset` into the sorted free list and coalesces it with an
    /// address-adjacent free neighbor on either side.
    fn insert_and_coalesce(&mut self, mut offset: usize) {
        let pos = self.free_offsets.partition_point(|&o| o < offset);

        if pos < self.free_offsets.len() {
            let next_offset = self.free_offsets[pos];
            let header = self.header_at(offset);
            if offset + header.total_size() == next_offset {
                let merged_size = header.payload_size()
                    + size_of::<BlockHeader>()
                    + self.header_at(next_offset).payload_size();
                self.header_at_mut(offset).size = merged_size as i64;
                self.free_offsets.remove(pos);
            }
        }

        if pos > 0 {
            let prev_offset = self.free_offsets[pos - 1];
            let prev_header = self.header_at(prev_offset);
            if prev_offset + prev_header.total_size() == offset {
                let merged_size = prev_header.payload_size()
                    + size_of::<BlockHeader>()
                    + self.header_at(offset).payload_size();
                self.header_at_mut(prev_offset).size = merged_size as i64;
                return;
            }
        }

        let pos = self.free_offsets.partition_point(|&o| o < offset);
        self.free_offsets.insert(pos, offset);
        let _ = &mut offset;
    }

    /// First-fit search for a free block of at least `need` total bytes
    /// (header included). Splits the tail off if the remainder would still
    /// hold a minimum-size block.
    fn find_and_take(&mut self, need: usize) -> Option<usize> {
        let idx = self
            .free_offsets
            .iter()
            .position(|&o| self.header_at(o).total_size() >= need)?;
        let offset = self.free_offsets.remove(idx);
        let header = self.header_at(offset);
        let block_total = header.total_size();

        if block_total >= need + MIN_BLOCK_SIZE {
            let remainder_offset = offset + need;
            let remainder_size = block_total - need;
            self.header_at_mut(offset).size = -((need - size_of::<BlockHeader>()) as i64);
            self.header_at_mut(remainder_offset).magic = BLOCK_MAGIC;
            self.header_at_mut(remainder_offset).size =
                (remainder_size - size_of::<BlockHeader>()) as i64;
            let pos = self.free_offsets.partition_point(|&o| o < remainder_offset);
            self.free_offsets.insert(pos, remainder_offset);
        } else {
            self.header_at_mut(offset).size = -(self.header_at(offset).payload_size() as i64);
        }

        Some(offset)
    }

    fn free_bytes(&self) -> usize {
        self.free_offsets
            .iter()
            .map(|&o| self.header_at(o).payload_size())
            .sum()
    }
}

/// Errors from kmalloc allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmallocError {
    /// Growing the pool by a new arena failed.
    Kmem(KmemError),
    /// The request, plus the cap already in use, would exceed the pool's
    /// byte cap.
    CapExceeded,
    /// `size` is zero, or too large to ever fit in one arena.
    InvalidSize,
}

impl fmt::Display for KmallocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KmallocError::Kmem(e) => write!(f, "kmalloc: {e}"),
            KmallocError::CapExceeded => write!(f, "kmalloc: pool byte cap exceeded"),
            KmallocError::InvalidSize => write!(f, "kmalloc: invalid allocation size"),
        }
    }
}

/// Default size of a freshly grown arena, in bytes.
const DEFAULT_ARENA_SIZE: usize = 64 * 1024;

/// A named, byte-capped kmalloc pool.
pub struct KmallocPool {
    name: &'static str,
    arenas: Vec<Arena>,
    current_bytes: usize,
    cap_bytes: usize,
}

impl KmallocPool {
    /// Creates an empty pool with no arenas. `cap_bytes` bounds the sum of
    /// all live allocations' payload sizes.
    pub fn new(name: &'static str, cap_bytes: usize) -> Self {
        Self {
            name,
            arenas: Vec::new(),
            current_bytes: 0,
            cap_bytes,
        }
    }

    /// Bytes currently allocated (payload only, headers excluded).
    pub fn used_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Total free payload bytes across every arena.
    pub fn free_bytes(&self) -> usize {
        self.arenas.iter().map(Arena::free_bytes).sum()
    }

    /// Allocates `size` bytes (8-byte aligned payload), growing the pool
    /// with a fresh arena if no existing arena has a large-enough block.
    pub fn alloc<P: PmapOps>(
        &mut self,
        kmem: &mut KmemAllocator<P>,
        pmap: &P,
        size: usize,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, KmallocError> {
        if size == 0 {
            return Err(KmallocError::InvalidSize);
        }
        let payload = (size + 7) & !7;
        if self.current_bytes + payload > self.cap_bytes {
            return Err(KmallocError::CapExceeded);
        }
        let need = payload + size_of::<BlockHeader>();

        let offset = loop {
            let mut found = None;
            for (i, arena) in self.arenas.iter_mut().enumerate() {
                if let Some(off) = arena.find_and_take(need) {
                    found = Some((i, off));
                    break;
                }
            }
            if let Some((i, off)) = found {
                break (i, off);
            }
            self.grow(kmem, pmap, need, flags)?;
        };

        let (arena_idx, block_offset) = offset;
        let arena = &self.arenas[arena_idx];
        let payload_ptr = arena.payload_ptr(block_offset);
        if flags.zero() {
            unsafe { core::ptr::write_bytes(payload_ptr, 0, payload) };
        }
        self.current_bytes += payload;
        Ok(NonNull::new(payload_ptr).expect("payload pointer is never null"))
    }

    fn grow<P: PmapOps>(
        &mut self,
        kmem: &mut KmemAllocator<P>,
        pmap: &P,
        need: usize,
        flags: AllocFlags,
    ) -> Result<(), KmallocError> {
        let arena_size = crate::round_up_to_page(need.max(DEFAULT_ARENA_SIZE));
        let region = kmem
            .alloc(pmap, arena_size, flags)
            .map_err(KmallocError::Kmem)?;
        let mut arena = Arena {
            magic: ARENA_MAGIC,
            base: region.start,
            size: region.size,
            kmem_handle: region,
            free_offsets: Vec::new(),
        };
        unsafe {
            core::ptr::write(
                arena.base.as_mut_ptr::<BlockHeader>(),
                BlockHeader {
                    magic: BLOCK_MAGIC,
                    _pad: 0,
                    size: (region.size - size_of::<BlockHeader>()) as i64,
                },
            );
        }
        arena.free_offsets.push(0);
        kinfo!(
            "kmalloc[{}]: grew by {} bytes at {:#x}",
            self.name,
            region.size,
            region.start.as_u64()
        );
        self.arenas.push(arena);
        Ok(())
    }

    /// Frees a block previously returned by [`alloc`](Self::alloc).
    ///
    /// Panics if the pointer's header magic is corrupted or the block is
    /// already free (double-free), since both indicate a kernel bug rather
    /// than a recoverable condition.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let header_ptr = unsafe { ptr.as_ptr().sub(size_of::<BlockHeader>()) }.cast::<BlockHeader>();
        let addr = header_ptr as usize as u64;

        let arena_idx = self
            .arenas
            .iter()
            .position(|a| {
                let start = a.base.as_u64();
                addr >= start && addr < start + a.size as u64
            })
            .unwrap_or_else(|| panic!("kmalloc[{}]: freed pointer not in any arena", self.name));

        let arena = &mut self.arenas[arena_idx];
        let offset = (addr - arena.base.as_u64()) as usize;
        let header = arena.header_at(offset);
        header.check_magic();
        if header.is_free() {
            kerr!("kmalloc[{}]: double free at offset {:#x}", self.name, offset);
            panic!("kmalloc: double free");
        }
        let payload_size = header.payload_size();
        arena.header_at_mut(offset).size = payload_size as i64;
        arena.insert_and_coalesce(offset);
        self.current_bytes -= payload_size;
    }

    /// Number of arenas currently backing this pool.
    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    /// Whether `self`'s sole arena has coalesced back to one fully free
    /// block spanning its entire kmem region — used to assert the heap
    /// returns to its initial state once every allocation is freed.
    pub fn is_single_arena_fully_free(&self) -> bool {
        self.arenas.len() == 1
            && self.arenas[0].free_offsets.len() == 1
            && self.arenas[0].free_offsets[0] == 0
            && self.arenas[0].header_at(0).total_size() == self.arenas[0].size
    }
}

/// A global, lockable [`KmallocPool`] for use as a `static`.
pub struct GlobalKmallocPool(SpinLock<Option<KmallocPool>>);

impl GlobalKmallocPool {
    /// Creates an uninitialized global pool slot.
    pub const fn new() -> Self {
        Self(SpinLock::new(None))
    }

    /// Initializes the pool. Panics if already initialized.
    pub fn init(&self, name: &'static str, cap_bytes: usize) {
        let mut guard = self.0.lock();
        assert!(guard.is_none(), "kmalloc pool already initialized");
        *guard = Some(KmallocPool::new(name, cap_bytes));
    }

    /// Runs `f` with exclusive access to the underlying [`KmallocPool`].
    pub fn with<R>(&self, f: impl FnOnce(&mut KmallocPool) -> R) -> R {
        let mut guard = self.0.lock();
        f(guard.as_mut().expect("kmalloc pool used before init"))
    }
}

impl Default for GlobalKmallocPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::tests::FakePmap;
    use talus_core::addr::PhysAddr;

    fn setup(pages: usize) -> (KmemAllocator<FakePmap>, FakePmap) {
        crate::pmm::init(
            &[crate::PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: (pages * crate::PAGE_SIZE) as u64,
                usable: true,
            }],
            &[],
        );
        (
            KmemAllocator::new(VirtAddr::new(0x5_0000_0000), 0x100_0000),
            FakePmap::new(),
        )
    }

    #[test]
    fn alloc_free_roundtrip() {
        let (mut kmem, pmap) = setup(64);
        let mut pool = KmallocPool::new("test", 1 << 20);
        let p = pool.alloc(&mut kmem, &pmap, 128, AllocFlags::WAITOK).unwrap();
        assert_eq!(pool.used_bytes(), 128);
        pool.free(p);
        assert_eq!(pool.used_bytes(), 0);
        assert!(pool.is_single_arena_fully_free());
    }

    /// Scenario S3: allocate x, y, z in order, then free y, x, z — the
    /// arena must coalesce back to a single free block spanning the whole
    /// arena regardless of free order.
    #[test]
    fn out_of_order_free_coalesces_fully() {
        let (mut kmem, pmap) = setup(64);
        let mut pool = KmallocPool::new("test", 1 << 20);
        let x = pool.alloc(&mut kmem, &pmap, 100, AllocFlags::WAITOK).unwrap();
        let y = pool.alloc(&mut kmem, &pmap, 200, AllocFlags::WAITOK).unwrap();
        let z = pool.alloc(&mut kmem, &pmap, 100, AllocFlags::WAITOK).unwrap();

        pool.free(y);
        pool.free(x);
        pool.free(z);

        assert_eq!(pool.used_bytes(), 0);
        assert!(pool.is_single_arena_fully_free());
    }

    #[test]
    fn cap_is_enforced() {
        let (mut kmem, pmap) = setup(64);
        let mut pool = KmallocPool::new("test", 64);
        let err = pool.alloc(&mut kmem, &pmap, 128, AllocFlags::WAITOK);
        assert_eq!(err, Err(KmallocError::CapExceeded));
    }

    #[test]
    fn zero_flag_zeroes_payload() {
        let (mut kmem, pmap) = setup(64);
        let mut pool = KmallocPool::new("test", 1 << 20);
        let p = pool
            .alloc(&mut kmem, &pmap, 32, AllocFlags::WAITOK | AllocFlags::ZERO)
            .unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let (mut kmem, pmap) = setup(64);
        let mut pool = KmallocPool::new("test", 1 << 20);
        let p = pool.alloc(&mut kmem, &pmap, 64, AllocFlags::WAITOK).unwrap();
        pool.free(p);
        pool.free(p);
    }

    #[test]
    fn growth_adds_a_second_arena_when_first_is_full() {
        let (mut kmem, pmap) = setup(64);
        let mut pool = KmallocPool::new("test", 1 << 24);
        // First allocation fills (and slightly exceeds via header overhead)
        // a default-size arena, forcing growth for the second.
        let _a = pool
            .alloc(&mut kmem, &pmap, DEFAULT_ARENA_SIZE - 64, AllocFlags::WAITOK)
            .unwrap();
        let _b = pool.alloc(&mut kmem, &pmap, 256, AllocFlags::WAITOK).unwrap();
        assert_eq!(pool.arena_count(), 2);
    }
}
