//! Generic resource manager: a sorted, non-overlapping, address-coalesced
//! partition of a declared region into FREE / RESERVED / ACTIVE resources.
//!
//! Used for handing out non-overlapping kernel virtual address ranges (by
//! [`crate::kmem`]) and, symmetrically, for bus/I/O number or address space
//! by device drivers that never materialize in this crate.

use alloc::vec::Vec;
use core::fmt;

use talus_core::sync::SpinLock;

/// State of a single [`Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Available for `reserve`.
    Free,
    /// Reserved by a caller but not yet put to use.
    Reserved,
}

bitflags::bitflags! {
    /// Flags accepted by [`Rman::reserve`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceFlags: u32 {
        /// Activate the resource immediately on reservation.
        const ACTIVE       = 1 << 0;
        /// Hint: the region may be prefetched by the bus (MMIO regions).
        const PREFETCHABLE = 1 << 1;
        /// The region may be shared between multiple owners.
        const SHAREABLE    = 1 << 2;
    }
}

/// A single node in an [`Rman`]'s sorted partition.
#[derive(Debug, Clone, Copy)]
pub struct Resource {
    start: u64,
    end: u64,
    state: ResourceState,
    active: bool,
    flags: ResourceFlags,
}

impl Resource {
    /// Inclusive start of this resource's range.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive end of this resource's range.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Size in bytes/units of this resource.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether this resource is currently activated.
    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Errors from resource manager operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmanError {
    /// No FREE resource could satisfy the requested size/alignment/bounds.
    NoFit,
    /// `manage_region` would overlap an existing resource.
    Overlap,
    /// The requested count was zero, or alignment was not a power of two.
    InvalidArgument,
    /// `release` or `deactivate` was called on a resource that was not in
    /// the expected state.
    WrongState,
}

impl fmt::Display for RmanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RmanError::NoFit => write!(f, "no free resource fits the request"),
            RmanError::Overlap => write!(f, "region overlaps an existing resource"),
            RmanError::InvalidArgument => write!(f, "invalid resource request"),
            RmanError::WrongState => write!(f, "resource is not in the expected state"),
        }
    }
}

/// Opaque handle identifying a live [`Resource`] within an [`Rman`].
///
/// Backed by the resource's current index in the sorted partition. A
/// `release`/`reserve` elsewhere in the same `Rman` can shift this index, so
/// a handle must be used (or re-looked-up by address) before the next
/// mutating call rather than cached across one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHandle(usize);

/// A sorted, non-overlapping, address-coalesced partition of one declared
/// region of a 64-bit number space (bytes for a VA range, or an arbitrary
/// unit for bus resources).
pub struct Rman {
    /// Sorted by `start`, pairwise non-overlapping, adjacent FREE entries
    /// always coalesced.
    resources: Vec<Resource>,
    name: &'static str,
}

impl Rman {
    /// Creates an empty resource manager with no managed region yet.
    pub const fn new(name: &'static str) -> Self {
        Self {
            resources: Vec::new(),
            name,
        }
    }

    /// Declares `[start, start+size)` as FREE, coalescing with adjacent FREE
    /// neighbors. The new range must not overlap any existing resource.
    pub fn manage_region(&mut self, start: u64, size: u64) -> Result<(), RmanError> {
        if size == 0 {
            return Err(RmanError::InvalidArgument);
        }
        let end = start + size - 1;
        let insert_at = self.resources.partition_point(|r| r.end < start);
        if insert_at < self.resources.len() && self.resources[insert_at].start <= end {
            return Err(RmanError::Overlap);
        }
        let mut new_res = Resource {
            start,
            end,
            state: ResourceState::Free,
            active: false,
            flags: ResourceFlags::empty(),
        };
        // Merge with left neighbor if adjacent and free.
        let mut at = insert_at;
        if at > 0 {
            let left = &self.resources[at - 1];
            if left.state == ResourceState::Free && left.end + 1 == new_res.start {
                new_res.start = left.start;
                self.resources.remove(at - 1);
                at -= 1;
            }
        }
        // Merge with right neighbor if adjacent and free.
        if at < self.resources.len() {
            let right = &self.resources[at];
            if right.state == ResourceState::Free && new_res.end + 1 == right.start {
                new_res.end = right.end;
                self.resources.remove(at);
            }
        }
        self.resources.insert(at, new_res);
        Ok(())
    }

    /// Finds the lowest-address FREE resource able to contain a `count`-unit
    /// range aligned to `alignment` within `[bound_start, bound_end]`, and
    /// splits it into up to three pieces, returning a handle to the new
    /// RESERVED middle piece.
    pub fn reserve(
        &mut self,
        bound_start: u64,
        bound_end: u64,
        count: u64,
        alignment: u64,
        flags: ResourceFlags,
    ) -> Result<ResourceHandle, RmanError> {
        if count == 0 || !alignment.is_power_of_two() || bound_start > bound_end {
            return Err(RmanError::InvalidArgument);
        }
        for i in 0..self.resources.len() {
            let r = self.resources[i];
            if r.state != ResourceState::Free {
                continue;
            }
            let lo = r.start.max(bound_start);
            let aligned = (lo + alignment - 1) & !(alignment - 1);
            let hi = r.end.min(bound_end);
            let Some(req_end) = aligned.checked_add(count - 1) else {
                continue;
            };
            if aligned < lo || req_end > hi {
                continue;
            }

            let before = if aligned > r.start {
                Some(Resource {
                    start: r.start,
                    end: aligned - 1,
                    state: ResourceState::Free,
                    active: false,
                    flags: ResourceFlags::empty(),
                })
            } else {
                None
            };
            let after = if req_end < r.end {
                Some(Resource {
                    start: req_end + 1,
                    end: r.end,
                    state: ResourceState::Free,
                    active: false,
                    flags: ResourceFlags::empty(),
                })
            } else {
                None
            };
            let active = flags.contains(ResourceFlags::ACTIVE);
            let reserved = Resource {
                start: aligned,
                end: req_end,
                state: ResourceState::Reserved,
                active,
                flags,
            };

            self.resources.remove(i);
            let mut insert_at = i;
            if let Some(b) = before {
                self.resources.insert(insert_at, b);
                insert_at += 1;
            }
            self.resources.insert(insert_at, reserved);
            if let Some(a) = after {
                self.resources.insert(insert_at + 1, a);
            }
            return Ok(ResourceHandle(insert_at));
        }
        Err(RmanError::NoFit)
    }

    /// Returns `handle`'s resource to FREE, merging with adjacent FREE
    /// neighbors. It is a programming error to release an ACTIVE resource.
    pub fn release(&mut self, handle: ResourceHandle) -> Result<(), RmanError> {
        let idx = handle.0;
        let r = self.resources.get(idx).ok_or(RmanError::WrongState)?;
        if r.state != ResourceState::Reserved {
            return Err(RmanError::WrongState);
        }
        if r.active {
            panic!("rman[{}]: release of an active resource", self.name);
        }
        let (mut start, mut end) = (r.start, r.end);
        let mut at = idx;

        if at + 1 < self.resources.len() && self.resources[at + 1].state == ResourceState::Free
            && self.resources[at + 1].start == end + 1
        {
            end = self.resources[at + 1].end;
            self.resources.remove(at + 1);
        }
        self.resources[at] = Resource {
            start,
            end,
            state: ResourceState::Free,
            active: false,
            flags: ResourceFlags::empty(),
        };
        if at > 0 && self.resources[at - 1].state == ResourceState::Free
            && self.resources[at - 1].end + 1 == start
        {
            start = self.resources[at - 1].start;
            self.resources.remove(at - 1);
            at -= 1;
            self.resources[at] = Resource {
                start,
                end,
                state: ResourceState::Free,
                active: false,
                flags: ResourceFlags::empty(),
            };
        }
        Ok(())
    }

    /// Marks `handle`'s resource ACTIVE. Semantics of activation belong to
    /// the caller (e.g. "this VA range now has live page table mappings").
    pub fn activate(&mut self, handle: ResourceHandle) -> Result<(), RmanError> {
        let r = self.resources.get_mut(handle.0).ok_or(RmanError::WrongState)?;
        if r.state != ResourceState::Reserved {
            return Err(RmanError::WrongState);
        }
        r.active = true;
        Ok(())
    }

    /// Clears the ACTIVE bit on `handle`'s resource.
    pub fn deactivate(&mut self, handle: ResourceHandle) -> Result<(), RmanError> {
        let r = self.resources.get_mut(handle.0).ok_or(RmanError::WrongState)?;
        if r.state != ResourceState::Reserved {
            return Err(RmanError::WrongState);
        }
        r.active = false;
        Ok(())
    }

    /// Returns the resource referenced by `handle`.
    pub fn get(&self, handle: ResourceHandle) -> Option<&Resource> {
        self.resources.get(handle.0)
    }

    /// Returns the full sorted partition, for diagnostics and tests.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Sum of the sizes of all FREE resources.
    pub fn free_bytes(&self) -> u64 {
        self.resources
            .iter()
            .filter(|r| r.state == ResourceState::Free)
            .map(Resource::size)
            .sum()
    }
}

/// A global, lockable [`Rman`] for use as a `static`.
pub struct GlobalRman(SpinLock<Rman>);

impl GlobalRman {
    /// Creates a new global resource manager under the given diagnostic name.
    pub const fn new(name: &'static str) -> Self {
        Self(SpinLock::new(Rman::new(name)))
    }

    /// Runs `f` with exclusive access to the underlying [`Rman`].
    pub fn with<R>(&self, f: impl FnOnce(&mut Rman) -> R) -> R {
        f(&mut self.0.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manage_region_then_reserve() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x10000).unwrap();
        let h = rman
            .reserve(0, u64::MAX, 0x1000, 0x1000, ResourceFlags::empty())
            .unwrap();
        let r = rman.get(h).unwrap();
        assert_eq!(r.start(), 0);
        assert_eq!(r.size(), 0x1000);
    }

    #[test]
    fn reserve_respects_alignment() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x10000).unwrap();
        // Eat the first 0x100 bytes so the next fit must align up.
        let _ = rman
            .reserve(0, u64::MAX, 0x100, 1, ResourceFlags::empty())
            .unwrap();
        let h = rman
            .reserve(0, u64::MAX, 0x1000, 0x1000, ResourceFlags::empty())
            .unwrap();
        let r = rman.get(h).unwrap();
        assert_eq!(r.start() % 0x1000, 0);
    }

    #[test]
    fn reserve_then_release_is_noop_on_partition() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x10000).unwrap();
        let before = rman.resources().to_vec();
        let h = rman
            .reserve(0, u64::MAX, 0x1000, 0x1000, ResourceFlags::empty())
            .unwrap();
        rman.release(h).unwrap();
        let after = rman.resources();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[0].start(), before[0].start());
        assert_eq!(after[0].size(), before[0].size());
    }

    #[test]
    fn reserve_splits_into_three() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x3000).unwrap();
        let h = rman
            .reserve(0x1000, 0x1FFF, 0x1000, 0x1000, ResourceFlags::empty())
            .unwrap();
        assert_eq!(rman.resources().len(), 3);
        let r = rman.get(h).unwrap();
        assert_eq!(r.start(), 0x1000);
        assert_eq!(r.end(), 0x1FFF);
    }

    #[test]
    fn release_merges_both_neighbors() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x3000).unwrap();
        let h = rman
            .reserve(0x1000, 0x1FFF, 0x1000, 0x1000, ResourceFlags::empty())
            .unwrap();
        rman.release(h).unwrap();
        assert_eq!(rman.resources().len(), 1);
        assert_eq!(rman.resources()[0].size(), 0x3000);
    }

    #[test]
    fn manage_region_overlap_rejected() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x1000).unwrap();
        assert_eq!(rman.manage_region(0x800, 0x1000), Err(RmanError::Overlap));
    }

    #[test]
    fn reserve_no_fit() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x100).unwrap();
        assert_eq!(
            rman.reserve(0, u64::MAX, 0x1000, 1, ResourceFlags::empty()),
            Err(RmanError::NoFit)
        );
    }

    #[test]
    fn activate_deactivate_roundtrip() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x1000).unwrap();
        let h = rman
            .reserve(0, u64::MAX, 0x1000, 1, ResourceFlags::empty())
            .unwrap();
        rman.activate(h).unwrap();
        assert!(rman.get(h).unwrap().is_active());
        rman.deactivate(h).unwrap();
        assert!(!rman.get(h).unwrap().is_active());
    }

    #[test]
    #[should_panic(expected = "active resource")]
    fn release_active_resource_panics() {
        let mut rman = Rman::new("test");
        rman.manage_region(0, 0x1000).unwrap();
        let h = rman
            .reserve(0, u64::MAX, 0x1000, 1, ResourceFlags::ACTIVE)
            .unwrap();
        rman.release(h).unwrap();
    }
}
