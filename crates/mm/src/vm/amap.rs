//! Amaps: a fixed-capacity table of anon slots backing one VM entry's
//! present pages.
//!
//! An amap's reference count is, as with [`Anon`](crate::vm::anon::Anon),
//! the strong count of its [`AmapRef`] handle — every VM entry whose
//! `aref.amap` points at an amap holds one clone of that `Arc`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use talus_core::sync::SpinLock;

pub use super::anon::AnonRef;

/// A fixed-capacity array of anon slots, indexed by page offset within the
/// entries that reference it.
///
/// Presence is encoded directly by `Option::is_some` — a slot doubles as
/// both "is a page resident here" and "which anon owns it", so there is no
/// separate bitmap to keep in sync.
pub struct Amap {
    slots: Vec<Option<AnonRef>>,
}

/// A shared handle to an [`Amap`].
pub type AmapRef = Arc<SpinLock<Amap>>;

impl Amap {
    /// Creates a new, empty amap with room for `capacity` anon slots.
    pub fn new(capacity: usize) -> AmapRef {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Arc::new(SpinLock::new(Self { slots }))
    }

    /// Number of slots this amap can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The anon at `slot`, if one is resident.
    pub fn get(&self, slot: usize) -> Option<AnonRef> {
        self.slots.get(slot).and_then(|s| s.clone())
    }

    /// Installs `anon` at `slot`, returning whatever was there before.
    pub fn set(&mut self, slot: usize, anon: AnonRef) -> Option<AnonRef> {
        core::mem::replace(&mut self.slots[slot], Some(anon))
    }

    /// Clears `slot`, returning whatever anon was there.
    pub fn clear(&mut self, slot: usize) -> Option<AnonRef> {
        core::mem::take(&mut self.slots[slot])
    }

    /// Number of slots currently holding a resident anon.
    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Iterates over `(slot, anon)` pairs for every resident slot.
    pub fn present(&self) -> impl Iterator<Item = (usize, &AnonRef)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|a| (i, a)))
    }
}
