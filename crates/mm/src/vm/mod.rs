//! Virtual memory: per-address-space maps, amaps, and anons.
//!
//! ```text
//! VmMap  ->  VmEntry { aref: (Amap, offset) }
//! Amap   ->  [Option<AnonRef>; capacity]     (shared after vm_map_clone)
//! Anon   ->  one physical page                (copied on a shared write fault)
//! ```
//!
//! [`map::VmMap::fault`] is the entry point called from trap dispatch;
//! [`map::VmMap::clone_map`] implements fork.

pub mod amap;
pub mod anon;
pub mod map;

pub use amap::{Amap, AmapRef};
pub use anon::{Anon, AnonRef, FaultError};
pub use map::{amap_copy_on_need, Aref, Prot, VmEntry, VmMap, VmMapError};
