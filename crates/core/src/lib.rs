//! Core primitives shared across the talus kernel memory stack.
//!
//! Provides typed addresses ([`addr`]), page/frame abstractions ([`paging`]),
//! a dependency-free logging facade ([`log`]), and synchronization
//! primitives usable before any allocator is available ([`sync`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod log;
pub mod paging;
pub mod sync;
