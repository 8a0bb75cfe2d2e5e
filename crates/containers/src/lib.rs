#![no_std]
#![feature(allocator_api)]

//! Allocator-generic containers used throughout the storage core.
//!
//! Most of these are thin aliases over `alloc`'s own allocator-generic
//! types, which is the idiomatic choice once `#![feature(allocator_api)]`
//! is available: there is no reason to hand-roll a vector or a box when
//! `alloc::vec::Vec<T, A>` and `alloc::boxed::Box<T, A>` already take an
//! allocator parameter. The pieces that `alloc` does not provide — an
//! open-addressed hash map with tombstones, an owned string, and an LRU
//! cache with an explicit eviction callback — are implemented here.

extern crate alloc;

#[cfg(test)]
extern crate std;

mod hash;
mod hashmap;
mod lru;
mod optional;
mod string;

pub use hash::KernelHasher;
pub use hashmap::KHashMap;
pub use lru::LruCache;
pub use optional::KOptional;
pub use string::KString;

use alloc::alloc::Global;
use core::alloc::Allocator;

/// An ordered, growable sequence. `alloc::vec::Vec<T, A>` already does
/// exactly what the spec asks for ("an ordered vector... parameterised
/// by an allocator"); re-exporting it under the kernel's naming keeps
/// call sites consistent with [`KHashMap`]/[`KString`]/[`KRc`] without
/// duplicating a well-tested implementation.
pub type KVec<T, A = Global> = alloc::vec::Vec<T, A>;

/// A reference-counted pointer. Single-threaded throughout this kernel,
/// so the atomic bookkeeping `alloc::sync::Arc` performs is wasted work,
/// but `alloc::rc::Rc<T, A>` is not `Send`/`Sync` at all, which every
/// vnode (shared between a mount's pin map and open file handles) needs
/// to cross the `async`-free but still multi-module boundary. We keep
/// `Arc` for its allocator-generic constructor and accept the unused
/// atomics; a bespoke non-atomic refcount would only re-derive `Rc`.
pub type KRc<T, A = Global> = alloc::sync::Arc<T, A>;

/// A single-owner, heap-allocated pointer.
pub type KBox<T, A = Global> = alloc::boxed::Box<T, A>;

/// Returns `true` once `used` exceeds three quarters of `capacity` — the
/// shared load-factor threshold for [`KHashMap`] and the fingerprint
/// tables built on top of it.
pub(crate) fn over_load_factor(used: usize, capacity: usize) -> bool {
    used * 4 >= capacity * 3
}

/// Helper for call sites that want a default-constructed allocator
/// generically (tests, and any container built with `A = Global`).
pub trait DefaultIn: Allocator + Default {}
impl<A: Allocator + Default> DefaultIn for A {}
