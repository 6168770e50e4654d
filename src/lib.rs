#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A lock-free hash map built from a split-ordered linked list, with safe
//! memory reclamation provided by hazard pointers.
//!
//! The crate has two halves:
//!
//! - [`hazard`] implements Michael's hazard-pointer scheme: a
//!   [`HazardDomain`](hazard::HazardDomain) owns an ever-growing pool of
//!   hazard-pointer slots and a deferred-delete list, and per-thread
//!   [`HazardContext`](hazard::HazardContext)es reserve slot blocks from it,
//!   buffer retired pointers, and reclaim them once no slot in the domain
//!   protects them. Only atomic reads and writes are used; there is no
//!   garbage collector and no epoch machinery.
//!
//! - [`list`] implements the Shalev-Shavit split-ordered list on top of it:
//!   a single linked list sorted by bit-reversed hash, indexed by a lazily
//!   populated table of dummy nodes, giving average O(1) concurrent insert,
//!   lookup, and removal without locks.
//!
//! All public operations are lock-free. A failed compare-and-swap always
//! means some other thread made progress.

pub mod hazard;
pub mod list;

#[cfg(test)]
pub(crate) mod test_util;

pub use list::{Accessor, SplitOrderedList, ValueGuard};
