//! Hazard-pointer based safe memory reclamation.
//!
//! The unit of protection is a hazard slot: a single-writer, multi-reader
//! atomic word holding the address a thread is about to dereference. Slots
//! live in fixed-size chunks of `32 * blk_size` words; a chunk hands out
//! sub-blocks of `blk_size` contiguous slots through a 32-bit reservation
//! bitmap. A [`HazardDomain`] strings chunks together in an append-only
//! list, so the pool only ever grows and a chunk's address is stable for
//! the life of the domain. One domain is typically bound to one data
//! structure; hazard values are only comparable within their domain.
//!
//! A thread takes part by creating a [`HazardContext`], which reserves one
//! sub-block of `S` slots and keeps a private buffer of up to `R` retired
//! pointers. Retiring transfers ownership of a pointer that has already
//! been unlinked from the data structure; the memory is freed later, once a
//! scan proves no slot anywhere in the domain still holds its address. The
//! scan works against a [`HazardSnapshot`]: a one-shot, sorted,
//! mark-stripped copy of every slot in the domain, taken after a full
//! fence so it cannot miss a protection that was published before the
//! snapshot began. Chunks appended while the snapshot is being built are
//! deliberately ignored: a slot that did not exist when a pointer was
//! unlinked cannot have been protecting it, because unlinked pointers are
//! unreachable and can never be newly protected.
//!
//! When a context's buffer fills and nothing in it is reclaimable, the
//! whole batch escalates to the domain's shared deferred-delete list, a
//! lock-free LIFO that any thread may drain with
//! [`HazardDomain::collect`]: the list is swapped out atomically, checked
//! against a fresh snapshot, and the still-protected survivors are pushed
//! back. Several threads may collect concurrently; at worst a node
//! protected at snapshot time is re-queued. A context that is dropped
//! releases its sub-block (zeroing the slots so stale values cannot pin
//! anything), hands its buffered pointers to the domain, and runs one
//! collect.
//!
//! Every operation here is lock-free: reservation, release, retire, and
//! collect all complete in a bounded number of steps unless some other
//! thread made progress in the meantime.

pub(crate) mod chunk;
pub(crate) mod context;
pub(crate) mod domain;
pub(crate) mod snapshot;

pub use context::{HazardContext, HazardPointer};
pub use domain::HazardDomain;
pub use snapshot::HazardSnapshot;
