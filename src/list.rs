//! A lock-free split-ordered list.
//!
//! The whole map is one singly linked list, sorted by *split-order* key:
//! the bit-reversed hash, widened to 64 bits and tagged in the low bit so
//! that data nodes (`1`) interleave with per-bucket *dummy* nodes (`0`).
//! Reversing the bits makes every bucket's items contiguous: when the
//! bucket count doubles, a bucket `b` splits by inserting a single new
//! dummy in the middle of its run; no node is ever rehashed or moved.
//!
//! A bucket table maps `hash mod size` to the bucket's dummy node, or null
//! while the bucket is uninitialized. Dummies are created on demand,
//! recursively: bucket `b`'s parent is `b` with its top set bit cleared,
//! and the new dummy is inserted by walking from the parent's dummy.
//! Bucket 0's dummy is the list head and is created with the list. Dummies
//! are never removed.
//!
//! The table itself is published as a single atomic pointer, so the
//! `(buckets, size)` pair can never tear: growing the table swaps in a
//! copy with the new half zeroed and retires the old one through the
//! hazard domain, exactly like any other node.
//!
//! Removal is two-phase, in the Harris style: a CAS sets the mark bit in
//! the victim's own `next` word (logical deletion, the linearization
//! point), then a CAS swings the predecessor past it (physical unlink).
//! Any traversal that runs into a marked node helps with the unlink before
//! carrying on, so a stalled deleter cannot wedge the list. Whoever wins
//! the unlink CAS retires the node to its [`Accessor`]'s hazard context.
//!
//! An [`Accessor`] is the per-thread way in: it owns a hazard context and
//! keeps a `prev`/`cur`/`next` cursor whose three pointers are published
//! to hazard slots and revalidated before every dereference, plus a fourth
//! slot pinning the bucket table for the duration of each operation.

pub(crate) mod mark_ptr;
pub(crate) mod split_ordered;

pub use split_ordered::{Accessor, SplitOrderedList, ValueGuard};
