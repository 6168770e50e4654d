use std::{
    ptr,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;

/// Sub-blocks per chunk; one bit of the reservation bitmap each.
pub(crate) const NUM_BLOCKS: usize = 32;

const FULL: u32 = u32::MAX;

/// A fixed-capacity block of hazard slots, reserved and released in
/// contiguous sub-blocks of `blk_size` slots.
///
/// Slots are plain machine words (`0` is null); the reclamation machinery
/// only ever compares addresses, never dereferences them, so the chunk is
/// oblivious to the protected type.
pub(crate) struct HazPtrChunk {
    /// `blk_size * NUM_BLOCKS` slots. A slot is written only by the thread
    /// owning the sub-block that contains it; any thread may read it.
    slots: Box<[AtomicUsize]>,
    /// Bit `i` set means sub-block `i` is reserved.
    bitmap: AtomicU32,
    blk_size: usize,
    /// Next chunk in the domain's pool. Written once, before this chunk is
    /// published at the pool head.
    next: AtomicPtr<HazPtrChunk>,
}

impl HazPtrChunk {
    pub(crate) fn new(blk_size: usize) -> Self {
        assert!(blk_size > 0);

        let hp_count = blk_size * NUM_BLOCKS;
        let mut slots = Vec::with_capacity(hp_count);
        slots.resize_with(hp_count, || AtomicUsize::new(0));

        Self {
            slots: slots.into_boxed_slice(),
            bitmap: AtomicU32::new(0),
            blk_size,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn hp_count(&self) -> usize {
        self.slots.len()
    }

    /// Tries to reserve one sub-block of `len` slots, returning a pointer to
    /// its first slot. Fails if `len` does not match this chunk's block size
    /// or if every sub-block is taken.
    pub(crate) fn try_reserve(&self, len: usize) -> Option<*const AtomicUsize> {
        if len != self.blk_size {
            return None;
        }

        let backoff = Backoff::new();
        let mut expected = self.bitmap.load(Ordering::Relaxed);

        while expected != FULL {
            let ix = (!expected).trailing_zeros() as usize;

            match self.bitmap.compare_exchange_weak(
                expected,
                expected | (1 << ix),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(&self.slots[ix * self.blk_size]),
                Err(observed) => {
                    expected = observed;
                    backoff.spin();
                }
            }
        }

        None
    }

    /// Releases a sub-block previously handed out by `try_reserve`. Returns
    /// `false` if `block` is not managed by this chunk, so callers can walk
    /// a chunk list probing for the owner.
    pub(crate) fn release(&self, block: *const AtomicUsize) -> bool {
        let base = self.slots.as_ptr();
        let end = unsafe { base.add(self.slots.len()) };

        if block < base || block >= end {
            return false;
        }

        // SAFETY: `block` was just shown to lie within `slots`.
        let offset = unsafe { block.offset_from(base) } as usize;
        debug_assert_eq!(offset % self.blk_size, 0);

        // Zero the slots first, so a residual value cannot keep an item
        // alive once the sub-block is handed to another thread.
        for slot in &self.slots[offset..offset + self.blk_size] {
            slot.store(0, Ordering::Release);
        }

        let mask = 1u32 << (offset / self.blk_size);
        let prev = self.bitmap.fetch_and(!mask, Ordering::AcqRel);
        debug_assert_ne!(prev & mask, 0, "sub-block released twice");

        true
    }

    /// Appends every slot's current value to `dst`. The loads are relaxed;
    /// the snapshot's leading fence establishes the happens-before with the
    /// owners' release stores.
    pub(crate) fn copy_hazard_pointers(&self, dst: &mut Vec<usize>) {
        dst.extend(self.slots.iter().map(|s| s.load(Ordering::Relaxed)));
    }

    pub(crate) fn has_reservations(&self) -> bool {
        self.bitmap.load(Ordering::Acquire) != 0
    }

    pub(crate) fn next_ptr(&self) -> *mut HazPtrChunk {
        self.next.load(Ordering::Acquire)
    }

    /// Chains `next` behind this chunk. Only valid before the chunk becomes
    /// visible at the pool head.
    pub(crate) fn set_next(&self, next: *mut HazPtrChunk) {
        self.next.store(next, Ordering::Relaxed);
    }
}
