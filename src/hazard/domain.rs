use std::{
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam_utils::{Backoff, CachePadded};

use super::chunk::HazPtrChunk;
use super::snapshot::HazardSnapshot;

/// An owned pointer awaiting reclamation, paired with the function that
/// knows how to drop it. The pool and delete list only ever manipulate
/// pointer values, so types are erased here and restored by the dropper.
pub(crate) struct Retired {
    pub(crate) ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

impl Retired {
    /// # Safety
    ///
    /// `ptr` must have come from `Box::into_raw` and ownership transfers to
    /// the returned value.
    pub(crate) unsafe fn new<T>(ptr: *mut T) -> Self {
        unsafe fn drop_boxed<T>(ptr: *mut ()) {
            drop(Box::from_raw(ptr.cast::<T>()));
        }

        Self {
            ptr: ptr.cast(),
            drop_fn: drop_boxed::<T>,
        }
    }

    /// # Safety
    ///
    /// No hazard slot may still hold this pointer.
    pub(crate) unsafe fn reclaim(self) {
        (self.drop_fn)(self.ptr);
    }
}

struct DeleteNode {
    next: *mut DeleteNode,
    retired: Retired,
}

/// The scope within which hazard pointers are comparable: an append-only
/// pool of slot chunks plus a shared list of deferred deletions. One domain
/// is typically bound to one data structure.
pub struct HazardDomain {
    /// Head of the chunk pool. Chunks are only ever prepended and never
    /// move, so readers traverse with nothing more than the head's acquire
    /// load.
    pools_head: CachePadded<AtomicPtr<HazPtrChunk>>,
    /// Deferred deletions that overflowed a context or outlived one. Only
    /// prepended to, or swapped out whole by `collect`.
    delete_head: CachePadded<AtomicPtr<DeleteNode>>,
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl HazardDomain {
    pub fn new() -> Self {
        Self {
            pools_head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            delete_head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Reserves a contiguous block of `len` hazard slots, growing the pool
    /// with a fresh chunk when no existing chunk can serve the request.
    pub(crate) fn reserve(&self, len: usize) -> *const AtomicUsize {
        loop {
            if let Some(block) = self.pools_reserve(len) {
                return block;
            }
            // The new chunk may be fully claimed by other threads before we
            // get back to it; then we simply push another.
            self.push_chunk(len);
        }
    }

    fn pools_reserve(&self, len: usize) -> Option<*const AtomicUsize> {
        let mut p = self.pools_head.load(Ordering::Acquire);
        while let Some(chunk) = unsafe { p.as_ref() } {
            if let Some(block) = chunk.try_reserve(len) {
                return Some(block);
            }
            p = chunk.next_ptr();
        }
        None
    }

    fn push_chunk(&self, blk_size: usize) {
        let chunk = Box::into_raw(Box::new(HazPtrChunk::new(blk_size)));
        let mut head = self.pools_head.load(Ordering::Acquire);
        loop {
            // The chunk is not yet visible; its `next` can be set plainly.
            unsafe { (*chunk).set_next(head) };
            match self.pools_head.compare_exchange_weak(
                head,
                chunk,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Releases a block obtained from [`reserve`](Self::reserve). Exactly
    /// one chunk owns the address range.
    pub(crate) fn release(&self, block: *const AtomicUsize) {
        let mut p = self.pools_head.load(Ordering::Acquire);
        while let Some(chunk) = unsafe { p.as_ref() } {
            if chunk.release(block) {
                return;
            }
            p = chunk.next_ptr();
        }
        debug_assert!(false, "released a block no chunk of this domain owns");
    }

    /// Transfers ownership of `ptr` to the domain's deferred-delete list.
    /// It will be dropped by some future [`collect`](Self::collect) once no
    /// hazard slot protects it.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `Box::into_raw`, must be unreachable for
    /// new readers, and must not be retired again.
    pub unsafe fn retire<T: Send>(&self, ptr: *mut T) {
        self.enqueue(Retired::new(ptr));
    }

    pub(crate) fn enqueue(&self, retired: Retired) {
        let node = Box::into_raw(Box::new(DeleteNode {
            next: ptr::null_mut(),
            retired,
        }));
        self.push_delete_node(node);
    }

    fn push_delete_node(&self, node: *mut DeleteNode) {
        let backoff = Backoff::new();
        let mut head = self.delete_head.load(Ordering::Acquire);
        loop {
            // The node is invisible until the CAS below publishes it.
            unsafe { (*node).next = head };
            match self.delete_head.compare_exchange_weak(
                head,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => {
                    head = observed;
                    backoff.spin();
                }
            }
        }
    }

    /// Drains the deferred-delete list and frees every entry no hazard slot
    /// protects. Survivors go back on the shared list. Concurrent calls are
    /// safe: each drains a private batch, and at worst a node protected at
    /// snapshot time is re-queued.
    pub fn collect(&self) {
        let mut local = self.delete_head.swap(ptr::null_mut(), Ordering::AcqRel);
        if local.is_null() {
            return;
        }

        let snapshot = HazardSnapshot::new(self);
        let mut freed = 0usize;
        let mut kept = 0usize;

        let mut pprev: *mut *mut DeleteNode = &mut local;
        unsafe {
            while !(*pprev).is_null() {
                let cur = *pprev;
                if snapshot.contains((*cur).retired.ptr) {
                    pprev = &mut (*cur).next;
                    kept += 1;
                } else {
                    *pprev = (*cur).next;
                    let DeleteNode { retired, .. } = *Box::from_raw(cur);
                    retired.reclaim();
                    freed += 1;
                }
            }
        }

        log::trace!("hazard collect freed {freed} retired pointers, kept {kept}");

        while !local.is_null() {
            let next = unsafe { (*local).next };
            self.push_delete_node(local);
            local = next;
        }
    }

    pub(crate) fn pools_head(&self) -> *mut HazPtrChunk {
        self.pools_head.load(Ordering::Acquire)
    }
}

#[cfg(test)]
impl HazardDomain {
    pub(crate) fn chunk_count(&self) -> usize {
        let mut count = 0;
        let mut p = self.pools_head();
        while let Some(chunk) = unsafe { p.as_ref() } {
            count += 1;
            p = chunk.next_ptr();
        }
        count
    }

    pub(crate) fn has_reservations(&self) -> bool {
        let mut p = self.pools_head();
        while let Some(chunk) = unsafe { p.as_ref() } {
            if chunk.has_reservations() {
                return true;
            }
            p = chunk.next_ptr();
        }
        false
    }

    pub(crate) fn pending_deletes(&self) -> usize {
        let mut count = 0;
        let mut p = self.delete_head.load(Ordering::Acquire);
        while !p.is_null() {
            count += 1;
            p = unsafe { (*p).next };
        }
        count
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        // Contexts borrow the domain, so none are alive here and no hazard
        // slot can be set: one collect reclaims everything still queued.
        self.collect();
        debug_assert!(self.delete_head.load(Ordering::Relaxed).is_null());

        let mut p = self.pools_head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !p.is_null() {
            let chunk = unsafe { Box::from_raw(p) };
            debug_assert!(!chunk.has_reservations());
            p = chunk.next_ptr();
        }
    }
}
