use std::{
    marker::PhantomData,
    sync::atomic::{fence, AtomicUsize, Ordering},
};

use super::domain::{HazardDomain, Retired};
use super::snapshot::HazardSnapshot;

/// A thread's handle onto a [`HazardDomain`]: one reserved block of `S`
/// hazard slots plus a private buffer of up to `R` retired pointers.
///
/// A context belongs to exactly one thread for its lifetime. The slots may
/// be read by anyone, but only the owner writes them; the retire buffer is
/// touched by the owner alone. Dropping the context releases the slot block
/// back to the domain, hands any still-buffered pointers to the domain's
/// delete list, and runs one collect.
pub struct HazardContext<'d, const S: usize, const R: usize> {
    domain: &'d HazardDomain,
    /// First slot of the reserved sub-block; `S` consecutive slots.
    block: *const AtomicUsize,
    /// Retired pointers, compacted left; `[0, del_index)` are live.
    deleted: [Option<Retired>; R],
    del_index: usize,
}

impl<'d, const S: usize, const R: usize> HazardContext<'d, S, R> {
    pub fn new(domain: &'d HazardDomain) -> Self {
        assert!(S > 0);
        assert!(R > 0);

        Self {
            domain,
            block: domain.reserve(S),
            deleted: std::array::from_fn(|_| None),
            del_index: 0,
        }
    }

    pub fn domain(&self) -> &'d HazardDomain {
        self.domain
    }

    fn slot(&self, index: usize) -> &AtomicUsize {
        assert!(index < S);
        // SAFETY: the block holds `S` slots and the chunk owning them lives
        // as long as the domain, which outlives `self`.
        unsafe { &*self.block.add(index) }
    }

    /// Publishes `ptr` in hazard slot `index`.
    ///
    /// The release store plus trailing fence make the slot globally visible
    /// before any later load by this thread, so the publish-then-revalidate
    /// pattern is sound: once the source link is re-read and still yields
    /// `ptr`, the pointee cannot be reclaimed until the slot changes.
    pub fn protect<T>(&self, index: usize, ptr: *const T) {
        self.slot(index).store(ptr as usize, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    /// The word currently published in slot `index`.
    pub fn at(&self, index: usize) -> usize {
        self.slot(index).load(Ordering::Relaxed)
    }

    pub fn clear(&self, index: usize) {
        self.slot(index).store(0, Ordering::Release);
    }

    /// A borrowed handle over slot `index` that clears the slot when
    /// dropped.
    pub fn hazard<T>(&self, index: usize) -> HazardPointer<'_, T> {
        HazardPointer {
            slot: self.slot(index),
            _marker: PhantomData,
        }
    }

    /// Buffers `ptr` for reclamation; when the buffer fills, runs
    /// [`reclaim`](Self::reclaim).
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `Box::into_raw`, must already be
    /// unreachable for new readers, and must not be retired again.
    pub unsafe fn retire<T: Send>(&mut self, ptr: *mut T) {
        debug_assert!(self.del_index < R);
        self.deleted[self.del_index] = Some(Retired::new(ptr));
        self.del_index += 1;

        if self.del_index == R {
            self.reclaim();
        }
    }

    /// Frees every buffered pointer the current snapshot does not protect.
    /// If nothing at all was freeable, the whole batch escalates to the
    /// domain's delete list instead.
    pub fn reclaim(&mut self) {
        let snapshot = HazardSnapshot::new(self.domain);

        for entry in self.deleted.iter_mut() {
            let protected = entry.as_ref().map_or(true, |r| snapshot.contains(r.ptr));
            if protected {
                continue;
            }
            if let Some(retired) = entry.take() {
                // SAFETY: ownership was transferred at `retire` and the
                // snapshot shows no slot holding this address.
                unsafe { retired.reclaim() };
                self.del_index -= 1;
            }
        }

        if self.del_index == R {
            self.escalate();
        } else {
            self.compact();
        }
    }

    fn escalate(&mut self) {
        for entry in self.deleted.iter_mut() {
            if let Some(retired) = entry.take() {
                self.domain.enqueue(retired);
            }
        }
        self.del_index = 0;
    }

    /// Moves live entries left so they occupy `[0, del_index)`, with a
    /// two-pointer in-place swap.
    fn compact(&mut self) {
        let (mut dst, mut src) = (0, R - 1);
        while dst < src {
            while dst < src && self.deleted[dst].is_some() {
                dst += 1;
            }
            while dst < src && self.deleted[src].is_none() {
                src -= 1;
            }
            if dst < src {
                self.deleted.swap(dst, src);
                dst += 1;
                src -= 1;
            }
        }
        debug_assert!(self.deleted[..self.del_index].iter().all(Option::is_some));
    }
}

#[cfg(test)]
impl<const S: usize, const R: usize> HazardContext<'_, S, R> {
    pub(crate) fn buffered(&self) -> usize {
        self.del_index
    }
}

impl<const S: usize, const R: usize> Drop for HazardContext<'_, S, R> {
    fn drop(&mut self) {
        // Release first: it zeroes our slots, so our own residual hazards
        // cannot pin the batch we are about to hand over.
        self.domain.release(self.block);
        self.escalate();
        self.domain.collect();
    }
}

/// A view of one hazard slot, bound to the context that owns the block. It
/// never lives on the heap and clears its slot when dropped.
pub struct HazardPointer<'c, T> {
    slot: &'c AtomicUsize,
    _marker: PhantomData<*mut T>,
}

impl<T> HazardPointer<'_, T> {
    pub fn protect(&self, ptr: *const T) {
        self.slot.store(ptr as usize, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    pub fn get(&self) -> *mut T {
        self.slot.load(Ordering::Relaxed) as *mut T
    }

    pub fn clear(&self) {
        self.slot.store(0, Ordering::Release);
    }
}

impl<T> Drop for HazardPointer<'_, T> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::DropLedger;

    #[test]
    fn protect_and_clear_slots() {
        let domain = HazardDomain::new();
        let ctx = HazardContext::<'_, 3, 4>::new(&domain);

        let p = Box::into_raw(Box::new(42u32));
        ctx.protect(1, p);
        assert_eq!(ctx.at(1), p as usize);
        assert_eq!(ctx.at(0), 0);

        ctx.clear(1);
        assert_eq!(ctx.at(1), 0);

        unsafe { drop(Box::from_raw(p)) };
    }

    #[test]
    fn handle_clears_slot_on_drop() {
        let domain = HazardDomain::new();
        let ctx = HazardContext::<'_, 1, 4>::new(&domain);

        let p = Box::into_raw(Box::new(7u32));
        {
            let hp = ctx.hazard::<u32>(0);
            hp.protect(p);
            assert_eq!(hp.get(), p);
            assert_eq!(ctx.at(0), p as usize);
        }
        assert_eq!(ctx.at(0), 0);

        unsafe { drop(Box::from_raw(p)) };
    }

    #[test]
    fn unprotected_retires_free_on_overflow() {
        let domain = HazardDomain::new();
        let mut ctx = HazardContext::<'_, 1, 4>::new(&domain);
        let ledger = DropLedger::new();

        for _ in 0..3 {
            unsafe { ctx.retire(Box::into_raw(Box::new(ledger.token()))) };
        }
        // Below capacity nothing is reclaimed yet.
        assert_eq!(ledger.drops(), 0);
        assert_eq!(ctx.buffered(), 3);

        unsafe { ctx.retire(Box::into_raw(Box::new(ledger.token()))) };
        assert_eq!(ledger.drops(), 4);
        assert_eq!(ctx.buffered(), 0);
    }

    #[test]
    fn fully_protected_batch_escalates_exactly_once() {
        let domain = HazardDomain::new();
        let mut ctx = HazardContext::<'_, 4, 4>::new(&domain);
        let ledger = DropLedger::new();

        let ptrs: Vec<_> = (0..4)
            .map(|_| Box::into_raw(Box::new(ledger.token())))
            .collect();
        for (i, p) in ptrs.iter().enumerate() {
            ctx.protect(i, *p);
        }
        for p in &ptrs {
            unsafe { ctx.retire(*p) };
        }

        // The overflow reclaim found every entry protected and handed the
        // whole batch to the domain.
        assert_eq!(ledger.drops(), 0);
        assert_eq!(ctx.buffered(), 0);
        assert_eq!(domain.pending_deletes(), 4);

        for i in 0..4 {
            ctx.clear(i);
        }
        domain.collect();
        assert_eq!(ledger.drops(), 4);
        assert_eq!(domain.pending_deletes(), 0);
    }

    #[test]
    fn partial_reclaim_compacts_survivors() {
        let domain = HazardDomain::new();
        let mut ctx = HazardContext::<'_, 4, 4>::new(&domain);
        let ledger = DropLedger::new();

        let ptrs: Vec<_> = (0..4)
            .map(|_| Box::into_raw(Box::new(ledger.token())))
            .collect();
        // Pin the first and third only.
        ctx.protect(0, ptrs[0]);
        ctx.protect(1, ptrs[2]);
        for p in &ptrs {
            unsafe { ctx.retire(*p) };
        }

        assert_eq!(ledger.drops(), 2);
        assert_eq!(ctx.buffered(), 2);

        ctx.clear(0);
        ctx.clear(1);
        drop(ctx);
        assert_eq!(ledger.drops(), 4);
    }

    #[test]
    fn drop_escalates_and_collects() {
        let domain = HazardDomain::new();
        let ledger = DropLedger::new();
        {
            let mut ctx = HazardContext::<'_, 2, 8>::new(&domain);
            unsafe { ctx.retire(Box::into_raw(Box::new(ledger.token()))) };
            assert_eq!(ledger.drops(), 0);
        }
        assert_eq!(ledger.drops(), 1);
        assert_eq!(domain.pending_deletes(), 0);
    }

    #[test]
    fn context_churn_reuses_the_pool() {
        let domain = HazardDomain::new();

        for _ in 0..200 {
            let ctx = HazardContext::<'_, 4, 8>::new(&domain);
            assert!(domain.has_reservations());
            drop(ctx);
            assert!(!domain.has_reservations());
            assert_eq!(domain.chunk_count(), 1);
        }
    }
}
