use std::sync::atomic::{fence, Ordering};

use super::domain::HazardDomain;

/// AND-ing a captured hazard word with this clears the low tag bit, so a
/// pointer stored with a deletion mark still protects the clean address.
pub(crate) const MASKOFF: usize = !0b1;

/// A one-shot copy of every hazard-slot value in a domain at a moment in
/// time, sorted and mark-stripped for binary search.
pub struct HazardSnapshot {
    values: Vec<usize>,
    /// Index of the first non-null value; everything before it is zero.
    live_from: usize,
}

impl HazardSnapshot {
    pub fn new(domain: &HazardDomain) -> Self {
        // Capture the pool head once. Chunks appended afterwards are ignored
        // safely: a slot that did not exist when a pointer was unlinked can
        // never come to protect it, since unlinked pointers are unreachable.
        let head = domain.pools_head();

        // Owners publish slot values with release stores followed by a
        // SeqCst fence; pairing with this fence lets the copies below use
        // relaxed loads.
        fence(Ordering::SeqCst);

        let mut size = 0;
        let mut p = head;
        while let Some(chunk) = unsafe { p.as_ref() } {
            size += chunk.hp_count();
            p = chunk.next_ptr();
        }

        let mut values = Vec::with_capacity(size);
        let mut p = head;
        while let Some(chunk) = unsafe { p.as_ref() } {
            chunk.copy_hazard_pointers(&mut values);
            p = chunk.next_ptr();
        }
        debug_assert_eq!(values.len(), size);

        for value in values.iter_mut() {
            *value &= MASKOFF;
        }
        values.sort_unstable();
        let live_from = values.partition_point(|&v| v == 0);

        Self { values, live_from }
    }

    /// Whether `ptr` was protected by some hazard slot when the snapshot
    /// was taken. Both the stored values and the probe are mark-stripped.
    pub fn contains<T>(&self, ptr: *const T) -> bool {
        let word = ptr as usize & MASKOFF;
        self.values[self.live_from..].binary_search(&word).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn empty_domain_protects_nothing() {
        let domain = HazardDomain::new();
        let snapshot = HazardSnapshot::new(&domain);
        assert!(!snapshot.contains(&domain as *const _));
    }

    #[test]
    fn observes_published_slots() {
        let domain = HazardDomain::new();
        let block = domain.reserve(2);

        let a = Box::into_raw(Box::new(1u64));
        let b = Box::into_raw(Box::new(2u64));
        unsafe {
            (*block).store(a as usize, Ordering::Release);
            (*block.add(1)).store(b as usize, Ordering::Release);
        }

        let snapshot = HazardSnapshot::new(&domain);
        assert!(snapshot.contains(a));
        assert!(snapshot.contains(b));
        assert!(!snapshot.contains(&domain as *const _));
        assert!(!snapshot.contains(ptr::null::<u64>()));

        unsafe {
            (*block).store(0, Ordering::Release);
            (*block.add(1)).store(0, Ordering::Release);
        }
        let snapshot = HazardSnapshot::new(&domain);
        assert!(!snapshot.contains(a));
        assert!(!snapshot.contains(b));

        domain.release(block);
        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn strips_mark_bits() {
        let domain = HazardDomain::new();
        let block = domain.reserve(1);

        let p = Box::into_raw(Box::new(7u64));
        unsafe { (*block).store(p as usize | 0b1, Ordering::Release) };

        let snapshot = HazardSnapshot::new(&domain);
        assert!(snapshot.contains(p));

        domain.release(block);
        unsafe { drop(Box::from_raw(p)) };
    }
}
