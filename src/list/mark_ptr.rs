use std::sync::atomic::Ordering;

use tagptr::{AtomicTagPtr, TagPtr};

/// An atomic pointer cell whose lowest bit is a deletion mark.
///
/// The pointee type must be at least 2-aligned so the mark bit is free.
/// Loads are acquire, stores release, and the compare-and-swap covers the
/// whole `(pointer, mark)` word in one shot, which is what lets a marked
/// link refuse any further CAS that expected it unmarked.
pub(crate) struct MarkPtr<T> {
    inner: AtomicTagPtr<T, 1>,
}

// Like `AtomicPtr`, the cell itself carries no ownership of `T`; it is a
// word that any thread may load or CAS.
unsafe impl<T> Send for MarkPtr<T> {}
unsafe impl<T> Sync for MarkPtr<T> {}

impl<T> MarkPtr<T> {
    pub(crate) fn null() -> Self {
        Self {
            inner: AtomicTagPtr::null(),
        }
    }

    /// The full word: `(pointer, mark)`.
    pub(crate) fn load(&self) -> (*mut T, bool) {
        let (ptr, tag) = self.inner.load(Ordering::Acquire).decompose();
        (ptr, tag != 0)
    }

    /// The pointer with the mark cleared.
    pub(crate) fn ptr(&self) -> *mut T {
        self.load().0
    }

    #[cfg(test)]
    pub(crate) fn is_marked(&self) -> bool {
        self.load().1
    }

    /// Unmarked store; used to stage a node's link before it is published.
    pub(crate) fn store(&self, ptr: *mut T) {
        self.inner.store(TagPtr::compose(ptr, 0), Ordering::Release);
    }

    /// One CAS over the whole `(pointer, mark)` word.
    pub(crate) fn cas(&self, expected: (*mut T, bool), new: (*mut T, bool)) -> bool {
        self.inner
            .compare_exchange(
                TagPtr::compose(expected.0, expected.1 as usize),
                TagPtr::compose(new.0, new.1 as usize),
                (Ordering::AcqRel, Ordering::Acquire),
            )
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;

    #[test]
    fn starts_null_and_unmarked() {
        let cell = MarkPtr::<u64>::null();
        assert_eq!(cell.load(), (ptr::null_mut(), false));
        assert!(!cell.is_marked());
    }

    #[test]
    fn store_and_load_round_trip() {
        let cell = MarkPtr::null();
        let p = Box::into_raw(Box::new(5u64));

        cell.store(p);
        assert_eq!(cell.load(), (p, false));
        assert_eq!(cell.ptr(), p);

        unsafe { drop(Box::from_raw(p)) };
    }

    #[test]
    fn cas_covers_pointer_and_mark() {
        let cell = MarkPtr::null();
        let a = Box::into_raw(Box::new(1u64));
        let b = Box::into_raw(Box::new(2u64));

        assert!(cell.cas((ptr::null_mut(), false), (a, false)));

        // Marking keeps the pointer but flips the tag.
        assert!(cell.cas((a, false), (a, true)));
        assert!(cell.is_marked());
        assert_eq!(cell.ptr(), a);

        // A CAS that expected the word unmarked must fail now.
        assert!(!cell.cas((a, false), (b, false)));

        assert!(cell.cas((a, true), (b, false)));
        assert_eq!(cell.load(), (b, false));

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }
}
