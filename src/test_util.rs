use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Hands out [`DropToken`]s and counts how many of them have been dropped,
/// for free-exactly-once assertions.
#[derive(Debug, Clone)]
pub(crate) struct DropLedger {
    drops: Arc<AtomicUsize>,
}

impl DropLedger {
    pub(crate) fn new() -> Self {
        Self {
            drops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn token(&self) -> DropToken {
        DropToken {
            drops: Arc::clone(&self.drops),
        }
    }

    pub(crate) fn drops(&self) -> usize {
        self.drops.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub(crate) struct DropToken {
    drops: Arc<AtomicUsize>,
}

impl Drop for DropToken {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}
