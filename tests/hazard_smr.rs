use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Barrier,
};
use std::thread;

use sohash::hazard::{HazardContext, HazardDomain, HazardSnapshot};

#[derive(Debug)]
struct DropToken(Arc<AtomicUsize>);

impl Drop for DropToken {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

fn token(drops: &Arc<AtomicUsize>) -> *mut DropToken {
    Box::into_raw(Box::new(DropToken(Arc::clone(drops))))
}

#[test]
fn free_is_deferred_until_unpinned() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain = HazardDomain::new();

    let pinner = HazardContext::<'_, 3, 8>::new(&domain);
    let mut remover = HazardContext::<'_, 3, 8>::new(&domain);

    let ptr = token(&drops);
    pinner.protect(0, ptr);
    unsafe { remover.retire(ptr) };
    remover.reclaim();
    domain.collect();
    assert_eq!(drops.load(Ordering::Relaxed), 0, "pinned pointer survives");

    let snapshot = HazardSnapshot::new(&domain);
    assert!(snapshot.contains(ptr));

    pinner.clear(0);
    drop(remover);
    domain.collect();
    assert_eq!(drops.load(Ordering::Relaxed), 1, "freed exactly once");
}

#[test]
fn handle_view_pins_like_a_raw_slot() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain = HazardDomain::new();

    let ctx = HazardContext::<'_, 1, 4>::new(&domain);
    let ptr = token(&drops);

    {
        let hp = ctx.hazard::<DropToken>(0);
        hp.protect(ptr);
        unsafe { domain.retire(ptr) };
        domain.collect();
        assert_eq!(drops.load(Ordering::Relaxed), 0);
    }

    // Dropping the handle cleared the slot.
    domain.collect();
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

#[test]
fn collect_without_retires_is_a_no_op() {
    let domain = HazardDomain::new();
    for _ in 0..4 {
        domain.collect();
    }
}

#[test]
fn contexts_from_many_threads_share_one_domain() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;

    let drops = Arc::new(AtomicUsize::new(0));
    let domain = HazardDomain::new();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for _ in 0..THREADS {
            let domain = &domain;
            let barrier = &barrier;
            let drops = Arc::clone(&drops);
            s.spawn(move || {
                barrier.wait();
                let mut ctx = HazardContext::<'_, 4, 16>::new(domain);
                for _ in 0..PER_THREAD {
                    let ptr = Box::into_raw(Box::new(DropToken(Arc::clone(&drops))));
                    unsafe { ctx.retire(ptr) };
                }
            });
        }
    });

    drop(domain);
    assert_eq!(drops.load(Ordering::Relaxed), THREADS * PER_THREAD);
}
