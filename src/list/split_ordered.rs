use std::{
    marker::PhantomData,
    ops::Deref,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::hazard::{HazardContext, HazardDomain, HazardPointer};

use super::mark_ptr::MarkPtr;

/// Low key bit: set on data nodes, clear on bucket dummies.
const DATA_BIT: u64 = 0b1;

/// Hazard-slot layout of an [`Accessor`]'s context. The first three rotate
/// with the cursor; the table slot is fixed.
const HP_TABLE: usize = 3;
const HP_SLOTS: usize = 4;
const RETIRE_CAP: usize = 32;

const DEFAULT_MAX_BUCKET_LENGTH: u32 = 4;

/// Split-order key of a data node. The reversed hash is widened before the
/// tag goes in, so no hash bit is sacrificed to it.
fn node_key(hashv: u32) -> u64 {
    ((hashv.reverse_bits() as u64) << 1) | DATA_BIT
}

/// Split-order key of the dummy for bucket `slot`.
fn bucket_key(slot: usize) -> u64 {
    ((slot as u32).reverse_bits() as u64) << 1
}

pub(crate) enum NodeKind<T> {
    /// Marks a bucket's start in the list; never removed.
    Dummy,
    Data(T),
}

pub(crate) struct Node<T> {
    hashv: u32,
    key: u64,
    next: MarkPtr<Node<T>>,
    kind: NodeKind<T>,
}

impl<T> Node<T> {
    fn dummy(slot: usize) -> Box<Self> {
        Box::new(Self {
            hashv: slot as u32,
            key: bucket_key(slot),
            next: MarkPtr::null(),
            kind: NodeKind::Dummy,
        })
    }

    fn data(hashv: u32, value: T) -> Box<Self> {
        Box::new(Self {
            hashv,
            key: node_key(hashv),
            next: MarkPtr::null(),
            kind: NodeKind::Data(value),
        })
    }

    fn is_data(&self) -> bool {
        self.key & DATA_BIT != 0
    }

    fn value(&self) -> &T {
        match &self.kind {
            NodeKind::Data(value) => value,
            NodeKind::Dummy => unreachable!("data key on a dummy node"),
        }
    }
}

/// The bucket array and its size, published together behind one atomic
/// pointer so they can never be observed torn.
struct BucketTable<T> {
    buckets: Box<[AtomicPtr<Node<T>>]>,
}

impl<T> BucketTable<T> {
    fn with_len(len: usize) -> Self {
        assert!(len.is_power_of_two());

        let mut buckets = Vec::with_capacity(len);
        buckets.resize_with(len, || AtomicPtr::new(ptr::null_mut()));

        Self {
            buckets: buckets.into_boxed_slice(),
        }
    }

    fn len(&self) -> usize {
        self.buckets.len()
    }

    fn slot_of(&self, hashv: u32) -> usize {
        hashv as usize & (self.buckets.len() - 1)
    }

    fn bucket(&self, slot: usize) -> *mut Node<T> {
        self.buckets[slot].load(Ordering::Acquire)
    }

    /// Publishes a bucket's dummy. The slot is write-once and every racing
    /// publisher carries the same list node, so a lost CAS needs no
    /// recovery.
    fn publish(&self, slot: usize, dummy: *mut Node<T>) {
        let _ = self.buckets[slot].compare_exchange(
            ptr::null_mut(),
            dummy,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// A table of twice the size, with the current entries carried over and
    /// the new half zeroed. A bucket published into `self` after the copy
    /// is re-derived from the list on first use in the new table.
    fn doubled(&self) -> Self {
        let grown = Self::with_len(self.len() * 2);
        for (i, bucket) in self.buckets.iter().enumerate() {
            grown.buckets[i].store(bucket.load(Ordering::Acquire), Ordering::Relaxed);
        }
        grown
    }
}

/// A lock-free hash map keyed by 32-bit hash, backed by one split-ordered
/// linked list. All access goes through a per-thread [`Accessor`].
pub struct SplitOrderedList<T> {
    table: AtomicPtr<BucketTable<T>>,
    max_bucket_length: u32,
    n_items: AtomicUsize,
    domain: HazardDomain,
    marker: PhantomData<Box<Node<T>>>,
}

// Values move between threads when a removal on one thread is reclaimed on
// another, hence `T: Send` even for shared access.
unsafe impl<T: Send> Send for SplitOrderedList<T> {}
unsafe impl<T: Send + Sync> Sync for SplitOrderedList<T> {}

impl<T> SplitOrderedList<T> {
    /// A list with `size` initial buckets. `size` must be a nonzero power
    /// of two.
    pub fn new(size: usize) -> Self {
        Self::with_bucket_length(size, DEFAULT_MAX_BUCKET_LENGTH)
    }

    /// A list with `size` initial buckets that splits any bucket whose run
    /// grows past `max_bucket_length`.
    pub fn with_bucket_length(size: usize, max_bucket_length: u32) -> Self {
        assert!(size.is_power_of_two());
        assert!(max_bucket_length > 0);

        let table = BucketTable::with_len(size);
        // Bucket 0's dummy is the list head; every walk can reach it
        // without lazy initialization.
        table.buckets[0].store(Box::into_raw(Node::dummy(0)), Ordering::Relaxed);

        Self {
            table: AtomicPtr::new(Box::into_raw(Box::new(table))),
            max_bucket_length,
            n_items: AtomicUsize::new(0),
            domain: HazardDomain::new(),
            marker: PhantomData,
        }
    }

    /// The number of data nodes in the list.
    pub fn len(&self) -> usize {
        self.n_items.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This list's hazard domain. One domain is bound to one list; every
    /// retired node and outgrown bucket table goes through it.
    pub fn hazard_domain(&self) -> &HazardDomain {
        &self.domain
    }

    pub fn accessor(&self) -> Accessor<'_, T> {
        Accessor {
            list: self,
            ctx: HazardContext::new(&self.domain),
            prev: ptr::null_mut(),
            cur: ptr::null_mut(),
            next: ptr::null_mut(),
            hp: [0, 1, 2],
            steps: 0,
        }
    }
}

impl<T> Drop for SplitOrderedList<T> {
    fn drop(&mut self) {
        let table = unsafe { Box::from_raw(self.table.load(Ordering::Acquire)) };

        // Retired nodes are no longer reachable from the chain; the domain
        // frees them when it drops right after this.
        let mut cur = table.buckets[0].load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.ptr();
        }
    }
}

/// A per-thread cursor over a [`SplitOrderedList`].
///
/// The accessor owns a hazard context in the list's domain: three slots
/// shield the `prev`/`cur`/`next` cursor, one pins the bucket table. Every
/// pointer is published to its slot and the link that produced it is
/// re-read before the pointee is touched.
pub struct Accessor<'l, T> {
    list: &'l SplitOrderedList<T>,
    ctx: HazardContext<'l, HP_SLOTS, RETIRE_CAP>,
    prev: *mut Node<T>,
    cur: *mut Node<T>,
    next: *mut Node<T>,
    /// Current hazard-slot assignment of (prev, cur, next); rotates on
    /// advance so no re-publication is needed for pointers that only
    /// changed roles.
    hp: [usize; 3],
    steps: u32,
}

impl<'l, T: Send> Accessor<'l, T> {
    /// Inserts `value` under `hashv`. Fails with `false` when the hash is
    /// already present.
    pub fn insert(&mut self, hashv: u32, value: T) -> bool {
        let table = unsafe { &*self.protect_table() };
        let slot = table.slot_of(hashv);
        let node_ptr = Box::into_raw(Node::data(hashv, value));

        let inserted = loop {
            if self.find_node(table, hashv) {
                break false;
            }
            unsafe { (*node_ptr).next.store(self.next) };
            if unsafe { (*self.cur).next.cas((self.next, false), (node_ptr, false)) } {
                break true;
            }
        };

        if !inserted {
            drop(unsafe { Box::from_raw(node_ptr) });
            self.zap();
            return false;
        }

        self.list.n_items.fetch_add(1, Ordering::Relaxed);
        self.expansion_check(table, slot);
        self.zap();
        true
    }

    /// Removes the entry for `hashv`, if any.
    pub fn remove(&mut self, hashv: u32) -> bool {
        let table = unsafe { &*self.protect_table() };

        let removed = loop {
            if !self.find_node(table, hashv) {
                break false;
            }
            let cur = self.cur;
            let next = self.next;

            // Logical deletion. Marking is the linearization point and owns
            // the item-count decrement; helping traversals never touch it.
            if !unsafe { (*cur).next.cas((next, false), (next, true)) } {
                continue;
            }
            self.list.n_items.fetch_sub(1, Ordering::Relaxed);

            // Physical unlink. On failure the marked node is left for a
            // traversal to help out, which also takes over the retire.
            if unsafe { (*self.prev).next.cas((cur, false), (next, false)) } {
                unsafe { self.retire_node(cur) };
            }
            break true;
        };

        self.zap();
        removed
    }

    /// Looks up `hashv`, returning a guard that shields the value from
    /// reclamation for as long as it is held.
    pub fn get(&mut self, hashv: u32) -> Option<ValueGuard<'_, T>> {
        let table = unsafe { &*self.protect_table() };

        if !self.find_node(table, hashv) {
            self.zap();
            return None;
        }

        let node = self.cur;
        // Hand the `cur` slot to the guard; everything else is released.
        self.ctx.clear(self.hp[0]);
        self.ctx.clear(self.hp[2]);
        self.ctx.clear(HP_TABLE);
        let hp = self.ctx.hazard::<Node<T>>(self.hp[1]);
        self.prev = ptr::null_mut();
        self.cur = ptr::null_mut();
        self.next = ptr::null_mut();

        Some(ValueGuard {
            // SAFETY: `find_node` returned true, so `node` is the found
            // data node and is protected by the slot now held by `hp`.
            node: unsafe { NonNull::new_unchecked(node) },
            _hp: hp,
        })
    }

    pub fn contains(&mut self, hashv: u32) -> bool {
        let table = unsafe { &*self.protect_table() };
        let found = self.find_node(table, hashv);
        self.zap();
        found
    }

    /// Loads the current bucket table and pins it in the table slot.
    fn protect_table(&self) -> *mut BucketTable<T> {
        loop {
            let table = self.list.table.load(Ordering::Acquire);
            self.ctx.protect(HP_TABLE, table);
            if self.list.table.load(Ordering::Acquire) == table {
                return table;
            }
        }
    }

    /// Positions the cursor for `hashv`'s key, initializing its bucket on
    /// first touch. True if the data node is present.
    fn find_node(&mut self, table: &BucketTable<T>, hashv: u32) -> bool {
        let slot = table.slot_of(hashv);
        let head = self.bucket_head(table, slot);
        self.seek(head, node_key(hashv))
    }

    /// The dummy for `slot`, lazily inserting it if the bucket was never
    /// touched.
    fn bucket_head(&mut self, table: &BucketTable<T>, slot: usize) -> *mut Node<T> {
        let head = table.bucket(slot);
        if !head.is_null() {
            return head;
        }
        self.initialise_bucket(table, slot)
    }

    /// Inserts the dummy for `slot` into the list and publishes it in the
    /// table. The parent bucket (`slot` with its top set bit cleared) is
    /// initialized first, recursively, and bounds the walk.
    fn initialise_bucket(&mut self, table: &BucketTable<T>, slot: usize) -> *mut Node<T> {
        debug_assert!(slot > 0, "bucket 0 is created with the list");
        debug_assert!(slot < table.len());

        let parent = slot ^ (1 << (usize::BITS - 1 - slot.leading_zeros()));
        let parent_head = self.bucket_head(table, parent);

        let key = bucket_key(slot);
        let mut spare: Option<Box<Node<T>>> = None;

        loop {
            if self.seek(parent_head, key) {
                // Another thread's dummy won; adopt it. `spare` is unused
                // and dropped.
                let existing = self.cur;
                table.publish(slot, existing);
                return existing;
            }

            let node_ptr = Box::into_raw(spare.take().unwrap_or_else(|| Node::dummy(slot)));
            unsafe { (*node_ptr).next.store(self.next) };
            if unsafe { (*self.cur).next.cas((self.next, false), (node_ptr, false)) } {
                table.publish(slot, node_ptr);
                return node_ptr;
            }
            spare = Some(unsafe { Box::from_raw(node_ptr) });
        }
    }

    /// Walks from `head` until `cur` is the last node with key at most
    /// `key`, helping unlink any marked node on the way. True iff
    /// `cur.key == key`.
    ///
    /// Loop invariant: `prev` and `cur` are published to their slots and
    /// were revalidated against the link that produced them.
    fn seek(&mut self, head: *mut Node<T>, key: u64) -> bool {
        debug_assert!(!head.is_null());

        'restart: loop {
            self.steps = 0;
            self.prev = head;
            self.cur = head;
            self.ctx.protect(self.hp[0], head);
            self.ctx.protect(self.hp[1], head);

            loop {
                let (next, marked) = unsafe { (*self.cur).next.load() };

                if marked {
                    // `cur` is logically deleted; its successor is frozen
                    // once the mark is set. Unlink it in passing.
                    if !unsafe { (*self.prev).next.cas((self.cur, false), (next, false)) } {
                        continue 'restart;
                    }
                    unsafe { self.retire_node(self.cur) };
                    self.cur = self.prev;
                    self.ctx.protect(self.hp[1], self.cur);
                    continue;
                }

                if next.is_null() {
                    self.next = next;
                    break;
                }

                self.ctx.protect(self.hp[2], next);
                if unsafe { (*self.cur).next.load() } != (next, false) {
                    // The link moved under us; re-examine it.
                    continue;
                }

                if unsafe { (*next).key } <= key {
                    self.advance(next);
                    continue;
                }

                self.next = next;
                break;
            }

            return unsafe { (*self.cur).key } == key;
        }
    }

    fn advance(&mut self, next: *mut Node<T>) {
        self.prev = self.cur;
        self.cur = next;
        // prev takes cur's slot, cur takes next's; the freed slot will
        // shield the next `next`.
        self.hp.rotate_left(1);
        self.steps += 1;
    }

    /// Extends the insert's walk over the rest of the run of data nodes
    /// and, if the run outgrew `max_bucket_length`, splits the bucket or
    /// doubles the table. The run length is a heuristic; under contention
    /// the count is abandoned rather than retried.
    fn expansion_check(&mut self, table: &BucketTable<T>, slot: usize) {
        loop {
            let (next, marked) = unsafe { (*self.cur).next.load() };
            if marked || next.is_null() {
                break;
            }
            self.ctx.protect(self.hp[2], next);
            if unsafe { (*self.cur).next.load() } != (next, false) {
                break;
            }
            if !unsafe { (*next).is_data() } {
                break;
            }
            self.advance(next);
        }

        let size = table.len();
        let run = self.steps;
        if run <= self.list.max_bucket_length {
            return;
        }

        let n_items = self.list.n_items.load(Ordering::Relaxed);
        if run >= 2 * self.list.max_bucket_length
            || n_items >= self.list.max_bucket_length as usize * size
        {
            self.expand(table);
            self.init_after_growth(slot + size);
        } else if slot < size / 2 {
            // Cut the run by raising the dummy midway through this bucket's
            // range. For slots in the upper half that dummy does not exist
            // at the current size; only doubling can split them.
            self.bucket_head(table, slot + size / 2);
        }
    }

    /// Doubles the bucket table, publishing buckets and size as a single
    /// pointer swap. The outgrown table is retired through the hazard
    /// domain; concurrent readers keep it pinned until they finish.
    fn expand(&mut self, observed: &BucketTable<T>) {
        let observed_ptr = observed as *const BucketTable<T> as *mut BucketTable<T>;
        if self.list.table.load(Ordering::Acquire) != observed_ptr {
            // Someone already grew the table past what this thread saw.
            return;
        }

        let grown = Box::into_raw(Box::new(observed.doubled()));
        match self.list.table.compare_exchange(
            observed_ptr,
            grown,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                log::debug!(
                    "bucket table expanded from {} to {} buckets",
                    observed.len(),
                    observed.len() * 2
                );
                // SAFETY: the old table is unreachable from the list; our
                // own table slot still pins it for the caller.
                unsafe { self.ctx.retire(observed_ptr) };
            }
            Err(_) => drop(unsafe { Box::from_raw(grown) }),
        }
    }

    /// Eagerly initializes the bucket uncovered by a doubling, against
    /// whatever table is current by now.
    fn init_after_growth(&mut self, slot: usize) {
        let table = unsafe { &*self.protect_table() };
        if slot < table.len() {
            self.bucket_head(table, slot);
        }
    }

    /// # Safety
    ///
    /// `node` must have been unlinked from the list by this thread's CAS.
    unsafe fn retire_node(&mut self, node: *mut Node<T>) {
        self.ctx.retire(node);
    }

    /// Clears the cursor and all four hazard slots; runs at the end of
    /// every public operation.
    fn zap(&mut self) {
        self.prev = ptr::null_mut();
        self.cur = ptr::null_mut();
        self.next = ptr::null_mut();
        for index in 0..HP_SLOTS {
            self.ctx.clear(index);
        }
        self.steps = 0;
    }
}

/// Shields a value found by [`Accessor::get`] from reclamation while it is
/// borrowed. Dropping the guard releases the hazard slot.
pub struct ValueGuard<'a, T> {
    node: NonNull<Node<T>>,
    _hp: HazardPointer<'a, Node<T>>,
}

impl<T> ValueGuard<'_, T> {
    /// The hash the value was inserted under.
    pub fn hash(&self) -> u32 {
        unsafe { self.node.as_ref() }.hashv
    }
}

impl<T> Deref for ValueGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the hazard slot held by `_hp` keeps the node allocated,
        // and `get` only builds guards over data nodes.
        unsafe { self.node.as_ref() }.value()
    }
}

#[cfg(test)]
impl<T> SplitOrderedList<T> {
    fn table_ref(&self) -> &BucketTable<T> {
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    pub(crate) fn table_len(&self) -> usize {
        self.table_ref().len()
    }

    pub(crate) fn bucket_key_at(&self, slot: usize) -> Option<u64> {
        let bucket = self.table_ref().bucket(slot);
        unsafe { bucket.as_ref() }.map(|node| node.key)
    }

    /// Every key reachable from the list head. Only valid while no other
    /// thread is mutating the list.
    pub(crate) fn chain_keys(&self) -> Vec<u64> {
        let mut keys = Vec::new();
        let mut cur = self.table_ref().bucket(0);
        while let Some(node) = unsafe { cur.as_ref() } {
            keys.push(node.key);
            cur = node.next.ptr();
        }
        keys
    }

    fn raw_find(&self, hashv: u32) -> *mut Node<T> {
        let key = node_key(hashv);
        let mut cur = self.table_ref().bucket(0);
        while let Some(node) = unsafe { cur.as_ref() } {
            if node.key == key {
                return cur;
            }
            cur = node.next.ptr();
        }
        ptr::null_mut()
    }
}
