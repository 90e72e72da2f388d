//! The free-list hash table.
//!
//! The table is an array of [`Bucket`] slots living in the shared region.
//! Slots `0..HASH_SIZE` are the primary buckets. Every exact-fit class below
//! [`LINEAR_HASH_SIZE`] additionally owns `shards` secondary slots after the
//! primary ones; once a class is marked optimized, inserts rotate across its
//! secondary slots so concurrent callers of one hot size spread over several
//! locks.
//!
//! Each slot has its own lock. Structural mutation of a slot's list requires
//! holding that lock; nothing ever holds two slot locks at once.

use crate::fragment::FragHeader;
use crate::region::{FragOffset, SharedRegion};
use crate::size_class::{hash, is_exact, HASH_SIZE, LINEAR_HASH_SIZE};
use crate::sync::{RawLock, RawLockGuard};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// One free-list slot. All-zero bytes are an empty, unlocked, unoptimized slot.
#[repr(C)]
pub(crate) struct Bucket {
    lock: RawLock,
    optimized: AtomicU32,
    rr: AtomicU32,
    _reserved: AtomicU32,
    head: AtomicUsize,
    free_frags: AtomicUsize,
    free_bytes: AtomicUsize,
}

pub(crate) const BUCKET_SIZE: usize = core::mem::size_of::<Bucket>();

impl Bucket {
    #[inline]
    pub(crate) fn lock(&self) -> RawLockGuard<'_> {
        self.lock.lock()
    }

    #[inline]
    pub(crate) fn head(&self) -> FragOffset {
        FragOffset::new(self.head.load(Ordering::Relaxed))
    }

    #[inline]
    fn set_head(&self, off: FragOffset) {
        self.head.store(off.get(), Ordering::Relaxed);
    }

    /// Free fragments in this slot. Exact under the lock, a hint without it.
    #[inline]
    pub(crate) fn free_frags(&self) -> usize {
        self.free_frags.load(Ordering::Relaxed)
    }

    /// Free payload bytes in this slot. Exact under the lock.
    #[inline]
    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn is_optimized(&self) -> bool {
        self.optimized.load(Ordering::Relaxed) != 0
    }
}

/// A view of the bucket table inside a region.
#[derive(Clone, Copy)]
pub(crate) struct FreeTable<'a> {
    region: &'a SharedRegion,
    slots_offset: usize,
    shards: u32,
}

impl<'a> FreeTable<'a> {
    /// Number of slots a table with `shards` sub-lists per hot class needs.
    pub(crate) const fn slot_count(shards: u32) -> usize {
        HASH_SIZE + LINEAR_HASH_SIZE * shards as usize
    }

    pub(crate) fn new(region: &'a SharedRegion, slots_offset: usize, shards: u32) -> Self {
        debug_assert!(shards >= 1);
        Self { region, slots_offset, shards }
    }

    #[inline]
    pub(crate) fn shards(&self) -> u32 {
        self.shards
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        Self::slot_count(self.shards)
    }

    #[inline]
    pub(crate) fn bucket(&self, slot: u32) -> &'a Bucket {
        debug_assert!((slot as usize) < self.len());
        // Safety: the slot array was zero-initialized at arena creation and
        // slot is in range.
        unsafe { self.region.at(self.slots_offset + slot as usize * BUCKET_SIZE) }
    }

    #[inline]
    pub(crate) fn frag(&self, off: FragOffset) -> &'a FragHeader {
        // Safety: callers only pass offsets of fragments that tile the arena.
        unsafe { self.region.at(off.get()) }
    }

    #[inline]
    pub(crate) fn lock(&self, slot: u32) -> RawLockGuard<'a> {
        self.bucket(slot).lock()
    }

    /// Whether `slot` is a secondary slot of an optimized class.
    #[inline]
    pub(crate) fn is_shard(&self, slot: u32) -> bool {
        slot as usize >= HASH_SIZE
    }

    /// Primary bucket index the slot belongs to.
    #[inline]
    pub(crate) fn class_of(&self, slot: u32) -> usize {
        if self.is_shard(slot) {
            (slot as usize - HASH_SIZE) / self.shards as usize
        } else {
            slot as usize
        }
    }

    #[inline]
    pub(crate) fn shard_slot(&self, class: usize, shard: u32) -> u32 {
        debug_assert!(class < LINEAR_HASH_SIZE && shard < self.shards);
        (HASH_SIZE + class * self.shards as usize + shard as usize) as u32
    }

    #[inline]
    pub(crate) fn is_optimized(&self, class: usize) -> bool {
        class < LINEAR_HASH_SIZE && self.bucket(class as u32).is_optimized()
    }

    /// Marks an exact-fit class as sharded. Only valid before concurrent
    /// accessors attach.
    pub(crate) fn mark_optimized(&self, class: usize) {
        debug_assert!(class < LINEAR_HASH_SIZE);
        self.bucket(class as u32).optimized.store(1, Ordering::Relaxed);
    }

    /// Slot a free fragment of `size` should be attached to. Optimized
    /// classes rotate across their shards.
    pub(crate) fn select_slot(&self, size: usize) -> u32 {
        let class = hash(size);
        if self.is_optimized(class) {
            let rr = self.bucket(class as u32).rr.fetch_add(1, Ordering::Relaxed);
            self.shard_slot(class, rr % self.shards)
        } else {
            class as u32
        }
    }

    /// Slots that may hold fragments of primary class `class`, in search order.
    pub(crate) fn candidate_slots(&self, class: usize) -> impl Iterator<Item = u32> + 'a {
        let table = *self;
        let (shards, start) = if self.is_optimized(class) {
            (self.shards, self.bucket(class as u32).rr.load(Ordering::Relaxed))
        } else {
            (0, 0)
        };
        (0..shards)
            .map(move |i| table.shard_slot(class, (start + i) % table.shards))
            .chain(core::iter::once(class as u32))
    }

    /// Links a free fragment into `slot`. Exact-fit slots insert at the head;
    /// power-of-two slots keep ascending size order for best-fit scans.
    ///
    /// # Safety
    /// Caller holds `slot`'s lock and owns the detached fragment at `off`.
    pub(crate) unsafe fn attach_locked(&self, slot: u32, off: FragOffset) {
        let bucket = self.bucket(slot);
        let frag = self.frag(off);
        let size = frag.size();
        debug_assert!(frag.slot().is_none(), "attaching a fragment that is already linked");

        let mut prev = FragOffset::NULL;
        let mut cur = bucket.head();
        if !self.is_shard(slot) && !is_exact(slot as usize) {
            while let Some(c) = cur.non_null() {
                if size <= self.frag(c).size() {
                    break;
                }
                prev = c;
                cur = self.frag(c).next_free();
            }
        }

        frag.set_prev_free(prev);
        frag.set_next_free(cur);
        match prev.non_null() {
            Some(p) => self.frag(p).set_next_free(off),
            None => bucket.set_head(off),
        }
        if let Some(c) = cur.non_null() {
            self.frag(c).set_prev_free(off);
        }

        frag.mark_free();
        frag.set_slot(slot);
        bucket.free_frags.fetch_add(1, Ordering::Relaxed);
        bucket.free_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Unlinks a free fragment from `slot` using its stored neighbours.
    ///
    /// # Safety
    /// Caller holds `slot`'s lock and the fragment at `off` is linked in `slot`.
    pub(crate) unsafe fn detach_locked(&self, slot: u32, off: FragOffset) {
        let bucket = self.bucket(slot);
        let frag = self.frag(off);
        debug_assert_eq!(frag.slot(), Some(slot), "detaching from the wrong slot");
        debug_assert!(frag.is_free(), "detaching a fragment that is not free");

        let prev = frag.prev_free();
        let next = frag.next_free();
        match prev.non_null() {
            Some(p) => self.frag(p).set_next_free(next),
            None => bucket.set_head(next),
        }
        if let Some(n) = next.non_null() {
            self.frag(n).set_prev_free(prev);
        }

        frag.set_prev_free(FragOffset::NULL);
        frag.set_next_free(FragOffset::NULL);
        frag.clear_slot();
        frag.mark_used();
        bucket.free_frags.fetch_sub(1, Ordering::Relaxed);
        bucket.free_bytes.fetch_sub(frag.size(), Ordering::Relaxed);
    }

    /// Finds and detaches the first fragment in `slot` of at least `size`.
    ///
    /// # Safety
    /// Caller holds `slot`'s lock.
    pub(crate) unsafe fn take_fit_locked(&self, slot: u32, size: usize) -> Option<FragOffset> {
        let mut cur = self.bucket(slot).head();
        while let Some(c) = cur.non_null() {
            if self.frag(c).size() >= size {
                self.detach_locked(slot, c);
                return Some(c);
            }
            cur = self.frag(c).next_free();
        }
        None
    }

    /// Counts the entries of `slot` by walking its list under the lock.
    pub(crate) fn count(&self, slot: u32) -> usize {
        let _guard = self.lock(slot);
        let mut n = 0;
        let mut cur = self.bucket(slot).head();
        while let Some(c) = cur.non_null() {
            n += 1;
            cur = self.frag(c).next_free();
        }
        n
    }
}
