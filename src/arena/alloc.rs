//! Allocation, splitting and the attach/detach primitives shared with free
//! and warm-up.

use super::Arena;
use crate::accounting::Accounting;
use crate::error::{ArenaError, Result};
use crate::fragment::{FragHeader, FRAG_OVERHEAD};
use crate::region::FragOffset;
use crate::size_class::{can_split, hash, request_size, HASH_SIZE, LINEAR_HASH_SIZE, OPTIMIZE};
use core::ptr::NonNull;
use std::panic::Location;
use std::sync::atomic::Ordering;
use tracing::debug;

impl<A: Accounting> Arena<A> {
    /// Allocates at least `size` bytes, aligned to [`crate::ALIGN`].
    ///
    /// Searches the request's bucket first, then every larger bucket. For
    /// optimized classes the secondary slots are tried before the primary
    /// one. Returns [`ArenaError::NoSpace`] when nothing fits.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let site = if self.is_debug() { self.sites.record(Location::caller()) } else { 0 };
        self.allocate_at(size, site)
    }

    /// Allocation that is not attributed to a call site.
    pub(crate) fn allocate_untracked(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_at(size, 0)
    }

    fn allocate_at(&self, size: usize, site: u64) -> Result<NonNull<u8>> {
        let rounded = match request_size(size) {
            Some(rounded) if rounded <= self.size() => rounded,
            _ => {
                debug!(arena = %self.name(), requested = size, "request exceeds arena size");
                return Err(ArenaError::NoSpace { requested: size, bucket: HASH_SIZE });
            }
        };
        let class = hash(rounded);
        if class < LINEAR_HASH_SIZE && self.records_usage() {
            self.usage_counter(class).fetch_add(1, Ordering::Relaxed);
        }

        let Some(off) = self.find_and_detach(class, rounded) else {
            debug!(arena = %self.name(), requested = size, bucket = class, "arena exhausted");
            return Err(ArenaError::NoSpace { requested: size, bucket: class });
        };
        let table = self.table();
        let frag = table.frag(off);
        A::on_detach(&self.view(), frag.size());
        self.split(off, rounded);
        A::on_allocated(&self.view());

        frag.set_site(site);
        frag.set_tag(0);
        let size = frag.size();
        if size > OPTIMIZE {
            self.header().large_space.fetch_add(size, Ordering::Relaxed);
        }
        Ok(self.payload(off))
    }

    /// Detaches the first fitting fragment from `class` or any larger bucket.
    fn find_and_detach(&self, class: usize, size: usize) -> Option<FragOffset> {
        let table = self.table();
        for bucket in class..HASH_SIZE {
            for slot in table.candidate_slots(bucket) {
                // Unlocked peek; an empty slot is not worth the lock.
                if table.bucket(slot).free_frags() == 0 {
                    continue;
                }
                let _guard = table.lock(slot);
                // Safety: slot lock held.
                if let Some(off) = unsafe { table.take_fit_locked(slot, size) } {
                    return Some(off);
                }
            }
        }
        None
    }

    /// Shrinks a detached fragment to `wanted` and returns the tail to the
    /// free pool, if the tail can stand on its own.
    pub(crate) fn split(&self, off: FragOffset, wanted: usize) {
        let table = self.table();
        let frag = table.frag(off);
        let size = frag.size();
        if !can_split(size, wanted) {
            return;
        }
        frag.set_size(wanted);
        let rest = off.add(FRAG_OVERHEAD + wanted);
        // Safety: the tail lies inside the detached fragment we own.
        unsafe { FragHeader::write_at(&self.region, rest, size - wanted - FRAG_OVERHEAD) };
        A::on_split(&self.view());
        self.attach_free(rest);
    }

    /// Links an owned, detached fragment into the slot for its size.
    pub(crate) fn attach_free(&self, off: FragOffset) {
        let table = self.table();
        let size = table.frag(off).size();
        let slot = table.select_slot(size);
        {
            let _guard = table.lock(slot);
            // Safety: slot lock held; the caller owns the fragment.
            unsafe { table.attach_locked(slot, off) };
        }
        A::on_attach(&self.view(), size);
    }

    /// Detaches a specific free fragment. Returns `false` if it was taken
    /// by someone else first.
    pub(crate) fn take_free(&self, off: FragOffset) -> bool {
        let table = self.table();
        let frag = table.frag(off);
        let Some(slot) = frag.slot() else { return false };
        {
            let _guard = table.lock(slot);
            if frag.slot() != Some(slot) {
                return false;
            }
            // Safety: slot lock held and the fragment is linked in it.
            unsafe { table.detach_locked(slot, off) };
        }
        A::on_detach(&self.view(), frag.size());
        true
    }
}
