//! Fragment headers.
//!
//! Every allocation, free or live, is prefixed by a [`FragHeader`]. Fragments
//! tile the arena back to back: the next header starts right after this
//! fragment's payload.
//!
//! ```text
//! ┌──────────────┬───────────────────────┬──────────────┬─────────
//! │ FragHeader   │ payload (size bytes)  │ FragHeader   │ ...
//! └──────────────┴───────────────────────┴──────────────┴─────────
//! ```
//!
//! While free, a fragment is linked into exactly one bucket slot and records
//! that slot's index, so it can be detached in O(1) without walking the list.

use crate::region::{FragOffset, SharedRegion};
use crate::size_class::ALIGN;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Slot index meaning "not in any free list".
pub(crate) const NO_SLOT: u32 = u32::MAX;

const FLAG_FREE: u32 = 1;

#[repr(C)]
pub(crate) struct FragHeader {
    size: AtomicUsize,
    next_free: AtomicUsize,
    prev_free: AtomicUsize,
    slot: AtomicU32,
    flags: AtomicU32,
    site: AtomicU64,
    tag: AtomicU64,
}

/// Bytes of header in front of every payload.
pub const FRAG_OVERHEAD: usize = core::mem::size_of::<FragHeader>();

const _: () = assert!(FRAG_OVERHEAD % ALIGN == 0);
const _: () = assert!(core::mem::align_of::<FragHeader>() <= ALIGN);

impl FragHeader {
    /// Writes a fresh, detached, in-use header of `size` at `off`.
    ///
    /// # Safety
    /// `off..off + FRAG_OVERHEAD` must be inside the region and owned by the
    /// caller (part of a fragment it has detached or is initializing).
    pub(crate) unsafe fn write_at(region: &SharedRegion, off: FragOffset, size: usize) -> &FragHeader {
        let ptr = region.ptr_at(off.get()) as *mut FragHeader;
        ptr.write(FragHeader {
            size: AtomicUsize::new(size),
            next_free: AtomicUsize::new(0),
            prev_free: AtomicUsize::new(0),
            slot: AtomicU32::new(NO_SLOT),
            flags: AtomicU32::new(0),
            site: AtomicU64::new(0),
            tag: AtomicU64::new(0),
        });
        &*ptr
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_size(&self, size: usize) {
        debug_assert_eq!(size % ALIGN, 0);
        self.size.store(size, Ordering::Relaxed);
    }

    /// Slot currently holding this fragment.
    #[inline]
    pub(crate) fn slot(&self) -> Option<u32> {
        match self.slot.load(Ordering::Acquire) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    #[inline]
    pub(crate) fn set_slot(&self, slot: u32) {
        self.slot.store(slot, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_slot(&self) {
        self.slot.store(NO_SLOT, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_FREE != 0
    }

    #[inline]
    pub(crate) fn mark_free(&self) {
        self.flags.fetch_or(FLAG_FREE, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn mark_used(&self) {
        self.flags.fetch_and(!FLAG_FREE, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn next_free(&self) -> FragOffset {
        FragOffset::new(self.next_free.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_next_free(&self, off: FragOffset) {
        self.next_free.store(off.get(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn prev_free(&self) -> FragOffset {
        FragOffset::new(self.prev_free.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_prev_free(&self, off: FragOffset) {
        self.prev_free.store(off.get(), Ordering::Relaxed);
    }

    /// Allocation call-site hash (debug arenas only, zero otherwise).
    #[inline]
    pub(crate) fn site(&self) -> u64 {
        self.site.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_site(&self, site: u64) {
        self.site.store(site, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn tag(&self) -> u64 {
        self.tag.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_tag(&self, tag: u64) {
        self.tag.store(tag, Ordering::Relaxed);
    }

    /// Offset of the physically following fragment.
    #[inline]
    pub(crate) fn next_phys(&self, off: FragOffset) -> FragOffset {
        off.add(FRAG_OVERHEAD + self.size())
    }
}
