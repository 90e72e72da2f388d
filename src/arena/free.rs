//! Deallocation and forward coalescing.

use super::Arena;
use crate::accounting::Accounting;
use crate::fragment::FRAG_OVERHEAD;
use crate::region::FragOffset;
use crate::size_class::{is_exact, OPTIMIZE};
use core::ptr::NonNull;
use std::sync::atomic::Ordering;
use tracing::error;

impl<A: Accounting> Arena<A> {
    /// Returns an allocation to the arena.
    ///
    /// The fragment first absorbs the run of free physical successors that
    /// sit in power-of-two buckets, then joins the bucket for its final
    /// size. Exact-fit successors, sharded or not, are left alone: they are
    /// ready for reuse as they are, and warm-up pre-fragmentation survives.
    ///
    /// Pointers outside the arena are logged and ignored. Freeing a
    /// fragment that is already free is logged; debug arenas panic.
    ///
    /// # Safety
    /// `ptr` must come from [`Arena::allocate`] on this arena (in any
    /// process) and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let Some(off) = self.frag_of(ptr) else {
            error!(arena = %self.name(), ?ptr, "free of pointer outside arena");
            return;
        };
        let frag = self.table().frag(off);
        if frag.is_free() || frag.slot().is_some() {
            error!(arena = %self.name(), offset = %off, "double free");
            assert!(!self.is_debug(), "double free of fragment at {off}");
            return;
        }

        let size = frag.size();
        if size > OPTIMIZE {
            self.header().large_space.fetch_sub(size, Ordering::Relaxed);
        }
        frag.set_site(0);
        frag.set_tag(0);
        self.coalesce(off);
        self.attach_free(off);
    }

    /// Merges free successors into the detached fragment at `off`.
    fn coalesce(&self, off: FragOffset) {
        let table = self.table();
        let frag = table.frag(off);
        let last = self.last_frag();
        loop {
            let next = frag.next_phys(off);
            if next >= last {
                break;
            }
            let neighbour = table.frag(next);
            let Some(slot) = neighbour.slot() else { break };
            if table.is_shard(slot) || is_exact(slot as usize) {
                break;
            }
            {
                let _guard = table.lock(slot);
                // Raced with an allocator that took it between peek and lock.
                if neighbour.slot() != Some(slot) {
                    break;
                }
                // Safety: slot lock held and the neighbour is linked there.
                unsafe { table.detach_locked(slot, next) };
            }
            let absorbed = neighbour.size();
            let view = self.view();
            A::on_detach(&view, absorbed);
            frag.set_size(frag.size() + FRAG_OVERHEAD + absorbed);
            A::on_merge(&view);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::accounting::EagerAccounting;
    use crate::config::ArenaConfig;
    use crate::region::SharedRegion;
    use crate::Arena;

    fn with_arena<R>(debug: bool, f: impl FnOnce(&Arena<EagerAccounting>) -> R) -> R {
        let bytes = 1 << 20;
        let mut buf = vec![0u64; bytes / 8];
        let region = unsafe { SharedRegion::from_raw(buf.as_mut_ptr() as *mut u8, bytes) }.unwrap();
        let config = ArenaConfig { shards_per_bucket: 1, debug, ..ArenaConfig::default() };
        let arena = Arena::create_private(region, "free", config).unwrap();
        f(&arena)
    }

    #[test]
    fn test_free_merges_with_remainder() {
        with_arena(false, |arena| {
            let initial = arena.info();
            let p = arena.allocate(100).unwrap();
            unsafe { arena.free(p) };
            assert_eq!(arena.info().fragments, 1);
            assert_eq!(arena.info().used, 0);
            assert_eq!(arena.info().real_used, initial.real_used);
            assert!(arena.table().frag(arena.first_frag()).is_free());
        });
    }

    #[test]
    fn test_free_without_free_successor_keeps_fragment() {
        with_arena(false, |arena| {
            let a = arena.allocate(64).unwrap();
            let _b = arena.allocate(64).unwrap();
            unsafe { arena.free(a) };
            // a's successor is live, so a sits alone in the 64-byte bucket.
            assert_eq!(arena.info().fragments, 3);
            let again = arena.allocate(64).unwrap();
            assert_eq!(again, a);
        });
    }

    #[test]
    fn test_free_leaves_exact_fit_successor_alone() {
        with_arena(false, |arena| {
            let a = arena.allocate(16).unwrap();
            let b = arena.allocate(16).unwrap();
            let _c = arena.allocate(16).unwrap();
            unsafe { arena.free(b) };
            let before = arena.info().fragments;
            unsafe { arena.free(a) };

            assert_eq!(arena.info().fragments, before);
            assert_eq!(unsafe { arena.frag_size(arena.allocate(16).unwrap()) }, Some(16));
            assert_eq!(unsafe { arena.frag_size(arena.allocate(16).unwrap()) }, Some(16));
            arena.verify().unwrap();
        });
    }

    #[test]
    fn test_double_free_is_ignored_in_release_mode() {
        with_arena(false, |arena| {
            let a = arena.allocate(32).unwrap();
            let _b = arena.allocate(32).unwrap();
            unsafe { arena.free(a) };
            let before = arena.info();
            unsafe { arena.free(a) };
            assert_eq!(arena.info(), before);
        });
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics_in_debug_mode() {
        with_arena(true, |arena| {
            let a = arena.allocate(32).unwrap();
            let _b = arena.allocate(32).unwrap();
            unsafe {
                arena.free(a);
                arena.free(a);
            }
        });
    }
}
