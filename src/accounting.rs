//! Usage accounting strategies.
//!
//! The allocator reports four structural events: a fragment leaving the free
//! pool (`detach`), entering it (`attach`), one fragment becoming two
//! (`split`) and two becoming one (`merge`). A strategy decides what those
//! events cost:
//!
//! - [`EagerAccounting`] updates the shared counters under the statistics
//!   lock on every event. Reads are always exact.
//! - [`LazyAccounting`] only tracks the fragment count. Counters are rebuilt
//!   from bucket occupancy when read and older than the refresh threshold.
//!
//! The strategy is a type parameter of the arena and its mode is recorded in
//! the shared header, so every process attached to one arena agrees on it.

use crate::bucket::FreeTable;
use crate::fragment::FRAG_OVERHEAD;
use crate::size_class::MIN_FRAG_SIZE;
use crate::sync::RawLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which strategy maintains the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum AccountingMode {
    /// Counters updated on every structural change.
    Eager = 1,
    /// Counters rebuilt from bucket occupancy on demand.
    Lazy = 2,
}

impl AccountingMode {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Eager),
            2 => Some(Self::Lazy),
            _ => None,
        }
    }
}

/// Snapshot of arena usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaInfo {
    /// Usable arena size after alignment.
    pub total_size: usize,
    /// Payload bytes handed out.
    pub used: usize,
    /// Payload plus headers plus fixed control overhead.
    pub real_used: usize,
    /// `total_size - real_used`.
    pub free: usize,
    /// Fragments, free and live.
    pub fragments: usize,
    /// Highest `real_used` observed.
    pub max_real_used: usize,
    /// Smallest fragment payload.
    pub min_frag: usize,
}

/// Counters stored in the shared arena header.
#[repr(C)]
#[derive(Debug)]
pub struct SharedStats {
    used: AtomicUsize,
    real_used: AtomicUsize,
    max_real_used: AtomicUsize,
    total_frags: AtomicUsize,
    last_refresh_ms: AtomicU64,
}

impl SharedStats {
    pub(crate) fn new(fixed_overhead: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            real_used: AtomicUsize::new(fixed_overhead),
            max_real_used: AtomicUsize::new(fixed_overhead),
            total_frags: AtomicUsize::new(1),
            last_refresh_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn total_frags(&self) -> usize {
        self.total_frags.load(Ordering::Relaxed)
    }
}

/// Everything a strategy may look at. Built per operation from the arena.
pub struct StatsView<'a> {
    pub(crate) stats: &'a SharedStats,
    pub(crate) lock: &'a RawLock,
    pub(crate) table: FreeTable<'a>,
    pub(crate) size: usize,
    pub(crate) fixed_overhead: usize,
    pub(crate) refresh_ms: u64,
}

impl StatsView<'_> {
    fn read(&self) -> ArenaInfo {
        let _guard = self.lock.lock();
        let real_used = self.stats.real_used.load(Ordering::Relaxed);
        ArenaInfo {
            total_size: self.size,
            used: self.stats.used.load(Ordering::Relaxed),
            real_used,
            free: self.size.saturating_sub(real_used),
            fragments: self.stats.total_frags.load(Ordering::Relaxed),
            max_real_used: self.stats.max_real_used.load(Ordering::Relaxed),
            min_frag: MIN_FRAG_SIZE,
        }
    }
}

/// A usage accounting strategy.
pub trait Accounting: Send + Sync + 'static {
    /// Mode recorded in the arena header.
    const MODE: AccountingMode;

    /// A fragment of `size` left the free pool.
    fn on_detach(view: &StatsView<'_>, size: usize);

    /// A fragment of `size` entered the free pool.
    fn on_attach(view: &StatsView<'_>, size: usize);

    /// A detached fragment was split in two.
    fn on_split(view: &StatsView<'_>);

    /// A detached fragment absorbed its neighbour.
    fn on_merge(view: &StatsView<'_>);

    /// An allocation completed, including any split. Peak usage is sampled
    /// here rather than mid-operation, where a fragment about to be split
    /// still counts in full.
    fn on_allocated(_view: &StatsView<'_>) {}

    /// Current counters. `force` bypasses any staleness threshold.
    fn info(view: &StatsView<'_>, force: bool) -> ArenaInfo;
}

/// Exact counters, updated transactionally on every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerAccounting;

impl Accounting for EagerAccounting {
    const MODE: AccountingMode = AccountingMode::Eager;

    fn on_detach(view: &StatsView<'_>, size: usize) {
        let _guard = view.lock.lock();
        view.stats.used.fetch_add(size, Ordering::Relaxed);
        view.stats.real_used.fetch_add(size + FRAG_OVERHEAD, Ordering::Relaxed);
    }

    fn on_attach(view: &StatsView<'_>, size: usize) {
        let _guard = view.lock.lock();
        view.stats.used.fetch_sub(size, Ordering::Relaxed);
        view.stats.real_used.fetch_sub(size + FRAG_OVERHEAD, Ordering::Relaxed);
    }

    fn on_split(view: &StatsView<'_>) {
        let _guard = view.lock.lock();
        view.stats.total_frags.fetch_add(1, Ordering::Relaxed);
        view.stats.used.fetch_sub(FRAG_OVERHEAD, Ordering::Relaxed);
    }

    fn on_merge(view: &StatsView<'_>) {
        let _guard = view.lock.lock();
        view.stats.total_frags.fetch_sub(1, Ordering::Relaxed);
        view.stats.used.fetch_add(FRAG_OVERHEAD, Ordering::Relaxed);
    }

    fn on_allocated(view: &StatsView<'_>) {
        let _guard = view.lock.lock();
        let real = view.stats.real_used.load(Ordering::Relaxed);
        view.stats.max_real_used.fetch_max(real, Ordering::Relaxed);
    }

    fn info(view: &StatsView<'_>, _force: bool) -> ArenaInfo {
        view.read()
    }
}

/// Counters rebuilt from bucket occupancy when read.
///
/// The hot path only touches the fragment count. Reads between refreshes
/// return the last reconstruction, so they may lag behind concurrent
/// allocators by up to `stats_refresh_ms`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LazyAccounting;

impl LazyAccounting {
    fn refresh(view: &StatsView<'_>, now: u64) {
        let mut free_frags = 0usize;
        let mut free_total = 0usize;
        for slot in 0..view.table.len() as u32 {
            let bucket = view.table.bucket(slot);
            if bucket.free_frags() == 0 {
                continue;
            }
            let _guard = bucket.lock();
            free_frags += bucket.free_frags();
            free_total += bucket.free_bytes() + bucket.free_frags() * FRAG_OVERHEAD;
        }

        let real_used = view.size.saturating_sub(free_total);
        let live_frags = view.stats.total_frags().saturating_sub(free_frags);
        let used = real_used.saturating_sub(view.fixed_overhead + live_frags * FRAG_OVERHEAD);

        let _guard = view.lock.lock();
        view.stats.used.store(used, Ordering::Relaxed);
        view.stats.real_used.store(real_used, Ordering::Relaxed);
        view.stats.max_real_used.fetch_max(real_used, Ordering::Relaxed);
        view.stats.last_refresh_ms.store(now, Ordering::Relaxed);
        tracing::trace!(used, real_used, free_frags, "rebuilt lazy arena statistics");
    }
}

impl Accounting for LazyAccounting {
    const MODE: AccountingMode = AccountingMode::Lazy;

    #[inline]
    fn on_detach(_view: &StatsView<'_>, _size: usize) {}

    #[inline]
    fn on_attach(_view: &StatsView<'_>, _size: usize) {}

    #[inline]
    fn on_split(view: &StatsView<'_>) {
        view.stats.total_frags.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_merge(view: &StatsView<'_>) {
        view.stats.total_frags.fetch_sub(1, Ordering::Relaxed);
    }

    fn info(view: &StatsView<'_>, force: bool) -> ArenaInfo {
        let now = now_ms();
        let last = view.stats.last_refresh_ms.load(Ordering::Relaxed);
        if force || last == 0 || now.saturating_sub(last) >= view.refresh_ms {
            Self::refresh(view, now);
        }
        view.read()
    }
}

/// Wall-clock milliseconds, comparable across processes. Never zero.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
        .max(1)
}
