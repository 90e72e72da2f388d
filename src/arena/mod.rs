//! The arena: a size-class allocator over one fixed region.
//!
//! # Layout
//!
//! ```text
//! offset 0          slots_offset      usage_offset       ctrl_size                 size - OH
//! ┌───────────────┬─────────────────┬──────────────────┬─────────────────────────┬──────────┐
//! │ ArenaHeader   │ bucket slots    │ usage counters   │ fragments ...           │ sentinel │
//! └───────────────┴─────────────────┴──────────────────┴─────────────────────────┴──────────┘
//! ```
//!
//! The control area is followed by fragments tiling the rest of the region
//! and a zero-size tail sentinel that is never free, so forward coalescing
//! stops without a bounds check.
//!
//! # Concurrency
//!
//! Every bucket slot has its own lock and no path holds two at once.
//! A detached fragment belongs to whoever detached it; only its owner writes
//! its header. Statistics are serialized by a separate lock (embedded in the
//! header for private arenas, allocated from the arena for shared ones).

mod alloc;
mod dump;
mod free;
mod header;
mod sites;

pub use dump::{BucketOccupancy, DumpReport, SiteUsage, VerifyReport};
pub use header::ArenaKind;

use crate::accounting::{Accounting, ArenaInfo, EagerAccounting, SharedStats, StatsView};
use crate::bucket::FreeTable;
use crate::config::ArenaConfig;
use crate::error::{ArenaError, Result};
use crate::fragment::{FragHeader, FRAG_OVERHEAD};
use crate::region::{FragOffset, SharedRegion};
use crate::size_class::{ALIGN, LINEAR_HASH_SIZE, OPTIMIZE};
use crate::sync::RawLock;
use core::marker::PhantomData;
use core::mem::offset_of;
use core::ptr::NonNull;
use header::{encode_name, ArenaHeader, ControlLayout, ARENA_MAGIC, ARENA_VERSION};
use sites::SiteRegistry;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{error, info};

/// A size-class allocator living entirely inside a [`SharedRegion`].
///
/// `A` selects how usage statistics are maintained; see
/// [`crate::accounting`]. Handles are cheap views: several `Arena` values,
/// in one process or many, may operate on the same region concurrently.
pub struct Arena<A: Accounting = EagerAccounting> {
    region: SharedRegion,
    config: ArenaConfig,
    sites: SiteRegistry,
    _accounting: PhantomData<fn() -> A>,
}

impl<A: Accounting> Arena<A> {
    /// Initializes an arena for use by a single process.
    ///
    /// Runs the warm-up when `config.warm_up_enabled` is set. A corrupt
    /// pattern file aborts the process.
    pub fn create_private(region: SharedRegion, name: &str, config: ArenaConfig) -> Result<Self> {
        Self::create(region, name, config, ArenaKind::Private)
    }

    /// Initializes an arena that other processes will attach to.
    ///
    /// The statistics lock is allocated from the arena itself.
    pub fn create_shared(region: SharedRegion, name: &str, config: ArenaConfig) -> Result<Self> {
        Self::create(region, name, config, ArenaKind::Shared)
    }

    fn create(region: SharedRegion, name: &str, config: ArenaConfig, kind: ArenaKind) -> Result<Self> {
        config.validate()?;
        let mut arena = Self::init(region, name, config, kind)?;
        if kind == ArenaKind::Shared {
            arena.host_stats_lock()?;
        }
        if arena.config.warm_up_enabled {
            arena.boot_warm_up();
        }
        Ok(arena)
    }

    /// Opens an arena another handle already initialized in `region`.
    ///
    /// Layout fields (shards, debug mode, accounting mode) come from the
    /// shared header; `config` only supplies process-local settings.
    pub fn attach(region: SharedRegion, config: ArenaConfig) -> Result<Self> {
        if region.len() < core::mem::size_of::<ArenaHeader>() {
            return Err(ArenaError::Incompatible {
                reason: format!("region of {} bytes cannot hold a header", region.len()),
            });
        }
        // Safety: the region is large enough and aligned; the header is only
        // dereferenced after validation of its plain fields.
        let header: &ArenaHeader = unsafe { region.at(0) };
        header.validate(region.len(), A::MODE)?;

        let arena = Self {
            region,
            config,
            sites: SiteRegistry::default(),
            _accounting: PhantomData,
        };
        info!(
            arena = %arena.name(),
            size = header.size,
            kind = ?header.kind(),
            "attached to memory arena"
        );
        Ok(arena)
    }

    fn init(region: SharedRegion, name: &str, config: ArenaConfig, kind: ArenaKind) -> Result<Self> {
        let layout = ControlLayout::new(config.shards_per_bucket);
        let size = region.len();
        if size < layout.required() {
            error!(
                arena = name,
                required = layout.required(),
                available = size,
                "region too small for arena"
            );
            return Err(ArenaError::Initialization { required: layout.required(), available: size });
        }

        let first_frag = layout.ctrl_size;
        let last_frag = size - FRAG_OVERHEAD;
        let (name_buf, name_len) = encode_name(name);

        // Safety: the caller handed the region over exclusively; nothing else
        // can observe it until this function returns.
        unsafe {
            core::ptr::write_bytes(region.ptr_at(0), 0, layout.ctrl_size);
            (region.ptr_at(0) as *mut ArenaHeader).write(ArenaHeader {
                magic: ARENA_MAGIC,
                version: ARENA_VERSION,
                kind: kind as u32,
                accounting: A::MODE as u32,
                shards: config.shards_per_bucket,
                debug: u32::from(config.debug),
                name_len,
                size,
                ctrl_size: layout.ctrl_size,
                slots_offset: layout.slots_offset,
                usage_offset: layout.usage_offset,
                first_frag,
                last_frag,
                large_limit: (size / 100 * 5).max(5 * OPTIMIZE),
                created_at: crate::accounting::now_ms(),
                name: name_buf,
                record_usage: AtomicU32::new(u32::from(config.record_usage || config.warm_up_enabled)),
                embedded_lock: RawLock::new(),
                stats_lock_offset: AtomicUsize::new(offset_of!(ArenaHeader, embedded_lock)),
                large_space: AtomicUsize::new(0),
                stats: SharedStats::new(layout.ctrl_size + FRAG_OVERHEAD),
            });
            FragHeader::write_at(&region, FragOffset::new(first_frag), last_frag - first_frag - FRAG_OVERHEAD);
            FragHeader::write_at(&region, FragOffset::new(last_frag), 0);
        }

        let arena = Self {
            region,
            config,
            sites: SiteRegistry::default(),
            _accounting: PhantomData,
        };

        // The initial fragment is already counted as free by the fresh stats.
        let first = FragOffset::new(first_frag);
        let table = arena.table();
        let slot = table.select_slot(table.frag(first).size());
        {
            let _guard = table.lock(slot);
            // Safety: slot lock held; the fragment was just written.
            unsafe { table.attach_locked(slot, first) };
        }

        info!(
            arena = name,
            size,
            ctrl_size = layout.ctrl_size,
            kind = ?kind,
            accounting = ?A::MODE,
            shards = arena.config.shards_per_bucket,
            "initialized memory arena"
        );
        Ok(arena)
    }

    /// Carves the statistics lock of a shared arena out of the arena.
    fn host_stats_lock(&self) -> Result<()> {
        let ptr = self.allocate_untracked(core::mem::size_of::<RawLock>())?;
        // Safety: freshly allocated, suitably aligned, and owned for the
        // arena's lifetime.
        unsafe { (ptr.as_ptr() as *mut RawLock).write(RawLock::new()) };
        let offset = self.offset_in_region(ptr)?;
        self.header().stats_lock_offset.store(offset, Ordering::Release);
        Ok(())
    }

    /// Offset of `ptr` from the region base. Offset zero holds the header,
    /// so it is rejected along with addresses outside the region.
    fn offset_in_region(&self, ptr: NonNull<u8>) -> Result<usize> {
        match self.region.offset_of(ptr.as_ptr()) {
            Some(offset) if offset != 0 => Ok(offset),
            _ => Err(ArenaError::Inconsistent {
                offset: FragOffset::NULL,
                reason: format!("{ptr:?} is not inside the arena body"),
            }),
        }
    }

    #[inline]
    pub(crate) fn header(&self) -> &ArenaHeader {
        // Safety: written at creation or validated at attach.
        unsafe { self.region.at(0) }
    }

    #[inline]
    pub(crate) fn table(&self) -> FreeTable<'_> {
        let header = self.header();
        FreeTable::new(&self.region, header.slots_offset, header.shards)
    }

    fn stats_lock(&self) -> &RawLock {
        let offset = self.header().stats_lock_offset.load(Ordering::Acquire);
        // Safety: points either at the embedded header lock or at a lock
        // allocated from this arena that is never freed.
        unsafe { self.region.at(offset) }
    }

    pub(crate) fn view(&self) -> StatsView<'_> {
        let header = self.header();
        StatsView {
            stats: &header.stats,
            lock: self.stats_lock(),
            table: self.table(),
            size: header.size,
            fixed_overhead: header.fixed_overhead(),
            refresh_ms: self.config.stats_refresh_ms,
        }
    }

    /// Request counter of an exact-fit class.
    pub(crate) fn usage_counter(&self, class: usize) -> &AtomicU64 {
        debug_assert!(class < LINEAR_HASH_SIZE);
        // Safety: the counter array lives inside the zeroed control area.
        unsafe { self.region.at(self.header().usage_offset + class * core::mem::size_of::<AtomicU64>()) }
    }

    pub(crate) fn records_usage(&self) -> bool {
        self.header().record_usage.load(Ordering::Relaxed) != 0
    }

    /// Whether call sites are recorded and double frees assert.
    pub fn is_debug(&self) -> bool {
        self.header().debug != 0
    }

    /// Diagnostic name given at creation (at most 32 bytes are kept).
    pub fn name(&self) -> String {
        self.header().name()
    }

    /// Private or shared.
    pub fn kind(&self) -> ArenaKind {
        self.header().kind()
    }

    /// Creation time, milliseconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.header().created_at
    }

    /// Usable arena size after alignment.
    pub fn size(&self) -> usize {
        self.header().size
    }

    /// Process-local configuration.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// The underlying region.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Usage statistics. Lazily accounted arenas may return values up to
    /// `stats_refresh_ms` old.
    pub fn info(&self) -> ArenaInfo {
        A::info(&self.view(), false)
    }

    /// Usage statistics, rebuilt now if the strategy caches them.
    pub fn refresh_info(&self) -> ArenaInfo {
        A::info(&self.view(), true)
    }

    /// Bytes currently held by live allocations above the exact-fit range.
    pub fn large_space(&self) -> usize {
        self.header().large_space.load(Ordering::Relaxed)
    }

    /// Threshold of [`Self::large_space`] past which a restart is advisable.
    pub fn large_limit(&self) -> usize {
        self.header().large_limit
    }

    /// Whether large allocations have piled up enough to fragment the arena.
    pub fn needs_defrag(&self) -> bool {
        self.large_space() > self.large_limit()
    }

    /// Usable size of the fragment behind `ptr` (the rounded request, or
    /// more when the remainder was too small to split off).
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this arena.
    pub unsafe fn frag_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.frag_of(ptr).map(|off| self.table().frag(off).size())
    }

    /// Attaches an opaque statistics tag to a live allocation.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this arena.
    pub unsafe fn set_tag(&self, ptr: NonNull<u8>, tag: u64) {
        if let Some(off) = self.frag_of(ptr) {
            self.table().frag(off).set_tag(tag);
        }
    }

    /// Tag previously set with [`Self::set_tag`], zero if none.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this arena.
    pub unsafe fn tag(&self, ptr: NonNull<u8>) -> u64 {
        self.frag_of(ptr).map_or(0, |off| self.table().frag(off).tag())
    }

    /// Fragment header offset for a payload pointer, if it could belong to
    /// this arena.
    pub(crate) fn frag_of(&self, ptr: NonNull<u8>) -> Option<FragOffset> {
        let header = self.header();
        let payload = self.region.offset_of(ptr.as_ptr())?;
        let off = payload.checked_sub(FRAG_OVERHEAD)?;
        (off >= header.first_frag && off < header.last_frag && off % ALIGN == 0).then_some(FragOffset::new(off))
    }

    #[inline]
    pub(crate) fn payload(&self, off: FragOffset) -> NonNull<u8> {
        // Safety: fragment payloads lie strictly inside the region.
        unsafe { NonNull::new_unchecked(self.region.ptr_at(off.get() + FRAG_OVERHEAD)) }
    }

    pub(crate) fn first_frag(&self) -> FragOffset {
        FragOffset::new(self.header().first_frag)
    }

    pub(crate) fn last_frag(&self) -> FragOffset {
        FragOffset::new(self.header().last_frag)
    }
}

impl<A: Accounting> core::fmt::Debug for Arena<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("accounting", &A::MODE)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
