//! # `hpmalloc` - Hash-Bucketed Shared-Region Allocator
//!
//! A general-purpose allocator that manages one fixed, pre-mapped memory
//! region and serves variable-size requests from it. The region may be
//! mapped by several cooperating processes at once; every structure inside
//! it is addressed by offset, so all of them see the same arena.
//!
//! ## Design
//!
//! - **Size-class hashing**: requests up to [`OPTIMIZE`] bytes land in an
//!   exact-fit bucket (one per [`ALIGN`] multiple). Larger requests land in
//!   one bucket per power of two, kept sorted for best-fit scans.
//! - **Per-bucket locking**: every free list has its own lock, and no code
//!   path holds two at once. Unrelated sizes never contend.
//! - **Sharded hot classes**: warm-up marks the most requested classes
//!   *optimized*, splitting each into several independently locked lists.
//! - **Split and forward coalesce**: allocation splits oversized fragments;
//!   free merges with free power-of-two successors.
//! - **Pluggable accounting**: [`EagerAccounting`] keeps exact counters under
//!   a statistics lock; [`LazyAccounting`] rebuilds them on demand.
//! - **Warm-up**: the per-class request profile of one run is saved as a
//!   [`Pattern`] and replayed when the next arena is created.
//!
//! ## Example
//!
//! ```
//! use hpmalloc::{Arena, ArenaConfig, SharedRegion};
//!
//! let mut backing = vec![0u64; 1 << 17];
//! let len = backing.len() * 8;
//! // Safety: the buffer outlives the arena and is used by nothing else.
//! let region = unsafe { SharedRegion::from_raw(backing.as_mut_ptr().cast(), len) }.unwrap();
//!
//! let arena: Arena = Arena::create_private(region, "example", ArenaConfig::default())?;
//! let p = arena.allocate(100)?;
//! assert_eq!(p.as_ptr() as usize % hpmalloc::ALIGN, 0);
//! unsafe { arena.free(p) };
//! assert_eq!(arena.info().used, 0);
//! # Ok::<(), hpmalloc::ArenaError>(())
//! ```
//!
//! ## Safety model
//!
//! [`SharedRegion::from_raw`] is the single point where the caller vouches
//! for the memory. After that, allocation is safe; freeing and inspecting
//! pointers is `unsafe` because the arena cannot tell a live allocation from
//! an arbitrary address inside the region.

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]

pub mod accounting;
pub mod arena;
mod bucket;
pub mod config;
pub mod error;
mod fragment;
pub mod region;
pub mod size_class;
pub mod sync;
pub mod warmup;

pub use accounting::{Accounting, AccountingMode, ArenaInfo, EagerAccounting, LazyAccounting};
pub use arena::{Arena, ArenaKind, BucketOccupancy, DumpReport, SiteUsage, VerifyReport};
pub use config::{ArenaConfig, DEFAULT_PATTERN_FILE};
pub use error::{ArenaError, PatternError, Result};
pub use fragment::FRAG_OVERHEAD;
pub use region::{FragOffset, SharedRegion};
pub use size_class::{ALIGN, HASH_SIZE, LINEAR_HASH_SIZE, MIN_FRAG_SIZE, OPTIMIZE};
pub use sync::{RawLock, RawLockGuard};
pub use warmup::{Pattern, WarmupSummary};
