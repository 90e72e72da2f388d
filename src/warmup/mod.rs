//! Warm-up: learning the allocation-size profile of one run and replaying it
//! at the start of the next.
//!
//! While usage recording is on, every exact-fit request bumps a per-class
//! counter in the control area. [`Arena::update_pattern_file`] turns the
//! counters into a [`Pattern`] and saves it. On the next creation with
//! warm-up enabled, the pattern is loaded and replayed: the hottest classes
//! get sharded free lists, and the initial giant fragment is pre-carved so
//! early allocations find exact fits without splitting.

mod pattern;
mod replay;

pub use pattern::Pattern;
pub use replay::WarmupSummary;

use crate::accounting::Accounting;
use crate::arena::Arena;
use crate::error::PatternError;
use crate::size_class::LINEAR_HASH_SIZE;
use std::sync::atomic::Ordering;
use tracing::{error, info};

impl<A: Accounting> Arena<A> {
    /// Current per-class request counts as a pattern.
    pub fn record_pattern(&self) -> Pattern {
        let counts: Vec<u64> = (0..LINEAR_HASH_SIZE)
            .map(|class| self.usage_counter(class).load(Ordering::Relaxed))
            .collect();
        Pattern::from_usage(&counts)
    }

    /// Saves the recorded pattern to the configured file. Does nothing
    /// unless warm-up is enabled.
    pub fn update_pattern_file(&self) -> Result<(), PatternError> {
        if !self.config().warm_up_enabled {
            return Ok(());
        }
        self.record_pattern().save(&self.config().pattern_file_path)
    }

    /// Replays `pattern` against the arena's free space.
    ///
    /// Meant for a freshly created arena before other handles attach:
    /// marking classes optimized is not synchronized with concurrent
    /// allocators.
    pub fn warm_up_from(&mut self, pattern: &Pattern) -> WarmupSummary {
        let config = self.config();
        let (warm, optimized) = (config.warm_up_percentage, config.optimized_bucket_percentage);
        let summary = replay::replay(self, pattern, warm, optimized);
        info!(
            arena = %self.name(),
            optimized = summary.optimized_buckets,
            fragments = summary.fragments,
            bytes = summary.bytes,
            "memory warm-up complete"
        );
        summary
    }

    /// Loads and replays the configured pattern file during creation.
    ///
    /// A missing or foreign file skips warm-up. A corrupt file means the
    /// last run's shutdown went wrong; the process aborts so the file gets
    /// looked at instead of silently ignored.
    pub(crate) fn boot_warm_up(&mut self) {
        let path = self.config().pattern_file_path.clone();
        match Pattern::load(&path) {
            Ok(pattern) => {
                self.warm_up_from(&pattern);
            }
            Err(e) if e.is_fatal() => {
                error!(arena = %self.name(), error = %e, "corrupt memory pattern file, remove it to start");
                std::process::abort();
            }
            Err(e) => {
                error!(arena = %self.name(), error = %e, "skipping memory warm-up");
            }
        }
    }
}
