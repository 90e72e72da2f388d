//! Arena configuration.

use crate::error::{ArenaError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the warm-up pattern file.
pub const DEFAULT_PATTERN_FILE: &str = "mem_warming_pattern";

/// Settings chosen when an arena is created.
///
/// Fields that shape the shared layout (`shards_per_bucket`, `debug`,
/// `record_usage`) are stored in the arena header; processes attaching later
/// use the header's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Replay the pattern file when the arena is created.
    pub warm_up_enabled: bool,
    /// Where the allocation-size histogram is stored.
    pub pattern_file_path: PathBuf,
    /// Share of arena bytes pre-fragmented during warm-up (0–100).
    pub warm_up_percentage: u8,
    /// Share of exact-fit classes, hottest first, that get sharded (0–100).
    pub optimized_bucket_percentage: u8,
    /// Independently locked sub-lists per optimized class.
    pub shards_per_bucket: u32,
    /// Record allocation call sites and assert on double free.
    pub debug: bool,
    /// How stale lazily reconstructed statistics may get, in milliseconds.
    pub stats_refresh_ms: u64,
    /// Count requests per exact-fit class for the pattern recorder.
    pub record_usage: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            warm_up_enabled: false,
            pattern_file_path: PathBuf::from(DEFAULT_PATTERN_FILE),
            warm_up_percentage: 75,
            optimized_bucket_percentage: 10,
            shards_per_bucket: 4,
            debug: false,
            stats_refresh_ms: 1000,
            record_usage: false,
        }
    }
}

impl ArenaConfig {
    /// Parses a JSON configuration; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ArenaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ArenaError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.warm_up_percentage > 100 {
            return Err(ArenaError::Config(format!(
                "warm_up_percentage must be 0-100, got {}",
                self.warm_up_percentage
            )));
        }
        if self.optimized_bucket_percentage > 100 {
            return Err(ArenaError::Config(format!(
                "optimized_bucket_percentage must be 0-100, got {}",
                self.optimized_bucket_percentage
            )));
        }
        if self.shards_per_bucket == 0 {
            return Err(ArenaError::Config("shards_per_bucket must be at least 1".into()));
        }
        Ok(())
    }

    /// Enables warm-up from `path`.
    pub fn with_warm_up(mut self, path: impl Into<PathBuf>, percentage: u8) -> Self {
        self.warm_up_enabled = true;
        self.pattern_file_path = path.into();
        self.warm_up_percentage = percentage;
        self
    }

    /// Turns on call-site tracking and double-free assertions.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Turns on per-class request counting.
    pub fn with_usage_recording(mut self, record: bool) -> Self {
        self.record_usage = record;
        self
    }

    /// Sets the lazy statistics refresh threshold.
    pub fn with_stats_refresh_ms(mut self, ms: u64) -> Self {
        self.stats_refresh_ms = ms;
        self
    }
}
