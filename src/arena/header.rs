//! Arena descriptor stored at the start of the region.

use crate::accounting::{AccountingMode, SharedStats};
use crate::bucket::{FreeTable, BUCKET_SIZE};
use crate::error::{ArenaError, Result};
use crate::fragment::FRAG_OVERHEAD;
use crate::size_class::{round_up, LINEAR_HASH_SIZE, MIN_FRAG_SIZE};
use crate::sync::RawLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};

/// Magic number identifying an initialized arena ("HPMALLOC").
pub(crate) const ARENA_MAGIC: u64 = 0x4850_4d41_4c4c_4f43;

/// Layout version of the header and bucket table.
pub(crate) const ARENA_VERSION: u32 = 1;

/// Bytes of the diagnostic name kept in shared memory.
pub(crate) const NAME_LEN: usize = 32;

/// How the arena is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ArenaKind {
    /// Used by one process. Statistics use a lock embedded in the header.
    Private = 1,
    /// Used by cooperating processes. Statistics use a dedicated lock
    /// allocated from the arena itself.
    Shared = 2,
}

/// Fixed part of the control area.
///
/// Plain fields are written once during creation, before any other accessor
/// can see the region, and are read-only afterwards.
#[repr(C)]
pub(crate) struct ArenaHeader {
    pub(crate) magic: u64,
    pub(crate) version: u32,
    pub(crate) kind: u32,
    pub(crate) accounting: u32,
    pub(crate) shards: u32,
    pub(crate) debug: u32,
    pub(crate) name_len: u32,
    pub(crate) size: usize,
    pub(crate) ctrl_size: usize,
    pub(crate) slots_offset: usize,
    pub(crate) usage_offset: usize,
    pub(crate) first_frag: usize,
    pub(crate) last_frag: usize,
    pub(crate) large_limit: usize,
    pub(crate) created_at: u64,
    pub(crate) name: [u8; NAME_LEN],
    pub(crate) record_usage: AtomicU32,
    pub(crate) embedded_lock: RawLock,
    pub(crate) stats_lock_offset: AtomicUsize,
    pub(crate) large_space: AtomicUsize,
    pub(crate) stats: SharedStats,
}

/// Offsets of the control structures for a given shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ControlLayout {
    pub(crate) slots_offset: usize,
    pub(crate) usage_offset: usize,
    pub(crate) ctrl_size: usize,
}

impl ControlLayout {
    pub(crate) fn new(shards: u32) -> Self {
        let header = core::mem::size_of::<ArenaHeader>();
        let slots_offset = round_up(header).unwrap_or(header);
        let usage_offset = slots_offset + FreeTable::slot_count(shards) * BUCKET_SIZE;
        let usage_end = usage_offset + LINEAR_HASH_SIZE * core::mem::size_of::<AtomicU64>();
        Self {
            slots_offset,
            usage_offset,
            ctrl_size: round_up(usage_end).unwrap_or(usage_end),
        }
    }

    /// Smallest region that fits the control area, one minimal fragment and
    /// the tail sentinel.
    pub(crate) fn required(&self) -> usize {
        self.ctrl_size + 2 * FRAG_OVERHEAD + MIN_FRAG_SIZE
    }
}

impl ArenaHeader {
    pub(crate) fn name(&self) -> String {
        let len = (self.name_len as usize).min(NAME_LEN);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    pub(crate) fn kind(&self) -> ArenaKind {
        if self.kind == ArenaKind::Shared as u32 {
            ArenaKind::Shared
        } else {
            ArenaKind::Private
        }
    }

    /// Control area plus the tail sentinel's header.
    pub(crate) fn fixed_overhead(&self) -> usize {
        self.ctrl_size + FRAG_OVERHEAD
    }

    /// Checks that an existing header was written by a compatible build.
    pub(crate) fn validate(&self, region_len: usize, mode: AccountingMode) -> Result<()> {
        if self.magic != ARENA_MAGIC {
            return Err(incompatible(format!("bad magic 0x{:016x}", self.magic)));
        }
        if self.version != ARENA_VERSION {
            return Err(incompatible(format!(
                "layout version {} (expected {ARENA_VERSION})",
                self.version
            )));
        }
        match AccountingMode::from_raw(self.accounting) {
            Some(m) if m == mode => {}
            other => {
                return Err(incompatible(format!("accounting mode {other:?} (expected {mode:?})")));
            }
        }
        if self.size > region_len {
            return Err(incompatible(format!(
                "arena spans {} bytes but region has {region_len}",
                self.size
            )));
        }
        if self.shards == 0 || ControlLayout::new(self.shards).ctrl_size != self.ctrl_size {
            return Err(incompatible(format!("control layout mismatch ({} shards)", self.shards)));
        }
        Ok(())
    }
}

/// Copies up to [`NAME_LEN`] bytes of `name`, cut at a char boundary.
pub(crate) fn encode_name(name: &str) -> ([u8; NAME_LEN], u32) {
    let mut len = name.len().min(NAME_LEN);
    while !name.is_char_boundary(len) {
        len -= 1;
    }
    let mut buf = [0u8; NAME_LEN];
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
    (buf, len as u32)
}

fn incompatible(reason: String) -> ArenaError {
    ArenaError::Incompatible { reason }
}
