//! Diagnostics: occupancy dumps and structural verification.

use super::Arena;
use crate::accounting::{Accounting, ArenaInfo};
use crate::error::{ArenaError, Result};
use crate::fragment::{FragHeader, FRAG_OVERHEAD};
use crate::region::FragOffset;
use crate::size_class::{bucket_range, hash, is_exact, ALIGN, HASH_SIZE};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Free-list occupancy of one primary bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketOccupancy {
    /// Primary bucket index.
    pub index: usize,
    /// Smallest fragment size the bucket holds.
    pub min_size: usize,
    /// Largest fragment size the bucket holds.
    pub max_size: usize,
    /// Whether inserts rotate across secondary slots.
    pub optimized: bool,
    /// Entries per list: the primary list first, then each secondary slot
    /// of an optimized class.
    pub fragments: Vec<usize>,
}

impl BucketOccupancy {
    /// Free fragments across all lists of the bucket.
    pub fn total(&self) -> usize {
        self.fragments.iter().sum()
    }
}

/// Live bytes attributed to one allocation call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteUsage {
    /// `file:line:column` of the caller.
    pub site: String,
    /// Payload bytes currently held.
    pub bytes: usize,
    /// Live allocations.
    pub allocations: usize,
}

/// Snapshot produced by [`Arena::dump`].
#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    /// Arena name.
    pub name: String,
    /// Alignment unit.
    pub align: usize,
    /// Number of primary buckets.
    pub hash_size: usize,
    /// Usage counters, refreshed.
    pub info: ArenaInfo,
    /// Non-empty or optimized buckets, in index order.
    pub buckets: Vec<BucketOccupancy>,
    /// Free fragments across all buckets.
    pub free_fragments: usize,
    /// Bytes held by live large allocations.
    pub large_space: usize,
    /// Live usage per call site, largest first. Empty unless debug.
    pub sites: Vec<SiteUsage>,
}

impl DumpReport {
    /// Serializes the report.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the report to the `hpmalloc::memdump` log target.
    pub fn log(&self) {
        for line in self.to_string().lines() {
            tracing::info!(target: "hpmalloc::memdump", "{line}");
        }
    }
}

impl fmt::Display for DumpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = &self.info;
        writeln!(f, "status of arena {}:", self.name)?;
        writeln!(f, "  alignment: {} hash size: {}", self.align, self.hash_size)?;
        writeln!(
            f,
            "  size: {} used: {} real used: {} free: {} max real used: {}",
            info.total_size, info.used, info.real_used, info.free, info.max_real_used
        )?;
        writeln!(f, "  fragments: {} free: {}", info.fragments, self.free_fragments)?;
        writeln!(f, "  large space: {}", self.large_space)?;
        writeln!(f, "  free lists:")?;
        for bucket in &self.buckets {
            if bucket.optimized {
                writeln!(
                    f,
                    "    hash = {:4} fragments = {:6} size = {} (optimized, per list {:?})",
                    bucket.index,
                    bucket.total(),
                    bucket.min_size,
                    bucket.fragments
                )?;
            } else if bucket.min_size == bucket.max_size {
                writeln!(f, "    hash = {:4} fragments = {:6} size = {}", bucket.index, bucket.total(), bucket.min_size)?;
            } else {
                writeln!(
                    f,
                    "    hash = {:4} fragments = {:6} size = {} .. {}",
                    bucket.index,
                    bucket.total(),
                    bucket.min_size,
                    bucket.max_size
                )?;
            }
        }
        if !self.sites.is_empty() {
            writeln!(f, "  live allocations by site:")?;
            for site in &self.sites {
                writeln!(f, "    {:>10} bytes in {:>6} allocations at {}", site.bytes, site.allocations, site.site)?;
            }
        }
        write!(f, "end of arena {}", self.name)
    }
}

/// Totals confirmed by [`Arena::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Fragments tiling the arena, sentinel excluded.
    pub fragments: usize,
    /// Fragments linked into free lists.
    pub free_fragments: usize,
    /// Free payload bytes.
    pub free_bytes: usize,
}

impl<A: Accounting> Arena<A> {
    /// Collects bucket occupancy, refreshed statistics and, for debug
    /// arenas, live bytes per allocation site.
    pub fn dump(&self) -> DumpReport {
        let table = self.table();
        let mut buckets = Vec::new();
        let mut free_fragments = 0;
        for index in 0..HASH_SIZE {
            let optimized = table.is_optimized(index);
            let mut fragments = vec![table.count(index as u32)];
            if optimized {
                fragments.extend((0..table.shards()).map(|s| table.count(table.shard_slot(index, s))));
            }
            let total: usize = fragments.iter().sum();
            free_fragments += total;
            if total == 0 && !optimized {
                continue;
            }
            let (min_size, max_size) = bucket_range(index);
            buckets.push(BucketOccupancy { index, min_size, max_size, optimized, fragments });
        }

        DumpReport {
            name: self.name(),
            align: ALIGN,
            hash_size: HASH_SIZE,
            info: self.refresh_info(),
            buckets,
            free_fragments,
            large_space: self.large_space(),
            sites: if self.is_debug() { self.site_usage() } else { Vec::new() },
        }
    }

    fn site_usage(&self) -> Vec<SiteUsage> {
        let mut by_site: HashMap<u64, (usize, usize)> = HashMap::new();
        for (_, frag) in self.fragments() {
            if frag.is_free() || frag.site() == 0 {
                continue;
            }
            let entry = by_site.entry(frag.site()).or_default();
            entry.0 += frag.size();
            entry.1 += 1;
        }
        let mut sites: Vec<SiteUsage> = by_site
            .into_iter()
            .map(|(id, (bytes, allocations))| SiteUsage { site: self.sites.describe(id), bytes, allocations })
            .collect();
        sites.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.site.cmp(&b.site)));
        sites
    }

    /// Physical fragments from the first to the tail sentinel, exclusive.
    /// Stops early on a header whose size would overrun the sentinel.
    fn fragments(&self) -> impl Iterator<Item = (FragOffset, &FragHeader)> + '_ {
        let table = self.table();
        let last = self.last_frag();
        let mut off = self.first_frag();
        core::iter::from_fn(move || {
            if off >= last {
                return None;
            }
            let frag = table.frag(off);
            let this = off;
            let next = off.get().checked_add(FRAG_OVERHEAD + frag.size())?;
            off = if next > last.get() { last } else { FragOffset::new(next) };
            Some((this, frag))
        })
    }

    /// First physically free fragment.
    pub(crate) fn first_free_fragment(&self) -> Option<FragOffset> {
        self.fragments().find(|(_, frag)| frag.is_free()).map(|(off, _)| off)
    }

    /// Walks every fragment and every free list, checking that fragments
    /// tile the arena, each free fragment is linked exactly once in the
    /// bucket for its size, list links are symmetric, large buckets are
    /// sorted and the counters agree.
    ///
    /// Only meaningful while no other handle is mutating the arena.
    pub fn verify(&self) -> Result<VerifyReport> {
        let table = self.table();
        let first = self.first_frag();
        let last = self.last_frag();

        let mut off = first;
        let mut fragments = 0usize;
        let mut phys_free = 0usize;
        let mut phys_free_bytes = 0usize;
        while off < last {
            let frag = table.frag(off);
            let size = frag.size();
            if size % ALIGN != 0 {
                return Err(inconsistent(off, format!("size {size} is not aligned")));
            }
            let next = off.get() + FRAG_OVERHEAD + size;
            if next > last.get() {
                return Err(inconsistent(off, format!("size {size} overruns the tail sentinel")));
            }
            match (frag.is_free(), frag.slot()) {
                (true, Some(slot)) => {
                    if table.class_of(slot) != hash(size) {
                        return Err(inconsistent(off, format!("size {size} linked in slot {slot}")));
                    }
                    phys_free += 1;
                    phys_free_bytes += size;
                }
                (false, None) => {}
                (free, slot) => {
                    return Err(inconsistent(off, format!("free flag {free} with slot {slot:?}")));
                }
            }
            fragments += 1;
            off = FragOffset::new(next);
        }
        let sentinel = table.frag(last);
        if sentinel.size() != 0 || sentinel.is_free() {
            return Err(inconsistent(last, "tail sentinel was overwritten".into()));
        }

        let mut listed = 0usize;
        let mut listed_bytes = 0usize;
        for slot in 0..table.len() as u32 {
            let bucket = table.bucket(slot);
            let _guard = bucket.lock();
            let sorted = !table.is_shard(slot) && !is_exact(slot as usize);
            let mut prev = FragOffset::NULL;
            let mut prev_size = 0;
            let mut count = 0usize;
            let mut bytes = 0usize;
            let mut cur = bucket.head();
            while let Some(c) = cur.non_null() {
                if c < first || c >= last || c.get() % ALIGN != 0 {
                    return Err(inconsistent(c, format!("slot {slot} links outside the arena")));
                }
                let frag = table.frag(c);
                if !frag.is_free() || frag.slot() != Some(slot) {
                    return Err(inconsistent(c, format!("listed in slot {slot} but records {:?}", frag.slot())));
                }
                if frag.prev_free() != prev {
                    return Err(inconsistent(c, format!("back link {} expected {prev}", frag.prev_free())));
                }
                if sorted && frag.size() < prev_size {
                    return Err(inconsistent(c, format!("slot {slot} out of order")));
                }
                count += 1;
                if count > fragments {
                    return Err(inconsistent(c, format!("slot {slot} has a cycle")));
                }
                bytes += frag.size();
                prev_size = frag.size();
                prev = c;
                cur = frag.next_free();
            }
            if count != bucket.free_frags() || bytes != bucket.free_bytes() {
                return Err(inconsistent(
                    FragOffset::NULL,
                    format!(
                        "slot {slot} counters say {} fragments / {} bytes, list has {count} / {bytes}",
                        bucket.free_frags(),
                        bucket.free_bytes()
                    ),
                ));
            }
            listed += count;
            listed_bytes += bytes;
        }
        if listed != phys_free || listed_bytes != phys_free_bytes {
            return Err(inconsistent(
                FragOffset::NULL,
                format!("{phys_free} free fragments in the arena, {listed} in free lists"),
            ));
        }

        let total = self.header().stats.total_frags();
        if total != fragments {
            return Err(inconsistent(
                FragOffset::NULL,
                format!("fragment counter says {total}, arena has {fragments}"),
            ));
        }
        let info = self.refresh_info();
        let expected_real = info.total_size - (phys_free_bytes + phys_free * FRAG_OVERHEAD);
        if info.real_used != expected_real || info.used > info.real_used || info.real_used > info.total_size {
            return Err(inconsistent(
                FragOffset::NULL,
                format!(
                    "statistics drifted: used {} real used {} (expected {expected_real}) of {}",
                    info.used, info.real_used, info.total_size
                ),
            ));
        }

        Ok(VerifyReport { fragments, free_fragments: phys_free, free_bytes: phys_free_bytes })
    }
}

fn inconsistent(offset: FragOffset, reason: String) -> ArenaError {
    ArenaError::Inconsistent { offset, reason }
}
