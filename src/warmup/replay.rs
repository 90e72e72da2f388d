//! Replays a pattern: shards the hottest classes and pre-carves free space.

use crate::accounting::Accounting;
use crate::arena::Arena;
use crate::fragment::FRAG_OVERHEAD;
use crate::size_class::{can_split, ALIGN, LINEAR_HASH_SIZE};
use crate::warmup::Pattern;
use serde::Serialize;
use tracing::{debug, info};

/// What a warm-up run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmupSummary {
    /// Exact-fit classes switched to sharded free lists.
    pub optimized_buckets: usize,
    /// Fragments carved off and pre-filed.
    pub fragments: usize,
    /// Bytes carved, headers included.
    pub bytes: usize,
    /// Whether the run stopped because the source fragment ran dry.
    pub exhausted: bool,
}

struct Share {
    class: usize,
    amount: f64,
    fragments: u64,
}

/// Marks hot classes optimized, then carves the largest free fragment into
/// pieces for every class in proportion to its share of the pattern.
pub(crate) fn replay<A: Accounting>(
    arena: &Arena<A>,
    pattern: &Pattern,
    warm_up_percentage: u8,
    optimized_percentage: u8,
) -> WarmupSummary {
    let size = arena.size() as f64;
    let mut shares: Vec<Share> = pattern
        .fractions()
        .iter()
        .enumerate()
        .map(|(class, &amount)| Share {
            class,
            amount,
            fragments: if class == 0 { 0 } else { (amount * size / (ALIGN * class) as f64) as u64 },
        })
        .collect();
    shares.sort_by(|a, b| b.fragments.cmp(&a.fragments));

    let mut summary = WarmupSummary {
        optimized_buckets: usize::from(optimized_percentage) * LINEAR_HASH_SIZE / 100,
        ..WarmupSummary::default()
    };
    let table = arena.table();
    for share in shares.iter().take(summary.optimized_buckets) {
        table.mark_optimized(share.class);
    }
    info!(
        arena = %arena.name(),
        optimized = summary.optimized_buckets,
        total = LINEAR_HASH_SIZE,
        "optimizing memory buckets"
    );

    let Some(mut big) = arena.first_free_fragment() else {
        summary.exhausted = true;
        return summary;
    };
    'classes: for (rank, share) in shares.iter().enumerate() {
        if share.class == 0 {
            continue;
        }
        let piece = share.class * ALIGN;
        let mut budget = share.amount * f64::from(warm_up_percentage) / 100.0 * size;
        debug!(
            class = share.class,
            optimized = rank < summary.optimized_buckets,
            fraction = share.amount,
            budget,
            piece,
            "pre-fragmenting bucket"
        );
        while budget >= (FRAG_OVERHEAD + piece) as f64 {
            if !can_split(table.frag(big).size(), piece) || !arena.take_free(big) {
                summary.exhausted = true;
                break 'classes;
            }
            arena.split(big, piece);
            let rest = table.frag(big).next_phys(big);
            arena.attach_free(big);
            big = rest;

            budget -= (FRAG_OVERHEAD + piece) as f64;
            summary.fragments += 1;
            summary.bytes += FRAG_OVERHEAD + piece;
        }
    }
    if summary.exhausted {
        info!(arena = %arena.name(), fragments = summary.fragments, "warm-up stopped, arena exhausted");
    }
    summary
}
