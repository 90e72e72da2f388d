//! Size classes and free-list hashing.
//!
//! Sizes up to [`OPTIMIZE`] map one bucket per alignment multiple (exact fit).
//! Larger sizes map to one bucket per power of two, selected by the index of
//! the most significant set bit of the rounded size.

use crate::fragment::FRAG_OVERHEAD;

/// Alignment unit. Every fragment size is a multiple of this.
pub const ALIGN: usize = 8;

/// log2 of the exact-fit threshold.
pub const OPTIMIZE_FACTOR: u32 = 14;

/// Sizes at or below this threshold get an exact-fit bucket.
pub const OPTIMIZE: usize = 1 << OPTIMIZE_FACTOR;

/// Number of exact-fit classes tracked by the usage recorder and the pattern file.
pub const LINEAR_HASH_SIZE: usize = OPTIMIZE / ALIGN;

/// Number of primary buckets: exact-fit classes `0..=LINEAR_HASH_SIZE`
/// followed by one bucket per power of two above the threshold.
pub const HASH_SIZE: usize = LINEAR_HASH_SIZE + (usize::BITS - OPTIMIZE_FACTOR) as usize + 1;

/// Smallest payload a fragment may carry.
pub const MIN_FRAG_SIZE: usize = ALIGN;

const ALIGN_MASK: usize = !(ALIGN - 1);

/// Rounds `size` up to the alignment unit. Returns `None` on overflow.
#[inline]
pub const fn round_up(size: usize) -> Option<usize> {
    match size.checked_add(ALIGN - 1) {
        Some(s) => Some(s & ALIGN_MASK),
        None => None,
    }
}

/// Rounds `size` down to the alignment unit.
#[inline]
pub const fn round_down(size: usize) -> usize {
    size & ALIGN_MASK
}

/// Rounds a request to the size actually carved out of the arena.
#[inline]
pub const fn request_size(size: usize) -> Option<usize> {
    if size < MIN_FRAG_SIZE {
        return Some(MIN_FRAG_SIZE);
    }
    round_up(size)
}

/// Index of the most significant set bit. `size` must be non-zero.
#[inline]
const fn big_hash_idx(size: usize) -> usize {
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

/// Primary bucket for a rounded size.
#[inline]
pub const fn hash(size: usize) -> usize {
    if size <= OPTIMIZE {
        size / ALIGN
    } else {
        LINEAR_HASH_SIZE + big_hash_idx(size) - OPTIMIZE_FACTOR as usize + 1
    }
}

/// Whether a primary bucket holds a single exact size.
#[inline]
pub const fn is_exact(bucket: usize) -> bool {
    bucket <= LINEAR_HASH_SIZE
}

/// Inclusive size range covered by a primary bucket.
pub const fn bucket_range(bucket: usize) -> (usize, usize) {
    if is_exact(bucket) {
        let size = bucket * ALIGN;
        return (size, size);
    }
    let bit = bucket - LINEAR_HASH_SIZE - 1 + OPTIMIZE_FACTOR as usize;
    let low = if bit == OPTIMIZE_FACTOR as usize { OPTIMIZE + ALIGN } else { 1 << bit };
    let high = if bit + 1 >= usize::BITS as usize {
        round_down(usize::MAX)
    } else {
        (1 << (bit + 1)) - ALIGN
    };
    (low, high)
}

/// Whether a fragment of `size` can give up `wanted` bytes and still leave a
/// viable free fragment behind.
#[inline]
pub const fn can_split(size: usize, wanted: usize) -> bool {
    size >= wanted && size - wanted >= FRAG_OVERHEAD + MIN_FRAG_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding() {
        assert_eq!(round_up(0), Some(0));
        assert_eq!(round_up(1), Some(8));
        assert_eq!(round_up(8), Some(8));
        assert_eq!(round_up(9), Some(16));
        assert_eq!(round_up(usize::MAX), None);
        assert_eq!(round_down(15), 8);
        assert_eq!(request_size(0), Some(MIN_FRAG_SIZE));
        assert_eq!(request_size(13), Some(16));
    }

    #[test]
    fn test_exact_hash() {
        assert_eq!(hash(8), 1);
        assert_eq!(hash(16), 2);
        assert_eq!(hash(OPTIMIZE), LINEAR_HASH_SIZE);
        assert!(is_exact(hash(OPTIMIZE)));
    }

    #[test]
    fn test_big_hash_uses_msb() {
        let first_big = hash(OPTIMIZE + ALIGN);
        assert_eq!(first_big, LINEAR_HASH_SIZE + 1);
        assert!(!is_exact(first_big));
        // Everything below the next power of two shares the bucket.
        assert_eq!(hash(2 * OPTIMIZE - ALIGN), first_big);
        assert_eq!(hash(2 * OPTIMIZE), first_big + 1);
        assert_eq!(hash(round_down(usize::MAX)), HASH_SIZE - 1);
    }

    #[test]
    fn test_bucket_range_covers_hash() {
        for size in [OPTIMIZE + ALIGN, 40_000, 1 << 20, (1 << 20) + 8, 3 << 22] {
            let (low, high) = bucket_range(hash(size));
            assert!(low <= size && size <= high, "{size} outside [{low}, {high}]");
        }
        assert_eq!(bucket_range(2), (16, 16));
    }

    #[test]
    fn test_can_split() {
        assert!(!can_split(64, 64));
        assert!(can_split(64 + FRAG_OVERHEAD + MIN_FRAG_SIZE, 64));
        assert!(!can_split(64 + FRAG_OVERHEAD, 64));
        assert!(!can_split(16, 32));
    }
}
