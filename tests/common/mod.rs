#![allow(dead_code)]

use hpmalloc::{ArenaConfig, Pattern, SharedRegion, LINEAR_HASH_SIZE};
use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::ptr;

/// Heap-backed region for single-process tests.
pub struct HeapRegion {
    _buf: Vec<u64>,
    pub region: SharedRegion,
}

impl HeapRegion {
    pub fn new(bytes: usize) -> Self {
        let mut buf = vec![0u64; bytes.div_ceil(8)];
        let region = unsafe { SharedRegion::from_raw(buf.as_mut_ptr().cast(), bytes) }.unwrap();
        Self { _buf: buf, region }
    }
}

/// Anonymous shared mapping, inherited by forked children.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
    pub region: SharedRegion,
}

impl MappedRegion {
    pub fn new(len: usize) -> Self {
        let ptr = unsafe {
            mmap(ptr::null_mut(), len, PROT_READ | PROT_WRITE, MAP_SHARED | MAP_ANONYMOUS, -1, 0)
        };
        assert_ne!(ptr, MAP_FAILED, "mmap failed");
        let ptr = ptr as *mut u8;
        let region = unsafe { SharedRegion::from_raw(ptr, len) }.unwrap();
        Self { ptr, len, region }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr as *mut c_void, self.len);
        }
    }
}


/// Usage profile spread over the first thirty exact-fit classes plus one
/// larger class, so a 1% optimized share shards the hottest twenty and
/// leaves the rest on their primary lists.
pub fn hot_pattern() -> Pattern {
    let mut counts = vec![0u64; LINEAR_HASH_SIZE];
    for class in 1..=30 {
        counts[class] = 6000 / class as u64;
    }
    counts[128] = 20;
    Pattern::from_usage(&counts)
}

/// Configuration for an arena that gets warmed with [`hot_pattern`].
pub fn warmed_config(warm_up_percentage: u8) -> ArenaConfig {
    ArenaConfig {
        warm_up_percentage,
        optimized_bucket_percentage: 1,
        shards_per_bucket: 4,
        ..ArenaConfig::default()
    }
}
