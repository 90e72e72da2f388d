//! Allocation call-site registry for debug arenas.
//!
//! Fragments only store a 64-bit hash of the caller's location, which is
//! meaningful in every process mapping the arena. Each process keeps its own
//! table from hash back to `file:line:column` for the locations it has seen.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub(crate) struct SiteRegistry {
    sites: Mutex<HashMap<u64, &'static Location<'static>>>,
}

impl SiteRegistry {
    /// Remembers `location` and returns its hash.
    pub(crate) fn record(&self, location: &'static Location<'static>) -> u64 {
        let id = site_id(location);
        self.sites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(location);
        id
    }

    /// Human-readable location for a site hash.
    pub(crate) fn describe(&self, id: u64) -> String {
        match self.sites.lock().unwrap_or_else(PoisonError::into_inner).get(&id) {
            Some(loc) => format!("{}:{}:{}", loc.file(), loc.line(), loc.column()),
            None => format!("<site {id:016x}>"),
        }
    }
}

/// Stable within one build; never zero, which marks "no site".
fn site_id(location: &Location<'_>) -> u64 {
    let mut hasher = DefaultHasher::new();
    location.file().hash(&mut hasher);
    location.line().hash(&mut hasher);
    location.column().hash(&mut hasher);
    hasher.finish().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn test_record_and_describe() {
        let registry = SiteRegistry::default();
        let loc = here();
        let id = registry.record(loc);
        assert_ne!(id, 0);
        assert_eq!(registry.record(loc), id);
        assert!(registry.describe(id).contains("sites.rs"));
        assert!(registry.describe(id ^ 1).starts_with("<site"));
    }

    #[test]
    fn test_distinct_lines_hash_differently() {
        let a = here();
        let b = here();
        assert_ne!(site_id(a), site_id(b));
    }
}
