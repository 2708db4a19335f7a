//! Runtime counters

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DynarecStats {
    pub created: AtomicU64,
    pub empty: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub published: AtomicU64,
    pub preloaded: AtomicU64,
    /// Cache hits that differ from a fresh compile
    pub cache_diffs: AtomicU64,
    pub invalidated: AtomicU64,
    pub freed: AtomicU64,
    pub aborted: AtomicU64,
}

/// Point-in-time copy of [`DynarecStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub created: u64,
    pub empty: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub published: u64,
    pub preloaded: u64,
    pub cache_diffs: u64,
    pub invalidated: u64,
    pub freed: u64,
    pub aborted: u64,
}

impl DynarecStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            created: get(&self.created),
            empty: get(&self.empty),
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            published: get(&self.published),
            preloaded: get(&self.preloaded),
            cache_diffs: get(&self.cache_diffs),
            invalidated: get(&self.invalidated),
            freed: get(&self.freed),
            aborted: get(&self.aborted),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created={} empty={} hits={} misses={} published={} preloaded={} diffs={} invalidated={} freed={} aborted={}",
            self.created,
            self.empty,
            self.cache_hits,
            self.cache_misses,
            self.published,
            self.preloaded,
            self.cache_diffs,
            self.invalidated,
            self.freed,
            self.aborted
        )
    }
}
