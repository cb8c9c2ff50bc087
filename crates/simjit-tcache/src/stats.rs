use serde::Serialize;

/// Point-in-time counters of a [`crate::TranslationCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Alive blocks: the ones lookup can return.
    pub live: usize,
    /// Blocks in the index, dead ones awaiting reclaim included.
    pub indexed: usize,
    pub capacity: usize,
    pub peak_live: usize,
    /// Deepest index descent seen.
    pub max_depth: usize,

    pub committed: u64,
    /// Commits that replaced a block with the same key.
    pub replaced: u64,
    pub fast_hits: u64,
    pub slow_hits: u64,
    pub misses: u64,

    /// Blocks reclaimed by the sweeper.
    pub swept: u64,
    /// Blocks evicted by invalidation.
    pub invalidated: u64,
    /// Blocks patched with a forced exit because execution was inside them.
    pub broken: u64,

    pub links: u64,
    pub unlinks: u64,

    pub sweeps_per_commit: u32,
    pub clean_freq: u32,
}
