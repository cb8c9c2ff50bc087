use crate::error::{CacheError, Result};

/// Tuning for the incremental sweeper and its adaptive controller.
///
/// None of these values affect correctness; they trade cleanup work against steady-state tree
/// size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepPolicy {
    /// `life` a block gets on commit and on every hit.
    pub initial_life: i32,
    /// Amount subtracted from `life` each time the sweeper visits a block.
    pub decay: i32,
    /// Number of `sample()` ticks averaged by the controller.
    pub window: usize,
    /// Miss-driven sweeping runs every `base_clean_freq - log2(avg commits)` misses (at least 1).
    pub base_clean_freq: u32,
    /// Live-block count above which `commit` sweeps before inserting.
    pub node_limit: usize,
    /// Live-block count above which lookup misses may trigger sweeping.
    pub miss_sweep_threshold: usize,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            initial_life: 16,
            decay: 1,
            window: 4,
            base_clean_freq: 8,
            node_limit: 10_000,
            miss_sweep_threshold: 500,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationCacheConfig {
    /// Number of block slots in the pool. Running out is fatal, so this should sit well above
    /// [`SweepPolicy::node_limit`].
    pub pool_capacity: usize,
    /// log2 of the number of lookaside entries.
    pub lookaside_bits: u32,
    /// Maximum instructions the block builder accepts per block.
    pub max_block_instructions: usize,
    /// Patch direct jumps between blocks on commit.
    pub enable_linking: bool,
    pub sweep: SweepPolicy,
}

impl Default for TranslationCacheConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 32 * 1024,
            lookaside_bits: 12,
            max_block_instructions: 256,
            enable_linking: true,
            sweep: SweepPolicy::default(),
        }
    }
}

impl TranslationCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(CacheError::InvalidConfig("pool_capacity must be non-zero"));
        }
        if self.pool_capacity > u32::MAX as usize {
            return Err(CacheError::InvalidConfig("pool_capacity must fit in u32"));
        }
        if self.lookaside_bits > 20 {
            return Err(CacheError::InvalidConfig("lookaside_bits must be <= 20"));
        }
        if self.max_block_instructions == 0 {
            return Err(CacheError::InvalidConfig(
                "max_block_instructions must be non-zero",
            ));
        }
        if self.sweep.initial_life <= 0 {
            return Err(CacheError::InvalidConfig("sweep.initial_life must be positive"));
        }
        if self.sweep.decay <= 0 {
            return Err(CacheError::InvalidConfig("sweep.decay must be positive"));
        }
        if self.sweep.window == 0 {
            return Err(CacheError::InvalidConfig("sweep.window must be non-zero"));
        }
        Ok(())
    }
}
