//! Translation cache for a dynamic x86 binary translator.
//!
//! The cache owns every translated block produced by the code generator and answers the
//! dispatcher's "is there translated code for this guest PC?" question. It is made of:
//!
//! - a fixed-capacity [`BlockPool`] arena holding the blocks,
//! - an ordered [`Index`] (a right-threaded AVL tree) keyed by entry PC,
//! - a direct-mapped lookaside table in front of the index,
//! - an incremental sweeper that ages and evicts cold blocks,
//! - an invalidator reacting to writes into translated guest code (self-modifying code), and
//! - a linker patching direct jumps between blocks.
//!
//! Everything hangs off one [`TranslationCache`] value owned by the emulator thread.

mod block;
mod builder;
mod cache;
mod config;
mod error;
mod index;
mod invalidate;
mod linker;
mod lookaside;
pub mod patch;
mod pool;
mod protect;
mod stats;
mod sweeper;

pub use block::{
    BackRef, BlockFlags, BlockId, CodeBuffer, Edge, EdgeKind, EdgeState, InsnOffset,
    TranslationBlock,
};
pub use builder::{BlockBuilder, PendingBlock, PendingEdge};
pub use cache::TranslationCache;
pub use config::{SweepPolicy, TranslationCacheConfig};
pub use error::{CacheError, Result};
pub use index::{max_avl_height, Index, Iter, MAX_TREE_HEIGHT};
pub use pool::BlockPool;
pub use protect::{CodePageMap, CodeProtection, PAGE_SHIFT, PAGE_SIZE};
pub use stats::CacheStats;

/// 32-bit guest linear address.
pub type GuestAddr = u32;

/// Half-open span of guest bytes `[base, base + len)`.
///
/// Range arithmetic is done in `u64` so a range ending exactly at 4 GiB is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GuestRange {
    pub base: GuestAddr,
    pub len: u32,
}

impl GuestRange {
    #[inline]
    pub const fn new(base: GuestAddr, len: u32) -> Self {
        Self { base, len }
    }

    /// Range covering `[lo, hi)`; empty when `hi <= lo`.
    pub fn from_bounds(lo: u64, hi: u64) -> Self {
        let lo = lo.min(u64::from(u32::MAX));
        let len = hi.saturating_sub(lo).min(u64::from(u32::MAX));
        Self {
            base: lo as GuestAddr,
            len: len as u32,
        }
    }

    #[inline]
    pub fn start(&self) -> u64 {
        u64::from(self.base)
    }

    #[inline]
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn contains(&self, addr: GuestAddr) -> bool {
        let addr = u64::from(addr);
        addr >= self.start() && addr < self.end()
    }

    /// Strict half-open intersection with `[lo, hi)`.
    #[inline]
    pub fn intersects(&self, lo: u64, hi: u64) -> bool {
        self.start() < hi && lo < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::GuestRange;

    #[test]
    fn ranges_touching_at_an_edge_do_not_intersect() {
        let r = GuestRange::new(200, 50);
        assert!(r.intersects(180, 260));
        assert!(r.intersects(249, 250));
        assert!(!r.intersects(250, 300));
        assert!(!r.intersects(100, 200));
        assert!(!GuestRange::new(200, 0).intersects(0, 1000));
    }

    #[test]
    fn range_may_end_at_top_of_address_space() {
        let r = GuestRange::new(0xffff_f000, 0x1000);
        assert_eq!(r.end(), 1 << 32);
        assert!(r.contains(0xffff_ffff));
        assert_eq!(GuestRange::from_bounds(0xffff_f000, 1 << 32), r);
    }
}
