use std::fmt::Write as _;

use crate::block::{BlockId, CodeBuffer, Edge, EdgeState, TranslationBlock};
use crate::builder::PendingBlock;
use crate::config::TranslationCacheConfig;
use crate::error::{CacheError, Result};
use crate::index::Index;
use crate::lookaside::Lookaside;
use crate::patch;
use crate::protect::{CodePageMap, CodeProtection};
use crate::stats::CacheStats;
use crate::sweeper::SweepController;
use crate::{GuestAddr, GuestRange};

/// The translation cache: owns every translated block and all the structures finding,
/// linking, aging and invalidating them.
///
/// Single-owner and single-threaded. Every operation runs to completion; `&mut self` keeps
/// protection callbacks from re-entering a commit or lookup half-way through.
pub struct TranslationCache<P: CodeProtection = CodePageMap> {
    pub(crate) config: TranslationCacheConfig,
    pub(crate) index: Index,
    pub(crate) lookaside: Lookaside,
    pub(crate) protection: P,
    pub(crate) controller: SweepController,
    pub(crate) counters: CacheStats,
    /// Number of alive blocks in the index.
    pub(crate) alive: usize,
    /// Widest `key - source.base` of any committed block.
    pub(crate) back_span: u64,
    /// Widest `source.end - key` of any committed block.
    pub(crate) fwd_span: u64,
}

impl TranslationCache<CodePageMap> {
    pub fn new(config: TranslationCacheConfig) -> Result<Self> {
        Self::with_protection(config, CodePageMap::new())
    }
}

impl<P: CodeProtection> TranslationCache<P> {
    pub fn with_protection(config: TranslationCacheConfig, protection: P) -> Result<Self> {
        if let Err(err) = config.validate() {
            tracing::error!(%err, "refusing translation cache config");
            return Err(err);
        }
        Ok(Self {
            index: Index::new(config.pool_capacity),
            lookaside: Lookaside::new(config.lookaside_bits),
            controller: SweepController::new(&config.sweep),
            counters: CacheStats::default(),
            alive: 0,
            back_span: 0,
            fwd_span: 0,
            protection,
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &TranslationCacheConfig {
        &self.config
    }

    #[inline]
    pub fn protection(&self) -> &P {
        &self.protection
    }

    /// Ordered view of every block, dead ones awaiting reclaim included.
    #[inline]
    pub fn index(&self) -> &Index {
        &self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> Option<&TranslationBlock> {
        self.index.block(id)
    }

    /// Block for `key` regardless of lookaside state or liveness; no life refresh.
    pub fn find(&self, key: GuestAddr) -> Option<BlockId> {
        self.index.find(key)
    }

    /// Host entry address of a block.
    pub fn entry(&self, id: BlockId) -> Option<u64> {
        self.index.block(id).map(TranslationBlock::entry)
    }

    /// Insert a freshly generated block, replacing any block with the same key.
    ///
    /// The record is checked before anything is touched. On success its contents are moved
    /// into the cache and `pending` is left empty for the next build.
    pub fn commit(&mut self, pending: &mut PendingBlock) -> Result<BlockId> {
        pending.check()?;

        if self.index.len() > self.config.sweep.node_limit {
            self.sweep(self.controller.sweeps_per_commit)?;
        }

        let key = pending.key;
        let (id, found) = self.index.probe(key)?;
        if found {
            tracing::debug!(key, "replacing block with recompiled code");
            let alive = self.index.block(id).is_some_and(TranslationBlock::is_alive);
            if alive {
                self.kill(id)?;
            }
            self.counters.replaced += 1;
        }

        let record = std::mem::take(pending);
        let mut code = record.code;
        let mut edges = [None; 2];
        for pe in &record.edges {
            // Sites were bounds-checked above; make sure they start out unlinked.
            patch::write_exit(&mut code, pe.site as usize, pe.target);
            edges[pe.kind.slot()] = Some(Edge {
                kind: pe.kind,
                site: pe.site,
                target: pe.target,
                state: EdgeState::Unlinked,
            });
        }
        let source = record.source;
        let code = CodeBuffer::new(code, record.table);
        let code_len = code.bytes().len();

        let initial_life = self.config.sweep.initial_life;
        let Some(block) = self.index.block_mut(id) else {
            unreachable!("probe returned a released slot");
        };
        block.source = source;
        block.code = code;
        block.life = initial_life;
        block.alive = true;
        block.flags = record.flags;
        block.edges = edges;
        debug_assert!(block.backrefs.is_empty());

        self.protection.protect(source);
        self.back_span = self.back_span.max(u64::from(key) - source.start());
        self.fwd_span = self.fwd_span.max(source.end() - u64::from(key));
        self.lookaside.insert(key, id);

        self.controller.commits_since_sample += 1;
        self.counters.committed += 1;
        self.alive += 1;
        self.counters.peak_live = self.counters.peak_live.max(self.alive);
        tracing::debug!(
            key,
            base = source.base,
            len = source.len,
            code_len,
            live = self.index.len(),
            "committed block"
        );

        if self.config.enable_linking {
            self.link_new(id)?;
        }
        Ok(id)
    }

    /// Translated block for guest PC `key`, refreshing its life.
    ///
    /// `Ok(None)` is an ordinary miss. Misses may run sweeper steps, which is where the error
    /// case comes from.
    pub fn lookup(&mut self, key: GuestAddr) -> Result<Option<BlockId>> {
        let initial_life = self.config.sweep.initial_life;

        if let Some(id) = self.lookaside.get(key) {
            if let Some(block) = self.index.block_mut(id) {
                if block.alive && block.key == key {
                    block.life = initial_life;
                    self.counters.fast_hits += 1;
                    tracing::trace!(key, "lookaside hit");
                    return Ok(Some(id));
                }
            }
        }

        if self.protection.is_protected(GuestRange::new(key, 1)) {
            if let Some(id) = self.index.find(key) {
                if let Some(block) = self.index.block_mut(id) {
                    if block.alive {
                        block.life = initial_life;
                        self.lookaside.insert(key, id);
                        self.counters.slow_hits += 1;
                        tracing::trace!(key, "index hit");
                        return Ok(Some(id));
                    }
                }
            }
        }

        self.counters.misses += 1;
        tracing::trace!(key, "translation cache miss");
        let steps = self
            .controller
            .on_miss(self.index.len(), self.config.sweep.miss_sweep_threshold);
        self.sweep(steps)?;
        Ok(None)
    }

    /// Mark a block dead: drop its code marks, forget it in the lookaside and undo every link
    /// into and out of it. The block stays in the index.
    pub(crate) fn kill(&mut self, id: BlockId) -> Result<()> {
        let Some(block) = self.index.block_mut(id) else {
            return Ok(());
        };
        if !block.alive {
            return Ok(());
        }
        block.alive = false;
        self.alive -= 1;
        let key = block.key;
        let source = block.source;
        self.protection.unprotect(source);
        self.lookaside.forget(key);
        self.unlink_block(id)
    }

    /// Delete a dead block from the index and release its slot.
    pub(crate) fn remove(&mut self, id: BlockId) -> Result<()> {
        let Some(block) = self.index.block(id) else {
            return Ok(());
        };
        let key = block.key;
        if block.alive || !block.backrefs.is_empty() {
            tracing::error!(key, "removing a block that is still reachable");
            return Err(CacheError::CorruptLink {
                key,
                reason: "block removed while still alive or linked",
            });
        }
        self.lookaside.forget(key);
        self.index.delete(key)?;
        tracing::debug!(key, live = self.index.len(), "evicted block");
        Ok(())
    }

    /// Guest PC of the instruction whose translated code contains host address `addr`.
    pub fn find_source_pc(&self, addr: u64) -> Option<GuestAddr> {
        self.index
            .iter()
            .find(|(_, block)| block.code.contains_host_addr(addr))
            .and_then(|(_, block)| block.source_pc_at(addr))
    }

    /// Block whose translated code contains host address `addr`.
    pub fn block_at_host_addr(&self, addr: u64) -> Option<BlockId> {
        self.index
            .iter()
            .find(|(_, block)| block.code.contains_host_addr(addr))
            .map(|(id, _)| id)
    }

    /// Drop every block, releasing all code marks.
    pub fn reset(&mut self) {
        tracing::debug!(live = self.index.len(), "resetting translation cache");
        self.release_protection();
        self.index.reset();
        self.lookaside.clear();
        self.controller.reset();
        self.counters = CacheStats::default();
        self.alive = 0;
        self.back_span = 0;
        self.fwd_span = 0;
    }

    fn release_protection(&mut self) {
        let ranges: Vec<GuestRange> = self
            .index
            .iter()
            .filter(|(_, block)| block.alive)
            .map(|(_, block)| block.source)
            .collect();
        for range in ranges {
            self.protection.unprotect(range);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            live: self.alive,
            indexed: self.index.len(),
            capacity: self.index.capacity(),
            max_depth: self.index.max_depth(),
            sweeps_per_commit: self.controller.sweeps_per_commit,
            clean_freq: self.controller.clean_freq,
            ..self.counters
        }
    }

    /// Human-readable listing of every block in key order.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "translation cache: {} blocks, height {}",
            self.index.len(),
            self.index.height()
        );
        for (id, block) in self.index.iter() {
            let src = block.source;
            let _ = write!(
                out,
                "{:5} {:#010x} [{:#010x}..{:#010x}) life={:<3} {} {:?} code={}B",
                id.index(),
                block.key,
                src.start(),
                src.end(),
                block.life,
                if block.alive { "alive" } else { "dead " },
                block.flags,
                block.code.bytes().len(),
            );
            for edge in block.edges() {
                match edge.state {
                    EdgeState::Unlinked => {
                        let _ = write!(out, " {}:{:#010x}", edge.kind.tag(), edge.target);
                    }
                    EdgeState::Linked(to) => {
                        let _ = write!(
                            out,
                            " {}:{:#010x}->#{}",
                            edge.kind.tag(),
                            edge.target,
                            to.index()
                        );
                    }
                }
            }
            for br in block.backrefs() {
                let _ = write!(out, " <-#{}{}", br.from.index(), br.edge.tag());
            }
            out.push('\n');
        }
        out
    }
}

impl<P: CodeProtection> Drop for TranslationCache<P> {
    fn drop(&mut self) {
        self.release_protection();
    }
}

impl<P: CodeProtection> std::fmt::Debug for TranslationCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
