//! Eviction of blocks whose guest source was overwritten.

use crate::block::BlockId;
use crate::cache::TranslationCache;
use crate::error::{CacheError, Result};
use crate::patch;
use crate::protect::{CodeProtection, PAGE_SIZE};
use crate::{GuestAddr, GuestRange};

impl<P: CodeProtection> TranslationCache<P> {
    /// Evict every block compiled from bytes in `range`.
    ///
    /// `fault_addr` is the host address of the translated instruction performing the write, if
    /// the write came from translated code. A block containing it cannot be freed while it is
    /// executing, so it is broken instead: a forced exit is written over its remaining code and
    /// it stays in the index, dead, until the sweeper or a later invalidation reclaims it.
    ///
    /// Returns the number of blocks evicted. A block that cannot be broken (no instruction
    /// boundary with room for the stub after the fault) fails the call with
    /// [`CacheError::BreakFailed`], but only after every other overlapping block was evicted.
    pub fn invalidate(&mut self, range: GuestRange, fault_addr: Option<u64>) -> Result<usize> {
        if range.is_empty() {
            return Ok(0);
        }
        let lo = range.start();
        let hi = range.end();
        let walk_start = lo.saturating_sub(self.fwd_span);
        let walk_stop = hi.saturating_add(self.back_span);

        let mut evicted = 0;
        let mut break_failure = None;
        let mut cur = self.index.find_at_or_before(walk_start as GuestAddr);
        while let Some(id) = cur {
            let Some(block) = self.index.block(id) else {
                break;
            };
            if u64::from(block.key) >= walk_stop {
                break;
            }
            let next = self.index.successor(id);
            let executing = fault_addr.is_some_and(|addr| block.code.contains_host_addr(addr));

            if !block.alive {
                if !executing {
                    self.remove(id)?;
                }
            } else if block.source.intersects(lo, hi) {
                let key = block.key;
                tracing::debug!(
                    key,
                    lo = range.base,
                    len = range.len,
                    "invalidating block"
                );
                self.kill(id)?;
                evicted += 1;
                self.counters.invalidated += 1;
                self.controller.pending += 1;
                match fault_addr {
                    Some(addr) if executing => {
                        // The rest of the range still has to go; report once the walk is done.
                        if let Err(err) = self.break_block(id, addr) {
                            break_failure.get_or_insert(err);
                        }
                    }
                    _ => self.remove(id)?,
                }
            }
            cur = next;
        }

        if let Some(err) = break_failure {
            return Err(err);
        }
        if self.protection.is_protected(range) {
            tracing::error!(
                lo = range.base,
                len = range.len,
                "code still protected after invalidation"
            );
            return Err(CacheError::StaleProtection {
                lo: range.base,
                hi: hi.min(u64::from(GuestAddr::MAX)) as GuestAddr,
            });
        }
        Ok(evicted)
    }

    /// Overwrite a block's code at the first instruction at or after `fault_addr` with an exit
    /// to the matching guest PC.
    fn break_block(&mut self, id: BlockId, fault_addr: u64) -> Result<()> {
        let Some(block) = self.index.block_mut(id) else {
            return Ok(());
        };
        let key = block.key;
        let offset = fault_addr - block.code.host_addr();
        let resume = block
            .code
            .table()
            .iter()
            .find(|e| u64::from(e.gen_offset) >= offset)
            .copied();
        let Some(resume) = resume else {
            tracing::error!(key, fault_addr, "no instruction boundary after fault");
            return Err(CacheError::BreakFailed {
                key,
                host_addr: fault_addr,
            });
        };
        let pc = key.wrapping_add(resume.source_offset);
        if !patch::write_exit_stub(block.code.bytes_mut(), resume.gen_offset as usize, pc) {
            tracing::error!(key, fault_addr, "no room for exit stub");
            return Err(CacheError::BreakFailed {
                key,
                host_addr: fault_addr,
            });
        }
        self.counters.broken += 1;
        tracing::debug!(key, pc, offset = resume.gen_offset, "broke executing block");
        Ok(())
    }

    /// Guest write of `len` bytes at `addr`.
    ///
    /// Cheap when the bytes back no code. Otherwise evicts exactly the blocks compiled from the
    /// written bytes, breaking the one at `fault_addr` if execution is inside it.
    pub fn invalidate_write(
        &mut self,
        addr: GuestAddr,
        len: u32,
        fault_addr: Option<u64>,
    ) -> Result<usize> {
        let range = GuestRange::new(addr, len);
        if !self.protection.page_protected(range) || !self.protection.is_protected(range) {
            return Ok(0);
        }
        self.invalidate(range, fault_addr)
    }

    /// Evict every block touching the pages spanned by `[addr, addr + len)`.
    ///
    /// Used before the protection of those pages is lost some other way (DMA, a mapping change).
    pub fn invalidate_full(&mut self, addr: GuestAddr, len: u32) -> Result<usize> {
        let start = u64::from(addr) & !(PAGE_SIZE - 1);
        let end = (u64::from(addr) + u64::from(len) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        self.invalidate(GuestRange::from_bounds(start, end), None)
    }

    /// [`TranslationCache::invalidate_full`] for the page holding `addr`.
    ///
    /// Returns whether the page was protected beforehand.
    pub fn invalidate_page_full(&mut self, addr: GuestAddr) -> Result<bool> {
        let page = GuestRange::new(addr & !(PAGE_SIZE as u32 - 1), PAGE_SIZE as u32);
        let was_protected = self.protection.page_protected(page);
        self.invalidate_full(page.base, page.len)?;
        Ok(was_protected)
    }
}
