//! Direct jumps between translated blocks.
//!
//! A linked edge jumps straight into its target's code instead of returning to the dispatcher.
//! Every link is recorded twice: as [`EdgeState::Linked`] on the owner's edge and as a
//! [`BackRef`] on the target, so that either side can be torn down first.

use crate::block::{BackRef, BlockFlags, BlockId, Edge, EdgeKind, EdgeState};
use crate::cache::TranslationCache;
use crate::error::{CacheError, Result};
use crate::patch::{self, SiteForm};
use crate::protect::CodeProtection;
use crate::GuestAddr;

fn dangling(owner: GuestAddr, target: GuestAddr) -> CacheError {
    tracing::error!(owner, target, "dangling backreference");
    CacheError::DanglingBackref { owner, target }
}

fn corrupt(key: GuestAddr, reason: &'static str) -> CacheError {
    tracing::error!(key, reason, "corrupt block link");
    CacheError::CorruptLink { key, reason }
}

impl<P: CodeProtection> TranslationCache<P> {
    /// Link a freshly committed block in both directions.
    pub(crate) fn link_new(&mut self, id: BlockId) -> Result<()> {
        let Some(block) = self.index.block(id) else {
            return Ok(());
        };
        let key = block.key;
        let outgoing: Vec<(EdgeKind, GuestAddr)> =
            block.edges().map(|e| (e.kind, e.target)).collect();

        for (kind, target_pc) in outgoing {
            let target = if target_pc == key {
                Some(id)
            } else {
                self.index.find(target_pc)
            };
            if let Some(target) = target {
                if self.index.block(target).is_some_and(|b| b.alive) {
                    self.link_edge(id, kind, target)?;
                }
            }
        }

        // Blocks committed earlier that were waiting for this key.
        let waiting: Vec<(BlockId, EdgeKind)> = self
            .index
            .iter()
            .filter(|&(owner, block)| owner != id && block.alive)
            .flat_map(|(owner, block)| {
                block
                    .edges()
                    .filter(|e| e.target == key && !e.is_linked())
                    .map(move |e| (owner, e.kind))
            })
            .collect();
        for (owner, kind) in waiting {
            self.link_edge(owner, kind, id)?;
        }
        Ok(())
    }

    /// Patch `owner`'s `kind` edge into a jump to `target`'s entry.
    ///
    /// Returns `false` when the edge is already linked or the displacement does not fit.
    pub(crate) fn link_edge(
        &mut self,
        owner: BlockId,
        kind: EdgeKind,
        target: BlockId,
    ) -> Result<bool> {
        let Some(target_block) = self.index.block(target) else {
            return Ok(false);
        };
        let entry = target_block.entry();
        let sticky = target_block.flags & BlockFlags::STICKY;

        let Some(block) = self.index.block_mut(owner) else {
            return Ok(false);
        };
        let key = block.key;
        let Some(edge) = block.edges[kind.slot()] else {
            return Ok(false);
        };
        if edge.is_linked() {
            return Ok(false);
        }
        let base = block.code.host_addr();
        if !patch::write_jump(block.code.bytes_mut(), base, edge.site as usize, entry) {
            tracing::warn!(
                key,
                target = edge.target,
                "link target out of jump range, leaving edge unlinked"
            );
            return Ok(false);
        }
        block.edges[kind.slot()] = Some(Edge {
            state: EdgeState::Linked(target),
            ..edge
        });
        if owner == target {
            block.flags |= BlockFlags::SELF_LINKED;
        }

        let Some(target_block) = self.index.block_mut(target) else {
            return Err(dangling(key, edge.target));
        };
        target_block.backrefs.push(BackRef { from: owner, edge: kind });
        self.counters.links += 1;
        tracing::debug!(key, edge = %kind.tag(), target = edge.target, "linked block");

        if !sticky.is_empty() {
            self.propagate_flags(owner, sticky);
        }
        Ok(true)
    }

    /// OR `flags` into `start` and every block linked into it, transitively.
    fn propagate_flags(&mut self, start: BlockId, flags: BlockFlags) {
        let mut work = vec![start];
        while let Some(id) = work.pop() {
            let Some(block) = self.index.block_mut(id) else {
                continue;
            };
            if block.flags.contains(flags) {
                continue;
            }
            block.flags |= flags;
            work.extend(block.backrefs.iter().map(|br| br.from));
        }
    }

    /// Undo every link into and out of a block, restoring the unlinked exit forms.
    pub(crate) fn unlink_block(&mut self, id: BlockId) -> Result<()> {
        let Some(block) = self.index.block_mut(id) else {
            return Ok(());
        };
        let key = block.key;
        let incoming = std::mem::take(&mut block.backrefs);

        for br in incoming {
            let Some(owner) = self.index.block_mut(br.from) else {
                return Err(dangling(key, key));
            };
            let owner_key = owner.key;
            let Some(edge) = owner.edges[br.edge.slot()] else {
                return Err(dangling(owner_key, key));
            };
            if edge.state != EdgeState::Linked(id) || edge.target != key {
                return Err(dangling(owner_key, key));
            }
            if !patch::write_exit(owner.code.bytes_mut(), edge.site as usize, edge.target) {
                return Err(corrupt(owner_key, "patch site outside code buffer"));
            }
            owner.edges[br.edge.slot()] = Some(Edge {
                state: EdgeState::Unlinked,
                ..edge
            });
            if br.from == id {
                owner.flags.remove(BlockFlags::SELF_LINKED);
            }
            self.counters.unlinks += 1;
            tracing::debug!(owner = owner_key, target = key, "unlinked incoming edge");
        }

        let Some(block) = self.index.block(id) else {
            return Ok(());
        };
        let outgoing: Vec<(EdgeKind, BlockId, GuestAddr)> = block
            .edges()
            .filter_map(|e| match e.state {
                EdgeState::Linked(to) => Some((e.kind, to, e.target)),
                EdgeState::Unlinked => None,
            })
            .collect();

        for (kind, to, target_pc) in outgoing {
            let Some(target) = self.index.block_mut(to) else {
                return Err(dangling(key, target_pc));
            };
            let wanted = BackRef { from: id, edge: kind };
            let Some(pos) = target.backrefs.iter().position(|br| *br == wanted) else {
                return Err(dangling(key, target_pc));
            };
            target.backrefs.swap_remove(pos);

            let Some(block) = self.index.block_mut(id) else {
                return Ok(());
            };
            let Some(edge) = block.edges[kind.slot()] else {
                return Err(corrupt(key, "linked edge vanished"));
            };
            if !patch::write_exit(block.code.bytes_mut(), edge.site as usize, edge.target) {
                return Err(corrupt(key, "patch site outside code buffer"));
            }
            block.edges[kind.slot()] = Some(Edge {
                state: EdgeState::Unlinked,
                ..edge
            });
            self.counters.unlinks += 1;
        }
        Ok(())
    }

    /// Cross-check every edge against its backreference and the patched bytes.
    pub fn check_links(&self) -> Result<()> {
        for (id, block) in self.index.iter() {
            let key = block.key;
            for edge in block.edges() {
                match edge.state {
                    EdgeState::Linked(to) => {
                        if !block.alive {
                            return Err(corrupt(key, "dead block still linked"));
                        }
                        let Some(target) = self.index.block(to) else {
                            return Err(dangling(key, edge.target));
                        };
                        let wanted = BackRef { from: id, edge: edge.kind };
                        let matching = target.backrefs.iter().filter(|br| **br == wanted).count();
                        if target.key != edge.target || matching != 1 {
                            return Err(dangling(key, edge.target));
                        }
                        let landed = patch::jump_target(
                            block.code.bytes(),
                            block.code.host_addr(),
                            edge.site as usize,
                        );
                        if landed != Some(target.entry()) {
                            return Err(corrupt(key, "linked edge does not jump to its target"));
                        }
                    }
                    // Broken blocks may have had their exits overwritten by the stub.
                    EdgeState::Unlinked if block.alive => {
                        let form = patch::read_site(block.code.bytes(), edge.site as usize);
                        if form != SiteForm::Exit(edge.target) {
                            return Err(corrupt(key, "unlinked edge lost its exit form"));
                        }
                    }
                    EdgeState::Unlinked => {}
                }
            }
            for br in block.backrefs() {
                let Some(owner) = self.index.block(br.from) else {
                    return Err(dangling(key, key));
                };
                let linked_here = owner
                    .edge(br.edge)
                    .is_some_and(|e| e.state == EdgeState::Linked(id));
                if !linked_here {
                    return Err(dangling(owner.key, key));
                }
            }
        }
        Ok(())
    }
}
