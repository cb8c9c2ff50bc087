use crate::block::{BlockId, TranslationBlock};
use crate::error::{CacheError, Result};
use crate::index::Links;

/// A live pool slot: tree linkage plus the block payload.
#[derive(Debug, Default)]
pub(crate) struct Node {
    pub(crate) links: Links,
    pub(crate) block: TranslationBlock,
}

#[derive(Debug)]
enum Slot {
    /// Unused; threads the free list.
    Free { next: Option<BlockId> },
    Live(Node),
}

/// Fixed-capacity arena of block slots.
///
/// Slots never move, so a [`BlockId`] stays valid for as long as its block is live. Unused slots
/// form a LIFO free list threaded through the slots themselves.
#[derive(Debug)]
pub struct BlockPool {
    slots: Vec<Slot>,
    free_head: Option<BlockId>,
    live: usize,
}

impl BlockPool {
    pub fn new(capacity: usize) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(capacity),
            free_head: None,
            live: 0,
        };
        pool.slots.resize_with(capacity, || Slot::Free { next: None });
        pool.rebuild_free_list();
        pool
    }

    fn rebuild_free_list(&mut self) {
        let capacity = self.slots.len();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let next = (i + 1 < capacity).then(|| BlockId(i as u32 + 1));
            *slot = Slot::Free { next };
        }
        self.free_head = (capacity > 0).then_some(BlockId(0));
        self.live = 0;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Pop a slot off the free list and initialise it with an empty block.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let Some(id) = self.free_head else {
            tracing::error!(capacity = self.capacity(), "translation block pool exhausted");
            return Err(CacheError::PoolExhausted {
                capacity: self.capacity(),
            });
        };
        let slot = &mut self.slots[id.index()];
        let Slot::Free { next } = *slot else {
            unreachable!("free list head {id:?} is a live slot");
        };
        self.free_head = next;
        *slot = Slot::Live(Node::default());
        self.live += 1;
        Ok(id)
    }

    /// Clear a slot, dropping its code buffer, and push it onto the free list.
    ///
    /// Releasing a slot that is already free is a no-op.
    pub fn release(&mut self, id: BlockId) {
        let slot = &mut self.slots[id.index()];
        if matches!(slot, Slot::Free { .. }) {
            return;
        }
        *slot = Slot::Free {
            next: self.free_head,
        };
        self.free_head = Some(id);
        self.live -= 1;
    }

    /// Return every slot to the free list, dropping all blocks.
    pub fn reset(&mut self) {
        self.rebuild_free_list();
    }

    pub fn block(&self, id: BlockId) -> Option<&TranslationBlock> {
        match self.slots.get(id.index())? {
            Slot::Live(node) => Some(&node.block),
            Slot::Free { .. } => None,
        }
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut TranslationBlock> {
        match self.slots.get_mut(id.index())? {
            Slot::Live(node) => Some(&mut node.block),
            Slot::Free { .. } => None,
        }
    }

    /// Live node for an id the tree still references.
    ///
    /// Panics if the slot was released: the index never keeps ids of released slots.
    #[inline]
    pub(crate) fn node(&self, id: BlockId) -> &Node {
        match &self.slots[id.index()] {
            Slot::Live(node) => node,
            Slot::Free { .. } => panic!("block slot {} used after release", id.0),
        }
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, id: BlockId) -> &mut Node {
        match &mut self.slots[id.index()] {
            Slot::Live(node) => node,
            Slot::Free { .. } => panic!("block slot {} used after release", id.0),
        }
    }

    /// Ids of all live slots in slot order.
    pub fn live_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(i, _)| BlockId(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_until_exhausted_then_recycle() {
        let mut pool = BlockPool::new(3);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert_eq!(
            pool.allocate(),
            Err(CacheError::PoolExhausted { capacity: 3 })
        );

        pool.release(b);
        assert_eq!(pool.live_count(), 2);
        assert!(pool.block(b).is_none());
        // LIFO: the most recently released slot comes back first.
        assert_eq!(pool.allocate().unwrap(), b);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut pool = BlockPool::new(2);
        let a = pool.allocate().unwrap();
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.allocate().unwrap(), a);
        assert_eq!(pool.allocate().unwrap().index(), 1);
    }

    #[test]
    fn reset_frees_everything() {
        let mut pool = BlockPool::new(4);
        for _ in 0..4 {
            pool.allocate().unwrap();
        }
        pool.reset();
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.live_ids().count(), 0);
        assert_eq!(pool.allocate().unwrap().index(), 0);
    }
}
