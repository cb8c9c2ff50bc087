use crate::block::BlockId;
use crate::GuestAddr;

/// Direct-mapped table in front of the index, keyed by the low bits of the guest PC.
///
/// Entries are hints only: the cache re-checks that the named slot is live, alive and still
/// holds the same key before trusting one.
#[derive(Debug)]
pub(crate) struct Lookaside {
    entries: Box<[Option<(GuestAddr, BlockId)>]>,
    mask: u32,
}

impl Lookaside {
    pub(crate) fn new(bits: u32) -> Self {
        let len = 1usize << bits;
        Self {
            entries: vec![None; len].into_boxed_slice(),
            mask: (len - 1) as u32,
        }
    }

    #[inline]
    fn slot(&self, key: GuestAddr) -> usize {
        (key & self.mask) as usize
    }

    #[inline]
    pub(crate) fn get(&self, key: GuestAddr) -> Option<BlockId> {
        match self.entries[self.slot(key)] {
            Some((k, id)) if k == key => Some(id),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn insert(&mut self, key: GuestAddr, id: BlockId) {
        let slot = self.slot(key);
        self.entries[slot] = Some((key, id));
    }

    /// Drop the entry for `key`, if the slot still holds it.
    #[inline]
    pub(crate) fn forget(&mut self, key: GuestAddr) {
        let slot = self.slot(key);
        if matches!(self.entries[slot], Some((k, _)) if k == key) {
            self.entries[slot] = None;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.fill(None);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colliding_keys_evict_each_other() {
        let mut table = Lookaside::new(4);
        assert_eq!(table.len(), 16);
        table.insert(0x103, BlockId(1));
        assert_eq!(table.get(0x103), Some(BlockId(1)));

        table.insert(0x213, BlockId(2));
        assert_eq!(table.get(0x103), None);
        assert_eq!(table.get(0x213), Some(BlockId(2)));

        table.forget(0x103);
        assert_eq!(table.get(0x213), Some(BlockId(2)));
        table.forget(0x213);
        assert_eq!(table.get(0x213), None);
    }
}
