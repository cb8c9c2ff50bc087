use crate::block::{BlockFlags, EdgeKind, InsnOffset};
use crate::error::{CacheError, Result};
use crate::{GuestAddr, GuestRange};

/// Outgoing edge of a block that has not been committed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEdge {
    pub kind: EdgeKind,
    /// Offset of the exit sequence's imm32 in the code buffer.
    pub site: u32,
    pub target: GuestAddr,
}

/// Build record handed from the code generator to [`crate::TranslationCache::commit`].
///
/// Commit moves everything out of the record, leaving it empty for the next block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingBlock {
    pub key: GuestAddr,
    pub source: GuestRange,
    pub code: Vec<u8>,
    /// One entry per source instruction plus the end sentinel.
    pub table: Vec<InsnOffset>,
    pub flags: BlockFlags,
    pub edges: Vec<PendingEdge>,
}

impl PendingBlock {
    pub fn is_empty(&self) -> bool {
        self.table.is_empty() && self.code.is_empty()
    }

    /// Reject malformed records before the cache touches any state.
    pub(crate) fn check(&self) -> Result<()> {
        let key = self.key;
        let fail = |reason: &'static str| -> Result<()> {
            tracing::error!(key, reason, "rejecting build record");
            Err(CacheError::InvalidBuild { key, reason })
        };

        if self.table.len() < 2 {
            return fail("offset table needs an instruction and the end sentinel");
        }
        if !self.source.contains(key) {
            return fail("source range does not contain the block key");
        }
        let code_len = self.code.len();
        let mut prev = 0u32;
        for entry in &self.table {
            if entry.gen_offset < prev {
                return fail("offset table is not ordered");
            }
            if entry.gen_offset as usize > code_len {
                return fail("offset table points past the code buffer");
            }
            prev = entry.gen_offset;
        }
        if self.edges.len() > 2 {
            return fail("more than two outgoing edges");
        }
        if let [a, b] = self.edges.as_slice() {
            if a.kind == b.kind {
                return fail("duplicate edge kind");
            }
        }
        for edge in &self.edges {
            let site = edge.site as usize;
            if site == 0 || site + 4 > code_len {
                return fail("edge patch site outside the code buffer");
            }
        }
        Ok(())
    }
}

/// Accumulates per-instruction metadata while the generator translates a block.
#[derive(Debug)]
pub struct BlockBuilder {
    max_instructions: usize,
    key: Option<GuestAddr>,
    table: Vec<InsnOffset>,
    flags: BlockFlags,
    code_end: u32,
    last_inhibits: bool,
    prev_inhibits: bool,
}

impl BlockBuilder {
    pub fn new(max_instructions: usize) -> Self {
        Self {
            max_instructions,
            key: None,
            table: Vec::with_capacity(max_instructions + 1),
            flags: BlockFlags::empty(),
            code_end: 0,
            last_inhibits: false,
            prev_inhibits: false,
        }
    }

    fn clear(&mut self) {
        self.key = None;
        self.table.clear();
        self.flags = BlockFlags::empty();
        self.code_end = 0;
        self.last_inhibits = false;
        self.prev_inhibits = false;
    }

    /// Start a new block at guest PC `pc`, discarding anything pushed so far.
    pub fn begin(&mut self, pc: GuestAddr) {
        self.clear();
        self.key = Some(pc);
    }

    #[inline]
    pub fn key(&self) -> Option<GuestAddr> {
        self.key
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.table.len() >= self.max_instructions
    }

    /// Record one translated instruction.
    ///
    /// Fails with [`CacheError::BuilderFull`] once the block holds the maximum number of
    /// instructions; the generator should then close the block and start a new one at `pc`.
    pub fn push(
        &mut self,
        pc: GuestAddr,
        gen_offset: u32,
        gen_len: u32,
        flags: BlockFlags,
    ) -> Result<()> {
        let Some(key) = self.key else {
            return Err(CacheError::InvalidBuild {
                key: pc,
                reason: "instruction pushed before begin",
            });
        };
        if self.is_full() {
            tracing::trace!(key, max = self.max_instructions, "block builder full");
            return Err(CacheError::BuilderFull {
                max: self.max_instructions,
            });
        }
        if pc < key {
            return Err(CacheError::InvalidBuild {
                key,
                reason: "instruction before block entry",
            });
        }
        if gen_offset < self.code_end {
            return Err(CacheError::InvalidBuild {
                key,
                reason: "generated code offsets went backwards",
            });
        }

        self.table.push(InsnOffset {
            source_offset: pc - key,
            gen_offset,
        });
        self.code_end = gen_offset.saturating_add(gen_len);

        // Only an inhibiting last instruction matters; two in a row cancel out.
        self.prev_inhibits = self.last_inhibits;
        self.last_inhibits = flags.contains(BlockFlags::INHIBIT_INTERRUPTS);
        self.flags |= flags - BlockFlags::INHIBIT_INTERRUPTS;
        Ok(())
    }

    /// Close the block and produce its build record, resetting the builder.
    ///
    /// `lo..hi` is the guest range the decoder read; the record's source range also covers the
    /// block key and `next_pc` (the PC following the last instruction).
    pub fn finish(
        &mut self,
        code: Vec<u8>,
        next_pc: GuestAddr,
        lo: GuestAddr,
        hi: GuestAddr,
        edges: Vec<PendingEdge>,
    ) -> Result<PendingBlock> {
        let Some(key) = self.key else {
            return Err(CacheError::InvalidBuild {
                key: next_pc,
                reason: "finish without begin",
            });
        };
        if self.table.is_empty() {
            return Err(CacheError::InvalidBuild {
                key,
                reason: "empty block",
            });
        }
        if next_pc < key {
            return Err(CacheError::InvalidBuild {
                key,
                reason: "next pc before block entry",
            });
        }

        let mut table = std::mem::take(&mut self.table);
        table.push(InsnOffset {
            source_offset: next_pc - key,
            gen_offset: self.code_end,
        });
        self.table = Vec::with_capacity(self.max_instructions + 1);

        let mut flags = self.flags;
        if self.last_inhibits && !self.prev_inhibits {
            flags |= BlockFlags::INHIBIT_INTERRUPTS;
        }
        let source = GuestRange::from_bounds(
            u64::from(lo.min(key)),
            u64::from(hi.max(next_pc)),
        );
        self.clear();

        Ok(PendingBlock {
            key,
            source,
            code,
            table,
            flags,
            edges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_table_with_sentinel() {
        let mut b = BlockBuilder::new(8);
        b.begin(0x1000);
        b.push(0x1000, 0, 5, BlockFlags::empty()).unwrap();
        b.push(0x1002, 5, 7, BlockFlags::USES_FPU).unwrap();
        let block = b
            .finish(vec![0x90; 12], 0x1005, 0x1000, 0x1005, Vec::new())
            .unwrap();

        assert_eq!(block.key, 0x1000);
        assert_eq!(block.source, GuestRange::new(0x1000, 5));
        assert_eq!(
            block.table,
            vec![
                InsnOffset { source_offset: 0, gen_offset: 0 },
                InsnOffset { source_offset: 2, gen_offset: 5 },
                InsnOffset { source_offset: 5, gen_offset: 12 },
            ]
        );
        assert_eq!(block.flags, BlockFlags::USES_FPU);
        assert!(b.is_empty());
        assert_eq!(b.key(), None);
    }

    #[test]
    fn source_range_covers_key_and_next_pc() {
        let mut b = BlockBuilder::new(8);
        b.begin(0x2000);
        b.push(0x2000, 0, 4, BlockFlags::empty()).unwrap();
        let block = b
            .finish(vec![0; 4], 0x2003, 0x2001, 0x2002, Vec::new())
            .unwrap();
        assert_eq!(block.source, GuestRange::new(0x2000, 3));
    }

    #[test]
    fn inhibit_only_survives_on_a_lone_last_instruction() {
        let inhibit = BlockFlags::INHIBIT_INTERRUPTS;
        let run = |pattern: &[bool]| {
            let mut b = BlockBuilder::new(8);
            b.begin(0);
            for (i, &inh) in pattern.iter().enumerate() {
                let flags = if inh { inhibit } else { BlockFlags::empty() };
                b.push(i as u32, i as u32, 1, flags).unwrap();
            }
            let n = pattern.len() as u32;
            b.finish(vec![0; n as usize], n, 0, n, Vec::new())
                .unwrap()
                .flags
                .contains(inhibit)
        };
        assert!(run(&[false, true]));
        assert!(run(&[true]));
        assert!(!run(&[true, true]));
        assert!(!run(&[true, false]));
    }

    #[test]
    fn push_past_limit_reports_builder_full() {
        let mut b = BlockBuilder::new(2);
        b.begin(0x10);
        b.push(0x10, 0, 1, BlockFlags::empty()).unwrap();
        b.push(0x11, 1, 1, BlockFlags::empty()).unwrap();
        assert!(b.is_full());
        assert_eq!(
            b.push(0x12, 2, 1, BlockFlags::empty()),
            Err(CacheError::BuilderFull { max: 2 })
        );
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn record_checks_reject_bad_sites() {
        let mut b = BlockBuilder::new(4);
        b.begin(0x40);
        b.push(0x40, 0, 8, BlockFlags::empty()).unwrap();
        let edges = vec![PendingEdge {
            kind: EdgeKind::Taken,
            site: 6,
            target: 0x80,
        }];
        let block = b.finish(vec![0; 8], 0x42, 0x40, 0x42, edges).unwrap();
        assert!(matches!(
            block.check(),
            Err(CacheError::InvalidBuild { key: 0x40, .. })
        ));
    }
}
