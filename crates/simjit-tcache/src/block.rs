use bitflags::bitflags;

use crate::{GuestAddr, GuestRange};

/// Stable index of a block slot inside the pool.
///
/// Ids are only meaningful while the slot is live; after a block is released the id may be
/// reused for an unrelated block, so holders must re-validate (see [`TranslationBlock::key`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockFlags: u16 {
        /// The last instruction of the block (`mov ss`/`pop ss`) inhibits interrupts for one
        /// instruction after the block exits.
        const INHIBIT_INTERRUPTS = 1 << 0;
        /// The block touches FPU state.
        const USES_FPU = 1 << 1;
        /// One of the block's edges is linked back onto its own entry.
        const SELF_LINKED = 1 << 2;
    }
}

impl BlockFlags {
    /// Flags that travel backwards along links: a block that jumps straight into an FPU block
    /// must be treated as an FPU block by the dispatcher too.
    pub const STICKY: Self = Self::USES_FPU;
}

/// Correspondence between one source instruction and its generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsnOffset {
    /// Offset of the instruction from the block key.
    pub source_offset: u32,
    /// Offset of the instruction's generated code from the start of the code buffer.
    pub gen_offset: u32,
}

/// Generated code plus the source/translated offset table.
///
/// The table holds one entry per source instruction followed by a sentinel whose offsets point
/// just past the last instruction (source and generated). The buffer is boxed so its host
/// address stays fixed for the whole life of the block.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Box<[u8]>,
    table: Box<[InsnOffset]>,
}

impl CodeBuffer {
    pub(crate) fn new(bytes: Vec<u8>, table: Vec<InsnOffset>) -> Self {
        Self {
            bytes: bytes.into_boxed_slice(),
            table: table.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Offset table including the trailing sentinel.
    #[inline]
    pub fn table(&self) -> &[InsnOffset] {
        &self.table
    }

    /// Number of source instructions (the sentinel is not counted).
    pub fn instruction_count(&self) -> usize {
        self.table.len().saturating_sub(1)
    }

    /// Host address of the first generated byte.
    #[inline]
    pub fn host_addr(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }

    #[inline]
    pub fn contains_host_addr(&self, addr: u64) -> bool {
        let base = self.host_addr();
        addr >= base && addr - base < self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Taken,
    NotTaken,
}

impl EdgeKind {
    #[inline]
    pub(crate) fn slot(self) -> usize {
        match self {
            EdgeKind::Taken => 0,
            EdgeKind::NotTaken => 1,
        }
    }

    pub(crate) fn tag(self) -> char {
        match self {
            EdgeKind::Taken => 'T',
            EdgeKind::NotTaken => 'N',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    /// Exits through the dispatcher with the edge's target PC.
    Unlinked,
    /// Jumps straight into the target block's code.
    Linked(BlockId),
}

/// An outgoing control-flow edge of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub kind: EdgeKind,
    /// Offset of the imm32 of the exit sequence inside the code buffer.
    pub site: u32,
    /// Guest PC the edge transfers to; also the value restored when unlinking.
    pub target: GuestAddr,
    pub state: EdgeState,
}

impl Edge {
    #[inline]
    pub fn is_linked(&self) -> bool {
        matches!(self.state, EdgeState::Linked(_))
    }
}

/// Incoming link: `from`'s `edge` jumps into the block holding this record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackRef {
    pub from: BlockId,
    pub edge: EdgeKind,
}

/// A cached unit of translated guest code.
#[derive(Debug, Default)]
pub struct TranslationBlock {
    pub(crate) key: GuestAddr,
    pub(crate) source: GuestRange,
    pub(crate) code: CodeBuffer,
    pub(crate) life: i32,
    pub(crate) alive: bool,
    pub(crate) flags: BlockFlags,
    pub(crate) edges: [Option<Edge>; 2],
    pub(crate) backrefs: Vec<BackRef>,
}

impl TranslationBlock {
    #[inline]
    pub fn key(&self) -> GuestAddr {
        self.key
    }

    #[inline]
    pub fn source_range(&self) -> GuestRange {
        self.source
    }

    #[inline]
    pub fn code(&self) -> &CodeBuffer {
        &self.code
    }

    #[inline]
    pub fn life(&self) -> i32 {
        self.life
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    #[inline]
    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    #[inline]
    pub fn edge(&self, kind: EdgeKind) -> Option<&Edge> {
        self.edges[kind.slot()].as_ref()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().flatten()
    }

    #[inline]
    pub fn backrefs(&self) -> &[BackRef] {
        &self.backrefs
    }

    /// Host address the dispatcher (or a linked jump) enters the block at.
    #[inline]
    pub fn entry(&self) -> u64 {
        self.code.host_addr()
    }

    /// Guest PC of the instruction whose generated code covers host address `addr`.
    pub fn source_pc_at(&self, addr: u64) -> Option<GuestAddr> {
        if !self.code.contains_host_addr(addr) {
            return None;
        }
        let offset = addr - self.code.host_addr();
        let table = self.code.table();
        let count = self.code.instruction_count();
        let insn = table[..count]
            .iter()
            .take_while(|e| u64::from(e.gen_offset) <= offset)
            .last()?;
        Some(self.key.wrapping_add(insn.source_offset))
    }
}
