// Shared test helpers (integration tests compile as separate crates, so keep them in a
// submodule instead of their own test target).
#![allow(dead_code)]

use simjit_tcache::patch::EXIT_STUB;
use simjit_tcache::{
    BlockBuilder, BlockFlags, EdgeKind, GuestAddr, PendingBlock, PendingEdge, SweepPolicy,
    TranslationCacheConfig,
};

/// Bytes of generated code per source instruction in synthetic blocks.
pub const GEN_PER_INSN: u32 = 8;
/// Bytes of guest code per source instruction in synthetic blocks.
pub const SRC_PER_INSN: u32 = 2;

/// Route `tracing` output through the test harness; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn config() -> TranslationCacheConfig {
    TranslationCacheConfig {
        pool_capacity: 256,
        ..TranslationCacheConfig::default()
    }
}

pub fn config_with(sweep: SweepPolicy) -> TranslationCacheConfig {
    TranslationCacheConfig {
        sweep,
        ..config()
    }
}

/// Synthetic block for guest `[key, key + src_len)`.
///
/// Every 2-byte source instruction becomes 8 bytes of `nop`, followed by one
/// `mov eax, pc; pop edx; ret` exit per edge.
pub fn block_with_flags(
    key: GuestAddr,
    src_len: u32,
    taken: Option<GuestAddr>,
    not_taken: Option<GuestAddr>,
    flags: BlockFlags,
) -> PendingBlock {
    let insns = (src_len / SRC_PER_INSN).max(1);
    let mut builder = BlockBuilder::new(256);
    builder.begin(key);
    for i in 0..insns {
        builder
            .push(key + i * SRC_PER_INSN, i * GEN_PER_INSN, GEN_PER_INSN, flags)
            .unwrap();
    }

    let mut code = vec![0x90u8; (insns * GEN_PER_INSN) as usize];
    let mut edges = Vec::new();
    for (kind, target) in [(EdgeKind::Taken, taken), (EdgeKind::NotTaken, not_taken)] {
        let Some(target) = target else {
            continue;
        };
        let site = code.len() as u32 + 1;
        code.extend_from_slice(&EXIT_STUB);
        edges.push(PendingEdge { kind, site, target });
    }

    builder
        .finish(code, key + src_len, key, key + src_len, edges)
        .unwrap()
}

pub fn block(
    key: GuestAddr,
    src_len: u32,
    taken: Option<GuestAddr>,
    not_taken: Option<GuestAddr>,
) -> PendingBlock {
    block_with_flags(key, src_len, taken, not_taken, BlockFlags::empty())
}

pub fn leaf(key: GuestAddr, src_len: u32) -> PendingBlock {
    block(key, src_len, None, None)
}
