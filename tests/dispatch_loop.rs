//! End-to-end: a toy dispatcher driving the translation cache over a small guest program.
//!
//! "Executing" a block means following its taken edge: an unlinked exit hands the next PC back
//! to the dispatcher, a linked jump is followed straight into the next block's code.

use std::collections::BTreeMap;

use simjit_tcache::patch::{jump_target, read_exit_stub, read_site, SiteForm, EXIT_STUB};
use simjit_tcache::{
    BlockBuilder, BlockFlags, BlockId, EdgeKind, GuestAddr, PendingEdge, TranslationCache,
    TranslationCacheConfig,
};

const GEN_PER_INSN: u32 = 8;
/// Chained jumps followed before the test gives control back to the dispatcher.
const CHAIN_LIMIT: usize = 64;

/// Guest program: basic blocks by entry PC, each `(source length, successor PC)`.
struct Guest {
    blocks: BTreeMap<GuestAddr, (u32, GuestAddr)>,
}

impl Guest {
    fn ring(entries: &[GuestAddr], len: u32) -> Self {
        let mut blocks = BTreeMap::new();
        for (i, &pc) in entries.iter().enumerate() {
            let next = entries[(i + 1) % entries.len()];
            blocks.insert(pc, (len, next));
        }
        Self { blocks }
    }

    /// Translate from `pc` to the end of the guest block containing it.
    fn translate(&self, cache: &mut TranslationCache, pc: GuestAddr) -> BlockId {
        let (&entry, &(len, next)) = self
            .blocks
            .range(..=pc)
            .next_back()
            .expect("pc inside the program");
        let end = entry + len;
        let insns = (end - pc) / 2;

        let mut builder = BlockBuilder::new(cache.config().max_block_instructions);
        builder.begin(pc);
        for i in 0..insns {
            builder
                .push(pc + 2 * i, i * GEN_PER_INSN, GEN_PER_INSN, BlockFlags::empty())
                .unwrap();
        }
        let mut code = vec![0x90; (insns * GEN_PER_INSN) as usize];
        let site = code.len() as u32 + 1;
        code.extend_from_slice(&EXIT_STUB);
        let edges = vec![PendingEdge {
            kind: EdgeKind::Taken,
            site,
            target: next,
        }];
        let mut pending = builder.finish(code, end, pc, end, edges).unwrap();
        cache.commit(&mut pending).unwrap()
    }
}

/// Run from block `id` until control returns to the dispatcher.
///
/// Returns the next guest PC and the number of linked jumps taken on the way.
fn execute(cache: &TranslationCache, mut id: BlockId) -> (GuestAddr, usize) {
    let mut chained = 0;
    loop {
        let block = cache.block(id).unwrap();
        let edge = block.edge(EdgeKind::Taken).unwrap();
        let code = block.code();
        match read_site(code.bytes(), edge.site as usize) {
            SiteForm::Exit(pc) => return (pc, chained),
            SiteForm::Jump { .. } => {
                let landing = jump_target(code.bytes(), code.host_addr(), edge.site as usize)
                    .unwrap();
                id = cache.block_at_host_addr(landing).unwrap();
                assert_eq!(cache.entry(id), Some(landing), "jumps land on block entries");
                chained += 1;
                if chained == CHAIN_LIMIT {
                    return (cache.block(id).unwrap().key(), chained);
                }
            }
            SiteForm::Unknown(op) => panic!("corrupt patch site opcode {op:#04x}"),
        }
    }
}

/// One dispatcher iteration: find or translate the block at `pc`, then run it.
fn dispatch(cache: &mut TranslationCache, guest: &Guest, pc: GuestAddr) -> (GuestAddr, usize) {
    let id = match cache.lookup(pc).unwrap() {
        Some(id) => id,
        None => guest.translate(cache, pc),
    };
    execute(cache, id)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[test]
fn hot_loop_ends_up_fully_chained() {
    init_tracing();
    let guest = Guest::ring(&[0x1000, 0x1100, 0x1200], 0x20);
    let mut cache = TranslationCache::new(TranslationCacheConfig::default()).unwrap();

    // Nothing to jump to yet: both blocks hand control back to the dispatcher.
    assert_eq!(dispatch(&mut cache, &guest, 0x1000), (0x1100, 0));
    assert_eq!(dispatch(&mut cache, &guest, 0x1100), (0x1200, 0));

    // Translating the last block closes the ring; it never comes back by itself.
    let (_, chained) = dispatch(&mut cache, &guest, 0x1200);
    assert_eq!(chained, CHAIN_LIMIT);

    let stats = cache.stats();
    assert_eq!(stats.committed, 3);
    assert_eq!(stats.links, 3);
    assert_eq!(stats.misses, 3);
    cache.check_links().unwrap();
}

#[test]
fn guest_write_splits_the_chain_until_retranslated() {
    init_tracing();
    let guest = Guest::ring(&[0x1000, 0x1100, 0x1200], 0x20);
    let mut cache = TranslationCache::new(TranslationCacheConfig::default()).unwrap();
    let mut pc = 0x1000;
    for _ in 0..3 {
        pc = dispatch(&mut cache, &guest, pc).0;
    }

    // Guest stores into the middle block's code.
    assert_eq!(cache.invalidate_write(0x1104, 2, None).unwrap(), 1);
    cache.check_links().unwrap();

    let (next, chained) = dispatch(&mut cache, &guest, 0x1000);
    assert_eq!((next, chained), (0x1100, 0));

    // Retranslating the block links both neighbours again.
    let (next, chained) = dispatch(&mut cache, &guest, 0x1100);
    assert_eq!(chained, CHAIN_LIMIT);
    assert!(cache.find(next).is_some());
    cache.check_links().unwrap();
}

#[test]
fn block_writing_its_own_code_exits_at_the_next_instruction() {
    init_tracing();
    let guest = Guest::ring(&[0x2000, 0x2100], 0x20);
    let mut cache = TranslationCache::new(TranslationCacheConfig::default()).unwrap();
    let mut pc = 0x2000;
    for _ in 0..2 {
        pc = dispatch(&mut cache, &guest, pc).0;
    }

    // The 2nd instruction of 0x2000 stores into its own 5th instruction; the fault is reported
    // in the middle of the storing instruction's code.
    let id = cache.find(0x2000).unwrap();
    let entry = cache.entry(id).unwrap();
    let fault = entry + u64::from(GEN_PER_INSN) + 4;
    assert_eq!(cache.find_source_pc(fault), Some(0x2002));
    assert_eq!(cache.invalidate_write(0x2008, 2, Some(fault)).unwrap(), 1);

    // Execution continues inside the broken block and leaves it right after the store.
    let block = cache.block(id).unwrap();
    assert!(!block.is_alive());
    let resume_at = 2 * GEN_PER_INSN as usize;
    assert_eq!(read_exit_stub(block.code().bytes(), resume_at), Some(0x2004));

    // The dispatcher picks up from the exit PC with a fresh translation, which links straight
    // into the other block. That block's edge back to the broken one was unlinked.
    let (next, chained) = dispatch(&mut cache, &guest, 0x2004);
    assert_eq!((next, chained), (0x2000, 1));
    assert!(cache.find(0x2004).is_some());
    assert_eq!(cache.lookup(0x2000).unwrap(), None);

    // The dead block is reclaimed by the sweeper eventually.
    for _ in 0..8 {
        cache.sweep_step().unwrap();
    }
    assert!(cache.find(0x2000).is_none());
    cache.check_links().unwrap();
}
