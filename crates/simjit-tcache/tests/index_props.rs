#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeSet;

use proptest::prelude::*;
use simjit_tcache::{max_avl_height, CacheError, Index};

#[derive(Debug, Clone, Copy)]
enum Op {
    Insert(u32),
    Delete(u32),
    MoveCursor(u32),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    // Narrow key space so deletes and duplicate inserts actually hit.
    let key = 0u32..512;
    let op = prop_oneof![
        4 => key.clone().prop_map(Op::Insert),
        3 => key.clone().prop_map(Op::Delete),
        1 => key.prop_map(Op::MoveCursor),
    ];
    proptest::collection::vec(op, 1..400)
}

fn keys(index: &Index) -> Vec<u32> {
    index.iter().map(|(_, block)| block.key()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn index_matches_btreeset_and_stays_balanced(ops in ops()) {
        let mut index = Index::new(512);
        let mut model = BTreeSet::new();

        for op in ops {
            match op {
                Op::Insert(key) => {
                    let (id, found) = index.probe(key).unwrap();
                    prop_assert_eq!(found, !model.insert(key));
                    prop_assert_eq!(index.block(id).map(|b| b.key()), Some(key));
                }
                Op::Delete(key) => {
                    let cursor_key = index
                        .cursor()
                        .and_then(|id| index.block(id))
                        .map(|b| b.key());
                    let expected_cursor = if cursor_key == Some(key) {
                        model.range(key + 1..).next().copied()
                    } else {
                        cursor_key
                    };

                    prop_assert_eq!(index.delete(key).unwrap(), model.remove(&key));

                    let cursor_after = index
                        .cursor()
                        .and_then(|id| index.block(id))
                        .map(|b| b.key());
                    prop_assert_eq!(cursor_after, expected_cursor);
                }
                Op::MoveCursor(key) => {
                    index.set_cursor(index.find(key));
                }
            }

            prop_assert_eq!(index.len(), model.len());
            prop_assert!(index.height() <= max_avl_height(model.len()));
            if let Err(msg) = index.check() {
                prop_assert!(false, "{}", msg);
            }
        }

        prop_assert_eq!(keys(&index), model.iter().copied().collect::<Vec<_>>());
        for key in 0..512u32 {
            prop_assert_eq!(index.find(key).is_some(), model.contains(&key));
            let floor = index.find_at_or_before(key).and_then(|id| index.block(id)).map(|b| b.key());
            let expected = model
                .range(..=key)
                .next_back()
                .or_else(|| model.iter().next())
                .copied();
            prop_assert_eq!(floor, expected);
        }
    }
}

#[test]
fn walk_from_visits_every_key_once_then_wraps() {
    let mut index = Index::new(64);
    for key in [40u32, 10, 30, 20, 60, 50] {
        index.probe(key).unwrap();
    }
    let mut seen = Vec::new();
    let mut cur = index.walk_from(None);
    while let Some(id) = cur {
        seen.push(index.block(id).unwrap().key());
        cur = index.walk_from(Some(id));
    }
    assert_eq!(seen, vec![10, 20, 30, 40, 50, 60]);
}

#[test]
fn failed_probe_leaves_tree_untouched() {
    let mut index = Index::new(2);
    index.probe(1).unwrap();
    index.probe(2).unwrap();
    assert_eq!(
        index.probe(3),
        Err(CacheError::PoolExhausted { capacity: 2 })
    );
    assert_eq!(keys(&index), vec![1, 2]);
    index.check().unwrap();

    // Existing keys are still found without needing a slot.
    assert!(index.probe(2).unwrap().1);
}

#[test]
fn random_churn_keeps_block_ids_stable() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut index = Index::new(4096);
    let mut ids = std::collections::HashMap::new();
    for _ in 0..20_000 {
        let key = rng.gen_range(0..2048u32);
        if rng.gen_bool(0.6) {
            let (id, found) = index.probe(key).unwrap();
            if found {
                assert_eq!(ids[&key], id);
            } else {
                ids.insert(key, id);
            }
        } else if index.delete(key).unwrap() {
            ids.remove(&key);
        }
    }
    index.check().unwrap();
    for (key, id) in ids {
        assert_eq!(index.find(key), Some(id));
    }
}
