use super::*;

use proptest::prelude::*;
use std::collections::BTreeMap;

use crate::raw::testing::Tracking;

/// Longest-prefix match by brute force over every stored prefix.
fn model_find(model: &BTreeMap<(u32, u32), u32>, key: u32) -> Option<u32> {
    model
        .iter()
        .filter(|((prefix, len), _)| key & u32::prefix_mask(*len) == *prefix)
        .max_by_key(|((_, len), _)| *len)
        .map(|(_, v)| *v)
}

#[derive(Clone, Debug)]
enum Op {
    Insert(u32, u32, u32),
    Delete(u32, u32),
    Find(u32),
}

fn prefix_strategy() -> impl Strategy<Value = (u32, u32)> + Clone {
    // Short prefixes over a narrow key space so inserts, deletes and lookups
    // keep colliding.
    (any::<u8>(), 0u32..=12).prop_map(|(bits, len)| {
        let key = u32::from(bits) << 24;
        (key & u32::prefix_mask(len), len)
    })
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let prefix = prefix_strategy();
    let op = prop_oneof![
        45 => (prefix.clone(), any::<u32>()).prop_map(|((k, len), v)| Op::Insert(k, len, v)),
        30 => prefix.prop_map(|(k, len)| Op::Delete(k, len)),
        25 => any::<u32>().prop_map(|k| Op::Find(k & 0xFFF0_0000)),
    ];
    prop::collection::vec(op, 0..=500)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 10_000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_radix_matches_model(ops in ops_strategy(), prealloc in 0u32..=3) {
        let pool = Pool::new(4096).unwrap();
        let mut tree: Radix32Tree<u32> =
            RadixTree::new(&pool, Preallocate::Depth(prealloc)).unwrap();
        let mut model: BTreeMap<(u32, u32), u32> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, len, value) => {
                    let got = tree.insert(key, u32::prefix_mask(len), value);
                    if model.contains_key(&(key, len)) {
                        prop_assert_eq!(got, Err(Error::Busy));
                    } else {
                        prop_assert_eq!(got, Ok(()));
                        model.insert((key, len), value);
                    }
                }
                Op::Delete(key, len) => {
                    let got = tree.delete(key, u32::prefix_mask(len));
                    if model.remove(&(key, len)).is_some() {
                        prop_assert_eq!(got, Ok(()));
                    } else {
                        // Unvalued preallocated leaves may be pruned; everything
                        // else must be reported missing.
                        prop_assert!(got == Err(Error::NotFound) || got == Ok(()));
                    }
                }
                Op::Find(key) => {
                    prop_assert_eq!(tree.find(key), model_find(&model, key));
                }
            }
            prop_assert_eq!(tree.len(), model.len());
        }

        tree.validate();
        for (&(key, len), &value) in &model {
            prop_assert_eq!(tree.get(key, u32::prefix_mask(len)), Some(value));
        }
    }

    #[test]
    fn prop_insert_delete_roundtrip(key in any::<u32>(), len in 0u32..=32, value in any::<u32>()) {
        let pool = Pool::new(4096).unwrap();
        let mut tree: Radix32Tree<u32> = RadixTree::new(&pool, Preallocate::None).unwrap();
        let mask = u32::prefix_mask(len);

        tree.insert(key, mask, value).unwrap();
        prop_assert_eq!(tree.find(key), Some(value));
        tree.delete(key, mask).unwrap();
        prop_assert_eq!(tree.find(key), None);
        prop_assert_eq!(tree.node_count(), 1);
        prop_assert!(!tree.has_dead_leaves());
    }

    #[test]
    fn prop_v6_longest_prefix_wins(key in any::<u128>(), short in 0u32..64, extra in 1u32..=64) {
        let pool = Pool::new(4096).unwrap();
        let mut tree: Radix128Tree<u8> = RadixTree::new(&pool, Preallocate::None).unwrap();
        let key = key.to_be_bytes();
        let long = short + extra;

        tree.insert(key, <[u8; 16]>::prefix_mask(short), 1).unwrap();
        tree.insert(key, <[u8; 16]>::prefix_mask(long), 2).unwrap();
        prop_assert_eq!(tree.find(key), Some(2));

        tree.delete(key, <[u8; 16]>::prefix_mask(long)).unwrap();
        prop_assert_eq!(tree.find(key), Some(1));
        tree.validate();
    }

    #[test]
    fn prop_small_allocations_are_disjoint(
        sizes in prop::collection::vec((0usize..600, any::<bool>()), 1..200),
    ) {
        let raw = Tracking::new();
        let pool = Pool::new_in(1024, &raw).unwrap();
        let mut spans: Vec<(usize, usize)> = Vec::new();

        for (size, aligned) in sizes {
            let size = size.min(pool.max_small());
            let p = if aligned { pool.alloc(size) } else { pool.alloc_unaligned(size) }.unwrap();
            let start = p.as_ptr() as usize;
            if aligned {
                prop_assert_eq!(start % pool::ALIGNMENT, 0);
            }
            spans.push((start, start + size));
        }

        let blocks = pool.block_spans();
        for &(start, end) in &spans {
            prop_assert!(
                blocks.iter().any(|&(b, last, _)| b <= start && end <= last),
                "allocation outside every block"
            );
        }
        spans.sort_unstable();
        for w in spans.windows(2) {
            prop_assert!(w[0].1 <= w[1].0, "overlapping allocations");
        }
        prop_assert_eq!(raw.live(), pool.block_count());
    }

    #[test]
    fn prop_reset_restores_fresh_state(sizes in prop::collection::vec(0usize..3000, 1..100)) {
        let raw = Tracking::new();
        let mut pool = Pool::new_in(1024, &raw).unwrap();
        for &size in &sizes {
            pool.alloc(size).unwrap();
        }
        let blocks = pool.block_count();

        pool.reset();
        prop_assert_eq!(pool.block_count(), blocks);
        prop_assert_eq!(pool.large_count(), 0);
        prop_assert_eq!(pool.cleanup_count(), 0);
        prop_assert_eq!(raw.live(), blocks);

        // Small allocations start over at the head block.
        let p = pool.alloc(8).unwrap();
        prop_assert_eq!(p.as_ptr() as usize, pool.block_spans()[0].0);
        prop_assert_eq!(pool.block_count(), blocks);
    }
}
