//! Benchmarks for radix tree operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use radix_pool::{Pool, Preallocate, Radix128Tree, Radix32Tree, RadixKey, RadixTree};

/// Random IPv4 networks with lengths between /8 and /24.
fn generate_v4_networks(n: usize) -> Vec<(u32, u32)> {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    (0..n)
        .map(|_| {
            let len = rng.gen_range(8..=24);
            let mask = u32::prefix_mask(len);
            (rng.gen::<u32>() & mask, mask)
        })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [1_000, 10_000] {
        let nets = generate_v4_networks(size);

        for (name, prealloc) in [("none", Preallocate::None), ("default", Preallocate::Default)] {
            group.bench_with_input(BenchmarkId::new(name, size), &nets, |b, nets| {
                b.iter(|| {
                    let pool = Pool::new(16 * 1024).unwrap();
                    let mut tree: Radix32Tree<u32> = RadixTree::new(&pool, prealloc).unwrap();
                    for (i, &(key, mask)) in nets.iter().enumerate() {
                        let _ = tree.insert(key, mask, i as u32);
                    }
                    black_box(tree.len())
                });
            });
        }
    }

    group.finish();
}

fn bench_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");

    for size in [1_000, 10_000, 100_000] {
        let nets = generate_v4_networks(size);
        let pool = Pool::new(16 * 1024).unwrap();
        let mut tree: Radix32Tree<u32> = RadixTree::new(&pool, Preallocate::Default).unwrap();
        for (i, &(key, mask)) in nets.iter().enumerate() {
            let _ = tree.insert(key, mask, i as u32);
        }

        let mut rng = StdRng::seed_from_u64(7);
        let probes: Vec<u32> = (0..1_000).map(|_| rng.gen()).collect();

        group.bench_with_input(BenchmarkId::new("v4", size), &probes, |b, probes| {
            b.iter(|| {
                for &key in probes {
                    black_box(tree.find(key));
                }
            });
        });
    }

    let pool = Pool::new(16 * 1024).unwrap();
    let mut tree: Radix128Tree<u32> = RadixTree::new(&pool, Preallocate::None).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    for i in 0..10_000u32 {
        let len = rng.gen_range(16..=64);
        let _ = tree.insert(rng.gen::<u128>().to_be_bytes(), <[u8; 16]>::prefix_mask(len), i);
    }
    let probes: Vec<[u8; 16]> = (0..1_000).map(|_| rng.gen::<u128>().to_be_bytes()).collect();
    group.bench_with_input(BenchmarkId::new("v6", 10_000), &probes, |b, probes| {
        b.iter(|| {
            for key in probes {
                black_box(tree.find(*key));
            }
        });
    });

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let nets = generate_v4_networks(1_000);
    c.bench_function("insert_delete_churn", |b| {
        let pool = Pool::new(16 * 1024).unwrap();
        let mut tree: Radix32Tree<u32> = RadixTree::new(&pool, Preallocate::None).unwrap();
        b.iter(|| {
            for (i, &(key, mask)) in nets.iter().enumerate() {
                let _ = tree.insert(key, mask, i as u32);
            }
            for &(key, mask) in &nets {
                let _ = tree.delete(key, mask);
            }
        });
    });
}

criterion_group!(benches, bench_insert, bench_find, bench_churn);
criterion_main!(benches);
