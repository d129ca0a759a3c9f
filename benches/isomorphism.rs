//! Performance benchmarks for the isomorphism cache.
//!
//! Run with: `cargo bench --bench isomorphism`
//!
//! The interesting number is the gap between the first query for a rule
//! pair (sampling + trie expansion) and repeat queries sharing the same
//! reaction-center prefix (served from the trie).

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use overlay_kernel::{AtomId, IsomorphismCache, Rule};

/// A ring of alternating carbons and oxygens: plenty of automorphisms
/// to expand, so trie reuse is measurable.
fn ring_rule(name: &str, offset: u32) -> Rule {
    let mut builder = Rule::builder(name);
    for i in 0..8u32 {
        let label = if i % 2 == 0 { "C" } else { "O" };
        builder = builder.atom(offset + i, label);
    }
    for i in 0..8u32 {
        builder = builder.bond(offset + i, offset + (i + 1) % 8, "-");
    }
    builder.build().expect("ring rule is well-formed")
}

fn bench_cold_sampling(c: &mut Criterion) {
    c.bench_function("cache_cold_sampling", |b| {
        b.iter(|| {
            let first = ring_rule("first", 0);
            let second = ring_rule("second", 100);
            let mut cache = IsomorphismCache::new();
            let count = cache
                .get_isomorphisms(&first, &second, vec![AtomId(0)])
                .count();
            black_box(count)
        });
    });
}

fn bench_warm_prefix_reuse(c: &mut Criterion) {
    let first = ring_rule("first", 0);
    let second = ring_rule("second", 100);
    let mut cache = IsomorphismCache::new();
    // Seed the pair entry and the first trie level.
    let _ = cache
        .get_isomorphisms(&first, &second, vec![AtomId(0)])
        .count();

    c.bench_function("cache_warm_prefix_reuse", |b| {
        b.iter(|| {
            let count = cache
                .get_isomorphisms(&first, &second, vec![AtomId(0)])
                .count();
            black_box(count)
        });
    });
}

fn bench_deeper_prefix_extension(c: &mut Criterion) {
    let first = ring_rule("first", 0);
    let second = ring_rule("second", 100);
    let mut cache = IsomorphismCache::new();
    let _ = cache
        .get_isomorphisms(&first, &second, vec![AtomId(0)])
        .count();

    c.bench_function("cache_deeper_prefix_extension", |b| {
        b.iter(|| {
            let count = cache
                .get_isomorphisms(&first, &second, vec![AtomId(0), AtomId(2), AtomId(4)])
                .count();
            black_box(count)
        });
    });
}

criterion_group!(
    benches,
    bench_cold_sampling,
    bench_warm_prefix_reuse,
    bench_deeper_prefix_extension
);
criterion_main!(benches);
