//! Benchmarks for wipercheck-infra core operations.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;
use wipercheck_infra::core::{parser, planner, resolver, synth};
use wipercheck_infra::tripwire::hasher;

const BUNDLED: &str = include_str!("../infra.yaml");

fn bench_blake3_string(c: &mut Criterion) {
    let mut group = c.benchmark_group("blake3_string");
    for size in [64, 1024, 16384] {
        let input: String = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| black_box(hasher::hash_string(black_box(input))));
        });
    }
    group.finish();
}

fn bench_parse_config(c: &mut Criterion) {
    c.bench_function("parse_config", |b| {
        b.iter(|| black_box(parser::parse_config(black_box(BUNDLED)).unwrap()));
    });
}

fn bench_validate(c: &mut Criterion) {
    let config = parser::parse_config(BUNDLED).unwrap();
    c.bench_function("validate_config", |b| {
        b.iter(|| black_box(parser::validate_config(black_box(&config))));
    });
}

fn bench_graph(c: &mut Criterion) {
    let config = parser::parse_config(BUNDLED).unwrap();
    c.bench_function("build_graph", |b| {
        b.iter(|| black_box(resolver::build_graph(black_box(&config)).unwrap()));
    });
}

fn bench_synthesize(c: &mut Criterion) {
    let config = parser::parse_config(BUNDLED).unwrap();
    c.bench_function("synthesize", |b| {
        b.iter(|| black_box(synth::synthesize(black_box(&config)).unwrap()));
    });
}

fn bench_plan(c: &mut Criterion) {
    let config = parser::parse_config(BUNDLED).unwrap();
    let templates = synth::synthesize(&config).unwrap();
    let locks = HashMap::new();
    c.bench_function("plan_fresh", |b| {
        b.iter(|| black_box(planner::plan(&config, black_box(&templates), &locks)));
    });
}

criterion_group!(
    benches,
    bench_blake3_string,
    bench_parse_config,
    bench_validate,
    bench_graph,
    bench_synthesize,
    bench_plan
);
criterion_main!(benches);
