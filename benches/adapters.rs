//! Benchmarks for adapted dense layers

#![allow(missing_docs)]

use candle_core::Device;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lora_rs::{factorize, init, AdaptedLinear, Layer, LinearMap, LoraConfig, MergeMode};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn benchmark_forward(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(0);
    let x = init::randn((64, 784), 1.0, &mut rng, &device).unwrap();

    let mut group = c.benchmark_group("adapted_forward");
    for r in [4, 16, 64] {
        for mode in [MergeMode::Unmerged, MergeMode::Merged] {
            let linear = LinearMap::new(784, 128, &mut rng, &device).unwrap();
            let layer =
                AdaptedLinear::new(linear, LoraConfig { r, alpha: 8.0 }, mode, &mut rng, &device)
                    .unwrap();
            group.bench_with_input(BenchmarkId::new(format!("{mode:?}"), r), &x, |b, x| {
                b.iter(|| layer.forward(black_box(x)).unwrap());
            });
        }
    }
    group.finish();
}

fn benchmark_factorize(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(0);
    let w = init::randn((128, 784), 1.0, &mut rng, &device).unwrap();

    let mut group = c.benchmark_group("factorize");
    for rank in [2, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(rank), &w, |b, w| {
            b.iter(|| factorize(black_box(w), rank).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_forward, benchmark_factorize);
criterion_main!(benches);
