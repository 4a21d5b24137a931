use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use bitconsensus::consensus::{bit_consensus_with, matrix_consensus_with};
use bitconsensus::kernel::{bitwise_with, carry_propagate_with, popcount_with};
use bitconsensus::votes::weighted_vote_with;
use bitconsensus::{available_backends, Backend, PackedBitVec, ReduceOp};

fn backends() -> Vec<Backend> {
    available_backends()
        .into_iter()
        .filter_map(|d| Backend::for_kind(d.kind).ok())
        .collect()
}

fn bench_kernels(c: &mut Criterion) {
    // Deterministic vectors for stable benches
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let sizes = [256usize, 4096, 65_536, 1 << 20];

    for backend in backends() {
        let mut group = c.benchmark_group(format!("kernel_{}", backend.kind()));
        for &bits in &sizes {
            let x = PackedBitVec::random(bits, &mut rng);
            let y = PackedBitVec::random(bits, &mut rng);

            group.bench_with_input(BenchmarkId::new("popcount", bits), &x, |bencher, x| {
                bencher.iter(|| popcount_with(&backend, black_box(x)))
            });

            group.bench_with_input(BenchmarkId::new("xor", bits), &(&x, &y), |bencher, (x, y)| {
                bencher.iter(|| bitwise_with(&backend, ReduceOp::Xor, black_box(x), black_box(y)))
            });

            group.bench_with_input(BenchmarkId::new("carry_propagate", bits), &x, |bencher, x| {
                bencher.iter(|| carry_propagate_with(&backend, black_box(x), false))
            });
        }
        group.finish();
    }
}

fn bench_consensus(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xC0DE);
    let bits = 4096;
    let mut group = c.benchmark_group("consensus");

    for inputs in [3usize, 16, 64] {
        let votes: Vec<PackedBitVec> = (0..inputs)
            .map(|_| PackedBitVec::random(bits, &mut rng))
            .collect();
        let weights: Vec<f64> = (0..inputs).map(|j| 1.0 + (j % 4) as f64 * 0.25).collect();
        let threshold = weights.iter().sum::<f64>() / 2.0;
        let backend = Backend::best_available();

        group.bench_with_input(BenchmarkId::new("bit_majority", inputs), &votes, |bencher, votes| {
            bencher.iter(|| bit_consensus_with(&backend, black_box(votes), None, None))
        });

        group.bench_with_input(BenchmarkId::new("weighted", inputs), &votes, |bencher, votes| {
            bencher.iter(|| weighted_vote_with(&backend, black_box(votes), &weights, threshold))
        });

        group.bench_with_input(BenchmarkId::new("matrix_8x8", inputs), &votes, |bencher, votes| {
            bencher.iter(|| matrix_consensus_with::<8, 8>(&backend, black_box(votes), None))
        });

        group.bench_with_input(BenchmarkId::new("matrix_8x8_inline", inputs), &votes, |bencher, votes| {
            bencher.iter(|| matrix_consensus_with::<8, 8>(&backend, black_box(votes), Some(1)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_kernels, bench_consensus);
criterion_main!(benches);
