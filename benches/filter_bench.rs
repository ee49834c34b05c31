//! Filter update benchmarks.
//!
//! Measures the fixed filter's recursive update and the learned filter's
//! inference step and training update across grid sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use grid_belief_filter_rs::{
    DynamicsConfig, FixedBayesianFilter, GridConfig, LearnedDynamicsFilter, ObservationMatrix,
    ReplayBuffer, TrainingConfig, TransitionKernel,
};

fn one_hot_obs(grid: &GridConfig) -> Vec<f32> {
    let mut obs = vec![0.0_f32; grid.cells() * grid.n_obs];
    for cell in obs.chunks_mut(grid.n_obs) {
        cell[0] = 1.0;
    }
    obs
}

fn bench_fixed_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed_bayesian_update");
    for side in [8_usize, 16, 32, 64] {
        let grid = GridConfig::new(side, side, 3, 3);
        let mut filter = FixedBayesianFilter::new(
            &grid,
            ObservationMatrix::identity(3),
            TransitionKernel::diffusion(3, 0.8).unwrap(),
        )
        .unwrap();
        let obs = one_hot_obs(&grid);
        group.throughput(Throughput::Elements(grid.cells() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, _| {
            b.iter(|| {
                filter.bayesian_update(black_box(&obs)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_learned_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("learned_step");
    for side in [8_usize, 16, 32] {
        let grid = GridConfig::new(side, side, 3, 3);
        let mut filter =
            LearnedDynamicsFilter::new(grid, DynamicsConfig::default(), TrainingConfig::default())
                .unwrap();
        let obs = one_hot_obs(&grid);
        let mask = vec![1.0_f32; grid.cells()];
        group.throughput(Throughput::Elements(grid.cells() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, _| {
            b.iter(|| {
                filter.step(black_box(&obs), black_box(&mask)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_learned_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("learned_update");
    group.sample_size(10);
    for side in [8_usize, 16] {
        let grid = GridConfig::new(side, side, 3, 3);
        let mut filter =
            LearnedDynamicsFilter::new(grid, DynamicsConfig::default(), TrainingConfig::default())
                .unwrap();
        let mut buffer = ReplayBuffer::new(32);
        for _ in 0..16 {
            buffer.push(
                one_hot_obs(&grid),
                vec![1.0 / 3.0; grid.cells() * grid.n_state],
                vec![1.0; grid.cells()],
            );
        }
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, _| {
            b.iter(|| {
                filter.update(black_box(&mut buffer), 4, 8).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_fixed_update,
    bench_learned_step,
    bench_learned_update
);
criterion_main!(benches);
