//! Synchronous vs pipelined batch throughput
//!
//! Run with: cargo bench -p cnn-engine
//!
//! The pipelined variant keeps up to `depth` batches in flight and prepares
//! the next batch on the host while earlier ones execute.

use std::collections::VecDeque;

use cnn_engine::{
    DevicePreference, HostTensor, ImageShape, LossTargets, ModuleConfig, NetworkKind,
    TrainingModule, UpdaterKind,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const BATCH: usize = 8;
const BATCHES: usize = 8;

fn module() -> TrainingModule {
    let config = ModuleConfig::new(
        NetworkKind::ConvNet,
        BATCH,
        ImageShape::new(16, 16, 3),
        ImageShape::new(1, 1, 10),
    )
    .with_updater(UpdaterKind::Sgd)
    .with_option("seed", 7.0)
    .with_device(DevicePreference::Auto);
    TrainingModule::init(config).unwrap()
}

fn batches() -> Vec<Vec<f32>> {
    (0..BATCHES)
        .map(|k| {
            (0..BATCH * 16 * 16 * 3)
                .map(|i| ((i * 31 + k * 7) % 97) as f32 / 97.0)
                .collect()
        })
        .collect()
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    group.sample_size(20);
    group.throughput(Throughput::Elements((BATCH * BATCHES) as u64));

    let data = batches();
    let dims = [BATCH, 16, 16, 3];

    group.bench_function("sync", |b| {
        let mut module = module();
        b.iter(|| {
            for input in &data {
                black_box(module.forward(HostTensor::new(input, &dims), false).unwrap());
            }
        });
    });

    for depth in [2usize, 4] {
        group.bench_with_input(BenchmarkId::new("pipelined", depth), &depth, |b, &depth| {
            let mut module = module();
            b.iter(|| {
                let mut in_flight = VecDeque::new();
                for (id, input) in data.iter().enumerate() {
                    if in_flight.len() == depth {
                        let done = in_flight.pop_front().unwrap();
                        black_box(module.wait_for_batch(done).unwrap());
                    }
                    let id = id as i64;
                    module
                        .begin_forward_batch(id, HostTensor::new(input, &dims), None, false, false)
                        .unwrap();
                    in_flight.push_back(id);
                }
                for id in in_flight {
                    black_box(module.wait_for_batch(id).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_training_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("training_step");
    group.sample_size(20);
    group.throughput(Throughput::Elements(BATCH as u64));

    let data = batches();
    let dims = [BATCH, 16, 16, 3];
    let labels: Vec<f32> = (0..BATCH).map(|i| (i % 10) as f32).collect();
    let label_dims = [BATCH, 1, 1, 1];

    group.bench_function("forward_backward_update", |b| {
        let mut module = module();
        b.iter(|| {
            let targets = LossTargets::new(HostTensor::new(&labels, &label_dims));
            black_box(
                module
                    .forward_backward(HostTensor::new(&data[0], &dims), targets, false)
                    .unwrap(),
            );
            module.gpu_update().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_forward, bench_training_step);
criterion_main!(benches);
