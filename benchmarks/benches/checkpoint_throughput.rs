//! Benchmarks for checkpoint save and restore throughput

use std::collections::HashMap;

use bytes::Bytes;
use checkpoint::{CheckpointManager, CheckpointManagerConfig, CheckpointStore};
use ckpt_core::{ArrayValue, DType, RetentionPolicy, SaveMode, StateTree};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

fn model_state(bytes: usize) -> StateTree {
    let elems = bytes / DType::F32.size_of();
    StateTree::new()
        .with(
            "params",
            StateTree::new().with("w", ArrayValue::zeros(DType::F32, vec![elems])),
        )
        .with("step", 0i64)
}

fn store_write_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("store_write");

    for size in [1_000_000, 10_000_000, 100_000_000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::local(temp_dir.path());
        let data = Bytes::from(vec![0u8; *size]);

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                store
                    .write(1, data.clone(), &HashMap::new(), true)
                    .await
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn manager_save_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("manager_save");
    group.sample_size(20);

    for mode in [SaveMode::Sync, SaveMode::Async] {
        let size = 10_000_000;
        group.throughput(Throughput::Bytes(size as u64));

        let temp_dir = TempDir::new().unwrap();
        let config = CheckpointManagerConfig::new(temp_dir.path())
            .with_policy(RetentionPolicy::keep_last(2))
            .with_save_mode(mode);
        let manager = rt.block_on(CheckpointManager::new(config)).unwrap();
        let state = model_state(size);
        let mut step = 0u64;

        group.bench_with_input(BenchmarkId::new("10MB", format!("{:?}", mode)), &state, |b, state| {
            b.iter(|| {
                step += 1;
                rt.block_on(async {
                    drop(manager.save(state, step).await.unwrap());
                    manager.wait_until_finished().await.unwrap();
                });
            });
        });

        rt.block_on(manager.close()).unwrap();
    }

    group.finish();
}

fn restore_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("manager_restore");

    for size in [1_000_000, 10_000_000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        let temp_dir = TempDir::new().unwrap();
        let manager = rt
            .block_on(CheckpointManager::new(CheckpointManagerConfig::new(temp_dir.path())))
            .unwrap();
        let state = model_state(*size);
        rt.block_on(manager.save(&state, 1)).unwrap();
        let template = state.shape();

        group.bench_function(format!("{}MB", size / 1_000_000), |b| {
            b.to_async(&rt).iter(|| async {
                manager.restore(Some(1), Some(&template)).await.unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    store_write_benchmark,
    manager_save_benchmark,
    restore_benchmark,
);
criterion_main!(benches);
