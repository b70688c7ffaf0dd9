//! Lookup costs on the gridding hot path
//!
//! Measures key-based cell lookup, nearest-frequency search and a cold
//! reload of a persisted buffer.

use std::hint::black_box;

use cfcache_core::{
    BufferLayout, CacheConfig, CacheStore, FsyncMode, KernelBuffer, KernelSamples,
    PolarizationTables,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ndarray::{ArrayD, IxDyn};
use tempfile::TempDir;

fn layout(frequencies: usize, ws: usize) -> BufferLayout {
    BufferLayout::new(
        1.0e6,
        10.0,
        (0..frequencies).map(|i| 1.0e9 + 1.0e6 * i as f64).collect(),
        (0..ws).map(|i| 10.0 * i as f64).collect(),
        PolarizationTables::from_elements(&[0, 5, 10, 15]),
    )
}

fn populated(frequencies: usize, ws: usize, support: usize) -> KernelBuffer {
    let mut buffer = KernelBuffer::with_layout(layout(frequencies, ws)).unwrap();
    let slots: Vec<_> = buffer.cells().map(|(slot, _)| slot).collect();
    for slot in slots {
        let extent = 2 * support + 1;
        let samples = ArrayD::from_elem(IxDyn(&[extent, extent]), slot[0] as f32);
        buffer.fill_cell(slot, KernelSamples::Real(samples)).unwrap();
    }
    buffer.prime_the_cache().unwrap();
    buffer
}

fn bench_cell_by_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("cell_by_key");
    for &(frequencies, ws) in &[(8, 8), (64, 32), (256, 128)] {
        let buffer = populated(frequencies, ws, 2);
        let frequency = 1.0e9 + 1.0e6 * (frequencies / 2) as f64;
        let w = 10.0 * (ws - 1) as f64;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{frequencies}x{ws}x4")),
            &buffer,
            |b, buffer| {
                b.iter(|| {
                    let cell = buffer
                        .cell_by_key(black_box(frequency), black_box(w), black_box(15))
                        .unwrap();
                    black_box(cell.real_slice());
                });
            },
        );
    }
    group.finish();
}

fn bench_nearest_frequency_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("nearest_frequency_slot");
    for &frequencies in &[16usize, 256, 4096] {
        let buffer = KernelBuffer::with_layout(layout(frequencies, 1)).unwrap();
        let query = 1.0e9 + 1.0e6 * frequencies as f64 * 0.75 + 0.3e6;
        group.bench_with_input(BenchmarkId::from_parameter(frequencies), &buffer, |b, buffer| {
            b.iter(|| black_box(buffer.nearest_frequency_slot(black_box(query))));
        });
    }
    group.finish();
}

fn bench_reload(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut config = CacheConfig::with_root(dir.path());
    config.fsync_mode = FsyncMode::None;
    let key = "bench-reload".to_string();

    let writer: CacheStore<String> = CacheStore::new(config.clone()).unwrap();
    writer.put(key.clone(), populated(16, 16, 16));
    writer.persist(&key).unwrap();

    c.bench_function("reload_16x16x4_33x33", |b| {
        b.iter(|| {
            let store: CacheStore<String> = CacheStore::new(config.clone()).unwrap();
            black_box(store.get(&key).unwrap());
        });
    });
}

criterion_group!(benches, bench_cell_by_key, bench_nearest_frequency_slot, bench_reload);
criterion_main!(benches);
