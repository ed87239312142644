use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tempfile::TempDir;
use tsingest::{IngestConfig, Ingestor, Labels, MemoryBackend, Sample, SampleBatch, SqliteBackend};

/// `metrics` metrics with `series` series each, `samples` samples per series.
fn make_rows(metrics: usize, series: usize, samples: usize, round: usize) -> HashMap<String, Vec<SampleBatch>> {
    (0..metrics)
        .map(|m| {
            let metric = format!("bench_metric_{}", m);
            let batches = (0..series)
                .map(|s| {
                    let labels = Arc::new(Labels::new(&metric, [("instance", format!("i{}", s))]));
                    let samples = (0..samples)
                        .map(|i| Sample::new(((round * samples + i) as i64) * 1_000, i as f64))
                        .collect();
                    SampleBatch::new(labels, samples)
                })
                .collect();
            (metric, batches)
        })
        .collect()
}

fn bench_insert_data_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_data");
    let (metrics, series, samples) = (8, 250, 4);
    group.throughput(Throughput::Elements((metrics * series * samples) as u64));

    for num_copiers in [1i64, 4] {
        let ingestor = Ingestor::with_config(
            Arc::new(MemoryBackend::new()),
            IngestConfig {
                num_copiers,
                ..IngestConfig::default()
            },
        )
        .expect("ingestor init");
        // Warm the series caches so the loop measures the steady state.
        ingestor.insert_data(make_rows(metrics, series, samples, 0)).result.expect("warmup");

        let mut round = 1;
        group.bench_function(format!("memory_copiers_{}", num_copiers), |b| {
            b.iter_batched(
                || {
                    round += 1;
                    make_rows(metrics, series, samples, round)
                },
                |rows| black_box(ingestor.insert_data(rows)).result.expect("insert"),
                BatchSize::SmallInput,
            )
        });
        ingestor.close();
    }
    group.finish();
}

fn bench_insert_data_sqlite(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_data");
    group.sample_size(20);
    let (metrics, series, samples) = (4, 100, 4);
    group.throughput(Throughput::Elements((metrics * series * samples) as u64));

    let dir = TempDir::new().expect("tempdir");
    let backend = Arc::new(SqliteBackend::open(dir.path().join("bench.db")).expect("sqlite open"));
    let ingestor = Ingestor::with_defaults(backend).expect("ingestor init");

    let mut round = 0;
    group.bench_function("sqlite", |b| {
        b.iter_batched(
            || {
                round += 1;
                make_rows(metrics, series, samples, round)
            },
            |rows| black_box(ingestor.insert_data(rows)).result.expect("insert"),
            BatchSize::SmallInput,
        )
    });
    ingestor.close();
    group.finish();
}

criterion_group!(benches, bench_insert_data_memory, bench_insert_data_sqlite);
criterion_main!(benches);
