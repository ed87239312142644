#![cfg(feature = "prometheus")]

mod common;

use std::sync::OnceLock;
use std::time::Duration;

use common::{metric_rows, FaultyBackend};
use tsingest::telemetry::ingest_metrics::{self, InProcessPrometheus};
use tsingest::Ingestor;

fn install_prometheus_once() -> &'static InProcessPrometheus {
    static PROM: OnceLock<InProcessPrometheus> = OnceLock::new();
    PROM.get_or_init(|| {
        InProcessPrometheus::install(Duration::from_millis(25))
            .expect("failed to install in-process prometheus recorder")
    })
}

fn parse_sample(rendered: &str, metric: &str) -> Option<f64> {
    for line in rendered.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let val = parts.next()?;
        // Support exact match and label form: `name{...} value`.
        if key == metric || key.starts_with(metric) && key.as_bytes().get(metric.len()).copied() == Some(b'{') {
            if let Ok(v) = val.parse::<f64>() {
                return Some(v);
            }
        }
    }
    None
}

fn parse_counter(rendered: &str, base_name: &str) -> f64 {
    parse_sample(rendered, &format!("{}_total", base_name))
        .or_else(|| parse_sample(rendered, base_name))
        .unwrap_or(0.0)
}

#[test]
fn emits_ingest_duplicate_and_decompression_metrics() {
    let prom = install_prometheus_once();
    let before = prom.render();
    let before_ingested = parse_counter(&before, ingest_metrics::INGESTED_SAMPLES);
    let before_dups = parse_counter(&before, ingest_metrics::DUPLICATE_SAMPLES);
    let before_dup_writes = parse_counter(&before, ingest_metrics::DUPLICATE_WRITES);
    let before_decompress = parse_counter(&before, ingest_metrics::DECOMPRESS_CALLS);

    let backend = FaultyBackend::new();
    let ingestor = Ingestor::with_defaults(backend.clone()).unwrap();
    ingestor.insert_data(metric_rows("cpu", &[("a", &[10_000, 20_000])])).result.unwrap();
    ingestor.insert_data(metric_rows("cpu", &[("a", &[20_000, 30_000])])).result.unwrap();

    let table = backend.inner.table_for("cpu").unwrap();
    backend.inner.compress_before(&table, 5_000);
    ingestor.insert_data(metric_rows("cpu", &[("a", &[1_000])])).result.unwrap();
    ingestor.close();

    let after = prom.render();
    assert_eq!(parse_counter(&after, ingest_metrics::INGESTED_SAMPLES) - before_ingested, 4.0);
    assert_eq!(parse_counter(&after, ingest_metrics::DUPLICATE_SAMPLES) - before_dups, 1.0);
    assert_eq!(parse_counter(&after, ingest_metrics::DUPLICATE_WRITES) - before_dup_writes, 1.0);
    assert_eq!(parse_counter(&after, ingest_metrics::DECOMPRESS_CALLS) - before_decompress, 1.0);
    assert_eq!(
        parse_sample(&after, ingest_metrics::DECOMPRESS_EARLIEST_SECONDS),
        Some(1.0),
        "{}",
        after
    );
}
