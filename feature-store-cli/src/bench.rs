use std::time::{Duration, Instant};

use sled_feature_store::{DataKind, PersistentDataStore, SledDataStore, StoreError};

/// Latency summary of a run of point reads.
#[derive(Debug, PartialEq)]
pub struct BenchReport {
    pub reads: u32,
    pub hits: u32,
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
}

/// Read `key` `iterations` times and time each read.
pub fn measure(
    store: &impl PersistentDataStore,
    kind: DataKind,
    key: &str,
    iterations: u32,
) -> Result<BenchReport, StoreError> {
    let mut hits = 0;
    let mut total = Duration::ZERO;
    let mut min = Duration::MAX;
    let mut max = Duration::ZERO;

    for _ in 0..iterations {
        let start = Instant::now();
        let found = store.get(kind, key)?.is_some();
        let elapsed = start.elapsed();

        if found {
            hits += 1;
        }
        total += elapsed;
        min = min.min(elapsed);
        max = max.max(elapsed);
    }

    Ok(BenchReport {
        reads: iterations,
        hits,
        min: if iterations == 0 { Duration::ZERO } else { min },
        avg: total.checked_div(iterations).unwrap_or_default(),
        max,
    })
}

pub fn run_bench(
    store: &SledDataStore,
    kind: DataKind,
    key: &str,
    iterations: u32,
) -> Result<(), StoreError> {
    let report = measure(store, kind, key, iterations)?;
    println!(
        "{} reads of {} {:?} ({} found)",
        report.reads, kind, key, report.hits
    );
    println!(
        "min {}us  avg {}us  max {}us",
        report.min.as_micros(),
        report.avg.as_micros(),
        report.max.as_micros()
    );
    Ok(())
}
