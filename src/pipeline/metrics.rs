//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Chunks produced by the chunker (grows while units are being split)
    pub chunks_total: AtomicU64,

    /// Chunk attempts that produced an artifact
    pub chunks_succeeded: AtomicU64,

    /// Chunk attempts that failed hard
    pub chunks_failed: AtomicU64,

    /// Chunk attempts killed or timed out
    pub chunks_oom: AtomicU64,

    /// OOM chunks redispatched with a larger resource class
    pub chunks_retried: AtomicU64,

    /// Records in successful chunk artifacts
    pub records_out: AtomicU64,

    /// External tool processes started
    pub stage_invocations: AtomicU64,

    /// Units that were split into chunks
    pub units_chunked: AtomicU64,

    /// Units merged and written to the cache
    pub units_merged: AtomicU64,

    /// Units that produced no artifact
    pub units_failed: AtomicU64,

    /// Units served from the cache
    pub cache_hits: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-component timing (in microseconds for precision)
    /// Time spent splitting units
    pub chunking_us: AtomicU64,

    /// Time spent waiting for a worker slot
    pub slot_wait_us: AtomicU64,

    /// Time spent in external tool processes
    pub stage_us: AtomicU64,

    /// Time spent appending tables
    pub merge_us: AtomicU64,

    /// Time spent reading and writing the cache
    pub cache_io_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_chunks(&self, count: u64) {
        self.chunks_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_chunk_succeeded(&self, records: u64) {
        self.chunks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.records_out.fetch_add(records, Ordering::Relaxed);
    }

    pub fn add_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_oom(&self) {
        self.chunks_oom.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_retried(&self) {
        self.chunks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_invocation(&self) {
        self.stage_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unit_chunked(&self) {
        self.units_chunked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unit_merged(&self) {
        self.units_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unit_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunking_time(&self, duration: Duration) {
        self.chunking_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_slot_wait_time(&self, duration: Duration) {
        self.slot_wait_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_stage_time(&self, duration: Duration) {
        self.stage_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_merge_time(&self, duration: Duration) {
        self.merge_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_cache_io_time(&self, duration: Duration) {
        self.cache_io_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Chunk attempts resolved so far (any status).
    pub fn chunks_resolved(&self) -> u64 {
        self.chunks_succeeded.load(Ordering::Relaxed)
            + self.chunks_failed.load(Ordering::Relaxed)
            + self.chunks_oom.load(Ordering::Relaxed)
    }

    /// Get chunks per second.
    pub fn chunks_per_second(&self) -> f64 {
        let chunks = self.chunks_resolved();
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            chunks as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |v: &AtomicU64| v.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            chunks_total: self.chunks_total.load(Ordering::Relaxed),
            chunks_succeeded: self.chunks_succeeded.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            chunks_oom: self.chunks_oom.load(Ordering::Relaxed),
            chunks_retried: self.chunks_retried.load(Ordering::Relaxed),
            records_out: self.records_out.load(Ordering::Relaxed),
            stage_invocations: self.stage_invocations.load(Ordering::Relaxed),
            units_chunked: self.units_chunked.load(Ordering::Relaxed),
            units_merged: self.units_merged.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            chunks_per_second: self.chunks_per_second(),
            chunking_secs: secs(&self.chunking_us),
            slot_wait_secs: secs(&self.slot_wait_us),
            stage_secs: secs(&self.stage_us),
            merge_secs: secs(&self.merge_us),
            cache_io_secs: secs(&self.cache_io_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_total: u64,
    pub chunks_succeeded: u64,
    pub chunks_failed: u64,
    pub chunks_oom: u64,
    pub chunks_retried: u64,
    pub records_out: u64,
    pub stage_invocations: u64,
    pub units_chunked: u64,
    pub units_merged: u64,
    pub units_failed: u64,
    pub cache_hits: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub chunks_per_second: f64,
    /// Time spent splitting units (seconds, summed across threads)
    pub chunking_secs: f64,
    /// Time chunk tasks spent waiting for a worker slot (summed)
    pub slot_wait_secs: f64,
    /// Time spent in external tools (summed)
    pub stage_secs: f64,
    /// Time spent appending tables (summed)
    pub merge_secs: f64,
    /// Time spent on cache transfers (summed)
    pub cache_io_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Percentage of known chunk attempts that resolved.
    pub fn progress_pct(&self) -> f64 {
        let resolved = self.chunks_succeeded + self.chunks_failed + self.chunks_oom;
        let expected = self.chunks_total + self.chunks_retried;
        if expected > 0 {
            resolved as f64 / expected as f64 * 100.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} ok, {} failed, {} oom of {} | Units: {} merged, {} failed, {} cached | \
             Records: {} | Rate: {:.2} chunks/s | Elapsed: {:.1}s",
            self.chunks_succeeded,
            self.chunks_failed,
            self.chunks_oom,
            self.chunks_total,
            self.units_merged,
            self.units_failed,
            self.cache_hits,
            self.records_out,
            self.chunks_per_second,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("[{:.1}%] {}", snapshot.progress_pct(), snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Units chunked: {}", snapshot.units_chunked);
        println!("Units merged: {}", snapshot.units_merged);
        println!("Units failed: {}", snapshot.units_failed);
        println!("Cache hits: {}", snapshot.cache_hits);
        println!("Chunks: {}", snapshot.chunks_total);
        println!("  succeeded: {}", snapshot.chunks_succeeded);
        println!("  failed:    {}", snapshot.chunks_failed);
        println!("  oom:       {}", snapshot.chunks_oom);
        println!("  retried:   {}", snapshot.chunks_retried);
        println!("Records out: {}", snapshot.records_out);
        println!("Stage invocations: {}", snapshot.stage_invocations);
        println!("Processing rate: {:.2} chunks/s", snapshot.chunks_per_second);

        let total_component = snapshot.chunking_secs
            + snapshot.stage_secs
            + snapshot.merge_secs
            + snapshot.cache_io_secs;
        if total_component > 0.0 {
            println!("\n--- Component Time Breakdown ---");
            println!("Chunking:    {:>7.1}s ({:>5.1}%)", snapshot.chunking_secs, snapshot.chunking_secs / total_component * 100.0);
            println!("Stages:      {:>7.1}s ({:>5.1}%)", snapshot.stage_secs, snapshot.stage_secs / total_component * 100.0);
            println!("Merge:       {:>7.1}s ({:>5.1}%)", snapshot.merge_secs, snapshot.merge_secs / total_component * 100.0);
            println!("Cache I/O:   {:>7.1}s ({:>5.1}%)", snapshot.cache_io_secs, snapshot.cache_io_secs / total_component * 100.0);
            println!("Slot wait:   {:>7.1}s", snapshot.slot_wait_secs);
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_counters() {
        let metrics = Metrics::new();

        metrics.add_chunks(10);
        metrics.add_chunk_succeeded(100);
        metrics.add_chunk_succeeded(50);
        metrics.add_chunk_failed();
        metrics.add_chunk_oom();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_total, 10);
        assert_eq!(snapshot.chunks_succeeded, 2);
        assert_eq!(snapshot.records_out, 150);
        assert_eq!(metrics.chunks_resolved(), 4);
        assert!((snapshot.progress_pct() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_retries_extend_progress_denominator() {
        let metrics = Metrics::new();
        metrics.add_chunks(2);
        metrics.add_chunk_succeeded(1);
        metrics.add_chunk_oom();
        metrics.add_chunk_retried();

        let snapshot = metrics.snapshot();
        assert!((snapshot.progress_pct() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_chunking_time(Duration::from_millis(100));
        metrics.add_stage_time(Duration::from_millis(50));
        metrics.add_merge_time(Duration::from_millis(25));
        metrics.add_cache_io_time(Duration::from_millis(75));

        let snapshot = metrics.snapshot();
        assert!((snapshot.chunking_secs - 0.1).abs() < 0.001);
        assert!((snapshot.stage_secs - 0.05).abs() < 0.001);
        assert!((snapshot.merge_secs - 0.025).abs() < 0.001);
        assert!((snapshot.cache_io_secs - 0.075).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        metrics.add_chunks(12);
        metrics.add_chunk_succeeded(30);
        metrics.add_chunk_failed();
        metrics.add_unit_merged();
        metrics.add_cache_hit();

        let display = format!("{}", metrics.snapshot());
        assert!(display.contains("1 ok, 1 failed, 0 oom of 12"));
        assert!(display.contains("1 merged"));
        assert!(display.contains("1 cached"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };
        metrics.add_chunk_failed();
        assert_eq!(metrics.chunks_per_second(), 0.0);
        assert_eq!(metrics.snapshot().progress_pct(), 0.0);
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = Metrics::new();
        metrics.add_stage_invocation();

        metrics.snapshot().save_to_file(path.to_str().unwrap()).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["stage_invocations"], 1);
    }
}
