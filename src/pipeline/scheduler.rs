//! Bounded-concurrency dispatch of chunk tasks.
//!
//! Two limits apply: at most `max_in_flight` chunk tasks are alive at once,
//! and every stage process holds a permit of its resource class while it
//! runs. Results come back in completion order; ordering by sequence index
//! is the merge step's job.

use super::stage_runner::{ChunkResult, StageRunner};
use crate::config::{ResourceClass, ResourceLimits};
use crate::index::Chunk;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Worker slots per resource class.
#[derive(Debug)]
pub struct ResourcePool {
    classes: HashMap<ResourceClass, (Arc<Semaphore>, usize)>,
}

impl ResourcePool {
    pub fn new(resources: &BTreeMap<ResourceClass, ResourceLimits>) -> Self {
        let classes = resources
            .iter()
            .map(|(class, limits)| {
                (
                    *class,
                    (Arc::new(Semaphore::new(limits.workers)), limits.threads),
                )
            })
            .collect();
        Self { classes }
    }

    /// Wait for a worker slot in `class`.
    pub async fn acquire(&self, class: ResourceClass) -> Result<OwnedSemaphorePermit, String> {
        let (semaphore, _) = self
            .classes
            .get(&class)
            .ok_or_else(|| format!("resource class '{}' has no workers", class))?;
        semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| format!("resource class '{}' is closed: {}", class, e))
    }

    /// Threads handed to a process of `class`.
    pub fn threads(&self, class: ResourceClass) -> usize {
        self.classes.get(&class).map(|(_, t)| *t).unwrap_or(1)
    }

    /// Currently free slots in `class`.
    pub fn available(&self, class: ResourceClass) -> usize {
        self.classes
            .get(&class)
            .map(|(s, _)| s.available_permits())
            .unwrap_or(0)
    }
}

/// Processes one chunk into its attempt results.
#[async_trait]
pub trait ChunkWorker: Send + Sync + 'static {
    /// Every attempt in order; the last one is authoritative.
    async fn process(&self, chunk: &Chunk) -> Vec<ChunkResult>;
}

#[async_trait]
impl ChunkWorker for StageRunner {
    async fn process(&self, chunk: &Chunk) -> Vec<ChunkResult> {
        self.process_chunk_with_retry(chunk).await
    }
}

/// All attempts for one dispatched chunk; the last one is final.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub attempts: Vec<ChunkResult>,
}

impl ChunkOutcome {
    pub fn last(&self) -> Option<&ChunkResult> {
        self.attempts.last()
    }

    pub fn into_final(mut self) -> Option<ChunkResult> {
        self.attempts.pop()
    }
}

/// Dispatches chunk tasks onto the Tokio runtime.
pub struct Scheduler {
    worker: Arc<dyn ChunkWorker>,
    max_in_flight: usize,
}

impl Scheduler {
    pub fn new(worker: Arc<dyn ChunkWorker>, max_in_flight: usize) -> Self {
        Self {
            worker,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Run every chunk and stream back exactly one outcome per chunk.
    ///
    /// Chunks are started in the order given. Each runs in its own task; a
    /// panicked or aborted task becomes a `WorkerCrashed` result instead of
    /// disappearing.
    pub fn dispatch(&self, chunks: Vec<Chunk>) -> impl Stream<Item = ChunkOutcome> + Send + 'static {
        tracing::info!(
            "Scheduling {} chunks ({} in flight)",
            chunks.len(),
            self.max_in_flight
        );

        let worker = self.worker.clone();
        stream::iter(chunks)
            .map(move |chunk| {
                let worker = worker.clone();
                async move {
                    let started = Utc::now();
                    let task_chunk = chunk.clone();
                    let handle = tokio::spawn(async move { worker.process(&task_chunk).await });

                    match handle.await {
                        Ok(attempts) if !attempts.is_empty() => ChunkOutcome { attempts },
                        Ok(_) => ChunkOutcome {
                            attempts: vec![ChunkResult::crashed(
                                &chunk,
                                1,
                                started,
                                "worker returned no result".to_string(),
                            )],
                        },
                        Err(e) => {
                            tracing::error!("Worker for chunk {} crashed: {}", chunk.chunk_id, e);
                            ChunkOutcome {
                                attempts: vec![ChunkResult::crashed(&chunk, 1, started, e.to_string())],
                            }
                        }
                    }
                }
            })
            .buffer_unordered(self.max_in_flight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArtifactLayout, StageSpec};
    use crate::error::FailureKind;
    use crate::index::Identity;
    use crate::pipeline::stage_runner::tests::{pool, sh_stage, EMIT_TRIPLE};
    use crate::pipeline::stages::{StagePlan, TemplateVars};
    use crate::pipeline::{ChunkStatus, Metrics};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn chunks(dir: &TempDir, n: usize) -> Vec<Chunk> {
        let header: Vec<String> = crate::io::vcf::tests::HEADER.lines().map(String::from).collect();
        (0..n)
            .map(|i| {
                let id = format!("chr1_chunk{:05}", i);
                let payload = dir.path().join(format!("{}.vcf.gz", id));
                let recs = vec![crate::io::vcf::tests::record(i + 1)];
                crate::io::vcf::write_gz_vcf(&payload, &header, &recs).unwrap();
                Chunk {
                    unit: Identity::new("chr1").unwrap(),
                    sequence_index: i,
                    chunk_id: id,
                    payload,
                    record_count: 1,
                    size_bound: 1,
                    source_path: PathBuf::from("/data/chr1.vcf"),
                }
            })
            .collect()
    }

    fn runner(stage: StageSpec) -> StageRunner {
        StageRunner::new(
            StagePlan::resolve(&[stage], false),
            TemplateVars::default(),
            pool(),
            ArtifactLayout::default(),
            None,
            Metrics::new(),
        )
    }

    fn scheduler(stage: StageSpec, max_in_flight: usize) -> Scheduler {
        Scheduler::new(Arc::new(runner(stage)), max_in_flight)
    }

    #[tokio::test]
    async fn test_resource_pool_limits() {
        let pool = pool();
        assert_eq!(pool.available(ResourceClass::Light), 2);
        assert_eq!(pool.threads(ResourceClass::Heavy), 4);

        let a = pool.acquire(ResourceClass::Light).await.unwrap();
        let _b = pool.acquire(ResourceClass::Light).await.unwrap();
        assert_eq!(pool.available(ResourceClass::Light), 0);
        drop(a);
        assert_eq!(pool.available(ResourceClass::Light), 1);

        assert!(pool.acquire(ResourceClass::Standard).await.is_err());
    }

    #[tokio::test]
    async fn test_every_chunk_yields_one_outcome() {
        let dir = TempDir::new().unwrap();
        // Odd sequence numbers fail
        let script = format!(
            "case \"$3\" in *[13579]) exit 1;; esac; {}",
            EMIT_TRIPLE
        );
        let scheduler = scheduler(sh_stage("s", &script), 3);

        let outcomes: Vec<ChunkOutcome> = scheduler.dispatch(chunks(&dir, 8)).collect().await;
        assert_eq!(outcomes.len(), 8);

        let mut seen: Vec<usize> = outcomes
            .iter()
            .map(|o| o.last().unwrap().sequence_index)
            .collect();
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());

        let failed = outcomes
            .iter()
            .filter(|o| o.last().unwrap().status() == ChunkStatus::Failed)
            .count();
        assert_eq!(failed, 4);
    }

    #[tokio::test]
    async fn test_class_slots_bound_concurrency() {
        let dir = TempDir::new().unwrap();
        // Light has 2 workers: 4 chunks of 300ms need at least two rounds
        let script = format!("sleep 0.3; {}", EMIT_TRIPLE);
        let scheduler = scheduler(sh_stage("s", &script), 8);

        let start = Instant::now();
        let outcomes: Vec<ChunkOutcome> = scheduler.dispatch(chunks(&dir, 4)).collect().await;
        assert!(start.elapsed() >= Duration::from_millis(600));
        assert!(outcomes
            .into_iter()
            .filter_map(ChunkOutcome::into_final)
            .all(|r| r.status() == ChunkStatus::Success));
    }

    /// Runs chunks through a real stage runner, except one that panics.
    struct PanickingWorker {
        inner: StageRunner,
        panic_on: usize,
    }

    #[async_trait]
    impl ChunkWorker for PanickingWorker {
        async fn process(&self, chunk: &Chunk) -> Vec<ChunkResult> {
            if chunk.sequence_index == self.panic_on {
                panic!("worker lost chunk {}", chunk.chunk_id);
            }
            self.inner.process_chunk_with_retry(chunk).await
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_becomes_crashed_result() {
        let dir = TempDir::new().unwrap();
        let worker = PanickingWorker {
            inner: runner(sh_stage("s", EMIT_TRIPLE)),
            panic_on: 2,
        };
        let scheduler = Scheduler::new(Arc::new(worker), 2);

        let outcomes: Vec<ChunkOutcome> = scheduler.dispatch(chunks(&dir, 5)).collect().await;
        assert_eq!(outcomes.len(), 5);

        let mut finals: Vec<ChunkResult> = outcomes
            .into_iter()
            .filter_map(ChunkOutcome::into_final)
            .collect();
        finals.sort_by_key(|r| r.sequence_index);

        let crashed = &finals[2];
        assert_eq!(crashed.chunk_id, "chr1_chunk00002");
        assert_eq!(crashed.status(), ChunkStatus::Failed);
        assert_eq!(crashed.exit_code, None);
        match &crashed.outcome {
            Err(FailureKind::WorkerCrashed { message }) => assert!(message.contains("panic")),
            other => panic!("expected WorkerCrashed, got {:?}", other),
        }

        // Siblings of the crashed chunk all finish
        for result in finals.iter().filter(|r| r.sequence_index != 2) {
            assert_eq!(result.status(), ChunkStatus::Success, "{}", result.chunk_id);
        }
    }
}
