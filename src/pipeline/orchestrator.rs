//! Run orchestration.
//!
//! Preconditions are checked before the manifest exists, so a fatal error
//! leaves no trace of chunk work. After that, units are chunked, every chunk
//! is dispatched, results are fanned in per unit, and each completed unit is
//! handed to a merge worker that builds and caches its artifact. The
//! genome-wide artifact is built last from whatever the cache holds for the
//! namespace.

use super::metrics::{Metrics, MetricsReporter};
use super::report::{RunReport, UnitReport, UnitStatus};
use super::scheduler::{ResourcePool, Scheduler};
use super::stage_runner::{ChunkResult, StageRunner};
use super::stages::{StagePlan, TemplateVars};
use crate::config::Config;
use crate::context::{Namespace, RunContext};
use crate::error::CacheError;
use crate::index::{Chunk, Chunker, Identity, InputDiscoverer, InputUnit};
use crate::io::{ArtifactSet, CacheEntry, CacheStore, EntryInfo, RunManifest};
use crate::reference::check_reference;
use crate::transform::{MergeReducer, TextTableAppender};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A unit whose chunks are still being processed.
struct PendingUnit {
    unit: InputUnit,
    expected: usize,
    results: Vec<ChunkResult>,
}

/// A unit with every chunk resolved, ready for merge.
struct UnitWork {
    unit: InputUnit,
    results: Vec<ChunkResult>,
}

/// Drives one pipeline run against a cache.
pub struct Orchestrator {
    config: Arc<Config>,
    ctx: Arc<RunContext>,
    cache: Arc<dyn CacheStore>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    /// Validate `config` and prepare a run starting now.
    pub fn new(config: Config, cache: Arc<dyn CacheStore>) -> Result<Self> {
        config.validate()?;
        let ctx = RunContext::from_config(&config)?;
        Ok(Self {
            config: Arc::new(config),
            ctx: Arc::new(ctx),
            cache,
            metrics: Metrics::new(),
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Discover units and report their cache status without processing.
    pub async fn analyze(&self) -> Result<Vec<InputUnit>> {
        let discoverer = InputDiscoverer::new(&self.config.input)?;
        let units = discoverer
            .discover(self.cache.as_ref(), &self.ctx.namespace)
            .await?;

        let plan = StagePlan::resolve(&self.config.stages, self.config.reference.needs_liftover());
        tracing::info!(
            "Stage plan ({} -> {}): {}",
            self.ctx.source_build,
            self.ctx.target_build,
            plan.stages()
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(units)
    }

    /// Run the pipeline with the periodic progress reporter attached.
    pub async fn run(&self) -> Result<RunReport> {
        let processing = &self.config.processing;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if processing.enable_metrics {
            let reporter = MetricsReporter::new(self.metrics.clone(), processing.metrics_interval_secs);
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            None
        };

        let result = self.execute().await;

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if let Some(path) = &processing.metrics_output_path {
            if let Err(e) = self.metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }

        result
    }

    async fn execute(&self) -> Result<RunReport> {
        let started = Instant::now();
        let config = &self.config;
        let ctx = &self.ctx;
        let liftover = config.reference.needs_liftover();

        tracing::info!(
            "Starting run {} (namespace {}, {} -> {}, chunk size {})",
            ctx.run_id,
            ctx.namespace,
            ctx.source_build,
            ctx.target_build,
            ctx.chunk_size
        );

        // Fatal preconditions: nothing below may run if these fail
        let reference = check_reference(&config.reference)?;
        let discoverer = InputDiscoverer::new(&config.input)?;
        let units = discoverer.discover(self.cache.as_ref(), &ctx.namespace).await?;

        let vars = TemplateVars::for_run(ctx, &config.filters, &reference, &config.artifact);
        let plan = StagePlan::resolve(&config.stages, liftover);
        plan.check(&vars).context("Invalid stage pipeline")?;
        let prune_plan = match &config.prune {
            Some(prune) => {
                let plan = StagePlan::resolve(&prune.stages, liftover);
                plan.check(&vars).context("Invalid prune pipeline")?;
                Some(plan)
            }
            None => None,
        };

        let manifest = Arc::new(Mutex::new(RunManifest::create(ctx)?));
        let manifest_path = lock(&manifest)?.path().to_path_buf();

        let pool = Arc::new(ResourcePool::new(&ctx.resources));
        let runner = Arc::new(
            StageRunner::new(
                plan,
                vars,
                pool,
                config.artifact.clone(),
                config.processing.stage_timeout_secs.map(Duration::from_secs),
                self.metrics.clone(),
            )
            .with_oom_retry(config.processing.oom_retry_class),
        );

        let mut reports: HashMap<Identity, UnitReport> = HashMap::new();
        for unit in units.iter().filter(|u| u.is_cached) {
            self.metrics.add_cache_hit();
            reports.insert(unit.identity.clone(), cached_report(unit));
        }

        let (chunks, pending) = self.chunk_units(&units, &manifest, &mut reports).await?;

        let worker = MergeWorker {
            ctx: self.ctx.clone(),
            cache: self.cache.clone(),
            reducer: MergeReducer::new(
                Arc::new(TextTableAppender::new(config.artifact.clone())),
                config.artifact.clone(),
                config.processing.allow_partial_units,
            ),
            metrics: self.metrics.clone(),
            manifest: manifest.clone(),
            keep_work_dir: config.output.keep_work_dir,
        };
        let fresh = self
            .dispatch_and_merge(runner.clone(), chunks, pending, &manifest, worker)
            .await?;
        for report in fresh {
            reports.insert(report.identity.clone(), report);
        }

        let source_ns = match &prune_plan {
            Some(prune_plan) => {
                for (identity, reason) in self.prune_units(&runner, prune_plan).await? {
                    if let Some(report) = reports.get_mut(&identity) {
                        report.status = UnitStatus::Failed(reason);
                    }
                }
                ctx.namespace.pruned()
            }
            None => ctx.namespace.clone(),
        };

        let global = self.merge_global(&source_ns, &mut reports).await?;

        if !config.output.keep_work_dir {
            if let Err(e) = tokio::fs::remove_dir_all(&ctx.work_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", ctx.work_dir.display(), e);
                }
            }
        }

        let mut units: Vec<UnitReport> = reports.into_values().collect();
        units.sort_by(|a, b| a.identity.cmp(&b.identity));

        let report = RunReport {
            run_id: ctx.run_id.clone(),
            namespace: ctx.namespace.clone(),
            manifest_path,
            units,
            global_prefix: global.as_ref().map(|g| g.prefix.clone()),
            global_record_count: global.as_ref().map(|g| g.record_count).unwrap_or(0),
            global,
            elapsed: started.elapsed(),
        };
        report.log();
        Ok(report)
    }

    /// Split every uncached unit; a unit that cannot be chunked fails alone.
    async fn chunk_units(
        &self,
        units: &[InputUnit],
        manifest: &Mutex<RunManifest>,
        reports: &mut HashMap<Identity, UnitReport>,
    ) -> Result<(Vec<Chunk>, HashMap<Identity, PendingUnit>)> {
        let chunker = Chunker::new(self.ctx.chunk_size);
        let todo: Vec<InputUnit> = units.iter().filter(|u| !u.is_cached).cloned().collect();
        tracing::info!("Chunking {} units", todo.len());

        let metrics = self.metrics.clone();
        let split: Vec<_> = stream::iter(todo)
            .map(|unit| {
                let dir = self.ctx.unit_work_dir(&unit.identity);
                let metrics = metrics.clone();
                async move {
                    let start = Instant::now();
                    let result = chunker.split_blocking(unit.clone(), dir).await;
                    metrics.add_chunking_time(start.elapsed());
                    (unit, result)
                }
            })
            .buffer_unordered(self.config.processing.chunk_concurrency)
            .collect()
            .await;

        let mut chunks = Vec::new();
        let mut pending = HashMap::new();
        for (unit, result) in split {
            match result {
                Ok(unit_chunks) => {
                    tracing::info!("Unit {}: {} chunks", unit.identity, unit_chunks.len());
                    self.metrics.add_unit_chunked();
                    pending.insert(
                        unit.identity.clone(),
                        PendingUnit {
                            expected: unit_chunks.len(),
                            results: Vec::with_capacity(unit_chunks.len()),
                            unit,
                        },
                    );
                    chunks.extend(unit_chunks);
                }
                Err(e) => {
                    tracing::warn!("Unit {} cannot be chunked: {}", unit.identity, e);
                    self.metrics.add_unit_failed();
                    lock(manifest)?.record_unit_failure(&unit.identity, &unit.source_path, e.to_string())?;
                    reports.insert(
                        unit.identity.clone(),
                        failed_report(&unit, 0, 0, format!("chunking failed: {}", e)),
                    );
                }
            }
        }

        chunks.sort_by(|a, b| {
            a.unit
                .cmp(&b.unit)
                .then(a.sequence_index.cmp(&b.sequence_index))
        });
        Ok((chunks, pending))
    }

    /// Dispatch all chunks and merge each unit as soon as its last chunk resolves.
    async fn dispatch_and_merge(
        &self,
        runner: Arc<StageRunner>,
        chunks: Vec<Chunk>,
        mut pending: HashMap<Identity, PendingUnit>,
        manifest: &Mutex<RunManifest>,
        worker: MergeWorker,
    ) -> Result<Vec<UnitReport>> {
        let merge_concurrency = self.config.processing.merge_concurrency;
        let (work_tx, work_rx) = async_channel::bounded::<UnitWork>(pending.len().max(1));

        let mut handles = Vec::with_capacity(merge_concurrency);
        for _ in 0..merge_concurrency {
            let worker = worker.clone();
            let work_rx = work_rx.clone();
            handles.push(tokio::spawn(async move {
                let mut done = Vec::new();
                while let Ok(work) = work_rx.recv().await {
                    done.push(worker.finish_unit(work).await);
                }
                done
            }));
        }

        self.metrics.add_chunks(chunks.len() as u64);
        let scheduler = Scheduler::new(runner, self.config.max_in_flight());
        let mut outcomes = Box::pin(scheduler.dispatch(chunks));

        while let Some(outcome) = outcomes.next().await {
            {
                let mut manifest = lock(manifest)?;
                for attempt in &outcome.attempts {
                    manifest.record_chunk(attempt)?;
                }
            }

            let Some(result) = outcome.into_final() else {
                continue;
            };
            let identity = result.unit.clone();
            let complete = match pending.get_mut(&identity) {
                Some(unit) => {
                    unit.results.push(result);
                    unit.results.len() == unit.expected
                }
                None => {
                    tracing::error!("Result for unknown unit {}", identity);
                    false
                }
            };
            if complete {
                if let Some(unit) = pending.remove(&identity) {
                    work_tx
                        .send(UnitWork {
                            unit: unit.unit,
                            results: unit.results,
                        })
                        .await
                        .context("Merge workers stopped")?;
                }
            }
        }
        work_tx.close();

        if !pending.is_empty() {
            tracing::error!("{} units never resolved all chunks", pending.len());
        }

        let mut reports = Vec::new();
        for handle in handles {
            reports.extend(handle.await.context("Merge worker panicked")?);
        }
        Ok(reports)
    }

    /// Ensure every unit of the namespace has a pruned cache entry.
    ///
    /// Returns the units whose pruning failed, keyed by identity.
    async fn prune_units(
        &self,
        runner: &StageRunner,
        plan: &StagePlan,
    ) -> Result<HashMap<Identity, String>> {
        let ns = &self.ctx.namespace;
        let pruned_ns = ns.pruned();
        let listed = self.cache.list(ns).await?;
        tracing::info!("Pruning {} units into {}", listed.len(), pruned_ns);

        let results: Vec<(Identity, Result<bool>)> = stream::iter(listed)
            .map(|identity| {
                let pruned_ns = pruned_ns.clone();
                async move {
                    let result = self.prune_unit(runner, plan, &pruned_ns, &identity).await;
                    (identity, result)
                }
            })
            .buffer_unordered(self.config.processing.merge_concurrency)
            .collect()
            .await;

        let mut failures = HashMap::new();
        for (identity, result) in results {
            match result {
                Ok(true) => tracing::debug!("Pruned {}", identity),
                Ok(false) => tracing::debug!("Pruned entry for {} already cached", identity),
                Err(e) => {
                    tracing::warn!("Pruning {} failed: {:#}", identity, e);
                    failures.insert(identity, format!("pruning failed: {:#}", e));
                }
            }
        }
        Ok(failures)
    }

    async fn prune_unit(
        &self,
        runner: &StageRunner,
        plan: &StagePlan,
        pruned_ns: &Namespace,
        identity: &Identity,
    ) -> Result<bool> {
        if self.cache.has(pruned_ns, identity).await? {
            return Ok(false);
        }
        let entry = self
            .cache
            .entry(&self.ctx.namespace, identity)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unit entry disappeared from the cache"))?;

        let dir = self.ctx.work_dir.join("prune").join(identity.as_str());
        let cache_start = Instant::now();
        let artifact = self
            .cache
            .get(&self.ctx.namespace, identity, &dir.join("unit"))
            .await?;
        self.metrics.add_cache_io_time(cache_start.elapsed());

        let source = artifact.prefix.to_string_lossy().to_string();
        let outcome = runner
            .run_plan(plan, identity.as_str(), &artifact.prefix, &source, &dir.join("scratch"))
            .await;
        let pruned = outcome.outcome?;

        let info = EntryInfo {
            run_id: self.ctx.run_id.clone(),
            chunks_total: entry.chunks_total,
            chunks_failed: entry.chunks_failed,
        };
        match self.cache.put(pruned_ns, identity, &pruned, info).await {
            Ok(_) | Err(CacheError::AlreadyPresent { .. }) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage (b) over every hit in `source_ns`, in canonical order.
    async fn merge_global(
        &self,
        source_ns: &Namespace,
        reports: &mut HashMap<Identity, UnitReport>,
    ) -> Result<Option<ArtifactSet>> {
        let listed = self.cache.list(source_ns).await?;
        let dir = self.ctx.work_dir.join("global");
        let cache = self.cache.clone();

        let cache_start = Instant::now();
        let fetched: Vec<_> = stream::iter(listed)
            .map(|identity| {
                let dest = dir.join(identity.as_str());
                fetch_unit(cache.as_ref(), source_ns, identity, dest)
            })
            .buffered(self.config.processing.merge_concurrency)
            .collect()
            .await;
        self.metrics.add_cache_io_time(cache_start.elapsed());

        let mut parts = Vec::new();
        for item in fetched {
            let Some((identity, entry, artifact)) =
                item.context("Failed to read unit artifact for genome-wide merge")?
            else {
                continue;
            };
            match reports.get_mut(&identity) {
                Some(report) if report.status == UnitStatus::Cached => {
                    report.chunks_total = entry.chunks_total;
                    report.chunks_failed = entry.chunks_failed;
                    report.record_count = entry.record_count;
                }
                Some(_) => {}
                // Hit from an earlier run that this run's patterns did not match
                None => {
                    reports.insert(identity.clone(), entry_report(&identity, &entry));
                }
            }
            parts.push((identity, artifact));
        }

        if parts.is_empty() {
            tracing::warn!("No unit artifacts in {}; no genome-wide artifact produced", source_ns);
            return Ok(None);
        }

        tracing::info!(
            "Merging {} unit artifacts into {}",
            parts.len(),
            self.ctx.global_prefix().display()
        );
        tokio::fs::create_dir_all(&self.ctx.output_dir).await?;

        let start = Instant::now();
        let reducer = MergeReducer::new(
            Arc::new(TextTableAppender::new(self.config.artifact.clone())),
            self.config.artifact.clone(),
            self.config.processing.allow_partial_units,
        );
        let global = reducer
            .merge_global_blocking(parts, self.ctx.global_prefix())
            .await
            .context("Genome-wide merge failed")?;
        self.metrics.add_merge_time(start.elapsed());

        tracing::info!(
            "Genome-wide artifact: {} ({} records)",
            global.records.display(),
            global.record_count
        );
        Ok(Some(global))
    }
}

/// Read back one unit artifact; `None` if the key is no longer a hit.
async fn fetch_unit(
    cache: &dyn CacheStore,
    namespace: &Namespace,
    identity: Identity,
    dest: PathBuf,
) -> Result<Option<(Identity, CacheEntry, ArtifactSet)>> {
    let Some(entry) = cache.entry(namespace, &identity).await? else {
        return Ok(None);
    };
    let artifact = cache.get(namespace, &identity, &dest).await?;
    Ok(Some((identity, entry, artifact)))
}

fn lock(manifest: &Mutex<RunManifest>) -> Result<std::sync::MutexGuard<'_, RunManifest>> {
    manifest
        .lock()
        .map_err(|_| anyhow::anyhow!("Run manifest lock poisoned"))
}

fn cached_report(unit: &InputUnit) -> UnitReport {
    UnitReport {
        identity: unit.identity.clone(),
        source_path: Some(unit.source_path.clone()),
        status: UnitStatus::Cached,
        chunks_total: 0,
        chunks_failed: 0,
        record_count: 0,
        provisional: unit.provisional,
    }
}

fn entry_report(identity: &Identity, entry: &CacheEntry) -> UnitReport {
    UnitReport {
        identity: identity.clone(),
        source_path: None,
        status: UnitStatus::Cached,
        chunks_total: entry.chunks_total,
        chunks_failed: entry.chunks_failed,
        record_count: entry.record_count,
        provisional: !entry.complete,
    }
}

fn failed_report(unit: &InputUnit, total: usize, failed: usize, reason: String) -> UnitReport {
    UnitReport {
        identity: unit.identity.clone(),
        source_path: Some(unit.source_path.clone()),
        status: UnitStatus::Failed(reason),
        chunks_total: total,
        chunks_failed: failed,
        record_count: 0,
        provisional: false,
    }
}

/// Per-unit merge, cache write and scratch cleanup.
#[derive(Clone)]
struct MergeWorker {
    ctx: Arc<RunContext>,
    cache: Arc<dyn CacheStore>,
    reducer: MergeReducer,
    metrics: Arc<Metrics>,
    manifest: Arc<Mutex<RunManifest>>,
    keep_work_dir: bool,
}

impl MergeWorker {
    async fn finish_unit(&self, work: UnitWork) -> UnitReport {
        let unit = work.unit;
        let total = work.results.len();
        let failed = work.results.iter().filter(|r| r.artifact().is_none()).count();
        let unit_dir = self.ctx.unit_work_dir(&unit.identity);

        let report = match self.merge_and_cache(&unit, work.results, &unit_dir).await {
            Ok(report) => report,
            Err(reason) => {
                tracing::warn!("Unit {} failed: {}", unit.identity, reason);
                self.metrics.add_unit_failed();
                match lock(&self.manifest) {
                    Ok(mut manifest) => {
                        if let Err(e) =
                            manifest.record_unit_failure(&unit.identity, &unit.source_path, reason.clone())
                        {
                            tracing::error!("Failed to record unit failure: {:#}", e);
                        }
                    }
                    Err(e) => tracing::error!("{}", e),
                }
                failed_report(&unit, total, failed, reason)
            }
        };

        if !self.keep_work_dir {
            cleanup(&unit_dir).await;
        }
        report
    }

    async fn merge_and_cache(
        &self,
        unit: &InputUnit,
        results: Vec<ChunkResult>,
        unit_dir: &Path,
    ) -> Result<UnitReport, String> {
        let start = Instant::now();
        let prefix: PathBuf = unit_dir.join(unit.identity.as_str());
        let merged = self
            .reducer
            .merge_unit_blocking(unit.identity.clone(), results, prefix)
            .await
            .map_err(|e| e.to_string())?;
        self.metrics.add_merge_time(start.elapsed());

        if merged.is_partial() {
            tracing::warn!(
                "Unit {} merged with {}/{} chunks failed; cached as provisional",
                unit.identity,
                merged.chunks_failed,
                merged.chunks_total
            );
        }

        let info = EntryInfo {
            run_id: self.ctx.run_id.clone(),
            chunks_total: merged.chunks_total,
            chunks_failed: merged.chunks_failed,
        };
        let cache_start = Instant::now();
        let status = match self
            .cache
            .put(&self.ctx.namespace, &unit.identity, &merged.artifact, info)
            .await
        {
            Ok(_) => UnitStatus::Fresh,
            Err(CacheError::AlreadyPresent { .. }) => {
                tracing::warn!(
                    "Unit {} was cached by another run meanwhile; keeping the existing entry",
                    unit.identity
                );
                UnitStatus::Cached
            }
            Err(e) => return Err(format!("cache write failed: {}", e)),
        };
        self.metrics.add_cache_io_time(cache_start.elapsed());
        self.metrics.add_unit_merged();

        tracing::info!(
            "Unit {} merged: {} records from {} chunks",
            unit.identity,
            merged.artifact.record_count,
            merged.chunks_total
        );

        Ok(UnitReport {
            identity: unit.identity.clone(),
            source_path: Some(unit.source_path.clone()),
            status,
            chunks_total: merged.chunks_total,
            chunks_failed: merged.chunks_failed,
            record_count: merged.artifact.record_count,
            provisional: merged.is_partial(),
        })
    }
}

async fn cleanup(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove scratch {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::MINIMAL_YAML;

    struct NoCache;

    #[async_trait::async_trait]
    impl CacheStore for NoCache {
        async fn entry(&self, _: &Namespace, _: &Identity) -> Result<Option<CacheEntry>, CacheError> {
            Ok(None)
        }

        async fn put(
            &self,
            ns: &Namespace,
            id: &Identity,
            _: &ArtifactSet,
            _: EntryInfo,
        ) -> Result<CacheEntry, CacheError> {
            Err(CacheError::AlreadyPresent {
                namespace: ns.to_string(),
                identity: id.to_string(),
            })
        }

        async fn get(&self, ns: &Namespace, id: &Identity, _: &Path) -> Result<ArtifactSet, CacheError> {
            Err(CacheError::NotFound {
                namespace: ns.to_string(),
                identity: id.to_string(),
            })
        }

        async fn list(&self, _: &Namespace) -> Result<Vec<Identity>, CacheError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.processing.chunk_size = 0;
        assert!(Orchestrator::new(config, Arc::new(NoCache)).is_err());
    }

    #[test]
    fn test_context_is_built_once() {
        let config = Config::from_yaml(MINIMAL_YAML).unwrap();
        let orchestrator = Orchestrator::new(config, Arc::new(NoCache)).unwrap();
        assert_eq!(orchestrator.context().namespace.as_str(), "cohort_a");
        assert!(orchestrator.context().run_id.starts_with("run_"));
    }
}
