//! Runs the stage pipeline on one chunk (or one unit, for the prune branch).
//!
//! Every invocation is confined to its own scratch directory. Failures are
//! returned as values; nothing here aborts sibling work.

use super::metrics::Metrics;
use super::scheduler::ResourcePool;
use super::stages::{classify_exit, exit_code, StagePlan, TemplateVars, TIMEOUT_EXIT_CODE};
use crate::config::{ArtifactLayout, ResourceClass, StageSpec};
use crate::error::FailureKind;
use crate::index::{Chunk, Identity};
use crate::io::ArtifactSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Manifest status of a chunk attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChunkStatus {
    Success,
    Failed,
    Oom,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChunkStatus::Success => "SUCCESS",
            ChunkStatus::Failed => "FAILED",
            ChunkStatus::Oom => "OOM",
        })
    }
}

/// Outcome of one stage pipeline attempt on one chunk.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub unit: Identity,
    pub chunk_id: String,
    pub sequence_index: usize,
    pub source_path: PathBuf,
    /// 1 for the first pass, 2 for the OOM retry
    pub attempt: u32,
    /// Resource class forced onto every stage for this attempt
    pub resource_override: Option<ResourceClass>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Exit code of the last stage that ran
    pub exit_code: Option<i32>,
    pub outcome: Result<ArtifactSet, FailureKind>,
}

impl ChunkResult {
    pub fn status(&self) -> ChunkStatus {
        match &self.outcome {
            Ok(_) => ChunkStatus::Success,
            Err(failure) => failure.status(),
        }
    }

    /// Records in the artifact; zero for any failure.
    pub fn record_count(&self) -> u64 {
        self.outcome.as_ref().map(|a| a.record_count).unwrap_or(0)
    }

    pub fn artifact(&self) -> Option<&ArtifactSet> {
        self.outcome.as_ref().ok()
    }

    /// Result for a chunk whose worker task died.
    pub fn crashed(chunk: &Chunk, attempt: u32, started: DateTime<Utc>, message: String) -> Self {
        Self {
            unit: chunk.unit.clone(),
            chunk_id: chunk.chunk_id.clone(),
            sequence_index: chunk.sequence_index,
            source_path: chunk.source_path.clone(),
            attempt,
            resource_override: None,
            start_time: started,
            end_time: Utc::now(),
            exit_code: None,
            outcome: Err(FailureKind::WorkerCrashed { message }),
        }
    }
}

/// Result of running a stage plan once.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub exit_code: Option<i32>,
    pub outcome: Result<ArtifactSet, FailureKind>,
}

/// Executes stage plans as external processes.
pub struct StageRunner {
    plan: StagePlan,
    vars: TemplateVars,
    pool: Arc<ResourcePool>,
    layout: ArtifactLayout,
    timeout: Option<Duration>,
    retry_class: Option<ResourceClass>,
    metrics: Arc<Metrics>,
}

impl StageRunner {
    pub fn new(
        plan: StagePlan,
        vars: TemplateVars,
        pool: Arc<ResourcePool>,
        layout: ArtifactLayout,
        timeout: Option<Duration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            plan,
            vars,
            pool,
            layout,
            timeout,
            retry_class: None,
            metrics,
        }
    }

    /// Redispatch OOM chunks once with every stage in `class`.
    pub fn with_oom_retry(mut self, class: Option<ResourceClass>) -> Self {
        self.retry_class = class;
        self
    }

    /// Run the chunk pipeline, retrying once on OOM if configured.
    ///
    /// Returns every attempt in order; the last one is authoritative.
    pub async fn process_chunk_with_retry(&self, chunk: &Chunk) -> Vec<ChunkResult> {
        let first = self.process_chunk(chunk, 1, None).await;

        match self.retry_class {
            Some(class) if first.status() == ChunkStatus::Oom => {
                tracing::warn!(
                    "Chunk {} hit OOM ({}), retrying with resource class {}",
                    chunk.chunk_id,
                    first.outcome.as_ref().err().map(|e| e.to_string()).unwrap_or_default(),
                    class
                );
                self.metrics.add_chunk_retried();
                let second = self.process_chunk(chunk, 2, Some(class)).await;
                vec![first, second]
            }
            _ => vec![first],
        }
    }

    /// Run the chunk pipeline once.
    pub async fn process_chunk(
        &self,
        chunk: &Chunk,
        attempt: u32,
        class_override: Option<ResourceClass>,
    ) -> ChunkResult {
        let start_time = Utc::now();
        let scratch = scratch_dir(chunk, attempt);
        let plan = match class_override {
            Some(class) => self.plan.with_class(class),
            None => self.plan.clone(),
        };

        let source = chunk.payload.to_string_lossy().to_string();
        let result = self
            .run_plan(&plan, &chunk.chunk_id, &chunk.payload, &source, &scratch)
            .await;

        let result = ChunkResult {
            unit: chunk.unit.clone(),
            chunk_id: chunk.chunk_id.clone(),
            sequence_index: chunk.sequence_index,
            source_path: chunk.source_path.clone(),
            attempt,
            resource_override: class_override,
            start_time,
            end_time: Utc::now(),
            exit_code: result.exit_code,
            outcome: result.outcome,
        };

        match &result.outcome {
            Ok(artifact) => {
                self.metrics.add_chunk_succeeded(artifact.record_count);
                tracing::debug!("Chunk {} succeeded ({} records)", chunk.chunk_id, artifact.record_count);
            }
            Err(failure) => {
                match failure.status() {
                    ChunkStatus::Oom => self.metrics.add_chunk_oom(),
                    _ => self.metrics.add_chunk_failed(),
                }
                tracing::warn!("Chunk {} {}: {}", chunk.chunk_id, failure.status(), failure);
            }
        }
        result
    }

    /// Run `plan` starting from `input`, in `scratch`.
    ///
    /// `name` fills `{chunk}` and `source` fills `{source}`. The final stage's
    /// output is the artifact prefix, which must hold the full table triple.
    pub async fn run_plan(
        &self,
        plan: &StagePlan,
        name: &str,
        input: &Path,
        source: &str,
        scratch: &Path,
    ) -> StageOutcome {
        if let Err(e) = tokio::fs::create_dir_all(scratch).await {
            return StageOutcome {
                exit_code: None,
                outcome: Err(FailureKind::Io {
                    message: format!("creating {}: {}", scratch.display(), e),
                }),
            };
        }

        let mut current = input.to_path_buf();
        let mut last_code = None;

        for stage in plan.stages() {
            match self.run_stage(stage, name, &current, source, scratch).await {
                Ok((output, code)) => {
                    last_code = Some(code);
                    current = output;
                }
                Err((failure, code)) => {
                    return StageOutcome {
                        exit_code: code,
                        outcome: Err(failure),
                    }
                }
            }
        }

        let layout = self.layout.clone();
        let prefix = current.clone();
        let located = tokio::task::spawn_blocking(move || ArtifactSet::locate(&prefix, &layout))
            .await
            .unwrap_or_else(|e| {
                Err(FailureKind::WorkerCrashed {
                    message: e.to_string(),
                })
            });

        StageOutcome {
            exit_code: last_code,
            outcome: located,
        }
    }

    async fn run_stage(
        &self,
        stage: &StageSpec,
        name: &str,
        input: &Path,
        source: &str,
        scratch: &Path,
    ) -> Result<(PathBuf, i32), (FailureKind, Option<i32>)> {
        let threads = self.pool.threads(stage.resource_class);
        let base = self.vars.with_invocation(&[
            ("input", input.to_string_lossy().to_string()),
            ("threads", threads.to_string()),
            ("chunk", name.to_string()),
            ("workdir", scratch.to_string_lossy().to_string()),
            ("source", source.to_string()),
        ]);

        let spawn_err = |message: String| {
            (
                FailureKind::Spawn {
                    stage: stage.name.clone(),
                    message,
                },
                None,
            )
        };

        let output = scratch.join(base.render(&stage.output).map_err(spawn_err)?);
        let vars = base.with_invocation(&[("output", output.to_string_lossy().to_string())]);
        let args = stage
            .args
            .iter()
            .map(|a| vars.render(a))
            .collect::<Result<Vec<_>, _>>()
            .map_err(spawn_err)?;

        let stdout = File::create(scratch.join(format!("{}.out", stage.name)))
            .map_err(|e| spawn_err(e.to_string()))?;
        let stderr = File::create(scratch.join(format!("{}.err", stage.name)))
            .map_err(|e| spawn_err(e.to_string()))?;

        let wait_start = Instant::now();
        let _permit = self
            .pool
            .acquire(stage.resource_class)
            .await
            .map_err(spawn_err)?;
        self.metrics.add_slot_wait_time(wait_start.elapsed());

        tracing::debug!("[{}] {} {} {}", name, stage.name, stage.program, args.join(" "));

        let mut child = Command::new(&stage.program)
            .args(&args)
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(e.to_string()))?;
        self.metrics.add_stage_invocation();

        let run_start = Instant::now();
        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };
        self.metrics.add_stage_time(run_start.elapsed());

        let status = match waited {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                return Err((
                    FailureKind::Io {
                        message: format!("waiting for stage '{}': {}", stage.name, e),
                    },
                    None,
                ))
            }
            None => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill timed-out stage '{}': {}", stage.name, e);
                }
                return Err((
                    FailureKind::TimedOut {
                        stage: stage.name.clone(),
                        after: self.timeout.unwrap_or_default(),
                    },
                    Some(TIMEOUT_EXIT_CODE),
                ));
            }
        };

        let code = exit_code(&status);
        classify_exit(&stage.name, &status).map_err(|failure| (failure, code))?;
        Ok((output, code.unwrap_or(0)))
    }
}

/// Scratch directory of one chunk attempt, next to its payload.
pub fn scratch_dir(chunk: &Chunk, attempt: u32) -> PathBuf {
    let parent = chunk.payload.parent().unwrap_or_else(|| Path::new("."));
    if attempt <= 1 {
        parent.join(&chunk.chunk_id)
    } else {
        parent.join(format!("{}.attempt{}", chunk.chunk_id, attempt))
    }
}
