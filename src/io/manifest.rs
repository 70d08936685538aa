//! Append-only run manifest.
//!
//! One JSON object per line: a header describing the run, then one line per
//! resolved chunk attempt, plus a line for every unit that failed as a whole.
//! Each line is flushed as soon as it is written so the file is usable for
//! postmortems even if the process dies. The pipeline never reads it back.

use crate::config::{ResourceClass, ResourceLimits};
use crate::context::RunContext;
use crate::index::Identity;
use crate::pipeline::{ChunkResult, ChunkStatus};
use crate::reference::GenomeBuild;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Seed line of a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub namespace: String,
    pub chunk_size: usize,
    pub source_build: GenomeBuild,
    pub target_build: GenomeBuild,
    pub resources: BTreeMap<ResourceClass, ResourceLimits>,
    pub version: String,
}

/// Outcome of one chunk attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub unit_identity: Identity,
    pub chunk_id: String,
    pub source_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub status: ChunkStatus,
    pub record_count: u64,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_class: Option<ResourceClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&ChunkResult> for ChunkRecord {
    fn from(result: &ChunkResult) -> Self {
        Self {
            unit_identity: result.unit.clone(),
            chunk_id: result.chunk_id.clone(),
            source_path: result.source_path.clone(),
            start_time: result.start_time,
            end_time: result.end_time,
            exit_code: result.exit_code,
            status: result.status(),
            record_count: result.record_count(),
            attempt: result.attempt,
            resource_class: result.resource_override,
            failure: result.outcome.as_ref().err().map(|f| f.to_string()),
        }
    }
}

/// A unit that produced no artifact (chunking or merge failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailureRecord {
    pub unit_identity: Identity,
    pub source_path: PathBuf,
    pub time: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManifestLine {
    Header(ManifestHeader),
    Chunk(ChunkRecord),
    UnitFailure(UnitFailureRecord),
}

/// Writer for one run's manifest file.
pub struct RunManifest {
    path: PathBuf,
    writer: BufWriter<File>,
    chunk_lines: usize,
}

impl RunManifest {
    /// Create `{manifest_dir}/{run_id}.jsonl` and write the header line.
    ///
    /// An existing file is never overwritten; a numeric suffix is added instead.
    pub fn create(ctx: &RunContext) -> Result<Self> {
        std::fs::create_dir_all(&ctx.manifest_dir).with_context(|| {
            format!(
                "Failed to create manifest directory {}",
                ctx.manifest_dir.display()
            )
        })?;

        let (path, file) = open_unique(&ctx.manifest_dir, &ctx.run_id)?;
        let mut manifest = Self {
            path,
            writer: BufWriter::new(file),
            chunk_lines: 0,
        };

        manifest.write_line(&ManifestLine::Header(ManifestHeader {
            run_id: ctx.run_id.clone(),
            started_at: ctx.started_at,
            namespace: ctx.namespace.to_string(),
            chunk_size: ctx.chunk_size,
            source_build: ctx.source_build,
            target_build: ctx.target_build,
            resources: ctx.resources.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))?;

        tracing::info!("Run manifest: {}", manifest.path.display());
        Ok(manifest)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of chunk lines written so far.
    pub fn chunk_lines(&self) -> usize {
        self.chunk_lines
    }

    pub fn record_chunk(&mut self, result: &ChunkResult) -> Result<()> {
        self.write_line(&ManifestLine::Chunk(ChunkRecord::from(result)))?;
        self.chunk_lines += 1;
        Ok(())
    }

    pub fn record_unit_failure(
        &mut self,
        identity: &Identity,
        source_path: &Path,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.write_line(&ManifestLine::UnitFailure(UnitFailureRecord {
            unit_identity: identity.clone(),
            source_path: source_path.to_path_buf(),
            time: Utc::now(),
            reason: reason.into(),
        }))
    }

    fn write_line(&mut self, line: &ManifestLine) -> Result<()> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to write manifest {}", self.path.display()))?;
        Ok(())
    }
}

fn open_unique(dir: &Path, run_id: &str) -> Result<(PathBuf, File)> {
    for n in 0..1000 {
        let name = if n == 0 {
            format!("{}.jsonl", run_id)
        } else {
            format!("{}-{}.jsonl", run_id, n)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create manifest {}", path.display()))
            }
        }
    }
    anyhow::bail!("Too many manifests for run id {} in {}", run_id, dir.display())
}

/// Parse a manifest file (used by tests and external tooling).
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestLine>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).map_err(anyhow::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::FailureKind;
    use crate::io::artifact::ArtifactSet;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> RunContext {
        let mut config = Config::from_yaml(crate::config::tests::MINIMAL_YAML).unwrap();
        config.output.dir = dir.path().to_path_buf();
        RunContext::from_config(&config).unwrap()
    }

    fn result(seq: usize, outcome: Result<ArtifactSet, FailureKind>) -> ChunkResult {
        let now = Utc::now();
        ChunkResult {
            unit: Identity::new("chr1").unwrap(),
            chunk_id: format!("chr1_chunk{:05}", seq),
            sequence_index: seq,
            source_path: PathBuf::from("/data/chr1.vcf.gz"),
            attempt: 1,
            resource_override: None,
            start_time: now,
            end_time: now,
            exit_code: Some(if outcome.is_ok() { 0 } else { 137 }),
            outcome,
        }
    }

    #[test]
    fn test_header_then_flushed_chunk_lines() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut manifest = RunManifest::create(&ctx).unwrap();

        let ok = ArtifactSet {
            record_count: 12,
            ..ArtifactSet::at(Path::new("/w/p"), &Default::default())
        };
        manifest.record_chunk(&result(0, Ok(ok))).unwrap();
        manifest
            .record_chunk(&result(
                1,
                Err(FailureKind::Killed {
                    stage: "ref_align".to_string(),
                    exit_code: 137,
                }),
            ))
            .unwrap();

        // Read without dropping the writer: lines must already be on disk
        let lines = read_manifest(manifest.path()).unwrap();
        assert_eq!(lines.len(), 3);
        assert!(matches!(&lines[0], ManifestLine::Header(h) if h.run_id == ctx.run_id));
        match &lines[1] {
            ManifestLine::Chunk(c) => {
                assert_eq!(c.status, ChunkStatus::Success);
                assert_eq!(c.record_count, 12);
            }
            other => panic!("unexpected line {:?}", other),
        }
        match &lines[2] {
            ManifestLine::Chunk(c) => {
                assert_eq!(c.status, ChunkStatus::Oom);
                assert_eq!(c.record_count, 0);
                assert!(c.failure.as_deref().unwrap().contains("ref_align"));
            }
            other => panic!("unexpected line {:?}", other),
        }
        assert_eq!(manifest.chunk_lines(), 2);
    }

    #[test]
    fn test_existing_manifest_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let first = RunManifest::create(&ctx).unwrap();
        let second = RunManifest::create(&ctx).unwrap();

        assert_ne!(first.path(), second.path());
        assert!(second.path().to_string_lossy().ends_with("-1.jsonl"));
    }

    #[test]
    fn test_kind_tag_on_the_wire() {
        let line = ManifestLine::UnitFailure(UnitFailureRecord {
            unit_identity: Identity::new("chr9").unwrap(),
            source_path: PathBuf::from("/x"),
            time: Utc::now(),
            reason: "empty".to_string(),
        });
        let json = serde_json::to_string(&line).unwrap();
        assert!(json.starts_with("{\"kind\":\"unit_failure\""));
    }
}
