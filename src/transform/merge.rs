//! Two-level merge-reduce over artifact triples.
//!
//! Stage (a) appends a unit's successful chunk artifacts in sequence order.
//! Stage (b) appends unit artifacts in canonical identity order, so the
//! genome-wide result does not depend on which units were cache hits.

use crate::config::ArtifactLayout;
use crate::error::MergeError;
use crate::index::Identity;
use crate::io::vcf::open_text;
use crate::io::{ArtifactSet, Table};
use crate::pipeline::ChunkResult;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Order-preserving, schema-checked append of artifact triples.
pub trait TableAppender: Send + Sync {
    /// Append `parts` in the given order into a new triple at `dest_prefix`.
    fn append(&self, parts: &[&ArtifactSet], dest_prefix: &Path) -> Result<ArtifactSet, MergeError>;
}

/// Appender for line-oriented tables (VCF records, plain sample and log files).
#[derive(Debug, Clone)]
pub struct TextTableAppender {
    layout: ArtifactLayout,
}

impl TextTableAppender {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    /// Keep the first header; every later column line must match it.
    fn append_records(&self, parts: &[&ArtifactSet], dest: &Path) -> Result<u64, MergeError> {
        let mut out = BufWriter::new(File::create(dest)?);
        let mut expected_columns: Option<String> = None;
        let mut records = 0u64;

        for part in parts {
            let mut header = Vec::new();
            let mut lines = open_text(&part.records)?.lines();
            let mut first_record = None;

            for line in lines.by_ref() {
                let line = line?;
                if line.starts_with('#') {
                    header.push(line);
                } else if !line.is_empty() {
                    first_record = Some(line);
                    break;
                }
            }

            let columns = header.last().cloned().unwrap_or_default();
            match &expected_columns {
                None => {
                    for line in &header {
                        writeln!(out, "{}", line)?;
                    }
                    expected_columns = Some(columns);
                }
                Some(expected) if *expected != columns => {
                    return Err(MergeError::SchemaMismatch {
                        source_path: part.records.clone(),
                        expected: expected.clone(),
                        found: columns,
                    });
                }
                Some(_) => {}
            }

            if let Some(line) = first_record {
                writeln!(out, "{}", line)?;
                records += 1;
            }
            for line in lines {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                writeln!(out, "{}", line)?;
                records += 1;
            }
        }

        out.flush()?;
        Ok(records)
    }

    /// All sample tables must be identical; one copy is kept.
    fn append_samples(&self, parts: &[&ArtifactSet], dest: &Path) -> Result<(), MergeError> {
        let first = std::fs::read(&parts[0].samples)?;
        for part in &parts[1..] {
            if std::fs::read(&part.samples)? != first {
                return Err(MergeError::SampleMismatch {
                    source_path: part.samples.clone(),
                });
            }
        }
        std::fs::write(dest, first)?;
        Ok(())
    }

    fn append_metadata(&self, parts: &[&ArtifactSet], dest: &Path) -> Result<(), MergeError> {
        let mut out = BufWriter::new(File::create(dest)?);
        for part in parts {
            let mut input = File::open(&part.metadata)?;
            std::io::copy(&mut input, &mut out)?;
        }
        out.flush()?;
        Ok(())
    }
}

impl TableAppender for TextTableAppender {
    fn append(&self, parts: &[&ArtifactSet], dest_prefix: &Path) -> Result<ArtifactSet, MergeError> {
        if parts.is_empty() {
            return Err(MergeError::NoInputs);
        }
        if let Some(parent) = dest_prefix.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut merged = ArtifactSet::at(dest_prefix, &self.layout);
        merged.record_count = self.append_records(parts, &merged.records)?;
        self.append_samples(parts, &merged.samples)?;
        self.append_metadata(parts, &merged.metadata)?;
        Ok(merged)
    }
}

/// Stage (a) output for one unit.
#[derive(Debug, Clone)]
pub struct UnitMerge {
    pub identity: Identity,
    pub artifact: ArtifactSet,
    pub chunks_total: usize,
    pub chunks_failed: usize,
}

impl UnitMerge {
    pub fn is_partial(&self) -> bool {
        self.chunks_failed > 0
    }
}

/// Both merge levels over a shared appender.
#[derive(Clone)]
pub struct MergeReducer {
    appender: Arc<dyn TableAppender>,
    layout: ArtifactLayout,
    allow_partial_units: bool,
}

impl MergeReducer {
    pub fn new(
        appender: Arc<dyn TableAppender>,
        layout: ArtifactLayout,
        allow_partial_units: bool,
    ) -> Self {
        Self {
            appender,
            layout,
            allow_partial_units,
        }
    }

    /// Stage (a): merge the final results of every chunk of one unit.
    pub fn merge_unit(
        &self,
        identity: &Identity,
        results: &[ChunkResult],
        dest_prefix: &Path,
    ) -> Result<UnitMerge, MergeError> {
        let mut ok: Vec<&ChunkResult> = results.iter().filter(|r| r.artifact().is_some()).collect();
        let failed = results.len() - ok.len();

        if ok.is_empty() {
            return Err(MergeError::NoSuccessfulChunks {
                identity: identity.to_string(),
                failed,
            });
        }
        if failed > 0 && !self.allow_partial_units {
            return Err(MergeError::IncompleteUnit {
                identity: identity.to_string(),
                failed,
                total: results.len(),
            });
        }

        ok.sort_by_key(|r| r.sequence_index);
        let parts: Vec<&ArtifactSet> = ok.iter().filter_map(|r| r.artifact()).collect();
        let artifact = self.appender.append(&parts, dest_prefix)?;

        Ok(UnitMerge {
            identity: identity.clone(),
            artifact,
            chunks_total: results.len(),
            chunks_failed: failed,
        })
    }

    /// Stage (b): merge unit artifacts in canonical identity order.
    ///
    /// The triple is staged next to `dest_prefix` and renamed into place, so
    /// an earlier genome-wide artifact is only replaced by a complete one.
    pub fn merge_global(
        &self,
        units: &[(Identity, ArtifactSet)],
        dest_prefix: &Path,
    ) -> Result<ArtifactSet, MergeError> {
        let mut ordered: Vec<&(Identity, ArtifactSet)> = units.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        let parts: Vec<&ArtifactSet> = ordered.iter().map(|(_, a)| a).collect();

        let mut staging = dest_prefix.as_os_str().to_owned();
        staging.push(".partial");
        let staged = self.appender.append(&parts, &PathBuf::from(staging))?;

        let mut merged = ArtifactSet::at(dest_prefix, &self.layout);
        for table in Table::ALL {
            std::fs::rename(staged.path(table), merged.path(table))?;
        }
        merged.record_count = staged.record_count;
        Ok(merged)
    }

    /// [`merge_unit`](Self::merge_unit) on the blocking pool.
    pub async fn merge_unit_blocking(
        &self,
        identity: Identity,
        results: Vec<ChunkResult>,
        dest_prefix: PathBuf,
    ) -> Result<UnitMerge, MergeError> {
        let reducer = self.clone();
        tokio::task::spawn_blocking(move || reducer.merge_unit(&identity, &results, &dest_prefix))
            .await
            .map_err(|e| MergeError::Io(std::io::Error::other(e)))?
    }

    /// [`merge_global`](Self::merge_global) on the blocking pool.
    pub async fn merge_global_blocking(
        &self,
        units: Vec<(Identity, ArtifactSet)>,
        dest_prefix: PathBuf,
    ) -> Result<ArtifactSet, MergeError> {
        let reducer = self.clone();
        tokio::task::spawn_blocking(move || reducer.merge_global(&units, &dest_prefix))
            .await
            .map_err(|e| MergeError::Io(std::io::Error::other(e)))?
    }
}
