//! End-of-run summary.
//!
//! Reports, per unit, how it was obtained and what fraction of its chunks
//! failed, so a caller can judge whether a completed run is usable.

use crate::context::Namespace;
use crate::index::Identity;
use crate::io::ArtifactSet;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// How a unit ended up in (or out of) this run's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum UnitStatus {
    /// Processed in this run and cached
    Fresh,
    /// Reused from the cache
    Cached,
    /// No artifact; excluded from the genome-wide merge
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub identity: Identity,
    /// `None` for cache hits not matched by this run's input patterns
    pub source_path: Option<PathBuf>,
    pub status: UnitStatus,
    pub chunks_total: usize,
    pub chunks_failed: usize,
    pub record_count: u64,
    /// Built from a unit with failed chunks
    pub provisional: bool,
}

impl UnitReport {
    pub fn failed_fraction(&self) -> f64 {
        if self.chunks_total == 0 {
            0.0
        } else {
            self.chunks_failed as f64 / self.chunks_total as f64
        }
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub namespace: Namespace,
    pub manifest_path: PathBuf,
    /// Units in canonical order
    pub units: Vec<UnitReport>,
    /// Genome-wide artifact, absent when no unit succeeded
    #[serde(skip)]
    pub global: Option<ArtifactSet>,
    pub global_prefix: Option<PathBuf>,
    pub global_record_count: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunReport {
    pub fn fresh(&self) -> usize {
        self.count(|s| *s == UnitStatus::Fresh)
    }

    pub fn cached(&self) -> usize {
        self.count(|s| *s == UnitStatus::Cached)
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, UnitStatus::Failed(_)))
    }

    pub fn provisional(&self) -> usize {
        self.units.iter().filter(|u| u.provisional).count()
    }

    fn count(&self, pred: impl Fn(&UnitStatus) -> bool) -> usize {
        self.units.iter().filter(|u| pred(&u.status)).count()
    }

    pub fn unit(&self, identity: &str) -> Option<&UnitReport> {
        self.units.iter().find(|u| u.identity.as_str() == identity)
    }

    /// Process exit code: 0 with a genome-wide artifact, 2 without.
    pub fn exit_code(&self) -> i32 {
        if self.global.is_some() {
            0
        } else {
            2
        }
    }

    /// Log every unit that needs attention.
    pub fn log(&self) {
        tracing::info!("{}", self.summary_line());
        for unit in &self.units {
            match &unit.status {
                UnitStatus::Failed(reason) => {
                    tracing::warn!("Unit {} failed: {}", unit.identity, reason)
                }
                _ if unit.provisional => tracing::warn!(
                    "Unit {} is provisional: {}/{} chunks failed",
                    unit.identity,
                    unit.chunks_failed,
                    unit.chunks_total
                ),
                _ => {}
            }
        }
    }

    fn summary_line(&self) -> String {
        format!(
            "Run {}: {} units ({} fresh, {} cached, {} failed, {} provisional) in {:.1}s",
            self.run_id,
            self.units.len(),
            self.fresh(),
            self.cached(),
            self.failed(),
            self.provisional(),
            self.elapsed.as_secs_f64()
        )
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Run Report ===")?;
        writeln!(f, "{}", self.summary_line())?;
        writeln!(f, "Namespace: {}", self.namespace)?;
        writeln!(f, "Manifest:  {}", self.manifest_path.display())?;
        writeln!(
            f,
            "\n{:<16} {:<8} {:>7} {:>7} {:>8} {:>12}  note",
            "unit", "status", "chunks", "failed", "failed%", "records"
        )?;
        for unit in &self.units {
            let (status, note) = match &unit.status {
                UnitStatus::Fresh => ("fresh", String::new()),
                UnitStatus::Cached => ("cached", String::new()),
                UnitStatus::Failed(reason) => ("failed", reason.clone()),
            };
            let note = if unit.provisional {
                format!("provisional {}", note)
            } else {
                note
            };
            writeln!(
                f,
                "{:<16} {:<8} {:>7} {:>7} {:>7.1}% {:>12}  {}",
                unit.identity.as_str(),
                status,
                unit.chunks_total,
                unit.chunks_failed,
                unit.failed_fraction() * 100.0,
                unit.record_count,
                note.trim_end()
            )?;
        }
        match &self.global_prefix {
            Some(prefix) => writeln!(
                f,
                "\nGenome-wide artifact: {}.* ({} records)",
                prefix.display(),
                self.global_record_count
            )?,
            None => writeln!(f, "\nNo genome-wide artifact produced")?,
        }
        write!(f, "==================")
    }
}
