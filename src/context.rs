//! Explicit per-run context.
//!
//! Everything a run needs to know about itself (namespace, chunk size,
//! resource classes, builds, scratch locations) lives here and is passed
//! down by reference. There is no ambient run state.

use crate::config::{Config, ResourceClass, ResourceLimits};
use crate::index::identity::validate_segment;
use crate::index::Identity;
use crate::reference::GenomeBuild;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Suffix of the namespace derived for LD-pruned artifacts.
pub const PRUNED_SUFFIX: &str = ".pruned";

/// Caller-supplied scope for cache keys (e.g. a dataset name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        validate_segment(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace holding LD-pruned unit artifacts.
    pub fn pruned(&self) -> Namespace {
        Namespace(format!("{}{}", self.0, PRUNED_SUFFIX))
    }
}

impl TryFrom<String> for Namespace {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Namespace::new(value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable facts about the current run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Run identifier, derived from the start timestamp
    pub run_id: String,

    /// Run start time
    pub started_at: DateTime<Utc>,

    /// Cache scope
    pub namespace: Namespace,

    /// Maximum records per chunk
    pub chunk_size: usize,

    /// Worker counts and thread counts per resource class
    pub resources: BTreeMap<ResourceClass, ResourceLimits>,

    /// Build of the input units
    pub source_build: GenomeBuild,

    /// Build the pipeline produces
    pub target_build: GenomeBuild,

    /// Scratch root for chunk payloads and stage outputs
    pub work_dir: PathBuf,

    /// Where the genome-wide artifact is written
    pub output_dir: PathBuf,

    /// Where run manifests are written
    pub manifest_dir: PathBuf,
}

impl RunContext {
    /// Build the context for a run starting now.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::from_config_at(config, Utc::now())
    }

    /// Build the context for a run starting at `started_at`.
    pub fn from_config_at(config: &Config, started_at: DateTime<Utc>) -> anyhow::Result<Self> {
        let namespace = Namespace::new(config.namespace.clone())
            .map_err(|e| anyhow::anyhow!("Invalid namespace: {}", e))?;
        let run_id = format!("run_{}", started_at.format("%Y%m%dT%H%M%S%3fZ"));

        Ok(Self {
            work_dir: config.output.work_dir().join(&run_id),
            manifest_dir: config.output.manifest_dir(),
            output_dir: config.output.dir.clone(),
            run_id,
            started_at,
            namespace,
            chunk_size: config.processing.chunk_size,
            resources: config.processing.resources.clone(),
            source_build: config.reference.source_build(),
            target_build: config.reference.target_build,
        })
    }

    /// Scratch directory for one unit.
    pub fn unit_work_dir(&self, identity: &Identity) -> PathBuf {
        self.work_dir.join(identity.as_str())
    }

    /// Prefix of the genome-wide artifact.
    pub fn global_prefix(&self) -> PathBuf {
        self.output_dir.join(self.namespace.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_validation() {
        assert!(Namespace::new("ukb_imputed-v3").is_ok());
        assert!(Namespace::new("").is_err());
        assert!(Namespace::new("a/b").is_err());
        assert_eq!(
            Namespace::new("cohort").unwrap().pruned().as_str(),
            "cohort.pruned"
        );
    }

    #[test]
    fn test_run_id_from_timestamp() {
        let config = Config::from_yaml(crate::config::tests::MINIMAL_YAML).unwrap();
        let started = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        let ctx = RunContext::from_config_at(&config, started).unwrap();

        assert_eq!(ctx.run_id, "run_20260304T050607000Z");
        assert!(ctx.work_dir.ends_with("run_20260304T050607000Z"));
        assert_eq!(ctx.resources[&ResourceClass::Heavy].threads, 8);

        // Runs started within the same second get distinct ids
        let later = DateTime::parse_from_rfc3339("2026-03-04T05:06:07.089Z")
            .unwrap()
            .with_timezone(&Utc);
        let ctx = RunContext::from_config_at(&config, later).unwrap();
        assert_eq!(ctx.run_id, "run_20260304T050607089Z");
    }
}
