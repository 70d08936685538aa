//! Configuration for the chunked variant pipeline.

use crate::context::PRUNED_SUFFIX;
use crate::index::identity::validate_segment;
use crate::reference::ReferenceConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cache scope (dataset name). Units are cached per namespace.
    pub namespace: String,

    /// Input unit discovery
    pub input: InputConfig,

    /// Persistent unit cache
    pub cache: CacheConfig,

    /// Output locations
    pub output: OutputConfig,

    /// Reference data and genome builds
    pub reference: ReferenceConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Thresholds rendered into stage arguments
    #[serde(default)]
    pub filters: FilterConfig,

    /// File extensions of the artifact table triple
    #[serde(default)]
    pub artifact: ArtifactLayout,

    /// Ordered per-chunk stage pipeline
    #[serde(default = "default_stages")]
    pub stages: Vec<StageSpec>,

    /// Optional per-unit LD pruning before the genome-wide merge
    #[serde(default)]
    pub prune: Option<PruneConfig>,
}

/// Input unit discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Glob patterns resolving to one file per unit
    pub patterns: Vec<String>,

    /// Regex applied to the file name to extract the unit identity.
    /// The first capture group is used if present, otherwise the whole match.
    /// Without a pattern the identity is the file name minus VCF extensions.
    #[serde(default)]
    pub identity_pattern: Option<String>,
}

/// Cache location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Local directory or `s3://bucket/prefix`
    pub location: String,
}

impl CacheConfig {
    /// Check if the cache lives on the local filesystem.
    pub fn is_local(&self) -> bool {
        !self.location.starts_with("s3://")
    }
}

/// Output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving the genome-wide artifact
    pub dir: PathBuf,

    /// Scratch root (default: `{dir}/work`)
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Run manifest directory (default: `{dir}/manifests`)
    #[serde(default)]
    pub manifest_dir: Option<PathBuf>,

    /// Keep chunk payloads and stage outputs after a unit is cached
    #[serde(default)]
    pub keep_work_dir: bool,
}

impl OutputConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| self.dir.join("work"))
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.manifest_dir
            .clone()
            .unwrap_or_else(|| self.dir.join("manifests"))
    }
}

/// Worker pool a stage runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Light,
    #[default]
    Standard,
    Heavy,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Light => "light",
            ResourceClass::Standard => "standard",
            ResourceClass::Heavy => "heavy",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(ResourceClass::Light),
            "standard" => Ok(ResourceClass::Standard),
            "heavy" => Ok(ResourceClass::Heavy),
            other => Err(format!(
                "unknown resource class '{}' (expected light, standard or heavy)",
                other
            )),
        }
    }
}

/// Limits of one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Concurrent stage processes in this class
    pub workers: usize,

    /// Threads handed to each process (`{threads}`)
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            workers: 1,
            threads: default_threads(),
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum records per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Worker pool per resource class
    #[serde(default = "default_resources")]
    pub resources: BTreeMap<ResourceClass, ResourceLimits>,

    /// Maximum chunk tasks alive at once (default: sum of workers)
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    /// Units split into chunks concurrently
    #[serde(default = "default_chunk_concurrency")]
    pub chunk_concurrency: usize,

    /// Concurrent per-unit merge workers
    #[serde(default = "default_merge_concurrency")]
    pub merge_concurrency: usize,

    /// Per-stage timeout; a timed-out stage is killed and classified OOM
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,

    /// Merge and cache units that lost some chunks
    #[serde(default = "default_true")]
    pub allow_partial_units: bool,

    /// Redispatch OOM chunks once with every stage in this class
    #[serde(default)]
    pub oom_retry_class: Option<ResourceClass>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            resources: default_resources(),
            max_in_flight: None,
            chunk_concurrency: default_chunk_concurrency(),
            merge_concurrency: default_merge_concurrency(),
            stage_timeout_secs: None,
            allow_partial_units: true,
            oom_retry_class: None,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Thresholds passed to the external tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Minimum imputation quality (`{quality}`)
    #[serde(default = "default_quality")]
    pub quality: f64,

    /// Minimum allele count (`{min_ac}`)
    #[serde(default = "default_min_allele_count")]
    pub min_allele_count: u32,

    /// Maximum per-variant missingness (`{max_missing}`)
    #[serde(default = "default_max_missingness")]
    pub max_missingness: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            min_allele_count: default_min_allele_count(),
            max_missingness: default_max_missingness(),
        }
    }
}

/// Extensions of the table triple found at `{prefix}.*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLayout {
    /// Variant records table
    #[serde(default = "default_records_ext")]
    pub records: String,

    /// Sample table
    #[serde(default = "default_samples_ext")]
    pub samples: String,

    /// Metadata / tool log
    #[serde(default = "default_metadata_ext")]
    pub metadata: String,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            records: default_records_ext(),
            samples: default_samples_ext(),
            metadata: default_metadata_ext(),
        }
    }
}

/// When a stage takes part in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageCondition {
    #[default]
    Always,
    /// Only when the source build differs from the target build
    Liftover,
}

/// One external tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage name, used in logs and scratch file names
    pub name: String,

    /// Executable
    pub program: String,

    /// Argument templates
    #[serde(default)]
    pub args: Vec<String>,

    /// Output path template, relative to the scratch directory
    pub output: String,

    /// Worker pool the process runs in
    #[serde(default)]
    pub resource_class: ResourceClass,

    /// Inclusion condition
    #[serde(default)]
    pub when: StageCondition,
}

/// Per-unit LD pruning branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Stages applied to each unit artifact; `{input}` starts as the unit prefix
    #[serde(default = "default_prune_stages")]
    pub stages: Vec<StageSpec>,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            stages: default_prune_stages(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // YAML is a superset of JSON
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Turn on the LD pruning branch with its default stages unless configured.
    pub fn enable_prune(&mut self) {
        if self.prune.is_none() {
            self.prune = Some(PruneConfig::default());
        }
    }

    /// Maximum chunk tasks alive at once.
    pub fn max_in_flight(&self) -> usize {
        self.processing.max_in_flight.unwrap_or_else(|| {
            self.processing
                .resources
                .values()
                .map(|l| l.workers)
                .sum::<usize>()
                .max(1)
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Err(e) = validate_segment(&self.namespace) {
            anyhow::bail!("Invalid namespace '{}': {}", self.namespace, e);
        }
        if self.namespace.ends_with(PRUNED_SUFFIX) {
            anyhow::bail!(
                "Invalid namespace '{}': the '{}' suffix is reserved for the prune branch",
                self.namespace,
                PRUNED_SUFFIX
            );
        }
        if self.input.patterns.is_empty() {
            anyhow::bail!("At least one input pattern is required");
        }
        if let Some(pattern) = &self.input.identity_pattern {
            if let Err(e) = regex::Regex::new(pattern) {
                anyhow::bail!("Invalid identity_pattern '{}': {}", pattern, e);
            }
        }
        if self.cache.location.is_empty() {
            anyhow::bail!("Cache location must not be empty");
        }
        if self.processing.chunk_size == 0 {
            anyhow::bail!("Chunk size must be > 0");
        }
        if self.processing.chunk_concurrency == 0 {
            anyhow::bail!("chunk_concurrency must be > 0");
        }
        if self.processing.merge_concurrency == 0 {
            anyhow::bail!("merge_concurrency must be > 0");
        }
        if self.processing.max_in_flight == Some(0) {
            anyhow::bail!("max_in_flight must be > 0");
        }
        if self.processing.stage_timeout_secs == Some(0) {
            anyhow::bail!("stage_timeout_secs must be > 0");
        }
        for (class, limits) in &self.processing.resources {
            if limits.workers == 0 {
                anyhow::bail!("Resource class '{}' must have at least one worker", class);
            }
            if limits.threads == 0 {
                anyhow::bail!("Resource class '{}' must have at least one thread", class);
            }
        }
        if let Some(class) = self.processing.oom_retry_class {
            if !self.processing.resources.contains_key(&class) {
                anyhow::bail!("oom_retry_class '{}' has no configured workers", class);
            }
        }
        if !(0.0..=1.0).contains(&self.filters.quality) {
            anyhow::bail!("Quality threshold must be within 0-1");
        }
        if !(0.0..=1.0).contains(&self.filters.max_missingness) {
            anyhow::bail!("Missingness threshold must be within 0-1");
        }

        let exts = [
            &self.artifact.records,
            &self.artifact.samples,
            &self.artifact.metadata,
        ];
        for ext in exts {
            if let Err(e) = validate_segment(ext) {
                anyhow::bail!("Invalid artifact extension '{}': {}", ext, e);
            }
        }
        if exts.iter().collect::<HashSet<_>>().len() != exts.len() {
            anyhow::bail!("Artifact table extensions must be distinct");
        }

        if self.stages.is_empty() {
            anyhow::bail!("The stage pipeline must have at least one stage");
        }
        self.validate_stages(&self.stages, "stages")?;
        if let Some(prune) = &self.prune {
            if prune.stages.is_empty() {
                anyhow::bail!("The prune branch must have at least one stage");
            }
            self.validate_stages(&prune.stages, "prune.stages")?;
        }
        Ok(())
    }

    fn validate_stages(&self, stages: &[StageSpec], section: &str) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for stage in stages {
            if let Err(e) = validate_segment(&stage.name) {
                anyhow::bail!("Invalid stage name in {}: {}", section, e);
            }
            if !names.insert(stage.name.as_str()) {
                anyhow::bail!("Duplicate stage name '{}' in {}", stage.name, section);
            }
            if stage.program.is_empty() {
                anyhow::bail!("Stage '{}' has no program", stage.name);
            }
            if stage.output.is_empty() {
                anyhow::bail!("Stage '{}' has no output template", stage.name);
            }
            if !self.processing.resources.contains_key(&stage.resource_class) {
                anyhow::bail!(
                    "Stage '{}' uses resource class '{}' which has no configured workers",
                    stage.name,
                    stage.resource_class
                );
            }
        }
        if stages.iter().all(|s| s.when == StageCondition::Liftover) && !self.reference.needs_liftover() {
            anyhow::bail!("Every stage in {} is conditional on liftover, which is not needed", section);
        }
        Ok(())
    }
}

fn stage(
    name: &str,
    program: &str,
    args: &[&str],
    output: &str,
    resource_class: ResourceClass,
    when: StageCondition,
) -> StageSpec {
    StageSpec {
        name: name.to_string(),
        program: program.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        output: output.to_string(),
        resource_class,
        when,
    }
}

/// The standard nine-stage chunk pipeline.
pub fn default_stages() -> Vec<StageSpec> {
    use ResourceClass::{Heavy, Light, Standard};
    use StageCondition::{Always, Liftover};

    vec![
        stage(
            "quality_filter",
            "bcftools",
            &["view", "--threads", "{threads}", "-i", "INFO/R2>{quality}", "-Oz", "-o", "{output}", "{input}"],
            "{chunk}.qc.vcf.gz",
            Light,
            Always,
        ),
        stage(
            "liftover",
            "bcftools",
            &[
                "+liftover", "--no-version", "-Oz", "-o", "{output}", "{input}", "--",
                "-s", "{source_fasta}", "-f", "{reference_fasta}", "-c", "{chain}",
            ],
            "{chunk}.lifted.vcf.gz",
            Standard,
            Liftover,
        ),
        stage(
            "split_multiallelic",
            "bcftools",
            &["norm", "--threads", "{threads}", "-m", "-any", "-Oz", "-o", "{output}", "{input}"],
            "{chunk}.split.vcf.gz",
            Light,
            Always,
        ),
        stage(
            "left_normalize",
            "bcftools",
            &[
                "norm", "--threads", "{threads}", "-f", "{reference_fasta}", "-c", "s",
                "-Oz", "-o", "{output}", "{input}",
            ],
            "{chunk}.norm.vcf.gz",
            Standard,
            Always,
        ),
        stage(
            "biallelic_min_ac",
            "bcftools",
            &["view", "--threads", "{threads}", "-m2", "-M2", "-c", "{min_ac}", "-Oz", "-o", "{output}", "{input}"],
            "{chunk}.biallelic.vcf.gz",
            Light,
            Always,
        ),
        stage(
            "ref_align",
            "plink2",
            &[
                "--threads", "{threads}", "--vcf", "{input}", "dosage=DS", "--fa", "{reference_fasta}",
                "--ref-from-fa", "force", "--make-pgen", "--out", "{output}",
            ],
            "{chunk}.aligned",
            Heavy,
            Always,
        ),
        stage(
            "rename_ids",
            "plink2",
            &[
                "--threads", "{threads}", "--pfile", "{input}", "--set-all-var-ids", "@:#:$r:$a",
                "--new-id-max-allele-len", "1000", "truncate", "--make-pgen", "--out", "{output}",
            ],
            "{chunk}.renamed",
            Standard,
            Always,
        ),
        stage(
            "dedup",
            "plink2",
            &["--threads", "{threads}", "--pfile", "{input}", "--rm-dup", "exclude-all", "--make-pgen", "--out", "{output}"],
            "{chunk}.dedup",
            Standard,
            Always,
        ),
        stage(
            "missingness",
            "plink2",
            &[
                "--threads", "{threads}", "--pfile", "{input}", "--geno", "{max_missing}",
                "--export", "vcf", "--make-just-psam", "--out", "{output}",
            ],
            "{chunk}.final",
            Standard,
            Always,
        ),
    ]
}

/// Default LD pruning branch: compute the pruned set, then extract it.
pub fn default_prune_stages() -> Vec<StageSpec> {
    vec![
        stage(
            "ld_prune",
            "plink2",
            &[
                "--threads", "{threads}", "--vcf", "{source}.{records_ext}", "--indep-pairwise", "500kb", "0.2",
                "--out", "{output}",
            ],
            "{chunk}.ld",
            ResourceClass::Heavy,
            StageCondition::Always,
        ),
        stage(
            "extract_pruned",
            "plink2",
            &[
                "--threads", "{threads}", "--vcf", "{source}.{records_ext}", "--extract", "{input}.prune.in",
                "--export", "vcf", "--make-just-psam", "--out", "{output}",
            ],
            "{chunk}.pruned",
            ResourceClass::Standard,
            StageCondition::Always,
        ),
    ]
}

// Default value functions for serde
fn default_chunk_size() -> usize { 30_000 }
fn default_threads() -> usize { 1 }
fn default_chunk_concurrency() -> usize { 4 }
fn default_merge_concurrency() -> usize { 2 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 30 }
fn default_quality() -> f64 { 0.3 }
fn default_min_allele_count() -> u32 { 1 }
fn default_max_missingness() -> f64 { 0.1 }
fn default_records_ext() -> String { "vcf".to_string() }
fn default_samples_ext() -> String { "psam".to_string() }
fn default_metadata_ext() -> String { "log".to_string() }

fn default_resources() -> BTreeMap<ResourceClass, ResourceLimits> {
    BTreeMap::from([
        (ResourceClass::Light, ResourceLimits { workers: 8, threads: 1 }),
        (ResourceClass::Standard, ResourceLimits { workers: 4, threads: 2 }),
        (ResourceClass::Heavy, ResourceLimits { workers: 1, threads: 8 }),
    ])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL_YAML: &str = r#"
namespace: cohort_a
input:
  patterns: ["/data/imputed/chr*.dose.vcf.gz"]
  identity_pattern: "(chr[0-9XYM]+)"
cache:
  location: /data/cache
output:
  dir: /data/out
reference:
  fasta: /ref/GRCh38.fa
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml(MINIMAL_YAML).unwrap();
        assert_eq!(config.processing.chunk_size, 30_000);
        assert!(config.processing.allow_partial_units);
        assert_eq!(config.stages.len(), 9);
        assert_eq!(config.stages[1].when, StageCondition::Liftover);
        assert_eq!(config.artifact, ArtifactLayout::default());
        assert_eq!(config.max_in_flight(), 13);
        assert_eq!(config.output.work_dir(), PathBuf::from("/data/out/work"));
        assert_eq!(config.output.manifest_dir(), PathBuf::from("/data/out/manifests"));
        assert!(config.cache.is_local());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_stages() {
        let config = Config::from_yaml(MINIMAL_YAML).unwrap();
        let yaml = config.to_yaml().unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(back.stages, config.stages);
        assert_eq!(back.processing.resources, config.processing.resources);
    }

    #[test]
    fn test_json_config() {
        let json = r#"{
            "namespace": "ns",
            "input": {"patterns": ["*.vcf"]},
            "cache": {"location": "s3://bucket/cache"},
            "output": {"dir": "/out"},
            "reference": {"fasta": "/ref.fa", "source_build": "hg19", "chain": "/c.chain"},
            "processing": {"chunk_size": 500, "resources": {"standard": {"workers": 2}}},
            "stages": [{"name": "only", "program": "true", "output": "{chunk}.out"}]
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.processing.chunk_size, 500);
        assert_eq!(config.processing.resources[&ResourceClass::Standard].threads, 1);
        assert!(!config.cache.is_local());
        assert!(config.reference.needs_liftover());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.processing.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.namespace = "bad/name".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.namespace = "cohort.pruned".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reserved"));
        config.namespace = "cohort.pruned_v2".to_string();
        assert!(config.validate().is_ok());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.processing.resources.remove(&ResourceClass::Heavy);
        assert!(config.validate().is_err(), "ref_align needs the heavy class");

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.stages[3].name = config.stages[2].name.clone();
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.artifact.samples = "vcf".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::from_yaml(MINIMAL_YAML).unwrap();
        config.input.identity_pattern = Some("(chr".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resource_class_parse() {
        assert_eq!("HEAVY".parse::<ResourceClass>().unwrap(), ResourceClass::Heavy);
        assert!("huge".parse::<ResourceClass>().is_err());
    }
}
