//! genochunk CLI
//!
//! Chunk, process, cache and merge per-chromosome variant files.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use genochunk::pipeline::MetricsReporter;
use genochunk::{
    analyze_units, build_runtime, open_cache, Config, GenomeBuild, Orchestrator, ResourceClass,
};

#[derive(Parser)]
#[command(name = "genochunk")]
#[command(about = "Chunked, cached merge-reduce over per-chromosome variant files", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Settings that take precedence over the configuration file.
#[derive(Args, Default)]
struct Overrides {
    /// Cache namespace (e.g. dataset name)
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Maximum records per chunk
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Worker count for a resource class, as CLASS=N (repeatable)
    #[arg(long = "workers", value_parser = parse_workers, global = true)]
    workers: Vec<(ResourceClass, usize)>,

    /// Build of the input units (GRCh37/hg19 or GRCh38/hg38)
    #[arg(long, global = true)]
    source_build: Option<GenomeBuild>,

    /// Redispatch OOM chunks once with every stage in this class
    #[arg(long, global = true)]
    oom_retry_class: Option<ResourceClass>,

    /// Run the LD pruning branch before the genome-wide merge
    #[arg(long, global = true)]
    prune: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Discover units and show cache status without processing
    Analyze,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn parse_workers(s: &str) -> Result<(ResourceClass, usize), String> {
    let (class, count) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CLASS=N, got '{}'", s))?;
    let class: ResourceClass = class.trim().parse()?;
    let count: usize = count
        .trim()
        .parse()
        .map_err(|e| format!("invalid worker count '{}': {}", count, e))?;
    Ok((class, count))
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            let code = run_command(&cli.config, &cli.overrides)?;
            if code != 0 {
                std::process::exit(code);
            }
        }

        Some(Commands::Analyze) => {
            analyze_command(&cli.config, &cli.overrides)?;
        }

        Some(Commands::Validate) => {
            validate_command(&cli.config, &cli.overrides)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf, overrides: &Overrides) -> Result<Config> {
    let mut config = Config::from_file(path)?;
    apply_overrides(&mut config, overrides);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, overrides: &Overrides) {
    if let Some(ns) = &overrides.namespace {
        config.namespace = ns.clone();
    }
    if let Some(size) = overrides.chunk_size {
        config.processing.chunk_size = size;
    }
    for (class, workers) in &overrides.workers {
        config
            .processing
            .resources
            .entry(*class)
            .or_default()
            .workers = *workers;
    }
    if let Some(build) = overrides.source_build {
        config.reference.source_build = Some(build);
    }
    if let Some(class) = overrides.oom_retry_class {
        config.processing.oom_retry_class = Some(class);
    }
    if overrides.prune {
        config.enable_prune();
    }
}

fn run_command(config_path: &PathBuf, overrides: &Overrides) -> Result<i32> {
    let config = load_config(config_path, overrides)?;
    let metrics_interval = config.processing.metrics_interval_secs;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async {
        let cache = open_cache(&config)?;
        let orchestrator = Orchestrator::new(config, cache)?;

        let report = tokio::select! {
            report = orchestrator.run() => report?,
            _ = tokio::signal::ctrl_c() => {
                // Dropping the run kills in-flight stages; cached units stay valid
                tracing::error!("Interrupted; unfinished units were not cached");
                return Ok::<i32, anyhow::Error>(130);
            }
        };

        MetricsReporter::new(orchestrator.metrics(), metrics_interval).print_summary();
        println!("{}", report);

        if report.global.is_none() {
            tracing::error!("No unit was processed successfully");
        }
        Ok::<i32, anyhow::Error>(report.exit_code())
    })
}

fn analyze_command(config_path: &PathBuf, overrides: &Overrides) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let namespace = config.namespace.clone();
    let chunk_size = config.processing.chunk_size;

    let runtime = build_runtime(None)?;
    let units = runtime.block_on(analyze_units(config))?;

    println!("\n=== Work Analysis ===");
    println!("Namespace: {}", namespace);
    println!("Chunk size: {} records", chunk_size);
    println!("\n{:<16} {:<12} source", "unit", "cache");
    for unit in &units {
        let status = match (unit.is_cached, unit.provisional) {
            (true, true) => "provisional",
            (true, false) => "hit",
            (false, _) => "miss",
        };
        println!("{:<16} {:<12} {}", unit.identity.as_str(), status, unit.source_path.display());
    }

    let cached = units.iter().filter(|u| u.is_cached).count();
    println!(
        "\n{} units: {} cached, {} to process",
        units.len(),
        cached,
        units.len() - cached
    );
    println!("=====================\n");
    Ok(())
}

fn validate_command(config_path: &PathBuf, overrides: &Overrides) -> Result<()> {
    load_config(config_path, overrides)?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# genochunk configuration

# Cache scope: units are keyed by (namespace, identity)
namespace: "cohort_a"

# === INPUT: which files are units ===
input:
  # Glob patterns; every match is one unit
  patterns:
    - "/data/imputed/chr*.dose.vcf.gz"

  # Regex over the file name; the first capture group is the unit identity.
  # Without it, the file name minus .vcf.gz/.vcf is used (BCF is not accepted).
  identity_pattern: "(chr[0-9XYM]+)"

# === CACHE: per-unit artifacts, reused across runs ===
cache:
  # Local directory or s3://bucket/prefix
  location: "/data/genochunk-cache"

# === OUTPUT ===
output:
  # Genome-wide artifact is written as {dir}/{namespace}.{vcf,psam,log}
  dir: "/data/out"

  # Scratch root (default: {dir}/work)
  # work_dir: "/scratch/genochunk"

  # Run manifests (default: {dir}/manifests)
  # manifest_dir: "/data/out/manifests"

  # Keep chunk payloads and stage outputs for debugging
  keep_work_dir: false

# === REFERENCE DATA: checked before any chunk runs ===
reference:
  target_build: GRCh38
  # Build of the inputs; liftover stages run only when it differs
  # source_build: GRCh37
  fasta: "/ref/GRCh38.fa"
  # fasta_index: "/ref/GRCh38.fa.fai"   # default: {fasta}.fai
  # source_fasta: "/ref/hg19.fa"
  # chain: "/ref/hg19ToHg38.over.chain.gz"

# === PROCESSING ===
processing:
  # Maximum records per chunk
  chunk_size: 30000

  # Worker slots and threads per resource class
  resources:
    light: { workers: 8, threads: 1 }
    standard: { workers: 4, threads: 2 }
    heavy: { workers: 1, threads: 8 }

  # Units chunked concurrently / unit merges running concurrently
  chunk_concurrency: 4
  merge_concurrency: 2

  # Kill a stage after this many seconds (classified as OOM)
  # stage_timeout_secs: 3600

  # Merge and cache units that lost chunks (marked provisional)
  allow_partial_units: true

  # Second pass for OOM chunks with every stage in this class
  # oom_retry_class: heavy

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 16

  enable_metrics: true
  metrics_interval_secs: 30
  # metrics_output_path: "/data/out/metrics.json"

# === FILTERS: thresholds handed to the stage tools ===
filters:
  quality: 0.3
  min_allele_count: 1
  max_missingness: 0.1

# The stage chain defaults to the bcftools/plink2 pipeline; override with
# `stages:` (name, program, args, output, resource_class, when).

# Uncomment to LD-prune each unit before the genome-wide merge
# prune: {}
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
