//! genochunk
//!
//! Chunked, cached merge-reduce orchestration for per-chromosome variant
//! files. Units are split into record-bounded chunks, every chunk runs
//! through an ordered chain of external tools, and chunk outputs are merged
//! per unit, cached by `(namespace, identity)`, and merged again into one
//! genome-wide artifact.
//!
//! # Architecture
//!
//! - **Index**: unit identities, input discovery and chunking
//! - **I/O**: VCF framing, the object-store backed unit cache, run manifests
//! - **Transform**: order-preserving table append (per unit and genome-wide)
//! - **Pipeline**: stage execution, bounded dispatch, fan-in, metrics and reporting
//!
//! # Usage
//!
//! ```no_run
//! use genochunk::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_pipeline(config).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod index;
pub mod io;
pub mod pipeline;
pub mod reference;
pub mod transform;

pub use config::{Config, ResourceClass, StageSpec};
pub use context::{Namespace, RunContext};
pub use error::{CacheError, ChunkError, FailureKind, MergeError, PreconditionError};
pub use index::{Identity, InputUnit};
pub use io::{CacheStore, ObjectCacheStore};
pub use pipeline::{ChunkResult, ChunkStatus, Metrics, Orchestrator, RunReport};
pub use reference::GenomeBuild;

use anyhow::Result;
use std::sync::Arc;

/// Open the unit cache described by `config.cache`.
pub fn open_cache(config: &Config) -> Result<Arc<dyn CacheStore>> {
    let (store, prefix) = io::create_cache_store(&config.cache)?;
    Ok(Arc::new(ObjectCacheStore::new(
        store,
        prefix,
        config.artifact.clone(),
    )))
}

/// Run the full pipeline with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<RunReport> {
    config.validate()?;
    tracing::info!("Starting genochunk pipeline");

    let cache = open_cache(&config)?;
    let orchestrator = Orchestrator::new(config, cache)?;
    orchestrator.run().await
}

/// Discover input units and their cache status without processing anything.
pub async fn analyze_units(config: Config) -> Result<Vec<InputUnit>> {
    config.validate()?;
    let cache = open_cache(&config)?;
    let orchestrator = Orchestrator::new(config, cache)?;
    orchestrator.analyze().await
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
