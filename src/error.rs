//! Typed errors for the orchestration layer.
//!
//! Fatal conditions ([`PreconditionError`]) abort a run before any chunk work.
//! Everything else is scoped to a chunk ([`FailureKind`]) or a unit
//! ([`ChunkError`], [`MergeError`]) and is recorded rather than propagated.

use crate::pipeline::ChunkStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Run-blocking failures detected before any chunk is scheduled.
#[derive(Error, Debug)]
pub enum PreconditionError {
    /// A required reference file is not present on disk.
    #[error("missing reference data: {what} not found at {}", path.display())]
    MissingReference { what: &'static str, path: PathBuf },

    /// A reference file is required by the selected builds but not configured.
    #[error("missing reference data: {what} is required when source build {source_build} differs from target build {target_build}")]
    UnconfiguredReference {
        what: &'static str,
        source_build: String,
        target_build: String,
    },

    /// The input patterns matched nothing.
    #[error("no input units matched patterns {patterns:?}")]
    NoInputUnits { patterns: Vec<String> },

    /// Two input files resolved to the same identity within one run.
    #[error("identity '{identity}' is claimed by both {} and {}", first.display(), second.display())]
    DuplicateIdentity {
        identity: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// An input pattern or identity regex could not be compiled.
    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// A file name produced an unusable identity.
    #[error("cannot derive identity from {}: {message}", path.display())]
    InvalidIdentity { path: PathBuf, message: String },

    /// A matched file is in a format the chunker cannot frame.
    #[error("unsupported input format {format} for {}: only text VCF (plain or gzip/bgzip) can be chunked", path.display())]
    UnsupportedFormat { path: PathBuf, format: &'static str },
}

/// Why a unit could not be split into chunks.
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("unit {} contains no variant records", path.display())]
    Empty { path: PathBuf },

    #[error("unit {} is unparsable at line {line}: {reason}", path.display())]
    Unparsable {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("I/O error while chunking: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single chunk pipeline did not produce an artifact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The stage process was killed (exit 137/143 or SIGKILL/SIGTERM).
    #[error("stage '{stage}' was killed (exit code {exit_code})")]
    Killed { stage: String, exit_code: i32 },

    /// The stage exceeded its configured timeout and was killed.
    #[error("stage '{stage}' timed out after {after:?}")]
    TimedOut { stage: String, after: Duration },

    /// The stage exited with a non-zero, non-kill code.
    #[error("stage '{stage}' exited with code {exit_code}")]
    ExitCode { stage: String, exit_code: i32 },

    /// The stage process terminated without an exit code or signal we understand.
    #[error("stage '{stage}' terminated abnormally")]
    Abnormal { stage: String },

    /// The process could not be started.
    #[error("stage '{stage}' could not be started: {message}")]
    Spawn { stage: String, message: String },

    /// The pipeline exited cleanly but the declared artifact set is incomplete.
    #[error("expected output missing: {}", path.display())]
    MissingOutput { path: PathBuf },

    /// Scratch area or artifact inspection failed.
    #[error("I/O error in chunk scratch area: {message}")]
    Io { message: String },

    /// The worker task running this chunk panicked or was aborted.
    #[error("worker crashed: {message}")]
    WorkerCrashed { message: String },
}

impl FailureKind {
    /// Classify this failure into a manifest status.
    ///
    /// Kills and timeouts are resource-related and retryable; everything
    /// else is a hard failure for the chunk.
    pub fn status(&self) -> ChunkStatus {
        match self {
            FailureKind::Killed { .. } | FailureKind::TimedOut { .. } => ChunkStatus::Oom,
            _ => ChunkStatus::Failed,
        }
    }
}

/// Per-unit and genome-wide merge failures.
#[derive(Error, Debug)]
pub enum MergeError {
    /// Every chunk of the unit failed.
    #[error("unit '{identity}' has no successful chunks ({failed} failed)")]
    NoSuccessfulChunks { identity: String, failed: usize },

    /// Partial units are disallowed by policy and this unit lost chunks.
    #[error("unit '{identity}' is incomplete: {failed} of {total} chunks failed")]
    IncompleteUnit {
        identity: String,
        failed: usize,
        total: usize,
    },

    /// Record tables do not share the same column layout.
    #[error("column layout of {} differs from the first table ({expected:?} vs {found:?})", source_path.display())]
    SchemaMismatch {
        source_path: PathBuf,
        expected: String,
        found: String,
    },

    /// Sample tables differ between the merged parts.
    #[error("sample table {} differs from the first part", source_path.display())]
    SampleMismatch { source_path: PathBuf },

    /// Nothing to merge.
    #[error("no inputs to merge")]
    NoInputs,

    #[error("I/O error during merge: {0}")]
    Io(#[from] std::io::Error),
}

/// CacheStore access failures.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Write-once violation: the key already holds an entry.
    #[error("cache entry {namespace}/{identity} already exists")]
    AlreadyPresent { namespace: String, identity: String },

    /// No complete entry exists for the key.
    #[error("cache entry {namespace}/{identity} not found")]
    NotFound { namespace: String, identity: String },

    /// An entry exists but does not match its recorded digest.
    #[error("cache entry {namespace}/{identity} is malformed: {message}")]
    Malformed {
        namespace: String,
        identity: String,
        message: String,
    },

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry metadata error: {0}")]
    Json(#[from] serde_json::Error),
}
