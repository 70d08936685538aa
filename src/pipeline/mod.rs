//! Pipeline orchestration: stage execution, dispatch, fan-in and reporting.

mod metrics;
mod orchestrator;
mod report;
mod scheduler;
pub(crate) mod stage_runner;
pub(crate) mod stages;


pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use orchestrator::Orchestrator;
pub use report::{RunReport, UnitReport, UnitStatus};
pub use scheduler::{ChunkOutcome, ChunkWorker, ResourcePool, Scheduler};
pub use stage_runner::{scratch_dir, ChunkResult, ChunkStatus, StageOutcome, StageRunner};
pub use stages::{StagePlan, TemplateVars, OOM_EXIT_CODES};
