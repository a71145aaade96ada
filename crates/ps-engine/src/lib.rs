//! # ps-engine
//!
//! Experiment orchestration for Pipesweep: runs every variant of a search
//! space against a training backend, sequentially or on a worker pool with
//! GPU-aware device assignment, records the outcomes and writes the reports.

pub mod backend;
pub mod orchestrator;
pub mod pool;
pub mod recorder;
pub mod runner;
pub mod smoke;

pub use backend::{
    CommandBackend, Composition, DataIterator, Dataset, RunContext, RunMode, Split,
    TrainingBackend,
};
pub use orchestrator::{Concurrency, Orchestrator, RUNS_DIR};
pub use pool::{Completion, RunJob, WorkerPool};
pub use recorder::{rank_runs, ExperimentRecord, RunRecorder};
pub use runner::Runner;
pub use smoke::{truncate_dataset, SmokeReport};
