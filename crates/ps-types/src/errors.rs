use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceId;

/// Main error type for Pipesweep
#[derive(Error, Debug)]
pub enum PsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error(
        "Smoke test failed: {failed} of {total} variants failed; scratch tree kept at {} for inspection",
        scratch.display()
    )]
    SmokeTestFailed {
        failed: usize,
        total: usize,
        scratch: PathBuf,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Fatal configuration errors, raised before any run is dispatched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read experiment file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse experiment description: {message}")]
    Parse { message: String },

    #[error("invalid value {value} for '{key}': {hint}")]
    InvalidValue {
        key: String,
        value: String,
        hint: String,
    },

    #[error("unsupported 'use_gpu' value {value}: {hint}")]
    UnsupportedDeviceSelection { value: String, hint: String },

    #[error("malformed search space at {path}: {message}")]
    SearchSpace { path: String, message: String },

    #[error(
        "variation point at {path} has no alternatives; give it at least one value or replace it with a plain value"
    )]
    EmptyChoice { path: String },

    #[error("target metric '{metric}' is not one of the declared metrics {available:?}")]
    UnknownMetric {
        metric: String,
        available: Vec<String>,
    },

    #[error(
        "dataset composition of variant {index} differs from variant 0: split '{split}' is {} here but {} in variant 0; all variants of a batch must provide the same splits",
        presence(*found),
        presence(*expected)
    )]
    InconsistentComposition {
        index: usize,
        split: String,
        expected: bool,
        found: bool,
    },

    #[error("failed to load data for variant {index}: {message}")]
    DataUnavailable { index: usize, message: String },
}

fn presence(present: bool) -> &'static str {
    if present {
        "present"
    } else {
        "absent"
    }
}

/// Device availability errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error(
        "requested devices {requested:?} do not intersect the visible devices {visible:?}; pick ids from the visible set or widen CUDA_VISIBLE_DEVICES"
    )]
    NoIntersection {
        requested: Vec<DeviceId>,
        visible: Vec<DeviceId>,
    },

    #[error(
        "all selected devices {candidates:?} are busy (free memory fraction below {threshold}); lower 'gpu_memory_fraction' or free a device"
    )]
    AllBusy {
        candidates: Vec<DeviceId>,
        threshold: f64,
    },

    #[error("no free device left for run {index}; all tracked devices are busy or claimed")]
    NoFreeDevice { index: usize },

    #[error("cannot parse device visibility list '{value}'; expected comma-separated device ids")]
    InvalidVisibility { value: String },

    #[error("device probe failed: {message}")]
    Probe { message: String },
}

/// Errors raised by the run recorder.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("outcome for run {index} was already recorded")]
    DuplicateOutcome { index: usize },

    #[error("run index {index} is outside the experiment of {total} runs")]
    UnknownRun { index: usize, total: usize },

    #[error("experiment record is already finalized")]
    AlreadyFinalized,
}

/// Result type alias for Pipesweep operations
pub type PsResult<T> = Result<T, PsError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::PsError::Internal(format!($($arg)*))
    };
}
