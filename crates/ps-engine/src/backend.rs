//! Training backends: the external procedure that reads data, trains and
//! evaluates one resolved configuration.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use ps_types::{DeviceId, Metrics, RunConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Dataset splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    pub fn name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }
}

/// Examples of one variant's dataset, per split. An empty split is absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub train: Vec<serde_json::Value>,
    #[serde(default)]
    pub valid: Vec<serde_json::Value>,
    #[serde(default)]
    pub test: Vec<serde_json::Value>,
}

impl Dataset {
    pub fn split(&self, split: Split) -> &[serde_json::Value] {
        match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        }
    }

    pub fn split_mut(&mut self, split: Split) -> &mut Vec<serde_json::Value> {
        match split {
            Split::Train => &mut self.train,
            Split::Valid => &mut self.valid,
            Split::Test => &mut self.test,
        }
    }

    /// Which splits are present.
    pub fn composition(&self) -> Composition {
        Composition {
            train: !self.train.is_empty(),
            valid: !self.valid.is_empty(),
            test: !self.test.is_empty(),
        }
    }
}

/// Presence of each split in a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Composition {
    pub train: bool,
    pub valid: bool,
    pub test: bool,
}

impl Composition {
    pub fn has(&self, split: Split) -> bool {
        match split {
            Split::Train => self.train,
            Split::Valid => self.valid,
            Split::Test => self.test,
        }
    }

    /// First split whose presence differs from `reference`.
    pub fn first_difference(&self, reference: &Composition) -> Option<Split> {
        Split::ALL
            .into_iter()
            .find(|split| self.has(*split) != reference.has(*split))
    }
}

/// Batched access to a dataset, as built by the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataIterator {
    data: Dataset,
}

impl DataIterator {
    pub fn new(data: Dataset) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &Dataset {
        &self.data
    }

    pub fn split(&self, split: Split) -> &[serde_json::Value] {
        self.data.split(split)
    }

    pub fn len(&self, split: Split) -> usize {
        self.data.split(split).len()
    }
}

/// Which phases of the training procedure a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Train, then evaluate on the validation split.
    Full,
    /// Train only; used by the smoke test.
    TrainOnly,
}

impl RunMode {
    pub fn to_train(self) -> bool {
        true
    }

    pub fn to_validate(self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Per-run environment handed to the backend.
///
/// The device is an explicit argument; backends must not rely on process-wide
/// device state.
#[derive(Debug)]
pub struct RunContext {
    pub device: Option<DeviceId>,
    pub mode: RunMode,
    /// `stdout.log` of the run.
    pub stdout: File,
    /// `stderr.log` of the run.
    pub stderr: File,
}

/// The external training procedure.
pub trait TrainingBackend: Send + Sync {
    /// Read the raw dataset described by a configuration.
    fn read_data(&self, config: &RunConfig) -> anyhow::Result<Dataset>;

    /// Wrap a dataset into an iterator for training.
    fn build_iterator(&self, _config: &RunConfig, data: Dataset) -> anyhow::Result<DataIterator> {
        Ok(DataIterator::new(data))
    }

    /// Train and, depending on the mode, evaluate one configuration.
    fn train_evaluate(
        &self,
        config: &RunConfig,
        iterator: &DataIterator,
        context: &mut RunContext,
    ) -> anyhow::Result<Metrics>;

    fn name(&self) -> &str;
}

// ---- external command ----

/// JSON pointer of the dataset file inside a resolved configuration.
pub const DATA_PATH_POINTER: &str = "/dataset/data_path";

pub const CONFIG_FILE: &str = "config.json";
pub const DATA_FILE: &str = "data.json";
pub const METRICS_FILE: &str = "metrics.json";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("configuration has no string value at {pointer}")]
    MissingDataPath { pointer: &'static str },

    #[error("failed to start trainer {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("trainer exited with {status}; see {}", stderr.display())]
    Exit { status: String, stderr: PathBuf },

    #[error("trainer wrote no readable {}: {message}", path.display())]
    Metrics { path: PathBuf, message: String },
}

/// Runs an external trainer program once per run.
///
/// The resolved configuration and the data the run should use are written as
/// `config.json` and `data.json` into the run directory, which is also the
/// child's working directory. The trainer reports `metrics.json` back into the
/// same directory. The assigned device is set in the child's environment only.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn write_json(path: &Path, value: &impl Serialize) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))
    }
}

impl TrainingBackend for CommandBackend {
    fn read_data(&self, config: &RunConfig) -> anyhow::Result<Dataset> {
        let path = config
            .get(DATA_PATH_POINTER)
            .and_then(|v| v.as_str())
            .ok_or(CommandError::MissingDataPath {
                pointer: DATA_PATH_POINTER,
            })?;
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading dataset {path}"))?;
        let dataset = serde_json::from_str(&content)
            .with_context(|| format!("parsing dataset {path}"))?;
        Ok(dataset)
    }

    fn train_evaluate(
        &self,
        config: &RunConfig,
        iterator: &DataIterator,
        context: &mut RunContext,
    ) -> anyhow::Result<Metrics> {
        let run_dir = config.save_dir();
        Self::write_json(&run_dir.join(CONFIG_FILE), config.values())?;
        Self::write_json(&run_dir.join(DATA_FILE), iterator.data())?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(run_dir)
            .env("PIPESWEEP_RUN_INDEX", config.index().to_string())
            .env("PIPESWEEP_RUN_DIR", run_dir)
            .env("PIPESWEEP_TO_TRAIN", context.mode.to_train().to_string())
            .env("PIPESWEEP_TO_VALIDATE", context.mode.to_validate().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(context.stdout.try_clone()?))
            .stderr(Stdio::from(context.stderr.try_clone()?));
        // CPU runs get an empty list rather than the parent's devices
        let visible = context.device.map(|d| d.to_string()).unwrap_or_default();
        command.env(ps_devices::VISIBILITY_ENV, visible);

        debug!(
            "Spawning {} {} for run {}",
            self.program,
            self.args.join(" "),
            config.index()
        );
        let status = command
            .status()
            .map_err(|source| CommandError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(CommandError::Exit {
                status: status.to_string(),
                stderr: run_dir.join(crate::runner::STDERR_LOG),
            }
            .into());
        }

        let metrics_path = run_dir.join(METRICS_FILE);
        let metrics = std::fs::read_to_string(&metrics_path)
            .map_err(|e| e.to_string())
            .and_then(|content| {
                serde_json::from_str::<Metrics>(&content).map_err(|e| e.to_string())
            })
            .map_err(|message| CommandError::Metrics {
                path: metrics_path.clone(),
                message,
            })?;
        Ok(metrics)
    }

    fn name(&self) -> &str {
        &self.program
    }
}
