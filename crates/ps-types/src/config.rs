//! Experiment description: the `pipeline_search` and `model` sections.
//!
//! Both sections are typed and validated once at load time. Unknown keys are
//! rejected so that typos surface before any run starts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::GpuSelection;
use crate::errors::ConfigError;
use crate::run::ObjectiveDirection;

/// Name of the scratch launch used by the smoke test.
pub const SMOKE_TEST_LAUNCH: &str = "smoke_test";

/// A complete experiment description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub pipeline_search: PipelineSearch,
    pub model: ModelSection,
}

/// How variants are drawn from the search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Grid,
    #[default]
    Random,
}

/// Orchestration options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSearch {
    #[serde(default)]
    pub search_type: SearchType,
    /// Number of variants drawn by random search.
    #[serde(default = "default_sample_num")]
    pub sample_num: usize,
    /// Seed for random search; unseeded runs are not reproducible.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub multiprocessing: bool,
    /// Worker count for parallel mode. Capped at the number of free devices
    /// when devices are used.
    #[serde(default)]
    pub num_workers: Option<usize>,
    #[serde(default)]
    pub use_gpu: GpuSelection,
    /// Minimum free-memory fraction for a device to count as free.
    #[serde(default = "default_gpu_memory_fraction")]
    pub gpu_memory_fraction: f64,
    /// Keep only the best run's checkpoints.
    #[serde(default)]
    pub save_best: bool,
    /// Keep the checkpoints of the `keep_top` best runs. Overrides `save_best`.
    #[serde(default)]
    pub keep_top: Option<usize>,
    /// Run the smoke test before the full experiment.
    #[serde(default)]
    pub do_test: bool,
    #[serde(default)]
    pub experiments_root: Option<PathBuf>,
    #[serde(default = "default_exp_name")]
    pub exp_name: String,
    #[serde(default = "default_launch_name")]
    pub launch_name: String,
    /// Experiment date; today's date when omitted.
    #[serde(default)]
    pub date: Option<String>,
    /// Free-form information copied into the experiment metadata.
    #[serde(default)]
    pub info: Option<serde_json::Value>,
    /// Metric used to rank runs; the first declared metric when omitted.
    #[serde(default)]
    pub target_metric: Option<String>,
}

/// The model search space and its metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    /// Metric names reported by the training procedure.
    pub metrics: Vec<String>,
    #[serde(default)]
    pub direction: ObjectiveDirection,
    /// Configuration template with variation points.
    pub template: serde_json::Value,
}

/// Which run directories survive finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    KeepAll,
    KeepTop(usize),
}

fn default_sample_num() -> usize {
    10
}

fn default_gpu_memory_fraction() -> f64 {
    0.99
}

fn default_exp_name() -> String {
    "experiment".to_string()
}

fn default_launch_name() -> String {
    "exp".to_string()
}

impl ExperimentConfig {
    /// Load and validate an experiment description from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&content)
    }

    /// Parse and validate an experiment description.
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        if config.pipeline_search.date.is_none() {
            config.pipeline_search.date =
                Some(chrono::Local::now().format("%Y-%m-%d").to_string());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let search = &self.pipeline_search;

        if !(0.0..=1.0).contains(&search.gpu_memory_fraction) {
            return Err(ConfigError::InvalidValue {
                key: "gpu_memory_fraction".to_string(),
                value: search.gpu_memory_fraction.to_string(),
                hint: "expected a fraction between 0.0 and 1.0".to_string(),
            });
        }
        if search.search_type == SearchType::Random && search.sample_num == 0 {
            return Err(ConfigError::InvalidValue {
                key: "sample_num".to_string(),
                value: "0".to_string(),
                hint: "random search needs at least one sample".to_string(),
            });
        }
        if search.num_workers == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "num_workers".to_string(),
                value: "0".to_string(),
                hint: "use at least one worker, or omit the key".to_string(),
            });
        }
        if search.keep_top == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "keep_top".to_string(),
                value: "0".to_string(),
                hint: "keep at least one run, or omit the key to keep all".to_string(),
            });
        }
        let names = [
            ("exp_name", Some(search.exp_name.as_str())),
            ("launch_name", Some(search.launch_name.as_str())),
            ("date", search.date.as_deref()),
        ];
        for (key, value) in names {
            let Some(value) = value else {
                continue;
            };
            if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: format!("\"{value}\""),
                    hint: "expected a non-empty directory name without path separators"
                        .to_string(),
                });
            }
        }
        if search.launch_name == SMOKE_TEST_LAUNCH {
            return Err(ConfigError::InvalidValue {
                key: "launch_name".to_string(),
                value: format!("\"{SMOKE_TEST_LAUNCH}\""),
                hint: "this name is reserved for the smoke test scratch tree".to_string(),
            });
        }

        if self.model.metrics.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "model.metrics".to_string(),
                value: "[]".to_string(),
                hint: "declare at least one metric to rank runs by".to_string(),
            });
        }
        if let Some(metric) = &search.target_metric {
            if !self.model.metrics.contains(metric) {
                return Err(ConfigError::UnknownMetric {
                    metric: metric.clone(),
                    available: self.model.metrics.clone(),
                });
            }
        }

        Ok(())
    }

    /// Metric used for ranking.
    pub fn target_metric(&self) -> &str {
        self.pipeline_search
            .target_metric
            .as_deref()
            .or_else(|| self.model.metrics.first().map(String::as_str))
            .unwrap_or_default()
    }

    pub fn date(&self) -> String {
        self.pipeline_search
            .date
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string())
    }

    /// Root under which all experiments live, with `~` expanded.
    pub fn experiments_root(&self) -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        match &self.pipeline_search.experiments_root {
            Some(root) => match root.strip_prefix("~") {
                Ok(rest) => home.join(rest),
                Err(_) => root.clone(),
            },
            None => home.join(".pipesweep").join("experiments"),
        }
    }

    /// `<experiments_root>/<date>/<exp_name>`
    pub fn experiment_dir(&self) -> PathBuf {
        self.experiments_root()
            .join(self.date())
            .join(&self.pipeline_search.exp_name)
    }

    /// Directory of this launch: reports, logs and run checkpoints.
    pub fn launch_dir(&self) -> PathBuf {
        self.experiment_dir().join(&self.pipeline_search.launch_name)
    }

    /// Scratch tree of the smoke test.
    pub fn smoke_dir(&self) -> PathBuf {
        self.experiment_dir().join(SMOKE_TEST_LAUNCH)
    }

    pub fn retention(&self) -> RetentionPolicy {
        match (self.pipeline_search.keep_top, self.pipeline_search.save_best) {
            (Some(k), _) => RetentionPolicy::KeepTop(k),
            (None, true) => RetentionPolicy::KeepTop(1),
            (None, false) => RetentionPolicy::KeepAll,
        }
    }
}
