//! Smoke test: the whole variant batch trained once on truncated data.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use ps_types::{ConfigError, DeviceId, RunConfig, RunOutcome};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::backend::{Composition, Dataset, RunMode, Split, TrainingBackend};
use crate::pool::RunJob;
use crate::runner::Runner;

pub const SMOKE_TRAIN_LIMIT: usize = 100;
pub const SMOKE_VALID_LIMIT: usize = 20;
pub const SMOKE_TEST_LIMIT: usize = 20;

fn limit(split: Split) -> usize {
    match split {
        Split::Train => SMOKE_TRAIN_LIMIT,
        Split::Valid => SMOKE_VALID_LIMIT,
        Split::Test => SMOKE_TEST_LIMIT,
    }
}

/// Cut every split to its smoke-test limit. Smaller splits are kept whole.
///
/// Returns a warning when the train split is already at or below its limit,
/// i.e. the smoke test trains on the full train split.
pub fn truncate_dataset(mut data: Dataset) -> (Dataset, Option<String>) {
    let warning = (data.train.len() <= SMOKE_TRAIN_LIMIT).then(|| {
        format!(
            "train split has only {} examples (<= {}); the smoke test trains on all of it",
            data.train.len(),
            SMOKE_TRAIN_LIMIT
        )
    });
    for split in Split::ALL {
        data.split_mut(split).truncate(limit(split));
    }
    (data, warning)
}

/// Truncated datasets of a batch, checked for consistent composition.
#[derive(Debug)]
pub struct SmokePlan {
    pub configs: Vec<RunConfig>,
    pub datasets: HashMap<usize, Dataset>,
    pub warnings: Vec<String>,
}

/// Read every variant's data, check that all variants provide the same
/// splits as variant 0, and truncate.
///
/// Data is read in parallel; checks run in index order so the reported
/// variant is always the first offending one.
pub fn prepare(
    backend: &dyn TrainingBackend,
    configs: Vec<RunConfig>,
) -> Result<SmokePlan, ConfigError> {
    let reads: Vec<anyhow::Result<Dataset>> =
        configs.par_iter().map(|config| backend.read_data(config)).collect();

    let mut reference: Option<Composition> = None;
    let mut datasets = HashMap::with_capacity(configs.len());
    let mut warnings = Vec::new();

    for (config, read) in configs.iter().zip(reads) {
        let index = config.index();
        let data = read.map_err(|e| ConfigError::DataUnavailable {
            index,
            message: format!("{e:#}"),
        })?;

        let composition = data.composition();
        match reference {
            None => reference = Some(composition),
            Some(expected) => {
                if let Some(split) = composition.first_difference(&expected) {
                    return Err(ConfigError::InconsistentComposition {
                        index,
                        split: split.name().to_string(),
                        expected: expected.has(split),
                        found: composition.has(split),
                    });
                }
            }
        }

        let (data, warning) = truncate_dataset(data);
        if let Some(warning) = warning {
            warn!("Smoke test, variant {}: {}", index, warning);
            warnings.push(format!("variant {index}: {warning}"));
        }
        datasets.insert(index, data);
    }

    Ok(SmokePlan {
        configs,
        datasets,
        warnings,
    })
}

/// Runs one smoke variant with its prepared data, training only.
pub struct SmokeJob {
    runner: Runner,
    datasets: Mutex<HashMap<usize, Dataset>>,
}

impl SmokeJob {
    pub fn new(runner: Runner, datasets: HashMap<usize, Dataset>) -> Self {
        Self {
            runner,
            datasets: Mutex::new(datasets),
        }
    }
}

impl RunJob for SmokeJob {
    fn run(&self, config: RunConfig, device: Option<DeviceId>) -> RunOutcome {
        let data = self.datasets.lock().remove(&config.index());
        match data {
            Some(data) => self
                .runner
                .execute_prepared(&config, device, data, RunMode::TrainOnly),
            None => RunOutcome::failed(
                &config,
                device,
                chrono::Utc::now(),
                "no prepared smoke test data for this variant",
                None,
            ),
        }
    }
}

/// Result of a smoke test.
#[derive(Debug, Clone)]
pub struct SmokeReport {
    pub total: usize,
    pub failures: Vec<RunOutcome>,
    pub warnings: Vec<String>,
    /// Kept only when the smoke test failed.
    pub scratch_dir: PathBuf,
}

impl SmokeReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn log(&self) {
        if self.passed() {
            info!(
                "Smoke test passed: {} variants trained on truncated data",
                self.total
            );
        } else {
            for failure in &self.failures {
                warn!(
                    "Smoke test variant {} failed: {}",
                    failure.index,
                    failure.error().unwrap_or_default()
                );
            }
            warn!(
                "Smoke test failed for {} of {} variants; artifacts kept in {}",
                self.failures.len(),
                self.total,
                self.scratch_dir.display()
            );
        }
    }
}
