//! Resolved run configurations, run lifecycle and run outcomes.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::errors::{PsError, PsResult};

/// Metric name -> scalar value, as returned by the training procedure.
pub type Metrics = BTreeMap<String, f64>;

/// Whether the target metric is maximized or minimized when ranking runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// Orders two metric values so that the better one sorts first.
    pub fn rank(self, a: f64, b: f64) -> Ordering {
        let natural = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Self::Maximize => natural.reverse(),
            Self::Minimize => natural,
        }
    }
}

/// One fully-resolved configuration drawn from a search space.
///
/// Immutable once generated. A runner receives its own clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    index: usize,
    fingerprint: String,
    save_dir: PathBuf,
    values: serde_json::Value,
}

impl RunConfig {
    pub fn new(
        index: usize,
        fingerprint: impl Into<String>,
        save_dir: impl Into<PathBuf>,
        values: serde_json::Value,
    ) -> Self {
        Self {
            index,
            fingerprint: fingerprint.into(),
            save_dir: save_dir.into(),
            values,
        }
    }

    /// 0-based position in the generated sequence.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hex digest of the resolved values.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Checkpoint directory, distinct for every run of an experiment.
    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn values(&self) -> &serde_json::Value {
        &self.values
    }

    /// Look up a resolved value by JSON pointer, e.g. `/dataset/data_path`.
    pub fn get(&self, pointer: &str) -> Option<&serde_json::Value> {
        self.values.pointer(pointer)
    }

    /// Same variant, relocated under another root (used by the smoke test).
    pub fn relocated(&self, save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
            ..self.clone()
        }
    }
}

/// Lifecycle of a single run: `Pending -> Dispatched -> {Succeeded | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Advance to `next`, rejecting transitions the lifecycle does not allow.
    ///
    /// A pending run may fail without being dispatched (no device left for it).
    pub fn transition(self, next: RunStatus) -> PsResult<RunStatus> {
        let allowed = matches!(
            (self, next),
            (Self::Pending, Self::Dispatched)
                | (Self::Pending, Self::Failed)
                | (Self::Dispatched, Self::Succeeded)
                | (Self::Dispatched, Self::Failed)
        );
        if allowed {
            Ok(next)
        } else {
            Err(PsError::Internal(format!(
                "invalid run transition {self:?} -> {next:?}"
            )))
        }
    }
}

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Succeeded {
        metrics: Metrics,
    },
    Failed {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diagnostics: Option<String>,
    },
}

/// Result of executing one [`RunConfig`], consumed once by the recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub index: usize,
    pub fingerprint: String,
    pub save_dir: PathBuf,
    pub device: Option<DeviceId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub result: RunResult,
}

impl RunOutcome {
    pub fn succeeded(
        config: &RunConfig,
        device: Option<DeviceId>,
        started_at: DateTime<Utc>,
        metrics: Metrics,
    ) -> Self {
        Self::finish(config, device, started_at, RunResult::Succeeded { metrics })
    }

    pub fn failed(
        config: &RunConfig,
        device: Option<DeviceId>,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
        diagnostics: Option<String>,
    ) -> Self {
        Self::finish(
            config,
            device,
            started_at,
            RunResult::Failed {
                error: error.into(),
                diagnostics,
            },
        )
    }

    fn finish(
        config: &RunConfig,
        device: Option<DeviceId>,
        started_at: DateTime<Utc>,
        result: RunResult,
    ) -> Self {
        let finished_at = Utc::now();
        let elapsed_secs = (finished_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            index: config.index(),
            fingerprint: config.fingerprint().to_string(),
            save_dir: config.save_dir().to_path_buf(),
            device,
            started_at,
            finished_at,
            elapsed_secs,
            result,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self.result {
            RunResult::Succeeded { .. } => RunStatus::Succeeded,
            RunResult::Failed { .. } => RunStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == RunStatus::Succeeded
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        match &self.result {
            RunResult::Succeeded { metrics } => metrics.get(name).copied(),
            RunResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.result {
            RunResult::Failed { error, .. } => Some(error),
            RunResult::Succeeded { .. } => None,
        }
    }
}

/// Format a duration in seconds as `HH:MM:SS`.
pub fn format_elapsed(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> RunConfig {
        RunConfig::new(2, "abc123", "/tmp/exp/runs/run_2", json!({"lr": 0.1}))
    }

    #[test]
    fn run_lifecycle_transitions() {
        let status = RunStatus::Pending;
        let status = status.transition(RunStatus::Dispatched).unwrap();
        let status = status.transition(RunStatus::Succeeded).unwrap();
        assert!(status.is_terminal());

        // No retry transition out of a terminal state
        assert!(RunStatus::Failed.transition(RunStatus::Dispatched).is_err());
        assert!(RunStatus::Succeeded.transition(RunStatus::Failed).is_err());
        assert!(RunStatus::Pending.transition(RunStatus::Succeeded).is_err());
    }

    #[test]
    fn outcome_carries_run_identity() {
        let config = sample_config();
        let mut metrics = Metrics::new();
        metrics.insert("accuracy".to_string(), 0.9);

        let outcome = RunOutcome::succeeded(&config, Some(1), Utc::now(), metrics);
        assert_eq!(outcome.index, 2);
        assert_eq!(outcome.fingerprint, "abc123");
        assert_eq!(outcome.device, Some(1));
        assert_eq!(outcome.metric("accuracy"), Some(0.9));
        assert!(outcome.elapsed_secs >= 0.0);
    }

    #[test]
    fn failed_outcome_has_no_metrics() {
        let config = sample_config();
        let outcome = RunOutcome::failed(&config, None, Utc::now(), "boom", None);
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert_eq!(outcome.metric("accuracy"), None);
        assert_eq!(outcome.error(), Some("boom"));
    }

    #[test]
    fn direction_ranks_better_first() {
        assert_eq!(ObjectiveDirection::Maximize.rank(0.9, 0.5), Ordering::Less);
        assert_eq!(ObjectiveDirection::Minimize.rank(0.9, 0.5), Ordering::Greater);
    }

    #[test]
    fn relocation_keeps_identity() {
        let config = sample_config();
        let moved = config.relocated("/tmp/smoke/run_2");
        assert_eq!(moved.index(), config.index());
        assert_eq!(moved.fingerprint(), config.fingerprint());
        assert_eq!(moved.save_dir(), Path::new("/tmp/smoke/run_2"));
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(0.0), "00:00:00");
        assert_eq!(format_elapsed(3723.4), "01:02:03");
    }
}
