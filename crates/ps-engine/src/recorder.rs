//! Run recording, ranking, retention and the experiment reports.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ps_search::SampleReduction;
use ps_types::{
    format_elapsed, ExperimentConfig, ObjectiveDirection, PsResult, RecordError,
    RetentionPolicy, RunOutcome, RunResult, RunStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const EXPERIMENT_FILE: &str = "experiment.json";
pub const RUN_LOG_FILE: &str = "runs.jsonl";
pub const REPORT_FILE: &str = "report.csv";

/// Metadata and results of one experiment launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: Uuid,
    pub name: String,
    pub launch: String,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
    pub metrics: Vec<String>,
    pub target_metric: String,
    pub direction: ObjectiveDirection,
    pub search_type: String,
    pub total_runs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduction: Option<SampleReduction>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Total elapsed time as `HH:MM:SS`.
    #[serde(default)]
    pub elapsed: Option<String>,
    /// Run indices ordered best first.
    #[serde(default)]
    pub ranking: Vec<usize>,
    /// Runs whose checkpoint directories were removed by retention.
    #[serde(default)]
    pub pruned: Vec<usize>,
    /// Outcomes ordered by run index.
    #[serde(default)]
    pub runs: Vec<RunOutcome>,
}

impl ExperimentRecord {
    pub fn new(
        config: &ExperimentConfig,
        total_runs: usize,
        reduction: Option<SampleReduction>,
    ) -> Self {
        let search = &config.pipeline_search;
        Self {
            id: Uuid::new_v4(),
            name: search.exp_name.clone(),
            launch: search.launch_name.clone(),
            date: config.date(),
            info: search.info.clone(),
            metrics: config.model.metrics.clone(),
            target_metric: config.target_metric().to_string(),
            direction: config.model.direction,
            search_type: format!("{:?}", search.search_type).to_lowercase(),
            total_runs,
            reduction,
            started_at: Utc::now(),
            finished_at: None,
            elapsed: None,
            ranking: Vec::new(),
            pruned: Vec::new(),
            runs: Vec::new(),
        }
    }

    pub fn run(&self, index: usize) -> Option<&RunOutcome> {
        self.runs.iter().find(|run| run.index == index)
    }

    pub fn succeeded(&self) -> usize {
        self.runs.iter().filter(|run| run.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.runs.len() - self.succeeded()
    }

    /// Best run by the target metric.
    pub fn best(&self) -> Option<&RunOutcome> {
        self.ranking
            .first()
            .and_then(|index| self.run(*index))
            .filter(|run| run.metric(&self.target_metric).is_some())
    }
}

/// Order run indices best first: succeeded runs with the target metric by
/// direction, then everything else by index.
pub fn rank_runs<'a>(
    runs: impl IntoIterator<Item = &'a RunOutcome>,
    target_metric: &str,
    direction: ObjectiveDirection,
) -> Vec<usize> {
    let (mut scored, mut rest): (Vec<_>, Vec<_>) = runs
        .into_iter()
        .map(|run| (run.index, run.metric(target_metric)))
        .partition(|(_, score)| score.is_some());

    scored.sort_by(|(ia, a), (ib, b)| {
        let (a, b) = (a.unwrap_or_default(), b.unwrap_or_default());
        direction.rank(a, b).then(ia.cmp(ib))
    });
    rest.sort_by_key(|(index, _)| *index);
    scored.into_iter().chain(rest).map(|(index, _)| index).collect()
}

struct RecorderState {
    record: ExperimentRecord,
    outcomes: BTreeMap<usize, RunOutcome>,
    log: Option<File>,
    finalized: bool,
}

/// Collects run outcomes as they arrive, in any order, and produces the final
/// record.
///
/// Appends are serialized; every outcome is also written to `runs.jsonl` as it
/// is recorded.
pub struct RunRecorder {
    dir: PathBuf,
    state: Mutex<RecorderState>,
}

impl RunRecorder {
    /// Start recording into `dir`, creating it if needed.
    pub fn create(dir: impl Into<PathBuf>, record: ExperimentRecord) -> PsResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(RUN_LOG_FILE))?;
        Ok(Self {
            dir,
            state: Mutex::new(RecorderState {
                record,
                outcomes: BTreeMap::new(),
                log: Some(log),
                finalized: false,
            }),
        })
    }

    pub fn record(&self, outcome: RunOutcome) -> PsResult<()> {
        let mut state = self.state.lock();
        if state.finalized {
            return Err(RecordError::AlreadyFinalized.into());
        }
        let total = state.record.total_runs;
        if outcome.index >= total {
            return Err(RecordError::UnknownRun {
                index: outcome.index,
                total,
            }
            .into());
        }
        if state.outcomes.contains_key(&outcome.index) {
            return Err(RecordError::DuplicateOutcome {
                index: outcome.index,
            }
            .into());
        }

        if let Some(log) = state.log.as_mut() {
            let line = serde_json::to_string(&outcome)?;
            writeln!(log, "{line}")?;
            log.flush()?;
        }
        state.outcomes.insert(outcome.index, outcome);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<RunOutcome> {
        self.state.lock().outcomes.get(&index).cloned()
    }

    pub fn recorded(&self) -> usize {
        self.state.lock().outcomes.len()
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.outcomes.len() == state.record.total_runs
    }

    /// Outcomes recorded so far, ordered by index.
    pub fn outcomes(&self) -> Vec<RunOutcome> {
        self.state.lock().outcomes.values().cloned().collect()
    }

    /// Rank runs, apply retention and write `experiment.json` and
    /// `report.csv`.
    pub fn finalize(&self, retention: RetentionPolicy) -> PsResult<ExperimentRecord> {
        let mut state = self.state.lock();
        if state.finalized {
            return Err(RecordError::AlreadyFinalized.into());
        }
        if state.outcomes.len() < state.record.total_runs {
            warn!(
                "Finalizing with {} of {} runs recorded",
                state.outcomes.len(),
                state.record.total_runs
            );
        }

        let runs: Vec<RunOutcome> = state.outcomes.values().cloned().collect();
        let ranking = rank_runs(&runs, &state.record.target_metric, state.record.direction);
        let pruned = match retention {
            RetentionPolicy::KeepAll => Vec::new(),
            RetentionPolicy::KeepTop(keep) => {
                prune(&runs, &ranking, keep, &state.record.target_metric)
            }
        };

        let finished_at = Utc::now();
        let elapsed_secs = (finished_at - state.record.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let record = &mut state.record;
        record.runs = runs;
        record.ranking = ranking;
        record.pruned = pruned;
        record.finished_at = Some(finished_at);
        record.elapsed = Some(format_elapsed(elapsed_secs));

        std::fs::write(
            self.dir.join(EXPERIMENT_FILE),
            serde_json::to_string_pretty(&*record)?,
        )?;
        write_report(&self.dir.join(REPORT_FILE), record)?;

        let record = record.clone();
        state.log.take();
        state.finalized = true;

        info!(
            "Experiment {} finished in {}: {} succeeded, {} failed",
            record.name,
            record.elapsed.as_deref().unwrap_or_default(),
            record.succeeded(),
            record.failed()
        );
        if let Some(best) = record.best() {
            info!(
                "Best run {} with {} = {}",
                best.index,
                record.target_metric,
                best.metric(&record.target_metric).unwrap_or_default()
            );
        }
        Ok(record)
    }
}

/// Remove the checkpoint directories of succeeded runs outside the top
/// `keep`. Failed runs keep their artifacts.
fn prune(runs: &[RunOutcome], ranking: &[usize], keep: usize, target_metric: &str) -> Vec<usize> {
    let mut kept = 0;
    let mut pruned = Vec::new();
    for index in ranking {
        let Some(run) = runs.iter().find(|run| run.index == *index) else {
            continue;
        };
        if !run.is_success() {
            continue;
        }
        if kept < keep && run.metric(target_metric).is_some() {
            kept += 1;
            continue;
        }
        if run.save_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&run.save_dir) {
                warn!("Failed to remove {}: {}", run.save_dir.display(), e);
                continue;
            }
        }
        pruned.push(run.index);
    }
    pruned.sort_unstable();
    pruned
}

fn write_report(path: &Path, record: &ExperimentRecord) -> PsResult<()> {
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;

    let mut header = vec![
        "rank".to_string(),
        "index".to_string(),
        "status".to_string(),
        "device".to_string(),
        "elapsed".to_string(),
    ];
    header.extend(record.metrics.iter().cloned());
    header.extend(["save_dir".to_string(), "error".to_string()]);
    writer.write_record(&header).map_err(csv_error)?;

    for (rank, index) in record.ranking.iter().enumerate() {
        let Some(run) = record.run(*index) else {
            continue;
        };
        let status = match run.status() {
            RunStatus::Succeeded => "succeeded",
            _ => "failed",
        };
        let mut row = vec![
            (rank + 1).to_string(),
            run.index.to_string(),
            status.to_string(),
            run.device.map(|d| d.to_string()).unwrap_or_default(),
            format_elapsed(run.elapsed_secs),
        ];
        row.extend(
            record
                .metrics
                .iter()
                .map(|metric| run.metric(metric).map(|v| v.to_string()).unwrap_or_default()),
        );
        row.push(run.save_dir.display().to_string());
        row.push(match &run.result {
            RunResult::Failed { error, .. } => error.clone(),
            RunResult::Succeeded { .. } => String::new(),
        });
        writer.write_record(&row).map_err(csv_error)?;
    }

    writer.flush()?;
    Ok(())
}

fn csv_error(e: csv::Error) -> ps_types::PsError {
    ps_types::internal_error!("failed to write report: {}", e)
}
