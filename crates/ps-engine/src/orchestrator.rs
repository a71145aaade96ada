//! The experiment control loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use ps_devices::{Assignment, DeviceProbe, DeviceRequest, DeviceTracker, NvidiaSmiProbe};
use ps_search::{run_dir, VariantGenerator};
use ps_types::{
    format_elapsed, internal_error, DeviceId, ExperimentConfig, PsError, PsResult, RunConfig,
    RunOutcome, RunStatus,
};
use tracing::{debug, info, warn};

use crate::backend::TrainingBackend;
use crate::pool::{RunJob, WorkerPool};
use crate::recorder::{ExperimentRecord, RunRecorder};
use crate::runner::{device_label, Runner};
use crate::smoke::{self, SmokeJob, SmokeReport};

/// Directory of the run checkpoints inside a launch directory.
pub const RUNS_DIR: &str = "runs";

/// How runs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// One run at a time on the calling thread.
    Sequential,
    /// A fixed-size worker pool.
    Parallel { workers: usize },
}

/// Drives an experiment: generation, device assignment, dispatch, recording
/// and finalization.
pub struct Orchestrator {
    config: ExperimentConfig,
    runner: Runner,
    probe: Arc<dyn DeviceProbe>,
    visible: Option<Vec<DeviceId>>,
}

impl Orchestrator {
    pub fn new(config: ExperimentConfig, backend: Arc<dyn TrainingBackend>) -> Self {
        Self {
            config,
            runner: Runner::new(backend),
            probe: Arc::new(NvidiaSmiProbe::new()),
            visible: None,
        }
    }

    /// Use another device probe.
    pub fn with_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Device visibility allow-list, read once at startup.
    pub fn with_visible_devices(mut self, visible: Option<Vec<DeviceId>>) -> Self {
        self.visible = visible;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Run the whole experiment and return its finalized record.
    ///
    /// Configuration and resource errors abort before any run starts, as does
    /// a failed smoke test. Failures of individual runs never abort the batch.
    pub fn run(&self) -> PsResult<ExperimentRecord> {
        self.config.validate()?;
        let search = &self.config.pipeline_search;
        info!(
            "Experiment '{}' launch '{}' ({})",
            search.exp_name,
            search.launch_name,
            self.config.date()
        );

        let tracker = self.prepare_devices()?;

        let launch_dir = self.config.launch_dir();
        let generator =
            VariantGenerator::from_experiment(&self.config, launch_dir.join(RUNS_DIR))?;
        let reduction = generator.reduction();
        info!(
            "{} search: {} runs out of {} combinations",
            generator.strategy_name(),
            generator.total(),
            generator.space().size()
        );
        let configs: Vec<RunConfig> = generator.collect();

        if search.do_test {
            let report = self.smoke_test_with(&configs, tracker.as_ref())?;
            if !report.passed() {
                return Err(PsError::SmokeTestFailed {
                    failed: report.failures.len(),
                    total: report.total,
                    scratch: report.scratch_dir,
                });
            }
        }

        let record = ExperimentRecord::new(&self.config, configs.len(), reduction);
        let recorder = RunRecorder::create(&launch_dir, record)?;
        let job: Arc<dyn RunJob> = Arc::new(self.runner.clone());
        self.dispatch(configs, job, tracker.as_ref(), &recorder)?;

        recorder.finalize(self.config.retention())
    }

    /// Train every variant once on truncated data, in training-only mode.
    ///
    /// Inconsistent dataset composition is a configuration error raised before
    /// anything is dispatched. The scratch tree is removed on a clean pass and
    /// kept otherwise.
    pub fn smoke_test(&self) -> PsResult<SmokeReport> {
        self.config.validate()?;
        let tracker = self.prepare_devices()?;
        let runs_dir = self.config.launch_dir().join(RUNS_DIR);
        let configs: Vec<RunConfig> =
            VariantGenerator::from_experiment(&self.config, runs_dir)?.collect();
        self.smoke_test_with(&configs, tracker.as_ref())
    }

    /// Smoke test the exact variants of `configs`, relocated under the
    /// scratch tree.
    fn smoke_test_with(
        &self,
        configs: &[RunConfig],
        tracker: Option<&DeviceTracker>,
    ) -> PsResult<SmokeReport> {
        let scratch_dir = self.config.smoke_dir();
        info!("Smoke test in {}", scratch_dir.display());

        let runs_dir = scratch_dir.join(RUNS_DIR);
        let configs: Vec<RunConfig> = configs
            .iter()
            .map(|config| config.relocated(run_dir(&runs_dir, config.index())))
            .collect();
        let plan = smoke::prepare(self.runner.backend().as_ref(), configs)?;
        let total = plan.configs.len();

        let record = ExperimentRecord::new(&self.config, total, None);
        let recorder = RunRecorder::create(&scratch_dir, record)?;
        let job: Arc<dyn RunJob> = Arc::new(SmokeJob::new(self.runner.clone(), plan.datasets));
        self.dispatch(plan.configs, job, tracker, &recorder)?;

        let failures: Vec<RunOutcome> = recorder
            .outcomes()
            .into_iter()
            .filter(|outcome| !outcome.is_success())
            .collect();
        let report = SmokeReport {
            total,
            failures,
            warnings: plan.warnings,
            scratch_dir,
        };
        drop(recorder);

        if report.passed() {
            std::fs::remove_dir_all(&report.scratch_dir)?;
        }
        report.log();
        Ok(report)
    }

    fn prepare_devices(&self) -> PsResult<Option<DeviceTracker>> {
        let search = &self.config.pipeline_search;
        let Some(request) = DeviceRequest::from_selection(&search.use_gpu) else {
            return Ok(None);
        };
        let (tracker, _) = DeviceTracker::initialize(
            Arc::clone(&self.probe),
            &request,
            self.visible.as_deref(),
            search.gpu_memory_fraction,
        )?;
        Ok(Some(tracker))
    }

    /// Concurrency for `runs` runs over `devices` tracked devices.
    pub fn concurrency(&self, devices: Option<usize>, runs: usize) -> Concurrency {
        let search = &self.config.pipeline_search;
        if !search.multiprocessing {
            return Concurrency::Sequential;
        }
        let workers = match (search.num_workers, devices) {
            (Some(requested), Some(devices)) => {
                if requested > devices {
                    warn!(
                        "{} workers requested but only {} devices are free; using {}",
                        requested, devices, devices
                    );
                }
                requested.min(devices)
            }
            (Some(requested), None) => requested,
            (None, Some(devices)) => devices,
            (None, None) => std::thread::available_parallelism().map_or(1, |n| n.get()),
        };
        Concurrency::Parallel {
            workers: workers.min(runs).max(1),
        }
    }

    /// Execute `configs` with `job`, recording every outcome.
    ///
    /// Device assignment, re-queries and claim releases all happen on this
    /// thread. A run that gets no device fails without being dispatched.
    fn dispatch(
        &self,
        configs: Vec<RunConfig>,
        job: Arc<dyn RunJob>,
        tracker: Option<&DeviceTracker>,
        recorder: &RunRecorder,
    ) -> PsResult<()> {
        let total = configs.len();
        if total == 0 {
            return Ok(());
        }
        let devices = tracker.map(|t| t.pool().len());
        let mut progress = Progress::new(total);

        match self.concurrency(devices, total) {
            Concurrency::Sequential => {
                info!("Dispatching {} runs sequentially", total);
                for config in configs {
                    let mut status = RunStatus::Pending;
                    let device = match assign(tracker, &config, Assignment::First) {
                        Ok(device) => device,
                        Err(outcome) => {
                            status.transition(RunStatus::Failed)?;
                            progress.report(&outcome);
                            recorder.record(outcome)?;
                            continue;
                        }
                    };
                    status = status.transition(RunStatus::Dispatched)?;
                    let outcome = job.run(config, device);
                    release(tracker, device);
                    status.transition(outcome.status())?;
                    progress.report(&outcome);
                    recorder.record(outcome)?;
                }
            }
            Concurrency::Parallel { workers } => {
                info!("Dispatching {} runs on {} workers", total, workers);
                let pool = WorkerPool::new(workers, job)?;
                let mut queue: VecDeque<RunConfig> = configs.into();
                let mut in_flight: HashMap<usize, (RunStatus, Option<DeviceId>)> = HashMap::new();

                loop {
                    while in_flight.len() < pool.size() {
                        let Some(config) = queue.pop_front() else {
                            break;
                        };
                        let status = RunStatus::Pending;
                        match assign(tracker, &config, Assignment::RoundRobin) {
                            Ok(device) => {
                                let status = status.transition(RunStatus::Dispatched)?;
                                debug!(
                                    "Dispatching run {} to {}",
                                    config.index(),
                                    device_label(device)
                                );
                                in_flight.insert(config.index(), (status, device));
                                pool.submit(config, device)?;
                            }
                            Err(outcome) => {
                                status.transition(RunStatus::Failed)?;
                                progress.report(&outcome);
                                recorder.record(outcome)?;
                            }
                        }
                    }
                    if in_flight.is_empty() {
                        break;
                    }

                    let completion = pool.next_completion()?;
                    let outcome = completion.outcome;
                    let (status, device) =
                        in_flight.remove(&outcome.index).ok_or_else(|| {
                            internal_error!("completion for unknown run {}", outcome.index)
                        })?;
                    release(tracker, device);
                    status.transition(outcome.status())?;
                    progress.report(&outcome);
                    recorder.record(outcome)?;
                }
                pool.shutdown();
            }
        }
        Ok(())
    }
}

/// Claim a device for a run, or produce its failed outcome.
fn assign(
    tracker: Option<&DeviceTracker>,
    config: &RunConfig,
    policy: Assignment,
) -> Result<Option<DeviceId>, RunOutcome> {
    let Some(tracker) = tracker else {
        return Ok(None);
    };
    tracker
        .assign(config.index(), policy)
        .map(Some)
        .map_err(|e| {
            warn!("Run {} not dispatched: {}", config.index(), e);
            RunOutcome::failed(config, None, Utc::now(), e.to_string(), None)
        })
}

fn release(tracker: Option<&DeviceTracker>, device: Option<DeviceId>) {
    if let (Some(tracker), Some(device)) = (tracker, device) {
        tracker.release(device);
    }
}

struct Progress {
    total: usize,
    done: usize,
    started: Instant,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            total,
            done: 0,
            started: Instant::now(),
        }
    }

    fn report(&mut self, outcome: &RunOutcome) {
        self.done += 1;
        let status = if outcome.is_success() { "succeeded" } else { "failed" };
        info!(
            "[{}/{}] run {} {} in {} (total {})",
            self.done,
            self.total,
            outcome.index,
            status,
            format_elapsed(outcome.elapsed_secs),
            format_elapsed(self.started.elapsed().as_secs_f64())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DataIterator, Dataset, RunContext};
    use ps_devices::SimulatedProbe;
    use ps_types::Metrics;
    use serde_json::json;

    struct NoopBackend;

    impl TrainingBackend for NoopBackend {
        fn read_data(&self, _config: &RunConfig) -> anyhow::Result<Dataset> {
            Ok(Dataset::default())
        }

        fn train_evaluate(
            &self,
            _config: &RunConfig,
            _iterator: &DataIterator,
            _context: &mut RunContext,
        ) -> anyhow::Result<Metrics> {
            Ok(Metrics::new())
        }

        fn name(&self) -> &str {
            "noop"
        }
    }

    fn orchestrator(search: serde_json::Value) -> Orchestrator {
        let config = ExperimentConfig::from_json_str(
            &json!({
                "pipeline_search": search,
                "model": {"metrics": ["f1"], "template": {}}
            })
            .to_string(),
        )
        .unwrap();
        Orchestrator::new(config, Arc::new(NoopBackend))
    }

    #[test]
    fn sequential_unless_multiprocessing() {
        let orchestrator = orchestrator(json!({"num_workers": 4}));
        assert_eq!(orchestrator.concurrency(Some(2), 10), Concurrency::Sequential);
    }

    #[test]
    fn workers_capped_by_devices_and_runs() {
        let orchestrator = orchestrator(json!({"multiprocessing": true, "num_workers": 4}));
        assert_eq!(
            orchestrator.concurrency(Some(2), 10),
            Concurrency::Parallel { workers: 2 }
        );
        assert_eq!(
            orchestrator.concurrency(None, 10),
            Concurrency::Parallel { workers: 4 }
        );
        assert_eq!(
            orchestrator.concurrency(None, 3),
            Concurrency::Parallel { workers: 3 }
        );
    }

    #[test]
    fn workers_default_to_device_count() {
        let orchestrator = orchestrator(json!({"multiprocessing": true}));
        assert_eq!(
            orchestrator.concurrency(Some(3), 10),
            Concurrency::Parallel { workers: 3 }
        );
    }

    #[test]
    fn busy_devices_abort_before_any_run() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(json!({
            "use_gpu": "all",
            "gpu_memory_fraction": 0.9,
            "experiments_root": dir.path(),
        }))
        .with_probe(Arc::new(SimulatedProbe::new([(0, 0.2), (1, 0.5)])));

        let err = orchestrator.run().unwrap_err();
        assert!(matches!(
            err,
            PsError::Resource(ps_types::ResourceError::AllBusy { .. })
        ));
        assert!(!orchestrator.config().launch_dir().exists());
    }
}
