//! End-to-end orchestrator runs against an in-memory backend and simulated
//! devices.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use ps_devices::SimulatedProbe;
use ps_engine::{DataIterator, Dataset, Orchestrator, RunContext, Split, TrainingBackend};
use ps_types::{
    ConfigError, DeviceId, ExperimentConfig, Metrics, PsError, RunConfig, RunStatus,
    SMOKE_TEST_LAUNCH,
};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

#[derive(Debug, Clone, PartialEq)]
struct Call {
    index: usize,
    fingerprint: String,
    device: Option<DeviceId>,
    smoke: bool,
    sizes: [usize; 3],
    validated: bool,
}

/// Split sizes come from `/dataset/{train,valid,test}`; `f1` is `lr / 10`.
#[derive(Default)]
struct MemoryBackend {
    fail_on_lr: Option<i64>,
    fail_in_smoke: bool,
    calls: Mutex<Vec<Call>>,
    busy: Mutex<HashSet<DeviceId>>,
    shared_device: Mutex<bool>,
}

impl MemoryBackend {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

fn split_size(config: &RunConfig, split: Split) -> usize {
    config
        .get(&format!("/dataset/{}", split.name()))
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

impl TrainingBackend for MemoryBackend {
    fn read_data(&self, config: &RunConfig) -> anyhow::Result<Dataset> {
        let mut data = Dataset::default();
        for split in Split::ALL {
            *data.split_mut(split) = vec![json!({"text": "x"}); split_size(config, split)];
        }
        Ok(data)
    }

    fn train_evaluate(
        &self,
        config: &RunConfig,
        iterator: &DataIterator,
        context: &mut RunContext,
    ) -> anyhow::Result<Metrics> {
        let smoke = config
            .save_dir()
            .components()
            .any(|c| c.as_os_str() == SMOKE_TEST_LAUNCH);
        self.calls.lock().push(Call {
            index: config.index(),
            fingerprint: config.fingerprint().to_string(),
            device: context.device,
            smoke,
            sizes: [
                iterator.len(Split::Train),
                iterator.len(Split::Valid),
                iterator.len(Split::Test),
            ],
            validated: context.mode.to_validate(),
        });

        if let Some(device) = context.device {
            if !self.busy.lock().insert(device) {
                *self.shared_device.lock() = true;
            }
            thread::sleep(Duration::from_millis(20));
            self.busy.lock().remove(&device);
        }

        let lr = config.get("/lr").and_then(Value::as_i64).unwrap_or(0);
        if self.fail_on_lr == Some(lr) && (smoke == self.fail_in_smoke) {
            anyhow::bail!("loss is NaN at lr {lr}");
        }
        Ok(Metrics::from([("f1".to_string(), lr as f64 / 10.0)]))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

fn experiment(root: &Path, search: Value, template: Value) -> ExperimentConfig {
    let mut pipeline_search = json!({
        "search_type": "grid",
        "experiments_root": root,
        "exp_name": "sweep",
        "date": "2024-05-01",
    });
    if let (Some(base), Some(extra)) = (pipeline_search.as_object_mut(), search.as_object()) {
        base.extend(extra.clone());
    }
    ExperimentConfig::from_json_str(
        &json!({
            "pipeline_search": pipeline_search,
            "model": {"metrics": ["f1"], "template": template}
        })
        .to_string(),
    )
    .unwrap()
}

fn setup(
    search: Value,
    template: Value,
    backend: MemoryBackend,
) -> (TempDir, Arc<MemoryBackend>, Orchestrator) {
    let dir = tempdir().unwrap();
    let backend = Arc::new(backend);
    let orchestrator =
        Orchestrator::new(experiment(dir.path(), search, template), backend.clone());
    (dir, backend, orchestrator)
}

#[test]
fn parallel_runs_are_dispatched_and_recorded_once() {
    let (_dir, backend, orchestrator) = setup(
        json!({"multiprocessing": true, "use_gpu": "all", "gpu_memory_fraction": 0.9}),
        json!({"lr": {"search_range": [1, 5]}}),
        MemoryBackend::default(),
    );
    let orchestrator =
        orchestrator.with_probe(Arc::new(SimulatedProbe::new([(0, 1.0), (1, 1.0)])));

    let record = orchestrator.run().unwrap();
    assert_eq!(record.total_runs, 5);
    assert_eq!(record.runs.len(), 5);
    assert_eq!(
        record.runs.iter().map(|r| r.index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );
    assert_eq!(record.succeeded(), 5);

    let calls = backend.calls();
    assert_eq!(calls.len(), 5);
    let indices: BTreeSet<usize> = calls.iter().map(|c| c.index).collect();
    assert_eq!(indices.len(), 5);
    assert!(calls.iter().all(|c| matches!(c.device, Some(0) | Some(1))));
    assert!(!*backend.shared_device.lock());

    let launch = orchestrator.config().launch_dir();
    let log = std::fs::read_to_string(launch.join("runs.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 5);
    assert!(launch.join("experiment.json").exists());
    assert!(launch.join("report.csv").exists());
    assert!(launch.join("runs/run_4/stdout.log").exists());
}

#[test]
fn failing_run_is_reported_while_the_rest_succeed() {
    let (_dir, _backend, orchestrator) = setup(
        json!({}),
        json!({"lr": {"search_range": [1, 4]}}),
        MemoryBackend {
            fail_on_lr: Some(3),
            ..MemoryBackend::default()
        },
    );

    let record = orchestrator.run().unwrap();
    assert_eq!(record.runs.len(), 4);
    assert_eq!(record.failed(), 1);

    let failed = record.run(2).unwrap();
    assert_eq!(failed.status(), RunStatus::Failed);
    assert!(failed.error().unwrap().contains("NaN"));
    assert!(failed.save_dir.join("stderr.log").exists());

    assert_eq!(record.ranking, vec![3, 1, 0, 2]);
    assert_eq!(record.best().unwrap().index, 3);
}

#[test]
fn smoke_test_runs_on_truncated_data_before_full_runs() {
    let (_dir, backend, orchestrator) = setup(
        json!({"do_test": true}),
        json!({
            "lr": 1,
            "dataset": {"train": {"search_choice": [500, 40]}, "valid": 50, "test": 50}
        }),
        MemoryBackend::default(),
    );

    let record = orchestrator.run().unwrap();
    assert_eq!(record.succeeded(), 2);

    let calls = backend.calls();
    let smoke: Vec<&Call> = calls.iter().filter(|c| c.smoke).collect();
    let full: Vec<&Call> = calls.iter().filter(|c| !c.smoke).collect();
    assert_eq!(smoke.len(), 2);
    assert_eq!(full.len(), 2);

    let smoke_sizes: Vec<[usize; 3]> = smoke.iter().map(|c| c.sizes).collect();
    assert_eq!(smoke_sizes, vec![[100, 20, 20], [40, 20, 20]]);
    assert!(smoke.iter().all(|c| !c.validated));

    let full_sizes: Vec<[usize; 3]> = full.iter().map(|c| c.sizes).collect();
    assert_eq!(full_sizes, vec![[500, 50, 50], [40, 50, 50]]);
    assert!(full.iter().all(|c| c.validated));

    // Clean pass removes the scratch tree
    assert!(!orchestrator.config().smoke_dir().exists());
}

#[test]
fn unseeded_random_smoke_test_checks_the_dispatched_variants() {
    let (_dir, backend, orchestrator) = setup(
        json!({"search_type": "random", "sample_num": 3, "do_test": true}),
        json!({"lr": {"search_range": [1, 1000]}, "dataset": {"train": 10}}),
        MemoryBackend::default(),
    );

    let record = orchestrator.run().unwrap();
    assert_eq!(record.succeeded(), 3);

    let calls = backend.calls();
    let variants = |smoke: bool| -> BTreeSet<(usize, String)> {
        calls
            .iter()
            .filter(|c| c.smoke == smoke)
            .map(|c| (c.index, c.fingerprint.clone()))
            .collect()
    };
    assert_eq!(variants(true).len(), 3);
    assert_eq!(variants(true), variants(false));
}

#[test]
fn smoke_test_warns_about_small_train_split() {
    let (_dir, _backend, orchestrator) = setup(
        json!({}),
        json!({"dataset": {"train": 40, "valid": 5}}),
        MemoryBackend::default(),
    );

    let report = orchestrator.smoke_test().unwrap();
    assert!(report.passed());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("40"));
}

#[test]
fn inconsistent_composition_aborts_before_dispatch() {
    let (_dir, backend, orchestrator) = setup(
        json!({"do_test": true}),
        json!({"dataset": {"search_choice": [
            {"train": 10, "valid": 0, "test": 5},
            {"train": 10, "valid": 5, "test": 5}
        ]}}),
        MemoryBackend::default(),
    );

    let err = orchestrator.run().unwrap_err();
    match err {
        PsError::Config(ConfigError::InconsistentComposition {
            index,
            split,
            expected,
            found,
        }) => {
            assert_eq!(index, 1);
            assert_eq!(split, "valid");
            assert!(!expected);
            assert!(found);
        }
        other => panic!("expected composition error, got {other}"),
    }
    assert!(backend.calls().is_empty());
    assert!(!orchestrator.config().launch_dir().exists());
}

#[test]
fn failed_smoke_test_keeps_scratch_and_aborts() {
    let (_dir, backend, orchestrator) = setup(
        json!({"do_test": true}),
        json!({"lr": {"search_choice": [1, 2]}, "dataset": {"train": 10}}),
        MemoryBackend {
            fail_on_lr: Some(2),
            fail_in_smoke: true,
            ..MemoryBackend::default()
        },
    );

    let err = orchestrator.run().unwrap_err();
    match err {
        PsError::SmokeTestFailed {
            failed,
            total,
            scratch,
        } => {
            assert_eq!((failed, total), (1, 2));
            assert!(scratch.join("runs/run_1/stderr.log").exists());
        }
        other => panic!("expected smoke test failure, got {other}"),
    }
    assert!(backend.calls().iter().all(|c| c.smoke));
    assert!(!orchestrator.config().launch_dir().exists());
}

#[test]
fn save_best_keeps_only_the_best_checkpoint() {
    let (_dir, _backend, orchestrator) = setup(
        json!({"save_best": true}),
        json!({"lr": {"search_range": [1, 3]}}),
        MemoryBackend::default(),
    );

    let record = orchestrator.run().unwrap();
    assert_eq!(record.pruned, vec![0, 1]);
    let runs = orchestrator.config().launch_dir().join("runs");
    assert!(runs.join("run_2").exists());
    assert!(!runs.join("run_0").exists());
    assert!(!runs.join("run_1").exists());
}

#[test]
fn random_search_beyond_the_space_is_capped() {
    let (_dir, _backend, orchestrator) = setup(
        json!({"search_type": "random", "sample_num": 10, "seed": 7}),
        json!({"lr": {"search_choice": [1, 2, 3]}}),
        MemoryBackend::default(),
    );

    let record = orchestrator.run().unwrap();
    assert_eq!(record.total_runs, 3);
    let reduction = record.reduction.unwrap();
    assert_eq!((reduction.requested, reduction.available), (10, 3));
    let lrs: BTreeSet<i64> = record
        .runs
        .iter()
        .map(|r| (r.metric("f1").unwrap() * 10.0).round() as i64)
        .collect();
    assert_eq!(lrs, BTreeSet::from([1, 2, 3]));
}

#[test]
fn explicit_devices_are_limited_to_visible_ones() {
    let (_dir, backend, orchestrator) = setup(
        json!({"multiprocessing": true, "use_gpu": [0, 1], "gpu_memory_fraction": 0.5}),
        json!({"lr": {"search_range": [1, 3]}}),
        MemoryBackend::default(),
    );
    let orchestrator = orchestrator
        .with_probe(Arc::new(SimulatedProbe::new([(0, 1.0), (1, 1.0), (2, 1.0)])))
        .with_visible_devices(Some(vec![1, 2]));

    let record = orchestrator.run().unwrap();
    assert_eq!(record.succeeded(), 3);
    assert!(backend.calls().iter().all(|c| c.device == Some(1)));
}

#[test]
fn disjoint_device_request_is_fatal() {
    let (_dir, backend, orchestrator) = setup(
        json!({"use_gpu": 5}),
        json!({"lr": 1}),
        MemoryBackend::default(),
    );
    let orchestrator = orchestrator
        .with_probe(Arc::new(SimulatedProbe::new([(1, 1.0), (2, 1.0)])))
        .with_visible_devices(Some(vec![1, 2]));

    let err = orchestrator.run().unwrap_err();
    assert!(matches!(err, PsError::Resource(_)));
    assert!(err.to_string().contains("[5]"));
    assert!(backend.calls().is_empty());
}
