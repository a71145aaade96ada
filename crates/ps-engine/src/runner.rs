//! Execution of a single run.

use std::any::Any;
use std::fs::File;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use ps_types::{format_elapsed, DeviceId, RunConfig, RunOutcome};
use tracing::{debug, info, warn};

use crate::backend::{Dataset, RunContext, RunMode, TrainingBackend};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Executes runs against a training backend.
///
/// A runner never returns an error: failures and panics of the backend are
/// turned into failed [`RunOutcome`]s, so nothing escapes to the dispatch loop.
#[derive(Clone)]
pub struct Runner {
    backend: Arc<dyn TrainingBackend>,
}

impl Runner {
    pub fn new(backend: Arc<dyn TrainingBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn TrainingBackend> {
        &self.backend
    }

    /// Read data, train and validate one configuration on `device`.
    pub fn execute(&self, config: &RunConfig, device: Option<DeviceId>) -> RunOutcome {
        self.run(config, device, RunMode::Full, None)
    }

    /// Execute with data prepared by the caller instead of the backend's
    /// `read_data`.
    pub fn execute_prepared(
        &self,
        config: &RunConfig,
        device: Option<DeviceId>,
        data: Dataset,
        mode: RunMode,
    ) -> RunOutcome {
        self.run(config, device, mode, Some(data))
    }

    fn run(
        &self,
        config: &RunConfig,
        device: Option<DeviceId>,
        mode: RunMode,
        data: Option<Dataset>,
    ) -> RunOutcome {
        let started_at = Utc::now();
        let index = config.index();
        debug!(
            "Run {} starting on {} in {}",
            index,
            device_label(device),
            config.save_dir().display()
        );

        let mut context = match self.open_context(config, device, mode) {
            Ok(context) => context,
            Err(e) => {
                warn!("Run {} could not prepare its directory: {}", index, e);
                return RunOutcome::failed(
                    config,
                    device,
                    started_at,
                    format!("failed to prepare run directory: {e}"),
                    None,
                );
            }
        };

        let backend = &self.backend;
        let result = catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<_> {
            let data = match data {
                Some(data) => data,
                None => backend.read_data(config)?,
            };
            let iterator = backend.build_iterator(config, data)?;
            backend.train_evaluate(config, &iterator, &mut context)
        }));

        let outcome = match result {
            Ok(Ok(metrics)) => RunOutcome::succeeded(config, device, started_at, metrics),
            Ok(Err(e)) => RunOutcome::failed(
                config,
                device,
                started_at,
                e.to_string(),
                Some(format!("{e:?}")),
            ),
            Err(payload) => RunOutcome::failed(
                config,
                device,
                started_at,
                format!("run panicked: {}", panic_message(payload.as_ref())),
                None,
            ),
        };

        if let Some(error) = outcome.error() {
            use std::io::Write;
            let _ = writeln!(context.stderr, "pipesweep: run {index} failed: {error}");
            warn!("Run {} failed: {}", index, error);
        } else {
            info!(
                "Run {} finished on {} in {}",
                index,
                device_label(device),
                format_elapsed(outcome.elapsed_secs)
            );
        }
        outcome
    }

    fn open_context(
        &self,
        config: &RunConfig,
        device: Option<DeviceId>,
        mode: RunMode,
    ) -> std::io::Result<RunContext> {
        let dir = config.save_dir();
        std::fs::create_dir_all(dir)?;
        Ok(RunContext {
            device,
            mode,
            stdout: File::create(dir.join(STDOUT_LOG))?,
            stderr: File::create(dir.join(STDERR_LOG))?,
        })
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("backend", &self.backend.name())
            .finish()
    }
}

pub(crate) fn device_label(device: Option<DeviceId>) -> String {
    match device {
        Some(id) => format!("device {id}"),
        None => "cpu".to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DataIterator;
    use ps_types::{Metrics, RunStatus};
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;

    /// Behaves according to the `/behavior` value of the configuration.
    struct ScriptedBackend;

    impl TrainingBackend for ScriptedBackend {
        fn read_data(&self, _config: &RunConfig) -> anyhow::Result<Dataset> {
            Ok(Dataset {
                train: vec![json!(1), json!(2)],
                ..Dataset::default()
            })
        }

        fn train_evaluate(
            &self,
            config: &RunConfig,
            iterator: &DataIterator,
            context: &mut RunContext,
        ) -> anyhow::Result<Metrics> {
            writeln!(context.stdout, "train size {}", iterator.data().train.len())?;
            match config.get("/behavior").and_then(|v| v.as_str()) {
                Some("fail") => anyhow::bail!("loss diverged"),
                Some("panic") => panic!("index out of bounds"),
                _ => Ok(Metrics::from([("f1".to_string(), 0.5)])),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn config(dir: &std::path::Path, behavior: &str) -> RunConfig {
        RunConfig::new(4, "fp", dir.join("run_4"), json!({"behavior": behavior}))
    }

    #[test]
    fn successful_run_writes_logs() {
        let dir = tempdir().unwrap();
        let runner = Runner::new(Arc::new(ScriptedBackend));
        let config = config(dir.path(), "ok");

        let outcome = runner.execute(&config, Some(1));
        assert_eq!(outcome.status(), RunStatus::Succeeded);
        assert_eq!(outcome.device, Some(1));
        assert_eq!(outcome.metric("f1"), Some(0.5));

        let stdout = std::fs::read_to_string(config.save_dir().join(STDOUT_LOG)).unwrap();
        assert_eq!(stdout, "train size 2\n");
        assert!(config.save_dir().join(STDERR_LOG).exists());
    }

    #[test]
    fn backend_error_becomes_failed_outcome() {
        let dir = tempdir().unwrap();
        let runner = Runner::new(Arc::new(ScriptedBackend));
        let config = config(dir.path(), "fail");

        let outcome = runner.execute(&config, None);
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert_eq!(outcome.error(), Some("loss diverged"));

        let stderr = std::fs::read_to_string(config.save_dir().join(STDERR_LOG)).unwrap();
        assert!(stderr.contains("loss diverged"));
    }

    #[test]
    fn panic_becomes_failed_outcome() {
        let dir = tempdir().unwrap();
        let runner = Runner::new(Arc::new(ScriptedBackend));

        let outcome = runner.execute(&config(dir.path(), "panic"), None);
        assert_eq!(outcome.status(), RunStatus::Failed);
        assert!(outcome.error().unwrap().contains("index out of bounds"));
    }

    #[test]
    fn prepared_data_replaces_read_data() {
        let dir = tempdir().unwrap();
        let runner = Runner::new(Arc::new(ScriptedBackend));
        let config = config(dir.path(), "ok");
        let data = Dataset {
            train: vec![json!(0); 7],
            ..Dataset::default()
        };

        let outcome = runner.execute_prepared(&config, None, data, RunMode::TrainOnly);
        assert!(outcome.is_success());
        let stdout = std::fs::read_to_string(config.save_dir().join(STDOUT_LOG)).unwrap();
        assert_eq!(stdout, "train size 7\n");
    }
}
