//! Fixed-size worker pool carrying owned run configurations.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use ps_types::{internal_error, DeviceId, PsResult, RunConfig, RunOutcome};
use tracing::{debug, error};

use crate::runner::Runner;

/// Work executed by a pool worker for one run.
pub trait RunJob: Send + Sync {
    fn run(&self, config: RunConfig, device: Option<DeviceId>) -> RunOutcome;
}

impl RunJob for Runner {
    fn run(&self, config: RunConfig, device: Option<DeviceId>) -> RunOutcome {
        self.execute(&config, device)
    }
}

struct Task {
    config: RunConfig,
    device: Option<DeviceId>,
}

/// A finished run, as reported by a worker.
#[derive(Debug)]
pub struct Completion {
    pub worker: usize,
    pub outcome: RunOutcome,
}

/// Worker threads sharing one task queue and reporting on one completion
/// channel.
///
/// Tasks are only submitted when a worker is idle, so the caller decides the
/// device of each run just before it starts.
pub struct WorkerPool {
    tasks: Option<Sender<Task>>,
    completions: Receiver<Completion>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize, job: Arc<dyn RunJob>) -> PsResult<Self> {
        let (task_tx, task_rx) = unbounded::<Task>();
        let (done_tx, done_rx) = unbounded::<Completion>();

        let handles = (0..size.max(1))
            .map(|worker| {
                let tasks = task_rx.clone();
                let done = done_tx.clone();
                let job = Arc::clone(&job);
                thread::Builder::new()
                    .name(format!("pipesweep-worker-{worker}"))
                    .spawn(move || worker_loop(worker, tasks, done, job))
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Started {} workers", handles.len());
        Ok(Self {
            tasks: Some(task_tx),
            completions: done_rx,
            handles,
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn submit(&self, config: RunConfig, device: Option<DeviceId>) -> PsResult<()> {
        let index = config.index();
        self.tasks
            .as_ref()
            .ok_or_else(|| internal_error!("worker pool is shut down"))?
            .send(Task { config, device })
            .map_err(|_| internal_error!("no worker left to accept run {}", index))
    }

    /// Block until the next run finishes.
    pub fn next_completion(&self) -> PsResult<Completion> {
        self.completions
            .recv()
            .map_err(|_| internal_error!("all workers exited with runs outstanding"))
    }

    /// Close the queue and wait for every worker to exit.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.tasks.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(
    worker: usize,
    tasks: Receiver<Task>,
    done: Sender<Completion>,
    job: Arc<dyn RunJob>,
) {
    for Task { config, device } in tasks.iter() {
        let fallback = config.clone();
        let started_at = Utc::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| job.run(config, device)))
            .unwrap_or_else(|_| {
                RunOutcome::failed(&fallback, device, started_at, "worker panicked", None)
            });
        if done.send(Completion { worker, outcome }).is_err() {
            break;
        }
    }
    debug!("Worker {} exiting", worker);
}
