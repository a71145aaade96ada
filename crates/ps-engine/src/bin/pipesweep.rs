//! Pipesweep CLI
//!
//! Runs hyperparameter and pipeline sweeps described by a JSON experiment file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ps_devices::{
    query_free, visible_devices_from_env, DeviceProbe, DeviceRequest, NvidiaSmiProbe,
    SimulatedProbe,
};
use ps_engine::{CommandBackend, Orchestrator, RUNS_DIR};
use ps_search::VariantGenerator;
use ps_types::{DeviceId, ExperimentConfig, RunResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pipesweep", about = "Experiment sweep orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment
    Run {
        /// Path to the experiment JSON file
        #[arg(short, long)]
        config: PathBuf,

        /// Trainer program executed once per run
        #[arg(short, long)]
        trainer: String,

        /// Only run the smoke test
        #[arg(long)]
        smoke_only: bool,

        /// Arguments passed to the trainer
        #[arg(last = true)]
        trainer_args: Vec<String>,
    },

    /// List the variants an experiment would run
    Plan {
        /// Path to the experiment JSON file
        #[arg(short, long)]
        config: PathBuf,

        /// Print the resolved values of every variant
        #[arg(long)]
        values: bool,
    },

    /// Show free devices
    Devices {
        /// Minimum free memory fraction
        #[arg(short, long, default_value_t = 0.99)]
        threshold: f64,

        /// Restrict to these device ids
        #[arg(long, value_delimiter = ',')]
        ids: Vec<DeviceId>,

        /// Use simulated, fully free devices instead of nvidia-smi
        #[arg(long)]
        simulate: Option<u32>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            trainer,
            smoke_only,
            trainer_args,
        } => {
            let experiment = ExperimentConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let visible = visible_devices_from_env()?;
            let backend = Arc::new(CommandBackend::new(trainer, trainer_args));
            let orchestrator =
                Orchestrator::new(experiment, backend).with_visible_devices(visible);

            if smoke_only {
                let report = orchestrator.smoke_test()?;
                for warning in &report.warnings {
                    println!("Warning: {warning}");
                }
                if !report.passed() {
                    anyhow::bail!(
                        "smoke test failed for {} of {} variants; see {}",
                        report.failures.len(),
                        report.total,
                        report.scratch_dir.display()
                    );
                }
                println!("Smoke test passed ({} variants)", report.total);
                return Ok(());
            }

            let record = orchestrator.run()?;

            println!();
            println!("=== Experiment Complete ===");
            println!("Total: {}", record.total_runs);
            println!("Succeeded: {}", record.succeeded());
            println!("Failed: {}", record.failed());
            println!("Elapsed: {}", record.elapsed.as_deref().unwrap_or_default());
            if let Some(reduction) = &record.reduction {
                println!("Note: {reduction}");
            }
            if let Some(best) = record.best() {
                println!(
                    "Best: run {} ({} = {})",
                    best.index,
                    record.target_metric,
                    best.metric(&record.target_metric).unwrap_or_default()
                );
            }
            for run in &record.runs {
                if let RunResult::Failed { error, .. } = &run.result {
                    println!("  run {}: {error}", run.index);
                }
            }
            println!("Results in {}", orchestrator.config().launch_dir().display());
        }

        Commands::Plan { config, values } => {
            let experiment = ExperimentConfig::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            let generator = VariantGenerator::from_experiment(
                &experiment,
                experiment.launch_dir().join(RUNS_DIR),
            )?;

            println!(
                "{} search: {} runs out of {} combinations ({} variation points)",
                generator.strategy_name(),
                generator.total(),
                generator.space().size(),
                generator.space().variation_points()
            );
            if let Some(reduction) = generator.reduction() {
                println!("Note: {reduction}");
            }
            for run in generator {
                println!(
                    "  {:>4}  {}  {}",
                    run.index(),
                    &run.fingerprint()[..12],
                    run.save_dir().display()
                );
                if values {
                    println!("        {}", run.values());
                }
            }
        }

        Commands::Devices {
            threshold,
            ids,
            simulate,
        } => {
            let probe: Arc<dyn DeviceProbe> = match simulate {
                Some(count) => Arc::new(SimulatedProbe::new((0..count).map(|id| (id, 1.0)))),
                None => Arc::new(NvidiaSmiProbe::new()),
            };
            let visible = visible_devices_from_env()?;
            let request = if ids.is_empty() {
                DeviceRequest::All
            } else {
                DeviceRequest::Explicit(ids)
            };

            for device in probe.snapshot()? {
                println!(
                    "device {}: {} / {} MiB free ({:.1}%)",
                    device.id,
                    device.free_mib,
                    device.total_mib,
                    device.free_fraction() * 100.0
                );
            }
            let answer = query_free(probe.as_ref(), &request, visible.as_deref(), threshold)?;
            println!("Free (>= {:.0}%): {:?}", threshold * 100.0, answer.devices);
            if let Some(shortfall) = answer.shortfall {
                let busy: Vec<DeviceId> = shortfall
                    .requested
                    .into_iter()
                    .filter(|id| !shortfall.available.contains(id))
                    .collect();
                println!("Busy: {busy:?}");
            }
        }
    }

    Ok(())
}
