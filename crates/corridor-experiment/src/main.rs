//! Corridor Experiment CLI.
//!
//! Commands:
//! - run: Run one closed-loop experiment and write its control trace
//! - ablation: Coordination and queue override on/off
//! - sweep: Queue estimation across connected-vehicle penetration rates
//! - generate-config: Write a generated corridor configuration as JSON

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use corridor_experiment::experiment::{Engine, ExperimentRunner, ExperimentRunnerConfig};
use corridor_experiment::generator::{CorridorGenerator, ScenarioConfig};
use corridor_experiment::results::{GridResults, format_duration};
use metering_kernel::CorridorConfig;

/// Generate a timestamped output path from the given path.
/// e.g., "trace.json" -> "trace-20260108-010530.json"
fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}-{timestamp}.{ext}"))
}

#[derive(Parser)]
#[command(name = "corridor-experiment")]
#[command(version)]
#[command(about = "Closed-loop coordinated ramp-metering experiments")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Number of metered ramps in generated corridors (a loaded --config
    /// keeps its own ramps)
    #[arg(long, default_value = "13", global = true)]
    ramps: usize,

    /// Simulated hours per run [default: 7, or the horizon of a loaded --config]
    #[arg(long, global = true)]
    hours: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single experiment
    Run {
        /// Corridor configuration (JSON); generated when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Control plane: sync or actors
        #[arg(long, default_value = "sync")]
        engine: String,

        /// Connected-vehicle penetration rate
        #[arg(long)]
        penetration: Option<f64>,

        /// Meter every ramp on its local law alone
        #[arg(long)]
        no_coordination: bool,

        /// Disable the queue override on every ramp
        #[arg(long)]
        no_queue_override: bool,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Output file for the control trace
        #[arg(long, default_value = "trace.json")]
        output: PathBuf,
    },

    /// Run ablation study
    Ablation {
        /// Number of trials per configuration
        #[arg(long, default_value = "5")]
        trials: usize,

        /// Control plane: sync or actors
        #[arg(long, default_value = "sync")]
        engine: String,

        /// Output file for results
        #[arg(long, default_value = "ablation.json")]
        output: PathBuf,
    },

    /// Sweep the connected-vehicle penetration rate
    Sweep {
        /// Penetration rates to test (comma-separated)
        #[arg(long, default_value = "0.05,0.1,0.2,0.5,1.0", value_delimiter = ',')]
        penetrations: Vec<f64>,

        /// Number of trials per rate
        #[arg(long, default_value = "3")]
        trials: usize,

        /// Output file for results
        #[arg(long, default_value = "sweep.json")]
        output: PathBuf,
    },

    /// Generate a corridor configuration
    GenerateConfig {
        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Connected-vehicle penetration rate
        #[arg(long, default_value = "0.1")]
        penetration: f64,

        /// Output file; printed to stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let horizon_s = cli.hours.map(|hours| hours * 3600.0);
    let mut scenario = ScenarioConfig {
        ramps: cli.ramps,
        ..Default::default()
    };
    if let Some(horizon_s) = horizon_s {
        scenario.total_time_s = horizon_s;
    }

    match cli.command {
        Commands::Run {
            config,
            engine,
            penetration,
            no_coordination,
            no_queue_override,
            seed,
            output,
        } => {
            let engine: Engine = engine.parse()?;
            let mut corridor = match config {
                Some(path) => Some(
                    CorridorConfig::from_path(&path)
                        .with_context(|| format!("loading {}", path.display()))?,
                ),
                None => None,
            };
            if let (Some(corridor), Some(rate)) = (corridor.as_mut(), penetration) {
                corridor.estimator.penetration_rate = rate;
            }

            let config = ExperimentRunnerConfig {
                scenario: ScenarioConfig {
                    penetration_rate: penetration.unwrap_or(scenario.penetration_rate),
                    ..scenario
                },
                corridor,
                horizon_s,
                coordination_enabled: !no_coordination,
                queue_override_enabled: !no_queue_override,
                ..Default::default()
            };

            let runner = ExperimentRunner::new(config);
            let result = runner.run(engine, 0, seed).await?;

            let mut results = GridResults::new();
            results.add(result.clone());
            results.compute_summary();
            let output_path = timestamped_path(&output);
            results.save(&output_path)?;

            println!("\n=== Experiment Result ===");
            println!("Engine: {}", result.config.engine);
            println!("Ramps: {}", result.config.ramps);
            println!("Coordination: {}", result.config.coordination_enabled);
            println!("Queue override: {}", result.config.queue_override_enabled);
            println!("Penetration: {:.2}", result.config.penetration_rate);
            println!("Periods: {}", result.total_periods);
            println!("Mean occupancy: {:.3}", result.mean_occupancy);
            println!("Peak occupancy: {:.3}", result.peak_occupancy);
            println!("Mean queue error: {:.2} veh", result.mean_queue_error);
            println!("Active fraction: {:.2}", result.mean_active_fraction);
            println!("Spillback ticks: {}", result.total_spillback_ticks);
            println!("Wall time: {}", format_duration(result.duration_ms()));

            println!("\nPer-Ramp Summary:");
            println!(
                "  {:<10} {:>7} {:>9} {:>9} {:>8} {:>9} {:>8}",
                "Ramp", "Active", "Rate", "QErr", "MaxQ", "Spill", "Clamped"
            );
            for ramp in &result.ramp_summaries {
                println!(
                    "  {:<10} {:>7.2} {:>9.0} {:>9.2} {:>8} {:>9} {:>8}",
                    ramp.ramp,
                    ramp.active_fraction,
                    ramp.mean_active_rate,
                    ramp.mean_queue_error,
                    ramp.max_queue,
                    ramp.spillback_ticks,
                    ramp.clamped_commands
                );
            }
            println!("\nTrace saved to: {}", output_path.display());
        }

        Commands::Ablation {
            trials,
            engine,
            output,
        } => {
            let engine: Engine = engine.parse()?;
            info!(trials = trials, engine = engine.name(), "Starting ablation study");

            // (coordination, queue override)
            let configs = [(true, true), (false, true), (true, false), (false, false)];

            let mut results = GridResults::new();
            let total = configs.len() * trials;
            let mut completed = 0;

            for (coordination, queue_override) in configs {
                for trial in 0..trials {
                    let config = ExperimentRunnerConfig {
                        scenario: scenario.clone(),
                        coordination_enabled: coordination,
                        queue_override_enabled: queue_override,
                        record_periods: false,
                        ..Default::default()
                    };

                    // Same seed per trial across configurations
                    let runner = ExperimentRunner::new(config);
                    let result = runner.run(engine, trial, Some(trial as u64)).await?;

                    results.add(result);
                    completed += 1;

                    info!(
                        progress = format!("{}/{}", completed, total),
                        coordination = coordination,
                        queue_override = queue_override,
                        trial = trial,
                        "Completed ablation run"
                    );
                }
            }

            results.compute_summary();
            let output_path = timestamped_path(&output);
            results.save(&output_path)?;

            println!("\n=== Ablation Study Complete ===");
            println!("Results saved to: {}", output_path.display());
            print_summary(&results);
        }

        Commands::Sweep {
            penetrations,
            trials,
            output,
        } => {
            info!(
                rates = penetrations.len(),
                trials = trials,
                "Starting penetration sweep"
            );

            let mut results = GridResults::new();
            let total = penetrations.len() * trials;
            let mut completed = 0;

            for &rate in &penetrations {
                for trial in 0..trials {
                    let config = ExperimentRunnerConfig {
                        scenario: ScenarioConfig {
                            penetration_rate: rate,
                            ..scenario.clone()
                        },
                        record_periods: false,
                        ..Default::default()
                    };

                    let runner = ExperimentRunner::new(config);
                    let result = runner.run(Engine::Sync, trial, Some(trial as u64)).await?;

                    results.add(result);
                    completed += 1;

                    info!(
                        progress = format!("{}/{}", completed, total),
                        penetration = rate,
                        trial = trial,
                        "Completed sweep run"
                    );
                }
            }

            results.compute_summary();
            let output_path = timestamped_path(&output);
            results.save(&output_path)?;

            println!("\n=== Penetration Sweep Complete ===");
            println!("Results saved to: {}", output_path.display());
            print_summary(&results);
        }

        Commands::GenerateConfig {
            seed,
            penetration,
            output,
        } => {
            let generated = CorridorGenerator::new(ScenarioConfig {
                seed,
                penetration_rate: penetration,
                ..scenario
            })
            .generate()?;
            let json = serde_json::to_string_pretty(&generated.corridor)?;

            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!(
                        "Wrote {} ramps to {}",
                        generated.corridor.ramps.len(),
                        path.display()
                    );
                }
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}

fn print_summary(results: &GridResults) {
    println!("\nSummary:");
    for summary in results.sorted_summaries() {
        println!(
            "  {}: occupancy={:.3}±{:.3}, queue_error={:.2}, active={:.2}, spillback={:.0}",
            summary.config_key,
            summary.mean_occupancy,
            summary.mean_occupancy_se,
            summary.mean_queue_error,
            summary.mean_active_fraction,
            summary.mean_spillback_ticks
        );
    }
}
