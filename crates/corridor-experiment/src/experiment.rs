//! Experiment runner for closed-loop corridor experiments.
//!
//! Orchestrates the experiment lifecycle:
//! 1. Generate the corridor and demand (or take a loaded corridor)
//! 2. Set up the kernel around the point-queue corridor
//! 3. Run the tick loop to the horizon with the chosen control plane
//! 4. Collect the control trace and per-ramp totals

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use acton_reactive::prelude::*;
use metering_kernel::messages::PeriodComplete;
use metering_kernel::{AsyncControlPlane, CorridorConfig, Kernel, PeriodPlan, PeriodSnapshot};

use crate::generator::{CorridorGenerator, Scenario, ScenarioConfig};
use crate::results::{ExperimentConfig, ExperimentResult, PeriodMetrics, RampSample, RampSummary};
use crate::simulator::{PointQueueCorridor, SimulatorConfig};
use crate::tick_driver::PeriodDriverActor;

/// Wall-clock limit on one actor-evaluated period.
const PERIOD_TIMEOUT: Duration = Duration::from_secs(30);

/// Control plane used to evaluate each period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// Controllers and coordinator evaluated inline
    Sync,
    /// One RampActor per ramp plus a CorridorCoordinator actor
    Actors,
}

impl Engine {
    pub fn all() -> Vec<Self> {
        vec![Self::Sync, Self::Actors]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Actors => "actors",
        }
    }
}

impl FromStr for Engine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(Self::Sync),
            "actors" => Ok(Self::Actors),
            other => bail!("unknown engine: {other} (expected sync or actors)"),
        }
    }
}

/// Configuration for the experiment runner.
#[derive(Debug, Clone)]
pub struct ExperimentRunnerConfig {
    pub scenario: ScenarioConfig,
    pub simulator: SimulatorConfig,
    /// Loaded corridor used instead of the generated one; demand is still
    /// generated, one profile entry per loaded ramp
    pub corridor: Option<CorridorConfig>,
    /// Run horizon in simulated seconds; overrides the corridor's own
    pub horizon_s: Option<f64>,
    /// Ablation switch: false forces every ramp to meter locally
    pub coordination_enabled: bool,
    /// Ablation switch: false disables every ramp's queue override
    pub queue_override_enabled: bool,
    /// Keep per-period samples in the result
    pub record_periods: bool,
}

impl Default for ExperimentRunnerConfig {
    fn default() -> Self {
        Self {
            scenario: ScenarioConfig::default(),
            simulator: SimulatorConfig::default(),
            corridor: None,
            horizon_s: None,
            coordination_enabled: true,
            queue_override_enabled: true,
            record_periods: true,
        }
    }
}

/// The experiment runner.
pub struct ExperimentRunner {
    config: ExperimentRunnerConfig,
}

impl ExperimentRunner {
    pub fn new(config: ExperimentRunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExperimentRunnerConfig {
        &self.config
    }

    /// Build the scenario for one trial with the ablation switches applied.
    pub fn prepare(&self, seed: Option<u64>) -> Result<Scenario> {
        let mut scenario_config = ScenarioConfig {
            seed,
            ..self.config.scenario.clone()
        };
        if let Some(corridor) = &self.config.corridor {
            scenario_config.ramps = corridor.ramps.len();
        }
        if let Some(horizon_s) = self.config.horizon_s {
            scenario_config.total_time_s = horizon_s;
        }
        let mut scenario = CorridorGenerator::new(scenario_config).generate()?;

        if let Some(corridor) = &self.config.corridor {
            scenario.corridor = corridor.clone();
        }

        let corridor = &mut scenario.corridor;
        if let Some(horizon_s) = self.config.horizon_s {
            corridor.total_time_s = horizon_s;
        }
        corridor.coordinator.enabled &= self.config.coordination_enabled;
        if !self.config.queue_override_enabled {
            corridor.controller_defaults.queue_override_enabled = false;
            for controller in corridor.controllers.values_mut() {
                controller.queue_override_enabled = false;
            }
        }
        corridor.validate()?;
        Ok(scenario)
    }

    /// Run a single experiment to the corridor's horizon.
    pub async fn run(
        &self,
        engine: Engine,
        trial: usize,
        seed: Option<u64>,
    ) -> Result<ExperimentResult> {
        let started_at = Utc::now();
        let scenario = self.prepare(seed)?;

        let simulator = SimulatorConfig {
            seed: self.config.simulator.seed.or(seed),
            ..self.config.simulator.clone()
        };
        let env = PointQueueCorridor::new(&scenario, simulator)?;
        let mut kernel = Kernel::new(scenario.corridor.clone(), env)?;

        info!(
            engine = engine.name(),
            trial = trial,
            ramps = kernel.corridor().len(),
            coordination = scenario.corridor.coordinator.enabled,
            penetration = scenario.corridor.estimator.penetration_rate,
            "Starting experiment"
        );

        let mut recorder = TraceRecorder::new(&kernel, self.config.record_periods);
        match engine {
            Engine::Sync => run_sync(&mut kernel, &mut recorder)?,
            Engine::Actors => run_actors(&mut kernel, &mut recorder).await?,
        }

        let config = ExperimentConfig {
            engine: engine.name().to_string(),
            ramps: kernel.corridor().len(),
            coordination_enabled: scenario.corridor.coordinator.enabled,
            queue_override_enabled: self.config.queue_override_enabled,
            penetration_rate: scenario.corridor.estimator.penetration_rate,
            total_time_s: scenario.corridor.total_time_s,
            trial,
            seed,
            scenario_id: scenario.id.clone(),
        };
        let result = recorder.finish(&kernel, config, started_at);

        info!(
            engine = engine.name(),
            periods = result.total_periods,
            mean_occupancy = format!("{:.3}", result.mean_occupancy),
            queue_error = format!("{:.2}", result.mean_queue_error),
            active = format!("{:.2}", result.mean_active_fraction),
            "Experiment complete"
        );
        Ok(result)
    }
}

fn run_sync(kernel: &mut Kernel<PointQueueCorridor>, recorder: &mut TraceRecorder) -> Result<()> {
    let mut plane = kernel.control_plane()?;
    while !kernel.is_finished() {
        if let Some(snapshot) = kernel.advance()? {
            let plan = plane.evaluate(&snapshot)?;
            kernel.apply(&plan)?;
            recorder.record(&snapshot, &plan, kernel.env());
        }
    }
    Ok(())
}

async fn run_actors(
    kernel: &mut Kernel<PointQueueCorridor>,
    recorder: &mut TraceRecorder,
) -> Result<()> {
    let mut runtime = ActonApp::launch_async().await;

    let plane =
        AsyncControlPlane::spawn(&mut runtime, kernel.control_plane()?, kernel.corridor()).await;
    let (tx, mut rx) = mpsc::channel::<PeriodComplete>(4);
    let driver = PeriodDriverActor::new(tx).spawn(&mut runtime).await;
    plane.register_observer(driver).await;

    let outcome = drive_actor_periods(kernel, recorder, &plane, &mut rx).await;

    let _ = runtime.shutdown_all().await;
    outcome
}

async fn drive_actor_periods(
    kernel: &mut Kernel<PointQueueCorridor>,
    recorder: &mut TraceRecorder,
    plane: &AsyncControlPlane,
    rx: &mut mpsc::Receiver<PeriodComplete>,
) -> Result<()> {
    while !kernel.is_finished() {
        let Some(snapshot) = kernel.advance()? else {
            continue;
        };
        let period = snapshot.period;
        plane.evaluate(snapshot.clone()).await;

        let complete = tokio::time::timeout(PERIOD_TIMEOUT, rx.recv())
            .await
            .with_context(|| format!("period {period} timed out"))?
            .ok_or_else(|| anyhow!("period driver closed before period {period}"))?;

        if complete.period != period {
            bail!("expected period {period}, got {}", complete.period);
        }
        if let Some(error) = complete.error {
            bail!("period {period} failed: {error}");
        }
        let plan = complete
            .plan
            .ok_or_else(|| anyhow!("period {period} completed without a plan"))?;

        kernel.apply(&plan)?;
        recorder.record(&snapshot, &plan, kernel.env());
        debug!(period = period, active = plan.active_count(), "Actor period applied");
    }
    Ok(())
}

/// Accumulates the control trace as periods complete.
struct TraceRecorder {
    names: Vec<String>,
    record_periods: bool,
    periods: Vec<PeriodMetrics>,
    period_count: u64,
    occupancy_sum: f64,
    peak_occupancy: f64,
    active_periods: Vec<usize>,
    override_periods: Vec<usize>,
    active_rate_sum: Vec<f64>,
    queue_error_sum: Vec<f64>,
}

impl TraceRecorder {
    fn new(kernel: &Kernel<PointQueueCorridor>, record_periods: bool) -> Self {
        let names: Vec<String> = kernel.corridor().ramps().iter().map(|r| r.name.clone()).collect();
        let n = names.len();
        Self {
            names,
            record_periods,
            periods: Vec::new(),
            period_count: 0,
            occupancy_sum: 0.0,
            peak_occupancy: 0.0,
            active_periods: vec![0; n],
            override_periods: vec![0; n],
            active_rate_sum: vec![0.0; n],
            queue_error_sum: vec![0.0; n],
        }
    }

    fn record(&mut self, snapshot: &PeriodSnapshot, plan: &PeriodPlan, env: &PointQueueCorridor) {
        let mut samples = Vec::with_capacity(plan.commands.len());
        for (command, bundle) in plan.commands.iter().zip(&snapshot.bundles) {
            let index = command.ramp.index();
            let sample = RampSample {
                ramp: self.names.get(index).cloned().unwrap_or_else(|| command.ramp.to_string()),
                status: command.status,
                rate: command.rate,
                queue_override_active: command.queue_override_active,
                estimated_queue: bundle.queue_length,
                true_queue: env.queue_length(command.ramp),
                downstream_occupancy: bundle.downstream_occupancy,
            };

            if let Some(active) = self.active_periods.get_mut(index) {
                if !command.free_flow() {
                    *active += 1;
                    self.active_rate_sum[index] += command.rate;
                }
                if command.queue_override_active {
                    self.override_periods[index] += 1;
                }
                self.queue_error_sum[index] += sample.queue_error();
            }
            samples.push(sample);
        }

        let metrics = PeriodMetrics::from_samples(snapshot.period, snapshot.time_s, samples);
        self.period_count += 1;
        self.occupancy_sum += metrics.mean_occupancy;
        self.peak_occupancy = self.peak_occupancy.max(metrics.max_occupancy);
        if self.record_periods {
            self.periods.push(metrics);
        }
    }

    fn finish(
        self,
        kernel: &Kernel<PointQueueCorridor>,
        config: ExperimentConfig,
        started_at: chrono::DateTime<Utc>,
    ) -> ExperimentResult {
        let periods = self.period_count.max(1) as f64;
        let totals = kernel.env().totals();

        let ramp_summaries: Vec<RampSummary> = self
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let active = self.active_periods[i];
                let total = totals.get(i).cloned().unwrap_or_default();
                RampSummary {
                    ramp: name.clone(),
                    active_fraction: active as f64 / periods,
                    override_periods: self.override_periods[i],
                    mean_active_rate: if active > 0 {
                        self.active_rate_sum[i] / active as f64
                    } else {
                        0.0
                    },
                    mean_queue_error: self.queue_error_sum[i] / periods,
                    max_queue: total.max_queue,
                    spillback_ticks: total.spillback_ticks,
                    arrivals: total.arrivals,
                    departures: total.departures,
                    clamped_commands: kernel
                        .actuators()
                        .get(i)
                        .map_or(0, |a| a.clamped_commands()),
                }
            })
            .collect();

        let ramp_count = ramp_summaries.len().max(1) as f64;
        let mean_queue_error =
            ramp_summaries.iter().map(|r| r.mean_queue_error).sum::<f64>() / ramp_count;
        let mean_active_fraction =
            ramp_summaries.iter().map(|r| r.active_fraction).sum::<f64>() / ramp_count;
        let total_spillback_ticks = ramp_summaries.iter().map(|r| r.spillback_ticks).sum();

        ExperimentResult {
            run_id: Uuid::new_v4().to_string(),
            config,
            started_at,
            ended_at: Utc::now(),
            total_ticks: kernel.tick(),
            total_periods: self.period_count,
            mean_occupancy: self.occupancy_sum / periods,
            peak_occupancy: self.peak_occupancy,
            mean_queue_error,
            mean_active_fraction,
            total_spillback_ticks,
            ramp_summaries,
            period_metrics: self.periods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_runner(coordination: bool, queue_override: bool) -> ExperimentRunner {
        ExperimentRunner::new(ExperimentRunnerConfig {
            scenario: ScenarioConfig {
                ramps: 4,
                total_time_s: 1800.0,
                peak_start_s: 600.0,
                peak_end_s: 1200.0,
                transition_s: 300.0,
                ..Default::default()
            },
            coordination_enabled: coordination,
            queue_override_enabled: queue_override,
            ..Default::default()
        })
    }

    #[test]
    fn test_engine_parsing() {
        assert_eq!("sync".parse::<Engine>().unwrap(), Engine::Sync);
        assert_eq!("actors".parse::<Engine>().unwrap(), Engine::Actors);
        assert!("threads".parse::<Engine>().is_err());
        assert_eq!(Engine::all().len(), 2);
    }

    #[test]
    fn test_prepare_applies_ablation_switches() {
        let scenario = short_runner(false, false).prepare(Some(1)).unwrap();
        assert!(!scenario.corridor.coordinator.enabled);
        assert!(!scenario.corridor.controller_defaults.queue_override_enabled);

        let scenario = short_runner(true, true).prepare(Some(1)).unwrap();
        assert!(scenario.corridor.coordinator.enabled);
        assert!(scenario.corridor.controller_defaults.queue_override_enabled);
    }

    #[test]
    fn test_prepare_uses_loaded_corridor() {
        let base = short_runner(true, true).prepare(Some(4)).unwrap();
        let mut loaded = base.corridor.clone();
        loaded.ramps.truncate(2);
        let keep: Vec<String> = loaded.ramps.iter().map(|r| r.name.clone()).collect();
        loaded.meters.retain(|name, _| keep.contains(name));
        loaded.estimator.segments.retain(|name, _| keep.contains(name));

        let runner = ExperimentRunner::new(ExperimentRunnerConfig {
            corridor: Some(loaded),
            ..Default::default()
        });
        let scenario = runner.prepare(Some(4)).unwrap();
        assert_eq!(scenario.corridor.ramps.len(), 2);
        assert_eq!(scenario.demand.ramp_veh_h.len(), 2);
        assert_eq!(scenario.corridor.total_time_s, base.corridor.total_time_s);
    }

    #[test]
    fn test_horizon_overrides_loaded_corridor() {
        let mut loaded = short_runner(true, true).prepare(Some(4)).unwrap().corridor;
        loaded.total_time_s = 7.0 * 3600.0;

        let runner = ExperimentRunner::new(ExperimentRunnerConfig {
            corridor: Some(loaded),
            horizon_s: Some(900.0),
            ..Default::default()
        });
        let scenario = runner.prepare(Some(4)).unwrap();
        assert_eq!(scenario.corridor.total_time_s, 900.0);
        assert_eq!(scenario.corridor.ramps.len(), 4);
    }

    #[tokio::test]
    async fn test_sync_run_produces_full_trace() {
        let result = short_runner(true, true)
            .run(Engine::Sync, 0, Some(17))
            .await
            .unwrap();
        assert_eq!(result.total_ticks, 1800);
        assert_eq!(result.total_periods, 60);
        assert_eq!(result.period_metrics.len(), 60);
        assert_eq!(result.ramp_summaries.len(), 4);
        assert!(result.period_metrics.iter().all(|p| p.ramps.len() == 4));
        assert!(result.mean_queue_error >= 0.0);
    }
}
