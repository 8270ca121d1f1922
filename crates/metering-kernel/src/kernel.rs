//! The metering kernel: a discrete-clock loop around the traffic environment.
//!
//! ## Usage
//!
//! ```ignore
//! use metering_kernel::{ControlPlane, CorridorConfig, Kernel};
//!
//! let config = CorridorConfig::from_path("corridor.json")?;
//! let mut kernel = Kernel::new(config, simulator)?;
//! let mut plane = kernel.control_plane()?;
//!
//! while !kernel.is_finished() {
//!     if let Some(snapshot) = kernel.advance()? {
//!         let plan = plane.evaluate(&snapshot)?;
//!         kernel.apply(&plan)?;
//!     }
//! }
//! ```
//!
//! Each tick runs, in order: actuator phase timing, one environment step,
//! detector aggregation and report ingestion. On a control boundary the
//! kernel publishes queue estimates and returns the period's
//! [`PeriodSnapshot`]; whoever evaluates it (the synchronous
//! [`ControlPlane`] or the actor layer) hands the resulting plan back to
//! [`Kernel::apply`] before the next tick.

use std::collections::HashMap;

use acton_reactive::prelude::*;
use tracing::{debug, info};

use crate::actors::{CorridorCoordinator, RampActor};
use crate::actuator::{FeasibleRange, MeterActuator};
use crate::config::CorridorConfig;
use crate::controller::LocalController;
use crate::coordinator::Coordinator;
use crate::corridor::{Corridor, RampId};
use crate::environment::{StationRole, TrafficEnvironment};
use crate::error::{KernelError, Result};
use crate::estimator::QueueEstimator;
use crate::measurement::{PeriodPlan, PeriodSnapshot, RampDecision};
use crate::messages::{EvaluatePeriod, RegisterPeriodObserver, RegisterRampActors};
use crate::scheduler::{PeriodicTask, Scheduler, TaskKind};
use crate::sensors::StationAggregator;

/// Owns the environment and every per-tick component.
pub struct Kernel<E: TrafficEnvironment> {
    env: E,
    config: CorridorConfig,
    corridor: Corridor,
    actuators: Vec<MeterActuator>,
    stations: StationAggregator,
    estimator: QueueEstimator,
    scheduler: Scheduler,
    tick: u64,
    period: u64,
    horizon_ticks: u64,
}

impl<E: TrafficEnvironment> Kernel<E> {
    /// Validate the configuration and build one actuator per ramp.
    pub fn new(config: CorridorConfig, env: E) -> Result<Self> {
        let corridor = Corridor::from_config(&config)?;

        let actuators = corridor
            .ramps()
            .iter()
            .map(|ramp| {
                config
                    .meters
                    .get(&ramp.name)
                    .map(|meter| MeterActuator::new(ramp, meter))
                    .ok_or_else(|| KernelError::MissingMeter(ramp.name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let estimator = QueueEstimator::new(&corridor, &config.estimator)?;
        let scheduler = Scheduler::new([
            PeriodicTask::new(
                TaskKind::QueueEstimation,
                config.ticks(config.estimator.update_interval_s),
            ),
            PeriodicTask::new(TaskKind::ControlUpdate, config.ticks(config.control_period_s)),
        ]);

        info!(
            ramps = corridor.len(),
            control_period_s = config.control_period_s,
            horizon_s = config.total_time_s,
            "Metering kernel ready"
        );

        Ok(Self {
            stations: StationAggregator::new(corridor.len(), config.tick_seconds),
            horizon_ticks: (config.total_time_s / config.tick_seconds).round() as u64,
            env,
            corridor,
            actuators,
            estimator,
            scheduler,
            tick: 0,
            period: 0,
            config,
        })
    }

    /// Controllers and coordinator wired to this kernel's ramps.
    pub fn control_plane(&self) -> Result<ControlPlane> {
        ControlPlane::new(&self.corridor, &self.config, &self.feasible_ranges())
    }

    pub fn config(&self) -> &CorridorConfig {
        &self.config
    }

    pub fn corridor(&self) -> &Corridor {
        &self.corridor
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn into_env(self) -> E {
        self.env
    }

    pub fn actuators(&self) -> &[MeterActuator] {
        &self.actuators
    }

    pub fn estimator(&self) -> &QueueEstimator {
        &self.estimator
    }

    /// Ticks completed so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn time_s(&self) -> f64 {
        self.tick as f64 * self.config.tick_seconds
    }

    pub fn is_finished(&self) -> bool {
        self.tick >= self.horizon_ticks
    }

    pub fn feasible_ranges(&self) -> Vec<FeasibleRange> {
        self.actuators.iter().map(MeterActuator::feasible_range).collect()
    }

    /// Run one tick. Returns the period snapshot on a control boundary.
    pub fn advance(&mut self) -> Result<Option<PeriodSnapshot>> {
        let tick_seconds = self.config.tick_seconds;

        for actuator in &mut self.actuators {
            if let Some(phase) = actuator.run(tick_seconds) {
                self.env.set_phase(actuator.ramp(), phase)?;
            }
        }

        self.env.advance()?;
        self.tick += 1;

        for ramp in self.corridor.ids() {
            for role in StationRole::ALL {
                let observation = self.env.observe(ramp, role);
                self.stations.record(ramp, role, observation.as_ref())?;
            }
            let entry = self.env.observe(ramp, StationRole::Entry);
            let exit = self.env.observe(ramp, StationRole::Exit);
            self.estimator
                .ingest_loops(ramp, entry.as_ref(), exit.as_ref())?;
        }

        let reports = self.env.vehicle_reports();
        if !reports.is_empty() {
            self.estimator.ingest_reports(&reports);
        }

        let now_s = self.time_s();
        let mut snapshot = None;
        for task in self.scheduler.due(self.tick) {
            match task {
                TaskKind::QueueEstimation => {
                    self.estimator.publish(now_s);
                }
                TaskKind::ControlUpdate => {
                    snapshot = Some(self.close_period()?);
                }
            }
        }
        Ok(snapshot)
    }

    fn close_period(&mut self) -> Result<PeriodSnapshot> {
        self.period += 1;
        let bundles = self
            .corridor
            .ids()
            .map(|ramp| self.stations.bundle(ramp, self.estimator.queue_length(ramp)))
            .collect::<Result<Vec<_>>>()?;
        self.stations.reset();

        debug!(period = self.period, tick = self.tick, "Control period closed");

        Ok(PeriodSnapshot {
            period: self.period,
            tick: self.tick,
            time_s: self.time_s(),
            bundles,
        })
    }

    /// Hand a period's plan to the actuators and notify the environment.
    ///
    /// New rates take effect at each meter's next red phase.
    pub fn apply(&mut self, plan: &PeriodPlan) -> Result<()> {
        for command in &plan.commands {
            let len = self.actuators.len();
            let actuator = self
                .actuators
                .get_mut(command.ramp.index())
                .ok_or(KernelError::RampOutOfBounds {
                    index: command.ramp.index(),
                    len,
                })?;

            let free_flow = command.free_flow();
            actuator.set_phase_override(free_flow);
            self.env.set_phase_override(command.ramp, free_flow)?;
            if !free_flow {
                actuator.set_rate(command.rate);
                self.env.set_rate(command.ramp, command.rate)?;
            }
        }
        Ok(())
    }

    /// Drive the loop to the horizon with a synchronous control plane.
    ///
    /// `on_period` sees every snapshot with the plan applied for it.
    pub fn run_to_horizon(
        &mut self,
        plane: &mut ControlPlane,
        mut on_period: impl FnMut(&PeriodSnapshot, &PeriodPlan),
    ) -> Result<u64> {
        while !self.is_finished() {
            if let Some(snapshot) = self.advance()? {
                let plan = plane.evaluate(&snapshot)?;
                self.apply(&plan)?;
                on_period(&snapshot, &plan);
            }
        }
        Ok(self.period)
    }
}

/// Synchronous evaluation of a control period: every local controller, then
/// the coordinator over the complete set.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    controllers: Vec<LocalController>,
    coordinator: Coordinator,
}

impl ControlPlane {
    pub fn new(
        corridor: &Corridor,
        config: &CorridorConfig,
        feasible: &[FeasibleRange],
    ) -> Result<Self> {
        let controllers = corridor
            .ramps()
            .iter()
            .map(|ramp| -> Result<LocalController> {
                let range = feasible
                    .get(ramp.id.index())
                    .copied()
                    .ok_or(KernelError::RampOutOfBounds {
                        index: ramp.id.index(),
                        len: feasible.len(),
                    })?;
                Ok(LocalController::new(
                    ramp,
                    config.controller_for(&ramp.name).clone(),
                    config.control_period_s,
                    range,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            controllers,
            coordinator: Coordinator::new(corridor, config.coordinator.clone())?,
        })
    }

    pub fn controllers(&self) -> &[LocalController] {
        &self.controllers
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Split into parts; the actor layer moves controllers into ramp actors.
    pub fn into_parts(self) -> (Vec<LocalController>, Coordinator) {
        (self.controllers, self.coordinator)
    }

    pub fn evaluate(&mut self, snapshot: &PeriodSnapshot) -> Result<PeriodPlan> {
        let mut decisions: Vec<RampDecision> = Vec::with_capacity(self.controllers.len());
        for bundle in &snapshot.bundles {
            let len = self.controllers.len();
            let controller = self
                .controllers
                .get_mut(bundle.ramp.index())
                .ok_or(KernelError::RampOutOfBounds {
                    index: bundle.ramp.index(),
                    len,
                })?;
            decisions.push(controller.compute_rate(bundle, snapshot.tick));
        }
        self.coordinator
            .arbitrate(snapshot.period, snapshot.time_s, &decisions)
    }
}

/// Actor-backed control plane: one RampActor per ramp plus a
/// CorridorCoordinator.
///
/// ```ignore
/// let plane = AsyncControlPlane::spawn(&mut runtime, kernel.control_plane()?, kernel.corridor()).await;
/// plane.register_observer(observer_handle).await;
/// plane.evaluate(snapshot).await; // PeriodComplete arrives at the observer
/// ```
pub struct AsyncControlPlane {
    coordinator: ActorHandle,
    ramp_actors: HashMap<RampId, ActorHandle>,
}

impl AsyncControlPlane {
    /// Spawn the coordinator first, then the ramp actors that reply to it.
    pub async fn spawn(
        runtime: &mut ActorRuntime,
        plane: ControlPlane,
        corridor: &Corridor,
    ) -> Self {
        let (controllers, coordinator) = plane.into_parts();
        let coordinator_handle = CorridorCoordinator::new(coordinator).spawn(runtime).await;

        let mut ramp_actors = HashMap::new();
        for controller in controllers {
            let ramp = controller.ramp();
            let name = corridor
                .ramp(ramp)
                .map(|r| r.name.clone())
                .unwrap_or_else(|_| ramp.to_string());
            let handle = RampActor::new(controller, coordinator_handle.clone())
                .spawn(runtime, &name)
                .await;
            ramp_actors.insert(ramp, handle);
        }

        coordinator_handle
            .send(RegisterRampActors {
                actors: ramp_actors.clone(),
            })
            .await;

        Self {
            coordinator: coordinator_handle,
            ramp_actors,
        }
    }

    pub fn coordinator(&self) -> &ActorHandle {
        &self.coordinator
    }

    pub fn ramp_actor(&self, ramp: RampId) -> Option<&ActorHandle> {
        self.ramp_actors.get(&ramp)
    }

    /// Route `PeriodComplete` to `handle`.
    pub async fn register_observer(&self, handle: ActorHandle) {
        self.coordinator
            .send(RegisterPeriodObserver { handle })
            .await;
    }

    /// Start evaluating a period; the plan arrives at the observer.
    pub async fn evaluate(&self, snapshot: PeriodSnapshot) {
        self.coordinator.send(EvaluatePeriod { snapshot }).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::{MeterConfig, RampConfig};
    use crate::environment::{Phase, RawVehicleReport, StationObservation};
    use crate::measurement::ActivationStatus;

    /// Scripted environment: constant detector readings per ramp, with
    /// optional `(tick, entries, exits)` loop counts that replace the
    /// constant flows on the listed ticks.
    #[derive(Default)]
    struct ScriptedEnv {
        ticks: u64,
        mainline_occupancy: Vec<f64>,
        entry_flow: Vec<f64>,
        exit_flow: Vec<f64>,
        flow_script: Vec<(u64, f64, f64)>,
        phases: Vec<(u64, RampId, Phase)>,
        rates: Vec<(RampId, f64)>,
        overrides: Vec<(RampId, bool)>,
    }

    impl TrafficEnvironment for ScriptedEnv {
        fn advance(&mut self) -> anyhow::Result<()> {
            self.ticks += 1;
            Ok(())
        }

        fn observe(&self, ramp: RampId, role: StationRole) -> Option<StationObservation> {
            let i = ramp.index();
            let scripted = self.flow_script.iter().find(|(tick, _, _)| *tick == self.ticks);
            let (flow, occupancy) = match (role, scripted) {
                (StationRole::Mainline, _) => (0.0, *self.mainline_occupancy.get(i)?),
                (StationRole::Entry, Some(&(_, entries, _))) => (entries, 0.1),
                (StationRole::Entry, None) => (*self.entry_flow.get(i)?, 0.1),
                (StationRole::Exit, Some(&(_, _, exits))) => (exits, 0.0),
                (StationRole::Exit, None) => (*self.exit_flow.get(i)?, 0.0),
            };
            Some(StationObservation {
                edge_flow: flow,
                edge_occupancy: occupancy,
                ..Default::default()
            })
        }

        fn vehicle_reports(&mut self) -> Vec<RawVehicleReport> {
            Vec::new()
        }

        fn set_phase(&mut self, ramp: RampId, phase: Phase) -> anyhow::Result<()> {
            self.phases.push((self.ticks, ramp, phase));
            Ok(())
        }

        fn set_rate(&mut self, ramp: RampId, rate: f64) -> anyhow::Result<()> {
            self.rates.push((ramp, rate));
            Ok(())
        }

        fn set_phase_override(&mut self, ramp: RampId, active: bool) -> anyhow::Result<()> {
            self.overrides.push((ramp, active));
            Ok(())
        }
    }

    fn config(ramps: usize, total_time_s: f64) -> CorridorConfig {
        let ramps: Vec<_> = (0..ramps)
            .map(|i| RampConfig {
                name: format!("Onramp{}", i + 5),
                lanes: 1,
                storage_capacity: 20,
                position_m: 1000.0 * i as f64,
            })
            .collect();
        let meters: BTreeMap<_, _> = ramps
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    MeterConfig {
                        min_red_s: 4.0,
                        max_red_s: 20.0,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let mut config = CorridorConfig {
            ramps,
            meters,
            total_time_s,
            ..Default::default()
        };
        config.coordinator.propagation_radius = 0;
        config
    }

    #[test]
    fn test_snapshot_every_control_period() {
        let env = ScriptedEnv {
            mainline_occupancy: vec![0.1],
            entry_flow: vec![0.0],
            exit_flow: vec![0.0],
            ..Default::default()
        };
        let mut kernel = Kernel::new(config(1, 95.0), env).unwrap();
        let mut snapshots = Vec::new();
        while !kernel.is_finished() {
            if let Some(s) = kernel.advance().unwrap() {
                snapshots.push((s.period, s.tick, s.time_s));
            }
        }
        assert_eq!(
            snapshots,
            vec![(1, 30, 30.0), (2, 60, 60.0), (3, 90, 90.0)]
        );
        assert_eq!(kernel.tick(), 95);
        assert_eq!(kernel.env().ticks, 95);
    }

    #[test]
    fn test_congestion_reduces_rate_and_meters() {
        let env = ScriptedEnv {
            mainline_occupancy: vec![0.45],
            entry_flow: vec![0.0],
            exit_flow: vec![0.0],
            ..Default::default()
        };
        let mut kernel = Kernel::new(config(1, 300.0), env).unwrap();
        let mut plane = kernel.control_plane().unwrap();
        let max_rate = kernel.feasible_ranges()[0].max_rate;

        let mut plans = Vec::new();
        let periods = kernel
            .run_to_horizon(&mut plane, |_, plan| plans.push(plan.clone()))
            .unwrap();
        assert_eq!(periods, 10);

        let first = plans[0].commands[0];
        assert_eq!(first.status, ActivationStatus::Active);
        assert!(first.rate < max_rate);
        let last = plans[9].commands[0];
        assert_eq!(last.rate, kernel.feasible_ranges()[0].min_rate);

        let env = kernel.env();
        assert_eq!(env.rates.len(), 10);
        assert!(env.phases.iter().any(|(_, _, p)| *p == Phase::Red));
        for actuator in kernel.actuators() {
            let (min_red, max_red) = actuator.red_bounds();
            assert!((min_red..=max_red).contains(&actuator.pending_red_s()));
        }
    }

    #[test]
    fn test_free_flow_when_uncongested() {
        let env = ScriptedEnv {
            mainline_occupancy: vec![0.05, 0.05],
            entry_flow: vec![0.0, 0.0],
            exit_flow: vec![0.0, 0.0],
            ..Default::default()
        };
        let mut kernel = Kernel::new(config(2, 120.0), env).unwrap();
        let mut plane = kernel.control_plane().unwrap();
        kernel.run_to_horizon(&mut plane, |_, _| {}).unwrap();

        assert!(kernel.actuators().iter().all(MeterActuator::is_free_flow));
        let env = kernel.env();
        assert!(env.rates.is_empty());
        assert!(env.overrides.iter().all(|(_, active)| *active));
        // Phases only change before the first period closes
        assert!(env.phases.iter().all(|(tick, _, _)| *tick <= 30));
    }

    #[test]
    fn test_queue_estimate_reaches_same_period() {
        // One vehicle joins per tick and none leave: 30 queued, clamped to 20
        let env = ScriptedEnv {
            mainline_occupancy: vec![0.45],
            entry_flow: vec![1.0],
            exit_flow: vec![0.0],
            ..Default::default()
        };
        let mut kernel = Kernel::new(config(1, 30.0), env).unwrap();
        let mut plane = kernel.control_plane().unwrap();
        let mut seen = None;
        kernel
            .run_to_horizon(&mut plane, |snapshot, plan| {
                seen = Some((snapshot.bundles[0], plan.commands[0]));
            })
            .unwrap();

        let (bundle, command) = seen.unwrap();
        assert_eq!(bundle.queue_length, 20.0);
        assert!((bundle.demand - 3600.0).abs() < 1e-9);
        assert!(command.queue_override_active);
    }

    #[test]
    fn test_loop_conservation_chain_triggers_override() {
        // Capacity 20, override above 16: 5, then 5 + 10 - 2 = 13, then
        // 13 + 10 - 1 = 22 clamped to 20
        let env = ScriptedEnv {
            mainline_occupancy: vec![0.45],
            entry_flow: vec![0.0],
            exit_flow: vec![0.0],
            flow_script: vec![(1, 5.0, 0.0), (31, 10.0, 2.0), (61, 10.0, 1.0)],
            ..Default::default()
        };
        let mut kernel = Kernel::new(config(1, 90.0), env).unwrap();
        let mut plane = kernel.control_plane().unwrap();
        let mut trace = Vec::new();
        kernel
            .run_to_horizon(&mut plane, |snapshot, plan| {
                let command = plan.commands[0];
                trace.push((
                    snapshot.bundles[0].queue_length,
                    command.status,
                    command.queue_override_active,
                ));
            })
            .unwrap();

        assert_eq!(
            trace,
            vec![
                (5.0, ActivationStatus::Active, false),
                (13.0, ActivationStatus::Active, false),
                (20.0, ActivationStatus::Active, true),
            ]
        );
        let estimate = kernel.estimator().last_estimates()[0];
        assert_eq!(estimate.source, crate::measurement::EstimateSource::Loops);
        assert_eq!(estimate.window_start_s, 60.0);
        assert_eq!(estimate.window_end_s, 90.0);
    }

    #[test]
    fn test_apply_rejects_unknown_ramp() {
        let env = ScriptedEnv::default();
        let mut kernel = Kernel::new(config(1, 30.0), env).unwrap();
        let plan = PeriodPlan {
            period: 1,
            time_s: 30.0,
            commands: vec![crate::measurement::RampCommand {
                ramp: RampId(3),
                status: ActivationStatus::Active,
                rate: 500.0,
                queue_override_active: false,
            }],
        };
        assert!(matches!(
            kernel.apply(&plan),
            Err(KernelError::RampOutOfBounds { index: 3, len: 1 })
        ));
    }

    #[test]
    fn test_missing_meter_fails_construction() {
        let mut cfg = config(2, 30.0);
        cfg.meters.remove("Onramp6");
        assert!(matches!(
            Kernel::new(cfg, ScriptedEnv::default()),
            Err(KernelError::MissingMeter(_))
        ));
    }
}
