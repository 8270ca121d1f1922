//! PointQueueCorridor: a point-queue corridor model behind the kernel's
//! `TrafficEnvironment` boundary.
//!
//! Each ramp holds a FIFO queue fed by random arrivals and drained while its
//! meter shows green. Released vehicles merge into the mainline segment just
//! downstream; a segment whose inflow exceeds capacity accumulates a backlog
//! that drives its occupancy toward jam. Queued vehicles are laid out along
//! the ramp link so connected ones can report realistic positions.

use std::collections::VecDeque;

use anyhow::{Context, Result, anyhow};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use metering_kernel::{
    Corridor, Phase, RampId, RawVehicleReport, StationObservation, StationRole,
    TrafficEnvironment,
};

use crate::generator::{CorridorGenerator, DemandProfile, Scenario, VEHICLE_SPACING_M};

/// Corridor model parameters that the scenario does not fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub mainline_lanes: u32,
    /// Share of through traffic leaving before each merge
    pub offramp_share: f64,
    /// Mainline occupancy at capacity flow
    pub critical_occupancy: f64,
    pub jam_occupancy: f64,
    /// Backlog (vehicles) at which a segment reaches jam occupancy
    pub jam_backlog_veh: f64,
    /// Smoothing time constant for merge flows (seconds)
    pub flow_smoothing_s: f64,
    /// Length of the link feeding each ramp (metres)
    pub approach_length_m: f64,
    pub truck_share: f64,
    /// Probability that a detector misses a tick
    pub detector_dropout: f64,
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            mainline_lanes: 3,
            offramp_share: 0.08,
            critical_occupancy: 0.18,
            jam_occupancy: 0.9,
            jam_backlog_veh: 120.0,
            flow_smoothing_s: 60.0,
            approach_length_m: 300.0,
            truck_share: 0.1,
            detector_dropout: 0.0,
            seed: None,
        }
    }
}

/// Cumulative counters for one ramp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RampTotals {
    pub arrivals: u64,
    pub departures: u64,
    /// Ticks the queue filled the whole storage area
    pub spillback_ticks: u64,
    pub max_queue: usize,
    pub phase_changes: u64,
}

#[derive(Debug, Clone)]
struct QueuedVehicle {
    id: String,
    vehicle_type: &'static str,
    connected: bool,
}

#[derive(Debug, Clone)]
struct RampState {
    name: String,
    link: String,
    approach_link: String,
    lanes: u32,
    capacity: usize,
    storage_length_m: f64,
    green_seconds_per_vehicle: f64,
    demand_index: usize,
    queue: VecDeque<QueuedVehicle>,
    phase: Phase,
    release_credit: f64,
    merge_flow_veh_h: f64,
    arrived: u32,
    released: u32,
    next_vehicle: u64,
    commanded_rate: Option<f64>,
    free_flow: bool,
    totals: RampTotals,
}

/// Point-queue corridor driven one tick at a time by the kernel.
pub struct PointQueueCorridor {
    config: SimulatorConfig,
    demand: DemandProfile,
    penetration_rate: f64,
    tick_seconds: f64,
    tick: u64,
    time_s: f64,
    rng: StdRng,
    ramps: Vec<RampState>,
    backlog_veh: Vec<f64>,
    mainline_flow_veh_h: Vec<f64>,
    mainline_occupancy: Vec<f64>,
    observations: Vec<[Option<StationObservation>; 3]>,
    reports: Vec<RawVehicleReport>,
}

impl PointQueueCorridor {
    /// Build the model for a generated scenario.
    ///
    /// Ramps are ordered exactly as the kernel orders them, so `RampId`
    /// indices line up.
    pub fn new(scenario: &Scenario, config: SimulatorConfig) -> Result<Self> {
        let corridor = Corridor::from_config(&scenario.corridor)
            .context("scenario corridor failed validation")?;
        let cfg = &scenario.corridor;

        let mut ramps = Vec::with_capacity(corridor.len());
        for ramp in corridor.ramps() {
            let meter = cfg
                .meters
                .get(&ramp.name)
                .ok_or_else(|| anyhow!("no meter configured for {}", ramp.name))?;
            let demand_index = cfg
                .ramps
                .iter()
                .position(|r| r.name == ramp.name)
                .ok_or_else(|| anyhow!("ramp {} missing from geometry", ramp.name))?;
            let (link, storage_length_m) = match cfg.estimator.segments.get(&ramp.name) {
                Some(segment) => (segment.link.clone(), segment.end_m),
                None => (
                    CorridorGenerator::ramp_link(&ramp.name),
                    f64::from(ramp.storage_capacity) * VEHICLE_SPACING_M / f64::from(ramp.lanes),
                ),
            };

            ramps.push(RampState {
                name: ramp.name.clone(),
                link,
                approach_link: CorridorGenerator::approach_link(&ramp.name),
                lanes: ramp.lanes,
                capacity: ramp.storage_capacity as usize,
                storage_length_m,
                green_seconds_per_vehicle: meter.green_seconds_per_vehicle,
                demand_index,
                queue: VecDeque::new(),
                phase: Phase::Green,
                release_credit: 0.0,
                merge_flow_veh_h: 0.0,
                arrived: 0,
                released: 0,
                next_vehicle: 0,
                commanded_rate: None,
                free_flow: false,
                totals: RampTotals::default(),
            });
        }

        let rng = match config.seed.or(scenario.seed) {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let n = ramps.len();

        Ok(Self {
            config,
            demand: scenario.demand.clone(),
            penetration_rate: cfg.estimator.penetration_rate,
            tick_seconds: cfg.tick_seconds,
            tick: 0,
            time_s: 0.0,
            rng,
            ramps,
            backlog_veh: vec![0.0; n],
            mainline_flow_veh_h: vec![0.0; n],
            mainline_occupancy: vec![0.0; n],
            observations: vec![[None, None, None]; n],
            reports: Vec::new(),
        })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn time_s(&self) -> f64 {
        self.time_s
    }

    /// Vehicles currently queued on a ramp (ground truth).
    pub fn queue_length(&self, ramp: RampId) -> usize {
        self.ramps.get(ramp.index()).map_or(0, |r| r.queue.len())
    }

    /// Occupancy of the mainline segment downstream of a ramp's merge.
    pub fn mainline_occupancy(&self, ramp: RampId) -> f64 {
        self.mainline_occupancy.get(ramp.index()).copied().unwrap_or(0.0)
    }

    pub fn phase(&self, ramp: RampId) -> Option<Phase> {
        self.ramps.get(ramp.index()).map(|r| r.phase)
    }

    /// Last rate pushed by the kernel, if the ramp has ever metered.
    pub fn commanded_rate(&self, ramp: RampId) -> Option<f64> {
        self.ramps.get(ramp.index()).and_then(|r| r.commanded_rate)
    }

    pub fn is_free_flow(&self, ramp: RampId) -> bool {
        self.ramps.get(ramp.index()).is_some_and(|r| r.free_flow)
    }

    pub fn totals(&self) -> Vec<RampTotals> {
        self.ramps.iter().map(|r| r.totals.clone()).collect()
    }

    fn ramp_mut(&mut self, ramp: RampId) -> Result<&mut RampState> {
        self.ramps
            .get_mut(ramp.index())
            .ok_or_else(|| anyhow!("{ramp} is not part of the simulated corridor"))
    }

    fn draw_count(&mut self, expected: f64) -> u32 {
        let expected = expected.max(0.0);
        let whole = expected.floor();
        let extra = self.rng.random_bool(expected - whole);
        whole as u32 + u32::from(extra)
    }

    fn new_vehicle(&mut self, index: usize) -> QueuedVehicle {
        let connected = self.rng.random_bool(self.penetration_rate.clamp(0.0, 1.0));
        let truck = self.rng.random_bool(self.config.truck_share.clamp(0.0, 1.0));
        let vehicle_type = match (truck, connected) {
            (false, true) => "car_cv",
            (true, true) => "heavyTruck_cv",
            (false, false) => "car",
            (true, false) => "heavyTruck",
        };
        let ramp = &mut self.ramps[index];
        ramp.next_vehicle += 1;
        QueuedVehicle {
            id: format!("{}.{}", ramp.name, ramp.next_vehicle),
            vehicle_type,
            connected,
        }
    }

    fn step_ramps(&mut self, t_s: f64) {
        let dt = self.tick_seconds;
        let alpha = (dt / self.config.flow_smoothing_s.max(dt)).min(1.0);

        for index in 0..self.ramps.len() {
            let demand = self.demand.ramp_demand(self.ramps[index].demand_index, t_s);
            let arrivals = self.draw_count(demand * dt / 3600.0);
            for _ in 0..arrivals {
                let vehicle = self.new_vehicle(index);
                self.ramps[index].queue.push_back(vehicle);
            }

            let ramp = &mut self.ramps[index];
            let mut released = 0u32;
            if ramp.phase == Phase::Green {
                let lanes = f64::from(ramp.lanes);
                ramp.release_credit =
                    (ramp.release_credit + lanes * dt / ramp.green_seconds_per_vehicle).min(lanes);
                while ramp.release_credit >= 1.0 && ramp.queue.pop_front().is_some() {
                    ramp.release_credit -= 1.0;
                    released += 1;
                }
            } else {
                ramp.release_credit = 0.0;
            }

            ramp.arrived = arrivals;
            ramp.released = released;
            ramp.merge_flow_veh_h +=
                alpha * (f64::from(released) * 3600.0 / dt - ramp.merge_flow_veh_h);

            ramp.totals.arrivals += u64::from(arrivals);
            ramp.totals.departures += u64::from(released);
            ramp.totals.max_queue = ramp.totals.max_queue.max(ramp.queue.len());
            if ramp.queue.len() >= ramp.capacity {
                ramp.totals.spillback_ticks += 1;
            }
        }
    }

    fn step_mainline(&mut self, t_s: f64) {
        let dt = self.tick_seconds;
        let capacity = self.demand.mainline_capacity_veh_h.max(1.0);
        let cfg = &self.config;

        let mut through = self.demand.mainline_demand(t_s);
        for (index, ramp) in self.ramps.iter().enumerate() {
            through = through * (1.0 - cfg.offramp_share) + ramp.merge_flow_veh_h;
            let backlog =
                (self.backlog_veh[index] + (through - capacity) * dt / 3600.0).max(0.0);
            let occupancy = cfg.critical_occupancy * (through / capacity).min(1.0)
                + (cfg.jam_occupancy - cfg.critical_occupancy)
                    * (backlog / cfg.jam_backlog_veh.max(1.0));

            self.backlog_veh[index] = backlog;
            self.mainline_flow_veh_h[index] = through;
            self.mainline_occupancy[index] = occupancy.clamp(0.0, cfg.jam_occupancy);
        }
    }

    fn refresh_observations(&mut self) {
        let dt = self.tick_seconds;
        let cfg = self.config.clone();

        for index in 0..self.ramps.len() {
            let ramp = &self.ramps[index];
            let ml_lanes = cfg.mainline_lanes.max(1) as usize;
            let ml_count = self.mainline_flow_veh_h[index] * dt / 3600.0;
            let ml_occ = self.mainline_occupancy[index];
            let mainline = StationObservation {
                lane_flow: vec![ml_count / ml_lanes as f64; ml_lanes],
                lane_occupancy: vec![ml_occ; ml_lanes],
                edge_flow: ml_count,
                edge_occupancy: ml_occ,
                queue_indicator: self.backlog_veh[index] > 0.0,
            };

            let spilled = ramp.queue.len() >= ramp.capacity;
            let entry_occ = if spilled {
                cfg.jam_occupancy
            } else if ramp.arrived > 0 {
                0.1
            } else {
                0.0
            };
            let entry = StationObservation {
                lane_flow: vec![f64::from(ramp.arrived)],
                lane_occupancy: vec![entry_occ],
                edge_flow: f64::from(ramp.arrived),
                edge_occupancy: entry_occ,
                queue_indicator: spilled,
            };

            let lanes = ramp.lanes.max(1) as usize;
            let exit_occ = if ramp.queue.is_empty() { 0.0 } else { 0.5 };
            let exit = StationObservation {
                lane_flow: vec![f64::from(ramp.released) / lanes as f64; lanes],
                lane_occupancy: vec![exit_occ; lanes],
                edge_flow: f64::from(ramp.released),
                edge_occupancy: exit_occ,
                queue_indicator: !ramp.queue.is_empty(),
            };

            let mut slot = [Some(mainline), Some(entry), Some(exit)];
            if cfg.detector_dropout > 0.0 {
                for observation in &mut slot {
                    if self.rng.random_bool(cfg.detector_dropout.min(1.0)) {
                        *observation = None;
                    }
                }
            }
            self.observations[index] = slot;
        }
    }

    /// Report every queued connected vehicle, stamped with the start of the
    /// tick just simulated.
    fn collect_reports(&mut self, timestamp: f64) {
        let spacing = VEHICLE_SPACING_M;
        let approach_length = self.config.approach_length_m;

        for ramp in &self.ramps {
            let lanes = ramp.lanes.max(1) as usize;
            for (k, vehicle) in ramp.queue.iter().enumerate() {
                if !vehicle.connected {
                    continue;
                }
                let lane = k % lanes;
                let row = (k / lanes) as f64;
                let along = ramp.storage_length_m - (row + 0.5) * spacing;
                let (link, position) = if along >= 0.0 {
                    (&ramp.link, along)
                } else {
                    (&ramp.approach_link, (approach_length + along).max(0.0))
                };
                self.reports.push(RawVehicleReport {
                    id: vehicle.id.clone(),
                    vehicle_type: vehicle.vehicle_type.to_string(),
                    lane: format!("{link}_{lane}"),
                    position,
                    timestamp,
                });
            }
        }
    }
}

fn role_slot(role: StationRole) -> usize {
    match role {
        StationRole::Mainline => 0,
        StationRole::Entry => 1,
        StationRole::Exit => 2,
    }
}

impl TrafficEnvironment for PointQueueCorridor {
    fn advance(&mut self) -> Result<()> {
        let t_s = self.time_s;
        self.step_ramps(t_s);
        self.step_mainline(t_s);

        self.tick += 1;
        self.time_s = self.tick as f64 * self.tick_seconds;

        self.refresh_observations();
        self.collect_reports(t_s);

        trace!(
            tick = self.tick,
            queued = self.ramps.iter().map(|r| r.queue.len()).sum::<usize>(),
            "Corridor advanced"
        );
        Ok(())
    }

    fn observe(&self, ramp: RampId, role: StationRole) -> Option<StationObservation> {
        self.observations
            .get(ramp.index())
            .and_then(|slot| slot[role_slot(role)].clone())
    }

    fn vehicle_reports(&mut self) -> Vec<RawVehicleReport> {
        std::mem::take(&mut self.reports)
    }

    fn set_phase(&mut self, ramp: RampId, phase: Phase) -> Result<()> {
        let state = self.ramp_mut(ramp)?;
        if state.phase != phase {
            state.totals.phase_changes += 1;
        }
        state.phase = phase;
        Ok(())
    }

    fn set_rate(&mut self, ramp: RampId, rate: f64) -> Result<()> {
        self.ramp_mut(ramp)?.commanded_rate = Some(rate);
        Ok(())
    }

    fn set_phase_override(&mut self, ramp: RampId, active: bool) -> Result<()> {
        self.ramp_mut(ramp)?.free_flow = active;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::ScenarioConfig;

    fn scenario(ramps: usize, seed: u64) -> Scenario {
        CorridorGenerator::new(ScenarioConfig {
            ramps,
            seed: Some(seed),
            total_time_s: 600.0,
            ..Default::default()
        })
        .generate()
        .unwrap()
    }

    #[test]
    fn test_red_meter_holds_queue() {
        let scenario = scenario(2, 3);
        let mut sim = PointQueueCorridor::new(&scenario, SimulatorConfig::default()).unwrap();
        for ramp in [RampId(0), RampId(1)] {
            sim.set_phase(ramp, Phase::Red).unwrap();
        }
        for _ in 0..300 {
            sim.advance().unwrap();
        }
        let totals = sim.totals();
        assert!(totals.iter().all(|t| t.departures == 0));
        assert_eq!(sim.queue_length(RampId(0)) as u64, totals[0].arrivals);
        assert!(totals[0].arrivals > 0);
    }

    #[test]
    fn test_green_meter_serves_queue() {
        let scenario = scenario(1, 11);
        let mut sim = PointQueueCorridor::new(&scenario, SimulatorConfig::default()).unwrap();
        sim.set_phase(RampId(0), Phase::Red).unwrap();
        for _ in 0..120 {
            sim.advance().unwrap();
        }
        let held = sim.queue_length(RampId(0));
        assert!(held > 0);

        sim.set_phase(RampId(0), Phase::Green).unwrap();
        for _ in 0..120 {
            sim.advance().unwrap();
        }
        assert!(sim.queue_length(RampId(0)) < held);
        assert!(sim.totals()[0].departures > 0);
        assert_eq!(sim.totals()[0].phase_changes, 2);
    }

    #[test]
    fn test_entry_and_exit_counts_conserve_queue() {
        let scenario = scenario(1, 5);
        let mut sim = PointQueueCorridor::new(&scenario, SimulatorConfig::default()).unwrap();
        let mut entries = 0.0;
        let mut exits = 0.0;
        for tick in 0..400 {
            let phase = if (tick / 10) % 2 == 0 { Phase::Green } else { Phase::Red };
            sim.set_phase(RampId(0), phase).unwrap();
            sim.advance().unwrap();
            entries += sim.observe(RampId(0), StationRole::Entry).unwrap().edge_flow;
            exits += sim.observe(RampId(0), StationRole::Exit).unwrap().edge_flow;
        }
        assert_eq!((entries - exits) as usize, sim.queue_length(RampId(0)));
    }

    #[test]
    fn test_reports_come_only_from_connected_vehicles_on_known_links() {
        let mut scenario = scenario(1, 9);
        scenario.corridor.estimator.penetration_rate = 0.5;
        let mut sim = PointQueueCorridor::new(&scenario, SimulatorConfig::default()).unwrap();
        sim.set_phase(RampId(0), Phase::Red).unwrap();

        let mut seen = 0;
        for _ in 0..300 {
            sim.advance().unwrap();
            for report in sim.vehicle_reports() {
                seen += 1;
                assert!(report.vehicle_type.ends_with("_cv"));
                assert!(
                    report.lane.starts_with("Onramp5_ramp_")
                        || report.lane.starts_with("Onramp5_approach_")
                );
                assert!(report.position >= 0.0);
                assert_eq!(report.timestamp, sim.time_s() - scenario.corridor.tick_seconds);
            }
        }
        assert!(seen > 0);
        assert!(sim.vehicle_reports().is_empty());
    }

    #[test]
    fn test_detector_dropout_hides_observations() {
        let scenario = scenario(3, 21);
        let config = SimulatorConfig {
            detector_dropout: 1.0,
            ..Default::default()
        };
        let mut sim = PointQueueCorridor::new(&scenario, config).unwrap();
        sim.advance().unwrap();
        for role in StationRole::ALL {
            assert!(sim.observe(RampId(1), role).is_none());
        }
    }

    #[test]
    fn test_unknown_ramp_is_an_error() {
        let scenario = scenario(2, 1);
        let mut sim = PointQueueCorridor::new(&scenario, SimulatorConfig::default()).unwrap();
        assert!(sim.set_phase(RampId(7), Phase::Red).is_err());
        assert!(sim.observe(RampId(7), StationRole::Mainline).is_none());
    }

    #[test]
    fn test_overloaded_mainline_congests() {
        let mut scenario = scenario(3, 2);
        scenario.demand.mainline_veh_h = scenario.demand.mainline_capacity_veh_h * 1.5;
        let mut sim = PointQueueCorridor::new(&scenario, SimulatorConfig::default()).unwrap();
        for _ in 0..600 {
            sim.advance().unwrap();
        }
        let occ = sim.mainline_occupancy(RampId(0));
        assert!(occ > 0.5, "occupancy {occ}");
        assert!(sim.observe(RampId(0), StationRole::Mainline).unwrap().queue_indicator);
    }
}
