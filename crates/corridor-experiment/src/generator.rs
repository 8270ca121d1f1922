//! Corridor scenario generator with controlled congestion.
//!
//! Produces a full `CorridorConfig` (geometry, meters, queue segments) and a
//! time-varying demand profile. Congestion severity is controlled by the
//! peak factor and the ratio of mainline demand to capacity.

use std::collections::BTreeMap;

use anyhow::Result;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use metering_kernel::config::{MeterConfig, QueueSegmentConfig, RampConfig};
use metering_kernel::CorridorConfig;

/// Length a queued vehicle occupies on the ramp (metres).
pub const VEHICLE_SPACING_M: f64 = 7.5;

/// Configuration for scenario generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Number of metered on-ramps
    pub ramps: usize,
    /// Number used in the first ramp's name ("Onramp5", ...)
    pub first_ramp_number: usize,
    /// Distance between consecutive ramps (metres)
    pub spacing_m: f64,
    /// Storage capacity range, inclusive (vehicles)
    pub min_storage: u32,
    pub max_storage: u32,
    /// Probability that a ramp has two metered lanes
    pub two_lane_probability: f64,
    /// Off-peak mainline demand entering upstream of the first ramp (veh/h)
    pub mainline_demand_veh_h: f64,
    /// Mainline capacity of each segment (veh/h)
    pub mainline_capacity_veh_h: f64,
    /// Off-peak ramp demand range (veh/h)
    pub min_ramp_demand_veh_h: f64,
    pub max_ramp_demand_veh_h: f64,
    /// Demand multiplier at the height of the peak
    pub peak_factor: f64,
    pub peak_start_s: f64,
    pub peak_end_s: f64,
    /// Duration of the ramp up into and down out of the peak
    pub transition_s: f64,
    /// Share of vehicles that report their position
    pub penetration_rate: f64,
    /// Simulation horizon (seconds)
    pub total_time_s: f64,
    /// Random seed for reproducibility (None for random)
    pub seed: Option<u64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            ramps: 13,
            first_ramp_number: 5,
            spacing_m: 900.0,
            min_storage: 15,
            max_storage: 40,
            two_lane_probability: 0.25,
            mainline_demand_veh_h: 3600.0,
            mainline_capacity_veh_h: 6600.0,
            min_ramp_demand_veh_h: 150.0,
            max_ramp_demand_veh_h: 450.0,
            peak_factor: 1.6,
            peak_start_s: 3600.0,
            peak_end_s: 3.0 * 3600.0,
            transition_s: 1800.0,
            penetration_rate: 0.1,
            total_time_s: 7.0 * 3600.0,
            seed: None,
        }
    }
}

/// Time-varying demand for the corridor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemandProfile {
    pub mainline_veh_h: f64,
    pub mainline_capacity_veh_h: f64,
    /// Off-peak demand per ramp, upstream first
    pub ramp_veh_h: Vec<f64>,
    pub peak_factor: f64,
    pub peak_start_s: f64,
    pub peak_end_s: f64,
    pub transition_s: f64,
}

impl DemandProfile {
    /// Demand multiplier at time `t_s`: 1 off-peak, `peak_factor` at peak,
    /// linear in between.
    pub fn factor(&self, t_s: f64) -> f64 {
        let rise_start = self.peak_start_s - self.transition_s;
        let fall_end = self.peak_end_s + self.transition_s;
        let shape = if t_s <= rise_start || t_s >= fall_end {
            0.0
        } else if t_s < self.peak_start_s {
            (t_s - rise_start) / self.transition_s
        } else if t_s <= self.peak_end_s {
            1.0
        } else {
            (fall_end - t_s) / self.transition_s
        };
        1.0 + (self.peak_factor - 1.0) * shape
    }

    pub fn mainline_demand(&self, t_s: f64) -> f64 {
        self.mainline_veh_h * self.factor(t_s)
    }

    pub fn ramp_demand(&self, index: usize, t_s: f64) -> f64 {
        self.ramp_veh_h.get(index).copied().unwrap_or(0.0) * self.factor(t_s)
    }
}

/// A generated corridor and its demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub corridor: CorridorConfig,
    pub demand: DemandProfile,
    pub seed: Option<u64>,
}

/// Scenario generator for metered corridors.
pub struct CorridorGenerator {
    config: ScenarioConfig,
}

impl CorridorGenerator {
    pub fn new(config: ScenarioConfig) -> Self {
        Self { config }
    }

    /// Link id holding a ramp's queue storage.
    pub fn ramp_link(name: &str) -> String {
        format!("{name}_ramp")
    }

    /// Link id upstream of the storage area, where spillback queues.
    pub fn approach_link(name: &str) -> String {
        format!("{name}_approach")
    }

    /// Generate a scenario. The configuration is validated before returning.
    pub fn generate(&self) -> Result<Scenario> {
        let mut rng: Box<dyn RngCore> = match self.config.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(rand::rng()),
        };
        let cfg = &self.config;

        let mut ramps = Vec::with_capacity(cfg.ramps);
        let mut meters = BTreeMap::new();
        let mut segments = BTreeMap::new();
        let mut ramp_veh_h = Vec::with_capacity(cfg.ramps);

        for i in 0..cfg.ramps {
            let name = format!("Onramp{}", cfg.first_ramp_number + i);
            let lanes = if rng.random_bool(cfg.two_lane_probability.clamp(0.0, 1.0)) {
                2
            } else {
                1
            };
            let storage_capacity = rng.random_range(cfg.min_storage..=cfg.max_storage.max(cfg.min_storage));
            let storage_length_m =
                (f64::from(storage_capacity) / f64::from(lanes)).ceil() * VEHICLE_SPACING_M;

            ramps.push(RampConfig {
                name: name.clone(),
                lanes,
                storage_capacity,
                position_m: cfg.spacing_m * (i + 1) as f64,
            });
            meters.insert(
                name.clone(),
                MeterConfig {
                    vehicles_per_green_per_lane: 1,
                    green_seconds_per_vehicle: 2.0,
                    min_red_s: 2.0,
                    max_red_s: 60.0,
                    initial_red_s: None,
                },
            );
            segments.insert(
                name.clone(),
                QueueSegmentConfig {
                    link: Self::ramp_link(&name),
                    lanes: Vec::new(),
                    start_m: 0.0,
                    end_m: storage_length_m,
                },
            );
            ramp_veh_h.push(
                rng.random_range(cfg.min_ramp_demand_veh_h..=cfg.max_ramp_demand_veh_h.max(cfg.min_ramp_demand_veh_h)),
            );
        }

        let mut corridor = CorridorConfig {
            total_time_s: cfg.total_time_s,
            ramps,
            meters,
            ..Default::default()
        };
        corridor.estimator.penetration_rate = cfg.penetration_rate;
        corridor.estimator.segments = segments;
        corridor.validate()?;

        Ok(Scenario {
            id: Uuid::new_v4().to_string(),
            corridor,
            demand: DemandProfile {
                mainline_veh_h: cfg.mainline_demand_veh_h,
                mainline_capacity_veh_h: cfg.mainline_capacity_veh_h,
                ramp_veh_h,
                peak_factor: cfg.peak_factor,
                peak_start_s: cfg.peak_start_s,
                peak_end_s: cfg.peak_end_s,
                transition_s: cfg.transition_s,
            },
            seed: cfg.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let config = ScenarioConfig {
            seed: Some(42),
            ..Default::default()
        };
        let a = CorridorGenerator::new(config.clone()).generate().unwrap();
        let b = CorridorGenerator::new(config).generate().unwrap();
        assert_eq!(a.demand.ramp_veh_h, b.demand.ramp_veh_h);
        let caps_a: Vec<_> = a.corridor.ramps.iter().map(|r| r.storage_capacity).collect();
        let caps_b: Vec<_> = b.corridor.ramps.iter().map(|r| r.storage_capacity).collect();
        assert_eq!(caps_a, caps_b);
    }

    #[test]
    fn test_generated_corridor_is_complete() {
        let scenario = CorridorGenerator::new(ScenarioConfig {
            seed: Some(7),
            ..Default::default()
        })
        .generate()
        .unwrap();
        let corridor = &scenario.corridor;
        assert_eq!(corridor.ramps.len(), 13);
        assert_eq!(corridor.ramps[0].name, "Onramp5");
        assert_eq!(corridor.ramps[12].name, "Onramp17");
        assert_eq!(corridor.meters.len(), 13);
        assert_eq!(corridor.estimator.segments.len(), 13);
        for ramp in &corridor.ramps {
            assert!((15..=40).contains(&ramp.storage_capacity));
        }
        corridor.validate().unwrap();
    }

    #[test]
    fn test_demand_profile_shape() {
        let profile = DemandProfile {
            mainline_veh_h: 1000.0,
            mainline_capacity_veh_h: 6000.0,
            ramp_veh_h: vec![200.0],
            peak_factor: 2.0,
            peak_start_s: 3600.0,
            peak_end_s: 7200.0,
            transition_s: 1800.0,
        };
        assert_eq!(profile.factor(0.0), 1.0);
        assert!((profile.factor(2700.0) - 1.5).abs() < 1e-9);
        assert_eq!(profile.factor(5000.0), 2.0);
        assert!((profile.factor(8100.0) - 1.5).abs() < 1e-9);
        assert_eq!(profile.factor(20_000.0), 1.0);
        assert_eq!(profile.ramp_demand(0, 5000.0), 400.0);
        assert_eq!(profile.ramp_demand(3, 5000.0), 0.0);
    }
}
