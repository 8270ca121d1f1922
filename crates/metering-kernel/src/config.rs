//! Configuration types for the corridor.
//!
//! The configuration is a set of tables keyed by ramp name: the geometry table
//! (`ramps`) is authoritative, and every other per-ramp table must only name
//! ramps that appear there. Loaded from JSON once, before a run starts.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Top-level corridor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorridorConfig {
    /// Simulated seconds per tick
    pub tick_seconds: f64,

    /// Control period in simulated seconds
    pub control_period_s: f64,

    /// Run horizon in simulated seconds
    pub total_time_s: f64,

    /// Geometry table: one entry per metered on-ramp
    pub ramps: Vec<RampConfig>,

    /// Signal configuration per ramp (required for every ramp)
    pub meters: BTreeMap<String, MeterConfig>,

    /// Controller parameters applied to ramps without an override
    pub controller_defaults: ControllerConfig,

    /// Per-ramp controller overrides
    pub controllers: BTreeMap<String, ControllerConfig>,

    /// Corridor coordination
    pub coordinator: CoordinatorConfig,

    /// Queue estimation
    pub estimator: EstimatorConfig,
}

/// Static ramp geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Unique ramp name (e.g. "Onramp5")
    pub name: String,

    /// Number of metered lanes
    pub lanes: u32,

    /// Vehicles the ramp can store before spilling back
    pub storage_capacity: u32,

    /// Position along the corridor in metres, increasing downstream
    pub position_m: f64,
}

/// Ramp signal parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Vehicles released per lane during one green
    pub vehicles_per_green_per_lane: u32,

    /// Green time granted per released vehicle (seconds)
    pub green_seconds_per_vehicle: f64,

    /// Shortest red the signal can display (seconds)
    pub min_red_s: f64,

    /// Longest red the signal can display (seconds)
    pub max_red_s: f64,

    /// Red duration before the first command arrives (defaults to `min_red_s`)
    pub initial_red_s: Option<f64>,
}

/// Local feedback controller parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Integral gain in veh/h per unit of occupancy error
    pub gain: f64,

    /// Downstream occupancy the controller regulates toward (0.0 to 1.0)
    pub occupancy_setpoint: f64,

    /// Queue override fires above this fraction of storage capacity
    pub queue_override_fraction: f64,

    /// Whether the queue override is enabled at all
    pub queue_override_enabled: bool,
}

/// Corridor coordination parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// When false every ramp meters on its local law alone
    pub enabled: bool,

    /// Indicator level that switches a ramp to metering
    pub activation_threshold: f64,

    /// Indicator level below which a metering ramp runs free again
    pub deactivation_threshold: f64,

    /// Number of upstream ramps recruited by downstream congestion
    pub propagation_radius: usize,

    /// Optional distance limit on recruitment (metres)
    pub propagation_distance_m: Option<f64>,

    /// Weight of the queue/capacity ratio in the congestion indicator
    pub queue_weight: f64,
}

/// Thresholds that decide how far vehicle reports are trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Fewer distinct reporting vehicles than this: loop estimate only
    pub min_reports: usize,

    /// At least this many distinct reporting vehicles: report estimate only
    pub full_trust_reports: usize,

    /// Report weight at exactly `min_reports`
    pub sparse_report_weight: f64,
}

/// Fusion thresholds that apply up to a given penetration rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenetrationBand {
    /// Upper bound (inclusive) of the penetration rate for this band
    pub max_penetration: f64,

    /// Thresholds used inside the band
    pub fusion: FusionConfig,
}

/// Spatial extent of a ramp's queue storage area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSegmentConfig {
    /// Network link (edge) id holding the queue
    pub link: String,

    /// Lane indices on the link; empty means every lane
    #[serde(default)]
    pub lanes: Vec<u32>,

    /// Start of the storage area along the link (metres)
    pub start_m: f64,

    /// End of the storage area along the link (metres)
    pub end_m: f64,
}

/// Queue estimator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Seconds between published estimates
    pub update_interval_s: f64,

    /// Fraction of vehicles that report their position
    pub penetration_rate: f64,

    /// Fusion thresholds when no penetration band matches
    pub fusion: FusionConfig,

    /// Penetration-dependent fusion thresholds, checked in order
    pub penetration_bands: Vec<PenetrationBand>,

    /// Mean entry-detector occupancy that signals queue spillback.
    /// `None` keeps the loop estimate a pure conservation count.
    pub spillback_occupancy: Option<f64>,

    /// Queue floor (fraction of capacity) while spillback is detected
    pub spillback_fill_fraction: f64,

    /// Queue segment geometry per ramp
    pub segments: BTreeMap<String, QueueSegmentConfig>,
}

impl Default for CorridorConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 1.0,
            control_period_s: 30.0,
            total_time_s: 7.0 * 3600.0,
            ramps: Vec::new(),
            meters: BTreeMap::new(),
            controller_defaults: ControllerConfig::default(),
            controllers: BTreeMap::new(),
            coordinator: CoordinatorConfig::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            vehicles_per_green_per_lane: 1,
            green_seconds_per_vehicle: 2.0,
            min_red_s: 2.0,
            max_red_s: 60.0,
            initial_red_s: None,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gain: 3000.0, // 30 veh/h per occupancy percent
            occupancy_setpoint: 0.15,
            queue_override_fraction: 0.8,
            queue_override_enabled: true,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_threshold: 0.35,
            deactivation_threshold: 0.20,
            propagation_radius: 1,
            propagation_distance_m: None,
            queue_weight: 0.0,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_reports: 2,
            full_trust_reports: 6,
            sparse_report_weight: 0.25,
        }
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            update_interval_s: 30.0,
            penetration_rate: 0.1,
            fusion: FusionConfig::default(),
            penetration_bands: Vec::new(),
            spillback_occupancy: None,
            spillback_fill_fraction: 0.9,
            segments: BTreeMap::new(),
        }
    }
}

impl CorridorConfig {
    /// Parse a configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Controller parameters for a ramp, falling back to the defaults.
    pub fn controller_for(&self, ramp: &str) -> &ControllerConfig {
        self.controllers
            .get(ramp)
            .unwrap_or(&self.controller_defaults)
    }

    /// Convert a duration in seconds to whole ticks (at least one).
    pub fn ticks(&self, seconds: f64) -> u64 {
        ((seconds / self.tick_seconds).round() as u64).max(1)
    }

    /// Check cross-table consistency and value ranges.
    ///
    /// Any failure here is fatal: a run must not start with undefined
    /// per-ramp parameters.
    pub fn validate(&self) -> Result<()> {
        if !(self.tick_seconds > 0.0) {
            return Err(invalid("tick_seconds must be positive"));
        }
        if self.control_period_s < self.tick_seconds {
            return Err(invalid("control_period_s must be at least one tick"));
        }
        if self.estimator.update_interval_s < self.tick_seconds {
            return Err(invalid("estimator.update_interval_s must be at least one tick"));
        }
        if self.ramps.is_empty() {
            return Err(invalid("corridor has no ramps"));
        }

        let mut names = HashSet::new();
        for ramp in &self.ramps {
            if !names.insert(ramp.name.as_str()) {
                return Err(KernelError::DuplicateRamp(ramp.name.clone()));
            }
            if ramp.lanes == 0 {
                return Err(invalid(format!("ramp '{}' has zero lanes", ramp.name)));
            }
            if ramp.storage_capacity == 0 {
                return Err(invalid(format!(
                    "ramp '{}' has zero storage capacity",
                    ramp.name
                )));
            }
            if !ramp.position_m.is_finite() {
                return Err(invalid(format!("ramp '{}' has no finite position", ramp.name)));
            }
            if !self.meters.contains_key(&ramp.name) {
                return Err(KernelError::MissingMeter(ramp.name.clone()));
            }
        }

        check_known(&names, "meters", self.meters.keys())?;
        check_known(&names, "controllers", self.controllers.keys())?;
        check_known(&names, "estimator.segments", self.estimator.segments.keys())?;

        for (name, meter) in &self.meters {
            if meter.vehicles_per_green_per_lane == 0 || !(meter.green_seconds_per_vehicle > 0.0) {
                return Err(invalid(format!("meter '{name}' releases no vehicles per green")));
            }
            if meter.min_red_s < 0.0 || meter.min_red_s > meter.max_red_s {
                return Err(invalid(format!(
                    "meter '{name}' red bounds [{}, {}] are inconsistent",
                    meter.min_red_s, meter.max_red_s
                )));
            }
        }

        check_controller("controller_defaults", &self.controller_defaults)?;
        for (name, controller) in &self.controllers {
            check_controller(name, controller)?;
        }

        let coord = &self.coordinator;
        if coord.deactivation_threshold >= coord.activation_threshold {
            return Err(invalid(format!(
                "coordinator deactivation threshold {} must be strictly below activation threshold {}",
                coord.deactivation_threshold, coord.activation_threshold
            )));
        }

        let est = &self.estimator;
        if !(est.penetration_rate > 0.0 && est.penetration_rate <= 1.0) {
            return Err(invalid("estimator.penetration_rate must be in (0, 1]"));
        }
        check_fusion("estimator.fusion", &est.fusion)?;
        for band in &est.penetration_bands {
            check_fusion("estimator.penetration_bands", &band.fusion)?;
        }
        if est
            .spillback_occupancy
            .is_some_and(|occupancy| !(occupancy > 0.0 && occupancy <= 1.0))
        {
            return Err(invalid("estimator.spillback_occupancy must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&est.spillback_fill_fraction) {
            return Err(invalid("estimator.spillback_fill_fraction outside [0, 1]"));
        }
        for (name, segment) in &est.segments {
            if segment.start_m >= segment.end_m {
                return Err(invalid(format!("queue segment for '{name}' is empty")));
            }
        }

        Ok(())
    }
}

impl EstimatorConfig {
    /// Fusion thresholds for the configured penetration rate.
    pub fn active_fusion(&self) -> &FusionConfig {
        self.penetration_bands
            .iter()
            .find(|band| self.penetration_rate <= band.max_penetration)
            .map(|band| &band.fusion)
            .unwrap_or(&self.fusion)
    }
}

fn invalid(msg: impl Into<String>) -> KernelError {
    KernelError::InvalidConfig(msg.into())
}

fn check_known<'a>(
    names: &HashSet<&str>,
    section: &'static str,
    keys: impl Iterator<Item = &'a String>,
) -> Result<()> {
    for key in keys {
        if !names.contains(key.as_str()) {
            return Err(KernelError::UnknownRamp {
                section,
                name: key.clone(),
            });
        }
    }
    Ok(())
}

fn check_controller(name: &str, c: &ControllerConfig) -> Result<()> {
    if !(0.0..=1.0).contains(&c.occupancy_setpoint) {
        return Err(invalid(format!("controller '{name}' setpoint outside [0, 1]")));
    }
    if !(c.queue_override_fraction > 0.0 && c.queue_override_fraction <= 1.0) {
        return Err(invalid(format!(
            "controller '{name}' queue override fraction outside (0, 1]"
        )));
    }
    Ok(())
}

fn check_fusion(section: &str, f: &FusionConfig) -> Result<()> {
    if f.min_reports > f.full_trust_reports {
        return Err(invalid(format!(
            "{section}: min_reports exceeds full_trust_reports"
        )));
    }
    if !(0.0..=1.0).contains(&f.sparse_report_weight) {
        return Err(invalid(format!("{section}: sparse_report_weight outside [0, 1]")));
    }
    Ok(())
}
