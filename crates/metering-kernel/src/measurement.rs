//! Per-period values shared between components.
//!
//! Everything here is built once per control period and never mutated
//! afterwards; the next period replaces it wholesale.

use serde::{Deserialize, Serialize};

use crate::corridor::RampId;

/// Which data source produced a queue estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimateSource {
    /// Loop-detector conservation only
    Loops,
    /// Vehicle reports only
    Reports,
    /// Weighted blend of both
    Blended,
}

/// Published queue estimate for one ramp and one estimator window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueEstimate {
    pub ramp: RampId,
    /// Estimated queued vehicles, rounded and clamped to storage capacity
    pub count: f64,
    pub source: EstimateSource,
    /// Distinct connected vehicles matched to the queue segment
    pub matched_vehicles: usize,
    /// Window covered: `[window_start_s, window_end_s)`
    pub window_start_s: f64,
    pub window_end_s: f64,
}

/// Inputs a ramp's controller and the coordinator see for one period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementBundle {
    pub ramp: RampId,
    /// Mean occupancy of the nearby downstream mainline station (0.0 to 1.0)
    pub downstream_occupancy: f64,
    /// Latest queue estimate (vehicles)
    pub queue_length: f64,
    /// Ramp demand: entry flow over the period (veh/h)
    pub demand: f64,
    /// Whether the entry station reported a standing queue
    pub queue_present: bool,
}

/// The complete, immutable measurement set for one control period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodSnapshot {
    /// Control period counter (starts at 1)
    pub period: u64,
    /// Tick at which the period closed
    pub tick: u64,
    /// Simulated time at which the period closed (seconds)
    pub time_s: f64,
    /// One bundle per ramp, indexed by `RampId`
    pub bundles: Vec<MeasurementBundle>,
}

/// Corridor activation state of a ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationStatus {
    /// Meter at the local controller's rate
    Active,
    /// Run unmetered (free-flow green)
    Inactive,
}

/// One local controller's output for a period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampDecision {
    pub ramp: RampId,
    /// Commanded rate, already within the actuator's feasible range (veh/h)
    pub rate: f64,
    /// What the pure feedback law produced, after the same clamping (veh/h)
    pub feedback_rate: f64,
    pub queue_override_active: bool,
    /// The inputs this decision was computed from
    pub bundle: MeasurementBundle,
}

/// Final per-ramp command after coordination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampCommand {
    pub ramp: RampId,
    pub status: ActivationStatus,
    /// Local rate (ignored by the actuator while inactive)
    pub rate: f64,
    pub queue_override_active: bool,
}

impl RampCommand {
    /// Whether the actuator should run free-flow this period.
    pub fn free_flow(&self) -> bool {
        self.status == ActivationStatus::Inactive
    }
}

/// The arbitrated plan for one control period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodPlan {
    pub period: u64,
    pub time_s: f64,
    /// One command per ramp, indexed by `RampId`
    pub commands: Vec<RampCommand>,
}

impl PeriodPlan {
    pub fn active_count(&self) -> usize {
        self.commands.iter().filter(|c| !c.free_flow()).count()
    }

    pub fn override_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| c.queue_override_active)
            .count()
    }
}
