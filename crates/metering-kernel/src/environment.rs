//! The boundary with the external traffic simulator.
//!
//! The kernel pulls per-tick detector observations and vehicle reports and
//! pushes signal phases. Implementations own whatever connection the
//! simulator needs; the kernel only sees this trait.

use serde::{Deserialize, Serialize};

use crate::corridor::RampId;

/// Signal phase of a ramp meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Green,
    Red,
}

/// Detector station roles attached to each ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationRole {
    /// Mainline station just downstream of the merge, used for metering
    Mainline,
    /// Station at the upstream end of the ramp (vehicles joining the queue)
    Entry,
    /// Station at the meter stop line (vehicles leaving the queue)
    Exit,
}

impl StationRole {
    pub const ALL: [StationRole; 3] = [StationRole::Mainline, StationRole::Entry, StationRole::Exit];
}

/// One tick of loop-detector output for a station.
///
/// Flows are vehicle counts for the tick; occupancies are the fraction of the
/// tick a detector was covered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationObservation {
    pub lane_flow: Vec<f64>,
    pub lane_occupancy: Vec<f64>,
    pub edge_flow: f64,
    pub edge_occupancy: f64,
    pub queue_indicator: bool,
}

/// A position report as emitted by a connected vehicle.
///
/// `vehicle_type` is the simulator's free-form type string and `lane` the
/// simulator lane id (`<link>_<index>`); both are parsed once on ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVehicleReport {
    pub id: String,
    pub vehicle_type: String,
    pub lane: String,
    /// Distance from the start of the link (metres)
    pub position: f64,
    /// Simulated time of the report (seconds). A report sampled during the
    /// tick `[t, t + dt)` carries `t`.
    pub timestamp: f64,
}

/// The simulator, sensor wrappers and signal plumbing, seen from the kernel.
///
/// Observations are pulled after [`TrafficEnvironment::advance`]. A missing
/// observation is a sensor gap, not an error; errors are reserved for a
/// broken simulator connection.
pub trait TrafficEnvironment {
    /// Advance the simulation by one tick.
    fn advance(&mut self) -> anyhow::Result<()>;

    /// Latest observation of a ramp's station, if the detector reported.
    fn observe(&self, ramp: RampId, role: StationRole) -> Option<StationObservation>;

    /// Vehicle reports produced during the last tick.
    fn vehicle_reports(&mut self) -> Vec<RawVehicleReport>;

    /// Display a phase at a ramp meter.
    fn set_phase(&mut self, ramp: RampId, phase: Phase) -> anyhow::Result<()>;

    /// Per-period notification of the commanded rate (veh/h).
    ///
    /// Most simulators only need phases; the default ignores it.
    fn set_rate(&mut self, _ramp: RampId, _rate: f64) -> anyhow::Result<()> {
        Ok(())
    }

    /// Per-period notification that a meter runs free-flow.
    fn set_phase_override(&mut self, _ramp: RampId, _active: bool) -> anyhow::Result<()> {
        Ok(())
    }
}
