//! Metering Kernel: coordinated ramp metering for a freeway corridor.
//!
//! Each on-ramp runs an occupancy-feedback controller with a queue override;
//! a corridor coordinator switches groups of ramps between metering and
//! free-flow with hysteresis; a queue estimator fuses connected-vehicle
//! reports with loop-detector counts.

pub mod actors;
pub mod actuator;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod corridor;
pub mod environment;
pub mod error;
pub mod estimator;
pub mod kernel;
pub mod measurement;
pub mod messages;
pub mod scheduler;
pub mod sensors;

pub use actuator::{FeasibleRange, MeterActuator};
pub use config::CorridorConfig;
pub use controller::LocalController;
pub use coordinator::Coordinator;
pub use corridor::{Corridor, Ramp, RampId};
pub use environment::{Phase, RawVehicleReport, StationObservation, StationRole, TrafficEnvironment};
pub use error::{KernelError, Result};
pub use estimator::{QueueEstimator, VehicleClass};
pub use kernel::{AsyncControlPlane, ControlPlane, Kernel};
pub use measurement::{
    ActivationStatus, MeasurementBundle, PeriodPlan, PeriodSnapshot, QueueEstimate, RampCommand,
    RampDecision,
};
