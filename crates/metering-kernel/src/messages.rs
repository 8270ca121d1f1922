//! Message types for acton-reactive actor communication.
//!
//! A control period fans out to one `EvaluateRamp` per ramp actor under a
//! shared correlation ID (via mti); the coordinator arbitrates once every
//! `RampEvaluated` for that ID has arrived.

use std::collections::HashMap;

use acton_reactive::prelude::ActorHandle;

use crate::corridor::RampId;
use crate::measurement::{MeasurementBundle, PeriodPlan, PeriodSnapshot, RampDecision};

/// Register ramp actors with the corridor coordinator.
///
/// Sent once after every RampActor has been spawned.
#[derive(Debug, Clone)]
pub struct RegisterRampActors {
    pub actors: HashMap<RampId, ActorHandle>,
}

/// Register the actor that receives `PeriodComplete`.
#[derive(Debug, Clone)]
pub struct RegisterPeriodObserver {
    pub handle: ActorHandle,
}

/// Start evaluating a closed control period - sent to the coordinator.
#[derive(Debug, Clone)]
pub struct EvaluatePeriod {
    pub snapshot: PeriodSnapshot,
}

/// Run one ramp's local controller - sent to that ramp's actor.
#[derive(Debug, Clone)]
pub struct EvaluateRamp {
    /// Correlation ID shared by every ramp in the period
    pub correlation_id: String,
    pub period: u64,
    /// Tick at which the period closed
    pub tick: u64,
    pub bundle: MeasurementBundle,
}

/// A ramp actor's decision - sent back to the coordinator.
#[derive(Debug, Clone)]
pub struct RampEvaluated {
    /// Correlation ID matching the original request
    pub correlation_id: String,
    pub decision: RampDecision,
}

/// Period evaluation finished - sent to the registered observer.
///
/// Exactly one of `plan` and `error` is set.
#[derive(Debug, Clone)]
pub struct PeriodComplete {
    pub period: u64,
    pub plan: Option<PeriodPlan>,
    pub error: Option<String>,
}
