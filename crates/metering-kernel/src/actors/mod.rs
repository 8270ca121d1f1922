//! Acton-reactive actors for concurrent control-period evaluation.
//!
//! Uses message correlation (via mti) to track async responses:
//!
//! ```text
//! EvaluatePeriod → CorridorCoordinator
//!   ├─ EvaluateRamp (correlation_id) → RampActors (concurrent)
//!   │   └─ RampEvaluated → CorridorCoordinator
//!   └─ PeriodComplete → registered observer
//! ```
//!
//! Each RampActor owns its ramp's LocalController, so per-ramp state is never
//! shared. The coordinator owns the corridor Coordinator and arbitrates only
//! once the decision set for a period is complete, which keeps the result
//! identical to the synchronous `ControlPlane`.

mod corridor_coordinator;
mod ramp_actor;

pub use corridor_coordinator::{CorridorCoordinator, CorridorCoordinatorState};
pub use ramp_actor::{RampActor, RampActorState};
