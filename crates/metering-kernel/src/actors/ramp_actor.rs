//! RampActor: owns one ramp's LocalController.
//!
//! Controller state (the integral law's previous rate, the override flag)
//! lives only inside the actor, so a ramp is evaluated strictly once per
//! period in mailbox order while ramps run concurrently with each other.

use acton_reactive::prelude::*;
use tracing::{debug, warn};

use crate::controller::LocalController;
use crate::corridor::RampId;
use crate::messages::{EvaluateRamp, RampEvaluated};

/// Actor state for a single ramp.
#[derive(Default, Clone)]
pub struct RampActorState {
    pub ramp: RampId,
    pub controller: Option<LocalController>,
    /// Handle to the corridor coordinator for replies
    pub coordinator: Option<ActorHandle>,
    pub evaluations: u64,
}

impl std::fmt::Debug for RampActorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RampActorState")
            .field("ramp", &self.ramp)
            .field("rate", &self.controller.as_ref().map(LocalController::rate))
            .field("coordinator", &self.coordinator.is_some())
            .field("evaluations", &self.evaluations)
            .finish()
    }
}

pub struct RampActor {
    pub controller: LocalController,
    pub coordinator: ActorHandle,
}

impl RampActor {
    pub fn new(controller: LocalController, coordinator: ActorHandle) -> Self {
        Self {
            controller,
            coordinator,
        }
    }

    /// Spawn the actor; it answers `EvaluateRamp` with `RampEvaluated`.
    pub async fn spawn(self, runtime: &mut ActorRuntime, name: &str) -> ActorHandle {
        let mut actor = runtime.new_actor_with_name::<RampActorState>(format!("Ramp:{name}"));

        actor.model.ramp = self.controller.ramp();
        actor.model.controller = Some(self.controller);
        actor.model.coordinator = Some(self.coordinator);

        configure_ramp_actor(&mut actor);

        actor.start().await
    }
}

fn configure_ramp_actor(actor: &mut ManagedActor<Idle, RampActorState>) {
    actor.mutate_on::<EvaluateRamp>(|actor, context| {
        let msg = context.message().clone();
        let ramp = actor.model.ramp;

        let Some(coordinator) = actor.model.coordinator.clone() else {
            warn!(ramp = %ramp, "EvaluateRamp: coordinator not set");
            return Reply::ready();
        };
        let Some(controller) = actor.model.controller.as_mut() else {
            warn!(ramp = %ramp, "EvaluateRamp: controller not set");
            return Reply::ready();
        };
        if msg.bundle.ramp != ramp {
            warn!(
                ramp = %ramp,
                bundle_ramp = %msg.bundle.ramp,
                "EvaluateRamp: bundle addressed to another ramp"
            );
            return Reply::ready();
        }

        let decision = controller.compute_rate(&msg.bundle, msg.tick);
        actor.model.evaluations += 1;

        debug!(
            ramp = %ramp,
            period = msg.period,
            rate = format!("{:.0}", decision.rate),
            feedback = format!("{:.0}", decision.feedback_rate),
            queue_override = decision.queue_override_active,
            "Ramp evaluated"
        );

        let reply = RampEvaluated {
            correlation_id: msg.correlation_id,
            decision,
        };

        Reply::pending(async move {
            coordinator.send(reply).await;
        })
    });
}
