//! CorridorCoordinator: fans a control period out to the ramp actors and
//! arbitrates once every decision is back.
//!
//! ```text
//! EvaluatePeriod → CorridorCoordinator
//!   ├─ EvaluateRamp (correlation_id) → RampActors (concurrent)
//!   │   └─ RampEvaluated → CorridorCoordinator
//!   └─ PeriodComplete → observer
//! ```

use acton_reactive::prelude::*;
use dashmap::DashMap;
use mti::prelude::*;
use tracing::{debug, trace, warn};

use crate::coordinator::Coordinator;
use crate::corridor::RampId;
use crate::measurement::RampDecision;
use crate::messages::{
    EvaluatePeriod, EvaluateRamp, PeriodComplete, RampEvaluated, RegisterPeriodObserver,
    RegisterRampActors,
};

/// Decisions collected for one period.
#[derive(Debug, Clone)]
struct PendingPeriod {
    expected_count: usize,
    decisions: Vec<RampDecision>,
    period: u64,
    time_s: f64,
}

impl PendingPeriod {
    fn new(expected_count: usize, period: u64, time_s: f64) -> Self {
        Self {
            expected_count,
            decisions: Vec::with_capacity(expected_count),
            period,
            time_s,
        }
    }

    fn is_complete(&self) -> bool {
        self.decisions.len() >= self.expected_count
    }
}

/// Actor state for CorridorCoordinator.
#[derive(Default, Clone)]
pub struct CorridorCoordinatorState {
    coordinator: Option<Coordinator>,
    ramp_actors: DashMap<RampId, ActorHandle>,
    /// Pending periods by correlation ID
    pending_periods: DashMap<String, PendingPeriod>,
    observer: Option<ActorHandle>,
    completed_periods: u64,
}

impl std::fmt::Debug for CorridorCoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorridorCoordinatorState")
            .field("coordinator", &self.coordinator.is_some())
            .field("ramp_actors", &self.ramp_actors.len())
            .field("pending_periods", &self.pending_periods.len())
            .field("observer", &self.observer.is_some())
            .field("completed_periods", &self.completed_periods)
            .finish()
    }
}

pub struct CorridorCoordinator {
    pub coordinator: Coordinator,
}

impl CorridorCoordinator {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    /// Spawn the coordinator. Ramp actors and the observer register
    /// afterwards via `RegisterRampActors` and `RegisterPeriodObserver`.
    pub async fn spawn(self, runtime: &mut ActorRuntime) -> ActorHandle {
        let mut actor = runtime
            .new_actor_with_name::<CorridorCoordinatorState>("CorridorCoordinator".to_string());

        actor.model.coordinator = Some(self.coordinator);

        configure_handlers(&mut actor);

        actor.start().await
    }
}

fn configure_handlers(actor: &mut ManagedActor<Idle, CorridorCoordinatorState>) {
    actor.mutate_on::<RegisterRampActors>(|actor, context| {
        let msg = context.message();
        actor.model.ramp_actors.clear();
        for (ramp, handle) in &msg.actors {
            actor.model.ramp_actors.insert(*ramp, handle.clone());
        }
        trace!(ramps = actor.model.ramp_actors.len(), "Registered ramp actors");
        Reply::ready()
    });

    actor.mutate_on::<RegisterPeriodObserver>(|actor, context| {
        actor.model.observer = Some(context.message().handle.clone());
        debug!("Registered period observer");
        Reply::ready()
    });

    // Fan out: one EvaluateRamp per ramp under a shared correlation ID
    actor.mutate_on::<EvaluatePeriod>(|actor, context| {
        let snapshot = context.message().snapshot.clone();

        let mut requests = Vec::with_capacity(snapshot.bundles.len());
        for bundle in &snapshot.bundles {
            match actor.model.ramp_actors.get(&bundle.ramp) {
                Some(handle) => requests.push((handle.clone(), *bundle)),
                None => warn!(ramp = %bundle.ramp, "No actor registered for ramp"),
            }
        }

        if requests.len() != snapshot.bundles.len() {
            let complete = PeriodComplete {
                period: snapshot.period,
                plan: None,
                error: Some(format!(
                    "{} of {} ramps have no actor",
                    snapshot.bundles.len() - requests.len(),
                    snapshot.bundles.len()
                )),
            };
            let observer = actor.model.observer.clone();
            return Reply::pending(async move {
                if let Some(observer) = observer {
                    observer.send(complete).await;
                }
            });
        }

        let correlation_id = "period".create_type_id::<V7>().to_string();
        actor.model.pending_periods.insert(
            correlation_id.clone(),
            PendingPeriod::new(requests.len(), snapshot.period, snapshot.time_s),
        );

        trace!(
            correlation_id = %correlation_id,
            period = snapshot.period,
            expected = requests.len(),
            "Evaluating control period"
        );

        let period = snapshot.period;
        let tick = snapshot.tick;
        Reply::pending(async move {
            for (handle, bundle) in requests {
                handle
                    .send(EvaluateRamp {
                        correlation_id: correlation_id.clone(),
                        period,
                        tick,
                        bundle,
                    })
                    .await;
            }
        })
    });

    // Collect decisions; arbitrate when the period is complete
    actor.mutate_on::<RampEvaluated>(|actor, context| {
        let msg = context.message().clone();
        let correlation_id = msg.correlation_id.clone();

        let Some(mut pending) = actor.model.pending_periods.get_mut(&correlation_id) else {
            warn!(
                correlation_id = %correlation_id,
                "Received decision for unknown correlation ID"
            );
            return Reply::ready();
        };

        pending.decisions.push(msg.decision);
        if !pending.is_complete() {
            return Reply::ready();
        }
        drop(pending); // Release the lock before removing

        let Some((_, pending)) = actor.model.pending_periods.remove(&correlation_id) else {
            return Reply::ready();
        };

        let Some(coordinator) = actor.model.coordinator.as_mut() else {
            warn!("CorridorCoordinator: coordinator not initialized");
            return Reply::ready();
        };

        let complete = match coordinator.arbitrate(pending.period, pending.time_s, &pending.decisions)
        {
            Ok(plan) => PeriodComplete {
                period: pending.period,
                plan: Some(plan),
                error: None,
            },
            Err(e) => {
                warn!(period = pending.period, error = %e, "Arbitration failed");
                PeriodComplete {
                    period: pending.period,
                    plan: None,
                    error: Some(e.to_string()),
                }
            }
        };
        actor.model.completed_periods += 1;

        debug!(
            period = pending.period,
            completed = actor.model.completed_periods,
            "Period complete"
        );

        let observer = actor.model.observer.clone();
        Reply::pending(async move {
            if let Some(observer) = observer {
                observer.send(complete).await;
            }
        })
    });
}
