//! Period driver actor for receiving PeriodComplete from the corridor
//! coordinator.
//!
//! Bridges the actor-based control plane with the experiment loop: the
//! coordinator sends PeriodComplete here, and the actor forwards it to an
//! mpsc channel the loop awaits before applying the plan.

use acton_reactive::prelude::*;
use tokio::sync::mpsc;

use metering_kernel::messages::PeriodComplete;

/// State for the period driver actor.
#[derive(Default, Clone)]
pub struct PeriodDriverState {
    pub tx: Option<mpsc::Sender<PeriodComplete>>,
    pub forwarded: u64,
}

impl std::fmt::Debug for PeriodDriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodDriverState")
            .field("has_tx", &self.tx.is_some())
            .field("forwarded", &self.forwarded)
            .finish()
    }
}

/// Forwards every PeriodComplete to a channel.
///
/// Register the returned handle with `AsyncControlPlane::register_observer`.
pub struct PeriodDriverActor {
    tx: mpsc::Sender<PeriodComplete>,
}

impl PeriodDriverActor {
    pub fn new(tx: mpsc::Sender<PeriodComplete>) -> Self {
        Self { tx }
    }

    pub async fn spawn(self, runtime: &mut ActorRuntime) -> ActorHandle {
        let mut actor =
            runtime.new_actor_with_name::<PeriodDriverState>("PeriodDriver".to_string());

        actor.model.tx = Some(self.tx);

        actor.mutate_on::<PeriodComplete>(|actor, context| {
            let complete = context.message().clone();
            actor.model.forwarded += 1;
            let tx = actor.model.tx.clone();

            Reply::pending(async move {
                if let Some(tx) = tx {
                    // Receiver dropped means the run already ended
                    let _ = tx.send(complete).await;
                }
            })
        });

        actor.start().await
    }
}
