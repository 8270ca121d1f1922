//! Coordinator: corridor-wide activation of local controllers.
//!
//! Each period the coordinator scans the corridor from the downstream end.
//! A ramp's congestion indicator is the worst congestion measure among
//! itself and the ramps just downstream of it, so a bottleneck recruits the
//! meters feeding it. Activation uses a hysteresis band: a ramp switches on
//! at `activation_threshold` and off only below `deactivation_threshold`.

use tracing::{debug, info};

use crate::config::CoordinatorConfig;
use crate::corridor::{Corridor, RampId};
use crate::error::{KernelError, Result};
use crate::measurement::{
    ActivationStatus, MeasurementBundle, PeriodPlan, RampCommand, RampDecision,
};

#[derive(Debug, Clone)]
pub struct Coordinator {
    config: CoordinatorConfig,
    capacities: Vec<f64>,
    /// Downstream ramps that can recruit each ramp, nearest first
    neighbors: Vec<Vec<RampId>>,
    /// Ramp ids in scan order (downstream first)
    scan_order: Vec<RampId>,
    status: Vec<ActivationStatus>,
}

impl Coordinator {
    /// Every ramp starts inactive (free-flow) until congestion appears.
    pub fn new(corridor: &Corridor, config: CoordinatorConfig) -> Result<Self> {
        let neighbors = corridor
            .ids()
            .map(|id| {
                corridor.downstream_neighbors(
                    id,
                    config.propagation_radius,
                    config.propagation_distance_m,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            capacities: corridor
                .ramps()
                .iter()
                .map(|r| f64::from(r.storage_capacity))
                .collect(),
            neighbors,
            scan_order: corridor.downstream_to_upstream().collect(),
            status: vec![ActivationStatus::Inactive; corridor.len()],
            config,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn status(&self, ramp: RampId) -> Option<ActivationStatus> {
        self.status.get(ramp.index()).copied()
    }

    pub fn statuses(&self) -> &[ActivationStatus] {
        &self.status
    }

    /// Congestion measure of a single ramp's bundle.
    pub fn congestion(&self, bundle: &MeasurementBundle) -> f64 {
        let occupancy = finite_or_zero(bundle.downstream_occupancy);
        let capacity = self
            .capacities
            .get(bundle.ramp.index())
            .copied()
            .unwrap_or(0.0);
        if self.config.queue_weight <= 0.0 || capacity <= 0.0 {
            return occupancy;
        }
        let queue_ratio = finite_or_zero(bundle.queue_length) / capacity;
        occupancy.max(self.config.queue_weight * queue_ratio)
    }

    /// Per-ramp indicators: own congestion or that of recruiting neighbours.
    pub fn indicators(&self, bundles: &[MeasurementBundle]) -> Vec<f64> {
        let own: Vec<f64> = bundles.iter().map(|b| self.congestion(b)).collect();
        let mut indicators = vec![0.0; own.len()];
        for &id in &self.scan_order {
            let Some(&local) = own.get(id.index()) else {
                continue;
            };
            indicators[id.index()] = self.neighbors[id.index()]
                .iter()
                .filter_map(|n| own.get(n.index()))
                .fold(local, |acc, &c| acc.max(c));
        }
        indicators
    }

    /// Apply hysteresis to one ramp's indicator and return its new status.
    fn transition(&self, current: ActivationStatus, indicator: f64) -> ActivationStatus {
        if !self.config.enabled {
            return ActivationStatus::Active;
        }
        match current {
            ActivationStatus::Inactive if indicator >= self.config.activation_threshold => {
                ActivationStatus::Active
            }
            ActivationStatus::Active if indicator < self.config.deactivation_threshold => {
                ActivationStatus::Inactive
            }
            unchanged => unchanged,
        }
    }

    /// Combine the local decisions for a period into the corridor plan.
    ///
    /// `decisions` must hold exactly one entry per ramp, in any order.
    pub fn arbitrate(
        &mut self,
        period: u64,
        time_s: f64,
        decisions: &[RampDecision],
    ) -> Result<PeriodPlan> {
        let len = self.status.len();
        let mut by_ramp: Vec<Option<&RampDecision>> = vec![None; len];
        for decision in decisions {
            let slot = by_ramp
                .get_mut(decision.ramp.index())
                .ok_or(KernelError::RampOutOfBounds {
                    index: decision.ramp.index(),
                    len,
                })?;
            *slot = Some(decision);
        }
        let ordered = by_ramp
            .into_iter()
            .enumerate()
            .map(|(index, d)| d.ok_or(KernelError::MissingDecision { period, index }))
            .collect::<Result<Vec<_>>>()?;

        let bundles: Vec<MeasurementBundle> = ordered.iter().map(|d| d.bundle).collect();
        let indicators = self.indicators(&bundles);

        for &id in &self.scan_order {
            let index = id.index();
            let previous = self.status[index];
            let next = self.transition(previous, indicators[index]);
            if next != previous {
                debug!(
                    ramp = %id,
                    indicator = format!("{:.3}", indicators[index]),
                    status = ?next,
                    "Activation changed"
                );
            }
            self.status[index] = next;
        }

        let commands: Vec<RampCommand> = ordered
            .iter()
            .map(|d| RampCommand {
                ramp: d.ramp,
                status: self.status[d.ramp.index()],
                rate: d.rate,
                queue_override_active: d.queue_override_active,
            })
            .collect();

        let plan = PeriodPlan {
            period,
            time_s,
            commands,
        };

        info!(
            period,
            active = plan.active_count(),
            overrides = plan.override_count(),
            ramps = len,
            "Control period arbitrated"
        );

        Ok(plan)
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value.max(0.0) } else { 0.0 }
}
