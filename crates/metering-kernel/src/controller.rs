//! LocalController: integral occupancy feedback with a queue override.
//!
//! ```text
//! rate(k) = rate(k-1) + gain * (setpoint - occupancy(k))
//! ```
//!
//! When the estimated queue exceeds the allowed fraction of storage, the
//! period's rate is raised to drain the excess queue within one period.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actuator::FeasibleRange;
use crate::config::ControllerConfig;
use crate::corridor::{Ramp, RampId};
use crate::measurement::{MeasurementBundle, RampDecision};

/// Mutable controller state, exposed for inspection and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Last emitted rate (veh/h); the integral law's `rate(k-1)`
    pub rate: f64,
    pub queue_override_active: bool,
    /// Tick of the last control update
    pub last_fired_tick: Option<u64>,
}

/// Per-ramp metering rate controller.
#[derive(Debug, Clone)]
pub struct LocalController {
    ramp: RampId,
    storage_capacity: f64,
    config: ControllerConfig,
    period_s: f64,
    feasible: FeasibleRange,
    state: ControllerState,
}

impl LocalController {
    /// Create a controller that starts at the actuator's highest feasible rate.
    pub fn new(
        ramp: &Ramp,
        config: ControllerConfig,
        period_s: f64,
        feasible: FeasibleRange,
    ) -> Self {
        Self {
            ramp: ramp.id,
            storage_capacity: f64::from(ramp.storage_capacity),
            config,
            period_s,
            feasible,
            state: ControllerState {
                rate: feasible.max_rate,
                queue_override_active: false,
                last_fired_tick: None,
            },
        }
    }

    pub fn ramp(&self) -> RampId {
        self.ramp
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn rate(&self) -> f64 {
        self.state.rate
    }

    pub fn queue_override_active(&self) -> bool {
        self.state.queue_override_active
    }

    pub fn feasible_range(&self) -> FeasibleRange {
        self.feasible
    }

    /// Queue length above which the override fires.
    pub fn queue_threshold(&self) -> f64 {
        self.config.queue_override_fraction * self.storage_capacity
    }

    /// What the feedback law alone would command for this occupancy.
    pub fn feedback_rate(&self, occupancy: f64) -> f64 {
        let error = self.config.occupancy_setpoint - sanitize(occupancy);
        self.feasible.clamp(self.state.rate + self.config.gain * error)
    }

    /// Run one control period and return the commanded rate.
    pub fn compute_rate(&mut self, bundle: &MeasurementBundle, tick: u64) -> RampDecision {
        let feedback_rate = self.feedback_rate(bundle.downstream_occupancy);

        let queue = sanitize(bundle.queue_length);
        let threshold = self.queue_threshold();
        let queue_override_active = self.config.queue_override_enabled && queue > threshold;

        let rate = if queue_override_active {
            let drain = (queue - threshold) * 3600.0 / self.period_s + sanitize(bundle.demand);
            self.feasible.clamp(feedback_rate.max(drain))
        } else {
            feedback_rate
        };

        if queue_override_active && !self.state.queue_override_active {
            debug!(
                ramp = %self.ramp,
                queue = format!("{:.0}", queue),
                threshold = format!("{:.1}", threshold),
                "Queue override engaged"
            );
        }

        self.state = ControllerState {
            rate,
            queue_override_active,
            last_fired_tick: Some(tick),
        };

        RampDecision {
            ramp: self.ramp,
            rate,
            feedback_rate,
            queue_override_active,
            bundle: *bundle,
        }
    }
}

/// Missing or corrupt readings count as zero.
fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(capacity: u32) -> Ramp {
        Ramp {
            id: RampId(0),
            name: "Onramp5".to_string(),
            lanes: 1,
            storage_capacity: capacity,
            position_m: 0.0,
        }
    }

    fn range() -> FeasibleRange {
        FeasibleRange {
            min_rate: 200.0,
            max_rate: 900.0,
        }
    }

    fn bundle(occupancy: f64, queue: f64, demand: f64) -> MeasurementBundle {
        MeasurementBundle {
            ramp: RampId(0),
            downstream_occupancy: occupancy,
            queue_length: queue,
            demand,
            queue_present: false,
        }
    }

    #[test]
    fn test_starts_at_max_rate() {
        let controller = LocalController::new(&ramp(20), ControllerConfig::default(), 30.0, range());
        assert_eq!(controller.rate(), 900.0);
        assert_eq!(controller.state().last_fired_tick, None);
    }

    #[test]
    fn test_integral_law_tracks_setpoint() {
        let mut controller =
            LocalController::new(&ramp(20), ControllerConfig::default(), 30.0, range());

        // 0.25 occupancy vs 0.15 setpoint: -0.10 * 3000 = -300 veh/h
        let d = controller.compute_rate(&bundle(0.25, 0.0, 0.0), 30);
        assert!((d.rate - 600.0).abs() < 1e-9);
        assert!(!d.queue_override_active);

        // Integral: builds on the previous rate
        let d = controller.compute_rate(&bundle(0.20, 0.0, 0.0), 60);
        assert!((d.rate - 450.0).abs() < 1e-9);

        // Below setpoint: rate recovers
        let d = controller.compute_rate(&bundle(0.10, 0.0, 0.0), 90);
        assert!((d.rate - 600.0).abs() < 1e-9);
        assert_eq!(controller.state().last_fired_tick, Some(90));
    }

    #[test]
    fn test_output_clamped_to_feasible_range() {
        let mut controller =
            LocalController::new(&ramp(20), ControllerConfig::default(), 30.0, range());
        let d = controller.compute_rate(&bundle(0.95, 0.0, 0.0), 30);
        assert_eq!(d.rate, 200.0);
        let d = controller.compute_rate(&bundle(0.0, 0.0, 0.0), 60);
        assert_eq!(d.rate, 650.0);
        let d = controller.compute_rate(&bundle(0.0, 0.0, 0.0), 90);
        assert_eq!(d.rate, 900.0);
    }

    #[test]
    fn test_missing_occupancy_treated_as_zero() {
        let mut a = LocalController::new(&ramp(20), ControllerConfig::default(), 30.0, range());
        let mut b = a.clone();
        a.compute_rate(&bundle(0.6, 0.0, 0.0), 30);
        b.compute_rate(&bundle(0.6, 0.0, 0.0), 30);
        let missing = a.compute_rate(&bundle(f64::NAN, 0.0, 0.0), 60);
        let zero = b.compute_rate(&bundle(0.0, 0.0, 0.0), 60);
        assert_eq!(missing.rate, zero.rate);
    }

    #[test]
    fn test_queue_override_above_threshold() {
        let capacity = 20;
        for queue in [17.0, 18.0, 20.0] {
            for occupancy in [0.0, 0.15, 0.3, 0.6, 1.0] {
                let mut controller =
                    LocalController::new(&ramp(capacity), ControllerConfig::default(), 30.0, range());
                controller.compute_rate(&bundle(0.5, 0.0, 0.0), 30);
                let d = controller.compute_rate(&bundle(occupancy, queue, 400.0), 60);
                assert!(d.queue_override_active, "queue {queue} must override");
                assert!(controller.queue_override_active());
                assert!(d.rate >= d.feedback_rate);
            }
        }
    }

    #[test]
    fn test_override_drains_excess_queue() {
        let mut controller =
            LocalController::new(&ramp(20), ControllerConfig::default(), 30.0, range());
        controller.compute_rate(&bundle(0.9, 0.0, 0.0), 30); // drive rate to minimum
        // Excess 4 vehicles over 30 s = 480 veh/h on top of 300 veh/h demand
        let d = controller.compute_rate(&bundle(0.9, 20.0, 300.0), 60);
        assert_eq!(d.feedback_rate, 200.0);
        assert!((d.rate - 780.0).abs() < 1e-9);
    }

    #[test]
    fn test_override_is_not_sticky() {
        let mut controller =
            LocalController::new(&ramp(20), ControllerConfig::default(), 30.0, range());
        assert!(controller.compute_rate(&bundle(0.3, 19.0, 0.0), 30).queue_override_active);
        assert!(!controller.compute_rate(&bundle(0.3, 15.0, 0.0), 60).queue_override_active);
        assert!(!controller.queue_override_active());
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut controller =
            LocalController::new(&ramp(20), ControllerConfig::default(), 30.0, range());
        assert_eq!(controller.queue_threshold(), 16.0);
        assert!(!controller.compute_rate(&bundle(0.3, 16.0, 0.0), 30).queue_override_active);
    }

    #[test]
    fn test_override_can_be_disabled() {
        let config = ControllerConfig {
            queue_override_enabled: false,
            ..Default::default()
        };
        let mut controller = LocalController::new(&ramp(20), config, 30.0, range());
        let d = controller.compute_rate(&bundle(0.3, 20.0, 0.0), 30);
        assert!(!d.queue_override_active);
        assert_eq!(d.rate, d.feedback_rate);
    }
}
