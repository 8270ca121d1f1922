//! MeterActuator: the two-phase signal state machine of one ramp meter.
//!
//! The controller commands a flow rate; the actuator turns it into a red
//! duration for the *next* red phase. Red durations outside the signal's
//! `[min_red, max_red]` range are clamped and counted, never emitted.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MeterConfig;
use crate::corridor::{Ramp, RampId};
use crate::environment::Phase;

/// Tolerance for floating-point phase timing.
const TIMING_EPS: f64 = 1e-9;

/// Range of metering rates (veh/h) the signal can actually realise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeasibleRange {
    pub min_rate: f64,
    pub max_rate: f64,
}

impl FeasibleRange {
    pub fn clamp(&self, rate: f64) -> f64 {
        if rate.is_nan() {
            return self.min_rate;
        }
        rate.clamp(self.min_rate, self.max_rate)
    }
}

/// Result of converting a commanded rate into a red duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedCommand {
    /// Red duration that will be used for the next red phase (seconds)
    pub red_s: f64,
    /// Whether the command had to be clamped into `[min_red, max_red]`
    pub clamped: bool,
}

/// Phase state machine for one ramp signal.
#[derive(Debug, Clone)]
pub struct MeterActuator {
    ramp: RampId,
    lanes: u32,
    vehicles_per_green_per_lane: u32,
    green_seconds_per_vehicle: f64,
    min_red_s: f64,
    max_red_s: f64,
    phase: Phase,
    elapsed_s: f64,
    green_s: f64,
    red_s: f64,
    pending_red_s: f64,
    free_flow: bool,
    clamped_commands: u64,
}

impl MeterActuator {
    /// Create an actuator starting at the beginning of a green phase.
    pub fn new(ramp: &Ramp, config: &MeterConfig) -> Self {
        let initial_red = config
            .initial_red_s
            .unwrap_or(config.min_red_s)
            .clamp(config.min_red_s, config.max_red_s);
        let mut actuator = Self {
            ramp: ramp.id,
            lanes: ramp.lanes,
            vehicles_per_green_per_lane: config.vehicles_per_green_per_lane,
            green_seconds_per_vehicle: config.green_seconds_per_vehicle,
            min_red_s: config.min_red_s,
            max_red_s: config.max_red_s,
            phase: Phase::Green,
            elapsed_s: 0.0,
            green_s: 0.0,
            red_s: initial_red,
            pending_red_s: initial_red,
            free_flow: false,
            clamped_commands: 0,
        };
        actuator.green_s = actuator.derive_green();
        actuator
    }

    pub fn ramp(&self) -> RampId {
        self.ramp
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn elapsed_s(&self) -> f64 {
        self.elapsed_s
    }

    pub fn green_s(&self) -> f64 {
        self.green_s
    }

    /// Red duration of the current (or most recent) red phase.
    pub fn red_s(&self) -> f64 {
        self.red_s
    }

    /// Red duration that the next red phase will use.
    pub fn pending_red_s(&self) -> f64 {
        self.pending_red_s
    }

    pub fn red_bounds(&self) -> (f64, f64) {
        (self.min_red_s, self.max_red_s)
    }

    pub fn is_free_flow(&self) -> bool {
        self.free_flow
    }

    /// Number of rate commands that implied an infeasible red duration.
    pub fn clamped_commands(&self) -> u64 {
        self.clamped_commands
    }

    /// Vehicles released by one full green across all metered lanes.
    pub fn vehicles_per_cycle(&self) -> f64 {
        f64::from(self.vehicles_per_green_per_lane * self.lanes)
    }

    /// Rates the signal can realise with its red bounds.
    pub fn feasible_range(&self) -> FeasibleRange {
        let green = self.derive_green();
        FeasibleRange {
            min_rate: self.rate_for_red(self.max_red_s, green),
            max_rate: self.rate_for_red(self.min_red_s, green),
        }
    }

    /// Advance one tick; returns the phase to display if it changed.
    pub fn run(&mut self, tick_seconds: f64) -> Option<Phase> {
        if self.free_flow {
            if self.phase != Phase::Green {
                self.phase = Phase::Green;
                self.elapsed_s = 0.0;
                return Some(Phase::Green);
            }
            self.elapsed_s += tick_seconds;
            return None;
        }

        self.elapsed_s += tick_seconds;
        let duration = match self.phase {
            Phase::Green => self.green_s,
            Phase::Red => self.red_s,
        };
        if self.elapsed_s + TIMING_EPS < duration {
            return None;
        }

        self.elapsed_s = 0.0;
        match self.phase {
            Phase::Green => {
                self.phase = Phase::Red;
                self.red_s = self.pending_red_s;
            }
            Phase::Red => {
                self.phase = Phase::Green;
                self.green_s = self.derive_green();
            }
        }
        Some(self.phase)
    }

    /// Convert a target rate (veh/h) into the next red duration.
    ///
    /// Infeasible commands clamp to the red bounds; a zero, negative or
    /// non-finite rate holds the longest red.
    pub fn set_rate(&mut self, rate: f64) -> RedCommand {
        let green = self.derive_green();
        let raw = if rate.is_finite() && rate > 0.0 {
            self.vehicles_per_cycle() * 3600.0 / rate - green
        } else {
            f64::INFINITY
        };
        let red_s = raw.clamp(self.min_red_s, self.max_red_s);
        let clamped = (red_s - raw).abs() > TIMING_EPS;
        if clamped {
            self.clamped_commands += 1;
            debug!(
                ramp = %self.ramp,
                rate = format!("{:.0}", rate),
                requested_red = format!("{:.2}", raw),
                red = format!("{:.2}", red_s),
                "Red duration clamped"
            );
        }
        self.pending_red_s = red_s;
        RedCommand { red_s, clamped }
    }

    /// Enter or leave free-flow (unmetered) operation.
    pub fn set_phase_override(&mut self, active: bool) {
        if self.free_flow && !active {
            // Resume metering from a fresh green
            self.elapsed_s = 0.0;
            self.green_s = self.derive_green();
        }
        self.free_flow = active;
    }

    fn derive_green(&self) -> f64 {
        self.green_seconds_per_vehicle * f64::from(self.vehicles_per_green_per_lane)
    }

    fn rate_for_red(&self, red_s: f64, green_s: f64) -> f64 {
        self.vehicles_per_cycle() * 3600.0 / (green_s + red_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(lanes: u32) -> Ramp {
        Ramp {
            id: RampId(0),
            name: "Onramp5".to_string(),
            lanes,
            storage_capacity: 20,
            position_m: 0.0,
        }
    }

    fn meter() -> MeterConfig {
        MeterConfig {
            vehicles_per_green_per_lane: 1,
            green_seconds_per_vehicle: 2.0,
            min_red_s: 4.0,
            max_red_s: 20.0,
            initial_red_s: None,
        }
    }

    #[test]
    fn test_red_always_within_bounds() {
        let mut actuator = MeterActuator::new(&ramp(1), &meter());
        let rates = [
            -100.0,
            0.0,
            1.0,
            150.0,
            300.0,
            600.0,
            900.0,
            5000.0,
            f64::NAN,
            f64::INFINITY,
        ];
        for rate in rates {
            let cmd = actuator.set_rate(rate);
            assert!(
                (4.0..=20.0).contains(&cmd.red_s),
                "rate {rate} gave red {}",
                cmd.red_s
            );
            assert_eq!(actuator.pending_red_s(), cmd.red_s);
        }
    }

    #[test]
    fn test_feasible_rate_is_not_clamped() {
        let mut actuator = MeterActuator::new(&ramp(1), &meter());
        // 1 vehicle per cycle, green 2 s: 600 veh/h -> 6 s cycle -> 4 s red
        let cmd = actuator.set_rate(600.0);
        assert!(!cmd.clamped);
        assert!((cmd.red_s - 4.0).abs() < 1e-9);
        assert_eq!(actuator.clamped_commands(), 0);
    }

    #[test]
    fn test_infeasible_rate_is_counted() {
        let mut actuator = MeterActuator::new(&ramp(1), &meter());
        let cmd = actuator.set_rate(3600.0);
        assert!(cmd.clamped);
        assert_eq!(cmd.red_s, 4.0);
        let cmd = actuator.set_rate(0.0);
        assert!(cmd.clamped);
        assert_eq!(cmd.red_s, 20.0);
        assert_eq!(actuator.clamped_commands(), 2);
    }

    #[test]
    fn test_feasible_range_matches_red_bounds() {
        let mut actuator = MeterActuator::new(&ramp(2), &meter());
        let range = actuator.feasible_range();
        // 2 vehicles per cycle: max = 7200 / (2 + 4), min = 7200 / (2 + 20)
        assert!((range.max_rate - 1200.0).abs() < 1e-9);
        assert!((range.min_rate - 7200.0 / 22.0).abs() < 1e-9);
        assert!(!actuator.set_rate(range.max_rate).clamped);
        assert!(!actuator.set_rate(range.min_rate).clamped);
    }

    #[test]
    fn test_phase_cycle_timing() {
        let mut actuator = MeterActuator::new(&ramp(1), &meter());
        actuator.set_rate(450.0); // 8 s cycle -> 6 s red

        let mut transitions = Vec::new();
        for tick in 1..=16 {
            if let Some(phase) = actuator.run(1.0) {
                transitions.push((tick, phase));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (2, Phase::Red),
                (8, Phase::Green),
                (10, Phase::Red),
                (16, Phase::Green),
            ]
        );
    }

    #[test]
    fn test_rate_change_applies_to_next_red() {
        let mut actuator = MeterActuator::new(&ramp(1), &meter());
        actuator.set_rate(450.0);
        actuator.run(1.0);
        actuator.run(1.0); // now red with 6 s
        assert_eq!(actuator.phase(), Phase::Red);
        actuator.set_rate(600.0);
        assert_eq!(actuator.red_s(), 6.0);
        assert_eq!(actuator.pending_red_s(), 4.0);
    }

    #[test]
    fn test_green_scales_with_release_capacity() {
        let mut config = meter();
        config.vehicles_per_green_per_lane = 3;
        let actuator = MeterActuator::new(&ramp(2), &config);
        assert_eq!(actuator.green_s(), 6.0);
        assert_eq!(actuator.vehicles_per_cycle(), 6.0);
    }

    #[test]
    fn test_free_flow_holds_green() {
        let mut actuator = MeterActuator::new(&ramp(1), &meter());
        actuator.set_rate(450.0);
        actuator.run(1.0);
        assert_eq!(actuator.run(1.0), Some(Phase::Red));

        actuator.set_phase_override(true);
        assert_eq!(actuator.run(1.0), Some(Phase::Green));
        for _ in 0..100 {
            assert_eq!(actuator.run(1.0), None);
            assert_eq!(actuator.phase(), Phase::Green);
        }

        actuator.set_phase_override(false);
        assert_eq!(actuator.run(1.0), None);
        assert_eq!(actuator.run(1.0), Some(Phase::Red));
    }
}
