//! Per-period aggregation of detector station output.
//!
//! Every tick the kernel feeds each ramp's stations into the aggregator; at a
//! control boundary the aggregator turns the accumulated window into the
//! occupancy, demand and queue-presence fields of a [`MeasurementBundle`].
//! A tick with no observation is a gap: it lowers nothing and raises nothing.

use serde::{Deserialize, Serialize};

use crate::corridor::RampId;
use crate::environment::{StationObservation, StationRole};
use crate::error::{KernelError, Result};
use crate::measurement::MeasurementBundle;

/// Accumulated readings of one station since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StationWindow {
    pub occupancy_sum: f64,
    pub occupancy_samples: u32,
    /// Vehicles counted over the window
    pub vehicles: f64,
    /// Ticks elapsed, with or without data
    pub ticks: u32,
    pub queue_indicator: bool,
}

impl StationWindow {
    fn record(&mut self, observation: Option<&StationObservation>) {
        self.ticks += 1;
        let Some(obs) = observation else {
            return;
        };
        if obs.edge_occupancy.is_finite() {
            self.occupancy_sum += obs.edge_occupancy.clamp(0.0, 1.0);
            self.occupancy_samples += 1;
        }
        if obs.edge_flow.is_finite() && obs.edge_flow > 0.0 {
            self.vehicles += obs.edge_flow;
        }
        self.queue_indicator |= obs.queue_indicator;
    }

    /// Mean occupancy over the ticks that reported; zero with no data.
    pub fn mean_occupancy(&self) -> f64 {
        if self.occupancy_samples == 0 {
            0.0
        } else {
            self.occupancy_sum / f64::from(self.occupancy_samples)
        }
    }

    /// Counted vehicles as an hourly flow over the whole window.
    pub fn flow_per_hour(&self, tick_seconds: f64) -> f64 {
        let seconds = f64::from(self.ticks) * tick_seconds;
        if seconds <= 0.0 {
            0.0
        } else {
            self.vehicles * 3600.0 / seconds
        }
    }
}

/// Control-period windows for the mainline, entry and exit stations of
/// every ramp.
#[derive(Debug, Clone)]
pub struct StationAggregator {
    tick_seconds: f64,
    windows: Vec<[StationWindow; 3]>,
}

impl StationAggregator {
    pub fn new(ramp_count: usize, tick_seconds: f64) -> Self {
        Self {
            tick_seconds,
            windows: vec![[StationWindow::default(); 3]; ramp_count],
        }
    }

    /// Add one tick of a station's output (or its absence).
    pub fn record(
        &mut self,
        ramp: RampId,
        role: StationRole,
        observation: Option<&StationObservation>,
    ) -> Result<()> {
        let len = self.windows.len();
        let windows = self
            .windows
            .get_mut(ramp.index())
            .ok_or(KernelError::RampOutOfBounds {
                index: ramp.index(),
                len,
            })?;
        windows[slot(role)].record(observation);
        Ok(())
    }

    pub fn window(&self, ramp: RampId, role: StationRole) -> Option<&StationWindow> {
        self.windows.get(ramp.index()).map(|w| &w[slot(role)])
    }

    /// Bundle for one ramp from the current windows and a queue estimate.
    pub fn bundle(&self, ramp: RampId, queue_length: f64) -> Result<MeasurementBundle> {
        let windows = self
            .windows
            .get(ramp.index())
            .ok_or(KernelError::RampOutOfBounds {
                index: ramp.index(),
                len: self.windows.len(),
            })?;
        let mainline = &windows[slot(StationRole::Mainline)];
        let entry = &windows[slot(StationRole::Entry)];

        Ok(MeasurementBundle {
            ramp,
            downstream_occupancy: mainline.mean_occupancy(),
            queue_length,
            demand: entry.flow_per_hour(self.tick_seconds),
            queue_present: entry.queue_indicator,
        })
    }

    /// Start a new control period.
    pub fn reset(&mut self) {
        for windows in &mut self.windows {
            *windows = [StationWindow::default(); 3];
        }
    }
}

fn slot(role: StationRole) -> usize {
    match role {
        StationRole::Mainline => 0,
        StationRole::Entry => 1,
        StationRole::Exit => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(flow: f64, occupancy: f64, queue: bool) -> StationObservation {
        StationObservation {
            edge_flow: flow,
            edge_occupancy: occupancy,
            queue_indicator: queue,
            ..Default::default()
        }
    }

    #[test]
    fn test_bundle_averages_occupancy_and_scales_flow() {
        let mut agg = StationAggregator::new(1, 1.0);
        let ramp = RampId(0);
        for occ in [0.1, 0.2, 0.3] {
            agg.record(ramp, StationRole::Mainline, Some(&obs(0.0, occ, false)))
                .unwrap();
        }
        for flow in [1.0, 0.0, 2.0] {
            agg.record(ramp, StationRole::Entry, Some(&obs(flow, 0.0, false)))
                .unwrap();
        }

        let bundle = agg.bundle(ramp, 7.0).unwrap();
        assert!((bundle.downstream_occupancy - 0.2).abs() < 1e-9);
        // 3 vehicles in 3 s
        assert!((bundle.demand - 3600.0).abs() < 1e-9);
        assert_eq!(bundle.queue_length, 7.0);
        assert!(!bundle.queue_present);
    }

    #[test]
    fn test_gaps_default_to_zero() {
        let mut agg = StationAggregator::new(2, 1.0);
        agg.record(RampId(1), StationRole::Mainline, None).unwrap();
        agg.record(RampId(1), StationRole::Entry, None).unwrap();
        let bundle = agg.bundle(RampId(1), 0.0).unwrap();
        assert_eq!(bundle.downstream_occupancy, 0.0);
        assert_eq!(bundle.demand, 0.0);
    }

    #[test]
    fn test_gap_ticks_do_not_dilute_occupancy() {
        let mut agg = StationAggregator::new(1, 1.0);
        agg.record(RampId(0), StationRole::Mainline, Some(&obs(0.0, 0.4, false)))
            .unwrap();
        agg.record(RampId(0), StationRole::Mainline, None).unwrap();
        let window = agg.window(RampId(0), StationRole::Mainline).unwrap();
        assert_eq!(window.ticks, 2);
        assert!((window.mean_occupancy() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_queue_indicator_latches_for_period() {
        let mut agg = StationAggregator::new(1, 1.0);
        agg.record(RampId(0), StationRole::Entry, Some(&obs(0.0, 0.0, true)))
            .unwrap();
        agg.record(RampId(0), StationRole::Entry, Some(&obs(0.0, 0.0, false)))
            .unwrap();
        assert!(agg.bundle(RampId(0), 0.0).unwrap().queue_present);

        agg.reset();
        assert!(!agg.bundle(RampId(0), 0.0).unwrap().queue_present);
    }

    #[test]
    fn test_unknown_ramp_is_an_error() {
        let mut agg = StationAggregator::new(1, 1.0);
        assert!(matches!(
            agg.record(RampId(4), StationRole::Exit, None),
            Err(KernelError::RampOutOfBounds { index: 4, len: 1 })
        ));
        assert!(agg.bundle(RampId(4), 0.0).is_err());
    }
}
