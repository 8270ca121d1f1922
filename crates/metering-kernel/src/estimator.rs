//! QueueEstimator: ramp queue lengths from vehicle reports and loop counts.
//!
//! Connected vehicles report their position; only a fraction of the fleet
//! does, so report counts are scaled by the penetration rate. Loop detectors
//! at the ramp entry and stop line give a conservation estimate that drifts
//! but never goes silent. Each window fuses the two according to how many
//! distinct vehicles reported from the queue segment.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{EstimatorConfig, FusionConfig, QueueSegmentConfig};
use crate::corridor::{Corridor, RampId};
use crate::environment::{RawVehicleReport, StationObservation};
use crate::error::{KernelError, Result};
use crate::measurement::{EstimateSource, QueueEstimate};

/// Vehicle class parsed from a simulator type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    Car,
    Hov,
    LightTruck,
    HeavyTruck,
    Other,
}

impl VehicleClass {
    /// Parse a type string such as `"car_cv"` or `"heavyTruck"`.
    ///
    /// Returns the class and whether the vehicle is connected (a `cv` token).
    pub fn classify(raw: &str) -> (VehicleClass, bool) {
        let mut class = VehicleClass::Other;
        let mut connected = false;
        for token in raw.split(['_', '-', '.']) {
            match token.to_ascii_lowercase().as_str() {
                "cv" => connected = true,
                "car" if class == VehicleClass::Other => class = VehicleClass::Car,
                "hov" if class == VehicleClass::Other => class = VehicleClass::Hov,
                "lighttruck" if class == VehicleClass::Other => class = VehicleClass::LightTruck,
                "heavytruck" if class == VehicleClass::Other => class = VehicleClass::HeavyTruck,
                _ => {}
            }
        }
        (class, connected)
    }
}

/// A connected-vehicle report with its lane id already split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleReport {
    pub id: String,
    pub class: VehicleClass,
    pub link: String,
    pub lane_index: u32,
    pub position: f64,
    pub timestamp: f64,
}

impl VehicleReport {
    /// `None` for non-connected vehicles and unparseable lane ids.
    pub fn from_raw(raw: &RawVehicleReport) -> Option<Self> {
        let (class, connected) = VehicleClass::classify(&raw.vehicle_type);
        if !connected {
            return None;
        }
        let (link, lane) = raw.lane.rsplit_once('_')?;
        let lane_index = lane.parse().ok()?;
        if !raw.position.is_finite() || !raw.timestamp.is_finite() {
            return None;
        }
        Some(Self {
            id: raw.id.clone(),
            class,
            link: link.to_string(),
            lane_index,
            position: raw.position,
            timestamp: raw.timestamp,
        })
    }
}

/// Everything one ramp accumulated since the last publication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RampWindow {
    /// Distinct vehicles seen in the segment, per report timestamp (ms)
    pub snapshots: BTreeMap<i64, BTreeSet<String>>,
    /// Vehicles that joined the queue (entry station)
    pub entries: f64,
    /// Vehicles that left through the meter (exit station)
    pub exits: f64,
    pub entry_occupancy_sum: f64,
    pub entry_occupancy_samples: u32,
}

impl RampWindow {
    fn add_report(&mut self, report: &VehicleReport) {
        self.snapshots
            .entry(millis(report.timestamp))
            .or_default()
            .insert(report.id.clone());
    }

    /// Drop snapshots stamped outside `[start_ms, end_ms)`. Returns how many
    /// reports were dropped.
    fn retain_window(&mut self, start_ms: i64, end_ms: i64) -> usize {
        let mut dropped = 0;
        self.snapshots.retain(|&t, ids| {
            let keep = (start_ms..end_ms).contains(&t);
            if !keep {
                dropped += ids.len();
            }
            keep
        });
        dropped
    }

    fn add_loops(&mut self, entry: Option<&StationObservation>, exit: Option<&StationObservation>) {
        if let Some(obs) = entry {
            self.entries += count(obs.edge_flow);
            if obs.edge_occupancy.is_finite() {
                self.entry_occupancy_sum += obs.edge_occupancy.clamp(0.0, 1.0);
                self.entry_occupancy_samples += 1;
            }
        }
        if let Some(obs) = exit {
            self.exits += count(obs.edge_flow);
        }
    }

    /// Distinct vehicles that reported from the segment during the window.
    pub fn distinct_vehicles(&self) -> usize {
        self.snapshots
            .values()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Largest number of vehicles seen in the segment at one instant.
    pub fn peak_snapshot(&self) -> usize {
        self.snapshots.values().map(BTreeSet::len).max().unwrap_or(0)
    }

    pub fn mean_entry_occupancy(&self) -> f64 {
        if self.entry_occupancy_samples == 0 {
            0.0
        } else {
            self.entry_occupancy_sum / f64::from(self.entry_occupancy_samples)
        }
    }
}

fn millis(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

fn count(flow: f64) -> f64 {
    if flow.is_finite() && flow > 0.0 { flow } else { 0.0 }
}

/// Fusion parameters resolved from configuration once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionParams {
    pub penetration_rate: f64,
    pub fusion: FusionConfig,
    pub spillback_occupancy: Option<f64>,
    pub spillback_fill_fraction: f64,
}

impl FusionParams {
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            penetration_rate: config.penetration_rate,
            fusion: config.active_fusion().clone(),
            spillback_occupancy: config.spillback_occupancy,
            spillback_fill_fraction: config.spillback_fill_fraction,
        }
    }

    /// Weight of the report estimate for `n` distinct reporting vehicles.
    pub fn report_weight(&self, n: usize) -> f64 {
        let f = &self.fusion;
        if n < f.min_reports {
            0.0
        } else if n >= f.full_trust_reports {
            1.0
        } else {
            let span = (f.full_trust_reports - f.min_reports) as f64;
            let progress = (n - f.min_reports) as f64 / span;
            f.sparse_report_weight + (1.0 - f.sparse_report_weight) * progress
        }
    }
}

/// Result of fusing one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowEstimate {
    pub count: f64,
    pub source: EstimateSource,
    pub matched_vehicles: usize,
}

/// Fuse a window against the previous published count.
///
/// Pure: the same window and previous count always give the same estimate.
pub fn estimate_window(
    window: &RampWindow,
    previous: f64,
    capacity: f64,
    params: &FusionParams,
) -> WindowEstimate {
    let mut loop_estimate = (previous + window.entries - window.exits).max(0.0);
    let spilling = params.spillback_occupancy.is_some_and(|threshold| {
        window.entry_occupancy_samples > 0 && window.mean_entry_occupancy() >= threshold
    });
    if spilling {
        loop_estimate = loop_estimate.max(params.spillback_fill_fraction * capacity);
    }

    let matched_vehicles = window.distinct_vehicles();
    let weight = params.report_weight(matched_vehicles);
    let report_estimate = window.peak_snapshot() as f64 / params.penetration_rate;

    let (raw, source) = if weight <= 0.0 {
        (loop_estimate, EstimateSource::Loops)
    } else if weight >= 1.0 {
        (report_estimate, EstimateSource::Reports)
    } else {
        (
            weight * report_estimate + (1.0 - weight) * loop_estimate,
            EstimateSource::Blended,
        )
    };

    WindowEstimate {
        count: raw.round().clamp(0.0, capacity),
        source,
        matched_vehicles,
    }
}

/// Per-ramp queue estimator with a fixed publication cadence.
#[derive(Debug, Clone)]
pub struct QueueEstimator {
    params: FusionParams,
    capacities: Vec<f64>,
    /// link id -> (ramp, segment) pairs covering that link
    segments: HashMap<String, Vec<(RampId, QueueSegmentConfig)>>,
    windows: Vec<RampWindow>,
    last: Vec<QueueEstimate>,
    window_start_s: f64,
    dropped_reports: u64,
    out_of_window_reports: u64,
}

impl QueueEstimator {
    pub fn new(corridor: &Corridor, config: &EstimatorConfig) -> Result<Self> {
        let mut segments: HashMap<String, Vec<(RampId, QueueSegmentConfig)>> = HashMap::new();
        for (name, segment) in &config.segments {
            let ramp = corridor.id_of(name).ok_or_else(|| KernelError::UnknownRamp {
                section: "estimator.segments",
                name: name.clone(),
            })?;
            segments
                .entry(segment.link.clone())
                .or_default()
                .push((ramp, segment.clone()));
        }

        let last = corridor
            .ids()
            .map(|ramp| QueueEstimate {
                ramp,
                count: 0.0,
                source: EstimateSource::Loops,
                matched_vehicles: 0,
                window_start_s: 0.0,
                window_end_s: 0.0,
            })
            .collect();

        Ok(Self {
            params: FusionParams::from_config(config),
            capacities: corridor
                .ramps()
                .iter()
                .map(|r| f64::from(r.storage_capacity))
                .collect(),
            segments,
            windows: vec![RampWindow::default(); corridor.len()],
            last,
            window_start_s: 0.0,
            dropped_reports: 0,
            out_of_window_reports: 0,
        })
    }

    pub fn params(&self) -> &FusionParams {
        &self.params
    }

    /// Match reports to queue segments. Returns how many were matched.
    pub fn ingest_reports(&mut self, reports: &[RawVehicleReport]) -> usize {
        let mut matched = 0;
        for raw in reports {
            let Some(report) = VehicleReport::from_raw(raw) else {
                if VehicleClass::classify(&raw.vehicle_type).1 {
                    self.dropped_reports += 1;
                    warn!(vehicle = %raw.id, lane = %raw.lane, "Dropping malformed vehicle report");
                }
                continue;
            };
            let Some(candidates) = self.segments.get(&report.link) else {
                continue;
            };
            for (ramp, segment) in candidates {
                let in_lane = segment.lanes.is_empty() || segment.lanes.contains(&report.lane_index);
                let in_range = (segment.start_m..=segment.end_m).contains(&report.position);
                if in_lane && in_range {
                    self.windows[ramp.index()].add_report(&report);
                    matched += 1;
                }
            }
        }
        matched
    }

    /// Add one tick of entry and exit detector output for a ramp.
    pub fn ingest_loops(
        &mut self,
        ramp: RampId,
        entry: Option<&StationObservation>,
        exit: Option<&StationObservation>,
    ) -> Result<()> {
        let len = self.windows.len();
        self.windows
            .get_mut(ramp.index())
            .ok_or(KernelError::RampOutOfBounds {
                index: ramp.index(),
                len,
            })?
            .add_loops(entry, exit);
        Ok(())
    }

    /// Close the window `[window_start_s, now_s)`, publish one estimate per
    /// ramp and start a fresh window.
    ///
    /// Reports stamped outside the window are discarded, not counted.
    pub fn publish(&mut self, now_s: f64) -> &[QueueEstimate] {
        let (start_ms, end_ms) = (millis(self.window_start_s), millis(now_s));
        for (index, window) in self.windows.iter_mut().enumerate() {
            let stale = window.retain_window(start_ms, end_ms);
            if stale > 0 {
                self.out_of_window_reports += stale as u64;
                warn!(
                    ramp = %RampId(index),
                    reports = stale,
                    window_start_s = self.window_start_s,
                    window_end_s = now_s,
                    "Discarding vehicle reports stamped outside the window"
                );
            }
            let previous = self.last[index].count;
            let estimate = estimate_window(window, previous, self.capacities[index], &self.params);
            let ramp = RampId(index);
            debug!(
                ramp = %ramp,
                queue = estimate.count,
                source = ?estimate.source,
                reports = estimate.matched_vehicles,
                "Queue estimate"
            );
            self.last[index] = QueueEstimate {
                ramp,
                count: estimate.count,
                source: estimate.source,
                matched_vehicles: estimate.matched_vehicles,
                window_start_s: self.window_start_s,
                window_end_s: now_s,
            };
            *window = RampWindow::default();
        }
        self.window_start_s = now_s;
        &self.last
    }

    /// Most recent published estimates, indexed by `RampId`.
    pub fn last_estimates(&self) -> &[QueueEstimate] {
        &self.last
    }

    pub fn queue_length(&self, ramp: RampId) -> f64 {
        self.last.get(ramp.index()).map_or(0.0, |e| e.count)
    }

    /// Window currently being accumulated for a ramp.
    pub fn window(&self, ramp: RampId) -> Option<&RampWindow> {
        self.windows.get(ramp.index())
    }

    /// Connected-vehicle reports dropped for malformed lane or position data.
    pub fn dropped_reports(&self) -> u64 {
        self.dropped_reports
    }

    /// Matched reports discarded at publication for a timestamp outside the
    /// window being closed.
    pub fn out_of_window_reports(&self) -> u64 {
        self.out_of_window_reports
    }
}
