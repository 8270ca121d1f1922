//! Results collection and output for corridor experiments.
//!
//! Captures the control trace rather than traffic performance:
//! - Per-period activation state, commanded rate and queue override per ramp
//! - Queue estimate against the simulated queue
//! - Mainline occupancy at each ramp's downstream station
//! - Per-ramp totals (spillback, clamped commands)

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use metering_kernel::ActivationStatus;

/// Configuration for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Control plane that evaluated the periods ("sync" or "actors")
    pub engine: String,
    pub ramps: usize,
    pub coordination_enabled: bool,
    pub queue_override_enabled: bool,
    pub penetration_rate: f64,
    pub total_time_s: f64,
    /// Trial number (for repeated experiments)
    pub trial: usize,
    pub seed: Option<u64>,
    pub scenario_id: String,
}

impl ExperimentConfig {
    /// Key grouping trials of the same configuration.
    pub fn key(&self) -> String {
        format!(
            "{}:coord={}:override={}:penetration={:.2}",
            self.engine, self.coordination_enabled, self.queue_override_enabled, self.penetration_rate
        )
    }
}

/// One ramp in one control period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampSample {
    pub ramp: String,
    pub status: ActivationStatus,
    /// Local rate (veh/h); not applied while inactive
    pub rate: f64,
    pub queue_override_active: bool,
    pub estimated_queue: f64,
    pub true_queue: usize,
    pub downstream_occupancy: f64,
}

impl RampSample {
    pub fn queue_error(&self) -> f64 {
        (self.estimated_queue - self.true_queue as f64).abs()
    }
}

/// Metrics for a single control period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodMetrics {
    pub period: u64,
    pub time_s: f64,
    pub active_ramps: usize,
    pub override_ramps: usize,
    pub mean_occupancy: f64,
    pub max_occupancy: f64,
    pub ramps: Vec<RampSample>,
}

impl PeriodMetrics {
    pub fn from_samples(period: u64, time_s: f64, ramps: Vec<RampSample>) -> Self {
        let n = ramps.len().max(1) as f64;
        let active_ramps = ramps
            .iter()
            .filter(|r| r.status == ActivationStatus::Active)
            .count();
        let override_ramps = ramps.iter().filter(|r| r.queue_override_active).count();
        let mean_occupancy = ramps.iter().map(|r| r.downstream_occupancy).sum::<f64>() / n;
        let max_occupancy = ramps
            .iter()
            .map(|r| r.downstream_occupancy)
            .fold(0.0, f64::max);
        Self {
            period,
            time_s,
            active_ramps,
            override_ramps,
            mean_occupancy,
            max_occupancy,
            ramps,
        }
    }
}

/// Whole-run figures for one ramp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampSummary {
    pub ramp: String,
    /// Share of periods spent metering
    pub active_fraction: f64,
    pub override_periods: usize,
    /// Mean commanded rate over active periods (veh/h)
    pub mean_active_rate: f64,
    pub mean_queue_error: f64,
    pub max_queue: usize,
    pub spillback_ticks: u64,
    pub arrivals: u64,
    pub departures: u64,
    pub clamped_commands: u64,
}

/// Results from a single experiment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub run_id: String,
    pub config: ExperimentConfig,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_ticks: u64,
    pub total_periods: u64,
    /// Mean downstream occupancy over all ramps and periods
    pub mean_occupancy: f64,
    pub peak_occupancy: f64,
    /// Mean absolute difference between estimated and simulated queues
    pub mean_queue_error: f64,
    pub mean_active_fraction: f64,
    pub total_spillback_ticks: u64,
    pub ramp_summaries: Vec<RampSummary>,
    pub period_metrics: Vec<PeriodMetrics>,
}

impl ExperimentResult {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Aggregate results from a grid of runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridResults {
    pub results: Vec<ExperimentResult>,
    /// Summary statistics by configuration key
    pub summary: HashMap<String, ConfigSummary>,
}

/// Summary statistics for a configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub config_key: String,
    pub trials: usize,
    pub mean_occupancy: f64,
    pub mean_occupancy_se: f64,
    /// 95% confidence interval: (lower, upper)
    pub mean_occupancy_ci: (f64, f64),
    pub peak_occupancy: f64,
    pub mean_queue_error: f64,
    pub mean_queue_error_se: f64,
    pub mean_active_fraction: f64,
    pub mean_spillback_ticks: f64,
}

/// Mean and standard error (0 with fewer than two samples).
fn mean_se(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt() / n.sqrt())
}

impl GridResults {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            summary: HashMap::new(),
        }
    }

    pub fn add(&mut self, result: ExperimentResult) {
        self.results.push(result);
    }

    /// Recompute summary statistics from scratch.
    pub fn compute_summary(&mut self) {
        let mut by_config: HashMap<String, Vec<&ExperimentResult>> = HashMap::new();
        for result in &self.results {
            by_config.entry(result.config.key()).or_default().push(result);
        }

        self.summary.clear();
        for (key, results) in by_config {
            let occupancy: Vec<f64> = results.iter().map(|r| r.mean_occupancy).collect();
            let queue_error: Vec<f64> = results.iter().map(|r| r.mean_queue_error).collect();
            let active: Vec<f64> = results.iter().map(|r| r.mean_active_fraction).collect();
            let spillback: Vec<f64> = results
                .iter()
                .map(|r| r.total_spillback_ticks as f64)
                .collect();

            let (mean_occupancy, mean_occupancy_se) = mean_se(&occupancy);
            let (mean_queue_error, mean_queue_error_se) = mean_se(&queue_error);
            let z = 1.96;

            self.summary.insert(
                key.clone(),
                ConfigSummary {
                    config_key: key,
                    trials: results.len(),
                    mean_occupancy,
                    mean_occupancy_se,
                    mean_occupancy_ci: (
                        (mean_occupancy - z * mean_occupancy_se).max(0.0),
                        (mean_occupancy + z * mean_occupancy_se).min(1.0),
                    ),
                    peak_occupancy: results.iter().map(|r| r.peak_occupancy).fold(0.0, f64::max),
                    mean_queue_error,
                    mean_queue_error_se,
                    mean_active_fraction: mean_se(&active).0,
                    mean_spillback_ticks: mean_se(&spillback).0,
                },
            );
        }
    }

    /// Summaries ordered by key, for stable printing.
    pub fn sorted_summaries(&self) -> Vec<&ConfigSummary> {
        let mut summaries: Vec<_> = self.summary.values().collect();
        summaries.sort_by(|a, b| a.config_key.cmp(&b.config_key));
        summaries
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Default for GridResults {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a duration in milliseconds for display.
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{:.1}m", ms as f64 / 60_000.0)
    }
}
