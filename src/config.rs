//! Tunable thresholds and weights. Every section has documented defaults so a
//! config file only needs to name what it changes.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub matcher: MapMatcherConfig,
    pub validator: ValidatorConfig,
    pub aggregator: AggregatorConfig,
    pub priority: PriorityConfig,
    pub sweep: SweepConfig,
}

impl EngineConfig {
    /// Reads a JSON config file; missing sections and fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }
}

/// Candidate search and cost function
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapMatcherConfig {
    /// Candidate search radius (meters)
    pub search_radius: f64,
    /// Weight for normalized distance in the cost
    pub distance_weight: f64,
    /// Weight for normalized heading difference, ignored without a heading
    pub heading_weight: f64,
    /// Best and second-best costs closer than this flag the match for review
    pub ambiguity_margin: f64,
    /// Maximum number of candidates considered per observation
    pub max_candidates: usize,
}

impl Default for MapMatcherConfig {
    fn default() -> Self {
        Self {
            search_radius: 25.0,
            distance_weight: 0.7,
            heading_weight: 0.3,
            ambiguity_margin: 0.1,
            max_candidates: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Maximum accepted distance to the segment (meters)
    pub max_distance: f64,
    /// Maximum accepted heading difference when heading is known (degrees)
    pub max_heading_diff: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_distance: 15.0,
            max_heading_diff: 45.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Attempts for a segment write before the error is surfaced
    pub max_write_attempts: u32,
    /// First retry delay, doubled on every attempt (milliseconds)
    pub retry_base_delay_ms: u64,
    /// Bounded queue size of each segment worker
    pub queue_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: 5,
            retry_base_delay_ms: 20,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub severity: f64,
    pub traffic: f64,
    pub density: f64,
    pub age: f64,
    pub accessibility: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            severity: 0.35,
            traffic: 0.25,
            density: 0.20,
            age: 0.15,
            accessibility: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self {
            critical: 80.0,
            high: 60.0,
            medium: 40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub weights: PriorityWeights,
    pub thresholds: PriorityThresholds,
    /// Value used for any component whose input is unknown
    pub midpoint_score: f64,
    /// Density points per defect per kilometer
    pub density_points_per_defect_km: f64,
    /// Shortest length used for density, keeps tiny segments from saturating (meters)
    pub min_density_length_meters: f64,
    /// Days without maintenance that saturate the age component
    pub age_saturation_days: f64,
    /// Base repair cost per defect
    pub base_cost_per_defect: f64,
    /// Crew hours per defect before the road-type multiplier
    pub hours_per_defect: f64,
    pub work_day_hours: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            weights: PriorityWeights::default(),
            thresholds: PriorityThresholds::default(),
            midpoint_score: 50.0,
            density_points_per_defect_km: 20.0,
            min_density_length_meters: 100.0,
            age_saturation_days: 365.0,
            base_cost_per_defect: 500.0,
            hours_per_defect: 4.0,
            work_day_hours: 8.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between full recompute sweeps, 0 disables the sweep
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
        }
    }
}
