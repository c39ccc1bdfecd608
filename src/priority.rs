//! Composite maintenance priority.
//!
//! Every component is normalized to 0-100 and combined with configurable weights:
//!
//! ```text
//! total = 0.35 * severity + 0.25 * traffic + 0.20 * density + 0.15 * age + 0.05 * accessibility
//! ```
//!
//! The computation is a pure function of the aggregate, the segment metadata and the
//! reference time, so the same inputs always yield the same score.

use chrono::{DateTime, Utc};
use log::warn;

use crate::config::PriorityConfig;
use crate::model::{PriorityLevel, PriorityScore, RoadSegment, SegmentAggregate};

#[derive(Debug, Clone)]
pub struct PriorityCalculator {
    config: PriorityConfig,
}

impl PriorityCalculator {
    pub fn new(config: PriorityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    pub fn compute(
        &self,
        aggregate: &SegmentAggregate,
        segment: &RoadSegment,
        as_of: DateTime<Utc>,
    ) -> PriorityScore {
        let severity_score = self.severity_score(aggregate.avg_severity);
        let traffic_score = self.traffic_score(segment);
        let density_score = self.density_score(aggregate.defect_count, segment.effective_length());
        let age_score = self.age_score(segment.last_maintenance_at, as_of);
        let accessibility_score = self.accessibility_score(segment);

        let w = &self.config.weights;
        let total = w.severity * severity_score
            + w.traffic * traffic_score
            + w.density * density_score
            + w.age * age_score
            + w.accessibility * accessibility_score;
        let total_score = round2(total.clamp(0.0, 100.0));

        PriorityScore {
            segment_id: aggregate.segment_id,
            severity_score,
            traffic_score,
            density_score,
            age_score,
            accessibility_score,
            total_score,
            priority_level: self.level(total_score),
            defect_count: aggregate.defect_count,
            avg_severity: aggregate.avg_severity,
            max_severity: aggregate.max_severity,
            estimated_cost: self.estimate_cost(
                aggregate.defect_count,
                aggregate.avg_severity,
                &segment.road_type,
            ),
            estimated_duration_days: self
                .estimate_duration_days(aggregate.defect_count, &segment.road_type),
            // Never older than the aggregate it was computed from
            calculated_at: as_of.max(aggregate.updated_at),
        }
    }

    pub fn level(&self, total_score: f64) -> PriorityLevel {
        let t = &self.config.thresholds;
        if total_score >= t.critical {
            PriorityLevel::Critical
        } else if total_score >= t.high {
            PriorityLevel::High
        } else if total_score >= t.medium {
            PriorityLevel::Medium
        } else {
            PriorityLevel::Low
        }
    }

    /// Average severity (0-10) on the 0-100 scale
    pub fn severity_score(&self, avg_severity: f64) -> f64 {
        (avg_severity.clamp(0.0, 10.0) / 10.0) * 100.0
    }

    pub fn traffic_score(&self, segment: &RoadSegment) -> f64 {
        match segment.traffic_importance {
            Some(importance) => (f64::from(importance).clamp(0.0, 10.0) / 10.0) * 100.0,
            None => {
                warn!(
                    "Segment {} has no traffic importance, using {}",
                    segment.id, self.config.midpoint_score
                );
                self.config.midpoint_score
            }
        }
    }

    /// Defects per kilometer scaled and capped at 100
    pub fn density_score(&self, defect_count: u32, length_meters: f64) -> f64 {
        let length_km = length_meters.max(self.config.min_density_length_meters) / 1000.0;
        if length_km <= 0.0 {
            return self.config.midpoint_score;
        }
        let per_km = f64::from(defect_count) / length_km;
        (per_km * self.config.density_points_per_defect_km).min(100.0)
    }

    /// Whole days since the last maintenance, saturating at 100. Unknown history
    /// sits at the midpoint.
    pub fn age_score(&self, last_maintenance_at: Option<DateTime<Utc>>, as_of: DateTime<Utc>) -> f64 {
        let Some(last) = last_maintenance_at else {
            return self.config.midpoint_score;
        };
        let days = (as_of - last).num_days().max(0) as f64;
        if self.config.age_saturation_days <= 0.0 {
            return 100.0;
        }
        (days / self.config.age_saturation_days * 100.0).min(100.0)
    }

    pub fn accessibility_score(&self, segment: &RoadSegment) -> f64 {
        segment
            .accessibility_score
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(0.0, 100.0))
            .unwrap_or(self.config.midpoint_score)
    }

    pub fn estimate_cost(&self, defect_count: u32, avg_severity: f64, road_type: &str) -> f64 {
        let severity_multiplier = 1.0 + avg_severity.clamp(0.0, 10.0) / 10.0;
        round2(
            self.config.base_cost_per_defect
                * f64::from(defect_count)
                * severity_multiplier
                * cost_multiplier(road_type),
        )
    }

    pub fn estimate_duration_days(&self, defect_count: u32, road_type: &str) -> u32 {
        let hours = self.config.hours_per_defect * f64::from(defect_count) * duration_multiplier(road_type);
        let days = (hours / self.config.work_day_hours.max(1.0)).floor() as u32;
        days.max(1)
    }
}

fn cost_multiplier(road_type: &str) -> f64 {
    match road_type {
        "motorway" => 2.5,
        "trunk" => 2.0,
        "primary" => 1.8,
        "secondary" => 1.5,
        "tertiary" => 1.2,
        "residential" => 1.0,
        "unclassified" => 0.8,
        _ => 1.0,
    }
}

fn duration_multiplier(road_type: &str) -> f64 {
    match road_type {
        "motorway" => 2.0,
        "trunk" => 1.8,
        "primary" => 1.5,
        "secondary" => 1.2,
        "tertiary" => 1.0,
        "residential" | "unclassified" => 0.8,
        _ => 1.0,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
