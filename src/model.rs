//! Domain types shared by the matcher, the aggregator and the scheduler.

use chrono::{DateTime, Utc};
use geo::{BoundingRect, Distance, Haversine, LineString, Point, Rect};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use crate::entity::sea_orm_active_enums::{MatchStatus, PriorityLevel, TaskStatus, TaskType};

pub type SegmentId = i64;

/// A road segment as supplied by the road-network provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoadSegment {
    pub id: SegmentId,
    pub name: Option<String>,
    pub road_type: String,
    /// WGS84 polyline, x = longitude, y = latitude
    pub geometry: LineString<f64>,
    pub length_meters: f64,
    /// 1-10, unknown when the provider has no traffic data
    pub traffic_importance: Option<u8>,
    pub is_oneway: bool,
    /// External 0-100 accessibility signal
    pub accessibility_score: Option<f64>,
    pub last_maintenance_at: Option<DateTime<Utc>>,
}

impl RoadSegment {
    pub fn bounding_box(&self) -> Option<Rect<f64>> {
        self.geometry.bounding_rect()
    }

    /// Haversine length of the polyline in meters
    pub fn geometric_length(&self) -> f64 {
        self.geometry
            .lines()
            .map(|line| Haversine.distance(Point::from(line.start), Point::from(line.end)))
            .sum()
    }

    /// Declared length, falling back to the geometry when the provider left it out.
    pub fn effective_length(&self) -> f64 {
        if self.length_meters.is_finite() && self.length_meters > 0.0 {
            self.length_meters
        } else {
            self.geometric_length()
        }
    }
}

/// A single defect detection produced upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefectObservation {
    pub id: Uuid,
    /// GPS fix, x = longitude, y = latitude
    pub location: Option<Point<f64>>,
    /// Compass heading of the vehicle in degrees
    pub heading: Option<f64>,
    pub defect_type: String,
    /// 0-10
    pub severity_score: f64,
    pub observed_at: DateTime<Utc>,
}

impl DefectObservation {
    /// The GPS fix if it is usable for matching.
    pub fn valid_location(&self) -> Option<Point<f64>> {
        self.location.filter(|p| {
            p.x().is_finite()
                && p.y().is_finite()
                && (-180.0..=180.0).contains(&p.x())
                && (-90.0..=90.0).contains(&p.y())
        })
    }

    pub fn valid_heading(&self) -> Option<f64> {
        self.heading
            .filter(|h| h.is_finite())
            .map(|h| h.rem_euclid(360.0))
    }
}

/// Outcome of matching one observation. Exactly one exists per observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub observation_id: Uuid,
    /// Selected segment, or the nearest rejected candidate for review
    pub segment_id: Option<SegmentId>,
    pub status: MatchStatus,
    pub matched_point: Option<Point<f64>>,
    pub distance_to_segment: Option<f64>,
    pub heading_diff: Option<f64>,
    pub confidence: f64,
    pub is_matched: bool,
    pub needs_review: bool,
}

impl MatchResult {
    pub fn unmatched(observation_id: Uuid, status: MatchStatus) -> Self {
        Self {
            observation_id,
            segment_id: None,
            status,
            matched_point: None,
            distance_to_segment: None,
            heading_diff: None,
            confidence: 0.0,
            is_matched: false,
            needs_review: true,
        }
    }

    /// Segment this result contributes to, if it was accepted.
    pub fn accepted_segment(&self) -> Option<SegmentId> {
        if self.is_matched { self.segment_id } else { None }
    }
}

/// Running per-segment defect statistics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentAggregate {
    pub segment_id: SegmentId,
    pub defect_count: u32,
    pub avg_severity: f64,
    pub max_severity: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriorityScore {
    pub segment_id: SegmentId,
    pub severity_score: f64,
    pub traffic_score: f64,
    pub density_score: f64,
    pub age_score: f64,
    pub accessibility_score: f64,
    pub total_score: f64,
    pub priority_level: PriorityLevel,
    pub defect_count: u32,
    pub avg_severity: f64,
    pub max_severity: f64,
    pub estimated_cost: f64,
    pub estimated_duration_days: u32,
    pub calculated_at: DateTime<Utc>,
}

impl PriorityScore {
    /// Compares everything except the computation timestamp.
    pub fn same_values(&self, other: &PriorityScore) -> bool {
        PriorityScore {
            calculated_at: other.calculated_at,
            ..self.clone()
        } == *other
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub id: Uuid,
    pub segment_id: SegmentId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority_score: f64,
    pub estimated_cost: Option<f64>,
    pub notes: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// PENDING -> SCHEDULED -> IN_PROGRESS -> COMPLETED, and any open task may be cancelled.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Scheduled) | (Scheduled, InProgress) | (InProgress, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl PriorityLevel {
    /// Levels that warrant a maintenance task.
    pub fn is_actionable(self) -> bool {
        self >= PriorityLevel::High
    }
}

impl std::fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PriorityLevel::Low => "LOW",
            PriorityLevel::Medium => "MEDIUM",
            PriorityLevel::High => "HIGH",
            PriorityLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PriorityLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(PriorityLevel::Low),
            "MEDIUM" => Ok(PriorityLevel::Medium),
            "HIGH" => Ok(PriorityLevel::High),
            "CRITICAL" => Ok(PriorityLevel::Critical),
            other => Err(format!("unknown priority level {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lifecycle_only_moves_forward() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(InProgress));
        assert!(!Scheduled.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(InProgress));
    }

    #[test]
    fn invalid_gps_is_not_usable() {
        let mut obs = DefectObservation {
            id: Uuid::new_v4(),
            location: Some(Point::new(2.35, 48.85)),
            heading: Some(-90.0),
            defect_type: "D40".to_string(),
            severity_score: 5.0,
            observed_at: Utc::now(),
        };
        assert!(obs.valid_location().is_some());
        assert_eq!(obs.valid_heading(), Some(270.0));

        obs.location = Some(Point::new(f64::NAN, 48.85));
        assert!(obs.valid_location().is_none());
        obs.location = Some(Point::new(2.35, 95.0));
        assert!(obs.valid_location().is_none());
        obs.location = None;
        assert!(obs.valid_location().is_none());
    }

    #[test]
    fn levels_are_ordered() {
        assert!(PriorityLevel::Critical > PriorityLevel::High);
        assert!(PriorityLevel::High.is_actionable());
        assert!(!PriorityLevel::Medium.is_actionable());
        assert_eq!("critical".parse::<PriorityLevel>(), Ok(PriorityLevel::Critical));
    }
}
