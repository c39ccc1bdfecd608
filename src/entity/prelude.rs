pub use super::maintenance_tasks::Entity as MaintenanceTasks;
pub use super::match_results::Entity as MatchResults;
pub use super::priority_scores::Entity as PriorityScores;
pub use super::road_segments::Entity as RoadSegments;
pub use super::segment_aggregates::Entity as SegmentAggregates;
pub use super::segment_observations::Entity as SegmentObservations;
