pub mod prelude;

pub mod maintenance_tasks;
pub mod match_results;
pub mod priority_scores;
pub mod road_segments;
pub mod sea_orm_active_enums;
pub mod segment_aggregates;
pub mod segment_observations;
