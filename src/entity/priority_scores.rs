use sea_orm::entity::prelude::*;

use super::sea_orm_active_enums::PriorityLevel;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "priority_scores")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub segment_id: i64,
    #[sea_orm(column_type = "Double")]
    pub severity_score: f64,
    #[sea_orm(column_type = "Double")]
    pub traffic_score: f64,
    #[sea_orm(column_type = "Double")]
    pub density_score: f64,
    #[sea_orm(column_type = "Double")]
    pub age_score: f64,
    #[sea_orm(column_type = "Double")]
    pub accessibility_score: f64,
    #[sea_orm(column_type = "Double")]
    pub total_score: f64,
    pub priority_level: PriorityLevel,
    pub defect_count: i32,
    #[sea_orm(column_type = "Double")]
    pub avg_severity: f64,
    #[sea_orm(column_type = "Double")]
    pub max_severity: f64,
    #[sea_orm(column_type = "Double")]
    pub estimated_cost: f64,
    pub estimated_duration_days: i32,
    pub version: i64,
    pub calculated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
