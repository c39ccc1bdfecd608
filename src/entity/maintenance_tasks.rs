use sea_orm::entity::prelude::*;

use super::sea_orm_active_enums::{TaskStatus, TaskType};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "maintenance_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub segment_id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[sea_orm(column_type = "Double")]
    pub priority_score: f64,
    #[sea_orm(column_type = "Double", nullable)]
    pub estimated_cost: Option<f64>,
    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,
    pub scheduled_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
