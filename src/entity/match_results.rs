use sea_orm::entity::prelude::*;

use super::sea_orm_active_enums::MatchStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "match_results")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub observation_id: Uuid,
    pub segment_id: Option<i64>,
    pub status: MatchStatus,
    #[sea_orm(column_type = "Double", nullable)]
    pub latitude: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub longitude: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub heading: Option<f64>,
    pub defect_type: String,
    #[sea_orm(column_type = "Double")]
    pub severity_score: f64,
    pub observed_at: DateTimeWithTimeZone,
    #[sea_orm(column_type = "Double", nullable)]
    pub matched_latitude: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub matched_longitude: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub distance_to_segment: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub heading_diff: Option<f64>,
    #[sea_orm(column_type = "Double")]
    pub confidence: f64,
    pub is_matched: bool,
    pub needs_review: bool,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
