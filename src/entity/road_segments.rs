use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "road_segments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub name: Option<String>,
    pub road_type: String,
    #[sea_orm(column_type = "Json")]
    pub geometry: Json,
    #[sea_orm(column_type = "Double")]
    pub length_meters: f64,
    pub traffic_importance: Option<i32>,
    pub is_oneway: bool,
    #[sea_orm(column_type = "Double", nullable)]
    pub accessibility_score: Option<f64>,
    pub last_maintenance_at: Option<DateTimeWithTimeZone>,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
