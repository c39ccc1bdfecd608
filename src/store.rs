//! Row conversions and queries over the relational store.

use chrono::{DateTime, Utc};
use geo::{Distance, Haversine, LineString, Point};
use log::debug;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, Func, OnConflict, SimpleExpr};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use uuid::Uuid;

use crate::entity::{match_results, priority_scores, road_segments};
use crate::error::{EngineError, Result};
use crate::geometry::radius_to_degrees;
use crate::model::{
    DefectObservation, MatchResult, PriorityLevel, PriorityScore, RoadSegment, SegmentId,
};

fn utc(dt: DateTimeWithTimeZone) -> DateTime<Utc> {
    dt.with_timezone(&Utc)
}

pub fn segment_to_active(
    segment: &RoadSegment,
    now: DateTime<Utc>,
) -> Result<road_segments::ActiveModel> {
    let geometry = serde_json::to_value(&segment.geometry)
        .map_err(|e| EngineError::InvalidSegment(segment.id, e.to_string()))?;
    Ok(road_segments::ActiveModel {
        id: Set(segment.id),
        name: Set(segment.name.clone()),
        road_type: Set(segment.road_type.clone()),
        geometry: Set(geometry),
        length_meters: Set(segment.effective_length()),
        traffic_importance: Set(segment.traffic_importance.map(i32::from)),
        is_oneway: Set(segment.is_oneway),
        accessibility_score: Set(segment.accessibility_score),
        last_maintenance_at: Set(segment.last_maintenance_at.map(Into::into)),
        updated_at: Set(now.into()),
    })
}

pub fn segment_from_model(model: road_segments::Model) -> Result<RoadSegment> {
    let geometry: LineString<f64> = serde_json::from_value(model.geometry).map_err(|e| {
        EngineError::Corrupt(format!("segment {} geometry: {}", model.id, e))
    })?;
    let traffic_importance = model
        .traffic_importance
        .map(|v| {
            u8::try_from(v).map_err(|_| {
                EngineError::Corrupt(format!("segment {} traffic importance {}", model.id, v))
            })
        })
        .transpose()?;
    Ok(RoadSegment {
        id: model.id,
        name: model.name,
        road_type: model.road_type,
        geometry,
        length_meters: model.length_meters,
        traffic_importance,
        is_oneway: model.is_oneway,
        accessibility_score: model.accessibility_score,
        last_maintenance_at: model.last_maintenance_at.map(utc),
    })
}

/// Inserts or replaces segments by id in chunks.
pub async fn upsert_segments<C: ConnectionTrait>(db: &C, segments: &[RoadSegment]) -> Result<()> {
    let now = Utc::now();
    for chunk in segments.chunks(500) {
        let models = chunk
            .iter()
            .map(|s| segment_to_active(s, now))
            .collect::<Result<Vec<_>>>()?;
        road_segments::Entity::insert_many(models)
            .on_conflict(
                OnConflict::column(road_segments::Column::Id)
                    .update_columns([
                        road_segments::Column::Name,
                        road_segments::Column::RoadType,
                        road_segments::Column::Geometry,
                        road_segments::Column::LengthMeters,
                        road_segments::Column::TrafficImportance,
                        road_segments::Column::IsOneway,
                        road_segments::Column::AccessibilityScore,
                        road_segments::Column::LastMaintenanceAt,
                        road_segments::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;
    }
    debug!("Upserted {} road segments", segments.len());
    Ok(())
}

pub async fn load_segments<C: ConnectionTrait>(db: &C) -> Result<Vec<RoadSegment>> {
    road_segments::Entity::find()
        .order_by_asc(road_segments::Column::Id)
        .all(db)
        .await?
        .into_iter()
        .map(segment_from_model)
        .collect()
}

pub async fn load_segment<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
) -> Result<Option<RoadSegment>> {
    road_segments::Entity::find_by_id(segment_id)
        .one(db)
        .await?
        .map(segment_from_model)
        .transpose()
}

pub async fn set_last_maintenance<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
    at: DateTime<Utc>,
) -> Result<()> {
    let result = road_segments::Entity::update_many()
        .col_expr(
            road_segments::Column::LastMaintenanceAt,
            Expr::value(DateTimeWithTimeZone::from(at)),
        )
        .col_expr(
            road_segments::Column::UpdatedAt,
            Expr::value(DateTimeWithTimeZone::from(Utc::now())),
        )
        .filter(road_segments::Column::Id.eq(segment_id))
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(EngineError::SegmentNotFound(segment_id));
    }
    Ok(())
}

/// A persisted match with the observation it was computed from.
#[derive(Clone, Debug)]
pub struct StoredMatch {
    pub observation: DefectObservation,
    pub result: MatchResult,
    pub updated_at: DateTime<Utc>,
}

fn match_from_model(model: match_results::Model) -> StoredMatch {
    let location = model
        .longitude
        .zip(model.latitude)
        .map(|(lon, lat)| Point::new(lon, lat));
    let matched_point = model
        .matched_longitude
        .zip(model.matched_latitude)
        .map(|(lon, lat)| Point::new(lon, lat));
    StoredMatch {
        observation: DefectObservation {
            id: model.observation_id,
            location,
            heading: model.heading,
            defect_type: model.defect_type,
            severity_score: model.severity_score,
            observed_at: utc(model.observed_at),
        },
        result: MatchResult {
            observation_id: model.observation_id,
            segment_id: model.segment_id,
            status: model.status,
            matched_point,
            distance_to_segment: model.distance_to_segment,
            heading_diff: model.heading_diff,
            confidence: model.confidence,
            is_matched: model.is_matched,
            needs_review: model.needs_review,
        },
        updated_at: utc(model.updated_at),
    }
}

/// Writes the one result row of an observation, overwriting any earlier result.
/// Returns the previously stored result, if any.
pub async fn upsert_match<C: ConnectionTrait>(
    db: &C,
    observation: &DefectObservation,
    result: &MatchResult,
) -> Result<Option<MatchResult>> {
    let previous = match_results::Entity::find_by_id(observation.id)
        .one(db)
        .await?
        .map(|m| match_from_model(m).result);

    let now: DateTimeWithTimeZone = Utc::now().into();
    let model = match_results::ActiveModel {
        observation_id: Set(observation.id),
        segment_id: Set(result.segment_id),
        status: Set(result.status),
        latitude: Set(observation.location.map(|p| p.y())),
        longitude: Set(observation.location.map(|p| p.x())),
        heading: Set(observation.heading),
        defect_type: Set(observation.defect_type.clone()),
        severity_score: Set(observation.severity_score),
        observed_at: Set(observation.observed_at.into()),
        matched_latitude: Set(result.matched_point.map(|p| p.y())),
        matched_longitude: Set(result.matched_point.map(|p| p.x())),
        distance_to_segment: Set(result.distance_to_segment),
        heading_diff: Set(result.heading_diff),
        confidence: Set(result.confidence),
        is_matched: Set(result.is_matched),
        needs_review: Set(result.needs_review),
        created_at: Set(now),
        updated_at: Set(now),
    };

    match_results::Entity::insert(model)
        .on_conflict(
            OnConflict::column(match_results::Column::ObservationId)
                .update_columns([
                    match_results::Column::SegmentId,
                    match_results::Column::Status,
                    match_results::Column::Latitude,
                    match_results::Column::Longitude,
                    match_results::Column::Heading,
                    match_results::Column::DefectType,
                    match_results::Column::SeverityScore,
                    match_results::Column::ObservedAt,
                    match_results::Column::MatchedLatitude,
                    match_results::Column::MatchedLongitude,
                    match_results::Column::DistanceToSegment,
                    match_results::Column::HeadingDiff,
                    match_results::Column::Confidence,
                    match_results::Column::IsMatched,
                    match_results::Column::NeedsReview,
                    match_results::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(previous)
}

pub async fn find_match<C: ConnectionTrait>(
    db: &C,
    observation_id: Uuid,
) -> Result<Option<StoredMatch>> {
    Ok(match_results::Entity::find_by_id(observation_id)
        .one(db)
        .await?
        .map(match_from_model))
}

/// Results flagged for a human, oldest first.
pub async fn review_queue<C: ConnectionTrait>(db: &C, limit: u64) -> Result<Vec<StoredMatch>> {
    Ok(match_results::Entity::find()
        .filter(match_results::Column::NeedsReview.eq(true))
        .order_by_asc(match_results::Column::ObservedAt)
        .order_by_asc(match_results::Column::ObservationId)
        .limit(limit)
        .all(db)
        .await?
        .into_iter()
        .map(match_from_model)
        .collect())
}

/// Results that were not accepted outright: candidates for re-matching after a reload.
pub async fn unresolved<C: ConnectionTrait>(db: &C) -> Result<Vec<StoredMatch>> {
    Ok(match_results::Entity::find()
        .filter(
            match_results::Column::IsMatched
                .eq(false)
                .or(match_results::Column::NeedsReview.eq(true)),
        )
        .order_by_asc(match_results::Column::ObservedAt)
        .all(db)
        .await?
        .into_iter()
        .map(match_from_model)
        .collect())
}

pub async fn segment_defects<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
) -> Result<Vec<StoredMatch>> {
    Ok(match_results::Entity::find()
        .filter(match_results::Column::SegmentId.eq(segment_id))
        .filter(match_results::Column::IsMatched.eq(true))
        .order_by_desc(match_results::Column::ObservedAt)
        .all(db)
        .await?
        .into_iter()
        .map(match_from_model)
        .collect())
}

/// Observations whose stored result is accepted on the segment, with their severity.
pub async fn accepted_observations<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
) -> Result<Vec<(Uuid, f64)>> {
    Ok(match_results::Entity::find()
        .select_only()
        .column(match_results::Column::ObservationId)
        .column(match_results::Column::SeverityScore)
        .filter(match_results::Column::SegmentId.eq(segment_id))
        .filter(match_results::Column::IsMatched.eq(true))
        .order_by_asc(match_results::Column::ObservationId)
        .into_tuple()
        .all(db)
        .await?)
}

/// Observations within `radius` meters of `center`, nearest first, with their distance.
pub async fn nearby_defects<C: ConnectionTrait>(
    db: &C,
    center: Point<f64>,
    radius: f64,
) -> Result<Vec<(StoredMatch, f64)>> {
    let (dlon, dlat) = radius_to_degrees(radius, center.y());
    let rows = match_results::Entity::find()
        .filter(match_results::Column::Latitude.between(center.y() - dlat, center.y() + dlat))
        .filter(match_results::Column::Longitude.between(center.x() - dlon, center.x() + dlon))
        .all(db)
        .await?;

    let mut hits: Vec<(StoredMatch, f64)> = rows
        .into_iter()
        .map(match_from_model)
        .filter_map(|m| {
            let location = m.observation.location?;
            let distance = Haversine.distance(center, location);
            (distance <= radius).then_some((m, distance))
        })
        .collect();
    hits.sort_by(|a, b| a.1.total_cmp(&b.1));
    Ok(hits)
}

fn score_from_model(model: priority_scores::Model) -> PriorityScore {
    PriorityScore {
        segment_id: model.segment_id,
        severity_score: model.severity_score,
        traffic_score: model.traffic_score,
        density_score: model.density_score,
        age_score: model.age_score,
        accessibility_score: model.accessibility_score,
        total_score: model.total_score,
        priority_level: model.priority_level,
        defect_count: u32::try_from(model.defect_count).unwrap_or(0),
        avg_severity: model.avg_severity,
        max_severity: model.max_severity,
        estimated_cost: model.estimated_cost,
        estimated_duration_days: u32::try_from(model.estimated_duration_days).unwrap_or(0),
        calculated_at: utc(model.calculated_at),
    }
}

/// Upserts the segment's score row, tagged with the request version that produced it.
pub async fn write_score<C: ConnectionTrait>(
    db: &C,
    score: &PriorityScore,
    version: u64,
) -> Result<()> {
    let model = priority_scores::ActiveModel {
        segment_id: Set(score.segment_id),
        severity_score: Set(score.severity_score),
        traffic_score: Set(score.traffic_score),
        density_score: Set(score.density_score),
        age_score: Set(score.age_score),
        accessibility_score: Set(score.accessibility_score),
        total_score: Set(score.total_score),
        priority_level: Set(score.priority_level),
        defect_count: Set(i32::try_from(score.defect_count).unwrap_or(i32::MAX)),
        avg_severity: Set(score.avg_severity),
        max_severity: Set(score.max_severity),
        estimated_cost: Set(score.estimated_cost),
        estimated_duration_days: Set(i32::try_from(score.estimated_duration_days).unwrap_or(i32::MAX)),
        version: Set(i64::try_from(version).unwrap_or(i64::MAX)),
        calculated_at: Set(score.calculated_at.into()),
    };
    priority_scores::Entity::insert(model)
        .on_conflict(
            OnConflict::column(priority_scores::Column::SegmentId)
                .update_columns([
                    priority_scores::Column::SeverityScore,
                    priority_scores::Column::TrafficScore,
                    priority_scores::Column::DensityScore,
                    priority_scores::Column::AgeScore,
                    priority_scores::Column::AccessibilityScore,
                    priority_scores::Column::TotalScore,
                    priority_scores::Column::PriorityLevel,
                    priority_scores::Column::DefectCount,
                    priority_scores::Column::AvgSeverity,
                    priority_scores::Column::MaxSeverity,
                    priority_scores::Column::EstimatedCost,
                    priority_scores::Column::EstimatedDurationDays,
                    priority_scores::Column::Version,
                    priority_scores::Column::CalculatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

pub async fn load_score<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
) -> Result<Option<PriorityScore>> {
    Ok(priority_scores::Entity::find_by_id(segment_id)
        .one(db)
        .await?
        .map(score_from_model))
}

/// Filter for the ranked priority list
#[derive(Debug, Clone, Default)]
pub struct PriorityFilter {
    pub level: Option<PriorityLevel>,
    pub min_score: Option<f64>,
    pub limit: Option<u64>,
}

/// Scores ranked by total descending; ties list the lower segment id first.
pub async fn list_scores<C: ConnectionTrait>(
    db: &C,
    filter: &PriorityFilter,
) -> Result<Vec<PriorityScore>> {
    let mut query = priority_scores::Entity::find()
        .order_by_desc(priority_scores::Column::TotalScore)
        .order_by_asc(priority_scores::Column::SegmentId);
    if let Some(level) = filter.level {
        query = query.filter(priority_scores::Column::PriorityLevel.eq(level));
    }
    if let Some(min) = filter.min_score {
        query = query.filter(priority_scores::Column::TotalScore.gte(min));
    }
    if let Some(limit) = filter.limit {
        query = query.limit(limit);
    }
    Ok(query
        .all(db)
        .await?
        .into_iter()
        .map(score_from_model)
        .collect())
}

pub async fn scored_segment_ids<C: ConnectionTrait>(db: &C) -> Result<Vec<SegmentId>> {
    Ok(crate::entity::segment_aggregates::Entity::find()
        .select_only()
        .column(crate::entity::segment_aggregates::Column::SegmentId)
        .order_by_asc(crate::entity::segment_aggregates::Column::SegmentId)
        .into_tuple::<SegmentId>()
        .all(db)
        .await?)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityStatistics {
    pub total_segments: u64,
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub total_defects: u64,
    pub total_estimated_cost: f64,
    pub avg_priority_score: f64,
}

pub async fn statistics<C: ConnectionTrait>(db: &C) -> Result<PriorityStatistics> {
    let per_level: Vec<(PriorityLevel, i64)> = priority_scores::Entity::find()
        .select_only()
        .column(priority_scores::Column::PriorityLevel)
        .column_as(Expr::col(priority_scores::Column::SegmentId).count(), "segments")
        .group_by(priority_scores::Column::PriorityLevel)
        .into_tuple()
        .all(db)
        .await?;

    let totals: Option<(Option<i64>, Option<f64>, Option<f64>)> = priority_scores::Entity::find()
        .select_only()
        .column_as(Expr::col(priority_scores::Column::DefectCount).sum(), "defects")
        .column_as(Expr::col(priority_scores::Column::EstimatedCost).sum(), "cost")
        .column_as(
            SimpleExpr::from(Func::avg(Expr::col(priority_scores::Column::TotalScore))),
            "avg_score",
        )
        .into_tuple()
        .one(db)
        .await?;

    let mut stats = PriorityStatistics::default();
    for (level, count) in per_level {
        let count = u64::try_from(count).unwrap_or(0);
        stats.total_segments += count;
        match level {
            PriorityLevel::Critical => stats.critical = count,
            PriorityLevel::High => stats.high = count,
            PriorityLevel::Medium => stats.medium = count,
            PriorityLevel::Low => stats.low = count,
        }
    }
    if let Some((defects, cost, avg)) = totals {
        stats.total_defects = defects.and_then(|d| u64::try_from(d).ok()).unwrap_or(0);
        stats.total_estimated_cost = (cost.unwrap_or(0.0) * 100.0).round() / 100.0;
        stats.avg_priority_score = (avg.unwrap_or(0.0) * 100.0).round() / 100.0;
    }
    Ok(stats)
}

/// How the submitted observations fared against the road network
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchStatistics {
    pub total: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub needs_review: u64,
    /// Percentage of observations matched, two decimals
    pub match_rate: f64,
    pub total_road_segments: u64,
}

pub async fn match_statistics<C: ConnectionTrait>(db: &C) -> Result<MatchStatistics> {
    let total = match_results::Entity::find().count(db).await?;
    let matched = match_results::Entity::find()
        .filter(match_results::Column::IsMatched.eq(true))
        .count(db)
        .await?;
    let needs_review = match_results::Entity::find()
        .filter(match_results::Column::NeedsReview.eq(true))
        .count(db)
        .await?;
    let total_road_segments = road_segments::Entity::find().count(db).await?;

    let match_rate = matched as f64 / total.max(1) as f64 * 100.0;
    Ok(MatchStatistics {
        total,
        matched,
        unmatched: total - matched,
        needs_review,
        match_rate: (match_rate * 100.0).round() / 100.0,
        total_road_segments,
    })
}
