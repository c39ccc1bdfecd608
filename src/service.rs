use geo::{LineString, Point};
use log::{error, info};
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::aggregator::RecomputeOutcome;
use crate::engine::{Engine, SegmentStatus};
use crate::error::EngineError;
use crate::io::{chrono_to_prost, prost_to_chrono};
use crate::model::{
    DefectObservation, MaintenanceTask, MatchResult, MatchStatus, PriorityLevel, PriorityScore,
    RoadSegment, SegmentAggregate, TaskStatus, TaskType,
};
use crate::proto;
use crate::proto::road_watch_server::RoadWatch;
use crate::scheduler::TaskEvent;
use crate::store::{PriorityFilter, StoredMatch};

const DEFAULT_LIST_LIMIT: u64 = 100;

impl From<EngineError> for Status {
    fn from(e: EngineError) -> Self {
        match &e {
            EngineError::IndexUnavailable => Status::unavailable(e.to_string()),
            EngineError::InvalidObservation(..) | EngineError::InvalidSegment(..) => {
                Status::invalid_argument(e.to_string())
            }
            EngineError::SegmentNotFound(_) | EngineError::TaskNotFound(_) => {
                Status::not_found(e.to_string())
            }
            EngineError::InvalidTransition { .. } => Status::failed_precondition(e.to_string()),
            EngineError::WorkerStopped(_)
            | EngineError::Database(_)
            | EngineError::Corrupt(_)
            | EngineError::Join(_) => {
                error!("Request failed: {}", e);
                Status::internal("Internal error")
            }
        }
    }
}

pub struct RoadWatchService {
    engine: Engine,
}

impl RoadWatchService {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value).map_err(|_| Status::invalid_argument(format!("Invalid {} UUID", what)))
}

fn latlon(p: Point<f64>) -> proto::LatLon {
    proto::LatLon {
        lat: p.y(),
        lon: p.x(),
    }
}

fn segment_from_proto(s: proto::RoadSegment) -> Result<RoadSegment, Status> {
    let traffic_importance = s
        .traffic_importance
        .map(|v| {
            u8::try_from(v).map_err(|_| {
                Status::invalid_argument(format!("Segment {} traffic importance {}", s.id, v))
            })
        })
        .transpose()?;
    Ok(RoadSegment {
        id: s.id,
        name: s.name,
        road_type: s.road_type,
        geometry: LineString::from(
            s.points
                .iter()
                .map(|p| (p.lon, p.lat))
                .collect::<Vec<_>>(),
        ),
        length_meters: s.length_meters,
        traffic_importance,
        is_oneway: s.is_oneway,
        accessibility_score: s.accessibility_score,
        last_maintenance_at: s.last_maintenance_at.as_ref().and_then(prost_to_chrono),
    })
}

fn segment_to_proto(s: &RoadSegment) -> proto::RoadSegment {
    proto::RoadSegment {
        id: s.id,
        name: s.name.clone(),
        road_type: s.road_type.clone(),
        points: s.geometry.points().map(latlon).collect(),
        length_meters: s.effective_length(),
        traffic_importance: s.traffic_importance.map(u32::from),
        is_oneway: s.is_oneway,
        accessibility_score: s.accessibility_score,
        last_maintenance_at: s.last_maintenance_at.as_ref().map(chrono_to_prost),
    }
}

/// Every observation must carry its own id, which makes re-delivery idempotent.
fn observation_from_proto(o: proto::Observation) -> Result<DefectObservation, Status> {
    if o.id.is_empty() {
        return Err(Status::invalid_argument("Observation id is required"));
    }
    let id = parse_uuid(&o.id, "observation")?;
    let observed_at = o
        .observed_at
        .as_ref()
        .and_then(prost_to_chrono)
        .ok_or_else(|| Status::invalid_argument("Observation timestamp is required"))?;
    Ok(DefectObservation {
        id,
        location: o.location.map(|l| Point::new(l.lon, l.lat)),
        heading: o.heading,
        defect_type: o.defect_type,
        severity_score: o.severity_score,
        observed_at,
    })
}

fn observation_to_proto(o: &DefectObservation) -> proto::Observation {
    proto::Observation {
        id: o.id.to_string(),
        location: o.location.map(latlon),
        heading: o.heading,
        defect_type: o.defect_type.clone(),
        severity_score: o.severity_score,
        observed_at: Some(chrono_to_prost(&o.observed_at)),
    }
}

fn match_status_to_proto(status: MatchStatus) -> proto::MatchStatus {
    match status {
        MatchStatus::Matched => proto::MatchStatus::Matched,
        MatchStatus::Ambiguous => proto::MatchStatus::Ambiguous,
        MatchStatus::Rejected => proto::MatchStatus::Rejected,
        MatchStatus::NoCandidate => proto::MatchStatus::NoCandidate,
        MatchStatus::InvalidLocation => proto::MatchStatus::InvalidLocation,
    }
}

fn match_to_proto(r: &MatchResult) -> proto::MatchResult {
    proto::MatchResult {
        observation_id: r.observation_id.to_string(),
        segment_id: r.segment_id,
        status: match_status_to_proto(r.status) as i32,
        matched_point: r.matched_point.map(latlon),
        distance_to_segment: r.distance_to_segment,
        heading_diff: r.heading_diff,
        confidence: r.confidence,
        is_matched: r.is_matched,
        needs_review: r.needs_review,
    }
}

fn stored_to_proto(m: &StoredMatch) -> proto::StoredMatch {
    proto::StoredMatch {
        observation: Some(observation_to_proto(&m.observation)),
        result: Some(match_to_proto(&m.result)),
        updated_at: Some(chrono_to_prost(&m.updated_at)),
    }
}

fn level_to_proto(level: PriorityLevel) -> proto::PriorityLevel {
    match level {
        PriorityLevel::Low => proto::PriorityLevel::Low,
        PriorityLevel::Medium => proto::PriorityLevel::Medium,
        PriorityLevel::High => proto::PriorityLevel::High,
        PriorityLevel::Critical => proto::PriorityLevel::Critical,
    }
}

fn level_from_proto(value: i32) -> Result<Option<PriorityLevel>, Status> {
    match proto::PriorityLevel::try_from(value) {
        Ok(proto::PriorityLevel::Unspecified) => Ok(None),
        Ok(proto::PriorityLevel::Low) => Ok(Some(PriorityLevel::Low)),
        Ok(proto::PriorityLevel::Medium) => Ok(Some(PriorityLevel::Medium)),
        Ok(proto::PriorityLevel::High) => Ok(Some(PriorityLevel::High)),
        Ok(proto::PriorityLevel::Critical) => Ok(Some(PriorityLevel::Critical)),
        Err(_) => Err(Status::invalid_argument("Unknown priority level")),
    }
}

fn score_to_proto(s: &PriorityScore) -> proto::PriorityScore {
    proto::PriorityScore {
        segment_id: s.segment_id,
        severity_score: s.severity_score,
        traffic_score: s.traffic_score,
        density_score: s.density_score,
        age_score: s.age_score,
        accessibility_score: s.accessibility_score,
        total_score: s.total_score,
        priority_level: level_to_proto(s.priority_level) as i32,
        defect_count: s.defect_count,
        avg_severity: s.avg_severity,
        max_severity: s.max_severity,
        estimated_cost: s.estimated_cost,
        estimated_duration_days: s.estimated_duration_days,
        calculated_at: Some(chrono_to_prost(&s.calculated_at)),
    }
}

fn aggregate_to_proto(a: &SegmentAggregate) -> proto::SegmentAggregate {
    proto::SegmentAggregate {
        segment_id: a.segment_id,
        defect_count: a.defect_count,
        avg_severity: a.avg_severity,
        max_severity: a.max_severity,
        updated_at: Some(chrono_to_prost(&a.updated_at)),
    }
}

fn task_status_to_proto(status: TaskStatus) -> proto::TaskStatus {
    match status {
        TaskStatus::Pending => proto::TaskStatus::Pending,
        TaskStatus::Scheduled => proto::TaskStatus::Scheduled,
        TaskStatus::InProgress => proto::TaskStatus::InProgress,
        TaskStatus::Completed => proto::TaskStatus::Completed,
        TaskStatus::Cancelled => proto::TaskStatus::Cancelled,
    }
}

fn task_status_from_proto(value: i32) -> Result<Option<TaskStatus>, Status> {
    match proto::TaskStatus::try_from(value) {
        Ok(proto::TaskStatus::Unspecified) => Ok(None),
        Ok(proto::TaskStatus::Pending) => Ok(Some(TaskStatus::Pending)),
        Ok(proto::TaskStatus::Scheduled) => Ok(Some(TaskStatus::Scheduled)),
        Ok(proto::TaskStatus::InProgress) => Ok(Some(TaskStatus::InProgress)),
        Ok(proto::TaskStatus::Completed) => Ok(Some(TaskStatus::Completed)),
        Ok(proto::TaskStatus::Cancelled) => Ok(Some(TaskStatus::Cancelled)),
        Err(_) => Err(Status::invalid_argument("Unknown task status")),
    }
}

fn task_to_proto(t: &MaintenanceTask) -> proto::MaintenanceTask {
    proto::MaintenanceTask {
        id: t.id.to_string(),
        segment_id: t.segment_id,
        task_type: match t.task_type {
            TaskType::Inspection => proto::TaskType::Inspection,
            TaskType::Repair => proto::TaskType::Repair,
        } as i32,
        status: task_status_to_proto(t.status) as i32,
        priority_score: t.priority_score,
        estimated_cost: t.estimated_cost,
        notes: t.notes.clone(),
        scheduled_at: t.scheduled_at.as_ref().map(chrono_to_prost),
        completed_at: t.completed_at.as_ref().map(chrono_to_prost),
        created_at: Some(chrono_to_prost(&t.created_at)),
        updated_at: Some(chrono_to_prost(&t.updated_at)),
    }
}

fn status_to_proto(s: &SegmentStatus) -> proto::SegmentStatus {
    proto::SegmentStatus {
        segment: Some(segment_to_proto(&s.segment)),
        aggregate: s.aggregate.as_ref().map(aggregate_to_proto),
        score: s.score.as_ref().map(score_to_proto),
        open_task: s.open_task.as_ref().map(task_to_proto),
    }
}

#[tonic::async_trait]
impl RoadWatch for RoadWatchService {
    async fn load_network(
        &self,
        request: Request<proto::LoadNetworkRequest>,
    ) -> Result<Response<proto::LoadNetworkResponse>, Status> {
        let req = request.into_inner();
        let segments = req
            .segments
            .into_iter()
            .map(segment_from_proto)
            .collect::<Result<Vec<_>, Status>>()?;

        let count = self.engine.load_network(segments).await?;
        let summary = if req.rematch_unresolved {
            self.engine.rematch_unresolved().await?
        } else {
            Default::default()
        };

        Ok(Response::new(proto::LoadNetworkResponse {
            segment_count: count as u64,
            rematched: summary.examined as u64,
            resolved: summary.resolved as u64,
        }))
    }

    async fn submit_observation(
        &self,
        request: Request<proto::Observation>,
    ) -> Result<Response<proto::MatchResult>, Status> {
        let mut observation = request.into_inner();
        // One-off submissions may leave the id to the server
        if observation.id.is_empty() {
            observation.id = Uuid::new_v4().to_string();
        }
        let observation = observation_from_proto(observation)?;
        let result = self.engine.submit_observation(observation).await?;
        Ok(Response::new(match_to_proto(&result)))
    }

    async fn submit_observations(
        &self,
        request: Request<proto::SubmitObservationsRequest>,
    ) -> Result<Response<proto::SubmitObservationsResponse>, Status> {
        let mut observations = vec![];
        let mut refused = vec![];
        for o in request.into_inner().observations {
            let id = o.id.clone();
            match observation_from_proto(o) {
                Ok(observation) => observations.push(observation),
                Err(status) => refused.push(proto::RefusedObservation {
                    observation_id: id,
                    reason: status.message().to_string(),
                }),
            }
        }

        let outcome = self.engine.submit_batch(observations).await?;
        refused.extend(
            outcome
                .refused
                .into_iter()
                .map(|(id, reason)| proto::RefusedObservation {
                    observation_id: id.to_string(),
                    reason,
                }),
        );

        Ok(Response::new(proto::SubmitObservationsResponse {
            results: outcome.results.iter().map(match_to_proto).collect(),
            refused,
        }))
    }

    async fn rematch_unresolved(
        &self,
        _request: Request<()>,
    ) -> Result<Response<proto::RematchResponse>, Status> {
        let summary = self.engine.rematch_unresolved().await?;
        Ok(Response::new(proto::RematchResponse {
            examined: summary.examined as u64,
            resolved: summary.resolved as u64,
        }))
    }

    async fn list_priorities(
        &self,
        request: Request<proto::ListPrioritiesRequest>,
    ) -> Result<Response<proto::ListPrioritiesResponse>, Status> {
        let req = request.into_inner();
        let filter = PriorityFilter {
            level: match req.level {
                Some(level) => level_from_proto(level)?,
                None => None,
            },
            min_score: req.min_score,
            limit: req.limit,
        };
        let scores = self.engine.list_priorities(&filter).await?;
        Ok(Response::new(proto::ListPrioritiesResponse {
            scores: scores.iter().map(score_to_proto).collect(),
        }))
    }

    async fn get_segment_status(
        &self,
        request: Request<proto::SegmentRequest>,
    ) -> Result<Response<proto::SegmentStatus>, Status> {
        let status = self
            .engine
            .segment_status(request.into_inner().segment_id)
            .await?;
        Ok(Response::new(status_to_proto(&status)))
    }

    async fn get_segment_defects(
        &self,
        request: Request<proto::SegmentRequest>,
    ) -> Result<Response<proto::StoredMatchList>, Status> {
        let matches = self
            .engine
            .segment_defects(request.into_inner().segment_id)
            .await?;
        Ok(Response::new(proto::StoredMatchList {
            matches: matches.iter().map(stored_to_proto).collect(),
        }))
    }

    async fn recompute(
        &self,
        request: Request<proto::SegmentRequest>,
    ) -> Result<Response<proto::RecomputeResponse>, Status> {
        let segment_id = request.into_inner().segment_id;
        let response = match self.engine.recompute(segment_id).await? {
            RecomputeOutcome::Written { score, task } => proto::RecomputeResponse {
                written: true,
                superseded: false,
                score: Some(score_to_proto(&score)),
                created_task: match task {
                    Some(TaskEvent::Created(task)) => Some(task_to_proto(&task)),
                    _ => None,
                },
            },
            RecomputeOutcome::Superseded => proto::RecomputeResponse {
                superseded: true,
                ..Default::default()
            },
            RecomputeOutcome::NoAggregate => proto::RecomputeResponse::default(),
        };
        Ok(Response::new(response))
    }

    async fn recompute_all(
        &self,
        _request: Request<()>,
    ) -> Result<Response<proto::RecomputeAllResponse>, Status> {
        info!("Full recompute requested");
        let written = self.engine.recompute_all().await?;
        Ok(Response::new(proto::RecomputeAllResponse {
            written: written as u64,
        }))
    }

    async fn get_statistics(
        &self,
        _request: Request<()>,
    ) -> Result<Response<proto::Statistics>, Status> {
        let stats = self.engine.statistics().await?;
        Ok(Response::new(proto::Statistics {
            total_segments: stats.total_segments,
            critical: stats.critical,
            high: stats.high,
            medium: stats.medium,
            low: stats.low,
            total_defects: stats.total_defects,
            total_estimated_cost: stats.total_estimated_cost,
            avg_priority_score: stats.avg_priority_score,
        }))
    }

    async fn get_match_statistics(
        &self,
        _request: Request<()>,
    ) -> Result<Response<proto::MatchStatistics>, Status> {
        let stats = self.engine.match_statistics().await?;
        Ok(Response::new(proto::MatchStatistics {
            total: stats.total,
            matched: stats.matched,
            unmatched: stats.unmatched,
            needs_review: stats.needs_review,
            match_rate: stats.match_rate,
            total_road_segments: stats.total_road_segments,
        }))
    }

    async fn get_review_queue(
        &self,
        request: Request<proto::ReviewQueueRequest>,
    ) -> Result<Response<proto::StoredMatchList>, Status> {
        let limit = match request.into_inner().limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n,
        };
        let matches = self.engine.review_queue(limit).await?;
        Ok(Response::new(proto::StoredMatchList {
            matches: matches.iter().map(stored_to_proto).collect(),
        }))
    }

    async fn get_nearby_defects(
        &self,
        request: Request<proto::NearbyRequest>,
    ) -> Result<Response<proto::NearbyResponse>, Status> {
        let req = request.into_inner();
        let center = req
            .center
            .ok_or_else(|| Status::invalid_argument("Center is required"))?;
        let hits = self
            .engine
            .nearby_defects(Point::new(center.lon, center.lat), req.radius_meters)
            .await?;
        Ok(Response::new(proto::NearbyResponse {
            defects: hits
                .iter()
                .map(|(m, distance)| proto::NearbyDefect {
                    defect: Some(stored_to_proto(m)),
                    distance_meters: *distance,
                })
                .collect(),
        }))
    }

    async fn get_task(
        &self,
        request: Request<proto::TaskRequest>,
    ) -> Result<Response<proto::MaintenanceTask>, Status> {
        let task_id = parse_uuid(&request.into_inner().task_id, "task")?;
        let task = self.engine.get_task(task_id).await?;
        Ok(Response::new(task_to_proto(&task)))
    }

    async fn list_tasks(
        &self,
        request: Request<proto::ListTasksRequest>,
    ) -> Result<Response<proto::ListTasksResponse>, Status> {
        let req = request.into_inner();
        let status = match req.status {
            Some(status) => task_status_from_proto(status)?,
            None => None,
        };
        let limit = match req.limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n,
        };
        let tasks = self
            .engine
            .list_tasks(status, req.segment_id, limit)
            .await?;
        Ok(Response::new(proto::ListTasksResponse {
            tasks: tasks.iter().map(task_to_proto).collect(),
        }))
    }

    async fn update_task_status(
        &self,
        request: Request<proto::UpdateTaskStatusRequest>,
    ) -> Result<Response<proto::MaintenanceTask>, Status> {
        let req = request.into_inner();
        let task_id = parse_uuid(&req.task_id, "task")?;
        let status = task_status_from_proto(req.status)?
            .ok_or_else(|| Status::invalid_argument("Target status is required"))?;
        let task = self
            .engine
            .update_task_status(task_id, status, req.notes)
            .await?;
        Ok(Response::new(task_to_proto(&task)))
    }
}
