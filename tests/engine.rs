use std::future::{Future, poll_fn};
use std::pin::pin;
use std::task::Poll;

use chrono::{DateTime, Duration, Utc};
use geo::{Coord, LineString, Point};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database};
use tokio::task::JoinSet;
use uuid::Uuid;

use roadwatch::aggregator::RecomputeOutcome;
use roadwatch::config::EngineConfig;
use roadwatch::geometry::LocalProjection;
use roadwatch::model::{
    DefectObservation, MatchStatus, PriorityLevel, RoadSegment, SegmentId, TaskStatus, TaskType,
};
use roadwatch::engine::ReconcileSummary;
use roadwatch::store::{self, MatchStatistics, PriorityFilter};
use roadwatch::{Engine, EngineError};

fn projection() -> LocalProjection {
    LocalProjection::new(Point::new(4.35, 50.85))
}

/// Point `(x, y)` meters east/north of the test origin
fn at(x: f64, y: f64) -> Point<f64> {
    projection().unproject(Coord { x, y })
}

fn segment(id: SegmentId, from: (f64, f64), to: (f64, f64)) -> RoadSegment {
    RoadSegment {
        id,
        name: Some(format!("Street {}", id)),
        road_type: "residential".to_string(),
        geometry: LineString::from(vec![at(from.0, from.1).0, at(to.0, to.1).0]),
        length_meters: 0.0,
        traffic_importance: Some(5),
        is_oneway: false,
        accessibility_score: None,
        last_maintenance_at: None,
    }
}

fn observation(location: Point<f64>, heading: Option<f64>, severity: f64) -> DefectObservation {
    DefectObservation {
        id: Uuid::new_v4(),
        location: Some(location),
        heading,
        defect_type: "D40".to_string(),
        severity_score: severity,
        observed_at: Utc::now(),
    }
}

async fn engine() -> Engine {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    Engine::new(db, EngineConfig::default())
}

async fn engine_with(segments: Vec<RoadSegment>) -> Engine {
    let engine = engine().await;
    engine.load_network(segments).await.unwrap();
    engine
}

fn years_ago(years: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(365 * years)
}

#[tokio::test]
async fn submitting_before_network_load_is_unavailable() {
    let engine = engine().await;
    assert_eq!(engine.restore_network().await.unwrap(), 0);
    let result = engine
        .submit_observation(observation(at(0.0, 0.0), None, 5.0))
        .await;
    assert!(matches!(result, Err(EngineError::IndexUnavailable)));
}

#[tokio::test]
async fn close_aligned_observation_is_matched_confidently() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let result = engine
        .submit_observation(observation(at(50.0, 5.0), Some(95.0), 6.0))
        .await
        .unwrap();

    assert!(result.is_matched);
    assert!(!result.needs_review);
    assert_eq!(result.segment_id, Some(1));
    assert!(result.confidence > 0.9);

    let status = engine.segment_status(1).await.unwrap();
    let aggregate = status.aggregate.unwrap();
    assert_eq!(aggregate.defect_count, 1);
    assert_eq!(aggregate.avg_severity, 6.0);
    assert!(status.score.is_some());
}

#[tokio::test]
async fn equidistant_parallel_roads_go_to_lower_id_for_review() {
    let engine = engine_with(vec![
        segment(12, (0.0, 4.0), (100.0, 4.0)),
        segment(11, (0.0, -4.0), (100.0, -4.0)),
    ])
    .await;
    let result = engine
        .submit_observation(observation(at(50.0, 0.0), None, 4.0))
        .await
        .unwrap();

    assert!(result.is_matched);
    assert!(result.needs_review);
    assert_eq!(result.status, MatchStatus::Ambiguous);
    assert_eq!(result.segment_id, Some(11));

    let queue = engine.review_queue(10).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].result.observation_id, result.observation_id);
}

#[tokio::test]
async fn unusable_gps_is_kept_for_review() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let mut obs = observation(at(0.0, 0.0), None, 5.0);
    obs.location = None;
    let result = engine.submit_observation(obs.clone()).await.unwrap();

    assert_eq!(result.status, MatchStatus::InvalidLocation);
    assert!(!result.is_matched);
    assert!(result.needs_review);
    let stored = engine.find_match(obs.id).await.unwrap().unwrap();
    assert_eq!(stored.result.status, MatchStatus::InvalidLocation);
    assert!(engine.segment_status(1).await.unwrap().aggregate.is_none());
}

#[tokio::test]
async fn far_observation_has_no_candidate() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let result = engine
        .submit_observation(observation(at(50.0, 300.0), None, 5.0))
        .await
        .unwrap();
    assert_eq!(result.status, MatchStatus::NoCandidate);
    assert_eq!(result.segment_id, None);
    assert!(result.needs_review);
}

#[tokio::test]
async fn matches_beyond_validation_distance_are_rejected() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let result = engine
        .submit_observation(observation(at(50.0, 20.0), None, 5.0))
        .await
        .unwrap();
    assert_eq!(result.status, MatchStatus::Rejected);
    assert!(!result.is_matched);
    assert_eq!(result.segment_id, Some(1));
    assert!(engine.segment_status(1).await.unwrap().aggregate.is_none());
}

#[tokio::test]
async fn nan_severity_is_refused() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let result = engine
        .submit_observation(observation(at(50.0, 1.0), None, f64::NAN))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidObservation(_, _))));
}

#[tokio::test]
async fn redelivery_leaves_aggregate_unchanged() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let obs = observation(at(20.0, 2.0), None, 7.0);
    engine.submit_observation(obs.clone()).await.unwrap();
    let first = engine.segment_status(1).await.unwrap().aggregate.unwrap();

    engine.submit_observation(obs.clone()).await.unwrap();
    engine.submit_observation(obs).await.unwrap();
    let after = engine.segment_status(1).await.unwrap().aggregate.unwrap();

    assert_eq!(after.defect_count, 1);
    assert_eq!(after.avg_severity, first.avg_severity);
    assert_eq!(after.max_severity, first.max_severity);
    assert!(engine.verify_segment(1).await.unwrap());
}

#[tokio::test]
async fn resubmission_moves_contribution_between_segments() {
    let engine = engine_with(vec![
        segment(1, (0.0, 0.0), (100.0, 0.0)),
        segment(2, (0.0, 500.0), (100.0, 500.0)),
    ])
    .await;
    let mut obs = observation(at(50.0, 2.0), None, 8.0);
    engine.submit_observation(obs.clone()).await.unwrap();
    engine
        .submit_observation(observation(at(30.0, 1.0), None, 2.0))
        .await
        .unwrap();

    // Corrected GPS fix puts the same detection on the other road
    obs.location = Some(at(50.0, 498.0));
    let result = engine.submit_observation(obs).await.unwrap();
    assert_eq!(result.segment_id, Some(2));

    let one = engine.segment_status(1).await.unwrap().aggregate.unwrap();
    let two = engine.segment_status(2).await.unwrap().aggregate.unwrap();
    assert_eq!(one.defect_count, 1);
    assert_eq!(one.avg_severity, 2.0);
    assert_eq!(one.max_severity, 2.0);
    assert_eq!(two.defect_count, 1);
    assert_eq!(two.max_severity, 8.0);
    assert!(engine.verify_segment(1).await.unwrap());
    assert!(engine.verify_segment(2).await.unwrap());
}

#[tokio::test]
async fn concurrent_submissions_across_segments_are_all_counted() {
    let segments: Vec<RoadSegment> = (1..=4)
        .map(|id| segment(id, (0.0, id as f64 * 200.0), (100.0, id as f64 * 200.0)))
        .collect();
    let engine = engine_with(segments).await;

    let mut tasks = JoinSet::new();
    for i in 0..40 {
        let engine = engine.clone();
        let road = (i % 4 + 1) as f64;
        let severity = (i % 10) as f64;
        tasks.spawn(async move {
            engine
                .submit_observation(observation(at(10.0 + i as f64, road * 200.0 + 1.0), None, severity))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        assert!(joined.unwrap().unwrap().is_matched);
    }

    for id in 1..=4 {
        let aggregate = engine.segment_status(id).await.unwrap().aggregate.unwrap();
        assert_eq!(aggregate.defect_count, 10);
        assert!(engine.verify_segment(id).await.unwrap());
    }
}

#[tokio::test]
async fn batch_results_follow_submission_order() {
    let engine = engine_with(vec![
        segment(1, (0.0, 0.0), (100.0, 0.0)),
        segment(2, (0.0, 300.0), (100.0, 300.0)),
    ])
    .await;
    let batch = vec![
        observation(at(10.0, 1.0), None, 3.0),
        observation(at(10.0, 301.0), None, 4.0),
        observation(at(10.0, 2.0), None, f64::INFINITY),
        observation(at(60.0, 299.0), None, 5.0),
    ];
    let ids: Vec<Uuid> = batch.iter().map(|o| o.id).collect();
    let outcome = engine.submit_batch(batch).await.unwrap();

    assert_eq!(outcome.refused.len(), 1);
    assert_eq!(outcome.refused[0].0, ids[2]);
    let result_ids: Vec<Uuid> = outcome.results.iter().map(|r| r.observation_id).collect();
    assert_eq!(result_ids, vec![ids[0], ids[1], ids[3]]);
    assert_eq!(
        engine.segment_status(2).await.unwrap().aggregate.unwrap().defect_count,
        2
    );
}

#[tokio::test]
async fn severe_busy_neglected_segment_becomes_critical_with_one_task() {
    let mut road = segment(1, (0.0, 0.0), (200.0, 0.0));
    road.length_meters = 200.0;
    road.traffic_importance = Some(8);
    road.last_maintenance_at = Some(years_ago(3));
    let engine = engine_with(vec![road]).await;

    for i in 0..20 {
        engine
            .submit_observation(observation(at(5.0 + i as f64 * 9.0, 3.0), Some(90.0), 9.0))
            .await
            .unwrap();
    }

    let status = engine.segment_status(1).await.unwrap();
    let score = status.score.unwrap();
    assert_eq!(score.defect_count, 20);
    assert_eq!(score.priority_level, PriorityLevel::Critical);
    assert_eq!(score.total_score, 89.0);

    let tasks = engine.list_tasks(None, Some(1), 10).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::Repair);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(tasks[0].priority_score, score.total_score);
}

/// Unknown traffic and history, 2 km long: crosses into HIGH after a few severe defects.
fn slow_burner() -> RoadSegment {
    let mut road = segment(1, (0.0, 0.0), (2000.0, 0.0));
    road.length_meters = 2000.0;
    road.traffic_importance = None;
    road
}

async fn submit_severe(engine: &Engine, count: usize) {
    for i in 0..count {
        engine
            .submit_observation(observation(at(100.0 + i as f64 * 50.0, 2.0), None, 9.0))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn task_created_only_when_crossing_into_high() {
    let engine = engine_with(vec![slow_burner()]).await;

    submit_severe(&engine, 2).await;
    let score = engine.segment_status(1).await.unwrap().score.unwrap();
    assert_eq!(score.priority_level, PriorityLevel::Medium);
    assert!(engine.list_tasks(None, Some(1), 10).await.unwrap().is_empty());

    submit_severe(&engine, 3).await;
    let status = engine.segment_status(1).await.unwrap();
    let score = status.score.unwrap();
    assert_eq!(score.priority_level, PriorityLevel::High);

    let tasks = engine.list_tasks(None, Some(1), 10).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::Inspection);
    assert_eq!(tasks[0].priority_score, score.total_score);
    assert_eq!(status.open_task.unwrap().id, tasks[0].id);

    // Explicit recomputes never add a second open task
    engine.recompute(1).await.unwrap();
    engine.recompute_all().await.unwrap();
    assert_eq!(engine.list_tasks(None, Some(1), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn task_lifecycle_and_completion_resets_age() {
    let engine = engine_with(vec![slow_burner()]).await;
    submit_severe(&engine, 5).await;
    let task = engine.list_tasks(Some(TaskStatus::Pending), None, 10).await.unwrap()[0].clone();

    let skipped = engine
        .update_task_status(task.id, TaskStatus::Completed, None)
        .await;
    assert!(matches!(
        skipped,
        Err(EngineError::InvalidTransition {
            from: TaskStatus::Pending,
            to: TaskStatus::Completed,
            ..
        })
    ));

    let scheduled = engine
        .update_task_status(task.id, TaskStatus::Scheduled, Some("crew B".into()))
        .await
        .unwrap();
    assert!(scheduled.scheduled_at.is_some());
    assert_eq!(scheduled.notes.as_deref(), Some("crew B"));
    engine
        .update_task_status(task.id, TaskStatus::InProgress, None)
        .await
        .unwrap();
    let done = engine
        .update_task_status(task.id, TaskStatus::Completed, None)
        .await
        .unwrap();
    assert!(done.completed_at.is_some());

    let again = engine
        .update_task_status(task.id, TaskStatus::Cancelled, None)
        .await;
    assert!(matches!(again, Err(EngineError::InvalidTransition { .. })));

    let status = engine.segment_status(1).await.unwrap();
    assert!(status.segment.last_maintenance_at.is_some());
    let score = status.score.unwrap();
    assert_eq!(score.age_score, 0.0);
    assert_eq!(score.priority_level, PriorityLevel::Medium);
    assert!(status.open_task.is_none());

    // Crossing again after completion opens a fresh task
    submit_severe(&engine, 3).await;
    let tasks = engine.list_tasks(None, Some(1), 10).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(
        tasks.iter().filter(|t| t.status == TaskStatus::Pending).count(),
        1
    );
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let engine = engine().await;
    let missing = Uuid::new_v4();
    assert!(matches!(
        engine.get_task(missing).await,
        Err(EngineError::TaskNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn recompute_is_idempotent() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    engine
        .submit_observation(observation(at(40.0, 1.0), None, 6.5))
        .await
        .unwrap();

    let RecomputeOutcome::Written { score: first, .. } = engine.recompute(1).await.unwrap() else {
        panic!("recompute did not write");
    };
    let RecomputeOutcome::Written { score: second, .. } = engine.recompute(1).await.unwrap() else {
        panic!("recompute did not write");
    };
    assert!(first.same_values(&second));
    assert!(matches!(
        engine.recompute(99).await.unwrap(),
        RecomputeOutcome::NoAggregate
    ));
}

#[tokio::test]
async fn priorities_are_ranked_and_summarised() {
    let mut busy = segment(1, (0.0, 0.0), (200.0, 0.0));
    busy.length_meters = 200.0;
    busy.traffic_importance = Some(8);
    busy.last_maintenance_at = Some(years_ago(3));
    let quiet = segment(2, (0.0, 400.0), (1000.0, 400.0));
    let engine = engine_with(vec![busy, quiet]).await;

    for i in 0..3 {
        engine
            .submit_observation(observation(at(20.0 + i as f64 * 30.0, 1.0), None, 9.0))
            .await
            .unwrap();
    }
    engine
        .submit_observation(observation(at(500.0, 401.0), None, 1.0))
        .await
        .unwrap();

    let all = engine.list_priorities(&PriorityFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].segment_id, 1);
    assert!(all[0].total_score >= all[1].total_score);

    let critical = engine
        .list_priorities(&PriorityFilter {
            level: Some(PriorityLevel::Critical),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].segment_id, 1);

    let above = engine
        .list_priorities(&PriorityFilter {
            min_score: Some(all[0].total_score),
            limit: Some(5),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(above.len(), 1);

    let stats = engine.statistics().await.unwrap();
    assert_eq!(stats.total_segments, 2);
    assert_eq!(stats.critical, 1);
    assert_eq!(stats.total_defects, 4);
    assert!(stats.total_estimated_cost > 0.0);

    let all = engine
        .list_priorities(&PriorityFilter::default())
        .await
        .unwrap();
    let mean = all.iter().map(|s| s.total_score).sum::<f64>() / all.len() as f64;
    assert!(stats.avg_priority_score > 0.0);
    assert_eq!(stats.avg_priority_score, (mean * 100.0).round() / 100.0);
}

#[tokio::test]
async fn nearby_and_segment_defects() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let near = observation(at(10.0, 1.0), None, 3.0);
    let far = observation(at(90.0, 1.0), None, 4.0);
    engine.submit_observation(near.clone()).await.unwrap();
    engine.submit_observation(far.clone()).await.unwrap();

    let hits = engine.nearby_defects(at(0.0, 0.0), 30.0).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.observation.id, near.id);
    assert!(hits[0].1 < 15.0);

    let defects = engine.segment_defects(1).await.unwrap();
    assert_eq!(defects.len(), 2);
}

#[tokio::test]
async fn reload_then_rematch_resolves_orphans() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let orphan = observation(at(50.0, 601.0), None, 6.0);
    let result = engine.submit_observation(orphan.clone()).await.unwrap();
    assert_eq!(result.status, MatchStatus::NoCandidate);

    engine
        .load_network(vec![
            segment(1, (0.0, 0.0), (100.0, 0.0)),
            segment(5, (0.0, 600.0), (100.0, 600.0)),
        ])
        .await
        .unwrap();
    let summary = engine.rematch_unresolved().await.unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.resolved, 1);

    let defects = engine.segment_defects(5).await.unwrap();
    assert_eq!(defects.len(), 1);
    assert_eq!(defects[0].observation.id, orphan.id);
    assert!(engine.review_queue(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn network_is_restored_from_the_store() {
    let engine = engine_with(vec![segment(3, (0.0, 0.0), (100.0, 0.0))]).await;
    let restored = Engine::new(engine.db().clone(), EngineConfig::default());
    assert_eq!(restored.restore_network().await.unwrap(), 1);
    let result = restored
        .submit_observation(observation(at(50.0, 2.0), None, 5.0))
        .await
        .unwrap();
    assert_eq!(result.segment_id, Some(3));
}

/// Polls `future` at most `polls` times, yielding to the runtime in between, then drops it.
async fn abandon_after<F: Future>(future: F, polls: usize) {
    let mut future = pin!(future);
    for _ in 0..polls {
        let done = poll_fn(|cx| Poll::Ready(future.as_mut().poll(cx).is_ready())).await;
        if done {
            return;
        }
        tokio::task::yield_now().await;
    }
}

async fn defect_count(engine: &Engine, segment_id: SegmentId) -> u32 {
    engine
        .segment_status(segment_id)
        .await
        .unwrap()
        .aggregate
        .map_or(0, |a| a.defect_count)
}

#[tokio::test]
async fn abandoned_submissions_still_reach_the_aggregate() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (400.0, 0.0))]).await;
    for i in 0..40 {
        let obs = observation(at(5.0 + i as f64 * 9.0, 2.0), None, 5.0);
        abandon_after(engine.submit_observation(obs), 1 + i % 6).await;
    }

    for _ in 0..500 {
        if defect_count(&engine, 1).await == 40 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(defect_count(&engine, 1).await, 40);
    assert_eq!(engine.segment_defects(1).await.unwrap().len(), 40);
    assert!(engine.verify_segment(1).await.unwrap());
}

#[tokio::test]
async fn ledger_drift_is_detected_and_reconciled() {
    let engine = engine_with(vec![segment(1, (0.0, 0.0), (100.0, 0.0))]).await;
    let first = engine
        .submit_observation(observation(at(30.0, 2.0), None, 4.0))
        .await
        .unwrap();
    assert!(engine.verify_segment(1).await.unwrap());

    // Stored as accepted but never folded, as after a crash between the two writes
    let orphan = observation(at(60.0, 2.0), None, 8.0);
    let mut orphan_result = first.clone();
    orphan_result.observation_id = orphan.id;
    store::upsert_match(engine.db(), &orphan, &orphan_result)
        .await
        .unwrap();
    assert!(!engine.verify_segment(1).await.unwrap());

    let summary = engine.reconcile_segment(1).await.unwrap();
    assert_eq!(
        summary,
        ReconcileSummary {
            applied: 1,
            retracted: 0
        }
    );
    assert!(engine.verify_segment(1).await.unwrap());
    let aggregate = engine.segment_status(1).await.unwrap().aggregate.unwrap();
    assert_eq!(aggregate.defect_count, 2);
    assert_eq!(aggregate.avg_severity, 6.0);
    assert_eq!(aggregate.max_severity, 8.0);

    // Folded but no longer accepted on the segment
    orphan_result.is_matched = false;
    orphan_result.needs_review = true;
    orphan_result.status = MatchStatus::Rejected;
    store::upsert_match(engine.db(), &orphan, &orphan_result)
        .await
        .unwrap();
    assert!(!engine.verify_segment(1).await.unwrap());
    assert_eq!(
        engine.reconcile_segment(1).await.unwrap(),
        ReconcileSummary {
            applied: 0,
            retracted: 1
        }
    );
    assert_eq!(defect_count(&engine, 1).await, 1);
    assert_eq!(
        engine.reconcile_segment(1).await.unwrap(),
        ReconcileSummary::default()
    );
}

#[tokio::test]
async fn match_statistics_count_outcomes() {
    let engine = engine_with(vec![
        segment(1, (0.0, 0.0), (100.0, 0.0)),
        segment(2, (0.0, 1000.0), (100.0, 1000.0)),
    ])
    .await;
    assert_eq!(
        engine.match_statistics().await.unwrap(),
        MatchStatistics {
            total_road_segments: 2,
            ..Default::default()
        }
    );

    for (x, y) in [(30.0, 2.0), (70.0, 2.0), (50.0, 300.0), (50.0, 20.0)] {
        engine
            .submit_observation(observation(at(x, y), None, 5.0))
            .await
            .unwrap();
    }

    let stats = engine.match_statistics().await.unwrap();
    assert_eq!(
        stats,
        MatchStatistics {
            total: 4,
            matched: 2,
            unmatched: 2,
            needs_review: 2,
            match_rate: 50.0,
            total_road_segments: 2,
        }
    );
}

#[tokio::test]
async fn escalation_into_critical_opens_repair_after_cancelled_inspection() {
    let mut road = segment(1, (0.0, 0.0), (200.0, 0.0));
    road.length_meters = 200.0;
    road.traffic_importance = Some(8);
    road.last_maintenance_at = Some(years_ago(3));
    let engine = engine_with(vec![road]).await;

    engine
        .submit_observation(observation(at(50.0, 3.0), None, 6.0))
        .await
        .unwrap();
    let score = engine.segment_status(1).await.unwrap().score.unwrap();
    assert_eq!(score.total_score, 78.5);
    assert_eq!(score.priority_level, PriorityLevel::High);
    let inspection = engine.list_tasks(None, Some(1), 10).await.unwrap()[0].clone();
    assert_eq!(inspection.task_type, TaskType::Inspection);
    engine
        .update_task_status(inspection.id, TaskStatus::Cancelled, None)
        .await
        .unwrap();

    engine
        .submit_observation(observation(at(120.0, 3.0), None, 10.0))
        .await
        .unwrap();
    let status = engine.segment_status(1).await.unwrap();
    let score = status.score.unwrap();
    assert_eq!(score.total_score, 85.5);
    assert_eq!(score.priority_level, PriorityLevel::Critical);

    let repair = status.open_task.unwrap();
    assert_eq!(repair.task_type, TaskType::Repair);
    assert_eq!(repair.status, TaskStatus::Pending);
    assert_eq!(engine.list_tasks(None, Some(1), 10).await.unwrap().len(), 2);

    // Staying CRITICAL only refreshes the open task
    engine
        .submit_observation(observation(at(150.0, 3.0), None, 10.0))
        .await
        .unwrap();
    assert_eq!(engine.list_tasks(None, Some(1), 10).await.unwrap().len(), 2);
}
