//! Wires the index, matcher, validator, aggregator and scheduler together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use geo::Point;
use log::{debug, error, info, warn};
use sea_orm::DatabaseConnection;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::aggregator::{self, ApplyOutcome, RecomputeOutcome, SegmentAggregator};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::mapmatcher::MapMatcher;
use crate::model::{
    DefectObservation, MaintenanceTask, MatchResult, PriorityScore, RoadSegment,
    SegmentAggregate, SegmentId, TaskStatus,
};
use crate::priority::PriorityCalculator;
use crate::road_index::{NetworkHandle, RoadNetworkIndex};
use crate::scheduler::TaskScheduler;
use crate::store::{self, MatchStatistics, PriorityFilter, PriorityStatistics, StoredMatch};
use crate::validator::MatchValidator;

/// Everything known about one segment
#[derive(Debug, Clone)]
pub struct SegmentStatus {
    pub segment: RoadSegment,
    pub aggregate: Option<SegmentAggregate>,
    pub score: Option<PriorityScore>,
    pub open_task: Option<MaintenanceTask>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// In submission order, minus the refused observations
    pub results: Vec<MatchResult>,
    pub refused: Vec<(Uuid, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RematchSummary {
    pub examined: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub applied: usize,
    pub retracted: usize,
}

#[derive(Clone)]
pub struct Engine {
    db: DatabaseConnection,
    network: Arc<NetworkHandle>,
    matcher: MapMatcher,
    validator: MatchValidator,
    aggregator: SegmentAggregator,
    scheduler: TaskScheduler,
}

impl Engine {
    pub fn new(db: DatabaseConnection, config: EngineConfig) -> Self {
        let scheduler = TaskScheduler::new();
        let aggregator = SegmentAggregator::new(
            db.clone(),
            config.aggregator,
            PriorityCalculator::new(config.priority),
            scheduler.clone(),
        );
        Self {
            db,
            network: Arc::new(NetworkHandle::new()),
            matcher: MapMatcher::new(config.matcher),
            validator: MatchValidator::new(config.validator),
            aggregator,
            scheduler,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn network(&self) -> Result<Arc<RoadNetworkIndex>> {
        self.network.snapshot()
    }

    /// Rebuilds the index from the segments already in the database.
    /// Returns the number of segments indexed; an empty store leaves the index unloaded.
    pub async fn restore_network(&self) -> Result<usize> {
        let segments = store::load_segments(&self.db).await?;
        if segments.is_empty() {
            info!("No road segments stored yet, waiting for a network load");
            return Ok(0);
        }
        let count = segments.len();
        self.network.load(segments)?;
        info!("Restored road network with {} segments", count);
        Ok(count)
    }

    /// Validates and stores the segments, then swaps in a fresh index. In-flight
    /// matches finish against the snapshot they started with.
    pub async fn load_network(&self, mut segments: Vec<RoadSegment>) -> Result<usize> {
        // Maintenance recorded by completed tasks survives feeds that lack it
        let maintained: HashMap<SegmentId, _> = store::load_segments(&self.db)
            .await?
            .into_iter()
            .filter_map(|s| s.last_maintenance_at.map(|at| (s.id, at)))
            .collect();
        for segment in &mut segments {
            if segment.last_maintenance_at.is_none() {
                segment.last_maintenance_at = maintained.get(&segment.id).copied();
            }
        }

        let index = Arc::new(RoadNetworkIndex::build(segments)?);
        let segments: Vec<RoadSegment> = index
            .segment_ids()
            .filter_map(|id| index.segment(id).map(|s| (**s).clone()))
            .collect();
        store::upsert_segments(&self.db, &segments).await?;

        let count = index.len();
        let previous = self.network.swap(index);
        info!(
            "Loaded road network with {} segments (replaced {})",
            count,
            previous.map_or(0, |p| p.len())
        );
        Ok(count)
    }

    /// Matches, validates, persists and aggregates one observation.
    pub async fn submit_observation(&self, observation: DefectObservation) -> Result<MatchResult> {
        let observation = sanitize(observation)?;
        let index = self.network.snapshot()?;
        let result = self
            .validator
            .validate(self.matcher.match_observation(&index, &observation));
        self.persist(observation, result).await
    }

    /// Matches the batch in parallel against one snapshot, then persists every
    /// observation concurrently. Observations with unusable severities are refused
    /// individually.
    pub async fn submit_batch(&self, observations: Vec<DefectObservation>) -> Result<BatchOutcome> {
        let index = self.network.snapshot()?;

        let mut outcome = BatchOutcome::default();
        let mut accepted = Vec::with_capacity(observations.len());
        for observation in observations {
            let id = observation.id;
            match sanitize(observation) {
                Ok(observation) => accepted.push(observation),
                Err(e) => outcome.refused.push((id, e.to_string())),
            }
        }

        let matcher = self.matcher.clone();
        let validator = self.validator.clone();
        let (accepted, results) = tokio::task::spawn_blocking(move || {
            let results: Vec<MatchResult> = matcher
                .match_batch(&index, &accepted)
                .into_iter()
                .map(|r| validator.validate(r))
                .collect();
            (accepted, results)
        })
        .await?;

        let mut tasks = JoinSet::new();
        for (position, (observation, result)) in accepted.into_iter().zip(results).enumerate() {
            let engine = self.clone();
            tasks.spawn(async move { (position, engine.persist(observation, result).await) });
        }

        // Drain every task before reporting so no persist is left half done
        let mut persisted = Vec::with_capacity(tasks.len());
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, Ok(result))) => persisted.push((position, result)),
                Ok((_, Err(e))) => {
                    error!("Persisting batch observation failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Persist task failed: {}", e);
                    first_error.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        persisted.sort_by_key(|(position, _)| *position);
        outcome.results = persisted.into_iter().map(|(_, r)| r).collect();

        info!(
            "Batch of {} observations: {} matched, {} need review, {} refused",
            outcome.results.len() + outcome.refused.len(),
            outcome.results.iter().filter(|r| r.is_matched).count(),
            outcome.results.iter().filter(|r| r.needs_review).count(),
            outcome.refused.len()
        );
        Ok(outcome)
    }

    /// Stores the result and moves the observation's contribution to the segment
    /// it now belongs to. Runs on its own task, so a caller that goes away cannot
    /// leave a stored result without its aggregation.
    async fn persist(
        &self,
        observation: DefectObservation,
        result: MatchResult,
    ) -> Result<MatchResult> {
        let engine = self.clone();
        tokio::spawn(async move { engine.persist_detached(observation, result).await }).await?
    }

    async fn persist_detached(
        &self,
        observation: DefectObservation,
        result: MatchResult,
    ) -> Result<MatchResult> {
        let previous = store::upsert_match(&self.db, &observation, &result).await?;

        let new_segment = result.accepted_segment();
        let old_segment = previous.as_ref().and_then(MatchResult::accepted_segment);
        if let Some(old) = old_segment.filter(|old| Some(*old) != new_segment) {
            debug!(
                "Observation {} moved from segment {} to {:?}",
                observation.id, old, new_segment
            );
            self.aggregator.retract(old, observation.id).await?;
        }

        if let Some(segment_id) = new_segment {
            self.fold_into(segment_id, observation.id, observation.severity_score)
                .await?;
        }
        Ok(result)
    }

    /// Applies the observation to the segment, first taking it back from any other
    /// segment still counting it.
    async fn fold_into(
        &self,
        segment_id: SegmentId,
        observation_id: Uuid,
        severity: f64,
    ) -> Result<()> {
        let outcome = self
            .aggregator
            .apply(segment_id, observation_id, severity)
            .await?;
        if let ApplyOutcome::HeldBy(holder) = outcome {
            // Left behind by an earlier re-match that did not finish
            warn!(
                "Observation {} still counted on segment {}, moving it to {}",
                observation_id, holder, segment_id
            );
            self.aggregator.retract(holder, observation_id).await?;
            self.aggregator
                .apply(segment_id, observation_id, severity)
                .await?;
        }
        Ok(())
    }

    /// Re-matches every stored result that was not cleanly accepted, typically after
    /// a network reload.
    pub async fn rematch_unresolved(&self) -> Result<RematchSummary> {
        let index = self.network.snapshot()?;
        let unresolved = store::unresolved(&self.db).await?;
        let mut summary = RematchSummary {
            examined: unresolved.len(),
            resolved: 0,
        };

        for stored in unresolved {
            let result = self
                .validator
                .validate(self.matcher.match_observation(&index, &stored.observation));
            if result == stored.result {
                continue;
            }
            let result = self.persist(stored.observation, result).await?;
            if result.is_matched && !result.needs_review {
                summary.resolved += 1;
            }
        }

        info!(
            "Re-matched {} unresolved observations, {} now resolved",
            summary.examined, summary.resolved
        );
        Ok(summary)
    }

    pub async fn recompute(&self, segment_id: SegmentId) -> Result<RecomputeOutcome> {
        self.aggregator.recompute(segment_id).await
    }

    /// Recomputes every segment with an aggregate, all segments concurrently.
    /// Returns how many scores were written.
    pub async fn recompute_all(&self) -> Result<usize> {
        let segment_ids = store::scored_segment_ids(&self.db).await?;
        let total = segment_ids.len();

        let mut tasks = JoinSet::new();
        for segment_id in segment_ids {
            let aggregator = self.aggregator.clone();
            tasks.spawn(async move { (segment_id, aggregator.recompute(segment_id).await) });
        }

        let mut written = 0;
        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(RecomputeOutcome::Written { .. }))) => written += 1,
                Ok((_, Ok(_))) => {}
                Ok((segment_id, Err(e))) => {
                    warn!("Recompute of segment {} failed: {}", segment_id, e);
                    failed += 1;
                }
                Err(e) => {
                    warn!("Recompute task panicked: {}", e);
                    failed += 1;
                }
            }
        }
        info!(
            "Recomputed {} of {} segments ({} failed)",
            written, total, failed
        );
        Ok(written)
    }

    pub async fn list_priorities(&self, filter: &PriorityFilter) -> Result<Vec<PriorityScore>> {
        store::list_scores(&self.db, filter).await
    }

    pub async fn segment_status(&self, segment_id: SegmentId) -> Result<SegmentStatus> {
        let segment = store::load_segment(&self.db, segment_id)
            .await?
            .ok_or(EngineError::SegmentNotFound(segment_id))?;
        Ok(SegmentStatus {
            segment,
            aggregate: aggregator::load_aggregate(&self.db, segment_id).await?,
            score: store::load_score(&self.db, segment_id).await?,
            open_task: self.scheduler.open_task_for(&self.db, segment_id).await?,
        })
    }

    pub async fn statistics(&self) -> Result<PriorityStatistics> {
        store::statistics(&self.db).await
    }

    pub async fn match_statistics(&self) -> Result<MatchStatistics> {
        store::match_statistics(&self.db).await
    }

    pub async fn review_queue(&self, limit: u64) -> Result<Vec<StoredMatch>> {
        store::review_queue(&self.db, limit).await
    }

    pub async fn nearby_defects(
        &self,
        center: Point<f64>,
        radius: f64,
    ) -> Result<Vec<(StoredMatch, f64)>> {
        if !radius.is_finite() || radius < 0.0 {
            return Ok(Vec::new());
        }
        store::nearby_defects(&self.db, center, radius).await
    }

    pub async fn segment_defects(&self, segment_id: SegmentId) -> Result<Vec<StoredMatch>> {
        store::segment_defects(&self.db, segment_id).await
    }

    pub async fn find_match(&self, observation_id: Uuid) -> Result<Option<StoredMatch>> {
        store::find_match(&self.db, observation_id).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<MaintenanceTask> {
        self.scheduler.get(&self.db, task_id).await
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        segment_id: Option<SegmentId>,
        limit: u64,
    ) -> Result<Vec<MaintenanceTask>> {
        self.scheduler.list(&self.db, status, segment_id, limit).await
    }

    /// Completing a task resets the segment's age, so its score is recomputed.
    pub async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        notes: Option<String>,
    ) -> Result<MaintenanceTask> {
        let task = self
            .scheduler
            .update_status(&self.db, task_id, status, notes)
            .await?;
        if task.status == TaskStatus::Completed {
            if let Err(e) = self.aggregator.recompute(task.segment_id).await {
                warn!(
                    "Recompute after completing task {} failed: {}",
                    task.id, e
                );
            }
        }
        Ok(task)
    }

    /// True when the stored aggregate equals a replay of its ledger and the ledger
    /// holds exactly the observations whose stored result is accepted on the segment.
    pub async fn verify_segment(&self, segment_id: SegmentId) -> Result<bool> {
        if !self.aggregator.verify(segment_id).await? {
            return Ok(false);
        }
        let drift = self.ledger_drift(segment_id).await?;
        if !drift.missing.is_empty() || !drift.stray.is_empty() {
            error!(
                "Ledger of segment {} disagrees with its accepted matches: {} missing, {} stray",
                segment_id,
                drift.missing.len(),
                drift.stray.len()
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Brings the segment's ledger back in line with its accepted matches, typically
    /// after a crash between storing a result and folding it.
    pub async fn reconcile_segment(&self, segment_id: SegmentId) -> Result<ReconcileSummary> {
        let drift = self.ledger_drift(segment_id).await?;
        for observation_id in &drift.stray {
            self.aggregator.retract(segment_id, *observation_id).await?;
        }
        for (observation_id, severity) in &drift.missing {
            self.fold_into(segment_id, *observation_id, *severity).await?;
        }

        let summary = ReconcileSummary {
            applied: drift.missing.len(),
            retracted: drift.stray.len(),
        };
        if summary != ReconcileSummary::default() {
            info!(
                "Reconciled segment {}: {} applied, {} retracted",
                segment_id, summary.applied, summary.retracted
            );
        }
        Ok(summary)
    }

    async fn ledger_drift(&self, segment_id: SegmentId) -> Result<LedgerDrift> {
        let accepted = store::accepted_observations(&self.db, segment_id).await?;
        let ledger: HashSet<Uuid> = self
            .aggregator
            .ledger_ids(segment_id)
            .await?
            .into_iter()
            .collect();
        let accepted_ids: HashSet<Uuid> = accepted.iter().map(|(id, _)| *id).collect();

        let missing = accepted
            .into_iter()
            .filter(|(id, _)| !ledger.contains(id))
            .collect();
        let mut stray: Vec<Uuid> = ledger
            .into_iter()
            .filter(|id| !accepted_ids.contains(id))
            .collect();
        stray.sort();
        Ok(LedgerDrift { missing, stray })
    }
}

struct LedgerDrift {
    /// Accepted on the segment but never folded
    missing: Vec<(Uuid, f64)>,
    /// Folded but no longer accepted on the segment
    stray: Vec<Uuid>,
}

/// Refuses severities that carry no value and clamps the rest into 0-10.
fn sanitize(mut observation: DefectObservation) -> Result<DefectObservation> {
    if !observation.severity_score.is_finite() {
        return Err(EngineError::InvalidObservation(
            observation.id,
            format!("severity {} is not a number", observation.severity_score),
        ));
    }
    if !(0.0..=10.0).contains(&observation.severity_score) {
        warn!(
            "Observation {} severity {} outside 0-10, clamping",
            observation.id, observation.severity_score
        );
        observation.severity_score = observation.severity_score.clamp(0.0, 10.0);
    }
    Ok(observation)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn observation(severity: f64) -> DefectObservation {
        DefectObservation {
            id: Uuid::new_v4(),
            location: Some(Point::new(4.35, 50.85)),
            heading: None,
            defect_type: "D00".to_string(),
            severity_score: severity,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn severities_are_clamped() {
        assert_eq!(sanitize(observation(14.0)).unwrap().severity_score, 10.0);
        assert_eq!(sanitize(observation(-2.0)).unwrap().severity_score, 0.0);
        assert_eq!(sanitize(observation(6.5)).unwrap().severity_score, 6.5);
    }

    #[test]
    fn nan_severity_is_refused() {
        assert!(matches!(
            sanitize(observation(f64::NAN)),
            Err(EngineError::InvalidObservation(_, _))
        ));
    }
}
