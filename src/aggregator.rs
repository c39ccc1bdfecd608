//! Per-segment defect aggregation.
//!
//! Every segment is owned by one worker task that receives commands over a channel,
//! so reads and writes of a segment's aggregate never interleave while different
//! segments progress in parallel. Each fold step is recorded in the
//! `segment_observations` ledger with its sequence number, which makes the
//! aggregate idempotent per observation and exactly reproducible by replay.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, TransactionTrait,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::AggregatorConfig;
use crate::entity::{priority_scores, segment_aggregates, segment_observations};
use crate::error::{EngineError, Result};
use crate::model::{PriorityScore, SegmentAggregate, SegmentId};
use crate::priority::PriorityCalculator;
use crate::scheduler::{TaskEvent, TaskScheduler};
use crate::store;

/// The deterministic fold over a segment's accepted severities.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateStats {
    pub defect_count: u32,
    pub avg_severity: f64,
    pub max_severity: f64,
}

impl AggregateStats {
    /// One incremental step. The running mean avoids summing large populations.
    pub fn apply(self, severity: f64) -> Self {
        let defect_count = self.defect_count + 1;
        Self {
            defect_count,
            avg_severity: self.avg_severity
                + (severity - self.avg_severity) / f64::from(defect_count),
            max_severity: if self.defect_count == 0 {
                severity
            } else {
                self.max_severity.max(severity)
            },
        }
    }

    /// Folds severities in application order.
    pub fn replay(severities: impl IntoIterator<Item = f64>) -> Self {
        severities
            .into_iter()
            .fold(Self::default(), |stats, severity| stats.apply(severity))
    }

    fn from_model(model: &segment_aggregates::Model) -> Result<Self> {
        Ok(Self {
            defect_count: u32::try_from(model.defect_count).map_err(|_| {
                EngineError::Corrupt(format!(
                    "segment {} has negative defect count",
                    model.segment_id
                ))
            })?,
            avg_severity: model.avg_severity,
            max_severity: model.max_severity,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(SegmentAggregate),
    /// Already folded into this segment; nothing changed
    Duplicate,
    /// Already folded into another segment, which must retract it first
    HeldBy(SegmentId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecomputeOutcome {
    Written {
        score: PriorityScore,
        task: Option<TaskEvent>,
    },
    /// A newer request for the same segment was registered
    Superseded,
    /// The segment has never had an accepted defect
    NoAggregate,
}

/// Latest recompute version requested per segment.
#[derive(Default)]
pub struct RecomputeVersions {
    next: AtomicU64,
    latest: Mutex<HashMap<SegmentId, u64>>,
}

impl RecomputeVersions {
    pub fn request(&self, segment_id: SegmentId) -> u64 {
        let version = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let mut latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.insert(segment_id, version);
        version
    }

    pub fn is_current(&self, segment_id: SegmentId, version: u64) -> bool {
        let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.get(&segment_id).is_none_or(|&v| v == version)
    }
}

enum SegmentCommand {
    Apply {
        observation_id: Uuid,
        severity: f64,
        reply: oneshot::Sender<Result<ApplyOutcome>>,
    },
    Retract {
        observation_id: Uuid,
        reply: oneshot::Sender<Result<Option<SegmentAggregate>>>,
    },
    Recompute {
        version: u64,
        reply: oneshot::Sender<Result<RecomputeOutcome>>,
    },
}

struct WorkerContext {
    db: DatabaseConnection,
    config: AggregatorConfig,
    calculator: PriorityCalculator,
    scheduler: TaskScheduler,
    versions: RecomputeVersions,
}

/// Routes commands to the worker that owns each segment.
#[derive(Clone)]
pub struct SegmentAggregator {
    ctx: Arc<WorkerContext>,
    workers: Arc<Mutex<HashMap<SegmentId, mpsc::Sender<SegmentCommand>>>>,
}

impl SegmentAggregator {
    pub fn new(
        db: DatabaseConnection,
        config: AggregatorConfig,
        calculator: PriorityCalculator,
        scheduler: TaskScheduler,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                db,
                config,
                calculator,
                scheduler,
                versions: RecomputeVersions::default(),
            }),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Folds an accepted observation into its segment. Re-delivery is a no-op.
    pub async fn apply(
        &self,
        segment_id: SegmentId,
        observation_id: Uuid,
        severity: f64,
    ) -> Result<ApplyOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(
            segment_id,
            SegmentCommand::Apply {
                observation_id,
                severity,
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| EngineError::WorkerStopped(segment_id))?
    }

    /// Removes an observation that no longer belongs to the segment.
    pub async fn retract(
        &self,
        segment_id: SegmentId,
        observation_id: Uuid,
    ) -> Result<Option<SegmentAggregate>> {
        let (reply, rx) = oneshot::channel();
        self.send(
            segment_id,
            SegmentCommand::Retract {
                observation_id,
                reply,
            },
        )
        .await?;
        rx.await.map_err(|_| EngineError::WorkerStopped(segment_id))?
    }

    /// Recomputes the segment's score. Superseded if a newer request arrives first.
    pub async fn recompute(&self, segment_id: SegmentId) -> Result<RecomputeOutcome> {
        let version = self.ctx.versions.request(segment_id);
        let (reply, rx) = oneshot::channel();
        self.send(segment_id, SegmentCommand::Recompute { version, reply })
            .await?;
        rx.await.map_err(|_| EngineError::WorkerStopped(segment_id))?
    }

    /// Rebuilds the aggregate from the ledger without touching stored state.
    pub async fn replay(&self, segment_id: SegmentId) -> Result<AggregateStats> {
        let entries = ledger(&self.ctx.db, segment_id).await?;
        Ok(AggregateStats::replay(entries.iter().map(|e| e.severity_score)))
    }

    /// Observations currently folded into the segment, in application order.
    pub async fn ledger_ids(&self, segment_id: SegmentId) -> Result<Vec<Uuid>> {
        let entries = ledger(&self.ctx.db, segment_id).await?;
        Ok(entries.into_iter().map(|e| e.observation_id).collect())
    }

    /// True when the stored aggregate equals a replay of the ledger.
    pub async fn verify(&self, segment_id: SegmentId) -> Result<bool> {
        let replayed = self.replay(segment_id).await?;
        let stored = segment_aggregates::Entity::find_by_id(segment_id)
            .one(&self.ctx.db)
            .await?;
        let consistent = match stored {
            Some(model) => AggregateStats::from_model(&model)? == replayed,
            None => replayed.defect_count == 0,
        };
        if !consistent {
            error!("Aggregate of segment {} drifted from its ledger", segment_id);
        }
        Ok(consistent)
    }

    async fn send(&self, segment_id: SegmentId, command: SegmentCommand) -> Result<()> {
        let sender = self.worker(segment_id);
        sender
            .send(command)
            .await
            .map_err(|_| EngineError::WorkerStopped(segment_id))
    }

    fn worker(&self, segment_id: SegmentId) -> mpsc::Sender<SegmentCommand> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = workers.get(&segment_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
            warn!("Worker for segment {} stopped, restarting", segment_id);
        }

        let (tx, rx) = mpsc::channel(self.ctx.config.queue_capacity.max(1));
        let worker = SegmentWorker {
            segment_id,
            ctx: self.ctx.clone(),
        };
        tokio::spawn(worker.run(rx));
        workers.insert(segment_id, tx.clone());
        debug!("Started aggregation worker for segment {}", segment_id);
        tx
    }
}

struct SegmentWorker {
    segment_id: SegmentId,
    ctx: Arc<WorkerContext>,
}

impl SegmentWorker {
    async fn run(self, mut rx: mpsc::Receiver<SegmentCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                SegmentCommand::Apply {
                    observation_id,
                    severity,
                    reply,
                } => {
                    let result = self
                        .retrying("apply", || self.try_apply(observation_id, severity))
                        .await;
                    if matches!(result, Ok(ApplyOutcome::Applied(_))) {
                        self.recompute_after_commit().await;
                    }
                    let _ = reply.send(result);
                }
                SegmentCommand::Retract {
                    observation_id,
                    reply,
                } => {
                    let result = self
                        .retrying("retract", || self.try_retract(observation_id))
                        .await;
                    if matches!(result, Ok(Some(_))) {
                        self.recompute_after_commit().await;
                    }
                    let _ = reply.send(result);
                }
                SegmentCommand::Recompute { version, reply } => {
                    let result = self
                        .retrying("recompute", || self.try_recompute(version))
                        .await;
                    let _ = reply.send(result);
                }
            }
        }
        debug!("Aggregation worker for segment {} shutting down", self.segment_id);
    }

    async fn retrying<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_transient(self.segment_id, what, &self.ctx.config, op).await
    }

    async fn try_apply(&self, observation_id: Uuid, severity: f64) -> Result<ApplyOutcome> {
        let txn = self.ctx.db.begin().await?;

        if let Some(entry) = segment_observations::Entity::find_by_id(observation_id)
            .one(&txn)
            .await?
        {
            return Ok(if entry.segment_id == self.segment_id {
                trace!(
                    "Observation {} already folded into segment {}",
                    observation_id, self.segment_id
                );
                ApplyOutcome::Duplicate
            } else {
                ApplyOutcome::HeldBy(entry.segment_id)
            });
        }

        let current = segment_aggregates::Entity::find_by_id(self.segment_id)
            .one(&txn)
            .await?;
        let (stats, last_seq) = match &current {
            Some(model) => (AggregateStats::from_model(model)?, model.last_seq),
            None => (AggregateStats::default(), 0),
        };

        let stats = stats.apply(severity);
        let seq = last_seq + 1;
        let now = Utc::now();

        segment_observations::Entity::insert(segment_observations::ActiveModel {
            observation_id: Set(observation_id),
            segment_id: Set(self.segment_id),
            seq: Set(seq),
            severity_score: Set(severity),
            applied_at: Set(now.into()),
        })
        .exec_without_returning(&txn)
        .await?;

        write_aggregate(&txn, self.segment_id, stats, seq, now).await?;
        txn.commit().await?;

        debug!(
            "Segment {} now has {} defects (avg {:.2}, max {:.2})",
            self.segment_id, stats.defect_count, stats.avg_severity, stats.max_severity
        );
        Ok(ApplyOutcome::Applied(to_aggregate(self.segment_id, stats, now)))
    }

    async fn try_retract(&self, observation_id: Uuid) -> Result<Option<SegmentAggregate>> {
        let txn = self.ctx.db.begin().await?;

        let Some(entry) = segment_observations::Entity::find_by_id(observation_id)
            .one(&txn)
            .await?
            .filter(|e| e.segment_id == self.segment_id)
        else {
            return Ok(None);
        };
        entry.delete(&txn).await?;

        let last_seq = segment_aggregates::Entity::find_by_id(self.segment_id)
            .one(&txn)
            .await?
            .map(|m| m.last_seq)
            .unwrap_or(0);
        let remaining = ledger(&txn, self.segment_id).await?;
        let stats = AggregateStats::replay(remaining.iter().map(|e| e.severity_score));
        let now = Utc::now();

        write_aggregate(&txn, self.segment_id, stats, last_seq, now).await?;
        txn.commit().await?;

        info!(
            "Retracted observation {} from segment {}, {} defects remain",
            observation_id, self.segment_id, stats.defect_count
        );
        Ok(Some(to_aggregate(self.segment_id, stats, now)))
    }

    async fn recompute_after_commit(&self) {
        let version = self.ctx.versions.request(self.segment_id);
        if let Err(e) = self
            .retrying("recompute", || self.try_recompute(version))
            .await
        {
            // The aggregate is committed; the next sweep picks the score up again
            error!(
                "Priority recompute for segment {} failed after commit: {}",
                self.segment_id, e
            );
        }
    }

    async fn try_recompute(&self, version: u64) -> Result<RecomputeOutcome> {
        if !self.ctx.versions.is_current(self.segment_id, version) {
            trace!(
                "Recompute v{} of segment {} superseded before start",
                version, self.segment_id
            );
            return Ok(RecomputeOutcome::Superseded);
        }

        let Some(model) = segment_aggregates::Entity::find_by_id(self.segment_id)
            .one(&self.ctx.db)
            .await?
        else {
            return Ok(RecomputeOutcome::NoAggregate);
        };
        let aggregate = to_aggregate(
            self.segment_id,
            AggregateStats::from_model(&model)?,
            model.updated_at.with_timezone(&Utc),
        );
        let segment = store::load_segment(&self.ctx.db, self.segment_id)
            .await?
            .ok_or(EngineError::SegmentNotFound(self.segment_id))?;

        let score = self.ctx.calculator.compute(&aggregate, &segment, Utc::now());

        let txn = self.ctx.db.begin().await?;
        if !self.ctx.versions.is_current(self.segment_id, version) {
            return Ok(RecomputeOutcome::Superseded);
        }
        let previous_level = priority_scores::Entity::find_by_id(self.segment_id)
            .one(&txn)
            .await?
            .map(|m| m.priority_level);
        store::write_score(&txn, &score, version).await?;
        let task = self
            .ctx
            .scheduler
            .on_score(&txn, previous_level, &score)
            .await?;
        txn.commit().await?;

        debug!(
            "Segment {} priority {:.2} ({})",
            self.segment_id, score.total_score, score.priority_level
        );
        Ok(RecomputeOutcome::Written { score, task })
    }
}

/// Retries transient failures with exponential backoff, then gives up loudly.
async fn retry_transient<T, F, Fut>(
    segment_id: SegmentId,
    what: &str,
    config: &AggregatorConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_write_attempts.max(1);
    let mut delay = Duration::from_millis(config.retry_base_delay_ms);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    "Segment {} {} failed (attempt {}/{}): {}, retrying in {:?}",
                    segment_id, what, attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                error!("Segment {} {} failed: {}", segment_id, what, e);
                return Err(e);
            }
        }
    }
}

async fn ledger<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
) -> Result<Vec<segment_observations::Model>> {
    Ok(segment_observations::Entity::find()
        .filter(segment_observations::Column::SegmentId.eq(segment_id))
        .order_by_asc(segment_observations::Column::Seq)
        .all(db)
        .await?)
}

async fn write_aggregate<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
    stats: AggregateStats,
    last_seq: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let model = segment_aggregates::ActiveModel {
        segment_id: Set(segment_id),
        defect_count: Set(i32::try_from(stats.defect_count).unwrap_or(i32::MAX)),
        avg_severity: Set(stats.avg_severity),
        max_severity: Set(stats.max_severity),
        last_seq: Set(last_seq),
        updated_at: Set(now.into()),
    };
    segment_aggregates::Entity::insert(model)
        .on_conflict(
            OnConflict::column(segment_aggregates::Column::SegmentId)
                .update_columns([
                    segment_aggregates::Column::DefectCount,
                    segment_aggregates::Column::AvgSeverity,
                    segment_aggregates::Column::MaxSeverity,
                    segment_aggregates::Column::LastSeq,
                    segment_aggregates::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

fn to_aggregate(
    segment_id: SegmentId,
    stats: AggregateStats,
    updated_at: DateTime<Utc>,
) -> SegmentAggregate {
    SegmentAggregate {
        segment_id,
        defect_count: stats.defect_count,
        avg_severity: stats.avg_severity,
        max_severity: stats.max_severity,
        updated_at,
    }
}

/// Current aggregate of a segment, if it ever had an accepted defect.
pub async fn load_aggregate<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
) -> Result<Option<SegmentAggregate>> {
    segment_aggregates::Entity::find_by_id(segment_id)
        .one(db)
        .await?
        .map(|model| {
            Ok(to_aggregate(
                model.segment_id,
                AggregateStats::from_model(&model)?,
                model.updated_at.with_timezone(&Utc),
            ))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use sea_orm::{DbErr, RuntimeErr};

    use super::*;

    fn fast_retries(attempts: u32) -> AggregatorConfig {
        AggregatorConfig {
            max_write_attempts: attempts,
            retry_base_delay_ms: 1,
            ..AggregatorConfig::default()
        }
    }

    fn connection_lost() -> EngineError {
        EngineError::Database(DbErr::Conn(RuntimeErr::Internal(
            "connection reset".to_string(),
        )))
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(1, "apply", &fast_retries(4), || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call < 4 {
                    Err(connection_lost())
                } else {
                    Ok(call)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(1, "apply", &fast_retries(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(connection_lost()) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Database(DbErr::Conn(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(1, "apply", &fast_retries(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Corrupt("negative count".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::Corrupt(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn running_mean_matches_direct_mean() {
        let severities = [3.0, 7.5, 9.0, 1.0, 6.25];
        let stats = AggregateStats::replay(severities);
        assert_eq!(stats.defect_count, 5);
        assert!((stats.avg_severity - 5.35).abs() < 1e-12);
        assert_eq!(stats.max_severity, 9.0);
    }

    #[test]
    fn incremental_and_replay_agree_bit_for_bit() {
        let severities: Vec<f64> = (0..500).map(|i| ((i * 37) % 101) as f64 / 10.1).collect();
        let mut incremental = AggregateStats::default();
        for s in &severities {
            incremental = incremental.apply(*s);
        }
        assert_eq!(incremental, AggregateStats::replay(severities));
    }

    #[test]
    fn first_defect_sets_max_even_when_zero() {
        let stats = AggregateStats::default().apply(0.0);
        assert_eq!(stats.max_severity, 0.0);
        assert_eq!(stats.avg_severity, 0.0);
        assert_eq!(stats.defect_count, 1);
    }

    #[test]
    fn newer_recompute_supersedes_older() {
        let versions = RecomputeVersions::default();
        let first = versions.request(4);
        let second = versions.request(4);
        let other = versions.request(5);
        assert!(!versions.is_current(4, first));
        assert!(versions.is_current(4, second));
        assert!(versions.is_current(5, other));
    }
}
