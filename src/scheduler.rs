use chrono::{DateTime, Utc};
use log::{info, warn};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use uuid::Uuid;

use crate::entity::maintenance_tasks;
use crate::error::{EngineError, Result};
use crate::model::{
    MaintenanceTask, PriorityLevel, PriorityScore, SegmentId, TaskStatus, TaskType,
};
use crate::store;

const OPEN_STATUSES: [TaskStatus; 3] = [
    TaskStatus::Pending,
    TaskStatus::Scheduled,
    TaskStatus::InProgress,
];

/// What a score change did to the segment's tasks
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Created(MaintenanceTask),
    ScoreUpdated { task_id: Uuid, priority_score: f64 },
}

/// Promotes segments into maintenance tasks and drives the task lifecycle.
#[derive(Debug, Clone, Default)]
pub struct TaskScheduler;

impl TaskScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Called with every committed score, inside the score's transaction. Runs on the
    /// segment's aggregation worker, so creation for one segment never races itself.
    pub async fn on_score<C: ConnectionTrait>(
        &self,
        db: &C,
        previous_level: Option<PriorityLevel>,
        score: &PriorityScore,
    ) -> Result<Option<TaskEvent>> {
        if let Some(open) = open_task(db, score.segment_id).await? {
            maintenance_tasks::Entity::update_many()
                .col_expr(
                    maintenance_tasks::Column::PriorityScore,
                    Expr::value(score.total_score),
                )
                .col_expr(
                    maintenance_tasks::Column::UpdatedAt,
                    Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(Utc::now())),
                )
                .filter(maintenance_tasks::Column::Id.eq(open.id))
                .exec(db)
                .await?;
            return Ok(Some(TaskEvent::ScoreUpdated {
                task_id: open.id,
                priority_score: score.total_score,
            }));
        }

        // Entering HIGH, or escalating into CRITICAL with nothing open
        let entered = |threshold: PriorityLevel| {
            score.priority_level >= threshold
                && previous_level.is_none_or(|level| level < threshold)
        };
        if !entered(PriorityLevel::High) && !entered(PriorityLevel::Critical) {
            return Ok(None);
        }

        let now = Utc::now();
        let task = MaintenanceTask {
            id: Uuid::new_v4(),
            segment_id: score.segment_id,
            task_type: match score.priority_level {
                PriorityLevel::Critical => TaskType::Repair,
                _ => TaskType::Inspection,
            },
            status: TaskStatus::Pending,
            priority_score: score.total_score,
            estimated_cost: Some(score.estimated_cost),
            notes: None,
            scheduled_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        maintenance_tasks::Entity::insert(to_active(&task))
            .exec_without_returning(db)
            .await?;

        info!(
            "Segment {} reached {} ({:.2}), created {:?} task {}",
            score.segment_id, score.priority_level, score.total_score, task.task_type, task.id
        );
        Ok(Some(TaskEvent::Created(task)))
    }

    /// Moves a task along its lifecycle. Completing a task stamps the segment's
    /// maintenance date.
    pub async fn update_status(
        &self,
        db: &DatabaseConnection,
        task_id: Uuid,
        next: TaskStatus,
        notes: Option<String>,
    ) -> Result<MaintenanceTask> {
        let txn = db.begin().await?;
        let current = maintenance_tasks::Entity::find_by_id(task_id)
            .one(&txn)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;

        if !current.status.can_transition_to(next) {
            warn!(
                "Refusing transition of task {} from {:?} to {:?}",
                task_id, current.status, next
            );
            return Err(EngineError::InvalidTransition {
                id: task_id,
                from: current.status,
                to: next,
            });
        }

        let now = Utc::now();
        let mut update = maintenance_tasks::Entity::update_many()
            .col_expr(maintenance_tasks::Column::Status, Expr::value(next))
            .col_expr(
                maintenance_tasks::Column::UpdatedAt,
                Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(now)),
            );
        if next == TaskStatus::Scheduled {
            update = update.col_expr(
                maintenance_tasks::Column::ScheduledAt,
                Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(now)),
            );
        }
        if next == TaskStatus::Completed {
            update = update.col_expr(
                maintenance_tasks::Column::CompletedAt,
                Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(now)),
            );
        }
        if let Some(notes) = notes {
            update = update.col_expr(maintenance_tasks::Column::Notes, Expr::value(notes));
        }

        // Compare-and-set on the status read above
        let changed = update
            .filter(maintenance_tasks::Column::Id.eq(task_id))
            .filter(maintenance_tasks::Column::Status.eq(current.status))
            .exec(&txn)
            .await?
            .rows_affected;
        if changed == 0 {
            return Err(EngineError::InvalidTransition {
                id: task_id,
                from: current.status,
                to: next,
            });
        }

        if next == TaskStatus::Completed {
            store::set_last_maintenance(&txn, current.segment_id, now).await?;
        }

        let updated = maintenance_tasks::Entity::find_by_id(task_id)
            .one(&txn)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        txn.commit().await?;

        info!(
            "Task {} for segment {} moved {:?} -> {:?}",
            task_id, updated.segment_id, current.status, next
        );
        Ok(from_model(updated))
    }

    pub async fn get(&self, db: &DatabaseConnection, task_id: Uuid) -> Result<MaintenanceTask> {
        maintenance_tasks::Entity::find_by_id(task_id)
            .one(db)
            .await?
            .map(from_model)
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    pub async fn list(
        &self,
        db: &DatabaseConnection,
        status: Option<TaskStatus>,
        segment_id: Option<SegmentId>,
        limit: u64,
    ) -> Result<Vec<MaintenanceTask>> {
        let mut query = maintenance_tasks::Entity::find()
            .order_by_desc(maintenance_tasks::Column::PriorityScore)
            .order_by_asc(maintenance_tasks::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(maintenance_tasks::Column::Status.eq(status));
        }
        if let Some(segment_id) = segment_id {
            query = query.filter(maintenance_tasks::Column::SegmentId.eq(segment_id));
        }
        Ok(query
            .limit(limit)
            .all(db)
            .await?
            .into_iter()
            .map(from_model)
            .collect())
    }

    pub async fn open_task_for<C: ConnectionTrait>(
        &self,
        db: &C,
        segment_id: SegmentId,
    ) -> Result<Option<MaintenanceTask>> {
        Ok(open_task(db, segment_id).await?.map(from_model))
    }
}

async fn open_task<C: ConnectionTrait>(
    db: &C,
    segment_id: SegmentId,
) -> Result<Option<maintenance_tasks::Model>> {
    Ok(maintenance_tasks::Entity::find()
        .filter(maintenance_tasks::Column::SegmentId.eq(segment_id))
        .filter(maintenance_tasks::Column::Status.is_in(OPEN_STATUSES))
        .order_by_desc(maintenance_tasks::Column::CreatedAt)
        .one(db)
        .await?)
}

fn to_active(task: &MaintenanceTask) -> maintenance_tasks::ActiveModel {
    maintenance_tasks::ActiveModel {
        id: Set(task.id),
        segment_id: Set(task.segment_id),
        task_type: Set(task.task_type),
        status: Set(task.status),
        priority_score: Set(task.priority_score),
        estimated_cost: Set(task.estimated_cost),
        notes: Set(task.notes.clone()),
        scheduled_at: Set(task.scheduled_at.map(Into::into)),
        completed_at: Set(task.completed_at.map(Into::into)),
        created_at: Set(task.created_at.into()),
        updated_at: Set(task.updated_at.into()),
    }
}

fn from_model(model: maintenance_tasks::Model) -> MaintenanceTask {
    let utc = |dt: sea_orm::prelude::DateTimeWithTimeZone| -> DateTime<Utc> { dt.with_timezone(&Utc) };
    MaintenanceTask {
        id: model.id,
        segment_id: model.segment_id,
        task_type: model.task_type,
        status: model.status,
        priority_score: model.priority_score,
        estimated_cost: model.estimated_cost,
        notes: model.notes,
        scheduled_at: model.scheduled_at.map(utc),
        completed_at: model.completed_at.map(utc),
        created_at: utc(model.created_at),
        updated_at: utc(model.updated_at),
    }
}
