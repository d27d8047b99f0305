//! Execution of dispatched schedule messages.
//!
//! Delivery is at-least-once, so every message is checked against the schedule
//! row before anything changes. The final check-and-act is a compare-and-set on
//! the `executed_at` stamp, made in the same transaction as the flag mutation.

mod consumer;
mod rate_limit;

pub use consumer::{ConsumerConfig, ScheduleConsumer};
pub use rate_limit::RateLimiter;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{CacheInvalidator, invalidate_quietly};
use crate::cascade::{CascadeEngine, CascadeReport};
use crate::error::{Error, Result};
use crate::store::{ApplyOutcome, ExecutionTarget, FlagMutation, Store};
use crate::types::{
    DispatchMessage, FlagSchedule, FlagStatus, RolloutStep, ScheduleType, StepAction, StepValue,
};

/// Applies a schedule to its flag, stamping `executed_at` atomically with the
/// mutation.
#[async_trait]
pub trait ExecutionRoutine: Send + Sync {
    async fn apply(&self, schedule: &FlagSchedule, step: Option<&RolloutStep>)
    -> Result<ApplyOutcome>;
}

/// Execution routine backed by [`Store::apply_schedule`].
pub struct StoreExecutionRoutine {
    store: Arc<dyn Store>,
}

impl StoreExecutionRoutine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

fn mutation_for(schedule: &FlagSchedule, step: Option<&RolloutStep>) -> Result<FlagMutation> {
    match (schedule.schedule_type, step) {
        (ScheduleType::Enable, _) => Ok(FlagMutation::Status(FlagStatus::Active)),
        (ScheduleType::Disable, _) => Ok(FlagMutation::Status(FlagStatus::Inactive)),
        (ScheduleType::UpdateRollout, Some(step)) => Ok(match step.value {
            StepValue::Percentage(p) => FlagMutation::RolloutPercentage(p),
            StepValue::Action(StepAction::Enable) => FlagMutation::Status(FlagStatus::Active),
            StepValue::Action(StepAction::Disable) => FlagMutation::Status(FlagStatus::Inactive),
        }),
        (ScheduleType::UpdateRollout, None) => Err(Error::Execution(format!(
            "rollout schedule {} fired without a step",
            schedule.id
        ))),
    }
}

#[async_trait]
impl ExecutionRoutine for StoreExecutionRoutine {
    async fn apply(
        &self,
        schedule: &FlagSchedule,
        step: Option<&RolloutStep>,
    ) -> Result<ApplyOutcome> {
        let mutation = mutation_for(schedule, step)?;
        let target = match step {
            Some(step) => ExecutionTarget::Step(step.scheduled_at),
            None => ExecutionTarget::Schedule,
        };
        self.store
            .apply_schedule(&schedule.id, target, mutation, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    AlreadyExecuted,
    StepAlreadyExecuted,
    /// The message no longer matches the schedule definition.
    Superseded,
}

impl SkipReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::AlreadyExecuted => "already_executed",
            SkipReason::StepAlreadyExecuted => "step_already_executed",
            SkipReason::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum JobOutcome {
    Executed {
        flag_id: String,
        status: FlagStatus,
        rollout_percentage: i64,
        cascade: CascadeReport,
    },
    Skipped {
        reason: SkipReason,
    },
}

pub struct ExecutionWorker {
    store: Arc<dyn Store>,
    routine: Arc<dyn ExecutionRoutine>,
    cache: Arc<dyn CacheInvalidator>,
    cascade: CascadeEngine,
}

impl ExecutionWorker {
    pub fn new(
        store: Arc<dyn Store>,
        routine: Arc<dyn ExecutionRoutine>,
        cache: Arc<dyn CacheInvalidator>,
        cascade: CascadeEngine,
    ) -> Self {
        Self {
            store,
            routine,
            cache,
            cascade,
        }
    }

    /// Handles one delivery. Errors propagate unchanged; retrying is the
    /// queue's business.
    pub async fn process(&self, message: &DispatchMessage) -> Result<JobOutcome> {
        let schedule = self
            .store
            .get_schedule(&message.schedule_id)?
            .ok_or(Error::NotFound("schedule"))?;

        let step = match check_delivery(&schedule, message) {
            Ok(step) => step,
            Err(reason) => return Ok(skipped(message, reason)),
        };

        let (previous, updated) = match self.routine.apply(&schedule, step).await? {
            ApplyOutcome::Applied { previous, updated } => (previous, updated),
            ApplyOutcome::AlreadyClaimed => {
                let reason = if step.is_some() {
                    SkipReason::StepAlreadyExecuted
                } else {
                    SkipReason::AlreadyExecuted
                };
                return Ok(skipped(message, reason));
            }
        };

        info!(
            schedule_id = %schedule.id,
            flag_id = %updated.id,
            status = %updated.status,
            rollout_percentage = updated.rollout_percentage,
            "Executed schedule"
        );
        invalidate_quietly(self.cache.as_ref(), &updated).await;

        let cascade = if previous.status != updated.status
            && matches!(updated.status, FlagStatus::Active | FlagStatus::Inactive)
        {
            self.cascade.cascade(&updated, updated.status).await?
        } else {
            CascadeReport::default()
        };

        Ok(JobOutcome::Executed {
            flag_id: updated.id,
            status: updated.status,
            rollout_percentage: updated.rollout_percentage,
            cascade,
        })
    }
}

fn skipped(message: &DispatchMessage, reason: SkipReason) -> JobOutcome {
    debug!(schedule_id = %message.schedule_id, reason = reason.as_str(), "skipping delivery");
    JobOutcome::Skipped { reason }
}

/// Read-side idempotency checks. Returns the step to fire for batch schedules.
fn check_delivery<'a>(
    schedule: &'a FlagSchedule,
    message: &DispatchMessage,
) -> std::result::Result<Option<&'a RolloutStep>, SkipReason> {
    if !schedule.is_enabled {
        return Err(SkipReason::Disabled);
    }
    if message.schedule_type != schedule.schedule_type {
        return Err(SkipReason::Superseded);
    }

    if !schedule.is_batch() {
        if message
            .scheduled_at
            .is_some_and(|at| schedule.scheduled_at != Some(at))
        {
            return Err(SkipReason::Superseded);
        }
        if schedule.executed_at.is_some() {
            return Err(SkipReason::AlreadyExecuted);
        }
        return Ok(None);
    }

    let step = message
        .step_scheduled_at
        .and_then(|at| schedule.step_at(at))
        .ok_or(SkipReason::Superseded)?;
    if step.executed_at.is_some() {
        return Err(SkipReason::StepAlreadyExecuted);
    }
    Ok(Some(step))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::RecordingInvalidator;
    use crate::store::SqliteStore;
    use crate::types::{Flag, FlagScope, FlagType};

    struct Harness {
        _temp: TempDir,
        store: Arc<SqliteStore>,
        cache: Arc<RecordingInvalidator>,
        worker: ExecutionWorker,
    }

    fn harness(flags: &[Flag]) -> Harness {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::new(temp.path().join("test.db")).unwrap());
        store.initialize().unwrap();
        for f in flags {
            store.create_flag(f).unwrap();
        }

        let cache = Arc::new(RecordingInvalidator::new());
        let cascade = CascadeEngine::new(store.clone(), cache.clone());
        let worker = ExecutionWorker::new(
            store.clone(),
            Arc::new(StoreExecutionRoutine::new(store.clone())),
            cache.clone(),
            cascade,
        );
        Harness {
            _temp: temp,
            store,
            cache,
            worker,
        }
    }

    fn flag(id: &str, status: FlagStatus, deps: &[&str]) -> Flag {
        let now = Utc::now();
        Flag {
            id: id.to_string(),
            key: id.to_string(),
            name: None,
            description: None,
            flag_type: FlagType::Rollout,
            status,
            default_value: false,
            rollout_percentage: 0,
            rollout_by: None,
            rules: vec![],
            variants: vec![],
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            scope: FlagScope::Website("site".to_string()),
            environment: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn single_shot(id: &str, flag_id: &str, schedule_type: ScheduleType) -> FlagSchedule {
        let now = Utc::now();
        FlagSchedule {
            id: id.to_string(),
            flag_id: flag_id.to_string(),
            schedule_type,
            is_enabled: true,
            scheduled_at: Some(now + Duration::minutes(5)),
            executed_at: None,
            rollout_steps: vec![],
            message_ids: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    fn only_message(schedule: &FlagSchedule) -> DispatchMessage {
        schedule.messages().remove(0).0
    }

    #[tokio::test]
    async fn test_single_shot_executes_once() {
        let h = harness(&[flag("f", FlagStatus::Active, &[])]);
        let schedule = single_shot("s", "f", ScheduleType::Disable);
        h.store.create_schedule(&schedule).unwrap();
        let message = only_message(&schedule);

        let first = h.worker.process(&message).await.unwrap();
        assert!(matches!(
            first,
            JobOutcome::Executed { status: FlagStatus::Inactive, .. }
        ));
        let stamped = h.store.get_schedule("s").unwrap().unwrap().executed_at;
        assert!(stamped.is_some());

        let second = h.worker.process(&message).await.unwrap();
        assert_eq!(
            second,
            JobOutcome::Skipped {
                reason: SkipReason::AlreadyExecuted
            }
        );
        assert_eq!(h.store.get_schedule("s").unwrap().unwrap().executed_at, stamped);
        assert_eq!(h.cache.invalidated_flag_ids(), vec!["f".to_string()]);
    }

    #[tokio::test]
    async fn test_disabled_schedule_is_skipped() {
        let h = harness(&[flag("f", FlagStatus::Active, &[])]);
        let mut schedule = single_shot("s", "f", ScheduleType::Disable);
        schedule.is_enabled = false;
        h.store.create_schedule(&schedule).unwrap();

        let outcome = h.worker.process(&only_message(&schedule)).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Skipped {
                reason: SkipReason::Disabled
            }
        );
        assert_eq!(
            h.store.get_flag("f").unwrap().unwrap().status,
            FlagStatus::Active
        );
    }

    #[tokio::test]
    async fn test_missing_schedule_fails_the_job() {
        let h = harness(&[]);
        let message = only_message(&single_shot("gone", "f", ScheduleType::Enable));
        assert!(matches!(
            h.worker.process(&message).await,
            Err(Error::NotFound("schedule"))
        ));
    }

    #[tokio::test]
    async fn test_superseded_step_is_skipped() {
        let h = harness(&[flag("f", FlagStatus::Active, &[])]);
        let now = Utc::now();
        let mut schedule = single_shot("s", "f", ScheduleType::UpdateRollout);
        schedule.scheduled_at = None;
        schedule.rollout_steps = vec![RolloutStep {
            scheduled_at: now + Duration::hours(1),
            executed_at: None,
            value: StepValue::Percentage(30),
        }];
        h.store.create_schedule(&schedule).unwrap();

        let mut message = only_message(&schedule);
        message.step_scheduled_at = Some(now + Duration::hours(2));
        assert_eq!(
            h.worker.process(&message).await.unwrap(),
            JobOutcome::Skipped {
                reason: SkipReason::Superseded
            }
        );
    }

    #[tokio::test]
    async fn test_status_change_triggers_cascade() {
        let h = harness(&[
            flag("a", FlagStatus::Active, &[]),
            flag("b", FlagStatus::Active, &["a"]),
        ]);
        let schedule = single_shot("s", "a", ScheduleType::Disable);
        h.store.create_schedule(&schedule).unwrap();

        let outcome = h.worker.process(&only_message(&schedule)).await.unwrap();
        let JobOutcome::Executed { cascade, .. } = outcome else {
            panic!("expected execution");
        };
        assert_eq!(cascade.deactivated, vec!["b".to_string()]);
        assert_eq!(
            h.store.get_flag("b").unwrap().unwrap().status,
            FlagStatus::Inactive
        );
    }

    #[tokio::test]
    async fn test_unchanged_status_does_not_cascade() {
        let h = harness(&[
            flag("a", FlagStatus::Inactive, &[]),
            flag("b", FlagStatus::Active, &["a"]),
        ]);
        let schedule = single_shot("s", "a", ScheduleType::Disable);
        h.store.create_schedule(&schedule).unwrap();

        let outcome = h.worker.process(&only_message(&schedule)).await.unwrap();
        let JobOutcome::Executed { cascade, .. } = outcome else {
            panic!("expected execution");
        };
        assert!(cascade.is_empty());
        assert_eq!(
            h.store.get_flag("b").unwrap().unwrap().status,
            FlagStatus::Active
        );
    }

    #[test]
    fn test_outcome_wire_shape() {
        let json = serde_json::to_value(JobOutcome::Skipped {
            reason: SkipReason::StepAlreadyExecuted,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"outcome": "skipped", "reason": "step_already_executed"})
        );
    }
}
