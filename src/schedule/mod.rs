//! Schedule lifecycle: validation, dispatch and cancellation of delayed messages.
//!
//! Creation is all-or-nothing. A batch rollout dispatches every step in parallel;
//! if any dispatch fails the successful ones are canceled and nothing is stored.

mod validation;

pub use validation::validate_request;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatch::DispatchGateway;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{FlagSchedule, RolloutStep, ScheduleRequest};

#[derive(Clone)]
pub struct ScheduleManager {
    store: Arc<dyn Store>,
    gateway: DispatchGateway,
}

impl ScheduleManager {
    pub fn new(store: Arc<dyn Store>, gateway: DispatchGateway) -> Self {
        Self { store, gateway }
    }

    pub fn get(&self, id: &str) -> Result<FlagSchedule> {
        self.store.get_schedule(id)?.ok_or(Error::NotFound("schedule"))
    }

    pub fn list_for_flag(&self, flag_id: &str) -> Result<Vec<FlagSchedule>> {
        self.store.list_flag_schedules(flag_id)
    }

    pub async fn create(&self, request: ScheduleRequest) -> Result<FlagSchedule> {
        let now = Utc::now();
        validate_request(&request, now)?;
        self.ensure_flag(&request.flag_id)?;

        let mut schedule = build_schedule(Uuid::new_v4().to_string(), request, now, now);
        schedule.message_ids = self.dispatch(&schedule).await?;

        if let Err(err) = self.store.create_schedule(&schedule) {
            error!(schedule_id = %schedule.id, error = %err, "Failed to persist schedule, canceling its messages");
            self.cancel_messages(&schedule.message_ids).await;
            return Err(err);
        }

        info!(
            schedule_id = %schedule.id,
            flag_id = %schedule.flag_id,
            schedule_type = %schedule.schedule_type,
            messages = schedule.message_ids.len(),
            "Created schedule"
        );
        Ok(schedule)
    }

    /// Replaces a schedule's definition. Old messages are canceled before the new
    /// ones are dispatched, and every `executedAt` stamp is reset.
    pub async fn update(&self, id: &str, request: ScheduleRequest) -> Result<FlagSchedule> {
        let now = Utc::now();
        validate_request(&request, now)?;
        let existing = self.get(id)?;
        self.ensure_flag(&request.flag_id)?;

        self.cancel_messages(&existing.message_ids).await;

        let mut schedule = build_schedule(existing.id, request, existing.created_at, now);
        schedule.message_ids = self.dispatch(&schedule).await?;

        if let Err(err) = self.store.replace_schedule(&schedule) {
            error!(schedule_id = %schedule.id, error = %err, "Failed to persist schedule update, canceling its messages");
            self.cancel_messages(&schedule.message_ids).await;
            return Err(err);
        }

        info!(schedule_id = %schedule.id, messages = schedule.message_ids.len(), "Updated schedule");
        Ok(schedule)
    }

    /// Cancels a schedule's messages and soft-disables the row.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let existing = self.get(id)?;
        self.cancel_messages(&existing.message_ids).await;

        if !self.store.disable_schedule(id, Utc::now())? {
            return Err(Error::NotFound("schedule"));
        }
        info!(schedule_id = id, "Disabled schedule");
        Ok(())
    }

    /// Best-effort parallel cancellation.
    pub async fn cancel_messages(&self, message_ids: &[String]) {
        join_all(message_ids.iter().map(|id| self.gateway.cancel(id))).await;
    }

    /// Archived flags count as missing: a schedule could never change them.
    fn ensure_flag(&self, flag_id: &str) -> Result<()> {
        match self.store.get_flag(flag_id)? {
            Some(flag) if !flag.is_archived() => Ok(()),
            _ => Err(Error::NotFound("flag")),
        }
    }

    /// Dispatches one message per fire time. Either every dispatch succeeds and
    /// all message ids are returned, or the successful ones are canceled.
    async fn dispatch(&self, schedule: &FlagSchedule) -> Result<Vec<String>> {
        let messages = schedule.messages();
        let total = messages.len();

        let results = join_all(
            messages
                .iter()
                .map(|(message, not_before)| self.gateway.schedule(message, *not_before)),
        )
        .await;

        let mut dispatched = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(id) => dispatched.push(id),
                Err(err) => failures.push(err),
            }
        }

        if failures.is_empty() {
            return Ok(dispatched);
        }

        warn!(
            schedule_id = %schedule.id,
            failed = failures.len(),
            total,
            "Dispatch failed, canceling {} dispatched messages",
            dispatched.len()
        );
        self.cancel_messages(&dispatched).await;

        if total == 1 {
            if let Some(err) = failures.pop() {
                return Err(err);
            }
        }
        Err(Error::Dispatch(format!(
            "{} of {total} step dispatches failed",
            failures.len()
        )))
    }
}

fn build_schedule(
    id: String,
    request: ScheduleRequest,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> FlagSchedule {
    let rollout_steps = if request.schedule_type.is_batch() {
        request
            .rollout_steps
            .unwrap_or_default()
            .into_iter()
            .map(|step| RolloutStep {
                scheduled_at: step.scheduled_at,
                executed_at: None,
                value: step.value,
            })
            .collect()
    } else {
        Vec::new()
    };

    FlagSchedule {
        id,
        flag_id: request.flag_id,
        schedule_type: request.schedule_type,
        is_enabled: request.is_enabled,
        scheduled_at: request.scheduled_at,
        executed_at: None,
        rollout_steps,
        message_ids: Vec::new(),
        created_at,
        updated_at: now,
    }
}
