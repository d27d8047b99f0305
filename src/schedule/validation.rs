use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::error::{Result, ValidationErrors};
use crate::types::{ScheduleRequest, StepValue};

const STEP_VALUE_MESSAGE: &str = "Step value must be a number between 0 and 100 for rollout steps";
const FUTURE_MESSAGE: &str = "Scheduled time must be in the future";

/// Checks a create/update request against the schedule invariants as of `now`.
/// Every issue is collected before returning.
pub fn validate_request(request: &ScheduleRequest, now: DateTime<Utc>) -> Result<()> {
    let mut errors = ValidationErrors::default();
    let steps = request.rollout_steps.as_deref().unwrap_or_default();

    if !request.schedule_type.is_batch() {
        if !steps.is_empty() {
            errors.push(
                "rolloutSteps",
                "Rollout steps allowed only for update_rollout type",
            );
        }
        match request.scheduled_at {
            Some(at) if at <= now => errors.push("scheduledAt", FUTURE_MESSAGE),
            Some(_) => {}
            None => errors.push(
                "scheduledAt",
                "Date time is required for enable/disable schedule types",
            ),
        }
        return errors.into_result();
    }

    if request.scheduled_at.is_some() {
        errors.push(
            "scheduledAt",
            "scheduledAt not allowed for rollout schedules",
        );
        return errors.into_result();
    }

    if steps.is_empty() {
        errors.push(
            "rolloutSteps",
            "Rollout steps are required for batch rollout schedules",
        );
        return errors.into_result();
    }

    let mut seen = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        match step.value {
            StepValue::Percentage(value) if (0..=100).contains(&value) => {}
            _ => errors.push(format!("rolloutSteps[{index}].value"), STEP_VALUE_MESSAGE),
        }
        if step.scheduled_at <= now {
            errors.push(format!("rolloutSteps[{index}].scheduledAt"), FUTURE_MESSAGE);
        }
        if !seen.insert(step.scheduled_at) {
            errors.push(
                format!("rolloutSteps[{index}].scheduledAt"),
                "Rollout steps must have distinct scheduled times",
            );
        }
    }

    errors.into_result()
}
