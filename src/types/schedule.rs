use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Enable,
    Disable,
    UpdateRollout,
}

impl ScheduleType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Enable => "enable",
            ScheduleType::Disable => "disable",
            ScheduleType::UpdateRollout => "update_rollout",
        }
    }

    /// Batch schedules fire once per rollout step; the rest fire once.
    #[must_use]
    pub const fn is_batch(self) -> bool {
        matches!(self, ScheduleType::UpdateRollout)
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enable" => Ok(ScheduleType::Enable),
            "disable" => Ok(ScheduleType::Disable),
            "update_rollout" => Ok(ScheduleType::UpdateRollout),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Enable,
    Disable,
}

/// Value of a rollout step: a percentage, or a literal enable/disable tag.
///
/// Percentages are whole numbers; `50.0` reads as 50 and `50.5` is rejected.
/// Only the percentage form passes schedule validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StepValue {
    Percentage(i64),
    Action(StepAction),
}

impl<'de> Deserialize<'de> for StepValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(StepValueVisitor)
    }
}

struct StepValueVisitor;

impl Visitor<'_> for StepValueVisitor {
    type Value = StepValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a whole rollout percentage or \"enable\"/\"disable\"")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<StepValue, E> {
        Ok(StepValue::Percentage(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<StepValue, E> {
        i64::try_from(v)
            .map(StepValue::Percentage)
            .map_err(|_| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<StepValue, E> {
        // Beyond 2^53 floats stop being exact integers.
        if v.fract() == 0.0 && v.abs() <= 9_007_199_254_740_992.0 {
            Ok(StepValue::Percentage(v as i64))
        } else {
            Err(E::invalid_value(Unexpected::Float(v), &self))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<StepValue, E> {
        match v {
            "enable" => Ok(StepValue::Action(StepAction::Enable)),
            "disable" => Ok(StepValue::Action(StepAction::Disable)),
            other => Err(E::unknown_variant(other, &["enable", "disable"])),
        }
    }
}

impl StepValue {
    #[must_use]
    pub fn percentage(self) -> Option<i64> {
        match self {
            StepValue::Percentage(p) => Some(p),
            StepValue::Action(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStep {
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    pub value: StepValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagSchedule {
    pub id: String,
    pub flag_id: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollout_steps: Vec<RolloutStep>,
    /// Ids returned by the delivery service for this schedule's pending messages.
    #[serde(default)]
    pub message_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlagSchedule {
    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.schedule_type.is_batch()
    }

    #[must_use]
    pub fn step_at(&self, scheduled_at: DateTime<Utc>) -> Option<&RolloutStep> {
        self.rollout_steps
            .iter()
            .find(|step| step.scheduled_at == scheduled_at)
    }

    /// One message per fire time: the single `scheduled_at`, or one per step.
    #[must_use]
    pub fn messages(&self) -> Vec<(DispatchMessage, DateTime<Utc>)> {
        if self.is_batch() {
            return self
                .rollout_steps
                .iter()
                .map(|step| {
                    let message = DispatchMessage {
                        schedule_id: self.id.clone(),
                        schedule_type: self.schedule_type,
                        flag_id: self.flag_id.clone(),
                        scheduled_at: None,
                        step_scheduled_at: Some(step.scheduled_at),
                        step_value: Some(step.value),
                    };
                    (message, step.scheduled_at)
                })
                .collect();
        }

        self.scheduled_at
            .map(|at| {
                let message = DispatchMessage {
                    schedule_id: self.id.clone(),
                    schedule_type: self.schedule_type,
                    flag_id: self.flag_id.clone(),
                    scheduled_at: Some(at),
                    step_scheduled_at: None,
                    step_value: None,
                };
                vec![(message, at)]
            })
            .unwrap_or_default()
    }
}

/// Step as submitted by an operator. Any `executedAt` in the request is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStepInput {
    pub scheduled_at: DateTime<Utc>,
    pub value: StepValue,
}

/// Create/update payload for a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub flag_id: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub is_enabled: bool,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rollout_steps: Option<Vec<RolloutStepInput>>,
}

/// Payload carried by a delayed message. The schedule row stays authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub schedule_id: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub flag_id: String,
    /// Fire time of a single-shot schedule when the message was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_value: Option<StepValue>,
}
