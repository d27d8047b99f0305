//! Durable delayed-message queue.
//!
//! This is the self-hosted delivery service behind the dispatch gateway. It owns
//! delivery-time retry and backoff: a failed job goes back to `pending` with an
//! exponentially growing delay until `max_attempts` is reached, after which it is
//! parked as `failed`.

mod sqlite;

pub use sqlite::SqliteDelayQueue;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::DispatchMessage;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub retry_base: Duration,
    /// How long a claimed message stays invisible to other consumers.
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_base: Duration::from_secs(5),
            lease: Duration::from_secs(60),
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `attempts` (1-based): `retry_base * 2^(attempts - 1)`.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.retry_base.saturating_mul(1 << exponent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl MessageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Running => "running",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
            MessageStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "running" => Ok(MessageStatus::Running),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            "canceled" => Ok(MessageStatus::Canceled),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// A message leased to one consumer.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub payload: DispatchMessage,
    /// Deliveries so far, this one included.
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Retrying { next_attempt_at: DateTime<Utc> },
    Failed,
}
