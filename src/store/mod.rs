mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::*;

/// What firing a schedule does to its flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagMutation {
    Status(FlagStatus),
    RolloutPercentage(i64),
}

/// Which `executed_at` stamp an execution claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    /// The schedule-level stamp of a single-shot schedule.
    Schedule,
    /// The stamp of the rollout step firing at this time.
    Step(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The stamp was claimed and the mutation committed with it.
    Applied { previous: Flag, updated: Flag },
    /// Another delivery already stamped this target; nothing changed.
    AlreadyClaimed,
}

/// Store defines the flag and schedule persistence interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Flag operations
    fn create_flag(&self, flag: &Flag) -> Result<()>;
    fn get_flag(&self, id: &str) -> Result<Option<Flag>>;
    fn get_flag_by_key(&self, scope: &FlagScope, key: &str) -> Result<Option<Flag>>;
    fn list_flags(&self, scope: &FlagScope, status: Option<FlagStatus>) -> Result<Vec<Flag>>;

    /// Overwrites a flag's columns, provided its `updated_at` still equals
    /// `expected_updated_at`. A flag changed since it was read is a `Conflict`.
    fn update_flag(&self, flag: &Flag, expected_updated_at: DateTime<Utc>) -> Result<()>;

    /// Moves a flag from `from` to `to`. Returns false when the flag was no longer
    /// in `from`, so concurrent writers never both apply the same transition.
    fn transition_flag_status(
        &self,
        id: &str,
        from: FlagStatus,
        to: FlagStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Non-archived flags in `scope` that list `key` as a dependency and are
    /// currently in `status`.
    fn list_dependents(
        &self,
        scope: &FlagScope,
        key: &str,
        status: FlagStatus,
    ) -> Result<Vec<Flag>>;

    /// Flags in `scope` whose key is one of `keys`, archived ones included.
    fn get_flags_by_keys(&self, scope: &FlagScope, keys: &[String]) -> Result<Vec<Flag>>;

    // Schedule operations
    fn create_schedule(&self, schedule: &FlagSchedule) -> Result<()>;
    fn get_schedule(&self, id: &str) -> Result<Option<FlagSchedule>>;
    fn list_flag_schedules(&self, flag_id: &str) -> Result<Vec<FlagSchedule>>;

    /// Overwrites a schedule's definition, steps and message ids.
    fn replace_schedule(&self, schedule: &FlagSchedule) -> Result<()>;

    /// Soft delete: disarms the schedule and forgets its message ids.
    fn disable_schedule(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Claims the `executed_at` stamp for `target` and applies `mutation` to the
    /// schedule's flag in one transaction.
    fn apply_schedule(
        &self,
        schedule_id: &str,
        target: ExecutionTarget,
        mutation: FlagMutation,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome>;

    fn close(&self) -> Result<()>;
}
