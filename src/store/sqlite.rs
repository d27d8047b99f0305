use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::de::DeserializeOwned;

use super::schema::SCHEMA;
use super::{ApplyOutcome, ExecutionTarget, FlagMutation, Store};
use crate::error::{Error, Result};
use crate::types::*;

const FLAG_COLUMNS: &str = "id, key, name, description, flag_type, status, default_value, \
     rollout_percentage, rollout_by, rules, variants, dependencies, scope_kind, scope_id, \
     environment, created_at, updated_at";

const SCHEDULE_COLUMNS: &str =
    "id, flag_id, schedule_type, is_enabled, scheduled_at, executed_at, message_ids, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a guard to the underlying database connection.
    /// This allows consuming applications to execute custom SQL.
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }
}

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn enum_column<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn optional_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .map(|s| parse_datetime(&s)))
}

fn flag_from_row(row: &Row<'_>) -> rusqlite::Result<Flag> {
    let scope_kind: String = row.get(12)?;
    let scope = FlagScope::from_parts(&scope_kind, row.get(13)?)
        .map_err(|e| conversion_error(12, e))?;

    Ok(Flag {
        id: row.get(0)?,
        key: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        flag_type: enum_column(row, 4)?,
        status: enum_column(row, 5)?,
        default_value: row.get(6)?,
        rollout_percentage: row.get(7)?,
        rollout_by: row.get(8)?,
        rules: json_column(row, 9)?,
        variants: json_column(row, 10)?,
        dependencies: json_column(row, 11)?,
        scope,
        environment: row.get(14)?,
        created_at: parse_datetime(&row.get::<_, String>(15)?),
        updated_at: parse_datetime(&row.get::<_, String>(16)?),
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<FlagSchedule> {
    Ok(FlagSchedule {
        id: row.get(0)?,
        flag_id: row.get(1)?,
        schedule_type: enum_column(row, 2)?,
        is_enabled: row.get(3)?,
        scheduled_at: optional_datetime(row, 4)?,
        executed_at: optional_datetime(row, 5)?,
        rollout_steps: Vec::new(),
        message_ids: json_column(row, 6)?,
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn load_steps(conn: &Connection, schedule_id: &str) -> Result<Vec<RolloutStep>> {
    let mut stmt = conn.prepare(
        "SELECT scheduled_at, executed_at, value FROM flag_schedule_steps
         WHERE schedule_id = ?1 ORDER BY position",
    )?;

    let rows = stmt.query_map(params![schedule_id], |row| {
        Ok(RolloutStep {
            scheduled_at: parse_datetime(&row.get::<_, String>(0)?),
            executed_at: optional_datetime(row, 1)?,
            value: json_column(row, 2)?,
        })
    })?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::from)
}

fn insert_steps(tx: &Transaction<'_>, schedule: &FlagSchedule) -> Result<()> {
    for (position, step) in schedule.rollout_steps.iter().enumerate() {
        tx.execute(
            "INSERT INTO flag_schedule_steps (schedule_id, position, scheduled_at, executed_at, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                schedule.id,
                position as i64,
                format_datetime(&step.scheduled_at),
                step.executed_at.as_ref().map(format_datetime),
                serde_json::to_string(&step.value)?,
            ],
        )?;
    }
    Ok(())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Flag operations

    fn create_flag(&self, flag: &Flag) -> Result<()> {
        let result = self.conn().execute(
            &format!(
                "INSERT INTO flags ({FLAG_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                flag.id,
                flag.key,
                flag.name,
                flag.description,
                flag.flag_type.as_str(),
                flag.status.as_str(),
                flag.default_value,
                flag.rollout_percentage,
                flag.rollout_by,
                serde_json::to_string(&flag.rules)?,
                serde_json::to_string(&flag.variants)?,
                serde_json::to_string(&flag.dependencies)?,
                flag.scope.kind(),
                flag.scope.id(),
                flag.environment,
                format_datetime(&flag.created_at),
                format_datetime(&flag.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(ref err) if is_constraint_violation(err) => Err(Error::Conflict(format!(
                "a flag with key '{}' already exists in this scope",
                flag.key
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn get_flag(&self, id: &str) -> Result<Option<Flag>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {FLAG_COLUMNS} FROM flags WHERE id = ?1"),
            params![id],
            flag_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_flag_by_key(&self, scope: &FlagScope, key: &str) -> Result<Option<Flag>> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {FLAG_COLUMNS} FROM flags
                 WHERE scope_kind = ?1 AND scope_id = ?2 AND key = ?3"
            ),
            params![scope.kind(), scope.id(), key],
            flag_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_flags(&self, scope: &FlagScope, status: Option<FlagStatus>) -> Result<Vec<Flag>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FLAG_COLUMNS} FROM flags
             WHERE scope_kind = ?1 AND scope_id = ?2 AND (?3 IS NULL OR status = ?3)
             ORDER BY created_at DESC, id"
        ))?;

        let rows = stmt.query_map(
            params![scope.kind(), scope.id(), status.map(FlagStatus::as_str)],
            flag_from_row,
        )?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_flag(&self, flag: &Flag, expected_updated_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE flags SET name = ?1, description = ?2, flag_type = ?3, status = ?4,
                 default_value = ?5, rollout_percentage = ?6, rollout_by = ?7, rules = ?8,
                 variants = ?9, dependencies = ?10, environment = ?11, updated_at = ?12
             WHERE id = ?13 AND updated_at = ?14",
            params![
                flag.name,
                flag.description,
                flag.flag_type.as_str(),
                flag.status.as_str(),
                flag.default_value,
                flag.rollout_percentage,
                flag.rollout_by,
                serde_json::to_string(&flag.rules)?,
                serde_json::to_string(&flag.variants)?,
                serde_json::to_string(&flag.dependencies)?,
                flag.environment,
                format_datetime(&flag.updated_at),
                flag.id,
                format_datetime(&expected_updated_at),
            ],
        )?;

        if rows == 0 {
            let exists = conn
                .query_row("SELECT 1 FROM flags WHERE id = ?1", params![flag.id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Err(Error::NotFound("flag"));
            }
            return Err(Error::Conflict(format!(
                "flag '{}' was modified concurrently",
                flag.key
            )));
        }
        Ok(())
    }

    fn transition_flag_status(
        &self,
        id: &str,
        from: FlagStatus,
        to: FlagStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE flags SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), format_datetime(&now), id, from.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn list_dependents(
        &self,
        scope: &FlagScope,
        key: &str,
        status: FlagStatus,
    ) -> Result<Vec<Flag>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FLAG_COLUMNS} FROM flags
             WHERE scope_kind = ?1 AND scope_id = ?2
               AND status = ?3 AND status != 'archived'
               AND EXISTS (SELECT 1 FROM json_each(flags.dependencies) WHERE json_each.value = ?4)
             ORDER BY created_at, id"
        ))?;

        let rows = stmt.query_map(
            params![scope.kind(), scope.id(), status.as_str(), key],
            flag_from_row,
        )?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn get_flags_by_keys(&self, scope: &FlagScope, keys: &[String]) -> Result<Vec<Flag>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FLAG_COLUMNS} FROM flags
             WHERE scope_kind = ?1 AND scope_id = ?2
               AND key IN (SELECT value FROM json_each(?3))"
        ))?;

        let rows = stmt.query_map(
            params![scope.kind(), scope.id(), serde_json::to_string(keys)?],
            flag_from_row,
        )?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Schedule operations

    fn create_schedule(&self, schedule: &FlagSchedule) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            &format!(
                "INSERT INTO flag_schedules ({SCHEDULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                schedule.id,
                schedule.flag_id,
                schedule.schedule_type.as_str(),
                schedule.is_enabled,
                schedule.scheduled_at.as_ref().map(format_datetime),
                schedule.executed_at.as_ref().map(format_datetime),
                serde_json::to_string(&schedule.message_ids)?,
                format_datetime(&schedule.created_at),
                format_datetime(&schedule.updated_at),
            ],
        )?;
        insert_steps(&tx, schedule)?;

        tx.commit()?;
        Ok(())
    }

    fn get_schedule(&self, id: &str) -> Result<Option<FlagSchedule>> {
        let conn = self.conn();
        let schedule = conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM flag_schedules WHERE id = ?1"),
                params![id],
                schedule_from_row,
            )
            .optional()?;

        match schedule {
            Some(mut schedule) => {
                schedule.rollout_steps = load_steps(&conn, &schedule.id)?;
                Ok(Some(schedule))
            }
            None => Ok(None),
        }
    }

    fn list_flag_schedules(&self, flag_id: &str) -> Result<Vec<FlagSchedule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM flag_schedules
             WHERE flag_id = ?1 ORDER BY created_at DESC, id"
        ))?;

        let mut schedules = stmt
            .query_map(params![flag_id], schedule_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for schedule in &mut schedules {
            schedule.rollout_steps = load_steps(&conn, &schedule.id)?;
        }
        Ok(schedules)
    }

    fn replace_schedule(&self, schedule: &FlagSchedule) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE flag_schedules SET flag_id = ?1, schedule_type = ?2, is_enabled = ?3,
                 scheduled_at = ?4, executed_at = ?5, message_ids = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                schedule.flag_id,
                schedule.schedule_type.as_str(),
                schedule.is_enabled,
                schedule.scheduled_at.as_ref().map(format_datetime),
                schedule.executed_at.as_ref().map(format_datetime),
                serde_json::to_string(&schedule.message_ids)?,
                format_datetime(&schedule.updated_at),
                schedule.id,
            ],
        )?;

        if rows == 0 {
            return Err(Error::NotFound("schedule"));
        }

        tx.execute(
            "DELETE FROM flag_schedule_steps WHERE schedule_id = ?1",
            params![schedule.id],
        )?;
        insert_steps(&tx, schedule)?;

        tx.commit()?;
        Ok(())
    }

    fn disable_schedule(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE flag_schedules SET is_enabled = 0, message_ids = '[]', updated_at = ?1
             WHERE id = ?2",
            params![format_datetime(&now), id],
        )?;
        Ok(rows > 0)
    }

    fn apply_schedule(
        &self,
        schedule_id: &str,
        target: ExecutionTarget,
        mutation: FlagMutation,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let stamp = format_datetime(&now);

        let flag_id: String = tx
            .query_row(
                "SELECT flag_id FROM flag_schedules WHERE id = ?1",
                params![schedule_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::NotFound("schedule"))?;

        let claimed = match target {
            ExecutionTarget::Schedule => tx.execute(
                "UPDATE flag_schedules SET executed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND executed_at IS NULL",
                params![stamp, schedule_id],
            )?,
            ExecutionTarget::Step(scheduled_at) => tx.execute(
                "UPDATE flag_schedule_steps SET executed_at = ?1
                 WHERE schedule_id = ?2 AND scheduled_at = ?3 AND executed_at IS NULL",
                params![stamp, schedule_id, format_datetime(&scheduled_at)],
            )?,
        };

        if claimed == 0 {
            // Dropping the transaction rolls it back.
            return Ok(ApplyOutcome::AlreadyClaimed);
        }

        let previous = tx
            .query_row(
                &format!("SELECT {FLAG_COLUMNS} FROM flags WHERE id = ?1"),
                params![flag_id],
                flag_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound("flag"))?;

        if previous.is_archived() {
            return Err(Error::Execution(format!(
                "flag {} is archived and cannot be changed by a schedule",
                previous.id
            )));
        }

        let mut updated = previous.clone();
        match mutation {
            FlagMutation::Status(status) => updated.status = status,
            FlagMutation::RolloutPercentage(percentage) => {
                updated.rollout_percentage = percentage;
            }
        }
        updated.updated_at = now;

        tx.execute(
            "UPDATE flags SET status = ?1, rollout_percentage = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                updated.status.as_str(),
                updated.rollout_percentage,
                stamp,
                updated.id,
            ],
        )?;

        tx.commit()?;
        Ok(ApplyOutcome::Applied { previous, updated })
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
