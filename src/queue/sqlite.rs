use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{MessageStatus, NackOutcome, QueueConfig, QueuedMessage};
use crate::dispatch::DelayedDelivery;
use crate::error::{Error, Result};
use crate::types::DispatchMessage;

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dispatched_messages (
    id TEXT PRIMARY KEY,
    schedule_id TEXT NOT NULL,
    payload TEXT NOT NULL,

    -- Unix milliseconds, compared numerically
    not_before INTEGER NOT NULL,
    locked_until INTEGER,

    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT DEFAULT (datetime('now')),
    updated_at TEXT DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_dispatched_messages_due ON dispatched_messages(status, not_before);
CREATE INDEX IF NOT EXISTS idx_dispatched_messages_schedule ON dispatched_messages(schedule_id);
"#;

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| {
        error!(ms, "Invalid timestamp in dispatched_messages");
        Utc::now()
    })
}

fn chrono_duration(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

pub struct SqliteDelayQueue {
    conn: Mutex<Connection>,
    config: QueueConfig,
}

impl SqliteDelayQueue {
    pub fn new<P: AsRef<Path>>(db_path: P, config: QueueConfig) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(QUEUE_SCHEMA)?;
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn enqueue(&self, payload: &DispatchMessage, not_before: DateTime<Utc>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.conn().execute(
            "INSERT INTO dispatched_messages (id, schedule_id, payload, not_before, status)
             VALUES (?1, ?2, ?3, ?4, 'pending')",
            params![
                id,
                payload.schedule_id,
                serde_json::to_string(payload)?,
                not_before.timestamp_millis(),
            ],
        )?;
        Ok(id)
    }

    /// Leases up to `limit` due messages. Messages whose lease expired while
    /// running are delivered again, which makes delivery at-least-once.
    pub fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now_ms = now.timestamp_millis();
        let locked_until = (now + chrono_duration(self.config.lease)).timestamp_millis();

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        // A lease that expires on the last allowed attempt is never nacked.
        let exhausted: Vec<(String, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, attempts FROM dispatched_messages
                 WHERE status = 'running' AND locked_until <= ?1 AND attempts >= ?2",
            )?;
            let rows = stmt.query_map(params![now_ms, self.config.max_attempts], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        for (id, attempts) in exhausted {
            tx.execute(
                "UPDATE dispatched_messages
                 SET status = 'failed', last_error = 'lease expired on final attempt',
                     locked_until = NULL, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id],
            )?;
            error!(message_id = %id, attempts, "Dispatched message exhausted its retries");
        }

        let candidates: Vec<(String, String, i64, u32)> = {
            let mut stmt = tx.prepare(
                "SELECT id, payload, not_before, attempts FROM dispatched_messages
                 WHERE (status = 'pending' AND not_before <= ?1)
                    OR (status = 'running' AND locked_until <= ?1 AND attempts < ?2)
                 ORDER BY not_before, id
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![now_ms, self.config.max_attempts, limit as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, payload, not_before, attempts) in candidates {
            tx.execute(
                "UPDATE dispatched_messages
                 SET status = 'running', attempts = attempts + 1, locked_until = ?1,
                     updated_at = datetime('now')
                 WHERE id = ?2",
                params![locked_until, id],
            )?;

            match serde_json::from_str::<DispatchMessage>(&payload) {
                Ok(payload) => claimed.push(QueuedMessage {
                    id,
                    payload,
                    attempts: attempts + 1,
                    not_before: millis_to_datetime(not_before),
                }),
                Err(err) => {
                    // A payload that never parses can never succeed.
                    error!(message_id = %id, error = %err, "Unreadable dispatched message");
                    tx.execute(
                        "UPDATE dispatched_messages SET status = 'failed', last_error = ?1
                         WHERE id = ?2",
                        params![err.to_string(), id],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    pub fn ack(&self, id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE dispatched_messages
             SET status = 'completed', locked_until = NULL, updated_at = datetime('now')
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Records a failed delivery. Retries with backoff until `max_attempts`.
    pub fn nack(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<NackOutcome> {
        let conn = self.conn();
        let attempts: u32 = conn
            .query_row(
                "SELECT attempts FROM dispatched_messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::NotFound("message"))?;

        if attempts >= self.config.max_attempts {
            conn.execute(
                "UPDATE dispatched_messages
                 SET status = 'failed', last_error = ?1, locked_until = NULL,
                     updated_at = datetime('now')
                 WHERE id = ?2",
                params![reason, id],
            )?;
            error!(message_id = id, attempts, reason, "Dispatched message exhausted its retries");
            return Ok(NackOutcome::Failed);
        }

        let next_attempt_at = now + chrono_duration(self.config.backoff(attempts));
        conn.execute(
            "UPDATE dispatched_messages
             SET status = 'pending', last_error = ?1, not_before = ?2, locked_until = NULL,
                 updated_at = datetime('now')
             WHERE id = ?3",
            params![reason, next_attempt_at.timestamp_millis(), id],
        )?;
        warn!(message_id = id, attempts, %next_attempt_at, reason, "Dispatched message will be retried");
        Ok(NackOutcome::Retrying { next_attempt_at })
    }

    pub fn status_of(&self, id: &str) -> Result<Option<MessageStatus>> {
        let status: Option<String> = self
            .conn()
            .query_row(
                "SELECT status FROM dispatched_messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        status
            .map(|s| s.parse().map_err(Error::Config))
            .transpose()
    }

    /// Ids of messages for `schedule_id` that have not fired yet.
    pub fn pending_for(&self, schedule_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM dispatched_messages
             WHERE schedule_id = ?1 AND status = 'pending' ORDER BY not_before, id",
        )?;
        let rows = stmt.query_map(params![schedule_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

#[async_trait]
impl DelayedDelivery for SqliteDelayQueue {
    async fn schedule(
        &self,
        payload: &DispatchMessage,
        not_before: DateTime<Utc>,
    ) -> Result<String> {
        self.enqueue(payload, not_before)
            .map_err(|e| Error::Dispatch(e.to_string()))
    }

    async fn cancel(&self, message_id: &str) -> Result<()> {
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE dispatched_messages SET status = 'canceled', updated_at = datetime('now')
             WHERE id = ?1 AND status = 'pending'",
            params![message_id],
        )?;

        if rows == 0 {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT status FROM dispatched_messages WHERE id = ?1",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;
            match exists {
                Some(status) => {
                    debug!(message_id, %status, "message no longer pending, nothing to cancel");
                }
                None => return Err(Error::NotFound("message")),
            }
        }
        Ok(())
    }
}
