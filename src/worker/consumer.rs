use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use super::{ExecutionWorker, JobOutcome, RateLimiter};
use crate::error::{Error, Result};
use crate::queue::{QueuedMessage, SqliteDelayQueue};

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Maximum jobs in flight at once.
    pub max_concurrent: usize,
    /// Maximum jobs started per `rate_window`.
    pub rate_limit: usize,
    pub rate_window: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 20,
            max_concurrent: 5,
            rate_limit: 10,
            rate_window: Duration::from_secs(1),
        }
    }
}

/// Polls the delay queue and runs due messages through the execution worker.
pub struct ScheduleConsumer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduleConsumer {
    pub fn start(
        config: ConsumerConfig,
        queue: Arc<SqliteDelayQueue>,
        worker: Arc<ExecutionWorker>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = ConsumerTask {
                limiter: RateLimiter::new(config.rate_limit, config.rate_window),
                config,
                queue,
                worker,
                shutdown_rx,
            };
            task.run().await;
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops polling and waits for in-flight jobs to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        self.handle
            .await
            .map_err(|err| Error::Execution(format!("schedule consumer task panicked: {err}")))
    }
}

struct ConsumerTask {
    config: ConsumerConfig,
    queue: Arc<SqliteDelayQueue>,
    worker: Arc<ExecutionWorker>,
    limiter: RateLimiter,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConsumerTask {
    async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            rate_limit = self.config.rate_limit,
            "Starting schedule consumer"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll(&semaphore).await {
                        error!(error = %err, "Polling cycle failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Schedule consumer shutting down");
                        break;
                    }
                }
            }
        }

        self.wait_for_inflight(&semaphore).await;
    }

    async fn poll(&self, semaphore: &Arc<Semaphore>) -> Result<()> {
        let available = semaphore.available_permits();
        if available == 0 {
            return Ok(());
        }

        let wanted = available.min(self.config.batch_size.max(1));
        let granted = self.limiter.reserve(wanted);
        if granted == 0 {
            debug!("rate ceiling reached for this window");
            return Ok(());
        }

        let messages = match self.queue.claim_due(granted, Utc::now()) {
            Ok(messages) => messages,
            Err(err) => {
                self.limiter.refund(granted);
                return Err(err);
            }
        };
        self.limiter.refund(granted - messages.len());
        if messages.is_empty() {
            return Ok(());
        }
        debug!(count = messages.len(), "claimed due messages");

        for message in messages {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|err| Error::Execution(err.to_string()))?;
            let queue = Arc::clone(&self.queue);
            let worker = Arc::clone(&self.worker);
            tokio::spawn(run_job(queue, worker, message, permit));
        }
        Ok(())
    }

    async fn wait_for_inflight(&self, semaphore: &Arc<Semaphore>) {
        let expected = self.config.max_concurrent.max(1);
        while semaphore.available_permits() < expected {
            sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn run_job(
    queue: Arc<SqliteDelayQueue>,
    worker: Arc<ExecutionWorker>,
    message: QueuedMessage,
    _permit: OwnedSemaphorePermit,
) {
    let schedule_id = message.payload.schedule_id.clone();

    let settled = match worker.process(&message.payload).await {
        Ok(outcome) => {
            if let JobOutcome::Skipped { reason } = &outcome {
                debug!(message_id = %message.id, %schedule_id, reason = reason.as_str(), "message skipped");
            }
            queue.ack(&message.id)
        }
        Err(err) => {
            warn!(
                message_id = %message.id,
                %schedule_id,
                attempt = message.attempts,
                error = %err,
                "Schedule execution failed"
            );
            queue
                .nack(&message.id, &err.to_string(), Utc::now())
                .map(|_| ())
        }
    };

    if let Err(err) = settled {
        error!(message_id = %message.id, error = %err, "Failed to settle queue message");
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration as ChronoDuration};
    use tempfile::TempDir;

    use super::*;
    use crate::cache::FlagCache;
    use crate::cascade::CascadeEngine;
    use crate::queue::{MessageStatus, QueueConfig};
    use crate::store::{SqliteStore, Store};
    use crate::types::{Flag, FlagSchedule, FlagScope, FlagStatus, FlagType, ScheduleType};
    use crate::worker::StoreExecutionRoutine;

    struct Fixture {
        _temp: TempDir,
        store: Arc<SqliteStore>,
        queue: Arc<SqliteDelayQueue>,
        worker: Arc<ExecutionWorker>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("flagshift.db");
        let store = Arc::new(SqliteStore::new(&db).unwrap());
        store.initialize().unwrap();
        let queue = Arc::new(SqliteDelayQueue::new(&db, QueueConfig::default()).unwrap());
        queue.initialize().unwrap();

        let cache = Arc::new(FlagCache::default());
        let worker = Arc::new(ExecutionWorker::new(
            store.clone(),
            Arc::new(StoreExecutionRoutine::new(store.clone())),
            cache.clone(),
            CascadeEngine::new(store.clone(), cache),
        ));
        Fixture {
            _temp: temp,
            store,
            queue,
            worker,
        }
    }

    /// Stores an inactive flag with an enable schedule and queues its message.
    fn seed_enable(fx: &Fixture, not_before: DateTime<Utc>) -> String {
        let now = Utc::now();
        fx.store
            .create_flag(&Flag {
                id: "f".to_string(),
                key: "f".to_string(),
                name: None,
                description: None,
                flag_type: FlagType::Boolean,
                status: FlagStatus::Inactive,
                default_value: true,
                rollout_percentage: 100,
                rollout_by: None,
                rules: vec![],
                variants: vec![],
                dependencies: vec![],
                scope: FlagScope::User("u".to_string()),
                environment: None,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
        let schedule = FlagSchedule {
            id: "s".to_string(),
            flag_id: "f".to_string(),
            schedule_type: ScheduleType::Enable,
            is_enabled: true,
            scheduled_at: Some(now),
            executed_at: None,
            rollout_steps: vec![],
            message_ids: vec![],
            created_at: now,
            updated_at: now,
        };
        fx.store.create_schedule(&schedule).unwrap();
        let (message, _) = schedule.messages().remove(0);
        fx.queue.enqueue(&message, not_before).unwrap()
    }

    async fn wait_completed(queue: &SqliteDelayQueue, message_id: &str) {
        for _ in 0..200 {
            if queue.status_of(message_id).unwrap() == Some(MessageStatus::Completed) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_consumer_executes_due_messages() {
        let fx = fixture();
        let message_id = seed_enable(&fx, Utc::now() - ChronoDuration::seconds(1));

        let consumer = ScheduleConsumer::start(
            ConsumerConfig {
                poll_interval: Duration::from_millis(10),
                ..ConsumerConfig::default()
            },
            fx.queue.clone(),
            fx.worker.clone(),
        );
        wait_completed(&fx.queue, &message_id).await;
        consumer.shutdown().await.unwrap();

        assert_eq!(
            fx.queue.status_of(&message_id).unwrap(),
            Some(MessageStatus::Completed)
        );
        assert_eq!(fx.store.get_flag("f").unwrap().unwrap().status, FlagStatus::Active);
    }

    #[tokio::test]
    async fn test_empty_polls_do_not_spend_the_rate_window() {
        let fx = fixture();
        let consumer = ScheduleConsumer::start(
            ConsumerConfig {
                poll_interval: Duration::from_millis(10),
                rate_limit: 1,
                rate_window: Duration::from_secs(600),
                ..ConsumerConfig::default()
            },
            fx.queue.clone(),
            fx.worker.clone(),
        );

        // Several polls find nothing before the message becomes due.
        sleep(Duration::from_millis(100)).await;
        let message_id = seed_enable(&fx, Utc::now() - ChronoDuration::seconds(1));

        wait_completed(&fx.queue, &message_id).await;
        consumer.shutdown().await.unwrap();

        assert_eq!(
            fx.queue.status_of(&message_id).unwrap(),
            Some(MessageStatus::Completed)
        );
    }
}
