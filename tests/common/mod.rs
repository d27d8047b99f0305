#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use flagshift::cache::RecordingInvalidator;
use flagshift::cascade::CascadeEngine;
use flagshift::dispatch::{DispatchGateway, MemoryDelivery};
use flagshift::schedule::ScheduleManager;
use flagshift::store::{SqliteStore, Store};
use flagshift::types::{DispatchMessage, Flag, FlagScope, FlagStatus, FlagType};
use flagshift::worker::{ExecutionWorker, JobOutcome, StoreExecutionRoutine};

pub const SITE: &str = "site-1";

/// The scheduling engine wired over a temp SQLite store, the in-memory delivery
/// service and a recording cache.
pub struct Engine {
    pub temp_dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub delivery: Arc<MemoryDelivery>,
    pub cache: Arc<RecordingInvalidator>,
    pub schedules: ScheduleManager,
    pub cascade: CascadeEngine,
    pub worker: ExecutionWorker,
}

impl Engine {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let store = Arc::new(
            SqliteStore::new(temp_dir.path().join("flagshift.db")).expect("open store"),
        );
        store.initialize().expect("initialize store");

        let delivery = Arc::new(MemoryDelivery::new());
        let cache = Arc::new(RecordingInvalidator::new());
        let cascade = CascadeEngine::new(store.clone(), cache.clone());
        let worker = ExecutionWorker::new(
            store.clone(),
            Arc::new(StoreExecutionRoutine::new(store.clone())),
            cache.clone(),
            cascade.clone(),
        );
        let schedules =
            ScheduleManager::new(store.clone(), DispatchGateway::new(delivery.clone()));

        Self {
            temp_dir,
            store,
            delivery,
            cache,
            schedules,
            cascade,
            worker,
        }
    }

    pub fn add_flag(&self, key: &str, status: FlagStatus, dependencies: &[&str]) -> Flag {
        let flag = flag(key, status, dependencies);
        self.store.create_flag(&flag).expect("create flag");
        flag
    }

    pub fn flag(&self, id: &str) -> Flag {
        self.store
            .get_flag(id)
            .expect("get flag")
            .expect("flag exists")
    }

    pub fn status(&self, flag: &Flag) -> FlagStatus {
        self.flag(&flag.id).status
    }

    /// The pending message for one rollout step of a schedule.
    pub fn step_message(&self, schedule_id: &str, at: DateTime<Utc>) -> DispatchMessage {
        self.delivery
            .pending()
            .into_iter()
            .map(|(_, message, _)| message)
            .find(|m| m.schedule_id == schedule_id && m.step_scheduled_at == Some(at))
            .expect("step message pending")
    }

    /// Delivers every message due at `now`, in fire-time order.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        for (_, message) in self.delivery.take_due(now) {
            outcomes.push(self.worker.process(&message).await.expect("process message"));
        }
        outcomes
    }
}

pub fn flag(key: &str, status: FlagStatus, dependencies: &[&str]) -> Flag {
    let now = Utc::now();
    Flag {
        id: Uuid::new_v4().to_string(),
        key: key.to_string(),
        name: Some(key.to_string()),
        description: None,
        flag_type: FlagType::Rollout,
        status,
        default_value: true,
        rollout_percentage: 0,
        rollout_by: None,
        rules: vec![],
        variants: vec![],
        dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        scope: FlagScope::Website(SITE.to_string()),
        environment: None,
        created_at: now,
        updated_at: now,
    }
}
