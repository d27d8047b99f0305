//! Dependency cascade.
//!
//! When a flag becomes inactive, every active flag that depends on it is
//! deactivated, transitively. When a flag becomes active, an inactive dependent is
//! reactivated only once all of its dependencies are active. Archived flags never
//! take part, as source or as target.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::cache::{CacheInvalidator, invalidate_quietly};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Flag, FlagScope, FlagStatus};

/// One async mutex per scope, so cascades within a scope run one at a time.
#[derive(Default)]
pub struct ScopeLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn lock_for(&self, scope: &FlagScope) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(scope.cache_key()).or_default().clone()
    }

    /// Hands back a lock from `lock_for`. The scope's entry is dropped once
    /// nobody else holds it.
    pub fn release(&self, scope: &FlagScope, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let key = scope.cache_key();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let unused = locks
            .get(&key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1);
        if unused {
            locks.remove(&key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flags changed by one cascade, in the order they were changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeReport {
    pub deactivated: Vec<String>,
    pub activated: Vec<String>,
}

impl CascadeReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deactivated.is_empty() && self.activated.is_empty()
    }
}

#[derive(Clone)]
pub struct CascadeEngine {
    store: Arc<dyn Store>,
    cache: Arc<dyn CacheInvalidator>,
    locks: Arc<ScopeLocks>,
}

impl CascadeEngine {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            store,
            cache,
            locks: Arc::new(ScopeLocks::default()),
        }
    }

    /// Propagates `new_status` of `changed` to its dependents. A failure halts the
    /// cascade where it is; flags already changed stay changed.
    pub async fn cascade(&self, changed: &Flag, new_status: FlagStatus) -> Result<CascadeReport> {
        if changed.is_archived() || new_status == FlagStatus::Archived {
            return Ok(CascadeReport::default());
        }

        let lock = self.locks.lock_for(&changed.scope);
        let result = {
            let _guard = lock.lock().await;
            self.propagate(changed, new_status).await
        };
        self.locks.release(&changed.scope, lock);

        match result {
            Ok(report) => {
                if !report.is_empty() {
                    info!(
                        flag_id = %changed.id,
                        status = %new_status,
                        deactivated = report.deactivated.len(),
                        activated = report.activated.len(),
                        "Cascade complete"
                    );
                }
                Ok(report)
            }
            Err(err) => {
                error!(flag_id = %changed.id, status = %new_status, error = %err, "Cascade failed");
                Err(Error::Cascade {
                    flag_id: changed.id.clone(),
                    source: Box::new(err),
                })
            }
        }
    }

    async fn propagate(&self, changed: &Flag, new_status: FlagStatus) -> Result<CascadeReport> {
        let mut report = CascadeReport::default();
        let mut visited = HashSet::from([changed.id.clone()]);
        let mut frontier = vec![changed.key.clone()];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for key in &frontier {
                let changed_flags = match new_status {
                    FlagStatus::Inactive => {
                        self.deactivate_dependents(&changed.scope, key, &mut visited)
                            .await?
                    }
                    FlagStatus::Active => {
                        self.activate_dependents(&changed.scope, key, &mut visited)
                            .await?
                    }
                    FlagStatus::Archived => Vec::new(),
                };

                for flag in changed_flags {
                    match new_status {
                        FlagStatus::Inactive => report.deactivated.push(flag.id),
                        _ => report.activated.push(flag.id),
                    }
                    next.push(flag.key);
                }
            }
            frontier = next;
        }

        Ok(report)
    }

    async fn deactivate_dependents(
        &self,
        scope: &FlagScope,
        key: &str,
        visited: &mut HashSet<String>,
    ) -> Result<Vec<Flag>> {
        let dependents = self.store.list_dependents(scope, key, FlagStatus::Active)?;
        let mut changed = Vec::new();

        for flag in dependents {
            if !visited.insert(flag.id.clone()) {
                continue;
            }
            if self.transition(&flag, FlagStatus::Active, FlagStatus::Inactive)
                .await?
            {
                changed.push(flag);
            }
        }
        Ok(changed)
    }

    async fn activate_dependents(
        &self,
        scope: &FlagScope,
        key: &str,
        visited: &mut HashSet<String>,
    ) -> Result<Vec<Flag>> {
        let candidates = self.store.list_dependents(scope, key, FlagStatus::Inactive)?;
        let mut changed = Vec::new();

        for flag in candidates {
            if visited.contains(&flag.id) {
                continue;
            }
            if !self.dependencies_active(&flag)? {
                debug!(flag_id = %flag.id, "dependent still gated by inactive dependencies");
                continue;
            }

            visited.insert(flag.id.clone());
            if self.transition(&flag, FlagStatus::Inactive, FlagStatus::Active)
                .await?
            {
                changed.push(flag);
            }
        }
        Ok(changed)
    }

    /// True when every declared dependency exists, is not archived and is active.
    fn dependencies_active(&self, flag: &Flag) -> Result<bool> {
        let found = self
            .store
            .get_flags_by_keys(&flag.scope, &flag.dependencies)?;

        Ok(flag.dependencies.iter().all(|key| {
            found
                .iter()
                .any(|dep| &dep.key == key && dep.status == FlagStatus::Active)
        }))
    }

    async fn transition(&self, flag: &Flag, from: FlagStatus, to: FlagStatus) -> Result<bool> {
        let applied = self
            .store
            .transition_flag_status(&flag.id, from, to, Utc::now())?;

        if applied {
            debug!(flag_id = %flag.id, from = %from, to = %to, "cascaded status change");
            invalidate_quietly(self.cache.as_ref(), flag).await;
        } else {
            debug!(flag_id = %flag.id, "flag changed concurrently, skipping");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::cache::RecordingInvalidator;
    use crate::store::SqliteStore;
    use crate::types::FlagType;

    fn flag(id: &str, status: FlagStatus, deps: &[&str]) -> Flag {
        let now = Utc::now();
        Flag {
            id: id.to_string(),
            key: id.to_string(),
            name: None,
            description: None,
            flag_type: FlagType::Boolean,
            status,
            default_value: true,
            rollout_percentage: 100,
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

    fn setup(flags: &[Flag]) -> (TempDir, Arc<SqliteStore>, Arc<RecordingInvalidator>, CascadeEngine) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::new(temp.path().join("test.db")).unwrap());
        store.initialize().unwrap();
        for f in flags {
            store.create_flag(f).unwrap();
        }
        let cache = Arc::new(RecordingInvalidator::new());
        let engine = CascadeEngine::new(store.clone(), cache.clone());
        (temp, store, cache, engine)
    }

    fn status(store: &SqliteStore, id: &str) -> FlagStatus {
        store.get_flag(id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_cycle_terminates() {
        // a <-> b, both active; a is switched off
        let a = flag("a", FlagStatus::Inactive, &["b"]);
        let b = flag("b", FlagStatus::Active, &["a"]);
        let (_temp, store, _cache, engine) = setup(&[a.clone(), b]);

        let report = engine.cascade(&a, FlagStatus::Inactive).await.unwrap();
        assert_eq!(report.deactivated, vec!["b".to_string()]);
        assert_eq!(status(&store, "a"), FlagStatus::Inactive);
        assert_eq!(status(&store, "b"), FlagStatus::Inactive);
    }

    #[tokio::test]
    async fn test_archived_source_is_a_noop() {
        let a = flag("a", FlagStatus::Archived, &[]);
        let b = flag("b", FlagStatus::Active, &["a"]);
        let (_temp, store, cache, engine) = setup(&[a.clone(), b]);

        let report = engine.cascade(&a, FlagStatus::Inactive).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(status(&store, "b"), FlagStatus::Active);
        assert!(cache.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dependency_blocks_activation() {
        let a = flag("a", FlagStatus::Active, &[]);
        let b = flag("b", FlagStatus::Inactive, &["a", "ghost"]);
        let (_temp, store, _cache, engine) = setup(&[a.clone(), b]);

        let report = engine.cascade(&a, FlagStatus::Active).await.unwrap();
        assert!(report.activated.is_empty());
        assert_eq!(status(&store, "b"), FlagStatus::Inactive);
    }

    #[tokio::test]
    async fn test_changed_flags_are_invalidated() {
        let a = flag("a", FlagStatus::Inactive, &[]);
        let b = flag("b", FlagStatus::Active, &["a"]);
        let (_temp, _store, cache, engine) = setup(&[a.clone(), b]);

        engine.cascade(&a, FlagStatus::Inactive).await.unwrap();
        assert_eq!(cache.invalidated_flag_ids(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_scope_locks_are_shared_per_scope() {
        let locks = ScopeLocks::default();
        let site = FlagScope::Website("site".to_string());
        let other = FlagScope::Organization("site".to_string());

        assert!(Arc::ptr_eq(&locks.lock_for(&site), &locks.lock_for(&site)));
        assert!(!Arc::ptr_eq(&locks.lock_for(&site), &locks.lock_for(&other)));
    }

    #[tokio::test]
    async fn test_scope_locks_are_pruned_after_release() {
        let locks = ScopeLocks::default();
        let site = FlagScope::Website("site".to_string());

        let first = locks.lock_for(&site);
        let second = locks.lock_for(&site);
        locks.release(&site, first);
        assert_eq!(locks.len(), 1);

        locks.release(&site, second);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_cascade_leaves_no_scope_lock_behind() {
        let a = flag("a", FlagStatus::Inactive, &[]);
        let b = flag("b", FlagStatus::Active, &["a"]);
        let (_temp, _store, _cache, engine) = setup(&[a.clone(), b]);

        engine.cascade(&a, FlagStatus::Inactive).await.unwrap();
        assert!(engine.locks.is_empty());
    }
}
