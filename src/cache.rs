//! Flag cache invalidation.
//!
//! Every committed flag mutation invalidates the flag's own entries (by id and by
//! key within its scope) and the list entries of its scope. Invalidation is
//! fire-and-forget: callers log failures and carry on.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{Flag, FlagScope, FlagStatus};

#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate_flag(&self, flag_id: &str, scope: &FlagScope, key: &str) -> Result<()>;

    async fn invalidate_scope_flag_list(&self, scope: &FlagScope) -> Result<()>;
}

/// Invalidates everything cached for `flag`, logging instead of failing.
pub async fn invalidate_quietly(cache: &dyn CacheInvalidator, flag: &Flag) {
    if let Err(err) = cache.invalidate_flag(&flag.id, &flag.scope, &flag.key).await {
        warn!(flag_id = %flag.id, scope = %flag.scope, error = %err, "Failed to invalidate flag cache");
    }
    if let Err(err) = cache.invalidate_scope_flag_list(&flag.scope).await {
        warn!(scope = %flag.scope, error = %err, "Failed to invalidate scope flag list");
    }
}

fn by_id_key(id: &str, scope: &FlagScope) -> String {
    format!("byId:{id}:{}", scope.cache_key())
}

fn by_key_key(key: &str, scope: &FlagScope) -> String {
    format!("byKey:{key}:{}", scope.cache_key())
}

fn list_key(scope: &FlagScope, status: Option<FlagStatus>) -> String {
    format!(
        "list:{}:{}",
        scope.cache_key(),
        status.map_or("all", FlagStatus::as_str)
    )
}

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

/// In-process TTL cache for flag reads. Owned by whoever builds the app state, so
/// each server (and each test) gets an isolated instance.
pub struct FlagCache {
    ttl: Duration,
    flags: Mutex<HashMap<String, Entry<Flag>>>,
    lists: Mutex<HashMap<String, Entry<Vec<Flag>>>>,
}

impl FlagCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            flags: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
        }
    }

    fn fresh<T: Clone>(&self, map: &Mutex<HashMap<String, Entry<T>>>, key: &str) -> Option<T> {
        let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn store<T>(map: &Mutex<HashMap<String, Entry<T>>>, key: String, value: T) {
        let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    #[must_use]
    pub fn get_flag(&self, id: &str, scope: &FlagScope) -> Option<Flag> {
        self.fresh(&self.flags, &by_id_key(id, scope))
    }

    pub fn put_flag(&self, flag: &Flag) {
        Self::store(&self.flags, by_id_key(&flag.id, &flag.scope), flag.clone());
        Self::store(&self.flags, by_key_key(&flag.key, &flag.scope), flag.clone());
    }

    #[must_use]
    pub fn get_list(&self, scope: &FlagScope, status: Option<FlagStatus>) -> Option<Vec<Flag>> {
        self.fresh(&self.lists, &list_key(scope, status))
    }

    pub fn put_list(&self, scope: &FlagScope, status: Option<FlagStatus>, flags: Vec<Flag>) {
        Self::store(&self.lists, list_key(scope, status), flags);
    }
}

impl Default for FlagCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl CacheInvalidator for FlagCache {
    async fn invalidate_flag(&self, flag_id: &str, scope: &FlagScope, key: &str) -> Result<()> {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        flags.remove(&by_id_key(flag_id, scope));
        flags.remove(&by_key_key(key, scope));
        debug!(flag_id, scope = %scope, "invalidated flag cache");
        Ok(())
    }

    async fn invalidate_scope_flag_list(&self, scope: &FlagScope) -> Result<()> {
        let prefix = format!("list:{}:", scope.cache_key());
        let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
        lists.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Flag { flag_id: String, scope: FlagScope, key: String },
    ScopeList(FlagScope),
}

/// Records invalidations instead of performing them. For tests.
#[derive(Default)]
pub struct RecordingInvalidator {
    events: Mutex<Vec<Invalidation>>,
}

impl RecordingInvalidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Invalidation> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ids of flags invalidated so far, in order.
    #[must_use]
    pub fn invalidated_flag_ids(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Invalidation::Flag { flag_id, .. } => Some(flag_id),
                Invalidation::ScopeList(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl CacheInvalidator for RecordingInvalidator {
    async fn invalidate_flag(&self, flag_id: &str, scope: &FlagScope, key: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Invalidation::Flag {
                flag_id: flag_id.to_string(),
                scope: scope.clone(),
                key: key.to_string(),
            });
        Ok(())
    }

    async fn invalidate_scope_flag_list(&self, scope: &FlagScope) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Invalidation::ScopeList(scope.clone()));
        Ok(())
    }
}
