use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DelayedDelivery;
use crate::error::{Error, Result};
use crate::types::DispatchMessage;

#[derive(Default)]
struct Inner {
    next_id: u64,
    calls: usize,
    fail_calls: HashSet<usize>,
    fail_cancel: bool,
    pending: BTreeMap<String, (DispatchMessage, DateTime<Utc>)>,
    canceled: Vec<String>,
}

/// In-memory delivery service for tests. Messages sit in `pending` until a test
/// takes them with [`MemoryDelivery::take_due`] or cancels them.
#[derive(Default)]
pub struct MemoryDelivery {
    inner: Mutex<Inner>,
}

impl MemoryDelivery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the `n`th `schedule` call (1-based, counted across the instance) fail.
    pub fn fail_on_call(&self, n: usize) {
        self.lock().fail_calls.insert(n);
    }

    pub fn fail_cancellations(&self, fail: bool) {
        self.lock().fail_cancel = fail;
    }

    #[must_use]
    pub fn schedule_calls(&self) -> usize {
        self.lock().calls
    }

    #[must_use]
    pub fn pending(&self) -> Vec<(String, DispatchMessage, DateTime<Utc>)> {
        self.lock()
            .pending
            .iter()
            .map(|(id, (message, at))| (id.clone(), message.clone(), *at))
            .collect()
    }

    #[must_use]
    pub fn pending_for(&self, schedule_id: &str) -> Vec<String> {
        self.lock()
            .pending
            .iter()
            .filter(|(_, (message, _))| message.schedule_id == schedule_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[must_use]
    pub fn canceled(&self) -> Vec<String> {
        self.lock().canceled.clone()
    }

    /// Removes and returns the messages due at `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<(String, DispatchMessage)> {
        let mut inner = self.lock();
        let mut due: Vec<(String, DispatchMessage, DateTime<Utc>)> = inner
            .pending
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(id, (message, at))| (id.clone(), message.clone(), *at))
            .collect();
        due.sort_by_key(|(_, _, at)| *at);

        for (id, _, _) in &due {
            inner.pending.remove(id);
        }
        due.into_iter().map(|(id, message, _)| (id, message)).collect()
    }
}

#[async_trait]
impl DelayedDelivery for MemoryDelivery {
    async fn schedule(
        &self,
        payload: &DispatchMessage,
        not_before: DateTime<Utc>,
    ) -> Result<String> {
        let mut inner = self.lock();
        inner.calls += 1;
        let call = inner.calls;
        if inner.fail_calls.contains(&call) {
            return Err(Error::Dispatch(format!("delivery service rejected call {call}")));
        }

        inner.next_id += 1;
        let id = format!("mem-{}", inner.next_id);
        inner
            .pending
            .insert(id.clone(), (payload.clone(), not_before));
        Ok(id)
    }

    async fn cancel(&self, message_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_cancel {
            return Err(Error::Dispatch(format!("cancel of {message_id} rejected")));
        }
        inner.pending.remove(message_id);
        inner.canceled.push(message_id.to_string());
        Ok(())
    }
}
