//! Dispatch gateway over a delayed-message delivery service.
//!
//! The gateway is a thin, fail-fast wrapper: it neither queues nor retries. Retry
//! and backoff at delivery time belong to the delivery service.

mod memory;

pub use memory::MemoryDelivery;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::DispatchMessage;

/// Contract of a delayed-delivery service: deliver `payload` at or after
/// `not_before`, and forget a message on request.
#[async_trait]
pub trait DelayedDelivery: Send + Sync {
    /// Registers the message and returns the service's opaque message id.
    async fn schedule(&self, payload: &DispatchMessage, not_before: DateTime<Utc>)
    -> Result<String>;

    async fn cancel(&self, message_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct DispatchGateway {
    delivery: Arc<dyn DelayedDelivery>,
}

impl DispatchGateway {
    pub fn new(delivery: Arc<dyn DelayedDelivery>) -> Self {
        Self { delivery }
    }

    /// Asks the delivery service to fire `message` no earlier than `not_before`.
    /// Any failure surfaces as [`Error::Dispatch`].
    pub async fn schedule(
        &self,
        message: &DispatchMessage,
        not_before: DateTime<Utc>,
    ) -> Result<String> {
        match self.delivery.schedule(message, not_before).await {
            Ok(message_id) => {
                debug!(
                    schedule_id = %message.schedule_id,
                    message_id = %message_id,
                    not_before = %not_before,
                    "dispatched schedule message"
                );
                Ok(message_id)
            }
            Err(err @ Error::Dispatch(_)) => Err(err),
            Err(err) => Err(Error::Dispatch(err.to_string())),
        }
    }

    /// Best-effort cancellation. Failures are logged and never retried.
    pub async fn cancel(&self, message_id: &str) {
        if let Err(err) = self.delivery.cancel(message_id).await {
            warn!(message_id, error = %err, "Failed to cancel dispatched message");
        }
    }
}
