//! Publish/subscribe facade over the event channel.
//!
//! `publish` is the producer side: it serializes the payload (by default)
//! and appends the event through the channel's [`EventPublisher`] — delivery
//! happens asynchronously via the stream processor, never in-process.
//! `subscribe` is the executor-side helper: subscription resolvers call it
//! to register the subscription (when registration is enabled) and obtain
//! the result stream for the triggering event.

use std::sync::Arc;

use futures::stream::{self, BoxStream};
use serde_json::Value;

use subcast_core::errors::{Result, SubcastError};
use subcast_core::execution::ExecutionRequest;
use subcast_core::traits::{EventPublisher, SubscriptionManager};
use subcast_core::types::SubscriptionEvent;

/// Publish/subscribe facade.
pub struct PubSub {
    publisher: Arc<dyn EventPublisher>,
    serialize_payload: bool,
}

impl PubSub {
    /// Create a pub/sub facade that serializes payloads to JSON strings.
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher,
            serialize_payload: true,
        }
    }

    /// Keep payloads as raw JSON values instead of pre-serialized strings.
    #[must_use]
    pub fn with_raw_payload(mut self) -> Self {
        self.serialize_payload = false;
        self
    }

    /// Publish one event through the channel.
    ///
    /// The event propagates through storage: it is never delivered to
    /// subscribers in the publishing process.
    pub async fn publish(&self, event_name: &str, payload: Value) -> Result<()> {
        if event_name.is_empty() {
            return Err(SubcastError::InvalidOperation(
                "event name must be a non-empty string".into(),
            ));
        }
        let payload = if self.serialize_payload {
            Value::String(payload.to_string())
        } else {
            payload
        };
        self.publisher
            .publish(SubscriptionEvent {
                event: event_name.to_owned(),
                payload,
                id: None,
                ttl: None,
            })
            .await
    }

    /// Executor-side subscription resolver.
    ///
    /// Registers the subscription when the request has registration enabled
    /// (a client-sent operation), then returns the stream of triggering-event
    /// payloads — one element during fan-out, empty on initial registration.
    pub async fn subscribe(
        &self,
        event_names: &[String],
        registry: &Arc<dyn SubscriptionManager>,
        request: &ExecutionRequest,
    ) -> Result<BoxStream<'static, Value>> {
        if request.register_subscriptions {
            registry
                .subscribe(event_names, &request.connection, &request.operation)
                .await?;
        }
        let payloads: Vec<Value> = request.event.iter().map(|e| e.payload.clone()).collect();
        Ok(Box::pin(stream::iter(payloads)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
