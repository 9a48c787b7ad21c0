//! Collaborator contracts between the engine, the durable store, the push
//! transport, and the embedding application.
//!
//! Implementations must be stateless across invocations: every method reads
//! and writes through the durable store or the transport, never through
//! process memory, because concurrent invocations of the engine do not share
//! a process.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::errors::{Result, TransportError};
use crate::execution::{ExecutionOutcome, ExecutionRequest};
use crate::types::{
    Connection, ConnectionData, IdentifiedOperationRequest, Subscriber, SubscriptionEvent,
};

/// Retry settings for [`ConnectionManager::hydrate_connection`], absorbing
/// read-after-write eventual consistency with a fixed-delay loop.
#[derive(Clone, Copy, Debug)]
pub struct HydrateOptions {
    /// Additional read attempts after the first.
    pub retry_count: u32,
    /// Fixed delay between attempts.
    pub retry_interval: Duration,
}

impl Default for HydrateOptions {
    fn default() -> Self {
        Self {
            retry_count: 0,
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Owns connection records' lifecycle and delivery.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Create the record for a fresh physical connection: empty context,
    /// uninitialized, default TTL. Called exactly once per connect event.
    async fn register_connection(&self, connection_id: &str, endpoint: &str)
    -> Result<Connection>;

    /// Read a connection record, retrying per `options`. Fails with
    /// [`crate::SubcastError::ConnectionNotFound`] when no live (non-expired)
    /// record turns up.
    async fn hydrate_connection(
        &self,
        connection_id: &str,
        options: HydrateOptions,
    ) -> Result<Connection>;

    /// Overwrite the mutable context/initialization fields. Last writer wins;
    /// a connection is driven by a single logical client at a time.
    async fn set_connection_data(&self, connection: &Connection, data: ConnectionData)
    -> Result<()>;

    /// Deliver a payload via the push transport. A terminal "gone" response
    /// unregisters the connection as a side effect and is not surfaced to the
    /// caller; any other transport error propagates.
    async fn send_to_connection(&self, connection: &Connection, payload: &str) -> Result<()>;

    /// Delete the connection record and cascade-remove its subscriptions.
    async fn unregister_connection(&self, connection: &Connection) -> Result<()>;

    /// Ask the transport to actively terminate the physical connection
    /// (used after protocol violations).
    async fn close_connection(&self, connection: &Connection) -> Result<()>;
}

/// A restartable, transparently paginated stream of subscribers.
pub type SubscriberStream = BoxStream<'static, Result<Subscriber>>;

/// Owns subscription records, indexed by event name and by connection.
#[async_trait]
pub trait SubscriptionManager: Send + Sync {
    /// Register a subscription. Exactly one event name per call — one
    /// subscription document maps to one operation id maps to one event name.
    async fn subscribe(
        &self,
        event_names: &[String],
        connection: &Connection,
        operation: &IdentifiedOperationRequest,
    ) -> Result<()>;

    /// Delete one subscription by its subscriber record.
    async fn unsubscribe(&self, subscriber: &Subscriber) -> Result<()>;

    /// Delete the subscription for (connection, operation). A no-op when it
    /// does not exist.
    async fn unsubscribe_operation(&self, connection_id: &str, operation_id: &str) -> Result<()>;

    /// Delete every subscription held by a connection, paginating in
    /// batch-sized pages. Idempotent: re-invocation after a partial failure
    /// must not error on already-deleted rows. Returns the number deleted.
    async fn unsubscribe_all_by_connection_id(&self, connection_id: &str) -> Result<usize>;

    /// Stream all live (non-expired) subscribers for the event's resolved
    /// name. Expired rows are skipped at read time; no ordering is
    /// guaranteed; the stream is rebuilt on every call.
    async fn subscribers_by_event(&self, event: &SubscriptionEvent) -> Result<SubscriberStream>;
}

/// Producer side of the event channel.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Append one event for asynchronous fan-out, at-least-once.
    async fn publish(&self, event: SubscriptionEvent) -> Result<()>;
}

/// Push-delivery transport for server-to-client frames.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Deliver a payload to a connection's endpoint.
    async fn post_to_connection(
        &self,
        connection_id: &str,
        endpoint: &str,
        payload: &str,
    ) -> std::result::Result<(), TransportError>;

    /// Actively terminate a physical connection.
    async fn delete_connection(
        &self,
        connection_id: &str,
        endpoint: &str,
    ) -> std::result::Result<(), TransportError>;
}

/// The embedding application's operation executor (a black box to the
/// engine). Given one operation and one optional triggering event, yields a
/// final result or a sequence of results.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one operation once.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hydrate_defaults() {
        let opts = HydrateOptions::default();
        assert_eq!(opts.retry_count, 0);
        assert_eq!(opts.retry_interval, Duration::from_millis(50));
    }
}
