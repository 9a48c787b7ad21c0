//! Event fan-out: turning one published event into per-subscriber delivery.
//!
//! The fan-out algorithm is implemented once in [`EventFanout`] and
//! parametrized by a [`RecordDecoder`] — an eligibility predicate plus a
//! wire-to-event decoder. The change-stream and queue-backed processors
//! differ only in the decoder they supply.
//!
//! The channel redelivers at least once, and an error escaping a batch
//! would reprocess every record in it. Per-record and per-subscriber
//! failures are therefore caught, logged, and counted, never raised out of
//! `handle`.

use std::sync::Arc;

use futures::StreamExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use subcast_core::errors::Result;
use subcast_core::execution::{ExecutionOutcome, ExecutionRequest};
use subcast_core::protocol::ServerMessage;
use subcast_core::retry::{RetryConfig, retry};
use subcast_core::ttl::is_ttl_expired;
use subcast_core::types::{
    ChangeKind, ChangeRecord, IdentifiedOperationRequest, QueueRecord, Subscriber,
    SubscriptionEvent,
};

use crate::server::SubscriptionServer;

/// Decodes raw channel records into events, and decides which records are
/// eligible for processing at all.
pub trait RecordDecoder<R>: Send + Sync {
    /// Whether this record should be processed. Ineligible records are
    /// skipped silently.
    fn eligible(&self, record: &R) -> bool;

    /// Decode the record into the event it carries.
    fn decode(&self, record: &R) -> Result<SubscriptionEvent>;
}

/// Decoder for durable-log change notifications: only freshly appended rows
/// fan out; modifications and TTL deletions are not publications.
pub struct ChangeStreamDecoder;

impl RecordDecoder<ChangeRecord> for ChangeStreamDecoder {
    fn eligible(&self, record: &ChangeRecord) -> bool {
        record.kind == ChangeKind::Insert && record.image.is_some()
    }

    fn decode(&self, record: &ChangeRecord) -> Result<SubscriptionEvent> {
        let image = record.image.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(image)?)
    }
}

/// Decoder for message-queue records: every record is a JSON event body.
pub struct QueueDecoder;

impl RecordDecoder<QueueRecord> for QueueDecoder {
    fn eligible(&self, _record: &QueueRecord) -> bool {
        true
    }

    fn decode(&self, record: &QueueRecord) -> Result<SubscriptionEvent> {
        Ok(serde_json::from_str(&record.body)?)
    }
}

/// The shared fan-out core.
pub struct EventFanout {
    server: Arc<SubscriptionServer>,
    send_retry: RetryConfig,
}

impl EventFanout {
    /// Create a fan-out over the shared collaborator bundle.
    pub fn new(server: Arc<SubscriptionServer>) -> Self {
        Self {
            server,
            send_retry: RetryConfig::default(),
        }
    }

    /// Process a batch of raw records concurrently. Never returns an error:
    /// every failure is contained at the record or subscriber level.
    pub async fn process_batch<R: Sync, D: RecordDecoder<R>>(&self, records: &[R], decoder: &D) {
        let _ = futures::future::join_all(
            records
                .iter()
                .map(|record| self.process_record(record, decoder)),
        )
        .await;
    }

    /// Decode one record, check expiry, and dispatch to every subscriber.
    async fn process_record<R, D: RecordDecoder<R>>(&self, record: &R, decoder: &D) {
        if !decoder.eligible(record) {
            debug!("skipping ineligible record");
            return;
        }

        let event = match decoder.decode(record) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "failed to decode channel record");
                counter!("fanout_record_failures_total", "stage" => "decode").increment(1);
                return;
            }
        };

        // Expired before we got to it: a no-op, not an error.
        if is_ttl_expired(event.ttl) {
            debug!(event = %event.event, "discarding expired event");
            counter!("fanout_events_expired_total").increment(1);
            return;
        }

        self.dispatch(&event).await;
    }

    /// Fan one live event out to all of its subscribers, concurrently and
    /// in isolation.
    #[instrument(skip_all, fields(event = %event.event))]
    async fn dispatch(&self, event: &SubscriptionEvent) {
        let start = std::time::Instant::now();
        let subscribers = match self.server.subscriptions().subscribers_by_event(event).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to resolve subscribers");
                counter!("fanout_record_failures_total", "stage" => "scan").increment(1);
                return;
            }
        };

        subscribers
            .for_each_concurrent(None, |subscriber| async {
                match subscriber {
                    Ok(subscriber) => {
                        if let Err(err) = self.process_subscriber(event, &subscriber).await {
                            warn!(
                                connection_id = %subscriber.connection.id,
                                operation_id = %subscriber.operation_id,
                                error = %err,
                                "subscriber delivery failed"
                            );
                            counter!("fanout_subscriber_failures_total").increment(1);
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "subscriber scan page failed");
                        counter!("fanout_record_failures_total", "stage" => "scan").increment(1);
                    }
                }
            })
            .await;

        histogram!("fanout_dispatch_duration_seconds").record(start.elapsed().as_secs_f64());
    }

    /// Execute one subscriber's stored operation against the event and
    /// deliver the first yielded result.
    async fn process_subscriber(
        &self,
        event: &SubscriptionEvent,
        subscriber: &Subscriber,
    ) -> Result<()> {
        let operation = IdentifiedOperationRequest {
            operation_id: subscriber.operation_id.clone(),
            request: subscriber.operation.clone(),
        };
        let request = ExecutionRequest::for_event(
            subscriber.connection.clone(),
            operation,
            event.clone(),
        );

        let outcome = self.server.execute(request).await?;
        let ExecutionOutcome::Stream(mut results) = outcome else {
            // A stored subscription that executes to a final result has
            // nothing to deliver on an event.
            warn!(
                operation_id = %subscriber.operation_id,
                "unexpected single result during fan-out"
            );
            return Ok(());
        };

        // One triggering event yields at most one result step.
        if let Some(result) = results.next().await {
            let message = ServerMessage::data(&subscriber.operation_id, result).to_json();
            // Bounded retries absorb transient transport failures.
            retry(&self.send_retry, "fanout_send", || {
                self.server
                    .connections()
                    .send_to_connection(&subscriber.connection, &message)
            })
            .await?;
            counter!("fanout_deliveries_total").increment(1);
        }
        Ok(())
    }
}

/// Stream processor for the durable-log channel variant.
pub struct StreamProcessor {
    fanout: EventFanout,
}

impl StreamProcessor {
    /// Create a processor over the shared collaborator bundle.
    pub fn new(server: Arc<SubscriptionServer>) -> Self {
        Self {
            fanout: EventFanout::new(server),
        }
    }

    /// Process one batch of change records. Never raises.
    pub async fn handle(&self, records: &[ChangeRecord]) {
        self.fanout.process_batch(records, &ChangeStreamDecoder).await;
    }
}

/// Stream processor for the message-queue channel variant.
pub struct QueueProcessor {
    fanout: EventFanout,
}

impl QueueProcessor {
    /// Create a processor over the shared collaborator bundle.
    pub fn new(server: Arc<SubscriptionServer>) -> Self {
        Self {
            fanout: EventFanout::new(server),
        }
    }

    /// Process one batch of queue records. Never raises.
    pub async fn handle(&self, records: &[QueueRecord]) {
        self.fanout.process_batch(records, &QueueDecoder).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
