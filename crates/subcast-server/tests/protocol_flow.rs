//! End-to-end protocol flows over the real SQLite stores: handshake,
//! subscription registration, publish → fan-out → delivery, teardown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use subcast_core::errors::TransportError;
use subcast_core::execution::{ExecutionOutcome, ExecutionRequest};
use subcast_core::traits::{
    ConnectionManager, EventPublisher, Executor, HydrateOptions, PushTransport,
    SubscriptionManager,
};
use subcast_core::types::SubscriptionEvent;
use subcast_server::config::{SubscriptionOptions, WaitForInitialization};
use subcast_server::{PubSub, SocketEvent, SocketEventHandler, StreamProcessor, SubscriptionServer};
use subcast_store::migrations::run_migrations;
use subcast_store::pool::{ConnectionConfig, new_in_memory};
use subcast_store::{SqlConnectionManager, SqlEventStore, SqlSubscriptionManager};

/// Records every push and simulates "gone" peers.
struct RecordingTransport {
    sent: parking_lot::Mutex<Vec<(String, String)>>,
    gone: parking_lot::Mutex<std::collections::HashSet<String>>,
    closed: parking_lot::Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn new() -> Self {
        Self {
            sent: parking_lot::Mutex::new(Vec::new()),
            gone: parking_lot::Mutex::new(std::collections::HashSet::new()),
            closed: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn frames_for(&self, connection_id: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| id == connection_id)
            .map(|(_, payload)| serde_json::from_str(payload).unwrap())
            .collect()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn post_to_connection(
        &self,
        connection_id: &str,
        _endpoint: &str,
        payload: &str,
    ) -> Result<(), TransportError> {
        if self.gone.lock().contains(connection_id) {
            return Err(TransportError::Gone);
        }
        self.sent
            .lock()
            .push((connection_id.to_owned(), payload.to_owned()));
        Ok(())
    }

    async fn delete_connection(
        &self,
        connection_id: &str,
        _endpoint: &str,
    ) -> Result<(), TransportError> {
        self.closed.lock().push(connection_id.to_owned());
        Ok(())
    }
}

/// Executor that resolves `subscription { NAME }` via the pub/sub resolver
/// and answers anything else with a single echo result.
struct PubSubExecutor {
    pubsub: PubSub,
    registry: Arc<dyn SubscriptionManager>,
}

#[async_trait]
impl Executor for PubSubExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> subcast_core::Result<ExecutionOutcome> {
        let query = request.operation.request.query.trim();
        if let Some(rest) = query.strip_prefix("subscription") {
            let name: String = rest.chars().filter(|c| c.is_alphanumeric()).collect();
            let stream = self
                .pubsub
                .subscribe(&[name], &self.registry, &request)
                .await?;
            // Subscription steps deliver the raw payload as the result data.
            Ok(ExecutionOutcome::Stream(Box::pin(
                futures::StreamExt::map(stream, |payload| json!({"data": payload})),
            )))
        } else {
            Ok(ExecutionOutcome::Single(json!({"data": {"echo": query}})))
        }
    }
}

struct Stack {
    handler: SocketEventHandler,
    processor: StreamProcessor,
    pubsub: PubSub,
    event_store: Arc<SqlEventStore>,
    transport: Arc<RecordingTransport>,
    connections: Arc<dyn ConnectionManager>,
    subscriptions: Arc<SqlSubscriptionManager>,
}

fn stack() -> Stack {
    stack_with_options(SubscriptionOptions::default())
}

fn stack_with_options(options: SubscriptionOptions) -> Stack {
    let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();

    let subscriptions = Arc::new(SqlSubscriptionManager::new(pool.clone()));
    let transport = Arc::new(RecordingTransport::new());
    let connections: Arc<dyn ConnectionManager> = Arc::new(SqlConnectionManager::new(
        pool.clone(),
        subscriptions.clone(),
        transport.clone(),
    ));
    let event_store = Arc::new(SqlEventStore::new(pool));
    let pubsub = PubSub::new(event_store.clone()).with_raw_payload();

    let executor = Arc::new(PubSubExecutor {
        pubsub: PubSub::new(event_store.clone()).with_raw_payload(),
        registry: subscriptions.clone(),
    });
    let server = Arc::new(
        SubscriptionServer::new(connections.clone(), subscriptions.clone(), executor)
            .with_options(options),
    );

    Stack {
        handler: SocketEventHandler::new(server.clone()),
        processor: StreamProcessor::new(server),
        pubsub,
        event_store,
        transport,
        connections,
        subscriptions,
    }
}

async fn subscriber_count(stack: &Stack, event_name: &str) -> usize {
    let event = SubscriptionEvent {
        event: event_name.into(),
        payload: json!({}),
        id: None,
        ttl: None,
    };
    let subscribers: Vec<_> = futures::TryStreamExt::try_collect(
        stack
            .subscriptions
            .subscribers_by_event(&event)
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    subscribers.len()
}

#[tokio::test]
async fn full_subscription_lifecycle() {
    let stack = stack();

    // Connect, then handshake.
    let resp = stack
        .handler
        .handle(SocketEvent::connect("C1", "wss://gw.test/prod"))
        .await;
    assert_eq!(resp.status_code, 200);

    let resp = stack
        .handler
        .handle(SocketEvent::message("C1", r#"{"type":"connection_init"}"#))
        .await;
    assert_eq!(resp.status_code, 200);
    let frames = stack.transport.frames_for("C1");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "connection_ack");

    // Start a subscription: no immediate data, but a stored registration.
    let resp = stack
        .handler
        .handle(SocketEvent::message(
            "C1",
            r#"{"type":"start","id":"op1","payload":{"query":"subscription{test}"}}"#,
        ))
        .await;
    assert_eq!(resp.status_code, 200);
    assert!(resp.body.is_empty());
    assert_eq!(stack.transport.frames_for("C1").len(), 1);
    assert_eq!(subscriber_count(&stack, "test").await, 1);

    // Publish and run the stream processor: exactly one data frame.
    stack.pubsub.publish("test", json!({"n": 7})).await.unwrap();
    let records = stack.event_store.drain_change_records().unwrap();
    assert_eq!(records.len(), 1);
    stack.processor.handle(&records).await;

    let frames = stack.transport.frames_for("C1");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1]["type"], "data");
    assert_eq!(frames[1]["id"], "op1");
    assert_eq!(frames[1]["payload"]["data"]["n"], 7);

    // Stop: complete frame, subscription removed.
    let resp = stack
        .handler
        .handle(SocketEvent::message("C1", r#"{"type":"stop","id":"op1"}"#))
        .await;
    assert_eq!(resp.status_code, 200);
    let frames = stack.transport.frames_for("C1");
    assert_eq!(frames.last().unwrap()["type"], "complete");
    assert_eq!(subscriber_count(&stack, "test").await, 0);
}

#[tokio::test(start_paused = true)]
async fn start_before_init_is_rejected_and_closed() {
    let stack = stack_with_options(SubscriptionOptions {
        wait_for_initialization: WaitForInitialization {
            retry_count: 5,
            retry_interval: Duration::from_millis(50),
        },
        ..Default::default()
    });

    let _ = stack
        .handler
        .handle(SocketEvent::connect("C1", "ep"))
        .await;
    let resp = stack
        .handler
        .handle(SocketEvent::message(
            "C1",
            r#"{"type":"start","id":"op1","payload":{"query":"subscription{test}"}}"#,
        ))
        .await;

    assert_eq!(resp.status_code, 401);
    let frames = stack.transport.frames_for("C1");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "error");
    assert!(
        frames[0]["payload"]["message"]
            .as_str()
            .unwrap()
            .contains("not initialized")
    );
    assert_eq!(stack.transport.closed.lock().as_slice(), &["C1".to_owned()]);
    assert_eq!(subscriber_count(&stack, "test").await, 0);
}

#[tokio::test]
async fn expired_event_produces_no_deliveries_and_no_errors() {
    let stack = stack();
    let _ = stack
        .handler
        .handle(SocketEvent::connect("C1", "ep"))
        .await;
    let _ = stack
        .handler
        .handle(SocketEvent::message("C1", r#"{"type":"connection_init"}"#))
        .await;
    let _ = stack
        .handler
        .handle(SocketEvent::message(
            "C1",
            r#"{"type":"start","id":"op1","payload":{"query":"subscription{test}"}}"#,
        ))
        .await;

    // Publish with an already-elapsed TTL.
    stack
        .event_store
        .publish(SubscriptionEvent {
            event: "test".into(),
            payload: json!({"n": 1}),
            id: None,
            ttl: Some(1),
        })
        .await
        .unwrap();
    let records = stack.event_store.drain_change_records().unwrap();
    stack.processor.handle(&records).await;

    // Only the handshake ack; no data frame, and handle() returned cleanly.
    assert_eq!(stack.transport.frames_for("C1").len(), 1);
}

#[tokio::test]
async fn fan_out_reaches_every_connection() {
    let stack = stack();
    for id in ["C1", "C2", "C3"] {
        let _ = stack.handler.handle(SocketEvent::connect(id, "ep")).await;
        let _ = stack
            .handler
            .handle(SocketEvent::message(id, r#"{"type":"connection_init"}"#))
            .await;
        let _ = stack
            .handler
            .handle(SocketEvent::message(
                id,
                r#"{"type":"start","id":"op1","payload":{"query":"subscription{test}"}}"#,
            ))
            .await;
    }

    stack.pubsub.publish("test", json!({"n": 1})).await.unwrap();
    let records = stack.event_store.drain_change_records().unwrap();
    stack.processor.handle(&records).await;

    for id in ["C1", "C2", "C3"] {
        let frames = stack.transport.frames_for(id);
        assert_eq!(frames.len(), 2, "connection {id}");
        assert_eq!(frames[1]["type"], "data");
    }
}

#[tokio::test]
async fn gone_subscriber_is_cleaned_up_during_fan_out() {
    let stack = stack();
    for id in ["C1", "C2"] {
        let _ = stack.handler.handle(SocketEvent::connect(id, "ep")).await;
        let _ = stack
            .handler
            .handle(SocketEvent::message(id, r#"{"type":"connection_init"}"#))
            .await;
        let _ = stack
            .handler
            .handle(SocketEvent::message(
                id,
                r#"{"type":"start","id":"op1","payload":{"query":"subscription{test}"}}"#,
            ))
            .await;
    }

    // C1's peer vanished between registration and delivery.
    let _ = stack.transport.gone.lock().insert("C1".to_owned());

    stack.pubsub.publish("test", json!({"n": 1})).await.unwrap();
    let records = stack.event_store.drain_change_records().unwrap();
    stack.processor.handle(&records).await;

    // C2 still got its frame.
    assert_eq!(stack.transport.frames_for("C2").len(), 2);

    // C1's connection and subscriptions are gone.
    let hydrated = stack
        .connections
        .hydrate_connection("C1", HydrateOptions::default())
        .await;
    assert!(hydrated.is_err());
    assert_eq!(subscriber_count(&stack, "test").await, 1);
}

#[tokio::test]
async fn redelivered_event_is_delivered_again() {
    // At-least-once, possibly-duplicate delivery: no dedup key is written.
    let stack = stack();
    let _ = stack.handler.handle(SocketEvent::connect("C1", "ep")).await;
    let _ = stack
        .handler
        .handle(SocketEvent::message("C1", r#"{"type":"connection_init"}"#))
        .await;
    let _ = stack
        .handler
        .handle(SocketEvent::message(
            "C1",
            r#"{"type":"start","id":"op1","payload":{"query":"subscription{test}"}}"#,
        ))
        .await;

    stack.pubsub.publish("test", json!({"n": 1})).await.unwrap();
    let records = stack.event_store.drain_change_records().unwrap();
    stack.processor.handle(&records).await;
    stack.processor.handle(&records).await;

    // Ack + two data frames.
    assert_eq!(stack.transport.frames_for("C1").len(), 3);
}

#[tokio::test]
async fn operation_id_is_reusable_after_teardown() {
    let stack = stack();
    let _ = stack.handler.handle(SocketEvent::connect("C1", "ep")).await;
    let _ = stack
        .handler
        .handle(SocketEvent::message("C1", r#"{"type":"connection_init"}"#))
        .await;

    let start = r#"{"type":"start","id":"op1","payload":{"query":"subscription{test}"}}"#;
    let _ = stack.handler.handle(SocketEvent::message("C1", start)).await;
    let _ = stack
        .handler
        .handle(SocketEvent::message("C1", r#"{"type":"stop","id":"op1"}"#))
        .await;
    assert_eq!(subscriber_count(&stack, "test").await, 0);

    let resp = stack.handler.handle(SocketEvent::message("C1", start)).await;
    assert_eq!(resp.status_code, 200);
    assert_eq!(subscriber_count(&stack, "test").await, 1);
}

#[tokio::test]
async fn legacy_and_modern_spellings_interoperate() {
    let stack = stack();
    let _ = stack.handler.handle(SocketEvent::connect("C1", "ep")).await;
    let _ = stack
        .handler
        .handle(SocketEvent::message("C1", r#"{"type":"connection_init"}"#))
        .await;

    // Modern "subscribe" registers like legacy "start"...
    let resp = stack
        .handler
        .handle(SocketEvent::message(
            "C1",
            r#"{"type":"subscribe","id":"op1","payload":{"query":"subscription{test}"}}"#,
        ))
        .await;
    assert_eq!(resp.status_code, 200);
    assert_eq!(subscriber_count(&stack, "test").await, 1);

    // ...and modern "complete" tears down like legacy "stop".
    let resp = stack
        .handler
        .handle(SocketEvent::message(
            "C1",
            r#"{"type":"complete","id":"op1"}"#,
        ))
        .await;
    assert_eq!(resp.status_code, 200);
    assert_eq!(subscriber_count(&stack, "test").await, 0);
}
