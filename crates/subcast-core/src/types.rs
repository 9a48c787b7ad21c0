//! Core persisted record types.
//!
//! These structs are the shared shape of what the durable store holds:
//! connection records, subscription rows (surfaced as [`Subscriber`]), and
//! published events. They serialize with camelCase field names for wire
//! compatibility with clients of the original protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mutable state carried by a connection record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionData {
    /// Delivery address the push transport posts to.
    pub endpoint: String,
    /// Application context merged in by connect/init hooks. Available during
    /// operation execution.
    #[serde(default)]
    pub context: Value,
    /// Set once the protocol handshake (`connection_init`) has completed.
    #[serde(default)]
    pub is_initialized: bool,
}

impl ConnectionData {
    /// Fresh state for a just-registered connection.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            context: Value::Object(serde_json::Map::new()),
            is_initialized: false,
        }
    }

    /// Merge extra context keys over the existing context object.
    ///
    /// Non-object context (either side) is replaced wholesale.
    pub fn merge_context(&mut self, extra: Value) {
        match (&mut self.context, extra) {
            (Value::Object(base), Value::Object(extra)) => {
                base.extend(extra);
            }
            (slot, extra) => *slot = extra,
        }
    }
}

/// A WebSocket connection as the engine sees it.
///
/// The id is assigned by the transport; everything else lives in `data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Opaque transport-assigned connection id.
    pub id: String,
    /// Mutable connection state.
    pub data: ConnectionData,
}

/// An operation request as supplied by the client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    /// Raw query document.
    pub query: String,
    /// Optional variables object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// Optional operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Optional protocol extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// An [`OperationRequest`] paired with the client-chosen operation id.
///
/// The (connection id, operation id) pair identifies a subscription; an
/// operation id is reused only after its prior subscription is torn down.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifiedOperationRequest {
    /// Client-supplied operation id, unique per connection.
    pub operation_id: String,
    /// The operation itself.
    #[serde(flatten)]
    pub request: OperationRequest,
}

/// One active subscription: a connection paired with its registered operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    /// Snapshot of the connection at subscribe time.
    pub connection: Connection,
    /// Operation id the subscription is registered under.
    pub operation_id: String,
    /// The stored operation request, re-executed on each matching event.
    pub operation: OperationRequest,
    /// Resolved event name the subscription listens to.
    pub event: String,
}

/// A published event flowing through the event channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    /// Event name subscribers are matched against.
    pub event: String,
    /// Event payload (often a pre-serialized JSON string, see `PubSub`).
    pub payload: Value,
    /// Store-assigned unique id, set at publish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Optional expiry in UNIX seconds; expired events are discarded unread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

/// Kind of change carried by a durable-log change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A new row was appended. The only kind eligible for fan-out.
    Insert,
    /// An existing row was modified.
    Modify,
    /// A row was removed (e.g. TTL garbage collection).
    Remove,
}

/// One raw record from the durable-log change stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// What happened to the row.
    pub kind: ChangeKind,
    /// Row image after the change, when the channel provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Value>,
}

/// One raw record from the message-queue channel: an opaque JSON body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// The message body, expected to decode as a [`SubscriptionEvent`].
    pub body: String,
}
