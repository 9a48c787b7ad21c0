//! Wire protocol messages and parse-time canonicalization.
//!
//! Two historical protocol variants use different type strings for the same
//! messages (`start`/`subscribe`, `stop`/`complete`, `data`/`next`). Inbound
//! messages are canonicalized into [`ClientMessage`] once, at parse time;
//! nothing downstream compares raw type strings. Outbound messages serialize
//! with the legacy spellings, which both client generations accept.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, SubcastError};
use crate::types::OperationRequest;

/// Sub-protocol label of the legacy `subscriptions-transport-ws` variant.
pub const SUBPROTOCOL_GRAPHQL_WS: &str = "graphql-ws";
/// Sub-protocol label of the newer `graphql-ws` transport variant.
pub const SUBPROTOCOL_GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";

/// Pick a compatible sub-protocol from the client's offered list.
///
/// Prefers the label the client listed first; returns `None` when nothing
/// recognizable was offered (the connect response then carries no label).
pub fn select_subprotocol<S: AsRef<str>>(offered: &[S]) -> Option<&'static str> {
    offered.iter().find_map(|label| match label.as_ref().trim() {
        SUBPROTOCOL_GRAPHQL_WS => Some(SUBPROTOCOL_GRAPHQL_WS),
        SUBPROTOCOL_GRAPHQL_TRANSPORT_WS => Some(SUBPROTOCOL_GRAPHQL_TRANSPORT_WS),
        _ => None,
    })
}

/// Inbound client message, canonicalized.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// Handshake opener; optional free-form payload for the `on_connect` hook.
    ConnectionInit {
        /// Free-form context payload.
        payload: Option<Value>,
    },
    /// Start an operation (`start` or `subscribe` on the wire).
    Start {
        /// Client-chosen operation id.
        id: String,
        /// The operation to run.
        payload: OperationRequest,
    },
    /// Stop an operation (`stop` or `complete` on the wire).
    Stop {
        /// Operation id to stop.
        id: String,
    },
    /// Client-requested teardown; actual cleanup happens on disconnect.
    ConnectionTerminate,
}

impl ClientMessage {
    /// Whether this is the handshake opener.
    pub fn is_connection_init(&self) -> bool {
        matches!(self, Self::ConnectionInit { .. })
    }
}

/// Parse and canonicalize an inbound message body.
///
/// Structural problems (not an object, missing `type`, missing required
/// fields) surface as [`SubcastError::MalformedOperation`]; a well-formed
/// message of an unknown type surfaces as [`SubcastError::InvalidOperation`].
pub fn parse_client_message(body: &str) -> Result<ClientMessage> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| SubcastError::MalformedOperation(e.to_string()))?;

    let Some(message) = value.as_object() else {
        return Err(SubcastError::MalformedOperation(
            "message is not an object".into(),
        ));
    };

    let Some(message_type) = message.get("type").and_then(Value::as_str) else {
        return Err(SubcastError::MalformedOperation("type is missing".into()));
    };

    match message_type {
        "connection_init" => Ok(ClientMessage::ConnectionInit {
            payload: message.get("payload").cloned(),
        }),
        "connection_terminate" => Ok(ClientMessage::ConnectionTerminate),
        "stop" | "complete" => {
            let id = require_id(message)?;
            Ok(ClientMessage::Stop { id })
        }
        "start" | "subscribe" => {
            let id = require_id(message)?;
            let payload = message
                .get("payload")
                .filter(|p| p.is_object())
                .ok_or_else(|| {
                    SubcastError::MalformedOperation(
                        "property payload is missing or is not an object".into(),
                    )
                })?;
            let payload: OperationRequest = serde_json::from_value(payload.clone())
                .map_err(|e| SubcastError::MalformedOperation(e.to_string()))?;
            Ok(ClientMessage::Start { id, payload })
        }
        other => Err(SubcastError::InvalidOperation(format!(
            "unsupported message type {other:?}; only connection_init, connection_terminate, \
             start/subscribe and stop/complete are accepted"
        ))),
    }
}

fn require_id(message: &serde_json::Map<String, Value>) -> Result<String> {
    message
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| SubcastError::MalformedOperation("property id is missing".into()))
}

/// Error body carried by an outbound `error` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable reason.
    pub message: String,
}

/// Outbound server message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgment.
    ConnectionAck {
        /// Optional free-form payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Execution result for an operation.
    Data {
        /// Operation id the result belongs to.
        id: String,
        /// Execution result payload.
        payload: Value,
    },
    /// Operation finished.
    Complete {
        /// Operation id that completed.
        id: String,
    },
    /// Protocol or execution error.
    Error {
        /// Operation id, when the error relates to one.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Structured reason.
        payload: ErrorPayload,
    },
}

impl ServerMessage {
    /// Handshake acknowledgment without payload.
    pub fn connection_ack() -> Self {
        Self::ConnectionAck { payload: None }
    }

    /// `data` message tagged with the operation id.
    pub fn data(id: impl Into<String>, payload: Value) -> Self {
        Self::Data {
            id: id.into(),
            payload,
        }
    }

    /// `complete` message for an operation.
    pub fn complete(id: impl Into<String>) -> Self {
        Self::Complete { id: id.into() }
    }

    /// `error` message without an operation id.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            id: None,
            payload: ErrorPayload {
                message: message.into(),
            },
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> String {
        // Serialization of these closed variants cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Shorthand for the wire form of an `error` message.
pub fn format_error_message(message: impl Into<String>) -> String {
    ServerMessage::error(message).to_json()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
