//! Executor invocation types.
//!
//! The engine never interprets operations itself — it assembles an
//! [`ExecutionRequest`] and hands it to the embedding application's
//! [`crate::traits::Executor`]. A query or mutation resolves to a single
//! final result; an accepted subscription resolves to a result sequence
//! (registration of the subscription happens inside execution, so fan-out
//! invocations must pass `register_subscriptions = false`).

use std::fmt;

use futures::stream::BoxStream;
use serde_json::Value;

use crate::types::{Connection, IdentifiedOperationRequest, SubscriptionEvent};

/// Everything an executor needs to run one operation once.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    /// Connection the operation runs on behalf of.
    pub connection: Connection,
    /// The identified operation to execute.
    pub operation: IdentifiedOperationRequest,
    /// Triggering event during fan-out; `None` for client-initiated starts.
    pub event: Option<SubscriptionEvent>,
    /// Whether subscription operations may register themselves. True only
    /// when the client sent the operation over the socket; always false
    /// during fan-out so redelivery cannot re-register.
    pub register_subscriptions: bool,
}

impl ExecutionRequest {
    /// Request for a client-initiated operation (registration enabled).
    pub fn for_start(connection: Connection, operation: IdentifiedOperationRequest) -> Self {
        Self {
            connection,
            operation,
            event: None,
            register_subscriptions: true,
        }
    }

    /// Request for one fan-out delivery (registration disabled).
    pub fn for_event(
        connection: Connection,
        operation: IdentifiedOperationRequest,
        event: SubscriptionEvent,
    ) -> Self {
        Self {
            connection,
            operation,
            event: Some(event),
            register_subscriptions: false,
        }
    }
}

/// What an execution produced.
pub enum ExecutionOutcome {
    /// A final result (query or mutation).
    Single(Value),
    /// An accepted subscription: a sequence of results, one per triggering
    /// event. Fan-out takes only the first element.
    Stream(BoxStream<'static, Value>),
}

impl ExecutionOutcome {
    /// Whether this outcome is an ongoing sequence.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl fmt::Debug for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(value) => f.debug_tuple("Single").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionData, OperationRequest};
    use futures::StreamExt;
    use serde_json::json;

    fn connection() -> Connection {
        Connection {
            id: "c1".into(),
            data: ConnectionData::new("ep"),
        }
    }

    fn operation() -> IdentifiedOperationRequest {
        IdentifiedOperationRequest {
            operation_id: "op1".into(),
            request: OperationRequest {
                query: "subscription { test }".into(),
                ..OperationRequest::default()
            },
        }
    }

    #[test]
    fn start_request_registers() {
        let req = ExecutionRequest::for_start(connection(), operation());
        assert!(req.register_subscriptions);
        assert!(req.event.is_none());
    }

    #[test]
    fn fanout_request_never_registers() {
        let event = SubscriptionEvent {
            event: "test".into(),
            payload: json!({}),
            id: None,
            ttl: None,
        };
        let req = ExecutionRequest::for_event(connection(), operation(), event.clone());
        assert!(!req.register_subscriptions);
        assert_eq!(req.event, Some(event));
    }

    #[tokio::test]
    async fn stream_outcome_yields_values() {
        let outcome = ExecutionOutcome::Stream(futures::stream::iter([json!(1), json!(2)]).boxed());
        assert!(outcome.is_stream());
        let ExecutionOutcome::Stream(mut stream) = outcome else {
            unreachable!();
        };
        assert_eq!(stream.next().await, Some(json!(1)));
    }

    #[test]
    fn single_outcome_debug() {
        let outcome = ExecutionOutcome::Single(json!({"ok": true}));
        assert!(!outcome.is_stream());
        assert!(format!("{outcome:?}").starts_with("Single"));
    }
}
