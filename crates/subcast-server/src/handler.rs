//! Socket event routing and the per-connection protocol state machine.
//!
//! A connection moves `Disconnected → Connected(uninitialized) → Initialized
//! → Disconnected`. Each inbound transport event is handled by one stateless
//! invocation of [`SocketEventHandler::handle`]; all state lives in the
//! connection record. The outer dispatch boundary converts every error into
//! a structured response — protocol violations become a 401-equivalent,
//! anything else a 500-equivalent — so nothing escapes the handler.

use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use subcast_core::errors::{Result, SubcastError};
use subcast_core::execution::{ExecutionOutcome, ExecutionRequest};
use subcast_core::protocol::{
    ClientMessage, ServerMessage, format_error_message, parse_client_message, select_subprotocol,
};
use subcast_core::retry::with_timeout;
use subcast_core::traits::HydrateOptions;
use subcast_core::types::{Connection, IdentifiedOperationRequest};

use crate::config::HookOutcome;
use crate::server::SubscriptionServer;

/// Which lifecycle route an inbound transport event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketRoute {
    /// Physical connection established.
    Connect,
    /// Physical connection closed.
    Disconnect,
    /// A frame arrived on an established connection.
    Message,
}

impl SocketRoute {
    fn label(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Message => "message",
        }
    }
}

/// One inbound transport event, as routed to this process.
#[derive(Clone, Debug)]
pub struct SocketEvent {
    /// Transport-assigned connection id.
    pub connection_id: String,
    /// Lifecycle route.
    pub route: SocketRoute,
    /// Delivery address for push responses.
    pub endpoint: String,
    /// Frame body (`Message` route only).
    pub body: Option<String>,
    /// Sub-protocol labels the client offered at connect time.
    pub offered_protocols: Vec<String>,
}

impl SocketEvent {
    /// A connect event.
    pub fn connect(connection_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            route: SocketRoute::Connect,
            endpoint: endpoint.into(),
            body: None,
            offered_protocols: Vec::new(),
        }
    }

    /// A disconnect event.
    pub fn disconnect(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            route: SocketRoute::Disconnect,
            endpoint: String::new(),
            body: None,
            offered_protocols: Vec::new(),
        }
    }

    /// A message event carrying a frame body.
    pub fn message(connection_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            route: SocketRoute::Message,
            endpoint: String::new(),
            body: Some(body.into()),
            offered_protocols: Vec::new(),
        }
    }

    /// Attach the client's offered sub-protocol labels.
    #[must_use]
    pub fn with_offered_protocols(mut self, protocols: Vec<String>) -> Self {
        self.offered_protocols = protocols;
        self
    }
}

/// Response handed back to the transport integration.
#[derive(Clone, Debug, PartialEq)]
pub struct SocketResponse {
    /// HTTP-equivalent status for the transport's integration response.
    pub status_code: u16,
    /// Response body (already-serialized protocol message, or empty).
    pub body: String,
    /// Selected sub-protocol label, on successful connects.
    pub subprotocol: Option<String>,
}

impl SocketResponse {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            body: body.into(),
            subprotocol: None,
        }
    }
}

/// Routes inbound socket events through the protocol state machine.
pub struct SocketEventHandler {
    server: Arc<SubscriptionServer>,
}

impl SocketEventHandler {
    /// Create a handler over the shared collaborator bundle.
    pub fn new(server: Arc<SubscriptionServer>) -> Self {
        Self { server }
    }

    /// Handle one transport event. Never returns an error: the dispatch
    /// boundary converts failures into structured responses.
    #[instrument(skip_all, fields(route = event.route.label(), connection_id = %event.connection_id))]
    pub async fn handle(&self, event: SocketEvent) -> SocketResponse {
        counter!("socket_events_total", "route" => event.route.label()).increment(1);

        let result = match event.route {
            SocketRoute::Connect => self.on_connect(&event).await,
            SocketRoute::Disconnect => self.on_disconnect(&event).await,
            SocketRoute::Message => self.on_message(&event).await,
        };

        match result {
            Ok(response) => response,
            Err(err) if err.is_protocol_violation() => {
                warn!(error = %err, "connection rejected");
                counter!("socket_rejections_total", "route" => event.route.label()).increment(1);
                SocketResponse {
                    status_code: 401,
                    body: format_error_message(err.to_string()),
                    subprotocol: None,
                }
            }
            Err(err) => {
                error!(error = %err, "socket handler failed");
                counter!("socket_errors_total", "route" => event.route.label()).increment(1);
                SocketResponse {
                    status_code: 500,
                    body: err.to_string(),
                    subprotocol: None,
                }
            }
        }
    }

    /// `$connect`: register the record, run the connect hook, persist any
    /// contributed context, negotiate a sub-protocol.
    async fn on_connect(&self, event: &SocketEvent) -> Result<SocketResponse> {
        let options = self.server.options();
        let endpoint = options
            .connection_endpoint
            .clone()
            .unwrap_or_else(|| event.endpoint.clone());

        let connection = self
            .server
            .connections()
            .register_connection(&event.connection_id, &endpoint)
            .await?;

        let hook_result = with_timeout(
            options.hook_timeout,
            self.server.hooks().on_websocket_connect(&connection),
        )
        .await;

        let context = match hook_result {
            Ok(HookOutcome::Approved) => None,
            Ok(HookOutcome::ApprovedWithContext(context)) => Some(context),
            Ok(HookOutcome::Rejected) => {
                self.server
                    .connections()
                    .unregister_connection(&connection)
                    .await?;
                return Err(SubcastError::Prohibited("connection rejected".into()));
            }
            Err(err) => {
                // Hook failures (including timeouts) abort registration.
                self.server
                    .connections()
                    .unregister_connection(&connection)
                    .await?;
                return Err(err);
            }
        };

        let mut data = connection.data.clone();
        if let Some(context) = context {
            data.merge_context(context);
        }
        self.server
            .connections()
            .set_connection_data(&connection, data)
            .await?;

        Ok(SocketResponse {
            status_code: 200,
            body: String::new(),
            subprotocol: select_subprotocol(&event.offered_protocols).map(str::to_owned),
        })
    }

    /// `$disconnect`: best-effort cleanup. The client is already gone, so
    /// nothing here is observable to it.
    async fn on_disconnect(&self, event: &SocketEvent) -> Result<SocketResponse> {
        let connection = match self
            .server
            .connections()
            .hydrate_connection(&event.connection_id, HydrateOptions::default())
            .await
        {
            Ok(connection) => connection,
            Err(SubcastError::ConnectionNotFound(_)) => {
                debug!("disconnect for unknown connection");
                return Ok(SocketResponse::ok(""));
            }
            Err(err) => return Err(err),
        };

        let hook = with_timeout(
            self.server.options().hook_timeout,
            self.server.hooks().on_disconnect(&connection),
        )
        .await;
        if let Err(err) = hook {
            warn!(error = %err, "on_disconnect hook failed");
        }

        self.server
            .connections()
            .unregister_connection(&connection)
            .await?;
        Ok(SocketResponse::ok(""))
    }

    /// `$default`: parse the frame, enforce the handshake, route by type.
    async fn on_message(&self, event: &SocketEvent) -> Result<SocketResponse> {
        let body = event
            .body
            .as_deref()
            .ok_or_else(|| SubcastError::MalformedOperation("empty message body".into()))?;
        let message = parse_client_message(body)?;

        let wait = self.server.options().wait_for_initialization;
        let mut connection = self
            .server
            .connections()
            .hydrate_connection(
                &event.connection_id,
                HydrateOptions {
                    retry_count: 1,
                    retry_interval: wait.retry_interval,
                },
            )
            .await?;

        if !connection.data.is_initialized && !message.is_connection_init() {
            // Another process may be completing the handshake right now;
            // poll the record before rejecting.
            for attempt in 0..=wait.retry_count {
                let fresh = self
                    .server
                    .connections()
                    .hydrate_connection(&event.connection_id, HydrateOptions::default())
                    .await?;
                if fresh.data.is_initialized {
                    connection = fresh;
                    break;
                }
                if attempt < wait.retry_count {
                    tokio::time::sleep(wait.retry_interval).await;
                }
            }

            if !connection.data.is_initialized {
                let error = format_error_message("prohibited connection: not initialized");
                self.server
                    .connections()
                    .send_to_connection(&connection, &error)
                    .await?;
                self.server
                    .connections()
                    .close_connection(&connection)
                    .await?;
                return Err(SubcastError::Prohibited("not initialized".into()));
            }
        }

        match message {
            ClientMessage::ConnectionInit { payload } => {
                self.on_connection_init(connection, payload).await
            }
            // Teardown happens on the transport disconnect, not here.
            ClientMessage::ConnectionTerminate => Ok(SocketResponse::ok("")),
            ClientMessage::Stop { id } => self.on_stop(connection, &id).await,
            ClientMessage::Start { id, payload } => {
                let operation = IdentifiedOperationRequest {
                    operation_id: id,
                    request: payload,
                };
                self.on_start(connection, operation).await
            }
        }
    }

    /// `connection_init`: run the init hook, merge context, mark the record
    /// initialized, acknowledge.
    async fn on_connection_init(
        &self,
        connection: Connection,
        payload: Option<Value>,
    ) -> Result<SocketResponse> {
        let hook_result = with_timeout(
            self.server.options().hook_timeout,
            self.server.hooks().on_connect(payload.as_ref(), &connection),
        )
        .await;

        let context = match hook_result {
            Ok(HookOutcome::Approved) => payload,
            Ok(HookOutcome::ApprovedWithContext(context)) => Some(context),
            Ok(HookOutcome::Rejected) => {
                return self
                    .reject_init(&connection, "prohibited connection".into())
                    .await;
            }
            Err(err) => return self.reject_init(&connection, err.to_string()).await,
        };

        let mut data = connection.data.clone();
        if let Some(context) = context {
            data.merge_context(context);
        }
        data.is_initialized = true;
        self.server
            .connections()
            .set_connection_data(&connection, data)
            .await?;

        let ack = ServerMessage::connection_ack().to_json();
        self.server
            .connections()
            .send_to_connection(&connection, &ack)
            .await?;
        Ok(SocketResponse::ok(ack))
    }

    /// Rejected handshake: tell the client why, then drop the line.
    async fn reject_init(&self, connection: &Connection, reason: String) -> Result<SocketResponse> {
        let error = format_error_message(&reason);
        self.server
            .connections()
            .send_to_connection(connection, &error)
            .await?;
        self.server
            .connections()
            .close_connection(connection)
            .await?;
        Err(SubcastError::Prohibited(reason))
    }

    /// `stop`: completion hook, `complete` frame, unsubscribe.
    async fn on_stop(&self, connection: Connection, operation_id: &str) -> Result<SocketResponse> {
        self.server
            .hooks()
            .on_operation_complete(&connection, operation_id)
            .await;

        let complete = ServerMessage::complete(operation_id).to_json();
        self.server
            .connections()
            .send_to_connection(&connection, &complete)
            .await?;

        self.server
            .subscriptions()
            .unsubscribe_operation(&connection.id, operation_id)
            .await?;
        Ok(SocketResponse::ok(complete))
    }

    /// `start`: execute with registration enabled. A single result means a
    /// query/mutation and is answered inline; a result sequence means the
    /// subscription registered itself during execution and no immediate
    /// response body is owed.
    async fn on_start(
        &self,
        connection: Connection,
        operation: IdentifiedOperationRequest,
    ) -> Result<SocketResponse> {
        let operation_id = operation.operation_id.clone();
        let request = ExecutionRequest::for_start(connection.clone(), operation);
        let outcome = self.server.execute(request).await?;

        match outcome {
            ExecutionOutcome::Single(result) => {
                self.server
                    .hooks()
                    .on_operation_complete(&connection, &operation_id)
                    .await;
                let data = ServerMessage::data(operation_id, result).to_json();
                self.server
                    .connections()
                    .send_to_connection(&connection, &data)
                    .await?;
                Ok(SocketResponse::ok(data))
            }
            ExecutionOutcome::Stream(_) => Ok(SocketResponse::ok("")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
