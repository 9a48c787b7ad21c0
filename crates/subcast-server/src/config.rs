//! Server options and application hooks.
//!
//! Hooks are the embedding application's seams into the connection
//! lifecycle. Connect/init hooks may approve, reject, or contribute context
//! that is merged into the connection record; every hook invocation is
//! bounded by [`SubscriptionOptions::hook_timeout`], and an overrun counts
//! as a hook failure.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use subcast_core::errors::Result;
use subcast_core::execution::ExecutionRequest;
use subcast_core::types::Connection;

/// How long a handler waits for another process to finish the handshake
/// before rejecting a non-init message on an uninitialized connection.
#[derive(Clone, Copy, Debug)]
pub struct WaitForInitialization {
    /// Re-hydration attempts after the first check.
    pub retry_count: u32,
    /// Fixed delay between attempts.
    pub retry_interval: Duration,
}

impl Default for WaitForInitialization {
    fn default() -> Self {
        Self {
            retry_count: 10,
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Tunables for the protocol state machine.
#[derive(Clone, Debug)]
pub struct SubscriptionOptions {
    /// Upper bound on any single application hook invocation.
    pub hook_timeout: Duration,
    /// Handshake wait behavior for early operations.
    pub wait_for_initialization: WaitForInitialization,
    /// When set, connections register with this delivery address instead of
    /// the one extracted from the transport event.
    pub connection_endpoint: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            hook_timeout: Duration::from_secs(15),
            wait_for_initialization: WaitForInitialization::default(),
            connection_endpoint: None,
        }
    }
}

/// Decision returned by connect/init hooks.
#[derive(Clone, Debug, PartialEq)]
pub enum HookOutcome {
    /// Continue without touching the connection context.
    Approved,
    /// Continue and merge this object into the connection context.
    ApprovedWithContext(Value),
    /// Abort: the connection is torn down and the client receives an
    /// unauthorized-equivalent response.
    Rejected,
}

/// Application hooks into the connection and operation lifecycle.
///
/// Every method has a no-op default; implement only what you need. Errors
/// (and timeouts) from connect/init hooks reject the connection; errors from
/// the disconnect hook are logged and swallowed, since the client is already
/// gone.
#[async_trait]
pub trait SubscriptionHooks: Send + Sync {
    /// Runs on the transport connect event, before the handshake.
    async fn on_websocket_connect(&self, _connection: &Connection) -> Result<HookOutcome> {
        Ok(HookOutcome::Approved)
    }

    /// Runs on `connection_init`, with the message payload.
    async fn on_connect(
        &self,
        _payload: Option<&Value>,
        _connection: &Connection,
    ) -> Result<HookOutcome> {
        Ok(HookOutcome::Approved)
    }

    /// Runs on transport disconnect, before the record is unregistered.
    async fn on_disconnect(&self, _connection: &Connection) -> Result<()> {
        Ok(())
    }

    /// Runs when an operation finishes (stop message, or a single-result
    /// operation completing).
    async fn on_operation_complete(&self, _connection: &Connection, _operation_id: &str) {}

    /// May rewrite execution parameters before the executor runs.
    async fn on_operation(&self, request: ExecutionRequest) -> Result<ExecutionRequest> {
        Ok(request)
    }
}

/// The default hook set: everything approved, nothing rewritten.
pub struct NoopHooks;

#[async_trait]
impl SubscriptionHooks for NoopHooks {}
