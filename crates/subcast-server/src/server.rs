//! The collaborator bundle shared by every handler invocation.
//!
//! [`SubscriptionServer`] wires the connection manager, subscription
//! registry, executor, hooks, and options together. It holds no other state:
//! each invocation of the socket handler or stream processor borrows the
//! bundle and works entirely through the durable store and the transport.

use std::sync::Arc;

use subcast_core::errors::Result;
use subcast_core::execution::{ExecutionOutcome, ExecutionRequest};
use subcast_core::traits::{ConnectionManager, Executor, SubscriptionManager};

use crate::config::{NoopHooks, SubscriptionHooks, SubscriptionOptions};

/// Shared collaborator bundle.
pub struct SubscriptionServer {
    connections: Arc<dyn ConnectionManager>,
    subscriptions: Arc<dyn SubscriptionManager>,
    executor: Arc<dyn Executor>,
    hooks: Arc<dyn SubscriptionHooks>,
    options: SubscriptionOptions,
}

impl SubscriptionServer {
    /// Bundle the required collaborators with default options and no-op hooks.
    pub fn new(
        connections: Arc<dyn ConnectionManager>,
        subscriptions: Arc<dyn SubscriptionManager>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            connections,
            subscriptions,
            executor,
            hooks: Arc::new(NoopHooks),
            options: SubscriptionOptions::default(),
        }
    }

    /// Install application hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn SubscriptionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Override the default options.
    #[must_use]
    pub fn with_options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    /// The connection manager.
    pub fn connections(&self) -> &Arc<dyn ConnectionManager> {
        &self.connections
    }

    /// The subscription registry.
    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionManager> {
        &self.subscriptions
    }

    /// The installed hooks.
    pub fn hooks(&self) -> &Arc<dyn SubscriptionHooks> {
        &self.hooks
    }

    /// The active options.
    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// Run one operation through the `on_operation` rewrite hook and the
    /// executor.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        let request = self.hooks.on_operation(request).await?;
        self.executor.execute(request).await
    }
}
