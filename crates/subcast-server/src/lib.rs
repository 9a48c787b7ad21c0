//! # subcast-server
//!
//! The subscription fan-out engine: everything between an inbound transport
//! event and a `data` frame pushed to a subscriber.
//!
//! - **Protocol machine**: [`handler::SocketEventHandler`], the
//!   per-connection state machine (connect, init, start/stop, disconnect)
//!   with its outer error boundary
//! - **Fan-out**: [`fanout::StreamProcessor`] / [`fanout::QueueProcessor`],
//!   two channel-specific fronts over one shared fan-out core
//! - **Pub/sub**: [`pubsub::PubSub`], producer-side publish and the
//!   executor-side subscription resolver
//! - **Bundle**: [`server::SubscriptionServer`], the collaborators (stores,
//!   executor, hooks, options) each invocation borrows
//! - **Config**: [`config::SubscriptionOptions`] and the
//!   [`config::SubscriptionHooks`] application seams
//!
//! No state survives an invocation: connections, subscriptions, and events
//! all live in the durable store, so any process can pick up any event.

#![deny(unsafe_code)]

pub mod config;
pub mod fanout;
pub mod handler;
pub mod pubsub;
pub mod server;

pub use config::{HookOutcome, NoopHooks, SubscriptionHooks, SubscriptionOptions};
pub use fanout::{EventFanout, QueueProcessor, RecordDecoder, StreamProcessor};
pub use handler::{SocketEvent, SocketEventHandler, SocketResponse, SocketRoute};
pub use pubsub::PubSub;
pub use server::SubscriptionServer;
