//! # subcast-store
//!
//! `SQLite`-backed implementations of the subcast durable-store collaborators:
//!
//! - [`connections::SqlConnectionManager`]: connection records and delivery
//! - [`subscriptions::SqlSubscriptionManager`]: single-table subscription
//!   layout, keyed (connection id, operation id) with an event-name index
//! - [`range_subscriptions::SqlRangeSubscriptionManager`]: dual-table
//!   layout, a forward table keyed (event, subscription id) and an inverse
//!   table keyed (subscription id, event), kept consistent with
//!   transactional deletes
//! - [`events::SqlEventStore`]: the append-only published-event log and its
//!   change-stream drain
//!
//! All implementations are stateless across calls: every operation goes
//! through the connection pool, never through process memory.

#![deny(unsafe_code)]

pub mod connections;
pub mod error;
pub mod events;
pub mod migrations;
pub mod pool;
pub mod range_subscriptions;
pub mod subscriptions;

pub use connections::SqlConnectionManager;
pub use error::StoreError;
pub use events::SqlEventStore;
pub use pool::{ConnectionConfig, ConnectionPool, PooledConnection, new_file, new_in_memory};
pub use range_subscriptions::SqlRangeSubscriptionManager;
pub use subscriptions::SqlSubscriptionManager;
