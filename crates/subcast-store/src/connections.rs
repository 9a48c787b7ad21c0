//! Connection record lifecycle and delivery.
//!
//! [`SqlConnectionManager`] stores one row per live WebSocket connection and
//! owns the cleanup path: a terminal "gone" response from the push transport
//! unregisters the connection (and cascades through the subscription
//! registry) instead of surfacing an error to the sender.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info, warn};

use subcast_core::errors::{Result, SubcastError, TransportError};
use subcast_core::traits::{ConnectionManager, HydrateOptions, PushTransport, SubscriptionManager};
use subcast_core::ttl::{compute_ttl, is_ttl_expired};
use subcast_core::types::{Connection, ConnectionData};

use crate::error::StoreError;
use crate::pool::ConnectionPool;

/// Default connection TTL in seconds (2 hours).
pub const DEFAULT_CONNECTION_TTL: i64 = 7200;

/// `SQLite`-backed [`ConnectionManager`].
pub struct SqlConnectionManager {
    pool: ConnectionPool,
    subscriptions: Arc<dyn SubscriptionManager>,
    transport: Arc<dyn PushTransport>,
    ttl_seconds: Option<i64>,
}

impl SqlConnectionManager {
    /// Create a manager with the default TTL.
    pub fn new(
        pool: ConnectionPool,
        subscriptions: Arc<dyn SubscriptionManager>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            pool,
            subscriptions,
            transport,
            ttl_seconds: Some(DEFAULT_CONNECTION_TTL),
        }
    }

    /// Override the record TTL; `None` disables expiry.
    #[must_use]
    pub fn with_ttl(mut self, ttl_seconds: Option<i64>) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Read one connection row, including its raw TTL for the expiry check.
    fn read_row(&self, connection_id: &str) -> std::result::Result<Option<(Connection, Option<i64>)>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT endpoint, context, is_initialized, ttl FROM connections WHERE id = ?1",
                params![connection_id],
                |row| {
                    let endpoint: String = row.get(0)?;
                    let context: String = row.get(1)?;
                    let is_initialized: bool = row.get(2)?;
                    let ttl: Option<i64> = row.get(3)?;
                    Ok((endpoint, context, is_initialized, ttl))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((endpoint, context, is_initialized, ttl)) => {
                let connection = Connection {
                    id: connection_id.to_owned(),
                    data: ConnectionData {
                        endpoint,
                        context: serde_json::from_str(&context)?,
                        is_initialized,
                    },
                };
                Ok(Some((connection, ttl)))
            }
        }
    }
}

#[async_trait]
impl ConnectionManager for SqlConnectionManager {
    async fn register_connection(
        &self,
        connection_id: &str,
        endpoint: &str,
    ) -> Result<Connection> {
        let data = ConnectionData::new(endpoint);
        let ttl = compute_ttl(self.ttl_seconds);
        let conn = self.pool.get().map_err(StoreError::from)?;
        let _ = conn
            .execute(
                "INSERT OR REPLACE INTO connections \
                 (id, endpoint, context, is_initialized, created_at, ttl) \
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                params![
                    connection_id,
                    endpoint,
                    data.context.to_string(),
                    Utc::now().to_rfc3339(),
                    ttl,
                ],
            )
            .map_err(StoreError::from)?;
        debug!(connection_id, endpoint, "connection registered");
        Ok(Connection {
            id: connection_id.to_owned(),
            data,
        })
    }

    async fn hydrate_connection(
        &self,
        connection_id: &str,
        options: HydrateOptions,
    ) -> Result<Connection> {
        let mut found = None;
        for attempt in 0..=options.retry_count {
            if let Some(row) = self.read_row(connection_id)? {
                found = Some(row);
                break;
            }
            if attempt < options.retry_count {
                tokio::time::sleep(options.retry_interval).await;
            }
        }

        match found {
            Some((connection, ttl)) if !is_ttl_expired(ttl) => Ok(connection),
            _ => Err(SubcastError::ConnectionNotFound(connection_id.to_owned())),
        }
    }

    async fn set_connection_data(
        &self,
        connection: &Connection,
        data: ConnectionData,
    ) -> Result<()> {
        let conn = self.pool.get().map_err(StoreError::from)?;
        let _ = conn
            .execute(
                "UPDATE connections SET endpoint = ?2, context = ?3, is_initialized = ?4 \
                 WHERE id = ?1",
                params![
                    connection.id,
                    data.endpoint,
                    data.context.to_string(),
                    data.is_initialized,
                ],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn send_to_connection(&self, connection: &Connection, payload: &str) -> Result<()> {
        match self
            .transport
            .post_to_connection(&connection.id, &connection.data.endpoint, payload)
            .await
        {
            Ok(()) => Ok(()),
            Err(TransportError::Gone) => {
                // Stale peer: clean up instead of failing the send.
                info!(connection_id = %connection.id, "peer gone, unregistering connection");
                self.unregister_connection(connection).await
            }
            Err(err) => {
                warn!(connection_id = %connection.id, error = %err, "send failed");
                Err(err.into())
            }
        }
    }

    async fn unregister_connection(&self, connection: &Connection) -> Result<()> {
        let deleted = {
            let conn = self.pool.get().map_err(StoreError::from)?;
            conn.execute(
                "DELETE FROM connections WHERE id = ?1",
                params![connection.id],
            )
            .map_err(StoreError::from)?
        };
        let removed = self
            .subscriptions
            .unsubscribe_all_by_connection_id(&connection.id)
            .await?;
        debug!(
            connection_id = %connection.id,
            deleted,
            subscriptions_removed = removed,
            "connection unregistered"
        );
        Ok(())
    }

    async fn close_connection(&self, connection: &Connection) -> Result<()> {
        self.transport
            .delete_connection(&connection.id, &connection.data.endpoint)
            .await
            .map_err(SubcastError::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
