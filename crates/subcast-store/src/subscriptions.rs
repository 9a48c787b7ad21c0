//! Single-table subscription layout.
//!
//! Rows are keyed by (connection id, operation id) so one connection's
//! subscriptions can be torn down with a paginated key scan; an index on the
//! event name serves fan-out. Expiry is enforced at read time — expired rows
//! are skipped by the fan-out filter and removed opportunistically by
//! teardown deletes, never actively evicted.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use rusqlite::params;
use tracing::debug;

use subcast_core::errors::{Result, SubcastError};
use subcast_core::traits::{SubscriberStream, SubscriptionManager};
use subcast_core::ttl::{compute_ttl, now_unix};
use subcast_core::types::{
    Connection, IdentifiedOperationRequest, Subscriber, SubscriptionEvent,
};

use crate::error::StoreError;
use crate::pool::ConnectionPool;

/// Default subscription TTL in seconds (2 hours).
pub const DEFAULT_SUBSCRIPTION_TTL: i64 = 7200;

/// Page size for fan-out scans over the event-name index.
const FANOUT_PAGE_SIZE: usize = 50;

/// Batch ceiling for teardown deletes.
const TEARDOWN_BATCH_SIZE: usize = 25;

/// Resolve the subscription name to store/fan out, from a published event.
/// The default uses the event's own name; override for multi-tenant
/// namespacing.
pub type NameFromEvent = Arc<dyn Fn(&SubscriptionEvent) -> String + Send + Sync>;

/// Resolve the subscription name at subscribe time, from the requested name
/// and the subscribing connection.
pub type NameFromConnection = Arc<dyn Fn(&str, &Connection) -> String + Send + Sync>;

/// `SQLite`-backed [`SubscriptionManager`] using the single-table layout.
pub struct SqlSubscriptionManager {
    pool: ConnectionPool,
    ttl_seconds: Option<i64>,
    name_from_event: NameFromEvent,
    name_from_connection: NameFromConnection,
}

impl SqlSubscriptionManager {
    /// Create a manager with default TTL and identity name resolution.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            ttl_seconds: Some(DEFAULT_SUBSCRIPTION_TTL),
            name_from_event: Arc::new(|event| event.event.clone()),
            name_from_connection: Arc::new(|name, _| name.to_owned()),
        }
    }

    /// Override the record TTL; `None` disables expiry.
    #[must_use]
    pub fn with_ttl(mut self, ttl_seconds: Option<i64>) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Override event-to-name resolution (multi-tenancy).
    #[must_use]
    pub fn with_name_from_event(mut self, f: NameFromEvent) -> Self {
        self.name_from_event = f;
        self
    }

    /// Override subscribe-time name resolution (multi-tenancy).
    #[must_use]
    pub fn with_name_from_connection(mut self, f: NameFromConnection) -> Self {
        self.name_from_connection = f;
        self
    }
}

/// One page of subscribers plus the continuation key, if more may remain.
type Page = (Vec<Subscriber>, Option<(String, String)>);

fn fetch_page(
    pool: &ConnectionPool,
    event_name: &str,
    now: i64,
    cursor: Option<(String, String)>,
) -> std::result::Result<Page, StoreError> {
    let conn = pool.get()?;
    let mut rows: Vec<(String, String, String, String, String)> = Vec::new();

    let map_row = |row: &rusqlite::Row<'_>| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    };

    if let Some((last_connection, last_operation)) = cursor {
        let mut stmt = conn.prepare(
            "SELECT connection_id, operation_id, event, connection, operation \
             FROM subscriptions \
             WHERE event = ?1 AND (ttl IS NULL OR ttl > ?2) \
               AND (connection_id, operation_id) > (?3, ?4) \
             ORDER BY connection_id, operation_id \
             LIMIT ?5",
        )?;
        let mapped = stmt.query_map(
            params![
                event_name,
                now,
                last_connection,
                last_operation,
                FANOUT_PAGE_SIZE as i64
            ],
            map_row,
        )?;
        for row in mapped {
            rows.push(row?);
        }
    } else {
        let mut stmt = conn.prepare(
            "SELECT connection_id, operation_id, event, connection, operation \
             FROM subscriptions \
             WHERE event = ?1 AND (ttl IS NULL OR ttl > ?2) \
             ORDER BY connection_id, operation_id \
             LIMIT ?3",
        )?;
        let mapped = stmt.query_map(params![event_name, now, FANOUT_PAGE_SIZE as i64], map_row)?;
        for row in mapped {
            rows.push(row?);
        }
    }

    // Continue while the store filled a whole page; a short page means the
    // scan is exhausted.
    let next = (rows.len() == FANOUT_PAGE_SIZE)
        .then(|| rows.last().map(|r| (r.0.clone(), r.1.clone())))
        .flatten();

    let mut subscribers = Vec::with_capacity(rows.len());
    for (_, operation_id, event, connection, operation) in rows {
        subscribers.push(Subscriber {
            connection: serde_json::from_str(&connection)?,
            operation_id,
            operation: serde_json::from_str(&operation)?,
            event,
        });
    }
    Ok((subscribers, next))
}

struct ScanState {
    buffer: VecDeque<Subscriber>,
    cursor: Option<(String, String)>,
    done: bool,
}

#[async_trait]
impl SubscriptionManager for SqlSubscriptionManager {
    async fn subscribe(
        &self,
        event_names: &[String],
        connection: &Connection,
        operation: &IdentifiedOperationRequest,
    ) -> Result<()> {
        // One subscription document maps to one operation id maps to one
        // event name.
        let [name] = event_names else {
            return Err(SubcastError::InvalidOperation(format!(
                "exactly one event name per subscription, got {}",
                event_names.len()
            )));
        };
        let name = (self.name_from_connection)(name, connection);
        let ttl = compute_ttl(self.ttl_seconds);

        let conn = self.pool.get().map_err(StoreError::from)?;
        let _ = conn
            .execute(
                "INSERT OR REPLACE INTO subscriptions \
                 (connection_id, operation_id, event, connection, operation, ttl) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    connection.id,
                    operation.operation_id,
                    name,
                    serde_json::to_string(connection)?,
                    serde_json::to_string(&operation.request)?,
                    ttl,
                ],
            )
            .map_err(StoreError::from)?;
        debug!(
            connection_id = %connection.id,
            operation_id = %operation.operation_id,
            event = %name,
            "subscription created"
        );
        Ok(())
    }

    async fn unsubscribe(&self, subscriber: &Subscriber) -> Result<()> {
        self.unsubscribe_operation(&subscriber.connection.id, &subscriber.operation_id)
            .await
    }

    async fn unsubscribe_operation(&self, connection_id: &str, operation_id: &str) -> Result<()> {
        let conn = self.pool.get().map_err(StoreError::from)?;
        let _ = conn
            .execute(
                "DELETE FROM subscriptions WHERE connection_id = ?1 AND operation_id = ?2",
                params![connection_id, operation_id],
            )
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn unsubscribe_all_by_connection_id(&self, connection_id: &str) -> Result<usize> {
        let mut removed = 0usize;
        loop {
            let conn = self.pool.get().map_err(StoreError::from)?;
            let operation_ids: Vec<String> = {
                let mut stmt = conn
                    .prepare(
                        "SELECT operation_id FROM subscriptions \
                         WHERE connection_id = ?1 \
                         ORDER BY operation_id \
                         LIMIT ?2",
                    )
                    .map_err(StoreError::from)?;
                let rows = stmt
                    .query_map(params![connection_id, TEARDOWN_BATCH_SIZE as i64], |row| {
                        row.get(0)
                    })
                    .map_err(StoreError::from)?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row.map_err(StoreError::from)?);
                }
                ids
            };

            if operation_ids.is_empty() {
                break;
            }

            let tx = conn.unchecked_transaction().map_err(StoreError::from)?;
            for operation_id in &operation_ids {
                let _ = tx
                    .execute(
                        "DELETE FROM subscriptions \
                         WHERE connection_id = ?1 AND operation_id = ?2",
                        params![connection_id, operation_id],
                    )
                    .map_err(StoreError::from)?;
            }
            tx.commit().map_err(StoreError::from)?;
            removed += operation_ids.len();
        }
        debug!(connection_id, removed, "subscriptions torn down");
        Ok(removed)
    }

    async fn subscribers_by_event(&self, event: &SubscriptionEvent) -> Result<SubscriberStream> {
        let name = (self.name_from_event)(event);
        if name.is_empty() {
            return Err(SubcastError::InvalidOperation(
                "event name must be non-empty".into(),
            ));
        }
        let pool = self.pool.clone();
        let now = now_unix();
        let state = ScanState {
            buffer: VecDeque::new(),
            cursor: None,
            done: false,
        };

        let stream = stream::try_unfold(state, move |mut state| {
            let pool = pool.clone();
            let name = name.clone();
            async move {
                loop {
                    if let Some(subscriber) = state.buffer.pop_front() {
                        return Ok(Some((subscriber, state)));
                    }
                    if state.done {
                        return Ok(None);
                    }
                    let (items, next) = fetch_page(&pool, &name, now, state.cursor.take())?;
                    state.done = next.is_none();
                    state.cursor = next;
                    state.buffer.extend(items);
                    if state.buffer.is_empty() && state.done {
                        return Ok(None);
                    }
                }
            }
        })
        .boxed();
        Ok(stream)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
