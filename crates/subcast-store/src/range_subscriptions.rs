//! Dual-table subscription layout.
//!
//! A forward table keyed (event, subscription id) serves fan-out; an inverse
//! table keyed (subscription id, event) serves per-connection teardown, with
//! `subscription id = "{connection id}:{operation id}"`. The two puts at
//! subscribe time need not be atomic with each other, but every delete
//! touches both tables inside one transaction so a reader never observes a
//! dangling half of a subscription.

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
use crate::subscriptions::{DEFAULT_SUBSCRIPTION_TTL, NameFromEvent};

/// Page size for fan-out scans.
const FANOUT_PAGE_SIZE: usize = 50;

/// Batch ceiling for teardown deletes.
const TEARDOWN_BATCH_SIZE: usize = 25;

/// `SQLite`-backed [`SubscriptionManager`] using the dual-table layout.
pub struct SqlRangeSubscriptionManager {
    pool: ConnectionPool,
    ttl_seconds: Option<i64>,
    name_from_event: NameFromEvent,
}

impl SqlRangeSubscriptionManager {
    /// Create a manager with default TTL and identity name resolution.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            ttl_seconds: Some(DEFAULT_SUBSCRIPTION_TTL),
            name_from_event: Arc::new(|event| event.event.clone()),
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

    fn subscription_id(connection_id: &str, operation_id: &str) -> String {
        format!("{connection_id}:{operation_id}")
    }

    /// LIKE pattern matching every subscription id of one connection.
    fn teardown_pattern(connection_id: &str) -> String {
        let escaped = connection_id
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        format!("{escaped}:%")
    }

    /// Delete one (event, subscription id) pair from both tables atomically.
    fn delete_pairs(
        conn: &rusqlite::Connection,
        pairs: &[(String, String)],
    ) -> std::result::Result<(), StoreError> {
        let tx = conn.unchecked_transaction()?;
        for (event, subscription_id) in pairs {
            let _ = tx.execute(
                "DELETE FROM subscriptions_by_event \
                 WHERE event = ?1 AND subscription_id = ?2",
                params![event, subscription_id],
            )?;
            let _ = tx.execute(
                "DELETE FROM subscription_operations \
                 WHERE subscription_id = ?1 AND event = ?2",
                params![subscription_id, event],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// One page of subscribers plus the continuation key, if more may remain.
type Page = (Vec<Subscriber>, Option<String>);

fn fetch_page(
    pool: &ConnectionPool,
    event_name: &str,
    now: i64,
    cursor: Option<String>,
) -> std::result::Result<Page, StoreError> {
    let conn = pool.get()?;
    let mut rows: Vec<(String, String, String, String)> = Vec::new();

    let map_row = |row: &rusqlite::Row<'_>| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    };

    if let Some(last_subscription) = cursor {
        let mut stmt = conn.prepare(
            "SELECT subscription_id, connection, operation, operation_id \
             FROM subscriptions_by_event \
             WHERE event = ?1 AND (ttl IS NULL OR ttl > ?2) AND subscription_id > ?3 \
             ORDER BY subscription_id \
             LIMIT ?4",
        )?;
        let mapped = stmt.query_map(
            params![event_name, now, last_subscription, FANOUT_PAGE_SIZE as i64],
            map_row,
        )?;
        for row in mapped {
            rows.push(row?);
        }
    } else {
        let mut stmt = conn.prepare(
            "SELECT subscription_id, connection, operation, operation_id \
             FROM subscriptions_by_event \
             WHERE event = ?1 AND (ttl IS NULL OR ttl > ?2) \
             ORDER BY subscription_id \
             LIMIT ?3",
        )?;
        let mapped = stmt.query_map(params![event_name, now, FANOUT_PAGE_SIZE as i64], map_row)?;
        for row in mapped {
            rows.push(row?);
        }
    }

    let next = (rows.len() == FANOUT_PAGE_SIZE)
        .then(|| rows.last().map(|r| r.0.clone()))
        .flatten();

    let mut subscribers = Vec::with_capacity(rows.len());
    for (_, connection, operation, operation_id) in rows {
        subscribers.push(Subscriber {
            connection: serde_json::from_str(&connection)?,
            operation_id,
            operation: serde_json::from_str(&operation)?,
            event: event_name.to_owned(),
        });
    }
    Ok((subscribers, next))
}

#[async_trait]
impl SubscriptionManager for SqlRangeSubscriptionManager {
    async fn subscribe(
        &self,
        event_names: &[String],
        connection: &Connection,
        operation: &IdentifiedOperationRequest,
    ) -> Result<()> {
        let [name] = event_names else {
            return Err(SubcastError::InvalidOperation(format!(
                "exactly one event name per subscription, got {}",
                event_names.len()
            )));
        };
        let subscription_id = Self::subscription_id(&connection.id, &operation.operation_id);
        let ttl = compute_ttl(self.ttl_seconds);

        // Two coordinated puts; cleanup is what must be atomic, not this.
        let conn = self.pool.get().map_err(StoreError::from)?;
        let _ = conn
            .execute(
                "INSERT OR REPLACE INTO subscriptions_by_event \
                 (event, subscription_id, connection, operation, operation_id, ttl) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    name,
                    subscription_id,
                    serde_json::to_string(connection)?,
                    serde_json::to_string(&operation.request)?,
                    operation.operation_id,
                    ttl,
                ],
            )
            .map_err(StoreError::from)?;
        let _ = conn
            .execute(
                "INSERT OR REPLACE INTO subscription_operations \
                 (subscription_id, event, ttl) VALUES (?1, ?2, ?3)",
                params![subscription_id, name, ttl],
            )
            .map_err(StoreError::from)?;
        debug!(%subscription_id, event = %name, "subscription created");
        Ok(())
    }

    async fn unsubscribe(&self, subscriber: &Subscriber) -> Result<()> {
        let subscription_id =
            Self::subscription_id(&subscriber.connection.id, &subscriber.operation_id);
        let conn = self.pool.get().map_err(StoreError::from)?;
        Self::delete_pairs(&conn, &[(subscriber.event.clone(), subscription_id)])?;
        Ok(())
    }

    async fn unsubscribe_operation(&self, connection_id: &str, operation_id: &str) -> Result<()> {
        let subscription_id = Self::subscription_id(connection_id, operation_id);
        let conn = self.pool.get().map_err(StoreError::from)?;
        let events: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT event FROM subscription_operations WHERE subscription_id = ?1")
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map(params![subscription_id], |row| row.get(0))
                .map_err(StoreError::from)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row.map_err(StoreError::from)?);
            }
            events
        };
        if events.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(String, String)> = events
            .into_iter()
            .map(|event| (event, subscription_id.clone()))
            .collect();
        Self::delete_pairs(&conn, &pairs)?;
        Ok(())
    }

    async fn unsubscribe_all_by_connection_id(&self, connection_id: &str) -> Result<usize> {
        let pattern = Self::teardown_pattern(connection_id);
        let mut removed = 0usize;
        loop {
            let conn = self.pool.get().map_err(StoreError::from)?;
            let pairs: Vec<(String, String)> = {
                let mut stmt = conn
                    .prepare(
                        "SELECT event, subscription_id FROM subscriptions_by_event \
                         WHERE subscription_id LIKE ?1 ESCAPE '\\' \
                         ORDER BY event, subscription_id \
                         LIMIT ?2",
                    )
                    .map_err(StoreError::from)?;
                let rows = stmt
                    .query_map(params![pattern, TEARDOWN_BATCH_SIZE as i64], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(StoreError::from)?;
                let mut pairs = Vec::new();
                for row in rows {
                    pairs.push(row.map_err(StoreError::from)?);
                }
                pairs
            };

            if pairs.is_empty() {
                break;
            }
            Self::delete_pairs(&conn, &pairs)?;
            removed += pairs.len();
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

        struct ScanState {
            buffer: VecDeque<Subscriber>,
            cursor: Option<String>,
            done: bool,
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use subcast_core::types::{ConnectionData, OperationRequest};

    use crate::migrations::run_migrations;
    use crate::pool::{ConnectionConfig, new_in_memory};

    fn setup() -> SqlRangeSubscriptionManager {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();
        SqlRangeSubscriptionManager::new(pool)
    }

    fn connection(id: &str) -> Connection {
        Connection {
            id: id.into(),
            data: ConnectionData::new("ep"),
        }
    }

    fn operation(id: &str) -> IdentifiedOperationRequest {
        IdentifiedOperationRequest {
            operation_id: id.into(),
            request: OperationRequest {
                query: "subscription { test }".into(),
                ..Default::default()
            },
        }
    }

    fn event(name: &str) -> SubscriptionEvent {
        SubscriptionEvent {
            event: name.into(),
            payload: json!({}),
            id: None,
            ttl: None,
        }
    }

    async fn collect(manager: &SqlRangeSubscriptionManager, name: &str) -> Vec<Subscriber> {
        manager
            .subscribers_by_event(&event(name))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap()
    }

    fn table_count(manager: &SqlRangeSubscriptionManager, table: &str) -> i64 {
        manager
            .pool
            .get()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn subscribe_writes_both_tables() {
        let manager = setup();
        manager
            .subscribe(&["orders".into()], &connection("c1"), &operation("op1"))
            .await
            .unwrap();
        assert_eq!(table_count(&manager, "subscriptions_by_event"), 1);
        assert_eq!(table_count(&manager, "subscription_operations"), 1);
    }

    #[tokio::test]
    async fn subscribe_requires_exactly_one_name() {
        let manager = setup();
        let err = manager
            .subscribe(
                &["a".into(), "b".into()],
                &connection("c1"),
                &operation("op1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubcastError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn unsubscribe_clears_both_tables() {
        let manager = setup();
        manager
            .subscribe(&["orders".into()], &connection("c1"), &operation("op1"))
            .await
            .unwrap();
        let subscribers = collect(&manager, "orders").await;
        manager.unsubscribe(&subscribers[0]).await.unwrap();
        assert_eq!(table_count(&manager, "subscriptions_by_event"), 0);
        assert_eq!(table_count(&manager, "subscription_operations"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_operation_resolves_event_via_inverse_table() {
        let manager = setup();
        manager
            .subscribe(&["orders".into()], &connection("c1"), &operation("op1"))
            .await
            .unwrap();
        manager.unsubscribe_operation("c1", "op1").await.unwrap();
        assert_eq!(table_count(&manager, "subscriptions_by_event"), 0);
        assert_eq!(table_count(&manager, "subscription_operations"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_missing_operation_is_a_noop() {
        let manager = setup();
        manager.unsubscribe_operation("c1", "op1").await.unwrap();
    }

    #[tokio::test]
    async fn teardown_matches_connection_prefix_only() {
        let manager = setup();
        // "c1" must not sweep up "c10".
        manager
            .subscribe(&["orders".into()], &connection("c1"), &operation("op1"))
            .await
            .unwrap();
        manager
            .subscribe(&["orders".into()], &connection("c10"), &operation("op1"))
            .await
            .unwrap();

        let removed = manager.unsubscribe_all_by_connection_id("c1").await.unwrap();
        assert_eq!(removed, 1);

        let remaining = collect(&manager, "orders").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].connection.id, "c10");
        assert_eq!(table_count(&manager, "subscription_operations"), 1);
    }

    #[tokio::test]
    async fn teardown_pages_past_batch_ceiling() {
        let manager = setup();
        let conn = connection("c1");
        let total = TEARDOWN_BATCH_SIZE * 2 + 5;
        for i in 0..total {
            manager
                .subscribe(&["orders".into()], &conn, &operation(&format!("op{i:03}")))
                .await
                .unwrap();
        }
        let removed = manager.unsubscribe_all_by_connection_id("c1").await.unwrap();
        assert_eq!(removed, total);
        assert_eq!(table_count(&manager, "subscriptions_by_event"), 0);
        assert_eq!(table_count(&manager, "subscription_operations"), 0);
    }

    #[tokio::test]
    async fn pagination_yields_every_subscriber_exactly_once() {
        let manager = setup();
        let total = FANOUT_PAGE_SIZE + 30;
        for i in 0..total {
            manager
                .subscribe(
                    &["orders".into()],
                    &connection(&format!("c{i:04}")),
                    &operation("op1"),
                )
                .await
                .unwrap();
        }
        let subscribers = collect(&manager, "orders").await;
        assert_eq!(subscribers.len(), total);

        let mut ids: Vec<String> = subscribers
            .iter()
            .map(|s| s.connection.id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[tokio::test]
    async fn expired_rows_are_skipped() {
        let manager = setup();
        manager
            .subscribe(&["orders".into()], &connection("live"), &operation("op1"))
            .await
            .unwrap();
        manager
            .subscribe(&["orders".into()], &connection("stale"), &operation("op1"))
            .await
            .unwrap();
        let _ = manager
            .pool
            .get()
            .unwrap()
            .execute(
                "UPDATE subscriptions_by_event SET ttl = 1 WHERE subscription_id LIKE 'stale:%'",
                [],
            )
            .unwrap();

        let subscribers = collect(&manager, "orders").await;
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].connection.id, "live");
    }
}
