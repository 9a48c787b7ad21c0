//! Append-only published-event log.
//!
//! [`SqlEventStore`] is the producer side of the durable-log event channel:
//! `publish` appends one row, and the change stream surfaces each appended
//! row to the stream processor as an insert record. Rows expire on their own
//! TTL; the processor discards expired images without delivering them.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use tracing::debug;
use uuid::Uuid;

use subcast_core::errors::Result;
use subcast_core::traits::EventPublisher;
use subcast_core::ttl::compute_ttl;
use subcast_core::types::{ChangeKind, ChangeRecord, SubscriptionEvent};

use crate::error::StoreError;
use crate::pool::ConnectionPool;

/// Default published-event TTL in seconds (2 hours). Without a TTL the log
/// grows until something else deletes rows.
pub const DEFAULT_EVENT_TTL: i64 = 7200;

/// `SQLite`-backed [`EventPublisher`] and change-record source.
pub struct SqlEventStore {
    pool: ConnectionPool,
    ttl_seconds: Option<i64>,
}

impl SqlEventStore {
    /// Create an event store with the default TTL.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            ttl_seconds: Some(DEFAULT_EVENT_TTL),
        }
    }

    /// Override the event TTL; `None` disables expiry.
    #[must_use]
    pub fn with_ttl(mut self, ttl_seconds: Option<i64>) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Drain pending change records, oldest first.
    ///
    /// Each appended row surfaces exactly once per drain as an insert-kind
    /// record whose image is the stored row. Redelivery on failure is the
    /// channel's concern; callers that crash mid-batch simply re-publish.
    pub fn drain_change_records(&self) -> Result<Vec<ChangeRecord>> {
        let conn = self.pool.get().map_err(StoreError::from)?;
        let tx = conn.unchecked_transaction().map_err(StoreError::from)?;

        let rows: Vec<(String, String, String, Option<i64>)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, event, payload, ttl FROM subscription_events ORDER BY rowid",
                )
                .map_err(StoreError::from)?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(StoreError::from)?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row.map_err(StoreError::from)?);
            }
            rows
        };

        let _ = tx
            .execute("DELETE FROM subscription_events", [])
            .map_err(StoreError::from)?;
        tx.commit().map_err(StoreError::from)?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, event, payload, ttl) in rows {
            let image = SubscriptionEvent {
                event,
                payload: serde_json::from_str(&payload)?,
                id: Some(id),
                ttl,
            };
            records.push(ChangeRecord {
                kind: ChangeKind::Insert,
                image: Some(serde_json::to_value(&image)?),
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl EventPublisher for SqlEventStore {
    async fn publish(&self, event: SubscriptionEvent) -> Result<()> {
        let id = event
            .id
            .unwrap_or_else(|| format!("evt_{}", Uuid::now_v7()));
        // An explicit event TTL wins over the store default.
        let ttl = event.ttl.or_else(|| compute_ttl(self.ttl_seconds));

        let conn = self.pool.get().map_err(StoreError::from)?;
        let _ = conn
            .execute(
                "INSERT INTO subscription_events (id, event, payload, ttl, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    event.event,
                    event.payload.to_string(),
                    ttl,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(StoreError::from)?;
        debug!(event = %event.event, %id, "event published");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
