//! Stream storage backends.
//!
//! A stream is an ordered work queue: appends assign a strictly increasing
//! sequence, acks remove, and retention trims by age and count. The memory
//! store backs `ws_message`; everything else sits on sqlx.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use sqlx::{AnyPool, Row};

use crate::error::BusError;
use crate::event::{Event, EventKind};

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub seq: u64,
    pub subject: String,
    pub event: Event,
    pub delivery_count: u32,
    pub appended_at_s: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub messages: u64,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
}

#[async_trait::async_trait]
pub trait StreamStore: Send + Sync {
    /// Append and assign the next sequence number.
    async fn append(&self, subject: &str, event: &Event, now_s: u64) -> Result<u64, BusError>;

    /// Oldest pending messages, excluding `skip` (in-flight sequences),
    /// at most `limit`.
    async fn next_available(
        &self,
        skip: &[u64],
        limit: usize,
    ) -> Result<Vec<StoredEvent>, BusError>;

    /// Work-queue ack: the message is gone. Returns whether it existed.
    async fn remove(&self, seq: u64) -> Result<bool, BusError>;

    async fn set_delivery_count(&self, seq: u64, count: u32) -> Result<(), BusError>;

    /// Trim by age then by count; returns how many messages were dropped.
    async fn enforce_retention(
        &self,
        now_s: u64,
        max_age_s: u64,
        max_msgs: u64,
    ) -> Result<u64, BusError>;

    async fn stats(&self) -> Result<StreamStats, BusError>;
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    next_seq: u64,
    messages: BTreeMap<u64, StoredEvent>,
}

/// In-process stream store.
#[derive(Default)]
pub struct MemoryStreamStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(&self, subject: &str, event: &Event, now_s: u64) -> Result<u64, BusError> {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.messages.insert(
            seq,
            StoredEvent {
                seq,
                subject: subject.to_string(),
                event: event.clone(),
                delivery_count: 0,
                appended_at_s: now_s,
            },
        );
        Ok(seq)
    }

    async fn next_available(
        &self,
        skip: &[u64],
        limit: usize,
    ) -> Result<Vec<StoredEvent>, BusError> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .values()
            .filter(|m| !skip.contains(&m.seq))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, seq: u64) -> Result<bool, BusError> {
        Ok(self.inner.lock().messages.remove(&seq).is_some())
    }

    async fn set_delivery_count(&self, seq: u64, count: u32) -> Result<(), BusError> {
        if let Some(m) = self.inner.lock().messages.get_mut(&seq) {
            m.delivery_count = count;
        }
        Ok(())
    }

    async fn enforce_retention(
        &self,
        now_s: u64,
        max_age_s: u64,
        max_msgs: u64,
    ) -> Result<u64, BusError> {
        let mut inner = self.inner.lock();
        let before = inner.messages.len() as u64;

        let cutoff = now_s.saturating_sub(max_age_s);
        inner.messages.retain(|_, m| m.appended_at_s >= cutoff);

        while inner.messages.len() as u64 > max_msgs {
            let Some(oldest) = inner.messages.keys().next().copied() else {
                break;
            };
            inner.messages.remove(&oldest);
        }

        Ok(before - inner.messages.len() as u64)
    }

    async fn stats(&self) -> Result<StreamStats, BusError> {
        let inner = self.inner.lock();
        Ok(StreamStats {
            messages: inner.messages.len() as u64,
            first_seq: inner.messages.keys().next().copied(),
            last_seq: inner.messages.keys().next_back().copied(),
        })
    }
}

// ---------------------------------------------------------------------------
// Sqlite (file storage)
// ---------------------------------------------------------------------------

/// sqlx-backed stream store, one table per stream.
///
/// Sequence assignment happens inside the INSERT so the store needs no
/// in-process counter; appends come from the single flusher task anyway.
pub struct SqliteStreamStore {
    pool: AnyPool,
    table: String,
}

impl SqliteStreamStore {
    pub fn table_name(kind: EventKind, dlq: bool) -> String {
        if dlq {
            format!("dlq_{}", kind.as_str())
        } else {
            format!("stream_{}", kind.as_str())
        }
    }

    pub async fn new(pool: AnyPool, kind: EventKind, dlq: bool) -> Result<Self, BusError> {
        let table = Self::table_name(kind, dlq);
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                seq INTEGER PRIMARY KEY,
                subject TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                appended_at INTEGER NOT NULL
            );
            "#
        ))
        .execute(&pool)
        .await?;

        Ok(Self { pool, table })
    }

    fn row_to_stored(&self, row: &sqlx::any::AnyRow) -> Result<StoredEvent, BusError> {
        let payload: String = row.get("payload");
        let event: Event = serde_json::from_str(&payload)?;
        Ok(StoredEvent {
            seq: row.get::<i64, _>("seq") as u64,
            subject: row.get("subject"),
            event,
            delivery_count: row.get::<i64, _>("delivery_count") as u32,
            appended_at_s: row.get::<i64, _>("appended_at") as u64,
        })
    }
}

#[async_trait::async_trait]
impl StreamStore for SqliteStreamStore {
    async fn append(&self, subject: &str, event: &Event, now_s: u64) -> Result<u64, BusError> {
        let payload = serde_json::to_string(event)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {t} (seq, subject, tenant_id, payload, delivery_count, appended_at)
            VALUES ((SELECT COALESCE(MAX(seq), 0) + 1 FROM {t}), $1, $2, $3, 0, $4)
            RETURNING seq
            "#,
            t = self.table
        ))
        .bind(subject)
        .bind(event.tenant_id.to_string())
        .bind(payload)
        .bind(now_s as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("seq") as u64)
    }

    async fn next_available(
        &self,
        skip: &[u64],
        limit: usize,
    ) -> Result<Vec<StoredEvent>, BusError> {
        // The in-flight set is tiny (serial delivery), so over-fetch and
        // filter in code instead of building a dynamic NOT IN clause.
        let fetch = limit + skip.len();
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} ORDER BY seq ASC LIMIT $1",
            self.table
        ))
        .bind(fetch as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in &rows {
            let stored = self.row_to_stored(row)?;
            if !skip.contains(&stored.seq) {
                out.push(stored);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn remove(&self, seq: u64) -> Result<bool, BusError> {
        let res = sqlx::query(&format!("DELETE FROM {} WHERE seq = $1", self.table))
            .bind(seq as i64)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_delivery_count(&self, seq: u64, count: u32) -> Result<(), BusError> {
        sqlx::query(&format!(
            "UPDATE {} SET delivery_count = $1 WHERE seq = $2",
            self.table
        ))
        .bind(count as i64)
        .bind(seq as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enforce_retention(
        &self,
        now_s: u64,
        max_age_s: u64,
        max_msgs: u64,
    ) -> Result<u64, BusError> {
        let mut dropped = 0u64;

        let cutoff = now_s.saturating_sub(max_age_s) as i64;
        let res = sqlx::query(&format!(
            "DELETE FROM {} WHERE appended_at < $1",
            self.table
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        dropped += res.rows_affected();

        let res = sqlx::query(&format!(
            r#"
            DELETE FROM {t} WHERE seq IN (
                SELECT seq FROM {t} ORDER BY seq ASC
                LIMIT MAX((SELECT COUNT(*) FROM {t}) - $1, 0)
            )
            "#,
            t = self.table
        ))
        .bind(max_msgs as i64)
        .execute(&self.pool)
        .await?;
        dropped += res.rows_affected();

        Ok(dropped)
    }

    async fn stats(&self) -> Result<StreamStats, BusError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n, MIN(seq) AS first_seq, MAX(seq) AS last_seq FROM {}",
            self.table
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(StreamStats {
            messages: row.get::<i64, _>("n") as u64,
            first_seq: row.get::<Option<i64>, _>("first_seq").map(|v| v as u64),
            last_seq: row.get::<Option<i64>, _>("last_seq").map(|v| v as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::models::RequestPriority;
    use uuid::Uuid;

    fn event() -> Event {
        Event::new(
            EventKind::UsageMetered,
            Uuid::new_v4(),
            RequestPriority::Normal,
            serde_json::json!({"quantity": 1}),
            None,
            1_700_000_000,
        )
    }

    #[tokio::test]
    async fn memory_append_assigns_monotonic_seqs() {
        let store = MemoryStreamStore::new();
        let a = store.append("events.usage_metered", &event(), 10).await.unwrap();
        let b = store.append("events.usage_metered", &event(), 11).await.unwrap();
        assert!(b > a);

        let pending = store.next_available(&[], 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].seq, a);
    }

    #[tokio::test]
    async fn memory_remove_is_work_queue_ack() {
        let store = MemoryStreamStore::new();
        let seq = store.append("s", &event(), 10).await.unwrap();
        assert!(store.remove(seq).await.unwrap());
        assert!(!store.remove(seq).await.unwrap());
        assert!(store.next_available(&[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_retention_trims_by_age_and_count() {
        let store = MemoryStreamStore::new();
        for i in 0..5 {
            store.append("s", &event(), 100 + i).await.unwrap();
        }

        // Age: cutoff at 102 drops the first two.
        let dropped = store.enforce_retention(202, 100, 100).await.unwrap();
        assert_eq!(dropped, 2);

        // Count: cap at 1 keeps only the newest.
        let dropped = store.enforce_retention(202, 1_000, 1).await.unwrap();
        assert_eq!(dropped, 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.first_seq, stats.last_seq);
    }

    #[tokio::test]
    async fn memory_skip_excludes_inflight() {
        let store = MemoryStreamStore::new();
        let a = store.append("s", &event(), 10).await.unwrap();
        let b = store.append("s", &event(), 10).await.unwrap();

        let pending = store.next_available(&[a], 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, b);
    }
}
