//! Postgres-backed durable store.
//!
//! Expects these tables (created by migrations outside this crate):
//!
//! ```sql
//! CREATE TABLE durable_records (
//!     task_id        TEXT PRIMARY KEY,
//!     kind           TEXT NOT NULL,
//!     stream         TEXT NOT NULL,
//!     final_status   TEXT NOT NULL,
//!     result_payload JSONB,
//!     error          TEXT,
//!     attempt_count  BIGINT NOT NULL,
//!     completed_at   TIMESTAMPTZ NOT NULL,
//!     ack_offset     BIGINT NOT NULL
//! );
//!
//! CREATE TABLE drain_checkpoints (
//!     stream       TEXT PRIMARY KEY,
//!     last_offset  BIGINT NOT NULL,
//!     committed_at TIMESTAMPTZ NOT NULL
//! );
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::domain::{DrainCheckpoint, DurableRecord, FinalStatus, Offset, StreamName, TaskId};
use crate::ports::{DurableStore, StoreError};

pub struct PostgresDurableStore {
    pool: PgPool,
}

impl PostgresDurableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(unavailable)?;
        Ok(Self::new(pool))
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn decode(err: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(err.to_string())
}

fn to_i64(offset: Offset) -> i64 {
    i64::try_from(offset.value()).unwrap_or(i64::MAX)
}

/// One row per task_id, the one that supersedes the others.
///
/// `ON CONFLICT DO UPDATE` cannot touch the same row twice in one statement.
fn latest_per_task(records: &[DurableRecord]) -> Vec<&DurableRecord> {
    let mut latest: HashMap<TaskId, &DurableRecord> = HashMap::new();
    for record in records {
        match latest.get(&record.task_id) {
            Some(existing) if !record.supersedes(existing) => {}
            _ => {
                latest.insert(record.task_id, record);
            }
        }
    }
    let mut rows: Vec<&DurableRecord> = latest.into_values().collect();
    rows.sort_by_key(|r| r.task_id);
    rows
}

fn record_from_row(row: &PgRow) -> Result<DurableRecord, StoreError> {
    let task_id: String = row.try_get("task_id").map_err(decode)?;
    let kind: String = row.try_get("kind").map_err(decode)?;
    let stream: String = row.try_get("stream").map_err(decode)?;
    let final_status: String = row.try_get("final_status").map_err(decode)?;
    let attempt_count: i64 = row.try_get("attempt_count").map_err(decode)?;
    let ack_offset: i64 = row.try_get("ack_offset").map_err(decode)?;

    Ok(DurableRecord {
        task_id: task_id.parse().map_err(decode)?,
        kind: kind.into(),
        stream: StreamName::new(stream).map_err(decode)?,
        final_status: final_status.parse::<FinalStatus>().map_err(decode)?,
        result_payload: row.try_get("result_payload").map_err(decode)?,
        error: row.try_get("error").map_err(decode)?,
        attempt_count: u32::try_from(attempt_count).map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        ack_offset: Offset(u64::try_from(ack_offset).map_err(decode)?),
    })
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    async fn upsert_records(&self, records: &[DurableRecord]) -> Result<(), StoreError> {
        let rows = latest_per_task(records);
        if rows.is_empty() {
            return Ok(());
        }

        let task_ids: Vec<String> = rows.iter().map(|r| r.task_id.as_ulid().to_string()).collect();
        let kinds: Vec<String> = rows.iter().map(|r| r.kind.to_string()).collect();
        let streams: Vec<String> = rows.iter().map(|r| r.stream.to_string()).collect();
        let statuses: Vec<String> = rows.iter().map(|r| r.final_status.to_string()).collect();
        let payloads: Vec<Option<serde_json::Value>> =
            rows.iter().map(|r| r.result_payload.clone()).collect();
        let errors: Vec<Option<String>> = rows.iter().map(|r| r.error.clone()).collect();
        let attempts: Vec<i64> = rows.iter().map(|r| i64::from(r.attempt_count)).collect();
        let completed: Vec<DateTime<Utc>> = rows.iter().map(|r| r.completed_at).collect();
        let offsets: Vec<i64> = rows.iter().map(|r| to_i64(r.ack_offset)).collect();

        sqlx::query(
            r#"
            INSERT INTO durable_records (
                task_id, kind, stream, final_status, result_payload,
                error, attempt_count, completed_at, ack_offset
            )
            SELECT * FROM UNNEST(
                $1::text[], $2::text[], $3::text[], $4::text[], $5::jsonb[],
                $6::text[], $7::int8[], $8::timestamptz[], $9::int8[]
            )
            ON CONFLICT (task_id) DO UPDATE SET
                kind = EXCLUDED.kind,
                stream = EXCLUDED.stream,
                final_status = EXCLUDED.final_status,
                result_payload = EXCLUDED.result_payload,
                error = EXCLUDED.error,
                attempt_count = EXCLUDED.attempt_count,
                completed_at = EXCLUDED.completed_at,
                ack_offset = EXCLUDED.ack_offset
            WHERE durable_records.stream <> EXCLUDED.stream
               OR durable_records.ack_offset <= EXCLUDED.ack_offset
            "#,
        )
        .bind(task_ids)
        .bind(kinds)
        .bind(streams)
        .bind(statuses)
        .bind(payloads)
        .bind(errors)
        .bind(attempts)
        .bind(completed)
        .bind(offsets)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn checkpoint(&self, stream: &StreamName) -> Result<Option<DrainCheckpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT last_offset, committed_at
            FROM drain_checkpoints
            WHERE stream = $1
            "#,
        )
        .bind(stream.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let last_offset: i64 = row.try_get("last_offset").map_err(decode)?;
        Ok(Some(DrainCheckpoint {
            stream: stream.clone(),
            offset: Offset(u64::try_from(last_offset).map_err(decode)?),
            committed_at: row.try_get("committed_at").map_err(decode)?,
        }))
    }

    async fn commit_checkpoint(&self, checkpoint: &DrainCheckpoint) -> Result<(), StoreError> {
        let advanced = sqlx::query(
            r#"
            INSERT INTO drain_checkpoints (stream, last_offset, committed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (stream) DO UPDATE SET
                last_offset = EXCLUDED.last_offset,
                committed_at = EXCLUDED.committed_at
            WHERE drain_checkpoints.last_offset <= EXCLUDED.last_offset
            RETURNING last_offset
            "#,
        )
        .bind(checkpoint.stream.as_str())
        .bind(to_i64(checkpoint.offset))
        .bind(checkpoint.committed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        if advanced.is_some() {
            return Ok(());
        }
        let committed = self
            .checkpoint(&checkpoint.stream)
            .await?
            .map(|cp| cp.offset)
            .unwrap_or(checkpoint.offset);
        Err(StoreError::CheckpointRegression {
            stream: checkpoint.stream.clone(),
            committed,
            attempted: checkpoint.offset,
        })
    }

    async fn record(&self, task_id: TaskId) -> Result<Option<DurableRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT task_id, kind, stream, final_status, result_payload,
                   error, attempt_count, completed_at, ack_offset
            FROM durable_records
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.as_ulid().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.as_ref().map(record_from_row).transpose()
    }
}
