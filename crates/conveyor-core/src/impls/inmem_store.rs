//! In-memory durable store (development and tests).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::FaultInjector;
use crate::domain::{DrainCheckpoint, DurableRecord, StreamName, TaskId};
use crate::ports::{DurableStore, StoreError};

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<TaskId, DurableRecord>,
    checkpoints: HashMap<StreamName, DrainCheckpoint>,
}

/// Durable store held in memory, with outage injection.
///
/// A batch upsert is applied under one lock, so it is all-or-nothing like
/// the single statement a relational store would run.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    state: Mutex<StoreState>,
    faults: FaultInjector,
    upsert_statements: AtomicUsize,
    checkpoint_commits: AtomicUsize,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Successful `upsert_records` calls.
    pub fn upsert_statements(&self) -> usize {
        self.upsert_statements.load(Ordering::SeqCst)
    }

    /// Successful `commit_checkpoint` calls.
    pub fn checkpoint_commits(&self) -> usize {
        self.checkpoint_commits.load(Ordering::SeqCst)
    }

    pub async fn records(&self) -> Vec<DurableRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<DurableRecord> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.task_id);
        records
    }

    fn trip(&self, op: &str) -> Result<(), StoreError> {
        self.faults.trip(op).map_err(StoreError::Unavailable)
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn upsert_records(&self, records: &[DurableRecord]) -> Result<(), StoreError> {
        self.trip("upsert_records")?;
        let mut state = self.state.lock().await;
        for record in records {
            let replace = state
                .records
                .get(&record.task_id)
                .is_none_or(|existing| record.supersedes(existing));
            if replace {
                state.records.insert(record.task_id, record.clone());
            }
        }
        self.upsert_statements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn checkpoint(&self, stream: &StreamName) -> Result<Option<DrainCheckpoint>, StoreError> {
        self.trip("checkpoint")?;
        let state = self.state.lock().await;
        Ok(state.checkpoints.get(stream).cloned())
    }

    async fn commit_checkpoint(&self, checkpoint: &DrainCheckpoint) -> Result<(), StoreError> {
        self.trip("commit_checkpoint")?;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.checkpoints.get(&checkpoint.stream)
            && existing.offset > checkpoint.offset
        {
            return Err(StoreError::CheckpointRegression {
                stream: checkpoint.stream.clone(),
                committed: existing.offset,
                attempted: checkpoint.offset,
            });
        }
        state
            .checkpoints
            .insert(checkpoint.stream.clone(), checkpoint.clone());
        self.checkpoint_commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn record(&self, task_id: TaskId) -> Result<Option<DurableRecord>, StoreError> {
        self.trip("record")?;
        let state = self.state.lock().await;
        Ok(state.records.get(&task_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FinalStatus, Offset, TaskKind};
    use chrono::Utc;
    use ulid::Ulid;

    fn record(task_id: TaskId, ack_offset: u64, status: FinalStatus) -> DurableRecord {
        DurableRecord {
            task_id,
            kind: TaskKind::new("webhook"),
            stream: StreamName::new("payments").unwrap(),
            final_status: status,
            result_payload: None,
            error: None,
            attempt_count: 0,
            completed_at: Utc::now(),
            ack_offset: Offset(ack_offset),
        }
    }

    fn checkpoint(offset: u64) -> DrainCheckpoint {
        DrainCheckpoint {
            stream: StreamName::new("payments").unwrap(),
            offset: Offset(offset),
            committed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn replaying_a_batch_yields_identical_rows() {
        let store = InMemoryDurableStore::new();
        let batch: Vec<DurableRecord> = (1..=3)
            .map(|i| record(TaskId::from_ulid(Ulid::new()), i, FinalStatus::Succeeded))
            .collect();

        store.upsert_records(&batch).await.unwrap();
        let first = store.records().await;
        store.upsert_records(&batch).await.unwrap();
        let second = store.records().await;

        assert_eq!(first, second);
        assert_eq!(second.len(), 3);
        assert_eq!(store.upsert_statements(), 2);
    }

    #[tokio::test]
    async fn older_ack_does_not_overwrite_newer_row() {
        let store = InMemoryDurableStore::new();
        let id = TaskId::from_ulid(Ulid::new());
        store
            .upsert_records(&[record(id, 9, FinalStatus::Succeeded)])
            .await
            .unwrap();
        store
            .upsert_records(&[record(id, 4, FinalStatus::DeadLettered)])
            .await
            .unwrap();

        let row = store.record(id).await.unwrap().unwrap();
        assert_eq!(row.final_status, FinalStatus::Succeeded);
        assert_eq!(row.ack_offset, Offset(9));
    }

    #[tokio::test]
    async fn checkpoint_never_decreases() {
        let store = InMemoryDurableStore::new();
        store.commit_checkpoint(&checkpoint(5)).await.unwrap();
        store.commit_checkpoint(&checkpoint(5)).await.unwrap();

        let err = store.commit_checkpoint(&checkpoint(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::CheckpointRegression { .. }));

        let stream = StreamName::new("payments").unwrap();
        let current = store.checkpoint(&stream).await.unwrap().unwrap();
        assert_eq!(current.offset, Offset(5));
    }

    #[tokio::test]
    async fn outage_fails_without_writing() {
        let store = InMemoryDurableStore::new();
        store.faults().fail_next(1);
        let rows = [record(TaskId::from_ulid(Ulid::new()), 1, FinalStatus::Succeeded)];

        assert!(store.upsert_records(&rows).await.is_err());
        assert!(store.records().await.is_empty());
        assert_eq!(store.upsert_statements(), 0);

        store.upsert_records(&rows).await.unwrap();
        assert_eq!(store.records().await.len(), 1);
    }
}
