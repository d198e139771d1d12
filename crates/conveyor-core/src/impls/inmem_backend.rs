//! In-memory queue backend (development and tests).
//!
//! Keeps every entry it ever saw, so counts cover settled entries too.
//! All time decisions go through the injected Clock.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::FaultInjector;
use crate::domain::{
    AckEntry, AckRecord, ClaimLease, Claimed, ConsumerId, DeadLetter, LeaseToken, Offset,
    QueueEntry, StreamLease, StreamName, Task, TaskId, TaskStatus,
};
use crate::observability::QueueCounts;
use crate::ports::clock::span;
use crate::ports::{
    ClaimRequest, Clock, IdGenerator, QueueBackend, QueueError, SystemClock, UlidGenerator,
};

/// Default payload limit, in bytes.
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
struct EntrySlot {
    entry: QueueEntry,
    status: TaskStatus,
    lease: Option<ClaimLease>,
}

impl EntrySlot {
    /// Status as seen at `now`: an expired claim reads as Pending again.
    fn status_at(&self, now: DateTime<Utc>) -> TaskStatus {
        match (&self.lease, self.status) {
            (Some(lease), TaskStatus::Claimed) if lease.is_expired(now) => TaskStatus::Pending,
            (_, status) => status,
        }
    }

    fn claimable_by(&self, group: &str, now: DateTime<Utc>) -> bool {
        self.entry.consumer_group == group
            && self.entry.task.scheduled_at() <= now
            && self.lease.as_ref().is_none_or(|lease| lease.is_expired(now))
    }

    /// When this entry could next be claimed, if it cannot be right now.
    fn eligible_at(&self) -> DateTime<Utc> {
        match &self.lease {
            Some(lease) => lease.expires_at.max(self.entry.task.scheduled_at()),
            None => self.entry.task.scheduled_at(),
        }
    }
}

#[derive(Debug)]
struct StreamState {
    entries: BTreeMap<Offset, EntrySlot>,
    /// Unsettled offsets (Pending or Claimed).
    unsettled: BTreeSet<Offset>,
    /// task_id -> its unsettled offset.
    live: HashMap<TaskId, Offset>,
    /// task_id -> its most recent offset.
    latest: HashMap<TaskId, Offset>,
    next_offset: Offset,
    acks: VecDeque<AckEntry>,
    next_ack_offset: Offset,
    dead_letters: Vec<DeadLetter>,
    drain_lease: Option<StreamLease>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            unsettled: BTreeSet::new(),
            live: HashMap::new(),
            latest: HashMap::new(),
            next_offset: Offset::FIRST,
            acks: VecDeque::new(),
            next_ack_offset: Offset::FIRST,
            dead_letters: Vec::new(),
            drain_lease: None,
        }
    }

    fn push_entry(
        &mut self,
        stream: &StreamName,
        group: &str,
        task: Task,
        now: DateTime<Utc>,
    ) -> Offset {
        if let Some(existing) = self.live.get(&task.task_id()) {
            return *existing;
        }
        let offset = self.next_offset;
        self.next_offset = offset.next();
        self.live.insert(task.task_id(), offset);
        self.latest.insert(task.task_id(), offset);
        self.unsettled.insert(offset);
        self.entries.insert(
            offset,
            EntrySlot {
                entry: QueueEntry {
                    stream: stream.clone(),
                    offset,
                    consumer_group: group.to_string(),
                    enqueued_at: now,
                    task,
                },
                status: TaskStatus::Pending,
                lease: None,
            },
        );
        offset
    }

    fn push_ack(&mut self, record: AckRecord) -> Offset {
        let offset = self.next_ack_offset;
        self.next_ack_offset = offset.next();
        self.acks.push_back(AckEntry { offset, record });
        offset
    }

    /// The slot under `lease`, if the lease is still the live one.
    fn held_slot(
        &mut self,
        lease: &ClaimLease,
        now: DateTime<Utc>,
    ) -> Result<&mut EntrySlot, QueueError> {
        let lost = || QueueError::LeaseLost {
            token: lease.token,
            stream: lease.stream.clone(),
            offset: lease.offset,
        };
        let slot = self.entries.get_mut(&lease.offset).ok_or_else(lost)?;
        let held = slot.status == TaskStatus::Claimed
            && slot
                .lease
                .as_ref()
                .is_some_and(|current| current.token == lease.token && !current.is_expired(now));
        if held { Ok(slot) } else { Err(lost()) }
    }

    fn settle(&mut self, offset: Offset, status: TaskStatus) {
        let Some(slot) = self.entries.get_mut(&offset) else {
            return;
        };
        debug_assert!(slot.status.can_transition_to(status));
        slot.status = status;
        slot.lease = None;
        let task_id = slot.entry.task.task_id();
        self.unsettled.remove(&offset);
        if self.live.get(&task_id) == Some(&offset) {
            self.live.remove(&task_id);
        }
    }

    fn first_claimable(&self, group: &str, now: DateTime<Utc>) -> Option<Offset> {
        self.unsettled.iter().copied().find(|offset| {
            self.entries
                .get(offset)
                .is_some_and(|slot| slot.claimable_by(group, now))
        })
    }

    fn next_eligible_at(&self, group: &str) -> Option<DateTime<Utc>> {
        self.unsettled
            .iter()
            .filter_map(|offset| self.entries.get(offset))
            .filter(|slot| slot.entry.consumer_group == group)
            .map(EntrySlot::eligible_at)
            .min()
    }
}

#[derive(Debug, Default)]
struct BackendState {
    streams: HashMap<StreamName, StreamState>,
    /// Parked task_id -> stream holding its dead letter.
    dead_letter_index: HashMap<TaskId, StreamName>,
}

impl BackendState {
    fn stream_mut(&mut self, stream: &StreamName) -> &mut StreamState {
        self.streams
            .entry(stream.clone())
            .or_insert_with(StreamState::new)
    }

    fn held_stream(&mut self, lease: &ClaimLease) -> Result<&mut StreamState, QueueError> {
        self.streams
            .get_mut(&lease.stream)
            .ok_or_else(|| QueueError::LeaseLost {
                token: lease.token,
                stream: lease.stream.clone(),
                offset: lease.offset,
            })
    }

    fn try_claim(
        &mut self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
        token: LeaseToken,
    ) -> Option<Claimed> {
        for stream in &request.streams {
            let Some(state) = self.streams.get_mut(stream) else {
                continue;
            };
            let Some(offset) = state.first_claimable(&request.group, now) else {
                continue;
            };
            let slot = state.entries.get_mut(&offset)?;
            let lease = ClaimLease {
                token,
                stream: stream.clone(),
                offset,
                task_id: slot.entry.task.task_id(),
                consumer_group: request.group.clone(),
                consumer: request.consumer.clone(),
                claimed_at: now,
                expires_at: now + span(request.lease_for),
            };
            slot.status = TaskStatus::Claimed;
            slot.lease = Some(lease.clone());
            return Some(Claimed {
                entry: slot.entry.clone(),
                lease,
            });
        }
        None
    }

    fn next_eligible_at(&self, request: &ClaimRequest) -> Option<DateTime<Utc>> {
        request
            .streams
            .iter()
            .filter_map(|stream| self.streams.get(stream))
            .filter_map(|state| state.next_eligible_at(&request.group))
            .min()
    }
}

/// Single-node queue backend held in process memory.
///
/// Settled entries are never dropped: `counts` and `entry_status` report them,
/// and `trim_acks` only shortens the ack log. Memory therefore grows with
/// every entry ever appended; use it for development and tests only.
pub struct InMemoryQueueBackend {
    state: Arc<Mutex<BackendState>>,
    /// Woken when an entry may have become claimable.
    entries_changed: Arc<Notify>,
    /// Woken when an ack record is appended.
    acks_changed: Arc<Notify>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    faults: FaultInjector,
    max_entry_bytes: usize,
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryQueueBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
            entries_changed: Arc::new(Notify::new()),
            acks_changed: Arc::new(Notify::new()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            faults: FaultInjector::new(),
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        }
    }

    pub fn with_max_entry_bytes(mut self, max: usize) -> Self {
        self.max_entry_bytes = max;
        self
    }

    /// Switches for making operations fail.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Most recent entry for `task_id` in `stream`.
    pub async fn latest_entry(&self, stream: &StreamName, task_id: TaskId) -> Option<QueueEntry> {
        let state = self.state.lock().await;
        let stream_state = state.streams.get(stream)?;
        let offset = stream_state.latest.get(&task_id)?;
        stream_state
            .entries
            .get(offset)
            .map(|slot| slot.entry.clone())
    }

    /// All ack records still in the ack log of `stream`.
    pub async fn acks(&self, stream: &StreamName) -> Vec<AckEntry> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.acks.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn trip(&self, op: &str) -> Result<(), QueueError> {
        self.faults.trip(op).map_err(QueueError::Unavailable)
    }

    fn deadline_after(wait: Duration) -> Instant {
        Instant::now() + wait
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn append(
        &self,
        stream: &StreamName,
        group: &str,
        task: Task,
    ) -> Result<Offset, QueueError> {
        self.trip("append")?;
        let size = task.payload_size()?;
        if size > self.max_entry_bytes {
            return Err(QueueError::EntryTooLarge {
                size,
                max: self.max_entry_bytes,
            });
        }

        let offset = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            state.stream_mut(stream).push_entry(stream, group, task, now)
        };
        self.entries_changed.notify_waiters();
        Ok(offset)
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<Claimed>, QueueError> {
        self.trip("claim")?;
        let deadline = Self::deadline_after(request.wait);

        loop {
            // Register interest before looking, so an append between the
            // check and the wait is not missed.
            let notified = self.entries_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_eligible = {
                let mut state = self.state.lock().await;
                let now = self.clock.now();
                let token = self.ids.generate_lease_token();
                if let Some(claimed) = state.try_claim(request, now, token) {
                    return Ok(Some(claimed));
                }
                state
                    .next_eligible_at(request)
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake = match next_eligible {
                Some(delay) => deadline.min(now + delay.max(Duration::from_millis(1))),
                None => deadline,
            };

            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake) => {},
            }
        }
    }

    async fn renew(
        &self,
        lease: &ClaimLease,
        lease_for: Duration,
    ) -> Result<ClaimLease, QueueError> {
        self.trip("renew")?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let slot = state.held_stream(lease)?.held_slot(lease, now)?;
        let current = slot.lease.as_mut().ok_or_else(|| QueueError::LeaseLost {
            token: lease.token,
            stream: lease.stream.clone(),
            offset: lease.offset,
        })?;
        current.expires_at = now + span(lease_for);
        Ok(current.clone())
    }

    async fn ack(&self, lease: &ClaimLease, record: AckRecord) -> Result<Offset, QueueError> {
        self.trip("ack")?;
        let ack_offset = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let stream = state.held_stream(lease)?;
            stream.held_slot(lease, now)?;
            stream.settle(lease.offset, TaskStatus::Succeeded);
            stream.push_ack(record)
        };
        self.acks_changed.notify_waiters();
        Ok(ack_offset)
    }

    async fn nack(&self, lease: &ClaimLease, retry: Task) -> Result<Offset, QueueError> {
        self.trip("nack")?;
        let offset = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let stream = state.held_stream(lease)?;
            stream.held_slot(lease, now)?;
            stream.settle(lease.offset, TaskStatus::Failed);
            stream.push_entry(&lease.stream, &lease.consumer_group, retry, now)
        };
        self.entries_changed.notify_waiters();
        Ok(offset)
    }

    async fn dead_letter(
        &self,
        lease: &ClaimLease,
        task: Task,
        reason: String,
        record: AckRecord,
    ) -> Result<Offset, QueueError> {
        self.trip("dead_letter")?;
        let ack_offset = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let task_id = task.task_id();
            let stream = state.held_stream(lease)?;
            stream.held_slot(lease, now)?;
            stream.settle(lease.offset, TaskStatus::DeadLettered);
            stream.dead_letters.retain(|dl| dl.task.task_id() != task_id);
            stream.dead_letters.push(DeadLetter {
                stream: lease.stream.clone(),
                consumer_group: lease.consumer_group.clone(),
                task,
                reason,
                dead_lettered_at: now,
            });
            let ack_offset = stream.push_ack(record);
            state
                .dead_letter_index
                .insert(task_id, lease.stream.clone());
            ack_offset
        };
        self.acks_changed.notify_waiters();
        Ok(ack_offset)
    }

    async fn read_acks(
        &self,
        stream: &StreamName,
        after: Option<Offset>,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<AckEntry>, QueueError> {
        self.trip("read_acks")?;
        let deadline = Self::deadline_after(wait);
        let after = after.unwrap_or(Offset(0));

        loop {
            let notified = self.acks_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                let batch: Vec<AckEntry> = state
                    .streams
                    .get(stream)
                    .map(|s| {
                        s.acks
                            .iter()
                            .filter(|ack| ack.offset > after)
                            .take(max)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if !batch.is_empty() || max == 0 {
                    return Ok(batch);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(deadline) => {},
            }
        }
    }

    async fn trim_acks(&self, stream: &StreamName, up_to: Offset) -> Result<usize, QueueError> {
        self.trip("trim_acks")?;
        let mut state = self.state.lock().await;
        let Some(stream) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let mut trimmed = 0;
        while stream.acks.front().is_some_and(|ack| ack.offset <= up_to) {
            stream.acks.pop_front();
            trimmed += 1;
        }
        Ok(trimmed)
    }

    async fn ack_backlog(
        &self,
        stream: &StreamName,
        after: Option<Offset>,
    ) -> Result<usize, QueueError> {
        self.trip("ack_backlog")?;
        let after = after.unwrap_or(Offset(0));
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.acks.iter().filter(|ack| ack.offset > after).count())
            .unwrap_or(0))
    }

    async fn acquire_stream_lease(
        &self,
        stream: &StreamName,
        holder: &ConsumerId,
        ttl: Duration,
    ) -> Result<Option<StreamLease>, QueueError> {
        self.trip("acquire_stream_lease")?;
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let expires_at = now + span(ttl);
        let slot = &mut state.stream_mut(stream).drain_lease;

        let lease = match slot.take() {
            Some(current) if !current.is_expired(now) && &current.holder != holder => {
                *slot = Some(current);
                return Ok(None);
            }
            Some(current) if !current.is_expired(now) => StreamLease {
                expires_at,
                ..current
            },
            _ => StreamLease {
                token: self.ids.generate_lease_token(),
                stream: stream.clone(),
                holder: holder.clone(),
                expires_at,
            },
        };
        *slot = Some(lease.clone());
        Ok(Some(lease))
    }

    async fn release_stream_lease(&self, lease: &StreamLease) -> Result<(), QueueError> {
        self.trip("release_stream_lease")?;
        let mut state = self.state.lock().await;
        if let Some(stream) = state.streams.get_mut(&lease.stream)
            && stream
                .drain_lease
                .as_ref()
                .is_some_and(|current| current.token == lease.token)
        {
            stream.drain_lease = None;
        }
        Ok(())
    }

    async fn dead_letters(&self, stream: &StreamName) -> Result<Vec<DeadLetter>, QueueError> {
        self.trip("dead_letters")?;
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default())
    }

    async fn requeue_dead_letter(
        &self,
        task_id: TaskId,
    ) -> Result<(StreamName, Offset), QueueError> {
        self.trip("requeue_dead_letter")?;
        let result = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let stream_name = state
                .dead_letter_index
                .remove(&task_id)
                .ok_or(QueueError::DeadLetterNotFound(task_id))?;
            let stream = state.stream_mut(&stream_name);
            let position = stream
                .dead_letters
                .iter()
                .position(|dl| dl.task.task_id() == task_id)
                .ok_or(QueueError::DeadLetterNotFound(task_id))?;
            let parked = stream.dead_letters.remove(position);
            let offset = stream.push_entry(
                &stream_name,
                &parked.consumer_group,
                parked.task.replayed(now),
                now,
            );
            (stream_name, offset)
        };
        self.entries_changed.notify_waiters();
        Ok(result)
    }

    async fn purge_dead_letters(
        &self,
        stream: &StreamName,
        before: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        self.trip("purge_dead_letters")?;
        let mut state = self.state.lock().await;
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let (purged, kept): (Vec<DeadLetter>, Vec<DeadLetter>) = stream_state
            .dead_letters
            .drain(..)
            .partition(|dl| dl.dead_lettered_at < before);
        stream_state.dead_letters = kept;
        for dl in &purged {
            state.dead_letter_index.remove(&dl.task.task_id());
        }
        Ok(purged.len())
    }

    async fn counts(&self, stream: &StreamName) -> Result<QueueCounts, QueueError> {
        self.trip("counts")?;
        let state = self.state.lock().await;
        let now = self.clock.now();
        let mut counts = QueueCounts::default();
        let Some(stream) = state.streams.get(stream) else {
            return Ok(counts);
        };
        for slot in stream.entries.values() {
            match slot.status_at(now) {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Claimed => counts.claimed += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::DeadLettered => counts.dead_lettered += 1,
            }
        }
        counts.ack_backlog = stream.acks.len();
        counts.dead_letters_parked = stream.dead_letters.len();
        Ok(counts)
    }

    async fn entry_status(
        &self,
        stream: &StreamName,
        task_id: TaskId,
    ) -> Result<Option<TaskStatus>, QueueError> {
        self.trip("entry_status")?;
        let state = self.state.lock().await;
        let now = self.clock.now();
        Ok(state.streams.get(stream).and_then(|s| {
            let offset = s.latest.get(&task_id)?;
            s.entries.get(offset).map(|slot| slot.status_at(now))
        }))
    }

    fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FinalStatus, TaskKind};
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    const LEASE: Duration = Duration::from_secs(30);

    fn stream() -> StreamName {
        StreamName::new("payments").unwrap()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn task_at(at: DateTime<Utc>) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new("webhook"),
            serde_json::json!({"n": 1}),
            at,
        )
    }

    fn request(consumer: &str, wait: Duration) -> ClaimRequest {
        ClaimRequest {
            group: "workers".into(),
            consumer: ConsumerId::new(consumer),
            streams: vec![stream()],
            lease_for: LEASE,
            wait,
        }
    }

    fn backend() -> (InMemoryQueueBackend, ManualClock) {
        let clock = ManualClock::new(start());
        (InMemoryQueueBackend::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn offsets_are_monotonic_and_claims_oldest_first() {
        let (backend, _) = backend();
        let a = backend.append(&stream(), "workers", task_at(start())).await.unwrap();
        let b = backend.append(&stream(), "workers", task_at(start())).await.unwrap();
        assert_eq!(a, Offset(1));
        assert_eq!(b, Offset(2));

        let first = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();
        let second = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(first.entry.offset, a);
        assert_eq!(second.entry.offset, b);
        assert!(backend.claim(&request("c1", Duration::ZERO)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_deduplicates_live_task_id() {
        let (backend, _) = backend();
        let task = task_at(start());
        let a = backend.append(&stream(), "workers", task.clone()).await.unwrap();
        let b = backend.append(&stream(), "workers", task).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.counts(&stream()).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (backend, _) = backend();
        let backend = backend.with_max_entry_bytes(4);
        let err = backend.append(&stream(), "workers", task_at(start())).await.unwrap_err();
        assert!(matches!(err, QueueError::EntryTooLarge { max: 4, .. }));
    }

    #[tokio::test]
    async fn future_entries_are_not_claimable_yet() {
        let (backend, clock) = backend();
        let later = start() + chrono::Duration::seconds(10);
        backend.append(&stream(), "workers", task_at(later)).await.unwrap();

        assert!(backend.claim(&request("c1", Duration::ZERO)).await.unwrap().is_none());
        clock.advance(Duration::from_secs(10));
        assert!(backend.claim(&request("c1", Duration::ZERO)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_exactly_at_expiry() {
        let (backend, clock) = backend();
        backend.append(&stream(), "workers", task_at(start())).await.unwrap();
        let first = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();

        clock.advance(LEASE - Duration::from_millis(1));
        assert!(backend.claim(&request("c2", Duration::ZERO)).await.unwrap().is_none());

        clock.advance(Duration::from_millis(1));
        let second = backend.claim(&request("c2", Duration::ZERO)).await.unwrap().unwrap();
        assert_eq!(second.entry.offset, first.entry.offset);
        assert_ne!(second.lease.token, first.lease.token);

        // The first holder's token no longer works.
        let record = AckRecord::succeeded(&first.entry, None, clock.now());
        let err = backend.ack(&first.lease, record).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn renew_extends_a_live_lease() {
        let (backend, clock) = backend();
        backend.append(&stream(), "workers", task_at(start())).await.unwrap();
        let claimed = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(20));
        let renewed = backend.renew(&claimed.lease, LEASE).await.unwrap();
        assert_eq!(renewed.expires_at, clock.now() + chrono::Duration::seconds(30));

        clock.advance(Duration::from_secs(20));
        assert!(backend.claim(&request("c2", Duration::ZERO)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_settles_entry_and_appends_ack_record() {
        let (backend, clock) = backend();
        backend.append(&stream(), "workers", task_at(start())).await.unwrap();
        let claimed = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();

        let record = AckRecord::succeeded(&claimed.entry, None, clock.now());
        let ack_offset = backend.ack(&claimed.lease, record).await.unwrap();
        assert_eq!(ack_offset, Offset(1));

        let counts = backend.counts(&stream()).await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.ack_backlog, 1);

        let acks = backend.read_acks(&stream(), None, 10, Duration::ZERO).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].record.final_status, FinalStatus::Succeeded);

        // Second ack for the same lease is rejected.
        let again = AckRecord::succeeded(&claimed.entry, None, clock.now());
        assert!(backend.ack(&claimed.lease, again).await.is_err());
    }

    #[tokio::test]
    async fn nack_retires_entry_and_appends_retry() {
        let (backend, clock) = backend();
        let task = task_at(start());
        let task_id = task.task_id();
        backend.append(&stream(), "workers", task).await.unwrap();
        let claimed = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();

        let retry_at = clock.now() + chrono::Duration::seconds(2);
        let retry = claimed.entry.task.for_retry(1, retry_at);
        let offset = backend.nack(&claimed.lease, retry).await.unwrap();
        assert_eq!(offset, Offset(2));

        let latest = backend.latest_entry(&stream(), task_id).await.unwrap();
        assert_eq!(latest.task.attempt_count(), 1);
        assert_eq!(
            backend.entry_status(&stream(), task_id).await.unwrap(),
            Some(TaskStatus::Pending)
        );
        let counts = backend.counts(&stream()).await.unwrap();
        assert_eq!((counts.failed, counts.pending), (1, 1));
    }

    #[tokio::test]
    async fn dead_letter_parks_and_requeue_resets_attempts() {
        let (backend, clock) = backend();
        let task = task_at(start());
        let task_id = task.task_id();
        backend.append(&stream(), "workers", task).await.unwrap();
        let claimed = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();

        let parked = claimed.entry.task.dead_lettered(3);
        let record = AckRecord::dead_lettered(&claimed.entry, 3, "boom", clock.now());
        backend
            .dead_letter(&claimed.lease, parked, "boom".into(), record)
            .await
            .unwrap();

        let letters = backend.dead_letters(&stream()).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "boom");

        let (replayed_stream, offset) = backend.requeue_dead_letter(task_id).await.unwrap();
        assert_eq!(replayed_stream, stream());
        let entry = backend.latest_entry(&stream(), task_id).await.unwrap();
        assert_eq!(entry.offset, offset);
        assert_eq!(entry.task.attempt_count(), 0);
        assert!(backend.dead_letters(&stream()).await.unwrap().is_empty());

        let err = backend.requeue_dead_letter(task_id).await.unwrap_err();
        assert!(matches!(err, QueueError::DeadLetterNotFound(_)));
    }

    #[tokio::test]
    async fn purge_removes_only_older_dead_letters() {
        let (backend, clock) = backend();
        for _ in 0..2 {
            backend.append(&stream(), "workers", task_at(start())).await.unwrap();
            let claimed = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();
            let record = AckRecord::dead_lettered(&claimed.entry, 1, "poison", clock.now());
            let parked = claimed.entry.task.dead_lettered(1);
            backend
                .dead_letter(&claimed.lease, parked, "poison".into(), record)
                .await
                .unwrap();
            clock.advance(Duration::from_secs(60));
        }

        let cutoff = start() + chrono::Duration::seconds(30);
        assert_eq!(backend.purge_dead_letters(&stream(), cutoff).await.unwrap(), 1);
        assert_eq!(backend.dead_letters(&stream()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trim_and_backlog_follow_offsets() {
        let (backend, clock) = backend();
        for _ in 0..3 {
            backend.append(&stream(), "workers", task_at(start())).await.unwrap();
            let claimed = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();
            let record = AckRecord::succeeded(&claimed.entry, None, clock.now());
            backend.ack(&claimed.lease, record).await.unwrap();
        }

        assert_eq!(backend.ack_backlog(&stream(), None).await.unwrap(), 3);
        assert_eq!(backend.ack_backlog(&stream(), Some(Offset(2))).await.unwrap(), 1);
        assert_eq!(backend.trim_acks(&stream(), Offset(2)).await.unwrap(), 2);

        let rest = backend.read_acks(&stream(), None, 10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].offset, Offset(3));
    }

    #[tokio::test]
    async fn stream_lease_has_one_holder() {
        let (backend, clock) = backend();
        let ttl = Duration::from_secs(10);
        let a = ConsumerId::new("drainer-a");
        let b = ConsumerId::new("drainer-b");

        let lease = backend.acquire_stream_lease(&stream(), &a, ttl).await.unwrap().unwrap();
        assert!(backend.acquire_stream_lease(&stream(), &b, ttl).await.unwrap().is_none());

        let renewed = backend.acquire_stream_lease(&stream(), &a, ttl).await.unwrap().unwrap();
        assert_eq!(renewed.token, lease.token);

        clock.advance(ttl);
        let taken = backend.acquire_stream_lease(&stream(), &b, ttl).await.unwrap().unwrap();
        assert_ne!(taken.token, lease.token);

        backend.release_stream_lease(&lease).await.unwrap();
        assert!(backend.acquire_stream_lease(&stream(), &a, ttl).await.unwrap().is_none());

        backend.release_stream_lease(&taken).await.unwrap();
        assert!(backend.acquire_stream_lease(&stream(), &a, ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn claim_wakes_up_on_append() {
        let backend = Arc::new(InMemoryQueueBackend::default());
        let waiter = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.claim(&request("c1", Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend
            .append(&stream(), "workers", task_at(Utc::now()))
            .await
            .unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn other_groups_do_not_see_entries() {
        let (backend, _) = backend();
        backend.append(&stream(), "auditors", task_at(start())).await.unwrap();
        assert!(backend.claim(&request("c1", Duration::ZERO)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settled_entries_outlive_ack_trim() {
        let (backend, _) = backend();
        let task = task_at(start());
        let task_id = task.task_id();
        backend.append(&stream(), "workers", task).await.unwrap();
        let claimed = backend.claim(&request("c1", Duration::ZERO)).await.unwrap().unwrap();
        let record = AckRecord::succeeded(&claimed.entry, None, start());
        let ack_offset = backend.ack(&claimed.lease, record).await.unwrap();

        assert_eq!(backend.trim_acks(&stream(), ack_offset).await.unwrap(), 1);
        let counts = backend.counts(&stream()).await.unwrap();
        assert_eq!((counts.succeeded, counts.ack_backlog), (1, 0));
        assert_eq!(
            backend.entry_status(&stream(), task_id).await.unwrap(),
            Some(TaskStatus::Succeeded)
        );
    }

    #[tokio::test]
    async fn injected_faults_surface_as_unavailable() {
        let (backend, _) = backend();
        backend.faults().fail_next(1);
        let err = backend.append(&stream(), "workers", task_at(start())).await.unwrap_err();
        assert!(err.kind().is_retryable());
        assert!(backend.append(&stream(), "workers", task_at(start())).await.is_ok());
    }
}
