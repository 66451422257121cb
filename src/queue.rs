// src/queue.rs

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::models::{DownloadId, DownloadSnapshot, Priority, RequestRecord, RunControl, Status};

/// How many terminal snapshots stay queryable after their record is finished.
const FINISHED_HISTORY: usize = 256;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("download {0} not found")]
    NotFound(DownloadId),
}

/// Result of admitting a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// The id was already live; its listeners were replaced and nothing new was scheduled.
    Merged,
}

/// Effect of a pause, resume or cancel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// The transition happened immediately.
    Applied,
    /// The running worker was signalled and will settle at its next checkpoint.
    Signalled,
    /// A resume arrived while a pause was still being acknowledged; it runs right after.
    Deferred,
    /// Nothing to do in this state.
    Ignored(Status),
}

/// Outcome of a worker stopping on a pause request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseSettlement {
    Paused,
    /// A resume was waiting; the record is queued again.
    Requeued,
    /// A cancel raced the pause and wins.
    Cancelled,
}

/// An entry in the pending heap. Entries can go stale (record paused,
/// cancelled or already dispatched); they are skipped when popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEntry {
    priority: Priority,
    sequence: u64,
    id: DownloadId,
}

impl Ord for PendingEntry {
    /// Max-heap order: higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    records: HashMap<DownloadId, Arc<RequestRecord>>,
    pending: BinaryHeap<PendingEntry>,
    finished: VecDeque<DownloadSnapshot>,
}

impl QueueState {
    fn push(&mut self, record: &RequestRecord) {
        if let Some(sequence) = record.sequence() {
            self.pending.push(PendingEntry {
                priority: record.priority(),
                sequence,
                id: record.id(),
            });
        }
    }

    fn get(&self, id: DownloadId) -> Result<Arc<RequestRecord>, QueueError> {
        self.records
            .get(&id)
            .cloned()
            .ok_or(QueueError::NotFound(id))
    }
}

/// Live downloads keyed by id, dispatched by priority then submission order.
///
/// One coarse lock guards the map and the heap; no critical section awaits.
/// Every lifecycle transition that races with a worker goes through here, so
/// a record is never handed to two workers and control commands observe a
/// consistent state.
pub struct PriorityRequestQueue {
    state: Mutex<QueueState>,
    next_sequence: AtomicU64,
    wakeup: Notify,
}

impl Default for PriorityRequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityRequestQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            next_sequence: AtomicU64::new(1),
            wakeup: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a `Created` record, or merges it into a live record with the same id.
    pub fn submit(&self, record: RequestRecord) -> (Arc<RequestRecord>, Admission) {
        let id = record.id();
        let mut state = self.lock();

        if let Some(existing) = state.records.get(&id) {
            if !existing.status().is_terminal() {
                existing.replace_listeners(record.take_listeners());
                return (existing.clone(), Admission::Merged);
            }
        }

        record.assign_sequence(self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed));
        record.transition(Status::Created, Status::Queued);
        let record = Arc::new(record);
        state.push(&record);
        state.records.insert(id, record.clone());
        state.finished.retain(|snapshot| snapshot.id != id);
        drop(state);

        self.wakeup.notify_one();
        (record, Admission::Queued)
    }

    pub fn get(&self, id: DownloadId) -> Option<Arc<RequestRecord>> {
        self.lock().records.get(&id).cloned()
    }

    pub fn contains(&self, id: DownloadId) -> bool {
        self.lock().records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<DownloadId> {
        self.lock().records.keys().copied().collect()
    }

    pub fn ids_with_tag(&self, tag: &serde_json::Value) -> Vec<DownloadId> {
        self.lock()
            .records
            .values()
            .filter(|record| record.tag() == Some(tag))
            .map(|record| record.id())
            .collect()
    }

    pub fn running(&self) -> Vec<Arc<RequestRecord>> {
        self.lock()
            .records
            .values()
            .filter(|record| record.status() == Status::Running)
            .cloned()
            .collect()
    }

    /// Resolves once something may have become dispatchable.
    pub fn notified(&self) -> Notified<'_> {
        self.wakeup.notified()
    }

    /// Takes the best queued record and moves it to `Running`.
    pub fn next_ready(&self) -> Option<(Arc<RequestRecord>, RunControl)> {
        let mut state = self.lock();
        while let Some(entry) = state.pending.pop() {
            let Some(record) = state.records.get(&entry.id) else {
                continue;
            };
            if record.sequence() != Some(entry.sequence) || record.status() != Status::Queued {
                continue;
            }
            // Signals must exist before the record is observable as Running.
            let control = record.install_control();
            if record.transition(Status::Queued, Status::Running) {
                return Some((record.clone(), control));
            }
        }
        None
    }

    /// Pauses `id`. A queued record pauses at once and `on_paused` runs under
    /// the lock, so no later event of a resumed run can overtake it.
    pub fn pause(
        &self,
        id: DownloadId,
        on_paused: impl FnOnce(&Arc<RequestRecord>),
    ) -> Result<Control, QueueError> {
        let state = self.lock();
        let record = state.get(id)?;
        match record.status() {
            Status::Queued => {
                record.transition(Status::Queued, Status::Paused);
                on_paused(&record);
                Ok(Control::Applied)
            }
            Status::Running => {
                record.take_resume_request();
                match record.control() {
                    Some(control) if !control.pause_requested() => {
                        control.pause.cancel();
                        Ok(Control::Signalled)
                    }
                    _ => Ok(Control::Ignored(Status::Running)),
                }
            }
            other => Ok(Control::Ignored(other)),
        }
    }

    /// Puts a paused record back in line with its original priority and sequence.
    pub fn resume(&self, id: DownloadId) -> Result<Control, QueueError> {
        let mut state = self.lock();
        let record = state.get(id)?;
        let outcome = match record.status() {
            Status::Paused => {
                record.transition(Status::Paused, Status::Queued);
                state.push(&record);
                Control::Applied
            }
            Status::Running if record.control().is_some_and(|c| c.pause_requested()) => {
                record.request_resume_after_pause();
                Control::Deferred
            }
            other => Control::Ignored(other),
        };
        drop(state);

        if outcome == Control::Applied {
            self.wakeup.notify_one();
        }
        Ok(outcome)
    }

    /// Cancels `id`. Queued and paused records become `Cancelled` immediately
    /// and the caller delivers the outcome; a running worker is signalled.
    pub fn cancel(&self, id: DownloadId) -> Result<(Control, Arc<RequestRecord>), QueueError> {
        let state = self.lock();
        let record = state.get(id)?;
        let outcome = match record.status() {
            status @ (Status::Queued | Status::Paused) => {
                record.transition(status, Status::Cancelled);
                Control::Applied
            }
            Status::Running => {
                if let Some(control) = record.control() {
                    control.cancel.cancel();
                }
                Control::Signalled
            }
            other => Control::Ignored(other),
        };
        Ok((outcome, record))
    }

    /// Moves a record whose worker returned out of `Running`.
    pub fn settle(&self, record: &RequestRecord, to: Status) -> bool {
        let _state = self.lock();
        record.transition(Status::Running, to)
    }

    /// Settles a worker that stopped on a pause request. `on_paused` runs
    /// under the lock before any waiting resume re-queues the record.
    pub fn settle_paused(
        &self,
        record: &Arc<RequestRecord>,
        control: &RunControl,
        on_paused: impl FnOnce(&Arc<RequestRecord>),
    ) -> PauseSettlement {
        let mut state = self.lock();
        if control.cancel.is_cancelled() {
            record.transition(Status::Running, Status::Cancelled);
            return PauseSettlement::Cancelled;
        }
        record.transition(Status::Running, Status::Paused);
        on_paused(record);
        if !record.take_resume_request() {
            return PauseSettlement::Paused;
        }
        record.transition(Status::Paused, Status::Queued);
        state.push(record);
        drop(state);
        self.wakeup.notify_one();
        PauseSettlement::Requeued
    }

    /// Removes a record after its terminal event ran. Only the exact record
    /// is removed, so a newer submission under the same id survives.
    pub fn finish(&self, record: &Arc<RequestRecord>) -> bool {
        let mut state = self.lock();
        let id = record.id();
        match state.records.get(&id) {
            Some(current) if Arc::ptr_eq(current, record) => {
                state.records.remove(&id);
                if state.finished.len() >= FINISHED_HISTORY {
                    state.finished.pop_front();
                }
                state.finished.push_back(record.snapshot());
                true
            }
            _ => false,
        }
    }

    /// Last known state of a finished download, if still remembered.
    pub fn finished_snapshot(&self, id: DownloadId) -> Option<DownloadSnapshot> {
        self.lock()
            .finished
            .iter()
            .rev()
            .find(|snapshot| snapshot.id == id)
            .copied()
    }
}
