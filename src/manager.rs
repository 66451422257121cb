// src/manager.rs

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::dispatcher::CallbackDispatcher;
use crate::downloader::{DownloadError, DownloadWorker, WorkerContext};
use crate::events::{ErrorEvent, ErrorKind, SuccessEvent};
use crate::models::{
    unix_now, DownloadId, DownloadRequest, DownloadSnapshot, RequestError, RequestRecord,
    RunControl, Status,
};
use crate::queue::{Admission, Control, PauseSettlement, PriorityRequestQueue, QueueError};
use crate::state_manager::{StateError, StateManager};
use crate::transport::{HttpTransport, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("download {0} not found")]
    NotFound(DownloadId),
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
}

impl From<QueueError> for ManagerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => Self::NotFound(id),
        }
    }
}

enum Terminal {
    Success,
    Error { kind: ErrorKind, detail: String },
}

/// Removes a record from the queue once its terminal job is done, even if
/// the listener panicked.
struct FinishOnDrop {
    queue: Arc<PriorityRequestQueue>,
    record: Arc<RequestRecord>,
}

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.queue.finish(&self.record);
    }
}

/// Entry point of the engine: owns the queue, the worker pool and terminal delivery.
///
/// Built once with its collaborators and shared as `Arc<DownloadManager>`.
pub struct DownloadManager {
    config: Arc<EngineConfig>,
    queue: Arc<PriorityRequestQueue>,
    worker_ctx: WorkerContext,
    worker_slots: Arc<Semaphore>,
    workers: TaskTracker,
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        state_manager: StateManager,
        dispatcher: CallbackDispatcher,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            worker_slots: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            queue: Arc::new(PriorityRequestQueue::new()),
            worker_ctx: WorkerContext {
                transport,
                state: state_manager,
                dispatcher,
                config: config.clone(),
            },
            config,
            workers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wires the HTTP transport and the configured checkpoint store.
    pub async fn from_config(
        config: EngineConfig,
        dispatcher: CallbackDispatcher,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let transport = HttpTransport::new(&config.user_agent)?;
        let state_manager = match &config.database_path {
            Some(path) => StateManager::new(path).await?,
            None => StateManager::in_memory().await?,
        };
        Ok(Self::new(config, Arc::new(transport), state_manager, dispatcher))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &PriorityRequestQueue {
        &self.queue
    }

    /// Admits a request and returns its id. Submitting a triple that is
    /// already live replaces its listeners instead of starting it twice.
    pub fn submit(&self, request: DownloadRequest) -> Result<DownloadId, ManagerError> {
        request.validate()?;
        let record = RequestRecord::new(request, &self.config);
        let id = record.id();

        let (record, admission) = self.queue.submit(record);
        match admission {
            Admission::Queued => info!(
                %id,
                url = record.url(),
                priority = ?record.priority(),
                sequence = record.sequence(),
                "download queued"
            ),
            Admission::Merged => {
                debug!(%id, status = ?record.status(), "duplicate submission merged")
            }
        }
        Ok(id)
    }

    pub fn pause(&self, id: DownloadId) -> Result<(), ManagerError> {
        let dispatcher = &self.worker_ctx.dispatcher;
        match self.queue.pause(id, |record| dispatcher.pause(record))? {
            Control::Applied => info!(%id, "queued download paused"),
            Control::Signalled => debug!(%id, "pause signalled, waiting for checkpoint"),
            other => debug!(%id, outcome = ?other, "pause ignored"),
        }
        Ok(())
    }

    /// Re-enqueues a paused download. It never runs on the caller's task.
    pub fn resume(&self, id: DownloadId) -> Result<(), ManagerError> {
        match self.queue.resume(id)? {
            Control::Applied => info!(%id, "download resumed"),
            Control::Deferred => debug!(%id, "resume deferred until pause is acknowledged"),
            other => debug!(%id, outcome = ?other, "resume ignored"),
        }
        Ok(())
    }

    /// Cancels a download and discards its partial data.
    pub async fn cancel(&self, id: DownloadId) -> Result<(), ManagerError> {
        let (outcome, record) = self.queue.cancel(id)?;
        match outcome {
            Control::Applied => {
                info!(%id, "download cancelled");
                self.discard_partial(&record).await;
                self.deliver_cancelled(&record);
            }
            Control::Signalled => debug!(%id, "cancel signalled to worker"),
            other => debug!(%id, outcome = ?other, "cancel ignored"),
        }
        Ok(())
    }

    /// Cancels every live download carrying `tag`. Returns how many were addressed.
    pub async fn cancel_by_tag(&self, tag: &serde_json::Value) -> usize {
        self.cancel_each(self.queue.ids_with_tag(tag)).await
    }

    pub async fn cancel_all(&self) -> usize {
        self.cancel_each(self.queue.ids()).await
    }

    async fn cancel_each(&self, ids: Vec<DownloadId>) -> usize {
        let mut addressed = 0;
        for id in ids {
            // Finished between the lookup and now.
            if self.cancel(id).await.is_ok() {
                addressed += 1;
            }
        }
        addressed
    }

    /// Snapshot of a download. Live records are read without waiting on
    /// their worker; finished ones come from the retained history, and
    /// downloads known only from a checkpoint are reported as paused.
    pub async fn status(&self, id: DownloadId) -> Result<DownloadSnapshot, ManagerError> {
        if let Some(record) = self.queue.get(id) {
            return Ok(record.snapshot());
        }
        if let Some(snapshot) = self.queue.finished_snapshot(id) {
            return Ok(snapshot);
        }
        match self.worker_ctx.state.load_model(id).await {
            Ok(Some(model)) => Ok(DownloadSnapshot {
                id,
                status: Status::Paused,
                downloaded_bytes: model.downloaded_bytes,
                total_bytes: model.total_bytes,
            }),
            Ok(None) | Err(StateError::Serialization(_)) => Err(ManagerError::NotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes checkpoints and partial files untouched for longer than
    /// `older_than`. Downloads that are currently live are kept.
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize, ManagerError> {
        let cutoff = unix_now().saturating_sub(older_than.as_secs());
        let mut removed = 0;
        for model in self.worker_ctx.state.load_all_models().await? {
            if model.last_modified_at > cutoff || self.queue.contains(model.id) {
                continue;
            }
            remove_if_present(&model.temporary_path()).await;
            self.worker_ctx.state.delete_model(model.id).await?;
            info!(id = %model.id, "stale partial download removed");
            removed += 1;
        }
        Ok(removed)
    }

    /// Starts the scheduler loop on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Dispatches queued downloads until shutdown, at most
    /// `max_concurrent_downloads` at a time.
    pub async fn run(self: Arc<Self>) {
        info!(
            workers = self.config.max_concurrent_downloads,
            "scheduler started"
        );
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.worker_slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = loop {
                let notified = self.queue.notified();
                if let Some(next) = self.queue.next_ready() {
                    break Some(next);
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => break None,
                    _ = notified => {}
                }
            };
            let Some((record, control)) = next else { break };
            self.spawn_worker(record, control, permit);
        }
        info!("scheduler stopped");
    }

    fn spawn_worker(
        self: &Arc<Self>,
        record: Arc<RequestRecord>,
        control: RunControl,
        permit: OwnedSemaphorePermit,
    ) {
        let manager = Arc::clone(self);
        self.workers.spawn(async move {
            let id = record.id();
            debug!(%id, offset = record.downloaded_bytes(), "worker starting");
            let result =
                DownloadWorker::run(&manager.worker_ctx, Arc::clone(&record), control.clone())
                    .await;
            drop(permit);
            manager.settle(&record, &control, result).await;
        });
    }

    /// Applies a worker's result to the record and delivers the matching event.
    async fn settle(
        &self,
        record: &Arc<RequestRecord>,
        control: &RunControl,
        result: Result<(), DownloadError>,
    ) {
        let id = record.id();
        match result {
            Ok(()) => {
                if self.queue.settle(record, Status::Completed) {
                    info!(%id, bytes = record.downloaded_bytes(), "download completed");
                    self.deliver_terminal(record, Terminal::Success);
                }
            }
            Err(DownloadError::Paused) => {
                let dispatcher = &self.worker_ctx.dispatcher;
                match self
                    .queue
                    .settle_paused(record, control, |record| dispatcher.pause(record))
                {
                    PauseSettlement::Paused => {
                        info!(%id, bytes = record.downloaded_bytes(), "download paused")
                    }
                    PauseSettlement::Requeued => {
                        info!(%id, bytes = record.downloaded_bytes(), "download paused and requeued")
                    }
                    PauseSettlement::Cancelled => {
                        info!(%id, "download cancelled while pausing");
                        self.discard_partial(record).await;
                        self.deliver_cancelled(record);
                    }
                }
            }
            Err(DownloadError::Cancelled) => {
                if self.queue.settle(record, Status::Cancelled) {
                    info!(%id, "download cancelled");
                    self.discard_partial(record).await;
                    self.deliver_cancelled(record);
                }
            }
            Err(err) => {
                error!(%id, error = %err, "download failed");
                if self.queue.settle(record, Status::Failed) {
                    self.deliver_terminal(
                        record,
                        Terminal::Error {
                            kind: err.kind(),
                            detail: err.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn deliver_cancelled(&self, record: &Arc<RequestRecord>) {
        self.deliver_terminal(
            record,
            Terminal::Error {
                kind: ErrorKind::Cancelled,
                detail: DownloadError::Cancelled.to_string(),
            },
        );
    }

    /// Delivers the single terminal event of `record`, then clears its
    /// listeners and removes it from the queue on the callback context.
    fn deliver_terminal(&self, record: &Arc<RequestRecord>, terminal: Terminal) {
        if !record.mark_terminal_delivered() {
            warn!(id = %record.id(), "terminal event already delivered, dropping duplicate");
            return;
        }
        let finish = FinishOnDrop {
            queue: Arc::clone(&self.queue),
            record: Arc::clone(record),
        };
        self.worker_ctx.dispatcher.dispatch(move || {
            let finish = finish;
            let id = finish.record.id();
            let listeners = finish.record.take_listeners();
            match terminal {
                Terminal::Success => {
                    if let Some(callback) = listeners.on_success {
                        callback(SuccessEvent { id });
                    }
                }
                Terminal::Error { kind, detail } => {
                    if let Some(callback) = listeners.on_error {
                        callback(ErrorEvent { id, kind, detail });
                    }
                }
            }
        });
    }

    async fn discard_partial(&self, record: &RequestRecord) {
        remove_if_present(&record.temporary_path()).await;
        if let Err(err) = self.worker_ctx.state.delete_model(record.id()).await {
            warn!(id = %record.id(), error = %err, "could not delete checkpoint");
        }
    }

    /// Stops dispatching, pauses every running download and waits for the
    /// workers to checkpoint.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.shutdown.cancel();
        for record in self.queue.running() {
            if let Err(err) = self.pause(record.id()) {
                debug!(id = %record.id(), error = %err, "pause on shutdown skipped");
            }
        }
        self.workers.close();
        self.workers.wait().await;
    }
}

async fn remove_if_present(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "could not remove partial file"),
    }
}
