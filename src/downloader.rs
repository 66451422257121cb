// src/downloader.rs

use futures_util::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::CallbackDispatcher;
use crate::events::ErrorKind;
use crate::models::{DownloadModel, RequestRecord, RunControl};
use crate::output::ResumableFileOutput;
use crate::progress::{ProgressThrottle, SyncSchedule};
use crate::state_manager::{StateError, StateManager};
use crate::transport::{Transport, TransportError, TransportRequest, TransportResponse};

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("server ignored the range request for offset {offset}")]
    Protocol { offset: u64 },
    #[error("state store error: {0}")]
    State(#[from] StateError),
    #[error("stream ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error("server sent {received} bytes of a resource advertised as {expected}")]
    Overrun { received: u64, expected: u64 },
    #[error("download paused")]
    Paused,
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Incomplete { .. } => ErrorKind::Transport,
            Self::Storage(_) | Self::State(_) => ErrorKind::Storage,
            Self::Protocol { .. } | Self::Overrun { .. } => ErrorKind::Protocol,
            Self::Paused | Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Paused and cancelled runs stop on request rather than on failure.
    fn is_control(&self) -> bool {
        matches!(self, Self::Paused | Self::Cancelled)
    }
}

/// Shared collaborators a worker needs, cloned into every spawned run.
#[derive(Clone)]
pub struct WorkerContext {
    pub transport: Arc<dyn Transport>,
    pub state: StateManager,
    pub dispatcher: CallbackDispatcher,
    pub config: Arc<EngineConfig>,
}

/// Drives one run of a record: transport bytes into its partial file.
pub struct DownloadWorker;

impl DownloadWorker {
    /// Runs until the stream ends, a stop is requested, or an error occurs.
    ///
    /// `Ok` means the data file was completed and moved to its final name.
    /// `Err(Paused)` is only returned after the partial data is durable and
    /// its checkpoint persisted. The output handle is closed on every path.
    pub async fn run(
        ctx: &WorkerContext,
        record: Arc<RequestRecord>,
        control: RunControl,
    ) -> Result<(), DownloadError> {
        let temp_path = record.temporary_path();
        let mut output =
            ResumableFileOutput::open(&temp_path, ctx.config.write_buffer_size).await?;

        let result = Self::drive(ctx, &record, &control, &mut output).await;

        match &result {
            Err(DownloadError::Overrun { .. }) => {
                // The resource does not match its advertised size; start over next time.
                if let Err(err) = ctx.state.delete_model(record.id()).await {
                    warn!(id = %record.id(), error = %err, "could not delete checkpoint");
                }
            }
            Err(err) if !err.is_control() => {
                // Keep whatever already arrived resumable for a later submission.
                if let Err(checkpoint_err) = Self::checkpoint(ctx, &record, &mut output).await {
                    warn!(
                        id = %record.id(),
                        path = %output.path().display(),
                        error = %checkpoint_err,
                        "could not checkpoint failed download"
                    );
                }
            }
            _ => {}
        }

        let closed = output.close().await;
        result?;
        closed?;

        tokio::fs::rename(&temp_path, record.final_path()).await?;
        if let Err(err) = ctx.state.delete_model(record.id()).await {
            warn!(id = %record.id(), error = %err, "could not delete checkpoint of finished download");
        }
        Ok(())
    }

    async fn drive(
        ctx: &WorkerContext,
        record: &RequestRecord,
        control: &RunControl,
        output: &mut ResumableFileOutput,
    ) -> Result<(), DownloadError> {
        let id = record.id();
        let on_disk = output.disk_len().await?;
        let checkpoint = Self::load_checkpoint(ctx, record).await?;

        // Trust the smaller of the synced checkpoint and the file itself; any
        // tail beyond the checkpoint may be torn by an unclean shutdown.
        let mut offset = checkpoint
            .as_ref()
            .map_or(0, |model| model.downloaded_bytes.min(on_disk));
        if let Some(model) = &checkpoint {
            record.set_etag(model.etag.clone());
            if offset > 0 && model.total_bytes == Some(offset) {
                info!(%id, bytes = offset, "partial file already complete");
                return Self::complete_at(ctx, record, output, offset).await;
            }
        }
        Self::rewind(record, output, offset).await?;

        let mut response = loop {
            let response = match Self::open(ctx, record, control, output, offset).await {
                Err(DownloadError::Transport(TransportError::RangeNotSatisfiable { total }))
                    if offset > 0 =>
                {
                    if total == Some(offset) {
                        info!(%id, bytes = offset, "nothing left to fetch, partial file is complete");
                        return Self::complete_at(ctx, record, output, offset).await;
                    }
                    warn!(%id, offset, total = ?total, "resume offset rejected, restarting from 0");
                    offset = 0;
                    record.set_etag(None);
                    Self::rewind(record, output, 0).await?;
                    continue;
                }
                other => other?,
            };
            if offset == 0 {
                break response;
            }
            if let Some(reason) = Self::resume_mismatch(record, &response, offset) {
                warn!(%id, offset, reason, "discarding partial data and restarting");
                offset = 0;
                record.set_etag(None);
                Self::rewind(record, output, 0).await?;
                continue;
            }
            if !response.resumed {
                if !ctx.config.restart_on_range_ignored {
                    return Err(DownloadError::Protocol { offset });
                }
                // The body already starts at byte 0, so restart on this response.
                warn!(%id, offset, "server ignored range request, restarting from 0");
                offset = 0;
                Self::rewind(record, output, 0).await?;
            }
            break response;
        };

        record.set_total_bytes(response.total_bytes);
        record.set_etag(response.etag.take());
        if ctx.config.preallocate {
            if let Some(total) = response.total_bytes {
                output.set_length(total).await?;
            }
        }
        ctx.state.save_model(&record.to_model()).await?;
        debug!(%id, offset, total = ?response.total_bytes, "transfer started");

        let mut throttle = ProgressThrottle::new(ctx.config.progress_interval());
        let mut sync = SyncSchedule::new(ctx.config.sync_min_bytes, ctx.config.sync_interval());
        let read_timeout = record.read_timeout();

        loop {
            let next = tokio::select! {
                biased;
                _ = control.cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = control.pause.cancelled() => {
                    Self::checkpoint(ctx, record, output).await?;
                    return Err(DownloadError::Paused);
                }
                next = tokio::time::timeout(read_timeout, response.stream.next()) => {
                    next.map_err(|_| TransportError::Timeout { phase: "read", after: read_timeout })?
                }
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            if let Some(expected) = record.total_bytes() {
                let received = record.downloaded_bytes() + chunk.len() as u64;
                if received > expected {
                    return Err(DownloadError::Overrun { received, expected });
                }
            }

            // A write is never interrupted; stop requests are seen at the next select.
            output.write(&chunk).await?;
            record.add_downloaded(chunk.len() as u64);
            sync.record(chunk.len() as u64);

            if sync.is_due() {
                Self::checkpoint(ctx, record, output).await?;
                sync.synced();
            }
            if throttle.should_emit() {
                ctx.dispatcher.progress(record);
            }
        }

        let downloaded = record.downloaded_bytes();
        match record.total_bytes() {
            Some(expected) if expected != downloaded => {
                return Err(DownloadError::Incomplete {
                    received: downloaded,
                    expected,
                });
            }
            Some(_) => {}
            None => record.set_total_bytes(Some(downloaded)),
        }
        if ctx.config.preallocate {
            output.set_length(downloaded).await?;
        }
        output.flush_and_sync().await?;
        ctx.dispatcher.progress(record);
        Ok(())
    }

    /// Accepts the first `len` bytes of the partial file as the whole resource.
    async fn complete_at(
        ctx: &WorkerContext,
        record: &RequestRecord,
        output: &mut ResumableFileOutput,
        len: u64,
    ) -> Result<(), DownloadError> {
        record.set_total_bytes(Some(len));
        record.begin_at(len);
        output.set_length(len).await?;
        output.flush_and_sync().await?;
        ctx.dispatcher.progress(record);
        Ok(())
    }

    /// Returns the persisted checkpoint if it belongs to this record.
    async fn load_checkpoint(
        ctx: &WorkerContext,
        record: &RequestRecord,
    ) -> Result<Option<DownloadModel>, DownloadError> {
        match ctx.state.load_model(record.id()).await {
            Ok(Some(model)) if model.matches(record) => Ok(Some(model)),
            Ok(Some(model)) => {
                warn!(id = %record.id(), version = model.version, "checkpoint does not match request, ignoring it");
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(StateError::Serialization(err)) => {
                warn!(id = %record.id(), error = %err, "unreadable checkpoint, ignoring it");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cuts the file back to `offset` and positions both cursor and progress there.
    async fn rewind(
        record: &RequestRecord,
        output: &mut ResumableFileOutput,
        offset: u64,
    ) -> Result<(), DownloadError> {
        output.set_length(offset).await?;
        output.seek(offset).await?;
        record.begin_at(offset);
        Ok(())
    }

    /// Opens the transport while still honoring stop requests.
    async fn open(
        ctx: &WorkerContext,
        record: &RequestRecord,
        control: &RunControl,
        output: &mut ResumableFileOutput,
        offset: u64,
    ) -> Result<TransportResponse, DownloadError> {
        let request = TransportRequest {
            url: record.url().to_string(),
            offset,
            connect_timeout: record.connect_timeout(),
        };
        tokio::select! {
            biased;
            _ = control.cancel.cancelled() => Err(DownloadError::Cancelled),
            _ = control.pause.cancelled() => {
                Self::checkpoint(ctx, record, output).await?;
                Err(DownloadError::Paused)
            }
            response = ctx.transport.open(&request) => Ok(response?),
        }
    }

    /// Why a resumed response cannot be appended to the partial file, if it cannot.
    fn resume_mismatch(
        record: &RequestRecord,
        response: &TransportResponse,
        offset: u64,
    ) -> Option<&'static str> {
        if let (Some(previous), Some(current)) = (record.etag(), response.etag.as_deref()) {
            if previous != current {
                return Some("entity tag changed");
            }
        }
        if response.total_bytes.is_some_and(|total| total < offset) {
            return Some("resource shrank below the resume offset");
        }
        None
    }

    /// Makes written bytes durable, then records them as resumable.
    async fn checkpoint(
        ctx: &WorkerContext,
        record: &RequestRecord,
        output: &mut ResumableFileOutput,
    ) -> Result<(), DownloadError> {
        output.flush_and_sync().await?;
        ctx.state.save_model(&record.to_model()).await?;
        debug!(id = %record.id(), bytes = record.downloaded_bytes(), "checkpoint");
        Ok(())
    }
}
