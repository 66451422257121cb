// src/events.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::models::DownloadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: DownloadId,
    pub downloaded_bytes: u64,
    /// `None` while the transport has not advertised a size.
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessEvent {
    pub id: DownloadId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseEvent {
    pub id: DownloadId,
}

/// Category of a failed or cancelled download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection, timeout or HTTP status failure. Retrying is up to the caller.
    Transport,
    /// Disk full, permission denied, sync failure.
    Storage,
    /// The server would not honor a range request the download depended on.
    Protocol,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: DownloadId,
    pub kind: ErrorKind,
    pub detail: String,
}

/// Every notification a download can produce, for callers that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Progress(ProgressEvent),
    Success(SuccessEvent),
    Error(ErrorEvent),
    Pause(PauseEvent),
}

impl DownloadEvent {
    pub fn id(&self) -> DownloadId {
        match self {
            Self::Progress(event) => event.id,
            Self::Success(event) => event.id,
            Self::Error(event) => event.id,
            Self::Pause(event) => event.id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Error(_))
    }
}

pub type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Optional listener handles attached to one download.
///
/// The record owns these and drops them once its terminal event has run,
/// so nothing the callbacks capture outlives the download.
#[derive(Clone, Default)]
pub struct Listeners {
    pub on_progress: Option<Callback<ProgressEvent>>,
    pub on_success: Option<Callback<SuccessEvent>>,
    pub on_error: Option<Callback<ErrorEvent>>,
    pub on_pause: Option<Callback<PauseEvent>>,
}

impl Listeners {
    /// Routes all four notifications into one channel.
    pub fn forward_to(sender: UnboundedSender<DownloadEvent>) -> Self {
        let progress = sender.clone();
        let success = sender.clone();
        let error = sender.clone();
        let pause = sender;
        Self {
            on_progress: Some(Arc::new(move |event| {
                let _ = progress.send(DownloadEvent::Progress(event));
            })),
            on_success: Some(Arc::new(move |event| {
                let _ = success.send(DownloadEvent::Success(event));
            })),
            on_error: Some(Arc::new(move |event| {
                let _ = error.send(DownloadEvent::Error(event));
            })),
            on_pause: Some(Arc::new(move |event| {
                let _ = pause.send(DownloadEvent::Pause(event));
            })),
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_pause", &self.on_pause.is_some())
            .finish()
    }
}
