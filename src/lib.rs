pub mod config;
pub mod dispatcher;
pub mod downloader;
pub mod events;
pub mod manager;
pub mod models;
pub mod output;
pub mod progress;
pub mod queue;
pub mod state_manager;
pub mod transport;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::dispatcher::{CallbackDispatcher, Executor, SerialExecutor};
    pub use crate::events::{
        DownloadEvent, ErrorEvent, ErrorKind, Listeners, PauseEvent, ProgressEvent, SuccessEvent,
    };
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{DownloadId, DownloadRequest, DownloadSnapshot, Priority, Status};
    pub use crate::state_manager::StateManager;
    pub use crate::transport::{HttpTransport, Transport, TransportError};
}
