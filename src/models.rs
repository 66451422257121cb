// src/models.rs

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::events::{ErrorEvent, Listeners, PauseEvent, ProgressEvent, SuccessEvent};

/// Sentinel stored in `RequestRecord::total_bytes` until the transport reports a size.
const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Version of the persisted `DownloadModel` layout written by this build.
pub const MODEL_VERSION: u32 = 1;

/// Deterministic identity of a download, derived from url, directory and file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(u32);

impl DownloadId {
    /// Hashes the triple with SHA-256 and keeps the first four bytes.
    /// Components are NUL separated so `("a", "bc")` and `("ab", "c")` differ.
    pub fn from_parts(url: &str, dir_path: &Path, file_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
        hasher.update(dir_path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(file_name.as_bytes());
        let digest = hasher.finalize();
        Self(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Dispatch priority. Later variants are served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Immediate,
}

#[derive(Debug, Error)]
#[error("unknown priority '{0}' (expected low, medium, high or immediate)")]
pub struct ParsePriorityError(String);

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "immediate" => Ok(Self::Immediate),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}

/// Lifecycle state of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Created = 0,
    Queued = 1,
    Running = 2,
    Paused = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Queued,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("invalid file name '{0}'")]
    InvalidFileName(String),
    #[error("file name '{0}' must not contain a path separator")]
    PathInFileName(String),
}

/// A caller's description of a download, built fluently before submission.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub dir_path: PathBuf,
    pub file_name: String,
    pub priority: Priority,
    /// Opaque correlation data, only compared by `cancel_by_tag`.
    pub tag: Option<serde_json::Value>,
    /// `None` inherits the engine default.
    pub read_timeout: Option<Duration>,
    /// `None` inherits the engine default.
    pub connect_timeout: Option<Duration>,
    pub listeners: Listeners,
}

impl DownloadRequest {
    pub fn new(
        url: impl Into<String>,
        dir_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            dir_path: dir_path.into(),
            file_name: file_name.into(),
            priority: Priority::default(),
            tag: None,
            read_timeout: None,
            connect_timeout: None,
            listeners: Listeners::default(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn tag(mut self, tag: serde_json::Value) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        self.listeners.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_success(mut self, callback: impl Fn(SuccessEvent) + Send + Sync + 'static) -> Self {
        self.listeners.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(ErrorEvent) + Send + Sync + 'static) -> Self {
        self.listeners.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_pause(mut self, callback: impl Fn(PauseEvent) + Send + Sync + 'static) -> Self {
        self.listeners.on_pause = Some(Arc::new(callback));
        self
    }

    pub fn id(&self) -> DownloadId {
        DownloadId::from_parts(&self.url, &self.dir_path, &self.file_name)
    }

    /// Rejects requests that cannot name a single file inside `dir_path`.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.url.trim().is_empty() {
            return Err(RequestError::EmptyUrl);
        }
        if self.file_name.is_empty() || self.file_name == "." || self.file_name == ".." {
            return Err(RequestError::InvalidFileName(self.file_name.clone()));
        }
        if self.file_name.contains(['/', '\\']) {
            return Err(RequestError::PathInFileName(self.file_name.clone()));
        }
        Ok(())
    }
}

/// Cooperative stop signals for one execution of a record.
/// A fresh pair is installed every time the record is dispatched.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub pause: CancellationToken,
    pub cancel: CancellationToken,
}

impl RunControl {
    pub fn pause_requested(&self) -> bool {
        self.pause.is_cancelled()
    }
}

/// Point-in-time view of a download's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: DownloadId,
    pub status: Status,
    pub downloaded_bytes: u64,
    /// `None` while the size is unknown.
    pub total_bytes: Option<u64>,
}

impl DownloadSnapshot {
    /// Calculates download progress as a fraction from 0.0 to 1.0.
    pub fn progress(&self) -> Option<f32> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some(self.downloaded_bytes as f32 / total as f32),
            None => None,
        }
    }
}

/// Live state of one submitted download.
///
/// Progress and lifecycle fields are atomics so that status queries never wait
/// on the worker writing them. Listener handles are owned here and cleared
/// when the record is finished.
pub struct RequestRecord {
    id: DownloadId,
    url: String,
    dir_path: PathBuf,
    file_name: String,
    priority: Priority,
    /// 0 means not yet assigned; sequences start at 1.
    sequence: AtomicU64,
    tag: Option<serde_json::Value>,
    read_timeout: Duration,
    connect_timeout: Duration,
    downloaded_bytes: AtomicU64,
    total_bytes: AtomicU64,
    state: AtomicU8,
    terminal_delivered: AtomicBool,
    resume_requested: AtomicBool,
    etag: Mutex<Option<String>>,
    control: Mutex<Option<RunControl>>,
    listeners: Mutex<Listeners>,
}

impl fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence())
            .field("status", &self.status())
            .field("downloaded_bytes", &self.downloaded_bytes())
            .field("total_bytes", &self.total_bytes())
            .finish_non_exhaustive()
    }
}

impl RequestRecord {
    pub fn new(request: DownloadRequest, config: &EngineConfig) -> Self {
        let id = request.id();
        Self {
            id,
            url: request.url,
            dir_path: request.dir_path,
            file_name: request.file_name,
            priority: request.priority,
            sequence: AtomicU64::new(0),
            tag: request.tag,
            read_timeout: request.read_timeout.unwrap_or_else(|| config.read_timeout()),
            connect_timeout: request
                .connect_timeout
                .unwrap_or_else(|| config.connect_timeout()),
            downloaded_bytes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(UNKNOWN_TOTAL),
            state: AtomicU8::new(Status::Created as u8),
            terminal_delivered: AtomicBool::new(false),
            resume_requested: AtomicBool::new(false),
            etag: Mutex::new(None),
            control: Mutex::new(None),
            listeners: Mutex::new(request.listeners),
        }
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn tag(&self) -> Option<&serde_json::Value> {
        self.tag.as_ref()
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn sequence(&self) -> Option<u64> {
        match self.sequence.load(Ordering::Acquire) {
            0 => None,
            seq => Some(seq),
        }
    }

    /// Sets the sequence only if none was assigned yet and returns the effective value.
    pub fn assign_sequence(&self, candidate: u64) -> u64 {
        match self
            .sequence
            .compare_exchange(0, candidate, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => candidate,
            Err(existing) => existing,
        }
    }

    /// Final destination, written only once the download completes.
    pub fn final_path(&self) -> PathBuf {
        self.dir_path.join(&self.file_name)
    }

    /// Partial data file the worker writes into.
    pub fn temporary_path(&self) -> PathBuf {
        temporary_path(&self.dir_path, &self.file_name)
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically moves `from -> to`. Returns false if the record was not in `from`.
    pub fn transition(&self, from: Status, to: Status) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> Option<u64> {
        match self.total_bytes.load(Ordering::Acquire) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    pub fn set_total_bytes(&self, total: Option<u64>) {
        self.total_bytes
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Release);
    }

    /// Positions progress at the offset a run starts from. Only a full
    /// restart passes an offset below the current value.
    pub fn begin_at(&self, offset: u64) {
        self.downloaded_bytes.store(offset, Ordering::Release);
    }

    pub fn add_downloaded(&self, bytes: u64) -> u64 {
        self.downloaded_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    pub fn etag(&self) -> Option<String> {
        self.etag
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_etag(&self, etag: Option<String>) {
        *self.etag.lock().unwrap_or_else(PoisonError::into_inner) = etag;
    }

    /// Installs fresh stop signals for a new execution and returns them.
    pub fn install_control(&self) -> RunControl {
        let control = RunControl::default();
        *self.control.lock().unwrap_or_else(PoisonError::into_inner) = Some(control.clone());
        control
    }

    pub fn control(&self) -> Option<RunControl> {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_resume_after_pause(&self) {
        self.resume_requested.store(true, Ordering::Release);
    }

    pub fn take_resume_request(&self) -> bool {
        self.resume_requested.swap(false, Ordering::AcqRel)
    }

    /// Returns true exactly once per record; callers deliver the terminal event only then.
    pub fn mark_terminal_delivered(&self) -> bool {
        !self.terminal_delivered.swap(true, Ordering::AcqRel)
    }

    pub fn listeners(&self) -> Listeners {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace_listeners(&self, listeners: Listeners) {
        *self.listeners.lock().unwrap_or_else(PoisonError::into_inner) = listeners;
    }

    /// Clears every listener handle, handing them to the caller.
    pub fn take_listeners(&self) -> Listeners {
        std::mem::take(&mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            id: self.id,
            status: self.status(),
            downloaded_bytes: self.downloaded_bytes(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Control record describing the last checkpoint of this download.
    pub fn to_model(&self) -> DownloadModel {
        DownloadModel {
            version: MODEL_VERSION,
            id: self.id,
            url: self.url.clone(),
            dir_path: self.dir_path.clone(),
            file_name: self.file_name.clone(),
            etag: self.etag(),
            total_bytes: self.total_bytes(),
            downloaded_bytes: self.downloaded_bytes(),
            last_modified_at: unix_now(),
        }
    }
}

fn default_model_version() -> u32 {
    MODEL_VERSION
}

/// Persisted control record for one partially downloaded file.
/// This struct is designed to be serialized to the state database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadModel {
    #[serde(default = "default_model_version")]
    pub version: u32,
    pub id: DownloadId,
    pub url: String,
    pub dir_path: PathBuf,
    pub file_name: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    /// Seconds since the unix epoch.
    #[serde(default)]
    pub last_modified_at: u64,
}

impl DownloadModel {
    /// Whether this checkpoint can be trusted to resume `record`.
    pub fn matches(&self, record: &RequestRecord) -> bool {
        self.version <= MODEL_VERSION
            && self.id == record.id()
            && self.url == record.url()
            && self.dir_path == record.dir_path()
            && self.file_name == record.file_name()
            && self.total_bytes.map_or(true, |total| self.downloaded_bytes <= total)
    }

    pub fn temporary_path(&self) -> PathBuf {
        temporary_path(&self.dir_path, &self.file_name)
    }
}

/// e.g. for "/path/to" and "file.zip" it returns "/path/to/file.zip.temp".
pub fn temporary_path(dir_path: &Path, file_name: &str) -> PathBuf {
    dir_path.join(format!("{file_name}.temp"))
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str) -> RequestRecord {
        RequestRecord::new(
            DownloadRequest::new(url, "/tmp/downloads", "file.bin"),
            &EngineConfig::default(),
        )
    }

    #[test]
    fn test_download_id_is_deterministic() {
        let a = DownloadId::from_parts("http://host/a", Path::new("/data"), "a.bin");
        let b = DownloadId::from_parts("http://host/a", Path::new("/data"), "a.bin");
        assert_eq!(a, b);
    }

    #[test]
    fn test_download_id_depends_on_every_component() {
        let base = DownloadId::from_parts("http://host/a", Path::new("/data"), "a.bin");
        assert_ne!(base, DownloadId::from_parts("http://host/b", Path::new("/data"), "a.bin"));
        assert_ne!(base, DownloadId::from_parts("http://host/a", Path::new("/other"), "a.bin"));
        assert_ne!(base, DownloadId::from_parts("http://host/a", Path::new("/data"), "b.bin"));
        // Separators keep shifted boundaries apart.
        assert_ne!(
            DownloadId::from_parts("ab", Path::new("c"), "d"),
            DownloadId::from_parts("a", Path::new("bc"), "d"),
        );
    }

    #[test]
    fn test_priority_order_and_parse() {
        assert!(Priority::Immediate > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_request_inherits_config_timeouts() {
        let config = EngineConfig {
            read_timeout_ms: 1_500,
            ..EngineConfig::default()
        };
        let inherited = RequestRecord::new(DownloadRequest::new("http://h/x", "/d", "x"), &config);
        assert_eq!(inherited.read_timeout(), Duration::from_millis(1_500));

        let explicit = RequestRecord::new(
            DownloadRequest::new("http://h/x", "/d", "x").read_timeout(Duration::from_secs(3)),
            &config,
        );
        assert_eq!(explicit.read_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_validate_rejects_paths_in_file_name() {
        assert!(DownloadRequest::new("http://h/x", "/d", "ok.bin").validate().is_ok());
        assert_eq!(
            DownloadRequest::new("http://h/x", "/d", "a/b").validate(),
            Err(RequestError::PathInFileName("a/b".to_string()))
        );
        assert_eq!(
            DownloadRequest::new("", "/d", "x").validate(),
            Err(RequestError::EmptyUrl)
        );
        assert_eq!(
            DownloadRequest::new("http://h/x", "/d", "..").validate(),
            Err(RequestError::InvalidFileName("..".to_string()))
        );
    }

    #[test]
    fn test_transition_is_compare_and_swap() {
        let record = record("http://host/file");
        assert_eq!(record.status(), Status::Created);
        assert!(record.transition(Status::Created, Status::Queued));
        assert!(!record.transition(Status::Created, Status::Queued));
        assert!(record.transition(Status::Queued, Status::Running));
        assert_eq!(record.status(), Status::Running);
    }

    #[test]
    fn test_sequence_assigned_once() {
        let record = record("http://host/file");
        assert_eq!(record.sequence(), None);
        assert_eq!(record.assign_sequence(7), 7);
        assert_eq!(record.assign_sequence(9), 7);
        assert_eq!(record.sequence(), Some(7));
    }

    #[test]
    fn test_terminal_marked_once() {
        let record = record("http://host/file");
        assert!(record.mark_terminal_delivered());
        assert!(!record.mark_terminal_delivered());
    }

    #[test]
    fn test_unknown_total_snapshot() {
        let record = record("http://host/file");
        record.add_downloaded(10);
        let snapshot = record.snapshot();
        assert_eq!(snapshot.total_bytes, None);
        assert_eq!(snapshot.progress(), None);

        record.set_total_bytes(Some(40));
        assert_eq!(record.snapshot().progress(), Some(0.25));
    }

    #[test]
    fn test_model_rejects_mismatched_or_newer_layout() {
        let record = record("http://host/file");
        record.set_total_bytes(Some(100));
        record.add_downloaded(40);
        let model = record.to_model();
        assert!(model.matches(&record));

        let moved = DownloadModel {
            url: "http://host/other".to_string(),
            ..model.clone()
        };
        assert!(!moved.matches(&record));

        let newer = DownloadModel {
            version: MODEL_VERSION + 1,
            ..model
        };
        assert!(!newer.matches(&record));
    }

    #[test]
    fn test_model_reads_older_layout() {
        let json = r#"{"id":5,"url":"u","dir_path":"/d","file_name":"f","downloaded_bytes":3}"#;
        let model: DownloadModel = serde_json::from_str(json).unwrap();
        assert_eq!(model.version, MODEL_VERSION);
        assert_eq!(model.total_bytes, None);
        assert_eq!(model.temporary_path(), PathBuf::from("/d/f.temp"));
    }
}
