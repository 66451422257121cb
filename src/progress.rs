// src/progress.rs

use std::time::{Duration, Instant};

/// Coalesces progress notifications so a fast stream does not flood listeners.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// The first call always emits.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

/// Decides when buffered writes are forced durable mid-stream.
///
/// A checkpoint is due once both enough bytes and enough time have
/// accumulated since the previous one.
pub struct SyncSchedule {
    min_bytes: u64,
    min_interval: Duration,
    pending_bytes: u64,
    last_sync: Instant,
}

impl SyncSchedule {
    pub fn new(min_bytes: u64, min_interval: Duration) -> Self {
        Self {
            min_bytes,
            min_interval,
            pending_bytes: 0,
            last_sync: Instant::now(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.pending_bytes += bytes;
    }

    pub fn is_due(&self) -> bool {
        self.pending_bytes >= self.min_bytes && self.last_sync.elapsed() >= self.min_interval
    }

    pub fn synced(&mut self) {
        self.pending_bytes = 0;
        self.last_sync = Instant::now();
    }
}
