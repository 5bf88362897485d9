//! Run progress counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Error messages retained for the status snapshot
const MAX_RETAINED_ERRORS: usize = 20;

/// Point-in-time copy of the run counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub artifacts_discovered: u64,
    pub artifacts_downloaded: u64,
    pub bytes_downloaded: u64,
    pub artifacts_skipped: u64,
    pub artifacts_extracted: u64,
    pub rows_received: u64,
    pub rows_enriched: u64,
    pub rows_written: u64,
    pub chunks_written: u64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
}

#[derive(Debug, Default)]
struct Details {
    latest_artifact: Option<String>,
    error_messages: Vec<String>,
}

/// Lock-free counters plus a lock for the non-numeric fields.
///
/// Broadcasts are rate limited: [`StatusTracker::should_broadcast`] returns
/// true at most once per interval unless forced.
#[derive(Debug)]
pub struct StatusTracker {
    discovered: AtomicU64,
    downloaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    skipped: AtomicU64,
    extracted: AtomicU64,
    rows_received: AtomicU64,
    rows_enriched: AtomicU64,
    rows_written: AtomicU64,
    chunks_written: AtomicU64,
    errors: AtomicU64,
    details: Mutex<Details>,
    interval: Duration,
    last_broadcast: Mutex<Option<Instant>>,
}

impl StatusTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            discovered: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            extracted: AtomicU64::new(0),
            rows_received: AtomicU64::new(0),
            rows_enriched: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            chunks_written: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            details: Mutex::new(Details::default()),
            interval,
            last_broadcast: Mutex::new(None),
        }
    }

    pub fn on_discovered(&self, name: &str) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
        self.details().latest_artifact = Some(name.to_string());
    }

    pub fn on_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn on_extracted(&self) {
        self.extracted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_row_received(&self) {
        self.rows_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_row_enriched(&self) {
        self.rows_enriched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_chunk_written(&self, rows: u64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_error(&self, message: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut details = self.details();
        if details.error_messages.len() < MAX_RETAINED_ERRORS {
            details.error_messages.push(message.into());
        }
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let details = self.details();
        StatusSnapshot {
            artifacts_discovered: self.discovered.load(Ordering::Relaxed),
            artifacts_downloaded: self.downloaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            artifacts_skipped: self.skipped.load(Ordering::Relaxed),
            artifacts_extracted: self.extracted.load(Ordering::Relaxed),
            rows_received: self.rows_received.load(Ordering::Relaxed),
            rows_enriched: self.rows_enriched.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            latest_artifact: details.latest_artifact.clone(),
            error_messages: details.error_messages.clone(),
        }
    }

    /// Claim the next broadcast slot
    pub fn should_broadcast(&self, force: bool) -> bool {
        let mut last = self
            .last_broadcast
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.duration_since(at) >= self.interval,
            None => true,
        };
        if due || force {
            *last = Some(now);
            true
        } else {
            false
        }
    }

    fn details(&self) -> std::sync::MutexGuard<'_, Details> {
        self.details.lock().unwrap_or_else(|e| e.into_inner())
    }
}
