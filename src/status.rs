//! StatusHub — process-wide observable state behind a single coarse lock.
//!
//! Every pipeline stage reports here; the dashboard process and the logs
//! read consistent snapshots. Update frequency is one write per pipeline
//! step, so a single Mutex is plenty — no per-field locking.

use crate::track::Track;
use chrono::Local;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const LOG_BUFFER_MAX: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Per-provider call accounting.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProviderStats {
    pub calls: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

/// Currently tracked play, as exposed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentTrack {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub confidence: f32,
    pub provider: String,
    pub since: String,
}

/// Consistent point-in-time view of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub uptime_secs: u64,
    pub current_track: Option<CurrentTrack>,
    pub last_recognition_latency_ms: Option<u64>,
    pub windows_sampled: u64,
    pub windows_silent: u64,
    pub tracks_recognized: u64,
    pub duplicates_suppressed: u64,
    pub scrobbles_submitted: u64,
    pub queue_depth: usize,
    pub dead_letter_count: usize,
    pub last_submission: Option<String>,
    /// Set when durable queue writes start failing at runtime.
    pub durability_degraded: bool,
    pub providers: BTreeMap<String, ProviderStats>,
    /// Last error per subsystem ("capture", "recognition", "queue", ...).
    pub last_errors: BTreeMap<String, String>,
    pub recent_log: Vec<LogEntry>,
}

struct StatusInner {
    running: bool,
    started_at: Instant,
    current_track: Option<CurrentTrack>,
    last_latency: Option<Duration>,
    windows_sampled: u64,
    windows_silent: u64,
    tracks_recognized: u64,
    duplicates_suppressed: u64,
    scrobbles_submitted: u64,
    queue_depth: usize,
    dead_letter_count: usize,
    last_submission: Option<String>,
    durability_degraded: bool,
    providers: BTreeMap<String, ProviderStats>,
    last_errors: BTreeMap<String, String>,
    log: VecDeque<LogEntry>,
}

/// Cloneable handle to the shared status state.
#[derive(Clone)]
pub struct StatusHub {
    inner: Arc<Mutex<StatusInner>>,
}

impl StatusHub {
    pub fn new() -> Self {
        StatusHub {
            inner: Arc::new(Mutex::new(StatusInner {
                running: true,
                started_at: Instant::now(),
                current_track: None,
                last_latency: None,
                windows_sampled: 0,
                windows_silent: 0,
                tracks_recognized: 0,
                duplicates_suppressed: 0,
                scrobbles_submitted: 0,
                queue_depth: 0,
                dead_letter_count: 0,
                last_submission: None,
                durability_degraded: false,
                providers: BTreeMap::new(),
                last_errors: BTreeMap::new(),
                log: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        // A poisoned status lock means a panicked writer; the data is still
        // valid for observation.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a log line (also echoed to stderr for the journal).
    pub fn log(&self, level: &str, message: String) {
        eprintln!("[{}] {}", level, message);
        let mut inner = self.lock();
        inner.log.push_back(LogEntry {
            timestamp: Local::now().format("%H:%M:%S").to_string(),
            level: level.to_string(),
            message,
        });
        while inner.log.len() > LOG_BUFFER_MAX {
            inner.log.pop_front();
        }
    }

    pub fn set_running(&self, running: bool) {
        self.lock().running = running;
    }

    pub fn record_window(&self, silent: bool) {
        let mut inner = self.lock();
        inner.windows_sampled += 1;
        if silent {
            inner.windows_silent += 1;
        }
    }

    pub fn record_provider_call(&self, provider: &str, error: Option<&str>) {
        let mut inner = self.lock();
        let stats = inner.providers.entry(provider.to_string()).or_default();
        stats.calls += 1;
        if let Some(err) = error {
            stats.errors += 1;
            stats.last_error = Some(err.to_string());
        }
    }

    pub fn record_recognition(&self, latency: Duration) {
        let mut inner = self.lock();
        inner.last_latency = Some(latency);
        inner.tracks_recognized += 1;
    }

    pub fn set_current_track(&self, track: &Track) {
        self.lock().current_track = Some(CurrentTrack {
            artist: track.artist.clone(),
            title: track.title.clone(),
            album: track.album.clone(),
            confidence: track.confidence,
            provider: track.provider.clone(),
            since: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        });
    }

    pub fn clear_current_track(&self) {
        self.lock().current_track = None;
    }

    pub fn record_suppressed(&self) {
        self.lock().duplicates_suppressed += 1;
    }

    pub fn set_queue_depth(&self, pending: usize, dead_letter: usize) {
        let mut inner = self.lock();
        inner.queue_depth = pending;
        inner.dead_letter_count = dead_letter;
    }

    pub fn record_submission(&self, outcome: &str, success: bool) {
        let mut inner = self.lock();
        inner.last_submission = Some(outcome.to_string());
        if success {
            inner.scrobbles_submitted += 1;
        }
    }

    pub fn set_durability_degraded(&self) {
        self.lock().durability_degraded = true;
    }

    pub fn subsystem_error(&self, subsystem: &str, error: String) {
        self.lock()
            .last_errors
            .insert(subsystem.to_string(), error);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            running: inner.running,
            uptime_secs: inner.started_at.elapsed().as_secs(),
            current_track: inner.current_track.clone(),
            last_recognition_latency_ms: inner.last_latency.map(|d| d.as_millis() as u64),
            windows_sampled: inner.windows_sampled,
            windows_silent: inner.windows_silent,
            tracks_recognized: inner.tracks_recognized,
            duplicates_suppressed: inner.duplicates_suppressed,
            scrobbles_submitted: inner.scrobbles_submitted,
            queue_depth: inner.queue_depth,
            dead_letter_count: inner.dead_letter_count,
            last_submission: inner.last_submission.clone(),
            durability_degraded: inner.durability_degraded,
            providers: inner.providers.clone(),
            last_errors: inner.last_errors.clone(),
            recent_log: inner.log.iter().cloned().collect(),
        }
    }

    /// Export the snapshot as JSON for the dashboard process.
    pub fn write_json(&self, path: &Path) -> Result<(), String> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| format!("Serialize status failed: {}", e))?;
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(path, json)
            .map_err(|e| format!("Failed to write status to '{}': {}", path.display(), e))
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
