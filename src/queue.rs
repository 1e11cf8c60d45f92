//! ScrobbleQueue — durable FIFO of confirmed plays awaiting submission.
//!
//! Entries append at the tail (non-blocking, called from the capture loop)
//! and leave from the head only on confirmed submission or exhaustion of
//! the retry budget, in which case they move to a dead-letter record for
//! operator inspection — never silently dropped. Order is preserved across
//! restarts: both files are rewritten after every mutation.

use crate::config::QueueConfig;
use crate::status::StatusHub;
use crate::submitter::{ScrobbleSink, SubmitError};
use crate::track::Track;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PENDING_FILE: &str = "queue.json";
const DEAD_LETTER_FILE: &str = "dead_letter.json";

/// A confirmed play awaiting submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrobbleEntry {
    pub track: Track,
    /// Unix timestamp of the moment the play was recognized.
    pub recognized_at: i64,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ScrobbleEntry {
    pub fn new(track: Track, recognized_at: i64) -> Self {
        ScrobbleEntry {
            track,
            recognized_at,
            attempt_count: 0,
            last_error: None,
        }
    }
}

/// An entry permanently removed from active retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: ScrobbleEntry,
    pub error: String,
    /// "YYYY-MM-DD HH:MM:SS" local time.
    pub failed_at: String,
}

/// Retry/backoff parameters for the drain loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Idle poll interval when the queue is empty.
    pub poll_interval: Duration,
    /// Upper bound on entries submitted in one batched call.
    pub batch_limit: usize,
}

impl RetryConfig {
    pub fn from_config(config: &QueueConfig) -> Self {
        RetryConfig {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            poll_interval: Duration::from_millis(500),
            batch_limit: 10,
        }
    }
}

/// Exponential backoff for the Nth attempt (1-based), capped.
/// Deterministic; the drain loop adds jitter on top.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let delay = base.saturating_mul(1u32 << shift);
    delay.min(cap)
}

struct QueueInner {
    pending: VecDeque<ScrobbleEntry>,
    dead_letter: Vec<DeadLetter>,
    dir: PathBuf,
}

/// Cloneable handle to the durable queue state.
#[derive(Clone)]
pub struct ScrobbleQueue {
    inner: Arc<Mutex<QueueInner>>,
    status: StatusHub,
}

impl ScrobbleQueue {
    /// Open (or create) the durable queue in the given directory.
    /// A corrupt state file is a startup-fatal persistence failure: refusing
    /// to run beats silently discarding someone's listening history.
    pub fn open(dir: &Path, status: StatusHub) -> Result<Self, String> {
        fs::create_dir_all(dir)
            .map_err(|e| format!("Create state dir '{}' failed: {}", dir.display(), e))?;

        let pending = load_json_or_empty(&dir.join(PENDING_FILE))?;
        let dead_letter = load_json_or_empty(&dir.join(DEAD_LETTER_FILE))?;

        let queue = ScrobbleQueue {
            inner: Arc::new(Mutex::new(QueueInner {
                pending,
                dead_letter,
                dir: dir.to_path_buf(),
            })),
            status,
        };
        queue.publish_depth();
        Ok(queue)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a confirmed play at the tail. Non-blocking apart from the
    /// brief state lock; safe to call while the drain loop runs.
    pub fn enqueue(&self, entry: ScrobbleEntry) {
        let mut inner = self.lock();
        inner.pending.push_back(entry);
        self.persist(&inner);
        drop(inner);
        self.publish_depth();
    }

    pub fn depth(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending(&self) -> Vec<ScrobbleEntry> {
        self.lock().pending.iter().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letter.clone()
    }

    /// Operator acknowledgment: drop all dead-letter records.
    pub fn clear_dead_letters(&self) -> Result<usize, String> {
        let mut inner = self.lock();
        let count = inner.dead_letter.len();
        inner.dead_letter.clear();
        save_json(&inner.dir.join(DEAD_LETTER_FILE), &inner.dead_letter)?;
        drop(inner);
        self.publish_depth();
        Ok(count)
    }

    /// Persist both files. Runtime write failures degrade durability but do
    /// not stop the pipeline; the flag stays visible on the dashboard.
    fn persist(&self, inner: &QueueInner) {
        let result = save_json(&inner.dir.join(PENDING_FILE), &inner.pending)
            .and_then(|_| save_json(&inner.dir.join(DEAD_LETTER_FILE), &inner.dead_letter));
        if let Err(e) = result {
            self.status.set_durability_degraded();
            self.status.subsystem_error("queue", format!("persist failed: {}", e));
            self.status.log("Queue", format!("Warning: durability degraded: {}", e));
        }
    }

    fn publish_depth(&self) {
        let (pending, dead) = {
            let inner = self.lock();
            (inner.pending.len(), inner.dead_letter.len())
        };
        self.status.set_queue_depth(pending, dead);
    }

    /// Spawn the drain loop on its own thread.
    pub fn spawn_drain(&self, sink: Box<dyn ScrobbleSink>, retry: RetryConfig) -> DrainHandle {
        let running = Arc::new(AtomicBool::new(true));
        let queue = self.clone();
        let flag = running.clone();

        let handle = std::thread::Builder::new()
            .name("scrobble-drain".into())
            .spawn(move || {
                queue.drain_loop(sink, retry, flag);
            })
            .expect("failed to spawn scrobble-drain thread");

        DrainHandle {
            running,
            thread: Some(handle),
        }
    }

    fn drain_loop(&self, sink: Box<dyn ScrobbleSink>, retry: RetryConfig, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            let batch: Vec<ScrobbleEntry> = {
                let inner = self.lock();
                inner
                    .pending
                    .iter()
                    .take(retry.batch_limit)
                    .cloned()
                    .collect()
            };

            if batch.is_empty() {
                sleep_while_running(&running, retry.poll_interval);
                continue;
            }

            let results = if batch.len() == 1 {
                vec![sink.submit(&batch[0])]
            } else {
                sink.submit_batch(&batch)
            };

            let backoff = self.apply_results(&batch, results, &retry);
            self.publish_depth();

            if let Some(delay) = backoff {
                let jitter = Duration::from_millis(fastrand::u64(0..=delay.as_millis() as u64 / 4 + 1));
                sleep_while_running(&running, delay + jitter);
            }
        }
    }

    /// Fold per-entry outcomes back into the queue, in order. Returns the
    /// backoff delay to sleep when the head remains blocked on a transient
    /// failure. Stops at the first retained entry so nothing is ever
    /// reordered past a blocked head.
    fn apply_results(
        &self,
        batch: &[ScrobbleEntry],
        results: Vec<Result<(), SubmitError>>,
        retry: &RetryConfig,
    ) -> Option<Duration> {
        let mut inner = self.lock();
        let mut backoff = None;

        for (entry, result) in batch.iter().zip(results) {
            match result {
                Ok(()) => {
                    inner.pending.pop_front();
                    self.status
                        .record_submission(&format!("ok: {}", entry.track.display()), true);
                    self.status
                        .log("Queue", format!("Scrobbled {}", entry.track.display()));
                }
                Err(SubmitError::Permanent(msg)) => {
                    if let Some(mut failed) = inner.pending.pop_front() {
                        failed.last_error = Some(msg.clone());
                        inner.dead_letter.push(DeadLetter {
                            entry: failed,
                            error: msg.clone(),
                            failed_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                        });
                    }
                    self.status.record_submission(&format!("permanent: {}", msg), false);
                    self.status.subsystem_error("submission", msg.clone());
                    self.status.log(
                        "Queue",
                        format!("Dead-lettered {}: {}", entry.track.display(), msg),
                    );
                }
                Err(SubmitError::Transient(msg)) => {
                    if let Some(head) = inner.pending.front_mut() {
                        head.attempt_count += 1;
                        head.last_error = Some(msg.clone());

                        if head.attempt_count >= retry.max_attempts {
                            // Retry budget exhausted: reclassified Permanent.
                            let exhausted = format!(
                                "retries exhausted after {} attempts: {}",
                                head.attempt_count, msg
                            );
                            let failed = inner.pending.pop_front().unwrap_or_else(|| entry.clone());
                            inner.dead_letter.push(DeadLetter {
                                entry: failed,
                                error: exhausted.clone(),
                                failed_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                            });
                            self.status.record_submission(&format!("permanent: {}", exhausted), false);
                            self.status.subsystem_error("submission", exhausted);
                        } else {
                            let attempts = head.attempt_count;
                            self.status
                                .record_submission(&format!("transient: {}", msg), false);
                            backoff = Some(backoff_delay(attempts, retry.base_delay, retry.max_delay));
                        }
                    }
                    // The head stays (or was just dead-lettered); entries
                    // behind it must wait their turn.
                    break;
                }
            }
        }

        self.persist(&inner);
        backoff
    }
}

/// Handle to a running drain thread.
pub struct DrainHandle {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DrainHandle {
    /// Stop draining after the in-flight attempt completes.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Sleep in short slices so shutdown is not delayed by a long backoff.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while running.load(Ordering::Relaxed) && remaining > Duration::ZERO {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

fn load_json_or_empty<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T, String> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map_err(|e| format!("Corrupt queue state '{}': {}", path.display(), e)),
        // Only a genuinely absent file starts empty. Any other read failure
        // means existing history we cannot see; proceeding would overwrite it.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(format!(
            "Read queue state '{}' failed: {}",
            path.display(),
            e
        )),
    }
}

fn save_json<T: Serialize>(path: &Path, data: &T) -> Result<(), String> {
    let json = serde_json::to_string(data).map_err(|e| format!("Serialize error: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Write '{}' failed: {}", path.display(), e))
}
