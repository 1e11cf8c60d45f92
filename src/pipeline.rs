//! Pipeline assembly and lifecycle.
//!
//! Wires capture, recognition, duplicate guarding, the durable queue, and
//! submission into the running service. The capture side runs on its own
//! thread (the cpal stream handle is not Send, so the Sampler is opened on
//! that thread); the queue drains on another. All cross-thread state goes
//! through the StatusHub and the ScrobbleQueue.

use crate::audd::AuddProvider;
use crate::capture::Sampler;
use crate::config::Config;
use crate::dedup::{Decision, DuplicateGuard};
use crate::queue::{RetryConfig, ScrobbleEntry, ScrobbleQueue};
use crate::recognizer::{RecognitionProvider, Recognizer};
use crate::shazam::ShazamProvider;
use crate::status::StatusHub;
use crate::submitter::LastfmSubmitter;
use crate::window::AudioWindow;
use chrono::Local;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Build the ordered provider chain from configuration. Order in the config
/// file is priority order.
pub fn build_providers(config: &Config) -> Result<Vec<Box<dyn RecognitionProvider>>, String> {
    let mut providers: Vec<Box<dyn RecognitionProvider>> = Vec::new();
    for entry in &config.providers {
        match entry.name.as_str() {
            "audd" => providers.push(Box::new(AuddProvider::new(entry)?)),
            "shazam" => providers.push(Box::new(ShazamProvider::new(entry)?)),
            other => eprintln!("[Pipeline] Warning: unknown provider '{}' ignored", other),
        }
    }
    Ok(providers)
}

/// One window's worth of pipeline: recognize, guard, enqueue.
/// Separated from the capture thread so headless tests can drive it
/// window by window.
pub struct PlayTracker {
    recognizer: Recognizer,
    guard: DuplicateGuard,
    queue: ScrobbleQueue,
    status: StatusHub,
}

impl PlayTracker {
    pub fn new(
        recognizer: Recognizer,
        guard: DuplicateGuard,
        queue: ScrobbleQueue,
        status: StatusHub,
    ) -> Self {
        PlayTracker {
            recognizer,
            guard,
            queue,
            status,
        }
    }

    /// Process one captured window at time `now`.
    pub fn process_window(&mut self, window: &AudioWindow, now: Instant) {
        self.status.record_window(window.silent);

        match self.recognizer.recognize(window) {
            Some(track) => match self.guard.consider(&track, now) {
                Decision::Accept => {
                    self.status.set_current_track(&track);
                    self.status
                        .log("Pipeline", format!("New play: {}", track.display()));
                    self.queue
                        .enqueue(ScrobbleEntry::new(track, Local::now().timestamp()));
                }
                Decision::Suppress => {
                    self.status.record_suppressed();
                }
            },
            None => {
                self.guard.note_no_match(now);
                if self.guard.current().is_none() {
                    self.status.clear_current_track();
                }
            }
        }
    }
}

/// Handle to a running pipeline. Dropping it without stop() leaves the
/// threads running; callers own the shutdown ordering.
pub struct PipelineHandle {
    running: Arc<AtomicBool>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
    drain: Option<crate::queue::DrainHandle>,
    status: StatusHub,
    status_path: PathBuf,
}

impl PipelineHandle {
    /// Stop capture first so no new entries appear, then the drain loop.
    /// Queued entries that did not drain stay on disk for the next run.
    pub fn stop(mut self) {
        self.status.log("Pipeline", "Shutting down".to_string());
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        if let Some(drain) = self.drain.take() {
            drain.stop();
        }
        self.status.set_running(false);
        if let Err(e) = self.status.write_json(&self.status_path) {
            eprintln!("[Pipeline] {}", e);
        }
    }

    pub fn status(&self) -> &StatusHub {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Start the full pipeline. Fails fast on the startup-fatal conditions:
/// no usable input device, corrupt queue state.
pub fn start(config: Config, status: StatusHub) -> Result<PipelineHandle, String> {
    let providers = build_providers(&config)?;
    if !providers.iter().any(|p| p.enabled()) {
        eprintln!("[Pipeline] Warning: no recognition provider is enabled");
    }

    let queue = ScrobbleQueue::open(&config.state_dir(), status.clone())?;

    let drain = if config.lastfm.enabled {
        let submitter = LastfmSubmitter::new(&config.lastfm)?;
        Some(queue.spawn_drain(
            Box::new(submitter),
            RetryConfig::from_config(&config.queue),
        ))
    } else {
        status.log(
            "Pipeline",
            "Submission disabled; recognized plays will queue up".to_string(),
        );
        None
    };

    let running = Arc::new(AtomicBool::new(true));
    let status_path = config.status_path();

    // The Sampler must be opened on the capture thread, but device failures
    // are startup-fatal, so the thread reports its open result back.
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();
    let capture_thread = {
        let running = running.clone();
        let status = status.clone();
        let queue = queue.clone();
        let status_path = status_path.clone();
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let mut sampler = match Sampler::open(&config, running.clone()) {
                    Ok(sampler) => {
                        let _ = ready_tx.send(Ok(()));
                        sampler
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                let recognizer = Recognizer::new(providers, config.min_confidence, status.clone());
                let guard = DuplicateGuard::new(
                    config.min_confidence,
                    std::time::Duration::from_secs(config.dedup_window_secs),
                    std::time::Duration::from_secs(config.stale_timeout_secs),
                );
                let mut tracker = PlayTracker::new(recognizer, guard, queue, status.clone());

                capture_loop(&mut sampler, &mut tracker, &status, &status_path, &running);
            })
            .map_err(|e| format!("Failed to spawn capture thread: {}", e))?
    };

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            running.store(false, Ordering::Relaxed);
            let _ = capture_thread.join();
            if let Some(drain) = drain {
                drain.stop();
            }
            return Err(format!("Capture startup failed: {}", e));
        }
        Err(_) => {
            return Err("Capture thread died during startup".to_string());
        }
    }

    status.log("Pipeline", "Started".to_string());
    Ok(PipelineHandle {
        running,
        capture_thread: Some(capture_thread),
        drain,
        status,
        status_path,
    })
}

fn capture_loop(
    sampler: &mut Sampler,
    tracker: &mut PlayTracker,
    status: &StatusHub,
    status_path: &PathBuf,
    running: &Arc<AtomicBool>,
) {
    loop {
        match sampler.next_window() {
            Ok(Some(window)) => {
                tracker.process_window(&window, Instant::now());
                if let Err(e) = status.write_json(status_path) {
                    status.subsystem_error("status", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                // The stream died under us; nothing to capture with.
                status.subsystem_error("capture", e.to_string());
                status.log("Capture", format!("Fatal: {}", e));
                running.store(false, Ordering::Relaxed);
                break;
            }
        }
    }
}
