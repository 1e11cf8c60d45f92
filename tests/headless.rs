//! Headless integration tests for needledrop.
//!
//! These exercise the pipeline end-to-end without a sound card or any
//! network service: audio windows come from a channel-fed Sampler or are
//! synthesized directly, recognition providers are scripted fakes, and the
//! scrobble sink records what it receives.

use chrono::Local;
use needledrop::capture::Sampler;
use needledrop::dedup::DuplicateGuard;
use needledrop::pipeline::PlayTracker;
use needledrop::queue::{RetryConfig, ScrobbleEntry, ScrobbleQueue};
use needledrop::recognizer::{ProviderError, RecognitionProvider, Recognizer};
use needledrop::status::StatusHub;
use needledrop::submitter::{ScrobbleSink, SubmitError};
use needledrop::track::{RecognitionResult, Track};
use needledrop::window::AudioWindow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ── Test doubles ──────────────────────────────────────────────────────────

/// Provider that answers from a queue of scripted outcomes, repeating the
/// last one once the script runs out.
struct ScriptedProvider {
    name: &'static str,
    script: Mutex<VecDeque<Result<(f32, String, String), ProviderError>>>,
    last: Mutex<Option<Result<(f32, String, String), ProviderError>>>,
}

impl ScriptedProvider {
    fn new(
        name: &'static str,
        script: Vec<Result<(f32, &str, &str), ProviderError>>,
    ) -> Box<Self> {
        let script = script
            .into_iter()
            .map(|r| r.map(|(c, a, t)| (c, a.to_string(), t.to_string())))
            .collect();
        Box::new(ScriptedProvider {
            name,
            script: Mutex::new(script),
            last: Mutex::new(None),
        })
    }
}

impl RecognitionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn identify(&self, _window: &AudioWindow) -> Result<RecognitionResult, ProviderError> {
        let outcome = match self.script.lock().unwrap().pop_front() {
            Some(outcome) => {
                *self.last.lock().unwrap() = Some(outcome.clone());
                outcome
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Err(ProviderError::NoMatch)),
        };
        outcome.map(|(confidence, artist, title)| RecognitionResult {
            provider: self.name.to_string(),
            artist: Some(artist),
            title: Some(title),
            album: None,
            confidence,
            duration_secs: None,
            year: None,
            recognized_at: Local::now(),
            latency: Duration::from_millis(5),
        })
    }
}

/// Sink recording successful submissions, with an optional failure script.
struct RecordingSink {
    failures: Mutex<VecDeque<SubmitError>>,
    submitted: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    fn new(failures: Vec<SubmitError>) -> (Box<Self>, Arc<Mutex<Vec<String>>>) {
        let submitted = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(RecordingSink {
                failures: Mutex::new(failures.into()),
                submitted: submitted.clone(),
            }),
            submitted,
        )
    }
}

impl ScrobbleSink for RecordingSink {
    fn submit(&self, entry: &ScrobbleEntry) -> Result<(), SubmitError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.submitted
            .lock()
            .unwrap()
            .push(entry.track.display());
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn loud_window() -> AudioWindow {
    let mut w = AudioWindow::new(vec![0.5; 4410], 44100, 1);
    w.tag_silence(0.01);
    w
}

fn silent_window() -> AudioWindow {
    let mut w = AudioWindow::new(vec![0.0001; 4410], 44100, 1);
    w.tag_silence(0.01);
    w
}

fn tracker(
    providers: Vec<Box<dyn RecognitionProvider>>,
    queue: ScrobbleQueue,
    status: StatusHub,
) -> PlayTracker {
    let recognizer = Recognizer::new(providers, 0.6, status.clone());
    let guard = DuplicateGuard::new(0.6, Duration::from_secs(480), Duration::from_secs(120));
    PlayTracker::new(recognizer, guard, queue, status)
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        batch_limit: 10,
    }
}

fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ── Window to queue ───────────────────────────────────────────────────────

#[test]
fn repeated_recognitions_of_one_spin_queue_once() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    let provider = ScriptedProvider::new("fake", vec![Ok((0.9, "Miles Davis", "So What"))]);
    let mut tracker = tracker(vec![provider], queue.clone(), status.clone());

    // Five consecutive windows of the same track playing.
    let t0 = Instant::now();
    for i in 0..5 {
        tracker.process_window(&loud_window(), t0 + Duration::from_secs(i * 12));
    }

    assert_eq!(queue.depth(), 1, "one spin is one scrobble");
    let snap = status.snapshot();
    assert_eq!(snap.tracks_recognized, 5);
    assert_eq!(snap.duplicates_suppressed, 4);
    assert_eq!(
        snap.current_track.as_ref().map(|t| t.title.as_str()),
        Some("So What")
    );
}

#[test]
fn side_change_queues_a_second_play() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    let provider = ScriptedProvider::new(
        "fake",
        vec![
            Ok((0.9, "Miles Davis", "So What")),
            Ok((0.9, "Miles Davis", "So What")),
            Ok((0.9, "Miles Davis", "Freddie Freeloader")),
        ],
    );
    let mut tracker = tracker(vec![provider], queue.clone(), status);

    let t0 = Instant::now();
    tracker.process_window(&loud_window(), t0);
    tracker.process_window(&loud_window(), t0 + Duration::from_secs(12));
    tracker.process_window(&loud_window(), t0 + Duration::from_secs(24));

    let pending = queue.pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].track.title, "So What");
    assert_eq!(pending[1].track.title, "Freddie Freeloader");
}

#[test]
fn silence_and_no_match_queue_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    let provider = ScriptedProvider::new("fake", vec![Err(ProviderError::NoMatch)]);
    let mut tracker = tracker(vec![provider], queue.clone(), status.clone());

    let t0 = Instant::now();
    tracker.process_window(&silent_window(), t0);
    tracker.process_window(&loud_window(), t0 + Duration::from_secs(12));

    assert_eq!(queue.depth(), 0);
    let snap = status.snapshot();
    assert_eq!(snap.windows_sampled, 2);
    assert_eq!(snap.windows_silent, 1);
    // Silent window must not have reached the provider.
    assert_eq!(snap.providers["fake"].calls, 1);
}

#[test]
fn below_floor_matches_never_reach_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    let provider = ScriptedProvider::new("fake", vec![Ok((0.4, "Maybe", "Something"))]);
    let mut tracker = tracker(vec![provider], queue.clone(), status.clone());

    tracker.process_window(&loud_window(), Instant::now());

    assert_eq!(queue.depth(), 0);
    assert!(status.snapshot().last_errors["recognition"].contains("below confidence floor"));
}

#[test]
fn stale_silence_ends_play_and_allows_replay() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    let provider = ScriptedProvider::new(
        "fake",
        vec![
            Ok((0.9, "Miles Davis", "So What")),
            Err(ProviderError::NoMatch),
            Ok((0.9, "Miles Davis", "So What")),
        ],
    );
    let mut tracker = tracker(vec![provider], queue.clone(), status.clone());

    // Dedup window is 480s, stale timeout 120s. Recognize, go silent past
    // the stale timeout, then the same record is dropped again.
    let t0 = Instant::now();
    tracker.process_window(&loud_window(), t0);
    tracker.process_window(&loud_window(), t0 + Duration::from_secs(130));
    assert!(status.snapshot().current_track.is_none(), "play ended by staleness");
    tracker.process_window(&loud_window(), t0 + Duration::from_secs(600));

    assert_eq!(queue.depth(), 2, "needle drop after staleness is a new play");
}

#[test]
fn provider_chain_falls_through_to_backup() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    let primary = ScriptedProvider::new("primary", vec![Err(ProviderError::RateLimited)]);
    let backup = ScriptedProvider::new("backup", vec![Ok((0.85, "Artist", "Title"))]);
    let mut tracker = tracker(vec![primary, backup], queue.clone(), status);

    tracker.process_window(&loud_window(), Instant::now());

    let pending = queue.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].track.provider, "backup");
}

// ── Capture thread to queue ───────────────────────────────────────────────

#[test]
fn channel_fed_sampler_drives_the_tracker() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    let provider = ScriptedProvider::new("fake", vec![Ok((0.9, "Artist", "Title"))]);
    let mut tracker = tracker(vec![provider], queue.clone(), status);

    let (tx, rx) = std::sync::mpsc::channel();
    let running = Arc::new(AtomicBool::new(true));
    // 0.1s windows at 1 kHz mono = 100 samples per window.
    let mut sampler = Sampler::from_channel(rx, 1000, 1, 0.1, 0.01, running.clone());

    tx.send(vec![0.5; 250]).unwrap();
    for _ in 0..2 {
        let window = sampler.next_window().unwrap().unwrap();
        tracker.process_window(&window, Instant::now());
    }
    assert_eq!(queue.depth(), 1);

    running.store(false, Ordering::Relaxed);
    assert!(sampler.next_window().unwrap().is_none());
}

// ── Queue to sink ─────────────────────────────────────────────────────────

#[test]
fn queued_plays_survive_restart_and_drain_in_order() {
    let dir = tempfile::tempdir().unwrap();

    // First run: recognize two plays, never submit.
    {
        let status = StatusHub::new();
        let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
        let provider = ScriptedProvider::new(
            "fake",
            vec![Ok((0.9, "Artist A", "First")), Ok((0.9, "Artist B", "Second"))],
        );
        let mut tracker = tracker(vec![provider], queue, status);
        let t0 = Instant::now();
        tracker.process_window(&loud_window(), t0);
        tracker.process_window(&loud_window(), t0 + Duration::from_secs(12));
    }

    // Second run: the queue reloads and drains in recognition order.
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status).unwrap();
    assert_eq!(queue.depth(), 2);

    let (sink, submitted) = RecordingSink::new(vec![]);
    let handle = queue.spawn_drain(sink, fast_retry());
    assert!(wait_until(|| queue.depth() == 0, Duration::from_secs(3)));
    handle.stop();

    assert_eq!(
        *submitted.lock().unwrap(),
        vec!["Artist A – First", "Artist B – Second"]
    );
}

#[test]
fn transient_outage_retries_without_losing_or_reordering() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    for title in ["One", "Two", "Three"] {
        queue.enqueue(ScrobbleEntry::new(
            Track {
                artist: "Artist".into(),
                title: title.into(),
                album: None,
                confidence: 0.9,
                provider: "fake".into(),
            },
            Local::now().timestamp(),
        ));
    }

    let (sink, submitted) = RecordingSink::new(vec![
        SubmitError::Transient("service offline".into()),
        SubmitError::Transient("service offline".into()),
    ]);
    let handle = queue.spawn_drain(sink, fast_retry());
    assert!(wait_until(|| queue.depth() == 0, Duration::from_secs(3)));
    handle.stop();

    assert_eq!(
        *submitted.lock().unwrap(),
        vec!["Artist – One", "Artist – Two", "Artist – Three"]
    );
    assert!(queue.dead_letters().is_empty());
    assert_eq!(status.snapshot().scrobbles_submitted, 3);
}

#[test]
fn permanent_rejection_dead_letters_and_surfaces_in_status() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    queue.enqueue(ScrobbleEntry::new(
        Track {
            artist: "Artist".into(),
            title: "Rejected".into(),
            album: None,
            confidence: 0.9,
            provider: "fake".into(),
        },
        Local::now().timestamp(),
    ));

    let (sink, _) = RecordingSink::new(vec![SubmitError::Permanent("invalid session".into())]);
    let handle = queue.spawn_drain(sink, fast_retry());
    assert!(wait_until(|| queue.depth() == 0, Duration::from_secs(3)));
    handle.stop();

    assert_eq!(queue.dead_letters().len(), 1);
    let snap = status.snapshot();
    assert_eq!(snap.dead_letter_count, 1);
    assert_eq!(snap.scrobbles_submitted, 0);
    assert!(snap.last_errors["submission"].contains("invalid session"));
}

// ── Status export ─────────────────────────────────────────────────────────

#[test]
fn status_snapshot_exports_pipeline_counters() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusHub::new();
    let queue = ScrobbleQueue::open(dir.path(), status.clone()).unwrap();
    let provider = ScriptedProvider::new("fake", vec![Ok((0.9, "Artist", "Title"))]);
    let mut tracker = tracker(vec![provider], queue, status.clone());

    tracker.process_window(&loud_window(), Instant::now());

    let path = dir.path().join("status.json");
    status.write_json(&path).unwrap();
    let snapshot: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

    assert_eq!(snapshot["windows_sampled"], 1);
    assert_eq!(snapshot["tracks_recognized"], 1);
    assert_eq!(snapshot["queue_depth"], 1);
    assert_eq!(snapshot["current_track"]["title"], "Title");
    assert_eq!(snapshot["durability_degraded"], false);
}
