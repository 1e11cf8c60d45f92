//! DuplicateGuard — decides whether a recognition is a new play or the
//! same record still spinning.
//!
//! Recognition is polled repeatedly while one physical track plays, so
//! accepting every positive result would scrobble the same song many times.
//! The guard holds at most one active PlayState and is only ever driven
//! from the capture loop thread, so transitions are total-ordered by
//! sampling tick.

use crate::track::Track;
use std::time::{Duration, Instant};

/// Outcome of considering a recognized track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// New scrobble candidate: enqueue it.
    Accept,
    /// Same ongoing play (or too low confidence): drop it.
    Suppress,
}

/// The track currently believed to be playing.
#[derive(Debug, Clone)]
pub struct PlayState {
    pub track: Track,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// How many times this play has been reconfirmed since first_seen.
    pub confirmations: u32,
}

pub struct DuplicateGuard {
    state: Option<PlayState>,
    min_confidence: f32,
    dedup_window: Duration,
    stale_timeout: Duration,
}

impl DuplicateGuard {
    pub fn new(min_confidence: f32, dedup_window: Duration, stale_timeout: Duration) -> Self {
        DuplicateGuard {
            state: None,
            min_confidence,
            dedup_window,
            stale_timeout,
        }
    }

    /// Consider a recognized track at time `now`.
    ///
    /// Confidence below the floor is always suppressed, regardless of
    /// whether it matches the active play — low-confidence flickers must
    /// not move the tracked song.
    pub fn consider(&mut self, track: &Track, now: Instant) -> Decision {
        self.expire_if_stale(now);

        if track.confidence < self.min_confidence {
            return Decision::Suppress;
        }

        match &mut self.state {
            None => {
                self.state = Some(PlayState {
                    track: track.clone(),
                    first_seen: now,
                    last_seen: now,
                    confirmations: 0,
                });
                Decision::Accept
            }
            Some(current) => {
                let same = current.track.normalized_key() == track.normalized_key();
                let within_window =
                    now.saturating_duration_since(current.last_seen) <= self.dedup_window;

                if same && within_window {
                    current.last_seen = now;
                    current.confirmations += 1;
                    Decision::Suppress
                } else {
                    // Either a side change (different track) or the same
                    // record dropped again past the dedup window: both are
                    // legitimate new plays.
                    self.state = Some(PlayState {
                        track: track.clone(),
                        first_seen: now,
                        last_seen: now,
                        confirmations: 0,
                    });
                    Decision::Accept
                }
            }
        }
    }

    /// Feed a tick with no recognition (silence or no provider match).
    /// Ends the active play once the stale timeout elapses.
    pub fn note_no_match(&mut self, now: Instant) {
        self.expire_if_stale(now);
    }

    /// The active play, if any.
    pub fn current(&self) -> Option<&PlayState> {
        self.state.as_ref()
    }

    fn expire_if_stale(&mut self, now: Instant) {
        if let Some(current) = &self.state {
            if now.saturating_duration_since(current.last_seen) > self.stale_timeout {
                self.state = None;
            }
        }
    }
}
