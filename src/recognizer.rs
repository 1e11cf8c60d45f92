//! Recognition orchestration across an ordered provider chain.
//!
//! Providers are polymorphic over one capability: identify a window.
//! Concrete providers differ only in request/response translation; the
//! fall-through, priority, and confidence-floor logic all lives here.

use crate::status::StatusHub;
use crate::track::{RecognitionResult, Track};
use crate::window::AudioWindow;
use std::time::Instant;

/// Failure of a single provider call. Never fatal to the window — the
/// orchestrator logs it and falls through to the next provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    RateLimited,
    AuthFailed,
    /// The provider answered but found no match.
    NoMatch,
    Network(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::RateLimited => write!(f, "rate limited"),
            ProviderError::AuthFailed => write!(f, "authentication failed"),
            ProviderError::NoMatch => write!(f, "no match"),
            ProviderError::Network(e) => write!(f, "network error: {}", e),
        }
    }
}

/// A music recognition service.
pub trait RecognitionProvider: Send {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    /// Identify the track in the given window. Returns the provider's single
    /// best candidate; providers returning several must tie-break internally
    /// (highest confidence, first in provider order on exact ties).
    fn identify(&self, window: &AudioWindow) -> Result<RecognitionResult, ProviderError>;
}

pub struct Recognizer {
    providers: Vec<Box<dyn RecognitionProvider>>,
    /// Minimum confidence for a match to be returned at all.
    accept_floor: f32,
    status: StatusHub,
}

impl Recognizer {
    pub fn new(
        providers: Vec<Box<dyn RecognitionProvider>>,
        accept_floor: f32,
        status: StatusHub,
    ) -> Self {
        Recognizer {
            providers,
            accept_floor,
            status,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Resolve a window to a Track, or None.
    ///
    /// Walks providers in priority order; the first enabled provider whose
    /// match clears the confidence floor wins. Provider errors and
    /// under-floor matches never abort the chain. Silent windows are skipped
    /// outright — no provider calls.
    pub fn recognize(&self, window: &AudioWindow) -> Option<Track> {
        if window.silent {
            return None;
        }

        let mut best_under_floor: Option<RecognitionResult> = None;

        for provider in &self.providers {
            if !provider.enabled() {
                continue;
            }

            let name = provider.name().to_string();
            let started = Instant::now();
            match provider.identify(window) {
                Ok(result) => {
                    self.status.record_provider_call(&name, None);
                    if result.confidence >= self.accept_floor {
                        let latency = started.elapsed();
                        if let Some(track) = result.into_track() {
                            self.status.record_recognition(latency);
                            self.status.log(
                                "Recognize",
                                format!(
                                    "{} matched {} (confidence {:.2}, {} ms)",
                                    name,
                                    track.display(),
                                    track.confidence,
                                    latency.as_millis()
                                ),
                            );
                            return Some(track);
                        }
                        // Match without artist/title is useless; fall through.
                    } else {
                        let better = best_under_floor
                            .as_ref()
                            .map(|b| result.confidence > b.confidence)
                            .unwrap_or(true);
                        if better {
                            best_under_floor = Some(result);
                        }
                    }
                }
                Err(e) => {
                    self.status.record_provider_call(&name, Some(&e.to_string()));
                    if e != ProviderError::NoMatch {
                        self.status.log("Recognize", format!("{} failed: {}", name, e));
                    }
                }
            }
        }

        // The floor applies uniformly: an under-floor match is reported for
        // observability but never returned as a Track.
        if let Some(best) = best_under_floor {
            self.status.subsystem_error(
                "recognition",
                format!(
                    "best match below confidence floor: {} – {} ({:.2} < {:.2}) from {}",
                    best.artist.as_deref().unwrap_or("?"),
                    best.title.as_deref().unwrap_or("?"),
                    best.confidence,
                    self.accept_floor,
                    best.provider
                ),
            );
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::time::Duration;

    /// Scripted provider for orchestration tests.
    struct FakeProvider {
        name: String,
        enabled: bool,
        outcome: Result<(f32, &'static str, &'static str), ProviderError>,
    }

    impl RecognitionProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        fn identify(&self, _window: &AudioWindow) -> Result<RecognitionResult, ProviderError> {
            match &self.outcome {
                Ok((confidence, artist, title)) => Ok(RecognitionResult {
                    provider: self.name.clone(),
                    artist: Some(artist.to_string()),
                    title: Some(title.to_string()),
                    album: None,
                    confidence: *confidence,
                    duration_secs: None,
                    year: None,
                    recognized_at: Local::now(),
                    latency: Duration::from_millis(10),
                }),
                Err(e) => Err(e.clone()),
            }
        }
    }

    fn fake(name: &str, enabled: bool, outcome: Result<(f32, &'static str, &'static str), ProviderError>) -> Box<dyn RecognitionProvider> {
        Box::new(FakeProvider {
            name: name.to_string(),
            enabled,
            outcome,
        })
    }

    fn window() -> AudioWindow {
        AudioWindow::new(vec![0.5; 1000], 1000, 1)
    }

    #[test]
    fn disabled_and_nomatch_providers_are_skipped() {
        // [A disabled, B NoMatch, C 0.9] must resolve to C's track.
        let hub = StatusHub::new();
        let r = Recognizer::new(
            vec![
                fake("a", false, Ok((0.99, "Wrong", "Track"))),
                fake("b", true, Err(ProviderError::NoMatch)),
                fake("c", true, Ok((0.9, "Artist X", "Song Y"))),
            ],
            0.6,
            hub.clone(),
        );
        let track = r.recognize(&window()).unwrap();
        assert_eq!(track.provider, "c");
        assert_eq!(track.artist, "Artist X");

        let snap = hub.snapshot();
        assert!(!snap.providers.contains_key("a"), "disabled provider never called");
        assert_eq!(snap.providers["b"].calls, 1);
        assert_eq!(snap.providers["b"].errors, 1);
    }

    #[test]
    fn provider_error_falls_through_chain() {
        let hub = StatusHub::new();
        let r = Recognizer::new(
            vec![
                fake("a", true, Err(ProviderError::Network("timeout".into()))),
                fake("b", true, Err(ProviderError::RateLimited)),
                fake("c", true, Ok((0.8, "Artist", "Title"))),
            ],
            0.6,
            hub,
        );
        assert_eq!(r.recognize(&window()).unwrap().provider, "c");
    }

    #[test]
    fn first_provider_clearing_floor_wins() {
        let r = Recognizer::new(
            vec![
                fake("a", true, Ok((0.7, "First", "Match"))),
                fake("b", true, Ok((0.99, "Better", "Match"))),
            ],
            0.6,
            StatusHub::new(),
        );
        // Priority order beats raw confidence: a cleared the floor first.
        assert_eq!(r.recognize(&window()).unwrap().provider, "a");
    }

    #[test]
    fn under_floor_matches_are_not_returned() {
        let hub = StatusHub::new();
        let r = Recognizer::new(
            vec![fake("a", true, Ok((0.4, "Quiet", "Flicker")))],
            0.6,
            hub.clone(),
        );
        assert!(r.recognize(&window()).is_none());
        let snap = hub.snapshot();
        assert!(snap.last_errors["recognition"].contains("below confidence floor"));
    }

    #[test]
    fn all_failing_yields_none() {
        let r = Recognizer::new(
            vec![
                fake("a", true, Err(ProviderError::AuthFailed)),
                fake("b", true, Err(ProviderError::NoMatch)),
            ],
            0.6,
            StatusHub::new(),
        );
        assert!(r.recognize(&window()).is_none());
    }

    #[test]
    fn silent_windows_skip_all_providers() {
        let hub = StatusHub::new();
        let r = Recognizer::new(
            vec![fake("a", true, Ok((0.9, "Artist", "Title")))],
            0.6,
            hub.clone(),
        );
        let mut w = window();
        w.silent = true;
        assert!(r.recognize(&w).is_none());
        assert!(hub.snapshot().providers.is_empty(), "no provider calls for silence");
    }

    #[test]
    fn empty_provider_list_yields_none() {
        let r = Recognizer::new(Vec::new(), 0.6, StatusHub::new());
        assert!(r.recognize(&window()).is_none());
    }
}
