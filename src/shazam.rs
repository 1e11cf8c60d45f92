//! Shazam-style recognition provider.
//!
//! POSTs the window WAV to a Shazam-compatible recognition gateway and
//! translates the match list. The gateway returns candidates in its own
//! ranked order without numeric scores, so the first candidate is taken
//! at a fixed confidence.

use crate::config::ProviderConfig;
use crate::recognizer::{ProviderError, RecognitionProvider};
use crate::track::RecognitionResult;
use crate::window::AudioWindow;
use chrono::Local;
use serde::Deserialize;
use std::time::{Duration, Instant};

const MATCH_CONFIDENCE: f32 = 0.85;

#[derive(Debug, Deserialize)]
struct ShazamResponse {
    #[serde(default)]
    matches: Vec<ShazamMatch>,
}

#[derive(Debug, Deserialize)]
struct ShazamMatch {
    track: Option<ShazamTrack>,
}

#[derive(Debug, Deserialize)]
struct ShazamTrack {
    /// Track title.
    title: Option<String>,
    /// Artist name (Shazam's naming).
    subtitle: Option<String>,
    #[serde(default)]
    sections: Vec<ShazamSection>,
}

#[derive(Debug, Deserialize)]
struct ShazamSection {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    metadata: Vec<ShazamMetadata>,
}

#[derive(Debug, Deserialize)]
struct ShazamMetadata {
    title: Option<String>,
    text: Option<String>,
}

pub struct ShazamProvider {
    enabled: bool,
    api_key: String,
    api_url: Option<String>,
    client: reqwest::blocking::Client,
}

impl ShazamProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| format!("Shazam HTTP client build failed: {}", e))?;

        Ok(ShazamProvider {
            // This provider has no default public endpoint; it requires an
            // explicit gateway URL in config.
            enabled: config.enabled && config.api_url.is_some(),
            api_key: config.api_key.clone().unwrap_or_default(),
            api_url: config.api_url.clone(),
            client,
        })
    }

    fn parse_response(&self, body: &str, latency: Duration) -> Result<RecognitionResult, ProviderError> {
        let response: ShazamResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::Network(format!("unparseable Shazam response: {}", e)))?;

        // First candidate in the gateway's own ranked order.
        let track = response
            .matches
            .into_iter()
            .find_map(|m| m.track)
            .ok_or(ProviderError::NoMatch)?;

        let (album, year) = extract_song_metadata(&track.sections);

        Ok(RecognitionResult {
            provider: "shazam".to_string(),
            artist: track.subtitle,
            title: track.title,
            album,
            confidence: MATCH_CONFIDENCE,
            duration_secs: None,
            year,
            recognized_at: Local::now(),
            latency,
        })
    }
}

/// Album and release year live in the SONG metadata section.
fn extract_song_metadata(sections: &[ShazamSection]) -> (Option<String>, Option<u32>) {
    let mut album = None;
    let mut year = None;
    for section in sections {
        if section.kind.as_deref() != Some("SONG") {
            continue;
        }
        for item in &section.metadata {
            match item.title.as_deref() {
                Some("Album") => album = item.text.clone(),
                Some("Released") => {
                    year = item
                        .text
                        .as_deref()
                        .and_then(|t| t.get(..4))
                        .and_then(|y| y.parse().ok());
                }
                _ => {}
            }
        }
    }
    (album, year)
}

impl RecognitionProvider for ShazamProvider {
    fn name(&self) -> &str {
        "shazam"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn identify(&self, window: &AudioWindow) -> Result<RecognitionResult, ProviderError> {
        let url = self
            .api_url
            .as_deref()
            .ok_or_else(|| ProviderError::Network("no Shazam gateway URL configured".to_string()))?;

        let wav = window.to_wav_bytes().map_err(ProviderError::Network)?;

        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .header("X-API-Key", &self.api_key)
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::AuthFailed);
        }
        if !status.is_success() {
            return Err(ProviderError::Network(format!("HTTP {}", status)));
        }

        let body = response
            .text()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        self.parse_response(&body, started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ShazamProvider {
        ShazamProvider::new(&ProviderConfig {
            name: "shazam".into(),
            enabled: true,
            api_key: Some("key".into()),
            api_url: Some("http://localhost:9999/recognize".into()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn disabled_without_gateway_url() {
        let p = ShazamProvider::new(&ProviderConfig {
            name: "shazam".into(),
            enabled: true,
            api_key: Some("key".into()),
            api_url: None,
            timeout_secs: 5,
        })
        .unwrap();
        assert!(!p.enabled());
    }

    #[test]
    fn parses_first_match_with_metadata() {
        let body = r#"{
            "matches": [{
                "track": {
                    "title": "So What",
                    "subtitle": "Miles Davis",
                    "sections": [
                        {"type": "SONG", "metadata": [
                            {"title": "Album", "text": "Kind of Blue"},
                            {"title": "Released", "text": "1959"}
                        ]}
                    ]
                }
            }]
        }"#;
        let result = provider().parse_response(body, Duration::from_millis(80)).unwrap();
        assert_eq!(result.artist.as_deref(), Some("Miles Davis"));
        assert_eq!(result.title.as_deref(), Some("So What"));
        assert_eq!(result.album.as_deref(), Some("Kind of Blue"));
        assert_eq!(result.year, Some(1959));
        assert_eq!(result.confidence, MATCH_CONFIDENCE);
    }

    #[test]
    fn empty_matches_is_no_match() {
        let body = r#"{"matches": []}"#;
        assert_eq!(
            provider().parse_response(body, Duration::ZERO).unwrap_err(),
            ProviderError::NoMatch
        );
    }

    #[test]
    fn missing_matches_field_is_no_match() {
        let body = r#"{}"#;
        assert_eq!(
            provider().parse_response(body, Duration::ZERO).unwrap_err(),
            ProviderError::NoMatch
        );
    }

    #[test]
    fn first_candidate_wins_in_provider_order() {
        let body = r#"{
            "matches": [
                {"track": {"title": "First", "subtitle": "Artist A"}},
                {"track": {"title": "Second", "subtitle": "Artist B"}}
            ]
        }"#;
        let result = provider().parse_response(body, Duration::ZERO).unwrap();
        assert_eq!(result.title.as_deref(), Some("First"));
    }

    #[test]
    fn tolerates_missing_sections() {
        let body = r#"{"matches": [{"track": {"title": "So What", "subtitle": "Miles Davis"}}]}"#;
        let result = provider().parse_response(body, Duration::ZERO).unwrap();
        assert!(result.album.is_none());
        assert!(result.year.is_none());
    }
}
