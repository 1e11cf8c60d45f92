//! AudD recognition provider.
//!
//! Uploads the window as a WAV multipart form to the AudD HTTP API and
//! translates the response into a RecognitionResult. AudD does not report
//! a numeric confidence, so one is derived: a plain match scores 0.8,
//! bumped to 0.9 when the track is corroborated by a major catalog.

use crate::config::ProviderConfig;
use crate::recognizer::{ProviderError, RecognitionProvider};
use crate::track::RecognitionResult;
use crate::window::AudioWindow;
use chrono::Local;
use serde::Deserialize;
use std::time::{Duration, Instant};

const DEFAULT_API_URL: &str = "https://api.audd.io/";

const BASE_CONFIDENCE: f32 = 0.8;
const CORROBORATED_CONFIDENCE: f32 = 0.9;

#[derive(Debug, Deserialize)]
struct AuddResponse {
    status: String,
    result: Option<AuddMatch>,
    error: Option<AuddError>,
}

#[derive(Debug, Deserialize)]
struct AuddMatch {
    artist: Option<String>,
    title: Option<String>,
    album: Option<String>,
    release_date: Option<String>,
    spotify: Option<serde_json::Value>,
    apple_music: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AuddError {
    error_code: Option<u32>,
    error_message: Option<String>,
}

pub struct AuddProvider {
    enabled: bool,
    api_key: String,
    api_url: String,
    client: reqwest::blocking::Client,
}

impl AuddProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| format!("AudD HTTP client build failed: {}", e))?;

        Ok(AuddProvider {
            enabled: config.enabled && config.api_key.is_some(),
            api_key: config.api_key.clone().unwrap_or_default(),
            api_url: config
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            client,
        })
    }

    fn parse_response(&self, body: &str, latency: Duration) -> Result<RecognitionResult, ProviderError> {
        let response: AuddResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::Network(format!("unparseable AudD response: {}", e)))?;

        if response.status != "success" {
            // AudD reports quota and key problems in-band with status "error".
            return Err(match response.error {
                Some(err) => match err.error_code {
                    Some(900) => ProviderError::AuthFailed,
                    Some(901) => ProviderError::RateLimited,
                    _ => ProviderError::Network(
                        err.error_message.unwrap_or_else(|| "AudD error".to_string()),
                    ),
                },
                None => ProviderError::Network("AudD error without detail".to_string()),
            });
        }

        let matched = response.result.ok_or(ProviderError::NoMatch)?;

        let confidence = if matched.spotify.is_some() || matched.apple_music.is_some() {
            CORROBORATED_CONFIDENCE
        } else {
            BASE_CONFIDENCE
        };

        Ok(RecognitionResult {
            provider: "audd".to_string(),
            artist: matched.artist,
            title: matched.title,
            album: matched.album,
            confidence,
            duration_secs: None,
            year: matched.release_date.as_deref().and_then(extract_year),
            recognized_at: Local::now(),
            latency,
        })
    }
}

/// Pull a year out of a release date string like "1959-08-17".
/// The date is provider-controlled; `get` keeps a non-ASCII prefix from
/// panicking on a char boundary.
fn extract_year(date: &str) -> Option<u32> {
    date.get(..4)?.parse().ok()
}

impl RecognitionProvider for AuddProvider {
    fn name(&self) -> &str {
        "audd"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn identify(&self, window: &AudioWindow) -> Result<RecognitionResult, ProviderError> {
        let wav = window
            .to_wav_bytes()
            .map_err(ProviderError::Network)?;

        let form = reqwest::blocking::multipart::Form::new()
            .text("api_token", self.api_key.clone())
            .text("return", "spotify,apple_music,musicbrainz")
            .part(
                "file",
                reqwest::blocking::multipart::Part::bytes(wav)
                    .file_name("window.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| ProviderError::Network(e.to_string()))?,
            );

        let started = Instant::now();
        let response = self
            .client
            .post(&self.api_url)
            .multipart(form)
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
