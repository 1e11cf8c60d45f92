use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A recognized track identity. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    /// Confidence score in [0, 1] reported by the provider that matched it.
    pub confidence: f32,
    /// Name of the provider that produced the match.
    pub provider: String,
}

impl Track {
    /// Normalized artist+title key used for duplicate matching.
    /// Case-insensitive, whitespace-collapsed.
    pub fn normalized_key(&self) -> String {
        format!("{}\u{1f}{}", normalize(&self.artist), normalize(&self.title))
    }

    /// "Artist – Title" display string.
    pub fn display(&self) -> String {
        format!("{} – {}", self.artist, self.title)
    }
}

/// Lowercase and collapse runs of whitespace to single spaces.
pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Raw result of a single provider call, before the orchestrator picks a winner.
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    pub provider: String,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    /// Confidence score in [0, 1].
    pub confidence: f32,
    /// Track length reported by the provider, if any.
    pub duration_secs: Option<u32>,
    /// Release year reported by the provider, if any.
    pub year: Option<u32>,
    /// Wall-clock time the provider call completed.
    pub recognized_at: DateTime<Local>,
    /// Raw provider call latency.
    pub latency: Duration,
}

impl RecognitionResult {
    /// Convert into a canonical Track. Requires both artist and title;
    /// a match missing either is useless for scrobbling.
    pub fn into_track(self) -> Option<Track> {
        let artist = self.artist.filter(|a| !a.trim().is_empty())?;
        let title = self.title.filter(|t| !t.trim().is_empty())?;
        Some(Track {
            artist,
            title,
            album: self.album.filter(|a| !a.trim().is_empty()),
            confidence: self.confidence,
            provider: self.provider,
        })
    }
}
