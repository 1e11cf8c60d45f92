//! Configuration boundary.
//!
//! Resolved once at startup from a JSON file and treated as read-only for
//! the life of the process. A missing file yields defaults; a corrupt file
//! warns and starts fresh. Credentials come from the same file — obtaining
//! them (the interactive authorization flow) is the external setup script's
//! job, never this process's.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const APP_DIR: &str = "needledrop";

/// One entry in the ordered recognition provider list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider id: "audd" or "shazam".
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override endpoint URL (defaults per provider).
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    30
}

/// Retry/backoff parameters for the submission queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> u64 {
    10
}
fn default_max_delay() -> u64 {
    600
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

/// Listening-history service credentials (audioscrobbler 2.0 protocol).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LastfmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    /// Long-lived session key produced by the one-time authorization script.
    #[serde(default)]
    pub session_key: String,
    /// Override endpoint URL (defaults to ws.audioscrobbler.com).
    #[serde(default)]
    pub api_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input device name substring (e.g., "USB Audio CODEC"). None = default device.
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Fixed capture window length handed to recognition providers.
    #[serde(default = "default_window_secs")]
    pub window_secs: f32,
    /// RMS level below which a window is tagged silent (e.g., 0.01).
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,
    /// Confidence floor: matches below it are never accepted.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Repeated recognitions of the same track within this window are one play.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    /// Silence/no-match duration after which the active play is considered ended.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub lastfm: LastfmConfig,
    /// Directory for durable queue state. None = platform data dir.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Path for the exported status snapshot. None = <state_dir>/status.json.
    #[serde(default)]
    pub status_path: Option<PathBuf>,
}

fn default_sample_rate() -> u32 {
    44100
}
fn default_channels() -> u16 {
    2
}
fn default_window_secs() -> f32 {
    12.0
}
fn default_silence_threshold() -> f32 {
    0.01
}
fn default_min_confidence() -> f32 {
    0.6
}
fn default_dedup_window() -> u64 {
    480
}
fn default_stale_timeout() -> u64 {
    120
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "audd".to_string(),
            enabled: false,
            api_key: None,
            api_url: None,
            timeout_secs: default_provider_timeout(),
        },
        ProviderConfig {
            name: "shazam".to_string(),
            enabled: false,
            api_key: None,
            api_url: None,
            timeout_secs: default_provider_timeout(),
        },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: None,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            window_secs: default_window_secs(),
            silence_threshold: default_silence_threshold(),
            min_confidence: default_min_confidence(),
            dedup_window_secs: default_dedup_window(),
            stale_timeout_secs: default_stale_timeout(),
            queue: QueueConfig::default(),
            providers: default_providers(),
            lastfm: LastfmConfig::default(),
            state_dir: None,
            status_path: None,
        }
    }
}

impl Config {
    /// Default config file location (platform config dir).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(CONFIG_FILE)
    }

    /// Load configuration from the given path, or defaults when absent.
    /// Corrupt files warn and start fresh rather than refusing to boot.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str(&data) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("[Config] Warning: corrupt config file, using defaults: {}", e),
                },
                Err(e) => eprintln!("[Config] Warning: could not read config file: {}", e),
            }
        }
        Config::default()
    }

    /// Persist the current configuration (used by `init` to write a template).
    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Create config dir failed: {}", e))?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| format!("Serialize error: {}", e))?;
        fs::write(path, json).map_err(|e| format!("Write error: {}", e))?;
        Ok(())
    }

    /// Resolved durable-state directory.
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR),
        }
    }

    /// Resolved status snapshot export path.
    pub fn status_path(&self) -> PathBuf {
        match &self.status_path {
            Some(path) => path.clone(),
            None => self.state_dir().join("status.json"),
        }
    }
}
