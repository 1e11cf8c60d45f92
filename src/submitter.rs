//! HistorySubmitter — authenticated client for the listening-history service.
//!
//! Speaks the audioscrobbler 2.0 protocol: signed `track.scrobble` calls,
//! batched when several entries are ready. Failures are classified so the
//! queue knows whether to retry: network trouble is Transient, credential
//! and validation trouble is Permanent (a human has to re-authorize — the
//! queue must not spin on it).

use crate::config::LastfmConfig;
use crate::queue::ScrobbleEntry;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://ws.audioscrobbler.com/2.0/";
const HTTP_TIMEOUT_SECS: u64 = 30;

/// Classified submission failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Worth retrying with backoff: network failure, 5xx, rate limit.
    Transient(String),
    /// Requires operator attention: bad credentials, rejected entry.
    Permanent(String),
}

impl SubmitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            SubmitError::Transient(m) | SubmitError::Permanent(m) => m,
        }
    }
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Transient(m) => write!(f, "transient: {}", m),
            SubmitError::Permanent(m) => write!(f, "permanent: {}", m),
        }
    }
}

/// Anything that can receive confirmed plays. The queue drains through this
/// seam; tests substitute scripted fakes.
pub trait ScrobbleSink: Send {
    fn submit(&self, entry: &ScrobbleEntry) -> Result<(), SubmitError>;

    /// Submit several entries in one call where the protocol allows it.
    /// Success/failure is attributed per entry, in input order.
    ///
    /// The default drains one entry at a time and stops at the first
    /// Transient failure: entries behind a blocked head must not reach the
    /// service until the head resolves, so the remaining slots carry the
    /// same Transient error without being submitted. Sinks with a true
    /// atomic batch call (one request, uniform failure) override this.
    fn submit_batch(&self, entries: &[ScrobbleEntry]) -> Vec<Result<(), SubmitError>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.submit(entry) {
                Err(SubmitError::Transient(msg)) => {
                    let blocked = SubmitError::Transient(msg);
                    while results.len() < entries.len() {
                        results.push(Err(blocked.clone()));
                    }
                    break;
                }
                other => results.push(other),
            }
        }
        results
    }
}

/// Last.fm error codes that mean the credential or request is bad for good.
/// 4 = auth failed, 9 = invalid session, 10 = invalid API key,
/// 13 = invalid signature, 26 = key suspended.
const PERMANENT_CODES: &[u64] = &[4, 9, 10, 13, 26];
/// 8 = operation failed (try again), 11 = service offline,
/// 16 = temporarily unavailable, 29 = rate limit exceeded.
const TRANSIENT_CODES: &[u64] = &[8, 11, 16, 29];

/// Map a service error code to a retry class. Unknown codes are treated as
/// Permanent: a rejected entry will not get better by resubmitting it.
pub fn classify_error(code: u64, message: &str) -> SubmitError {
    if TRANSIENT_CODES.contains(&code) {
        SubmitError::Transient(format!("service error {}: {}", code, message))
    } else if code == 9 {
        SubmitError::Permanent(format!("unauthenticated: {}", message))
    } else if PERMANENT_CODES.contains(&code) {
        SubmitError::Permanent(format!("service error {}: {}", code, message))
    } else {
        SubmitError::Permanent(format!("rejected (code {}): {}", code, message))
    }
}

/// MD5 request signature over sorted key+value pairs plus the shared secret.
/// The `format` parameter is excluded, per the protocol.
pub fn api_signature(params: &BTreeMap<String, String>, secret: &str) -> String {
    let mut signature = String::new();
    for (key, value) in params {
        if key == "format" {
            continue;
        }
        signature.push_str(key);
        signature.push_str(value);
    }
    signature.push_str(secret);
    format!("{:x}", md5::compute(signature.as_bytes()))
}

pub struct LastfmSubmitter {
    api_key: String,
    api_secret: String,
    session_key: String,
    api_url: String,
    client: reqwest::blocking::Client,
}

impl LastfmSubmitter {
    pub fn new(config: &LastfmConfig) -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| format!("Last.fm HTTP client build failed: {}", e))?;

        Ok(LastfmSubmitter {
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            session_key: config.session_key.clone(),
            api_url: config
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            client,
        })
    }

    /// Indexed `track.scrobble` parameters for a batch (valid for one entry too).
    fn scrobble_params(&self, entries: &[ScrobbleEntry]) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("method".to_string(), "track.scrobble".to_string());
        params.insert("api_key".to_string(), self.api_key.clone());
        params.insert("sk".to_string(), self.session_key.clone());
        for (i, entry) in entries.iter().enumerate() {
            params.insert(format!("artist[{}]", i), entry.track.artist.clone());
            params.insert(format!("track[{}]", i), entry.track.title.clone());
            params.insert(format!("timestamp[{}]", i), entry.recognized_at.to_string());
            if let Some(album) = &entry.track.album {
                params.insert(format!("album[{}]", i), album.clone());
            }
        }
        params
    }

    fn call(&self, mut params: BTreeMap<String, String>) -> Result<serde_json::Value, SubmitError> {
        let signature = api_signature(&params, &self.api_secret);
        params.insert("api_sig".to_string(), signature);
        params.insert("format".to_string(), "json".to_string());

        let response = self
            .client
            .post(&self.api_url)
            .form(&params)
            .send()
            .map_err(|e| SubmitError::Transient(format!("network: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(SubmitError::Transient(format!("HTTP {}", status)));
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|e| SubmitError::Transient(format!("unparseable response: {}", e)))?;

        if let Some(code) = body.get("error").and_then(|c| c.as_u64()) {
            let message = body
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown");
            return Err(classify_error(code, message));
        }

        Ok(body)
    }

    fn request(&self, entries: &[ScrobbleEntry]) -> Vec<Result<(), SubmitError>> {
        if self.session_key.is_empty() {
            let err = SubmitError::Permanent(
                "unauthenticated: no session key configured (run the authorization script)"
                    .to_string(),
            );
            return entries.iter().map(|_| Err(err.clone())).collect();
        }

        match self.call(self.scrobble_params(entries)) {
            Ok(body) => parse_scrobble_results(&body, entries.len()),
            Err(e) => entries.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    /// Cheap credential check without writing history: a signed
    /// `track.updateNowPlaying` call (now-playing notices are ephemeral).
    pub fn verify_session(&self) -> Result<(), SubmitError> {
        if self.session_key.is_empty() {
            return Err(SubmitError::Permanent(
                "unauthenticated: no session key configured".to_string(),
            ));
        }
        let mut params = BTreeMap::new();
        params.insert("method".to_string(), "track.updateNowPlaying".to_string());
        params.insert("api_key".to_string(), self.api_key.clone());
        params.insert("sk".to_string(), self.session_key.clone());
        params.insert("artist".to_string(), "needledrop".to_string());
        params.insert("track".to_string(), "connection test".to_string());
        self.call(params).map(|_| ())
    }
}

/// Attribute per-entry outcomes from a successful scrobble response.
/// Entries the service accepted pass; entries it ignored carry the ignore
/// code as a Permanent failure. A response without the expected shape is
/// treated as all-accepted (the call itself returned no error).
fn parse_scrobble_results(body: &serde_json::Value, count: usize) -> Vec<Result<(), SubmitError>> {
    let scrobbles = body.get("scrobbles").and_then(|s| s.get("scrobble"));

    let items: Vec<&serde_json::Value> = match scrobbles {
        Some(serde_json::Value::Array(list)) => list.iter().collect(),
        Some(single) => vec![single],
        None => return (0..count).map(|_| Ok(())).collect(),
    };

    (0..count)
        .map(|i| match items.get(i) {
            Some(item) => {
                let code = item
                    .get("ignoredMessage")
                    .and_then(|m| m.get("code"))
                    .and_then(|c| c.as_str().map(String::from).or_else(|| c.as_u64().map(|n| n.to_string())))
                    .unwrap_or_else(|| "0".to_string());
                if code == "0" {
                    Ok(())
                } else {
                    Err(SubmitError::Permanent(format!(
                        "entry ignored by service (code {})",
                        code
                    )))
                }
            }
            None => Ok(()),
        })
        .collect()
}

impl ScrobbleSink for LastfmSubmitter {
    fn submit(&self, entry: &ScrobbleEntry) -> Result<(), SubmitError> {
        self.request(std::slice::from_ref(entry))
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(SubmitError::Transient("empty response".to_string())))
    }

    fn submit_batch(&self, entries: &[ScrobbleEntry]) -> Vec<Result<(), SubmitError>> {
        if entries.is_empty() {
            return Vec::new();
        }
        self.request(entries)
    }
}
