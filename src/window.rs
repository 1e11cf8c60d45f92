//! AudioWindow — a fixed-duration buffer of captured audio.
//!
//! Created per sampling tick by the Sampler, consumed by the recognizer,
//! discarded after use. Carries its own RMS-based silence tag so the
//! recognizer can skip dead air without re-scanning the buffer.

use chrono::{DateTime, Local};
use std::io::Cursor;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AudioWindow {
    /// Interleaved f32 samples in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Wall-clock time the first sample of this window was captured.
    pub captured_at: DateTime<Local>,
    /// Set by the sampler when the window RMS falls below the energy threshold.
    pub silent: bool,
}

impl AudioWindow {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        AudioWindow {
            samples,
            sample_rate,
            channels,
            captured_at: Local::now(),
            silent: false,
        }
    }

    /// Window duration derived from the sample count.
    pub fn duration(&self) -> Duration {
        let per_sec = self.sample_rate as u64 * self.channels.max(1) as u64;
        if per_sec == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / per_sec as f64)
    }

    /// RMS level over the whole buffer (f64 accumulation to avoid drift).
    pub fn rms_level(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        (sum_sq / self.samples.len() as f64).sqrt() as f32
    }

    /// Tag this window against the configured energy threshold.
    /// Windows below it are skipped by the recognizer (turntable motor hum
    /// and needle noise must not burn provider calls).
    pub fn tag_silence(&mut self, threshold: f32) {
        self.silent = self.rms_level() < threshold;
    }

    /// Render this window as a 16-bit PCM WAV in memory, the format the
    /// recognition providers accept for upload.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, String> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| format!("WAV encode setup failed: {}", e))?;
            for &sample in &self.samples {
                let clamped = sample.clamp(-1.0, 1.0);
                writer
                    .write_sample((clamped * i16::MAX as f32) as i16)
                    .map_err(|e| format!("WAV sample write failed: {}", e))?;
            }
            writer
                .finalize()
                .map_err(|e| format!("WAV finalize failed: {}", e))?;
        }
        Ok(cursor.into_inner())
    }
}
