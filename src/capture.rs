//! Audio capture from the turntable's line input.
//!
//! Opens a cpal input stream and assembles the callback chunks into
//! fixed-length AudioWindows. The stream handle is not Send, so a Sampler
//! must be opened on the thread that consumes it.

use crate::config::Config;
use crate::window::AudioWindow;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum CaptureError {
    /// No usable input device. Startup-fatal: a recognizer with no ears
    /// should fail loudly rather than idle forever.
    DeviceUnavailable(String),
    Stream(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::DeviceUnavailable(e) => write!(f, "input device unavailable: {}", e),
            CaptureError::Stream(e) => write!(f, "capture stream error: {}", e),
        }
    }
}

/// Enumerate input device names for `needledrop devices`.
pub fn list_input_devices() -> Result<Vec<String>, CaptureError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

fn find_device(host: &cpal::Host, wanted: Option<&str>) -> Result<cpal::Device, CaptureError> {
    if let Some(name) = wanted {
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        for device in devices {
            if let Ok(device_name) = device.name() {
                if device_name.to_lowercase().contains(&name.to_lowercase()) {
                    return Ok(device);
                }
            }
        }
        return Err(CaptureError::DeviceUnavailable(format!(
            "no input device matching '{}'",
            name
        )));
    }
    host.default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".to_string()))
}

/// Continuous sampler producing fixed-length windows.
pub struct Sampler {
    rx: Receiver<Vec<f32>>,
    // Held only to keep the cpal stream alive for the Sampler's lifetime.
    _stream: Option<cpal::Stream>,
    sample_rate: u32,
    channels: u16,
    window_samples: usize,
    silence_threshold: f32,
    running: Arc<AtomicBool>,
    buffer: Vec<f32>,
}

impl Sampler {
    /// Open the configured input device and start streaming.
    pub fn open(config: &Config, running: Arc<AtomicBool>) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = find_device(&host, config.device_name.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let supported = device
            .default_input_config()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        let sample_format = supported.sample_format();

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = std::sync::mpsc::channel::<Vec<f32>>();
        let stream = build_stream(&device, &stream_config, sample_format, tx)?;
        stream
            .play()
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        eprintln!(
            "[Capture] Listening on '{}' ({} Hz, {} ch, {:.0}s windows)",
            device_name,
            config.sample_rate,
            config.channels,
            config.window_secs
        );

        let window_samples = (config.sample_rate as f64
            * config.window_secs as f64
            * config.channels as f64) as usize;

        Ok(Sampler {
            rx,
            _stream: Some(stream),
            sample_rate: config.sample_rate,
            channels: config.channels,
            window_samples: window_samples.max(1),
            silence_threshold: config.silence_threshold,
            running,
            buffer: Vec::with_capacity(window_samples),
        })
    }

    /// Streamless sampler fed through a channel, for tests and headless runs.
    pub fn from_channel(
        rx: Receiver<Vec<f32>>,
        sample_rate: u32,
        channels: u16,
        window_secs: f64,
        silence_threshold: f32,
        running: Arc<AtomicBool>,
    ) -> Self {
        let window_samples = (sample_rate as f64 * window_secs * channels as f64) as usize;
        Sampler {
            rx,
            _stream: None,
            sample_rate,
            channels,
            window_samples: window_samples.max(1),
            silence_threshold,
            running,
            buffer: Vec::with_capacity(window_samples),
        }
    }

    /// Block until a full window accumulates. Returns Ok(None) on shutdown.
    pub fn next_window(&mut self) -> Result<Option<AudioWindow>, CaptureError> {
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return Ok(None);
            }
            if self.buffer.len() >= self.window_samples {
                let rest = self.buffer.split_off(self.window_samples);
                let samples = std::mem::replace(&mut self.buffer, rest);
                let mut window = AudioWindow::new(samples, self.sample_rate, self.channels);
                window.tag_silence(self.silence_threshold);
                return Ok(Some(window));
            }
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    if !self.running.load(Ordering::Relaxed) {
                        return Ok(None);
                    }
                    return Err(CaptureError::Stream(
                        "capture stream disconnected".to_string(),
                    ));
                }
            }
        }
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    tx: Sender<Vec<f32>>,
) -> Result<cpal::Stream, CaptureError> {
    let err_fn = |e| eprintln!("[Capture] Stream error: {}", e);

    let stream = match format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(data.to_vec());
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let converted: Vec<f32> =
                    data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                let _ = tx.send(converted);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let converted: Vec<f32> = data
                    .iter()
                    .map(|&s| (s as f32 - 32768.0) / 32768.0)
                    .collect();
                let _ = tx.send(converted);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(CaptureError::Stream(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| CaptureError::Stream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_sampler(
        window_secs: f64,
    ) -> (Sender<Vec<f32>>, Sampler, Arc<AtomicBool>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let sampler = Sampler::from_channel(rx, 1000, 1, window_secs, 0.01, running.clone());
        (tx, sampler, running)
    }

    #[test]
    fn assembles_full_windows_from_chunks() {
        let (tx, mut sampler, _running) = channel_sampler(1.0);
        // 1s at 1 kHz mono = 1000 samples, delivered in uneven chunks.
        tx.send(vec![0.5; 300]).unwrap();
        tx.send(vec![0.5; 300]).unwrap();
        tx.send(vec![0.5; 500]).unwrap();

        let window = sampler.next_window().unwrap().unwrap();
        assert_eq!(window.samples.len(), 1000);
        assert!(!window.silent);
    }

    #[test]
    fn leftover_samples_carry_into_next_window() {
        let (tx, mut sampler, _running) = channel_sampler(1.0);
        tx.send(vec![0.5; 1100]).unwrap();
        tx.send(vec![0.5; 900]).unwrap();

        let first = sampler.next_window().unwrap().unwrap();
        let second = sampler.next_window().unwrap().unwrap();
        assert_eq!(first.samples.len(), 1000);
        assert_eq!(second.samples.len(), 1000);
    }

    #[test]
    fn quiet_windows_are_tagged_silent() {
        let (tx, mut sampler, _running) = channel_sampler(1.0);
        tx.send(vec![0.0001; 1000]).unwrap();
        let window = sampler.next_window().unwrap().unwrap();
        assert!(window.silent);
    }

    #[test]
    fn shutdown_returns_none() {
        let (_tx, mut sampler, running) = channel_sampler(1.0);
        running.store(false, Ordering::Relaxed);
        assert!(sampler.next_window().unwrap().is_none());
    }

    #[test]
    fn disconnect_while_running_is_an_error() {
        let (tx, mut sampler, _running) = channel_sampler(1.0);
        drop(tx);
        assert!(matches!(
            sampler.next_window(),
            Err(CaptureError::Stream(_))
        ));
    }
}
