use std::path::Path;

use serde::Deserialize;

use crate::error::{PlayerError, Result};

/// Playback tuning parameters shared by decode/normalize/playback stages.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Preferred output sample rate; the normalizer targets whatever the device accepts.
    pub target_sample_rate: u32,
    /// Preferred output channel count.
    pub target_channels: u16,
    /// Ring buffer size in milliseconds of normalized audio.
    pub ring_buffer_ms: u32,
    /// Resampler input chunk size in frames.
    pub chunk_frames: usize,
    /// Requested device callback buffer in frames (clamped into the supported range).
    pub output_buffer_frames: Option<u32>,
    /// Longest single backpressure wait of the decode thread.
    pub write_wait_ms: u64,
    /// Consecutive corrupt packets tolerated before decode fails.
    pub max_decode_retries: u32,
    /// Capacity of the host event channel.
    pub event_capacity: usize,
    /// Interval between position events while playing.
    pub position_interval_ms: u64,
    /// Number of simultaneous clip voices.
    pub mixer_voices: usize,
    /// Output device substring match; `None` selects the default device.
    pub device: Option<String>,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-latency playback on common devices.
    fn default() -> Self {
        Self {
            target_sample_rate: 48_000,
            target_channels: 2,
            ring_buffer_ms: 500,
            chunk_frames: 1024,
            output_buffer_frames: Some(512),
            write_wait_ms: 20,
            max_decode_retries: 8,
            event_capacity: 256,
            position_interval_ms: 250,
            mixer_voices: 16,
            device: None,
        }
    }
}

impl PlaybackConfig {
    /// Load configuration from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<PlaybackConfig>(raw)
            .map_err(|e| PlayerError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make the pipeline unusable.
    pub fn validate(&self) -> Result<()> {
        if self.target_sample_rate == 0 {
            return Err(PlayerError::Config("target_sample_rate must be > 0".into()));
        }
        if self.target_channels == 0 {
            return Err(PlayerError::Config("target_channels must be > 0".into()));
        }
        if self.ring_buffer_ms == 0 {
            return Err(PlayerError::Config("ring_buffer_ms must be > 0".into()));
        }
        if self.chunk_frames == 0 {
            return Err(PlayerError::Config("chunk_frames must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(PlayerError::Config("event_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Ring capacity in **samples** for `buffer_ms` of audio at `(rate_hz, channels)`.
///
/// Always at least one frame.
pub fn ring_capacity_samples(rate_hz: u32, channels: usize, buffer_ms: u32) -> usize {
    let frames = (rate_hz as u64 * buffer_ms as u64).div_ceil(1000).max(1) as usize;
    frames.saturating_mul(channels.max(1))
}
