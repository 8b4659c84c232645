use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub use playback_core::config::PlaybackConfig;

#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub path: PathBuf,
    pub stream: Option<usize>,
    pub volume: f32,
    pub seek_ms: Option<u64>,
    pub playback: PlaybackConfig,
}

/// Load playback settings from `path` (defaults when absent) and apply CLI overrides.
pub fn load_playback_config(
    path: Option<&Path>,
    device: Option<String>,
    buffer_ms: Option<u32>,
) -> Result<PlaybackConfig> {
    let mut cfg = match path {
        Some(path) => PlaybackConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => PlaybackConfig::default(),
    };
    if let Some(device) = normalize_device_name(device) {
        cfg.device = Some(device);
    }
    if let Some(ms) = buffer_ms {
        cfg.ring_buffer_ms = ms;
    }
    cfg.validate().context("invalid playback config")?;
    Ok(cfg)
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
