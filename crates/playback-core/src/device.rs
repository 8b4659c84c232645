//! Output device discovery and negotiation.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing the stream configuration closest to the preferred rate/channels
//! - clamping the requested low-latency buffer into the supported range

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::{PlayerError, Result};

/// Pick the first output device matching `needle` (case-insensitive), or the default device.
///
/// Returns an error if no suitable device is found.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let found = host.output_devices()?.find(|d| {
            d.description()
                .ok()
                .map(|n| matches_device_name(&n.name(), needle))
                .unwrap_or(false)
        });
        return found
            .ok_or_else(|| PlayerError::Device(format!("no output device matched: {needle}")));
    }

    host.default_output_device()
        .ok_or_else(|| PlayerError::Device("no default output device".into()))
}

/// Human-readable device name, best-effort.
pub fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| String::from("<unknown>"))
}

/// Choose the output config closest to `target_rate` / `target_channels`.
///
/// Ranking, most significant first:
/// - exact channel count, then more channels than wanted, then fewer
/// - the target rate itself, else the highest rate below it, else the lowest above it
/// - `f32` over integer formats
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
    target_channels: Option<u16>,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs()?.collect();

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if sample_format_rank(range.sample_format()) > 3 {
            continue;
        }
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            channel_rank: channel_rank(range.channels(), target_channels),
            below: target_rate.map(|t| rate <= t).unwrap_or(true),
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = match &best {
            None => true,
            Some((b, _)) => candidate.is_better_than(b),
        };
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| PlayerError::Device("no supported output configs".into()))
}

/// Clamp `requested` frames into the device's supported buffer range.
///
/// Returns `None` (device default) when the device reports no range or nothing was requested.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    requested: Option<u32>,
) -> Option<cpal::BufferSize> {
    match (config.buffer_size(), requested) {
        (cpal::SupportedBufferSize::Range { min, max }, Some(frames)) => {
            Some(cpal::BufferSize::Fixed(clamp_frames(frames, *min, *max)))
        }
        _ => None,
    }
}

fn clamp_frames(frames: u32, min: u32, max: u32) -> u32 {
    if min > max {
        return min;
    }
    frames.clamp(min, max)
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    channel_rank: u8,
    below: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, best: &Candidate) -> bool {
        if self.channel_rank != best.channel_rank {
            return self.channel_rank < best.channel_rank;
        }
        is_better_rate(
            self.below,
            self.rate,
            self.format_rank,
            best.below,
            best.rate,
            best.format_rank,
        )
    }
}

fn channel_rank(channels: u16, target: Option<u16>) -> u8 {
    match target {
        None => 0,
        Some(t) if channels == t => 0,
        Some(t) if channels > t => 1,
        Some(_) => 2,
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) if target < min => min,
        Some(target) if target > max => max,
        Some(target) => target,
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_rate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        // Below target: closer means higher. Above target: closer means lower.
        if below { rate > best_rate } else { rate < best_rate }
    } else {
        format_rank < best_rank
    }
}

/// Output device metadata for `player devices`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
    pub is_default: bool,
}

/// Describe every output device of `host`. Devices without a usable rate range are skipped.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host.default_output_device().map(|d| device_name(&d));
    let mut out = Vec::new();
    for d in host.output_devices()? {
        let name = device_name(&d);
        let mut min_rate = u32::MAX;
        let mut max_rate = 0u32;
        let mut max_channels = 0u16;
        if let Ok(ranges) = d.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
                max_channels = max_channels.max(r.channels());
            }
        }
        if max_rate == 0 || max_rate < min_rate {
            if let Ok(default_cfg) = d.default_output_config() {
                min_rate = default_cfg.sample_rate();
                max_rate = min_rate;
                max_channels = default_cfg.channels();
            }
        }
        if max_rate == 0 || max_rate < min_rate {
            tracing::warn!(device = %name, "skipping device with invalid sample rate range");
            continue;
        }

        let id = match d.id() {
            Ok(id) => id.to_string(),
            Err(_) => hash_device_id(&name, min_rate, max_rate),
        };
        out.push(DeviceInfo {
            id,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
            max_channels,
        });
    }
    Ok(out)
}

fn hash_device_id(name: &str, min_rate: u32, max_rate: u32) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    let input = format!("{name}|{min_rate}|{max_rate}");
    for b in input.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
