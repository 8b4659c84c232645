//! `player`: a small CLI that plays a local media file through the playback engine.
//!
//! ## Pipeline
//! 1. **Decode**: Symphonia demuxes the file and decodes the selected audio stream.
//! 2. **Normalize**: Rubato resamples and channels are mapped to the device's format.
//! 3. **Playback**: the CPAL callback pulls from a lock-free ring without blocking.
//!
//! ## Modes
//! - `play`: play a file, with `p`/`s <ms>`/`v <0..1>`/`q` read from stdin.
//! - `devices`: list output devices.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use playback_cli::cli::{Args, Command};
use playback_cli::config::{PlayConfig, load_playback_config};
use playback_cli::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,playback_core=info")
        }))
        .init();

    match args.cmd {
        Command::Devices => runtime::list_devices(),
        Command::Play {
            path,
            stream,
            volume,
            seek_ms,
            buffer_ms,
        } => {
            let playback = load_playback_config(args.config.as_deref(), args.device, buffer_ms)?;
            runtime::run_play(PlayConfig {
                path,
                stream,
                volume,
                seek_ms,
                playback,
            })
        }
    }
}
