use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "player", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML file with playback settings
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use a specific output device by substring match
    #[arg(long, global = true)]
    pub device: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local file; reads `p`, `s <ms>`, `v <0..1>` and `q` from stdin
    Play {
        /// Path to the audio file
        path: PathBuf,

        /// Audio stream index inside the container
        #[arg(long)]
        stream: Option<usize>,

        /// Initial volume (0.0 - 1.0)
        #[arg(long, default_value_t = 1.0)]
        volume: f32,

        /// Start position in milliseconds
        #[arg(long)]
        seek_ms: Option<u64>,

        /// Ring buffer size in milliseconds (overrides the config file)
        #[arg(long)]
        buffer_ms: Option<u32>,
    },

    /// List output devices and exit
    Devices,
}
