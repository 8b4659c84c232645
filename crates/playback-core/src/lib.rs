//! Local media playback engine.
//!
//! ## Pipeline
//! 1. **Decode**: Symphonia demuxes the source and decodes the selected audio stream.
//! 2. **Normalize**: channel mapping and Rubato resampling into the negotiated output format.
//! 3. **Buffer**: a lock-free ring sized in milliseconds decouples decoding from output.
//! 4. **Render**: the CPAL callback pulls from the ring, applies gain and mixes clips.
//!
//! [`TransportController`] is the entry point; it drives a single playback worker thread
//! and reports back through [`PlayerEvent`]s and [`PlayerStatus`] snapshots.

pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod mixer;
pub mod normalize;
pub mod playback;
pub mod render;
pub mod ring;
pub mod status;
pub mod transport;

mod worker;

#[cfg(test)]
mod testutil;

pub use config::PlaybackConfig;
pub use decode::{DemuxDecoder, FrameSource, PcmFormat, SourceHandle, StreamInfo};
pub use error::{PlayerError, Result};
pub use events::PlayerEvent;
pub use mixer::{Clip, ClipHandle};
pub use playback::{CpalBackend, OutputBackend};
pub use playback_types::{ErrorKind, PlaybackEndReason, PlaybackState, PlayerStatus};
pub use transport::TransportController;
