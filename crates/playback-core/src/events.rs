//! Notifications delivered to the host.

use playback_types::{ErrorKind, PlaybackEndReason, PlaybackState};

use crate::decode::StreamInfo;
use crate::playback::NegotiatedOutput;

/// Asynchronous player notifications, drained by the host from
/// [`crate::transport::TransportController::events`].
#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEvent {
    StateChanged {
        from: PlaybackState,
        to: PlaybackState,
    },
    /// A source finished opening and output is ready.
    Opened {
        source: String,
        stream: StreamInfo,
        output: NegotiatedOutput,
        resampling: bool,
    },
    /// Periodic position while playing.
    Position { position_ms: u64 },
    /// A seek landed; `position_ms` is the decoder's confirmed position.
    SeekCompleted { position_ms: u64 },
    /// The callback ran dry; one per starvation episode.
    Underrun,
    /// The decoder has no more audio for this source.
    EndOfStream,
    /// Playback finished and resources were released.
    Ended { reason: PlaybackEndReason },
    Error { kind: ErrorKind, message: String },
}
