use serde::{Deserialize, Serialize};

/// Playback state of a player instance.
///
/// Exactly one authoritative copy exists per player; it is stored as a `u8` in an
/// atomic and converted with [`PlaybackState::as_u8`] / [`PlaybackState::from_u8`].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// Nothing opened yet.
    #[default]
    Idle,
    /// A source is being probed and the output stream negotiated.
    Opening,
    /// Source open, output stream running, not yet playing.
    Ready,
    /// Audio is flowing to the device.
    Playing,
    /// Output is silent and the buffer is not drained.
    Paused,
    /// Buffered audio is being invalidated and the decoder repositioned.
    Seeking,
    /// Source and output stream released.
    Stopped,
    /// Unrecoverable failure; requires `open` or `close`.
    Error,
}

impl PlaybackState {
    pub const ALL: [PlaybackState; 8] = [
        PlaybackState::Idle,
        PlaybackState::Opening,
        PlaybackState::Ready,
        PlaybackState::Playing,
        PlaybackState::Paused,
        PlaybackState::Seeking,
        PlaybackState::Stopped,
        PlaybackState::Error,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            PlaybackState::Idle => 0,
            PlaybackState::Opening => 1,
            PlaybackState::Ready => 2,
            PlaybackState::Playing => 3,
            PlaybackState::Paused => 4,
            PlaybackState::Seeking => 5,
            PlaybackState::Stopped => 6,
            PlaybackState::Error => 7,
        }
    }

    /// Decode a value produced by [`PlaybackState::as_u8`]; unknown values map to `Error`.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PlaybackState::Idle,
            1 => PlaybackState::Opening,
            2 => PlaybackState::Ready,
            3 => PlaybackState::Playing,
            4 => PlaybackState::Paused,
            5 => PlaybackState::Seeking,
            6 => PlaybackState::Stopped,
            _ => PlaybackState::Error,
        }
    }

    /// Whether a source is loaded and the output stream is alive.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PlaybackState::Ready
                | PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Seeking
        )
    }

    /// Transition table of the playback state machine.
    ///
    /// `Error` and `Stopped` are reachable from every state. Self-transitions are not
    /// transitions; callers treat them as no-ops.
    pub fn can_transition(self, to: PlaybackState) -> bool {
        use PlaybackState::*;
        match (self, to) {
            (_, Error) | (_, Stopped) => true,
            (_, Opening) => true,
            (Opening, Ready) => true,
            (Seeking, Ready) | (Seeking, Playing) | (Seeking, Paused) => true,
            (Ready, Playing) | (Paused, Playing) => true,
            (Playing, Paused) => true,
            (Ready, Seeking) | (Playing, Seeking) | (Paused, Seeking) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Opening => "opening",
            PlaybackState::Ready => "ready",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Seeking => "seeking",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Category of a reported failure.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Container or codec cannot be handled.
    UnsupportedFormat,
    /// The source has no (selectable) audio stream.
    NoAudioStream,
    /// Corrupt or partial data after retries were exhausted.
    Decode,
    /// Output stream open/write failure.
    Device,
    /// Non-fatal: the callback ran out of buffered audio and played silence.
    Underrun,
    /// A command was issued in a state that forbids it.
    InvalidStateTransition,
    /// Filesystem or descriptor error while opening a source.
    Io,
}

/// Reason why playback ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Decoder or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Point-in-time status of a player, suitable for handing to a host UI.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerStatus {
    /// Current playback state.
    pub state: PlaybackState,
    /// Current source path/label, if any.
    pub now_playing: Option<String>,
    /// Playback position in milliseconds.
    pub position_ms: Option<u64>,
    /// Total media duration in milliseconds, when known.
    pub duration_ms: Option<u64>,
    /// Linear output gain (0.0–1.0).
    pub volume: f32,
    /// Source codec (for example `FLAC`, `MP3`).
    pub source_codec: Option<String>,
    /// Source bit depth, if known.
    pub source_bit_depth: Option<u16>,
    /// Source container format, if known.
    pub container: Option<String>,
    /// Source sample rate (Hz).
    pub source_sample_rate: Option<u32>,
    /// Source channel count.
    pub source_channels: Option<u16>,
    /// Negotiated output sample rate (Hz).
    pub output_sample_rate: Option<u32>,
    /// Negotiated output channel count.
    pub output_channels: Option<u16>,
    /// Output sample format selected for the device stream.
    pub output_sample_format: Option<String>,
    /// Whether the normalizer resamples.
    pub resampling: Option<bool>,
    /// Active output device name, if known.
    pub device: Option<String>,
    /// Frames emitted as silence because the buffer ran dry.
    pub underrun_frames: u64,
    /// Number of underrun episodes.
    pub underrun_events: u64,
    /// Output callback buffer size in frames, when fixed.
    pub buffer_size_frames: Option<u32>,
    /// Frames currently buffered between decode and output.
    pub buffered_frames: Option<u64>,
    /// Ring buffer capacity in frames.
    pub buffer_capacity_frames: Option<u64>,
    /// Reason the last playback ended.
    pub end_reason: Option<PlaybackEndReason>,
}
