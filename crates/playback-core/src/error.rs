//! Error type shared by every stage of the player.

use playback_types::{ErrorKind, PlaybackState};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlayerError>;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("source has no audio stream")]
    NoAudioStream,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("output device error: {0}")]
    Device(String),

    #[error("cannot {command} while {from}")]
    InvalidStateTransition {
        from: PlaybackState,
        command: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("player worker is not running")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    /// Category reported to hosts alongside the message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlayerError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            PlayerError::NoAudioStream => ErrorKind::NoAudioStream,
            PlayerError::Decode(_) => ErrorKind::Decode,
            PlayerError::Device(_) | PlayerError::Disconnected => ErrorKind::Device,
            PlayerError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            PlayerError::Config(_) | PlayerError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<cpal::BuildStreamError> for PlayerError {
    fn from(e: cpal::BuildStreamError) -> Self {
        PlayerError::Device(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for PlayerError {
    fn from(e: cpal::PlayStreamError) -> Self {
        PlayerError::Device(e.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for PlayerError {
    fn from(e: cpal::SupportedStreamConfigsError) -> Self {
        PlayerError::Device(e.to_string())
    }
}

impl From<cpal::DevicesError> for PlayerError {
    fn from(e: cpal::DevicesError) -> Self {
        PlayerError::Device(e.to_string())
    }
}
