use playback_types::{PlaybackEndReason, PlayerStatus};

use crate::decode::StreamInfo;
use crate::engine::EngineShared;
use crate::playback::NegotiatedOutput;

/// Track metadata updated by the playback worker on control paths.
///
/// Counters that change per callback live in [`EngineShared`]; this only holds what
/// changes on open/close.
#[derive(Debug, Default)]
pub struct TrackStatus {
    /// Human-readable source label (path or descriptor).
    pub now_playing: Option<String>,
    /// Source stream metadata.
    pub stream: Option<StreamInfo>,
    /// Negotiated output.
    pub output: Option<NegotiatedOutput>,
    /// Whether the normalizer is resampling.
    pub resampling: Option<bool>,
    /// Ring capacity in frames.
    pub buffer_capacity_frames: Option<u64>,
    /// Terminal playback reason from the last run.
    pub end_reason: Option<PlaybackEndReason>,
}

impl TrackStatus {
    /// Combine metadata with live counters into a host-facing snapshot.
    pub fn snapshot(&self, engine: &EngineShared, buffered_frames: Option<u64>) -> PlayerStatus {
        let stream = self.stream.as_ref();
        let output = self.output.as_ref();
        PlayerStatus {
            state: engine.state(),
            now_playing: self.now_playing.clone(),
            position_ms: self.now_playing.as_ref().map(|_| engine.position_ms()),
            duration_ms: engine.duration_ms(),
            volume: engine.volume(),
            source_codec: stream.and_then(|s| s.codec.clone()),
            source_bit_depth: stream.and_then(|s| s.bit_depth),
            container: stream.and_then(|s| s.container.clone()),
            source_sample_rate: stream.map(|s| s.format.sample_rate),
            source_channels: stream.map(|s| s.format.channels as u16),
            output_sample_rate: output.map(|o| o.format.sample_rate),
            output_channels: output.map(|o| o.format.channels as u16),
            output_sample_format: output.map(|o| o.device_sample_format.clone()),
            resampling: self.resampling,
            device: output.map(|o| o.device.clone()),
            underrun_frames: engine.underrun_frames(),
            underrun_events: engine.underrun_events(),
            buffer_size_frames: output.and_then(|o| o.buffer_frames),
            buffered_frames,
            buffer_capacity_frames: self.buffer_capacity_frames,
            end_reason: self.end_reason,
        }
    }

    /// Forget the output side once the stream is released.
    pub fn clear_output(&mut self) {
        self.output = None;
        self.resampling = None;
        self.buffer_capacity_frames = None;
    }

    /// Clear track-specific fields when the source is closed.
    pub fn clear_playback(&mut self) {
        self.now_playing = None;
        self.stream = None;
        self.clear_output();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{PcmFormat, SampleFormat};
    use playback_types::PlaybackState;

    fn stream_info() -> StreamInfo {
        StreamInfo {
            stream_index: 0,
            track_id: 1,
            format: PcmFormat::new(44_100, 2, SampleFormat::I16),
            duration_ms: Some(10_000),
            codec: Some("FLAC".into()),
            bit_depth: Some(16),
            container: Some("flac".into()),
        }
    }

    #[test]
    fn snapshot_reports_position_and_formats() {
        let engine = EngineShared::new(0.5);
        engine.store_state(PlaybackState::Playing);
        engine.set_output_rate(48_000);
        engine.set_duration_ms(Some(10_000));
        engine.rebase(1_000);
        engine.add_consumed(96_000);

        let status = TrackStatus {
            now_playing: Some("track.flac".into()),
            stream: Some(stream_info()),
            output: Some(NegotiatedOutput {
                device: "USB DAC".into(),
                format: PcmFormat::new(48_000, 2, SampleFormat::F32),
                device_sample_format: "I32".into(),
                buffer_frames: Some(512),
            }),
            resampling: Some(true),
            buffer_capacity_frames: Some(24_000),
            end_reason: None,
        };

        let snap = status.snapshot(&engine, Some(1024));
        assert_eq!(snap.state, PlaybackState::Playing);
        assert_eq!(snap.position_ms, Some(3_000));
        assert_eq!(snap.duration_ms, Some(10_000));
        assert_eq!(snap.volume, 0.5);
        assert_eq!(snap.source_sample_rate, Some(44_100));
        assert_eq!(snap.output_sample_rate, Some(48_000));
        assert_eq!(snap.output_sample_format.as_deref(), Some("I32"));
        assert_eq!(snap.buffer_size_frames, Some(512));
        assert_eq!(snap.buffered_frames, Some(1024));
        assert_eq!(snap.buffer_capacity_frames, Some(24_000));
    }

    #[test]
    fn snapshot_includes_underrun_counters() {
        let engine = EngineShared::new(1.0);
        engine.record_underrun(12, true);
        engine.record_underrun(4, false);
        let snap = TrackStatus::default().snapshot(&engine, None);
        assert_eq!(snap.underrun_frames, 16);
        assert_eq!(snap.underrun_events, 1);
        assert_eq!(snap.position_ms, None);
    }

    #[test]
    fn clear_playback_resets_track_fields() {
        let mut state = TrackStatus {
            now_playing: Some("track".into()),
            stream: Some(stream_info()),
            resampling: Some(false),
            buffer_capacity_frames: Some(1),
            end_reason: Some(PlaybackEndReason::Eof),
            ..TrackStatus::default()
        };

        state.clear_playback();

        assert!(state.now_playing.is_none());
        assert!(state.stream.is_none());
        assert!(state.resampling.is_none());
        assert!(state.buffer_capacity_frames.is_none());
        assert_eq!(state.end_reason, Some(PlaybackEndReason::Eof));
    }
}
