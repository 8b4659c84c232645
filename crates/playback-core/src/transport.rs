//! Public control surface of the player.
//!
//! [`TransportController`] validates each command against the current state and
//! hands it to the playback worker; queries read atomics and the published track
//! metadata without waiting on the worker.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use playback_types::{PlaybackState, PlayerStatus};

use crate::config::PlaybackConfig;
use crate::decode::{FrameSource, PcmFormat, SampleFormat, SourceHandle};
use crate::engine::EngineShared;
use crate::error::{PlayerError, Result};
use crate::events::PlayerEvent;
use crate::mixer::{Clip, ClipHandle};
use crate::playback::{CpalBackend, OutputBackend};
use crate::worker::{Command, OpenRequest, Published, Worker};

pub struct TransportController {
    config: PlaybackConfig,
    shared: Arc<EngineShared>,
    published: Arc<Published>,
    commands: Sender<Command>,
    events: Receiver<PlayerEvent>,
    worker: Option<JoinHandle<()>>,
}

impl TransportController {
    /// Create a controller that plays through the system's audio devices.
    pub fn new(config: PlaybackConfig) -> Result<Self> {
        Self::with_backend(config, Box::new(CpalBackend::new()))
    }

    /// Create a controller with a custom output backend.
    pub fn with_backend(config: PlaybackConfig, backend: Box<dyn OutputBackend>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(EngineShared::new(1.0));
        let published = Arc::new(Published::default());
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (event_tx, events) = crossbeam_channel::bounded(config.event_capacity);

        let worker = Worker::spawn(
            config.clone(),
            shared.clone(),
            published.clone(),
            backend,
            command_rx,
            event_tx,
        )?;

        Ok(Self {
            config,
            shared,
            published,
            commands,
            events,
            worker: Some(worker),
        })
    }

    /// Open a file or descriptor, selecting the first audio stream.
    pub fn open(&self, source: SourceHandle) -> Result<()> {
        self.open_stream(source, None)
    }

    /// Open a source and select the audio stream at `stream_index` (container track order).
    pub fn open_stream(&self, source: SourceHandle, stream_index: Option<usize>) -> Result<()> {
        self.submit_open(OpenRequest::Handle {
            source,
            stream_index,
        })
    }

    /// Play from an already-constructed frame source.
    pub fn open_source(&self, source: Box<dyn FrameSource>, label: impl Into<String>) -> Result<()> {
        self.submit_open(OpenRequest::Source {
            source,
            label: label.into(),
        })
    }

    fn submit_open(&self, request: OpenRequest) -> Result<()> {
        self.shared.begin_open();
        if let Err(err) = self.send(Command::Open(request)) {
            self.shared.finish_open();
            return Err(err);
        }
        Ok(())
    }

    pub fn play(&self) -> Result<()> {
        match self.shared.effective_state() {
            PlaybackState::Playing => Ok(()),
            PlaybackState::Opening => self.send(Command::Play),
            state if state.can_transition(PlaybackState::Playing) => self.send(Command::Play),
            from => Err(PlayerError::InvalidStateTransition {
                from,
                command: "play",
            }),
        }
    }

    /// Pause playback. Pausing while already paused does nothing.
    pub fn pause(&self) -> Result<()> {
        match self.shared.effective_state() {
            PlaybackState::Paused => Ok(()),
            PlaybackState::Opening | PlaybackState::Playing | PlaybackState::Seeking => {
                self.send(Command::Pause)
            }
            from => Err(PlayerError::InvalidStateTransition {
                from,
                command: "pause",
            }),
        }
    }

    /// Seek to `position_ms`. Repeated seeks before the worker gets to them collapse
    /// into the most recent target.
    pub fn seek(&self, position_ms: u64) -> Result<()> {
        match self.shared.effective_state() {
            PlaybackState::Ready
            | PlaybackState::Playing
            | PlaybackState::Paused
            | PlaybackState::Seeking => {
                if self.shared.request_seek(position_ms) {
                    self.send(Command::Seek)?;
                }
                Ok(())
            }
            from => Err(PlayerError::InvalidStateTransition {
                from,
                command: "seek",
            }),
        }
    }

    /// Set the output gain (clamped to 0.0-1.0). Takes effect on the next callback.
    pub fn set_volume(&self, volume: f32) {
        self.shared.set_volume(volume);
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Stop and forget the current source.
    pub fn close(&self) -> Result<()> {
        self.send(Command::Close)
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.effective_state()
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Playback position; reports the target while a seek is in flight.
    pub fn position_ms(&self) -> u64 {
        if let Some(target) = self.shared.seek_pending() {
            return target;
        }
        if self.shared.state() == PlaybackState::Seeking {
            return self.shared.pending_seek_target();
        }
        self.shared.position_ms()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.shared.duration_ms()
    }

    pub fn status(&self) -> PlayerStatus {
        let buffered = self
            .published
            .ring
            .lock()
            .ok()
            .and_then(|ring| ring.as_ref().map(|r| (r.available_to_read() / r.frame_len()) as u64));
        let mut status = match self.published.track.lock() {
            Ok(track) => track.snapshot(&self.shared, buffered),
            Err(_) => Default::default(),
        };
        status.state = self.shared.effective_state();
        if status.position_ms.is_some() {
            status.position_ms = Some(self.position_ms());
        }
        status
    }

    /// Player notifications. The channel is bounded; undrained events are dropped.
    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events
    }

    pub fn try_event(&self) -> Option<PlayerEvent> {
        self.events.try_recv().ok()
    }

    /// Format of the open output stream, if any.
    pub fn output_format(&self) -> Option<PcmFormat> {
        self.published
            .track
            .lock()
            .ok()
            .and_then(|track| track.output.as_ref().map(|o| o.format))
    }

    /// Decode a short sound into memory in the current output format (or the
    /// configured target format when no output is open).
    pub fn load_clip(&self, source: SourceHandle) -> Result<Arc<Clip>> {
        let target = self.output_format().unwrap_or_else(|| {
            PcmFormat::new(
                self.config.target_sample_rate,
                self.config.target_channels as usize,
                SampleFormat::F32,
            )
        });
        Clip::load(source, target, &self.config)
    }

    /// Mix `clip` over the current output.
    pub fn play_clip(&self, clip: &Arc<Clip>) -> Result<ClipHandle> {
        let mut slot = self
            .published
            .mixer
            .lock()
            .map_err(|_| PlayerError::Disconnected)?;
        let mixer = slot
            .as_mut()
            .ok_or_else(|| PlayerError::Device("no output stream is open".into()))?;
        mixer.reap();
        mixer.play(clip)
    }

    pub fn stop_clip(&self, handle: ClipHandle) {
        if let Ok(mut slot) = self.published.mixer.lock() {
            if let Some(mixer) = slot.as_mut() {
                mixer.stop(handle);
            }
        }
    }

    pub fn is_clip_playing(&self, handle: ClipHandle) -> bool {
        self.published
            .mixer
            .lock()
            .ok()
            .and_then(|mut slot| {
                slot.as_mut().map(|mixer| {
                    mixer.reap();
                    mixer.is_playing(handle)
                })
            })
            .unwrap_or(false)
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| PlayerError::Disconnected)
    }
}

impl Drop for TransportController {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("playback worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use playback_types::{ErrorKind, PlaybackEndReason};
    use symphonia::core::errors::Error as SymphoniaError;

    use super::*;
    use crate::decode::DemuxDecoder;
    use crate::testutil::{
        FlakyDecoder, GatedSource, ManualBackend, ManualOutput, write_garbage, write_sine_wav,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            ring_buffer_ms: 200,
            write_wait_ms: 5,
            position_interval_ms: 50,
            ..PlaybackConfig::default()
        }
    }

    fn controller() -> (TransportController, ManualOutput) {
        let backend = ManualBackend::new(48_000, 2);
        let output = backend.output();
        let player = TransportController::with_backend(config(), Box::new(backend)).unwrap();
        (player, output)
    }

    fn wait_for(player: &TransportController, mut pred: impl FnMut(&PlayerEvent) -> bool) -> Vec<PlayerEvent> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Ok(event) = player.events().recv_timeout(Duration::from_millis(50)) {
                let done = pred(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }
        panic!("timed out; events so far: {seen:?}");
    }

    fn wait_state(player: &TransportController, state: PlaybackState) {
        let deadline = Instant::now() + WAIT;
        while player.state() != state {
            assert!(Instant::now() < deadline, "never reached {state}, at {}", player.state());
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn open_ready(player: &TransportController, source: SourceHandle) {
        player.open(source).unwrap();
        wait_for(player, |e| matches!(e, PlayerEvent::Opened { .. }));
        wait_state(player, PlaybackState::Ready);
    }

    #[test]
    fn plays_a_file_to_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 500);
        let (player, output) = controller();

        open_ready(&player, SourceHandle::Path(path));
        assert_eq!(player.duration_ms(), Some(500));
        assert!(output.is_open());
        player.play().unwrap();

        let mut consumed = 0usize;
        let mut ended = None;
        let deadline = Instant::now() + WAIT;
        while ended.is_none() {
            assert!(Instant::now() < deadline, "playback never ended");
            consumed += output.pull(256);
            while let Some(event) = player.try_event() {
                if let PlayerEvent::Ended { reason } = event {
                    ended = Some(reason);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(ended, Some(PlaybackEndReason::Eof));
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(player.position_ms(), 500);
        assert!(consumed >= 24_000);
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Eof));
        assert!(!output.is_open());
    }

    #[test]
    fn seek_reports_target_then_confirms() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 2_000);
        let (player, _output) = controller();
        open_ready(&player, SourceHandle::Path(path));

        player.seek(1_200).unwrap();
        assert_eq!(player.position_ms(), 1_200);
        let events = wait_for(&player, |e| matches!(e, PlayerEvent::SeekCompleted { .. }));
        let Some(PlayerEvent::SeekCompleted { position_ms }) = events.last() else {
            unreachable!()
        };
        assert!(position_ms.abs_diff(1_200) <= 25);
        wait_state(&player, PlaybackState::Ready);
        assert!(player.position_ms().abs_diff(1_200) <= 25);
    }

    #[test]
    fn double_pause_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 2_000);
        let (player, _output) = controller();
        open_ready(&player, SourceHandle::Path(path));
        player.play().unwrap();
        wait_state(&player, PlaybackState::Playing);

        player.pause().unwrap();
        wait_state(&player, PlaybackState::Paused);
        player.pause().unwrap();
        player.stop().unwrap();
        let events = wait_for(&player, |e| matches!(e, PlayerEvent::Ended { .. }));

        let paused = events
            .iter()
            .filter(|e| matches!(e, PlayerEvent::StateChanged { to: PlaybackState::Paused, .. }))
            .count();
        assert_eq!(paused, 1);
    }

    #[test]
    fn stalled_decoder_reports_one_underrun() {
        let (player, output) = controller();
        let (source, gate) = GatedSource::new(48_000, 2, 4_800);
        player.open_source(Box::new(source), "gated").unwrap();
        wait_for(&player, |e| matches!(e, PlayerEvent::Opened { .. }));
        wait_state(&player, PlaybackState::Ready);
        player.play().unwrap();
        wait_state(&player, PlaybackState::Playing);

        let deadline = Instant::now() + WAIT;
        while player.status().buffered_frames != Some(4_800) {
            assert!(Instant::now() < deadline, "source never buffered");
            std::thread::sleep(Duration::from_millis(1));
        }
        // Drain the buffered audio, then keep pulling while the source is stalled.
        for _ in 0..50 {
            output.pull(480);
        }
        let events = wait_for(&player, |e| matches!(e, PlayerEvent::Underrun));
        assert_eq!(
            events.iter().filter(|e| matches!(e, PlayerEvent::Underrun)).count(),
            1
        );
        for _ in 0..20 {
            output.pull(480);
        }
        std::thread::sleep(Duration::from_millis(50));
        while let Some(event) = player.try_event() {
            assert_ne!(event, PlayerEvent::Underrun);
        }
        assert_eq!(player.status().underrun_events, 1);
        drop(gate);
    }

    #[test]
    fn seeks_queued_behind_a_busy_worker_collapse_to_the_latest() {
        let (player, _output) = controller();
        let (mut source, _gate) = GatedSource::new(48_000, 2, 4_800);
        let seeks = source.seeks();
        let hold = source.hold_seeks();
        player.open_source(Box::new(source), "gated").unwrap();
        wait_for(&player, |e| matches!(e, PlayerEvent::Opened { .. }));
        wait_state(&player, PlaybackState::Ready);

        player.seek(100).unwrap();
        let deadline = Instant::now() + WAIT;
        while seeks.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "worker never started seeking");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(player.state(), PlaybackState::Seeking);
        assert_eq!(player.position_ms(), 100);

        player.seek(200).unwrap();
        player.seek(300).unwrap();
        player.seek(400).unwrap();
        assert_eq!(player.position_ms(), 400);
        drop(hold);

        let mut completed = Vec::new();
        wait_for(&player, |e| {
            if let PlayerEvent::SeekCompleted { position_ms } = e {
                completed.push(*position_ms);
            }
            completed.len() == 2
        });
        assert_eq!(completed, vec![100, 400]);
        assert_eq!(*seeks.lock().unwrap(), vec![100, 400]);
        wait_state(&player, PlaybackState::Ready);
        assert_eq!(player.position_ms(), 400);
    }

    #[test]
    fn seek_past_end_leaves_player_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 500);
        let (player, _output) = controller();
        open_ready(&player, SourceHandle::Path(path));

        player.seek(10_000).unwrap();
        let events = wait_for(&player, |e| matches!(e, PlayerEvent::EndOfStream));
        assert!(!events.iter().any(|e| matches!(e, PlayerEvent::Error { .. })));
        wait_state(&player, PlaybackState::Ready);
        assert_eq!(player.position_ms(), 500);
    }

    #[test]
    fn seek_before_open_is_rejected() {
        let (backend, hold) = ManualBackend::held(48_000, 2);
        let player = TransportController::with_backend(config(), Box::new(backend)).unwrap();
        let err = player.seek(100).unwrap_err();
        assert!(matches!(
            err,
            PlayerError::InvalidStateTransition {
                from: PlaybackState::Idle,
                command: "seek"
            }
        ));

        let (source, _gate) = GatedSource::new(48_000, 2, 4_800);
        player.open_source(Box::new(source), "slow").unwrap();
        assert_eq!(player.state(), PlaybackState::Opening);
        let err = player.seek(100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

        drop(hold);
        wait_state(&player, PlaybackState::Ready);
        player.seek(100).unwrap();
    }

    #[test]
    fn unsupported_file_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_garbage(dir.path(), "notes.txt");
        let (player, output) = controller();
        player.open(SourceHandle::Path(path)).unwrap();

        let events = wait_for(&player, |e| matches!(e, PlayerEvent::Error { .. }));
        let Some(PlayerEvent::Error { kind, .. }) = events.last() else {
            unreachable!()
        };
        assert_eq!(*kind, ErrorKind::UnsupportedFormat);
        wait_state(&player, PlaybackState::Error);
        assert!(!output.is_open());
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Error));
    }

    #[test]
    fn corrupt_stream_reports_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 2_000);
        let source = DemuxDecoder::open(SourceHandle::Path(path), None, 2)
            .unwrap()
            .map_decoder(|inner| {
                Box::new(FlakyDecoder::new(inner, |call| {
                    (call >= 3).then_some(SymphoniaError::DecodeError("corrupt packet"))
                }))
            });
        let (player, output) = controller();
        player.open_source(Box::new(source), "corrupt.wav").unwrap();

        let events = wait_for(&player, |e| matches!(e, PlayerEvent::Error { .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            PlayerEvent::StateChanged {
                to: PlaybackState::Error,
                ..
            }
        )));
        let Some(PlayerEvent::Error { kind, message }) = events.last() else {
            unreachable!()
        };
        assert_eq!(*kind, ErrorKind::Decode);
        assert!(message.contains("corrupt packet"), "{message}");
        assert_eq!(player.state(), PlaybackState::Error);
        assert!(!output.is_open());
    }

    #[test]
    fn device_failure_reports_error_and_releases_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 2_000);
        let (player, output) = controller();
        open_ready(&player, SourceHandle::Path(path));
        player.play().unwrap();
        wait_state(&player, PlaybackState::Playing);

        output.fail("device unplugged");
        let events = wait_for(&player, |e| matches!(e, PlayerEvent::Error { .. }));
        assert!(events.contains(&PlayerEvent::StateChanged {
            from: PlaybackState::Playing,
            to: PlaybackState::Error,
        }));
        let Some(PlayerEvent::Error { kind, .. }) = events.last() else {
            unreachable!()
        };
        assert_eq!(*kind, ErrorKind::Device);
        assert_eq!(player.state(), PlaybackState::Error);
        assert!(!output.is_open());
        assert_eq!(player.status().end_reason, Some(PlaybackEndReason::Error));
    }

    #[test]
    fn output_that_cannot_open_reports_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 500);
        let backend = ManualBackend::failing("no output device");
        let player = TransportController::with_backend(config(), Box::new(backend)).unwrap();
        player.open(SourceHandle::Path(path)).unwrap();

        let events = wait_for(&player, |e| matches!(e, PlayerEvent::Error { .. }));
        assert!(!events.iter().any(|e| matches!(e, PlayerEvent::Opened { .. })));
        let Some(PlayerEvent::Error { kind, message }) = events.last() else {
            unreachable!()
        };
        assert_eq!(*kind, ErrorKind::Device);
        assert!(message.contains("no output device"), "{message}");
        wait_state(&player, PlaybackState::Error);
        assert!(player.play().is_err());
    }

    #[test]
    fn stop_releases_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 2_000);
        let (player, output) = controller();
        open_ready(&player, SourceHandle::Path(path));
        player.play().unwrap();

        player.stop().unwrap();
        let events = wait_for(&player, |e| matches!(e, PlayerEvent::Ended { .. }));
        assert_eq!(
            events.last(),
            Some(&PlayerEvent::Ended {
                reason: PlaybackEndReason::Stopped
            })
        );
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert!(!output.is_open());
        assert!(player.status().now_playing.is_some());

        player.close().unwrap();
        wait_for(&player, |e| matches!(e, PlayerEvent::Ended { .. }));
        let status = player.status();
        assert!(status.now_playing.is_none());
        assert_eq!(status.position_ms, None);
    }

    #[test]
    fn volume_is_applied_to_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 1_000);
        let (player, output) = controller();
        player.set_volume(0.0);
        assert_eq!(player.volume(), 0.0);
        open_ready(&player, SourceHandle::Path(path));
        player.play().unwrap();
        wait_state(&player, PlaybackState::Playing);

        let mut peak = 0.0f32;
        for _ in 0..20 {
            output.pull_with(256, |samples| {
                peak = samples.iter().fold(peak, |m, s| m.max(s.abs()));
            });
        }
        assert_eq!(peak, 0.0);
        player.set_volume(3.0);
        assert_eq!(player.volume(), 1.0);
    }

    #[test]
    fn clips_play_over_open_output() {
        let dir = tempfile::tempdir().unwrap();
        let track = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 1_000);
        let click = write_sine_wav(dir.path(), "click.wav", 48_000, 1, 20);
        let (player, output) = controller();

        let clip = player.load_clip(SourceHandle::Path(click.clone())).unwrap();
        assert!(player.play_clip(&clip).is_err());

        open_ready(&player, SourceHandle::Path(track));
        let clip = player.load_clip(SourceHandle::Path(click)).unwrap();
        assert_eq!(clip.frames(), 960);
        let handle = player.play_clip(&clip).unwrap();
        assert!(player.is_clip_playing(handle));

        let mut heard = false;
        output.pull_with(1_024, |samples| {
            heard = samples.iter().any(|s| s.abs() > 0.0);
        });
        assert!(heard);
        let deadline = Instant::now() + WAIT;
        while player.is_clip_playing(handle) {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
