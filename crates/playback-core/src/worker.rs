//! Playback worker thread.
//!
//! The worker is the decode thread and the only writer of the playback state. Each
//! loop iteration it:
//! - applies queued transport commands in submission order
//! - turns callback notices (underrun, drained) and device failures into events
//! - decodes, normalizes and writes one block into the ring (bounded backpressure wait)
//!
//! It also owns the output stream, which is opened per source and dropped on
//! stop/close/end of stream.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use playback_types::{PlaybackEndReason, PlaybackState};

use crate::config::{PlaybackConfig, ring_capacity_samples};
use crate::decode::{DecodeOutcome, DemuxDecoder, FrameSource, SeekOutcome, SourceHandle};
use crate::engine::{EngineShared, NOTICE_CAPACITY, Notice};
use crate::error::{PlayerError, Result};
use crate::events::PlayerEvent;
use crate::mixer::{ClipMixer, clip_mixer};
use crate::normalize::Normalizer;
use crate::playback::{OutputBackend, OutputRequest, OutputStream};
use crate::render::Renderer;
use crate::ring::{RingBuffer, RingHandle, RingProducer, WriteOutcome};
use crate::status::TrackStatus;

const IDLE_WAIT: Duration = Duration::from_millis(10);
/// Command wait while nothing but a command can make progress.
const PARKED_WAIT: Duration = Duration::from_millis(250);
const PREFILL_MAX_STEPS: usize = 256;

/// What to open.
pub(crate) enum OpenRequest {
    Handle {
        source: SourceHandle,
        stream_index: Option<usize>,
    },
    Source {
        source: Box<dyn FrameSource>,
        label: String,
    },
}

/// Commands accepted by the playback worker thread.
pub(crate) enum Command {
    Open(OpenRequest),
    Play,
    Pause,
    /// Target is read from [`EngineShared`] so queued seeks coalesce.
    Seek,
    Stop,
    Close,
    Shutdown,
}

/// State the worker publishes to the control side behind short-lived locks.
#[derive(Default)]
pub(crate) struct Published {
    pub(crate) track: Mutex<TrackStatus>,
    pub(crate) mixer: Mutex<Option<ClipMixer>>,
    pub(crate) ring: Mutex<Option<RingHandle>>,
}

struct Carry {
    samples: Vec<f32>,
    offset: usize,
}

enum Pump {
    /// Decoded or wrote something.
    Progress,
    /// The ring stayed full for a whole backpressure wait.
    Blocked,
    /// The ring is full and the callback is not draining it.
    Full,
    /// Nothing left to do for this source.
    Idle,
    /// The last sample of the source is in the ring.
    Finished,
}

/// Everything that exists only while a source is open.
struct Session {
    stream: Option<Box<dyn OutputStream>>,
    source: Box<dyn FrameSource>,
    normalizer: Normalizer,
    producer: RingProducer,
    ring: RingHandle,
    notices: rtrb::Consumer<Notice>,
    carry: Option<Carry>,
    decoder_done: bool,
    finished_reported: bool,
}

impl Session {
    /// Decode or write one block. `draining` is whether the callback consumes the ring.
    fn pump(&mut self, wait: Duration, draining: bool) -> Result<Pump> {
        if let Some(carry) = self.carry.as_mut() {
            if !draining && self.producer.available_to_write() < self.ring.frame_len() {
                return Ok(Pump::Full);
            }
            return Ok(
                match self
                    .producer
                    .write_timeout(&carry.samples[carry.offset..], wait)
                {
                    WriteOutcome::Complete => {
                        self.carry = None;
                        Pump::Progress
                    }
                    WriteOutcome::TimedOut { written } => {
                        carry.offset += written;
                        if written > 0 { Pump::Progress } else { Pump::Blocked }
                    }
                },
            );
        }

        if self.decoder_done {
            if self.finished_reported {
                return Ok(Pump::Idle);
            }
            self.finished_reported = true;
            return Ok(Pump::Finished);
        }

        match self.source.next_frame()? {
            DecodeOutcome::Frame(frame) => {
                if let Some(out) = self.normalizer.process(frame)? {
                    self.carry = Some(Carry {
                        samples: out.samples,
                        offset: 0,
                    });
                }
            }
            DecodeOutcome::EndOfStream => {
                if let Some(tail) = self.normalizer.flush()? {
                    self.carry = Some(Carry {
                        samples: tail.samples,
                        offset: 0,
                    });
                }
                self.decoder_done = true;
            }
        }
        Ok(Pump::Progress)
    }

    /// Drop buffered audio and reposition the source.
    fn seek(&mut self, position_ms: u64) -> Result<SeekOutcome> {
        self.carry = None;
        let outcome = self.source.seek(position_ms)?;
        self.normalizer.reset();
        self.ring.reset();
        self.decoder_done = matches!(outcome, SeekOutcome::BeyondEnd { .. });
        self.finished_reported = self.decoder_done;
        Ok(outcome)
    }
}

pub(crate) struct Worker {
    config: PlaybackConfig,
    shared: Arc<EngineShared>,
    published: Arc<Published>,
    backend: Box<dyn OutputBackend>,
    commands: Receiver<Command>,
    events: Sender<PlayerEvent>,
    session: Option<Session>,
    last_position_event: Instant,
}

impl Worker {
    /// Start the worker on its own named thread.
    ///
    /// The worker is built on that thread: output streams are not `Send` on every
    /// platform, so they are only ever touched there.
    pub(crate) fn spawn(
        config: PlaybackConfig,
        shared: Arc<EngineShared>,
        published: Arc<Published>,
        backend: Box<dyn OutputBackend>,
        commands: Receiver<Command>,
        events: Sender<PlayerEvent>,
    ) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("playback-worker".into())
            .spawn(move || {
                let worker = Self {
                    config,
                    shared,
                    published,
                    backend,
                    commands,
                    events,
                    session: None,
                    last_position_event: Instant::now(),
                };
                worker.run();
            })
            .map_err(PlayerError::Io)
    }

    fn run(mut self) {
        tracing::debug!("playback worker started");
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(cmd) => {
                        if self.dispatch(cmd).is_break() {
                            return self.shutdown();
                        }
                    }
                    Err(crossbeam_channel::TryRecvError::Empty) => break,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => {
                        return self.shutdown();
                    }
                }
            }

            self.pump_notices();
            let idle = self.pump_audio();
            self.emit_position();

            if let Some(wait) = idle {
                match self.commands.recv_timeout(wait) {
                    Ok(cmd) => {
                        if self.dispatch(cmd).is_break() {
                            return self.shutdown();
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return self.shutdown(),
                }
            }
        }
    }

    fn shutdown(mut self) {
        self.release();
        tracing::debug!("playback worker stopped");
    }

    fn dispatch(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Open(request) => {
                self.open(request);
                self.shared.finish_open();
            }
            Command::Play => self.play(),
            Command::Pause => match self.shared.state() {
                PlaybackState::Playing => self.set_state(PlaybackState::Paused),
                PlaybackState::Paused => {}
                other => tracing::debug!(state = %other, "pause ignored"),
            },
            Command::Seek => self.seek(),
            Command::Stop => self.finish(PlaybackEndReason::Stopped),
            Command::Close => self.close(),
            Command::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn open(&mut self, request: OpenRequest) {
        self.release();
        self.set_state(PlaybackState::Opening);

        let opened = match request {
            OpenRequest::Handle {
                source,
                stream_index,
            } => {
                let label = source.label();
                tracing::info!(source = %label, stream_index = ?stream_index, "opening source");
                DemuxDecoder::open(source, stream_index, self.config.max_decode_retries)
                    .and_then(|decoder| self.start_session(Box::new(decoder), label))
            }
            OpenRequest::Source { source, label } => {
                tracing::info!(source = %label, "opening source");
                self.start_session(source, label)
            }
        };
        if let Err(err) = opened {
            self.fail(err);
        }
    }

    fn start_session(&mut self, source: Box<dyn FrameSource>, label: String) -> Result<()> {
        let info = source.info().clone();
        let output = self
            .backend
            .negotiate(&OutputRequest::from_config(&self.config))?;
        let format = output.format;
        let normalizer = Normalizer::new(info.format, format, self.config.chunk_frames)?;

        let capacity = ring_capacity_samples(
            format.sample_rate,
            format.channels,
            self.config.ring_buffer_ms,
        );
        let (producer, consumer) =
            RingBuffer::with_frames(capacity / format.channels.max(1), format.channels);
        let ring = producer.handle();
        let (notice_tx, notices) = rtrb::RingBuffer::new(NOTICE_CAPACITY);
        let (mixer, voices) = clip_mixer(format, self.config.mixer_voices);

        self.shared.reset_counters();
        self.shared.set_output_rate(format.sample_rate);
        self.shared.set_duration_ms(info.duration_ms);
        self.shared.set_eos(false);

        let renderer = Renderer::new(
            self.shared.clone(),
            consumer,
            notice_tx,
            Some(voices),
            format.channels,
            output.buffer_frames,
        );
        let stream = self.backend.start(&output, renderer)?;

        let resampling = normalizer.is_resampling();
        if let Ok(mut track) = self.published.track.lock() {
            track.now_playing = Some(label.clone());
            track.stream = Some(info.clone());
            track.output = Some(output.clone());
            track.resampling = Some(resampling);
            track.buffer_capacity_frames = Some((ring.capacity() / format.channels) as u64);
            track.end_reason = None;
        }
        if let Ok(mut slot) = self.published.mixer.lock() {
            *slot = Some(mixer);
        }
        if let Ok(mut slot) = self.published.ring.lock() {
            *slot = Some(ring.clone());
        }

        self.session = Some(Session {
            stream: Some(stream),
            source,
            normalizer,
            producer,
            ring,
            notices,
            carry: None,
            decoder_done: false,
            finished_reported: false,
        });

        tracing::info!(
            source = %label,
            codec = info.codec.as_deref().unwrap_or("unknown"),
            from_hz = info.format.sample_rate,
            to_hz = format.sample_rate,
            resampling,
            duration_ms = ?info.duration_ms,
            "source opened"
        );
        self.set_state(PlaybackState::Ready);
        self.emit(PlayerEvent::Opened {
            source: label,
            stream: info,
            output,
            resampling,
        });
        Ok(())
    }

    fn play(&mut self) {
        match self.shared.state() {
            PlaybackState::Ready | PlaybackState::Paused => {
                self.prefill();
                if matches!(
                    self.shared.state(),
                    PlaybackState::Ready | PlaybackState::Paused
                ) {
                    self.set_state(PlaybackState::Playing);
                    self.last_position_event = Instant::now();
                }
            }
            PlaybackState::Playing => {}
            other => tracing::debug!(state = %other, "play ignored"),
        }
    }

    /// Decode ahead until a quarter of the ring is filled so playback does not start starved.
    fn prefill(&mut self) {
        for _ in 0..PREFILL_MAX_STEPS {
            let Some(session) = self.session.as_ref() else {
                return;
            };
            if session.ring.available_to_read() >= session.ring.capacity() / 4 {
                return;
            }
            match self.step(Duration::ZERO, true) {
                Pump::Progress => {}
                _ => return,
            }
        }
    }

    fn seek(&mut self) {
        let resume = self.shared.state();
        if self.session.is_none()
            || !matches!(
                resume,
                PlaybackState::Ready | PlaybackState::Playing | PlaybackState::Paused
            )
        {
            let target = self.shared.take_seek();
            tracing::debug!(state = %resume, target_ms = target, "seek ignored");
            return;
        }

        // Enter Seeking before releasing the queued flag so readers always see the target.
        self.set_state(PlaybackState::Seeking);
        let target = self.shared.take_seek();
        let outcome = match self.session.as_mut() {
            Some(session) => session.seek(target),
            None => return,
        };

        match outcome {
            Ok(SeekOutcome::Positioned { position_ms }) => {
                self.shared.rebase(position_ms);
                self.shared.set_eos(false);
                tracing::info!(target_ms = target, position_ms, "seek completed");
                self.emit(PlayerEvent::SeekCompleted { position_ms });
                if resume == PlaybackState::Playing {
                    self.prefill();
                }
                if self.shared.state() == PlaybackState::Seeking {
                    self.set_state(resume);
                }
            }
            Ok(SeekOutcome::BeyondEnd { end_ms }) => {
                let end = end_ms.or(self.shared.duration_ms()).unwrap_or(target);
                self.shared.rebase(end);
                self.shared.set_eos(true);
                tracing::info!(target_ms = target, end_ms = end, "seek beyond end of stream");
                self.emit(PlayerEvent::SeekCompleted { position_ms: end });
                self.set_state(PlaybackState::Ready);
                self.emit(PlayerEvent::EndOfStream);
            }
            Err(err) => self.fail(err),
        }
    }

    /// Stop playback and release the stream, keeping the track metadata.
    fn finish(&mut self, reason: PlaybackEndReason) {
        self.end(reason, false);
    }

    /// Stop and forget the source entirely.
    fn close(&mut self) {
        self.end(PlaybackEndReason::Stopped, true);
    }

    fn end(&mut self, reason: PlaybackEndReason, forget: bool) {
        self.release();
        if let Ok(mut track) = self.published.track.lock() {
            track.end_reason = Some(reason);
            if forget {
                track.clear_playback();
            } else {
                track.clear_output();
            }
        }
        if forget {
            self.shared.reset_counters();
            self.shared.set_duration_ms(None);
        }
        tracing::info!(reason = ?reason, closed = forget, "playback ended");
        self.set_state(PlaybackState::Stopped);
        self.emit(PlayerEvent::Ended { reason });
    }

    fn fail(&mut self, err: PlayerError) {
        tracing::warn!(error = %err, kind = ?err.kind(), "playback failed");
        self.release();
        if let Ok(mut track) = self.published.track.lock() {
            track.end_reason = Some(PlaybackEndReason::Error);
            track.clear_output();
        }
        self.set_state(PlaybackState::Error);
        self.emit(PlayerEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    /// Tear down the current source: the stream first so the callback stops, then the rest.
    fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            drop(session.stream.take());
            drop(session);
        }
        if let Ok(mut slot) = self.published.mixer.lock() {
            *slot = None;
        }
        if let Ok(mut slot) = self.published.ring.lock() {
            *slot = None;
        }
        self.shared.set_eos(false);
    }

    /// Feed the ring; returns how long the loop may block on commands, `None` when busy.
    fn pump_audio(&mut self) -> Option<Duration> {
        let state = self.shared.state();
        if !matches!(
            state,
            PlaybackState::Ready | PlaybackState::Playing | PlaybackState::Paused
        ) {
            return Some(PARKED_WAIT);
        }
        let playing = state == PlaybackState::Playing;
        let wait = Duration::from_millis(self.config.write_wait_ms);
        match self.step(wait, playing) {
            Pump::Progress | Pump::Blocked => None,
            // Still polling for the drained notice.
            Pump::Idle | Pump::Finished if playing => Some(IDLE_WAIT),
            Pump::Full | Pump::Idle | Pump::Finished => Some(PARKED_WAIT),
        }
    }

    fn step(&mut self, wait: Duration, draining: bool) -> Pump {
        let Some(session) = self.session.as_mut() else {
            return Pump::Idle;
        };
        match session.pump(wait, draining) {
            Ok(Pump::Finished) => {
                self.shared.set_eos(true);
                tracing::debug!("decoder reached end of stream");
                self.emit(PlayerEvent::EndOfStream);
                Pump::Finished
            }
            Ok(other) => other,
            Err(err) => {
                self.fail(err);
                Pump::Idle
            }
        }
    }

    fn pump_notices(&mut self) {
        if self.shared.take_device_failure() {
            if self.session.is_some() {
                self.fail(PlayerError::Device("output stream failed".into()));
            }
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut underruns = 0;
        let mut drained = false;
        while let Ok(notice) = session.notices.pop() {
            match notice {
                Notice::Underrun => underruns += 1,
                Notice::Drained => drained = true,
            }
        }
        let ring_empty = session.ring.available_to_read() == 0;

        for _ in 0..underruns {
            tracing::debug!(
                underrun_events = self.shared.underrun_events(),
                "output underrun"
            );
            self.emit(PlayerEvent::Underrun);
        }

        if let Ok(mut mixer) = self.published.mixer.lock() {
            if let Some(mixer) = mixer.as_mut() {
                mixer.reap();
            }
        }

        if self.shared.state() == PlaybackState::Playing
            && self.shared.is_eos()
            && (drained || ring_empty)
        {
            self.finish(PlaybackEndReason::Eof);
        }
    }

    fn emit_position(&mut self) {
        if self.shared.state() != PlaybackState::Playing {
            return;
        }
        let interval = Duration::from_millis(self.config.position_interval_ms.max(1));
        if self.last_position_event.elapsed() >= interval {
            self.last_position_event = Instant::now();
            self.emit(PlayerEvent::Position {
                position_ms: self.shared.position_ms(),
            });
        }
    }

    fn set_state(&mut self, to: PlaybackState) {
        let from = self.shared.state();
        if from == to {
            return;
        }
        if !from.can_transition(to) {
            tracing::warn!(%from, %to, "unexpected state transition");
        }
        self.shared.store_state(to);
        tracing::debug!(%from, %to, "state changed");
        self.emit(PlayerEvent::StateChanged { from, to });
    }

    fn emit(&self, event: PlayerEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::trace!(?event, "event dropped: host is not draining");
        }
    }
}
