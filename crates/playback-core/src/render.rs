//! The real-time render callback.
//!
//! [`Renderer`] is moved into the output stream's data callback and is the only code
//! that runs on the audio thread. Per buffer it:
//! - reads normalized samples from the ring (only while `Playing`)
//! - fills any shortfall with silence and reports one underrun per starvation episode
//! - applies the volume, ramping linearly across the buffer when it changed
//! - mixes active clip voices
//!
//! It never locks, allocates or logs.

use std::sync::Arc;

use playback_types::PlaybackState;

use crate::engine::{EngineShared, Notice};
use crate::mixer::VoiceBank;
use crate::ring::RingConsumer;

/// Scratch size used for non-`f32` devices when the buffer size is unknown.
const DEFAULT_SCRATCH_FRAMES: usize = 4096;

pub struct Renderer {
    shared: Arc<EngineShared>,
    ring: RingConsumer,
    notices: rtrb::Producer<Notice>,
    voices: Option<VoiceBank>,
    channels: usize,
    gain: f32,
    starved: bool,
    drained_sent: bool,
    scratch: Vec<f32>,
}

impl Renderer {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        ring: RingConsumer,
        notices: rtrb::Producer<Notice>,
        voices: Option<VoiceBank>,
        channels: usize,
        buffer_frames: Option<u32>,
    ) -> Self {
        let channels = channels.max(1);
        let scratch_frames = buffer_frames
            .map(|f| f as usize)
            .unwrap_or(DEFAULT_SCRATCH_FRAMES)
            .max(1);
        Self {
            gain: shared.volume(),
            shared,
            ring,
            notices,
            voices,
            channels,
            starved: false,
            drained_sent: false,
            scratch: vec![0.0; scratch_frames * channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Handle for the stream's error callback.
    pub fn error_sink(&self) -> DeviceErrorSink {
        DeviceErrorSink(self.shared.clone())
    }

    /// Fill `out` (interleaved `f32`, whole frames) for one device buffer.
    pub fn render(&mut self, out: &mut [f32]) {
        let ch = self.channels;
        let frames = out.len() / ch;
        let eos = self.shared.is_eos();
        if !eos {
            self.drained_sent = false;
        }

        // Snapshot before the state so a seek reset landing after the check is seen.
        let generation = self.ring.generation();
        if self.shared.state() == PlaybackState::Playing {
            let read = self.ring.read(out);
            out[read..].fill(0.0);
            let read_frames = read / ch;
            self.shared.add_consumed(read_frames as u64);

            if read_frames < frames {
                if self.ring.generation() != generation {
                    // Emptied by a seek or stop, not starved.
                    self.starved = false;
                } else if eos {
                    if !self.drained_sent && self.ring.available_to_read() == 0 {
                        self.drained_sent = self.notices.push(Notice::Drained).is_ok();
                    }
                } else {
                    let new_episode = !self.starved;
                    self.shared
                        .record_underrun((frames - read_frames) as u64, new_episode);
                    if new_episode {
                        let _ = self.notices.push(Notice::Underrun);
                    }
                    self.starved = true;
                }
            } else {
                self.starved = false;
            }
            self.apply_gain(out);
        } else {
            out.fill(0.0);
            self.starved = false;
        }

        if let Some(voices) = self.voices.as_mut() {
            voices.mix(out);
        }
    }

    /// Render into a device buffer of another sample type through the scratch buffer.
    pub fn render_as<T>(&mut self, out: &mut [T])
    where
        T: cpal::Sample + cpal::FromSample<f32>,
    {
        let block = (self.scratch.len() / self.channels).max(1) * self.channels;
        let mut scratch = std::mem::take(&mut self.scratch);
        for dst in out.chunks_mut(block) {
            let buf = &mut scratch[..dst.len()];
            self.render(buf);
            for (d, s) in dst.iter_mut().zip(buf.iter()) {
                *d = T::from_sample(*s);
            }
        }
        self.scratch = scratch;
    }

    fn apply_gain(&mut self, out: &mut [f32]) {
        let target = self.shared.volume();
        let start = self.gain;
        self.gain = target;

        if start == target {
            if target != 1.0 {
                out.iter_mut().for_each(|s| *s *= target);
            }
            return;
        }

        let frames = out.len() / self.channels;
        if frames == 0 {
            return;
        }
        let step = (target - start) / frames as f32;
        for (i, frame) in out.chunks_exact_mut(self.channels).enumerate() {
            let g = start + step * (i + 1) as f32;
            frame.iter_mut().for_each(|s| *s *= g);
        }
    }
}

/// Flags an output stream failure for the worker to pick up.
#[derive(Clone)]
pub struct DeviceErrorSink(Arc<EngineShared>);

impl DeviceErrorSink {
    pub fn report(&self, message: &str) {
        tracing::warn!(error = message, "output stream error");
        self.0.flag_device_failure();
    }
}
