//! Clip mixer: short, fully decoded sounds layered over the main stream.
//!
//! The mixer is split the same way the main path is:
//! - [`ClipMixer`] lives on the control side and hands out [`ClipHandle`]s
//! - [`VoiceBank`] is owned by the output callback and mixes active voices
//!
//! Starts/stops travel to the callback over an `rtrb` queue. The control side keeps a
//! reference to every clip the callback may hold, and only drops it after the callback
//! reports the voice finished, so clip memory is never freed on the real-time thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::PlaybackConfig;
use crate::decode::{DecodeOutcome, DemuxDecoder, FrameSource, PcmFormat, SampleFormat, SourceHandle};
use crate::error::{PlayerError, Result};
use crate::normalize::Normalizer;

/// A sound decoded into memory in the output format.
#[derive(Debug)]
pub struct Clip {
    samples: Vec<f32>,
    format: PcmFormat,
    label: String,
}

impl Clip {
    /// Decode and normalize a whole source into memory.
    pub fn load(source: SourceHandle, target: PcmFormat, config: &PlaybackConfig) -> Result<Arc<Clip>> {
        let label = source.label();
        let mut decoder = DemuxDecoder::open(source, None, config.max_decode_retries)?;
        let mut normalizer =
            Normalizer::new(decoder.info().format, target, config.chunk_frames)?;
        let mut samples = Vec::new();
        loop {
            match decoder.next_frame()? {
                DecodeOutcome::Frame(frame) => {
                    if let Some(out) = normalizer.process(frame)? {
                        samples.extend_from_slice(&out.samples);
                    }
                }
                DecodeOutcome::EndOfStream => break,
            }
        }
        if let Some(tail) = normalizer.flush()? {
            samples.extend_from_slice(&tail.samples);
        }
        decoder.close();
        tracing::debug!(clip = %label, frames = samples.len() / target.channels.max(1), "clip loaded");
        Ok(Arc::new(Clip {
            samples,
            format: normalizer.target(),
            label,
        }))
    }

    /// Wrap already-normalized interleaved samples.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, channels: usize) -> Arc<Clip> {
        Arc::new(Clip {
            samples,
            format: PcmFormat::new(sample_rate, channels, SampleFormat::F32),
            label: String::from("<memory>"),
        })
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1)
    }

    pub fn duration_ms(&self) -> u64 {
        self.frames() as u64 * 1000 / self.format.sample_rate.max(1) as u64
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Identifies one playback of a clip. `id` is the voice; `nonce` the playback instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClipHandle {
    pub id: usize,
    pub nonce: u64,
}

enum MixerCommand {
    Start {
        voice: usize,
        nonce: u64,
        clip: Arc<Clip>,
    },
    Stop {
        voice: usize,
        nonce: u64,
    },
}

/// Build a connected control/callback pair with `voices` voices.
pub(crate) fn clip_mixer(format: PcmFormat, voices: usize) -> (ClipMixer, VoiceBank) {
    let voices = voices.max(1);
    let capacity = voices * 4;
    let (command_tx, command_rx) = rtrb::RingBuffer::new(capacity);
    let (finished_tx, finished_rx) = rtrb::RingBuffer::new(capacity);
    let active: Arc<[AtomicU64]> = (0..voices).map(|_| AtomicU64::new(0)).collect();
    (
        ClipMixer {
            format,
            commands: command_tx,
            finished: finished_rx,
            active: active.clone(),
            held: Vec::with_capacity(capacity),
            capacity,
            next_nonce: 1,
        },
        VoiceBank {
            commands: command_rx,
            finished: finished_tx,
            active,
            voices: (0..voices)
                .map(|_| Voice {
                    clip: None,
                    nonce: 0,
                    pos: 0,
                })
                .collect(),
        },
    )
}

/// Control half of the clip mixer.
pub struct ClipMixer {
    format: PcmFormat,
    commands: rtrb::Producer<MixerCommand>,
    finished: rtrb::Consumer<u64>,
    /// Per-voice nonce of the playing clip, 0 when idle.
    active: Arc<[AtomicU64]>,
    /// Clips the callback may still reference, by nonce.
    held: Vec<(u64, Arc<Clip>)>,
    capacity: usize,
    next_nonce: u64,
}

impl ClipMixer {
    /// Output format clips must be loaded in.
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn voices(&self) -> usize {
        self.active.len()
    }

    /// Start `clip` on a free voice, stealing the oldest voice when all are busy.
    pub fn play(&mut self, clip: &Arc<Clip>) -> Result<ClipHandle> {
        self.reap();
        let fmt = clip.format();
        if fmt.sample_rate != self.format.sample_rate || fmt.channels != self.format.channels {
            return Err(PlayerError::UnsupportedFormat(format!(
                "clip is {} Hz / {} ch, output is {} Hz / {} ch",
                fmt.sample_rate, fmt.channels, self.format.sample_rate, self.format.channels
            )));
        }
        if self.held.len() >= self.capacity {
            return Err(PlayerError::Device("clip mixer is saturated".into()));
        }

        let voice = self.pick_voice();
        let nonce = self.next_nonce;
        self.next_nonce += 1;

        let previous = self.active[voice].swap(nonce, Ordering::AcqRel);
        let cmd = MixerCommand::Start {
            voice,
            nonce,
            clip: clip.clone(),
        };
        if self.commands.push(cmd).is_err() {
            self.active[voice].store(previous, Ordering::Release);
            return Err(PlayerError::Device("clip command queue is full".into()));
        }
        self.held.push((nonce, clip.clone()));
        Ok(ClipHandle { id: voice, nonce })
    }

    /// Stop a playing clip. Stale handles are ignored.
    pub fn stop(&mut self, handle: ClipHandle) {
        self.reap();
        let Some(slot) = self.active.get(handle.id) else {
            return;
        };
        if slot
            .compare_exchange(handle.nonce, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.commands.push(MixerCommand::Stop {
                voice: handle.id,
                nonce: handle.nonce,
            });
        }
    }

    pub fn is_playing(&self, handle: ClipHandle) -> bool {
        self.active
            .get(handle.id)
            .is_some_and(|slot| slot.load(Ordering::Acquire) == handle.nonce)
    }

    /// Release clips the callback has finished with.
    pub fn reap(&mut self) {
        while let Ok(nonce) = self.finished.pop() {
            self.held.retain(|(n, _)| *n != nonce);
        }
    }

    fn pick_voice(&self) -> usize {
        let mut oldest = (0, u64::MAX);
        for (i, slot) in self.active.iter().enumerate() {
            let nonce = slot.load(Ordering::Acquire);
            if nonce == 0 {
                return i;
            }
            if nonce < oldest.1 {
                oldest = (i, nonce);
            }
        }
        oldest.0
    }
}

struct Voice {
    clip: Option<Arc<Clip>>,
    nonce: u64,
    pos: usize,
}

/// Callback half of the clip mixer.
pub(crate) struct VoiceBank {
    commands: rtrb::Consumer<MixerCommand>,
    finished: rtrb::Producer<u64>,
    active: Arc<[AtomicU64]>,
    voices: Vec<Voice>,
}

impl VoiceBank {
    /// Apply queued commands and add every active voice into `out`.
    pub(crate) fn mix(&mut self, out: &mut [f32]) {
        while let Ok(cmd) = self.commands.pop() {
            match cmd {
                MixerCommand::Start { voice, nonce, clip } => {
                    if voice < self.voices.len() {
                        self.release(voice);
                        let v = &mut self.voices[voice];
                        v.clip = Some(clip);
                        v.nonce = nonce;
                        v.pos = 0;
                    } else {
                        let _ = self.finished.push(nonce);
                    }
                }
                MixerCommand::Stop { voice, nonce } => {
                    if self.voices.get(voice).is_some_and(|v| v.nonce == nonce) {
                        self.release(voice);
                    }
                }
            }
        }

        for i in 0..self.voices.len() {
            let done = {
                let v = &mut self.voices[i];
                let Some(clip) = v.clip.as_ref() else {
                    continue;
                };
                let remaining = &clip.samples[v.pos.min(clip.samples.len())..];
                let n = remaining.len().min(out.len());
                for (dst, src) in out[..n].iter_mut().zip(remaining) {
                    *dst += *src;
                }
                v.pos += n;
                v.pos >= clip.samples.len()
            };
            if done {
                self.release(i);
            }
        }
    }

    fn release(&mut self, voice: usize) {
        let v = &mut self.voices[voice];
        if v.clip.take().is_none() {
            return;
        }
        let _ = self.active[voice].compare_exchange(v.nonce, 0, Ordering::AcqRel, Ordering::Acquire);
        // Capacity covers every clip the control side holds, so this never fails.
        let _ = self.finished.push(v.nonce);
        v.nonce = 0;
        v.pos = 0;
    }
}
