//! Fixtures shared by unit tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use symphonia::core::audio::AudioBufferRef;
use symphonia::core::codecs::{
    CodecDescriptor, CodecParameters, Decoder, DecoderOptions, FinalizeResult,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use crate::decode::{
    DecodeOutcome, DecodedFrame, FrameSource, PcmFormat, PcmSamples, SampleFormat, SeekOutcome,
    StreamInfo,
};
use crate::error::{PlayerError, Result};
use crate::playback::{NegotiatedOutput, OutputBackend, OutputRequest, OutputStream};
use crate::render::Renderer;

/// Write a 16-bit sine WAV of `duration_ms` and return its path.
pub(crate) fn write_sine_wav(
    dir: &Path,
    name: &str,
    sample_rate: u32,
    channels: u16,
    duration_ms: u32,
) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    let frames = sample_rate as u64 * duration_ms as u64 / 1000;
    for n in 0..frames {
        let t = n as f32 / sample_rate as f32;
        let value = (t * 440.0 * std::f32::consts::TAU).sin() * 0.5;
        for _ in 0..channels {
            writer.write_sample((value * i16::MAX as f32) as i16).unwrap();
        }
    }
    writer.finalize().unwrap();
    path
}

/// Write bytes that no demuxer recognises.
pub(crate) fn write_garbage(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "plain text, not audio\n".repeat(256)).unwrap();
    path
}

/// Output backend driven by the test instead of a device callback.
pub(crate) struct ManualBackend {
    sample_rate: u32,
    channels: usize,
    output: ManualOutput,
    hold: Option<Receiver<()>>,
    refuse: Option<&'static str>,
}

impl ManualBackend {
    pub(crate) fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            output: ManualOutput {
                renderer: Arc::new(Mutex::new(None)),
                channels,
            },
            hold: None,
            refuse: None,
        }
    }

    /// A backend whose negotiation fails with a device error.
    pub(crate) fn failing(message: &'static str) -> Self {
        let mut backend = Self::new(48_000, 2);
        backend.refuse = Some(message);
        backend
    }

    /// A backend whose negotiation blocks until the returned sender is dropped.
    pub(crate) fn held(sample_rate: u32, channels: usize) -> (Self, Sender<()>) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let mut backend = Self::new(sample_rate, channels);
        backend.hold = Some(rx);
        (backend, tx)
    }

    pub(crate) fn output(&self) -> ManualOutput {
        self.output.clone()
    }
}

impl OutputBackend for ManualBackend {
    fn negotiate(&mut self, _request: &OutputRequest) -> Result<NegotiatedOutput> {
        if let Some(hold) = &self.hold {
            let _ = hold.recv();
        }
        if let Some(message) = self.refuse {
            return Err(PlayerError::Device(message.into()));
        }
        Ok(NegotiatedOutput {
            device: "manual".into(),
            format: PcmFormat::new(self.sample_rate, self.channels, SampleFormat::F32),
            device_sample_format: "F32".into(),
            buffer_frames: Some(256),
        })
    }

    fn start(
        &mut self,
        _output: &NegotiatedOutput,
        renderer: Renderer,
    ) -> Result<Box<dyn OutputStream>> {
        *self.output.renderer.lock().unwrap() = Some(renderer);
        Ok(Box::new(ManualStream(self.output.clone())))
    }
}

/// Test-side handle on the renderer of the open stream.
#[derive(Clone)]
pub(crate) struct ManualOutput {
    renderer: Arc<Mutex<Option<Renderer>>>,
    channels: usize,
}

impl ManualOutput {
    /// Run one callback of `frames`; returns the frames rendered (0 when no stream is open).
    pub(crate) fn pull(&self, frames: usize) -> usize {
        let mut rendered = 0;
        self.pull_with(frames, |samples| rendered = samples.len() / self.channels);
        rendered
    }

    pub(crate) fn pull_with(&self, frames: usize, inspect: impl FnOnce(&[f32])) {
        let mut guard = self.renderer.lock().unwrap();
        if let Some(renderer) = guard.as_mut() {
            let mut buf = vec![0.0; frames * self.channels];
            renderer.render(&mut buf);
            inspect(&buf);
        }
    }

    /// Report a stream failure the way the device error callback does.
    pub(crate) fn fail(&self, message: &str) {
        if let Some(renderer) = self.renderer.lock().unwrap().as_ref() {
            renderer.error_sink().report(message);
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.renderer.lock().unwrap().is_some()
    }
}

struct ManualStream(ManualOutput);

impl OutputStream for ManualStream {}

impl Drop for ManualStream {
    fn drop(&mut self) {
        if let Ok(mut renderer) = self.0.renderer.lock() {
            *renderer = None;
        }
    }
}

/// Frame source that yields a fixed amount of audio, then stalls (empty frames)
/// until its gate is dropped, then ends.
pub(crate) struct GatedSource {
    info: StreamInfo,
    remaining: usize,
    emitted: u64,
    gate: Receiver<()>,
    seeks: Arc<Mutex<Vec<u64>>>,
    seek_hold: Option<Receiver<()>>,
}

impl GatedSource {
    const CHUNK: usize = 480;

    pub(crate) fn new(sample_rate: u32, channels: usize, frames: usize) -> (Self, Sender<()>) {
        let (tx, gate) = crossbeam_channel::bounded(0);
        let source = Self {
            info: StreamInfo {
                stream_index: 0,
                track_id: 0,
                format: PcmFormat::new(sample_rate, channels, SampleFormat::F32),
                duration_ms: None,
                codec: Some("pcm".into()),
                bit_depth: Some(32),
                container: None,
            },
            remaining: frames,
            emitted: 0,
            gate,
            seeks: Arc::new(Mutex::new(Vec::new())),
            seek_hold: None,
        };
        (source, tx)
    }

    /// Targets of every seek, in order.
    pub(crate) fn seeks(&self) -> Arc<Mutex<Vec<u64>>> {
        self.seeks.clone()
    }

    /// Make every seek block until the returned sender is dropped.
    pub(crate) fn hold_seeks(&mut self) -> Sender<()> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        self.seek_hold = Some(rx);
        tx
    }

    fn frame(&mut self, frames: usize) -> DecodedFrame {
        let fmt = self.info.format;
        let pts_ms = self.emitted as f64 * 1000.0 / fmt.sample_rate as f64;
        self.emitted += frames as u64;
        DecodedFrame {
            samples: PcmSamples::F32(vec![0.25; frames * fmt.channels]),
            sample_rate: fmt.sample_rate,
            channels: fmt.channels,
            pts_ms,
        }
    }
}

impl FrameSource for GatedSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<DecodeOutcome> {
        if self.remaining > 0 {
            let frames = self.remaining.min(Self::CHUNK);
            self.remaining -= frames;
            return Ok(DecodeOutcome::Frame(self.frame(frames)));
        }
        match self.gate.recv_timeout(Duration::from_millis(2)) {
            Err(RecvTimeoutError::Timeout) => Ok(DecodeOutcome::Frame(self.frame(0))),
            _ => Ok(DecodeOutcome::EndOfStream),
        }
    }

    fn seek(&mut self, position_ms: u64) -> Result<SeekOutcome> {
        self.seeks.lock().unwrap().push(position_ms);
        if let Some(hold) = &self.seek_hold {
            let _ = hold.recv();
        }
        Ok(SeekOutcome::Positioned { position_ms })
    }
}

/// Codec decoder wrapper that fails the `decode` calls `fail` picks (0-based).
pub(crate) struct FlakyDecoder {
    inner: Box<dyn Decoder>,
    calls: usize,
    fail: fn(usize) -> Option<SymphoniaError>,
}

impl FlakyDecoder {
    pub(crate) fn new(inner: Box<dyn Decoder>, fail: fn(usize) -> Option<SymphoniaError>) -> Self {
        Self {
            inner,
            calls: 0,
            fail,
        }
    }
}

impl Decoder for FlakyDecoder {
    fn try_new(
        _params: &CodecParameters,
        _options: &DecoderOptions,
    ) -> symphonia::core::errors::Result<Self> {
        Err(SymphoniaError::Unsupported("wrapper only"))
    }

    fn supported_codecs() -> &'static [CodecDescriptor] {
        &[]
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn codec_params(&self) -> &CodecParameters {
        self.inner.codec_params()
    }

    fn decode(&mut self, packet: &Packet) -> symphonia::core::errors::Result<AudioBufferRef<'_>> {
        let call = self.calls;
        self.calls += 1;
        if let Some(err) = (self.fail)(call) {
            return Err(err);
        }
        self.inner.decode(packet)
    }

    fn finalize(&mut self) -> FinalizeResult {
        self.inner.finalize()
    }

    fn last_decoded(&self) -> AudioBufferRef<'_> {
        self.inner.last_decoded()
    }
}
