//! Format normalizer.
//!
//! Converts decoded frames of any sample format, channel count and rate into the single
//! internal format consumed by the ring buffer: interleaved `f32` at the negotiated
//! output rate and channel count.
//!
//! Stages, in order: sample-format conversion, channel remap, Rubato sinc resampling.
//! Output timestamps are interpolated from the input frame timestamps so that long
//! streams do not drift.

use std::collections::VecDeque;

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::decode::{DecodedFrame, PcmFormat, SampleFormat};
use crate::error::{PlayerError, Result};

/// A block of audio in the internal format.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
    pub pts_ms: f64,
}

impl NormalizedFrame {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn duration_ms(&self) -> f64 {
        self.frames() as f64 * 1000.0 / self.sample_rate.max(1) as f64
    }
}

/// Per-output-channel gains over the input channels.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelMap {
    inputs: usize,
    outputs: usize,
    gains: Vec<f32>,
}

const MINUS_3DB: f32 = std::f32::consts::FRAC_1_SQRT_2;

impl ChannelMap {
    /// Build the remap matrix for `inputs -> outputs` channels.
    ///
    /// Inputs are assumed to use the usual interleave order (FL, FR, FC, LFE, BL, BR, ...).
    /// - identical counts pass through
    /// - mono feeds the front pair
    /// - 3.0 and 5.1 fold into stereo with centre/surround at -3 dB, LFE dropped
    /// - anything else folds channel `i` into output `i % outputs`, averaged
    pub fn new(inputs: usize, outputs: usize) -> Self {
        let inputs = inputs.max(1);
        let outputs = outputs.max(1);
        let mut gains = vec![0.0f32; inputs * outputs];
        let mut set = |out: usize, inp: usize, g: f32| gains[out * inputs + inp] = g;

        match (inputs, outputs) {
            (i, o) if i == o => (0..i).for_each(|c| set(c, c, 1.0)),
            (1, o) => {
                set(0, 0, 1.0);
                set(1.min(o - 1), 0, 1.0);
            }
            (3, 2) => {
                let norm = 1.0 / (1.0 + MINUS_3DB);
                set(0, 0, norm);
                set(0, 2, MINUS_3DB * norm);
                set(1, 1, norm);
                set(1, 2, MINUS_3DB * norm);
            }
            (6, 2) => {
                let norm = 1.0 / (1.0 + 2.0 * MINUS_3DB);
                set(0, 0, norm);
                set(0, 2, MINUS_3DB * norm);
                set(0, 4, MINUS_3DB * norm);
                set(1, 1, norm);
                set(1, 2, MINUS_3DB * norm);
                set(1, 5, MINUS_3DB * norm);
            }
            (i, o) => {
                for out in 0..o {
                    let sources: Vec<usize> = (0..i).filter(|c| c % o == out).collect();
                    if sources.is_empty() {
                        continue;
                    }
                    let g = 1.0 / sources.len() as f32;
                    for inp in sources {
                        set(out, inp, g);
                    }
                }
            }
        }
        Self {
            inputs,
            outputs,
            gains,
        }
    }

    pub fn gain(&self, output: usize, input: usize) -> f32 {
        self.gains[output * self.inputs + input]
    }

    /// Remap interleaved `input` and append the result to `out`.
    pub fn apply(&self, input: &[f32], out: &mut Vec<f32>) {
        if self.inputs == self.outputs {
            out.extend_from_slice(input);
            return;
        }
        for frame in input.chunks_exact(self.inputs) {
            for o in 0..self.outputs {
                let row = &self.gains[o * self.inputs..(o + 1) * self.inputs];
                let v: f32 = row.iter().zip(frame).map(|(g, s)| g * s).sum();
                out.push(v);
            }
        }
    }
}

/// Streaming sinc resampler with timestamp bookkeeping.
struct ResampleStage {
    resampler: Box<dyn Resampler<f32>>,
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    out_buf: Vec<f32>,
    /// (input frame index, pts) of each input frame since the last reset.
    anchors: VecDeque<(u64, f64)>,
    input_frames: u64,
    emitted_frames: u64,
    delay_remaining: usize,
}

impl ResampleStage {
    fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| PlayerError::UnsupportedFormat(format!("resampler init: {e}")))?;
        let out_buf = vec![0.0f32; resampler.output_frames_max() * channels];
        let delay_remaining = resampler.output_delay();

        Ok(Self {
            resampler: Box::new(resampler),
            src_rate,
            dst_rate,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels * 2),
            out_buf,
            anchors: VecDeque::new(),
            input_frames: 0,
            emitted_frames: 0,
            delay_remaining,
        })
    }

    fn push(&mut self, samples: &[f32], pts_ms: f64) {
        self.anchors.push_back((self.input_frames, pts_ms));
        self.input_frames += (samples.len() / self.channels) as u64;
        self.pending.extend_from_slice(samples);
    }

    /// Resample every complete chunk; returns the pts of the first appended frame.
    fn drain_chunks(&mut self, out: &mut Vec<f32>) -> Result<Option<f64>> {
        let mut first_pts = None;
        let chunk_samples = self.chunk_frames * self.channels;
        while self.pending.len() >= chunk_samples {
            let chunk: Vec<f32> = self.pending.drain(..chunk_samples).collect();
            let pts = self.run_chunk(&chunk, None, None, out)?;
            first_pts = first_pts.or(pts);
        }
        Ok(first_pts)
    }

    /// Resample the partial tail and the filter delay; output length matches the input
    /// duration exactly.
    fn finish(&mut self, out: &mut Vec<f32>) -> Result<Option<f64>> {
        let expected = (self.input_frames as f64 * self.dst_rate as f64 / self.src_rate as f64)
            .round() as u64;
        let mut first_pts = self.drain_chunks(out)?;

        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            let tail_frames = tail.len() / self.channels;
            let pts = self.run_chunk(&tail, Some(tail_frames), Some(expected), out)?;
            first_pts = first_pts.or(pts);
        }

        let zeros = vec![0.0f32; self.chunk_frames * self.channels];
        let max_chunks = self.padding_chunks(expected);
        let mut pushed = 0;
        while self.emitted_frames < expected && pushed < max_chunks {
            let pts = self.run_chunk(&zeros, None, Some(expected), out)?;
            first_pts = first_pts.or(pts);
            pushed += 1;
        }
        Ok(first_pts)
    }

    /// Zero chunks needed to push the remaining filter delay and `expected` frames out.
    fn padding_chunks(&self, expected: u64) -> u64 {
        let missing = expected.saturating_sub(self.emitted_frames) + self.delay_remaining as u64;
        let per_chunk =
            ((self.chunk_frames as u64 * self.dst_rate as u64) / self.src_rate as u64).max(1);
        missing.div_ceil(per_chunk) + 2
    }

    fn run_chunk(
        &mut self,
        input: &[f32],
        partial_len: Option<usize>,
        limit: Option<u64>,
        out: &mut Vec<f32>,
    ) -> Result<Option<f64>> {
        let channels = self.channels;
        let frames_in = input.len() / channels;
        let input_adapter = InterleavedSlice::new(input, channels, frames_in)
            .map_err(|e| PlayerError::Decode(format!("resampler input: {e}")))?;
        let out_capacity_frames = self.out_buf.len() / channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out_buf, channels, out_capacity_frames)
                .map_err(|e| PlayerError::Decode(format!("resampler output: {e}")))?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| PlayerError::Decode(format!("resampler process: {e}")))?;

        let skip = self.delay_remaining.min(nbr_out);
        self.delay_remaining -= skip;
        let mut produced = (nbr_out - skip) as u64;
        if let Some(limit) = limit {
            produced = produced.min(limit.saturating_sub(self.emitted_frames));
        }
        if produced == 0 {
            return Ok(None);
        }

        let pts = self.pts_for_output_frame(self.emitted_frames);
        let start = skip * channels;
        let end = start + produced as usize * channels;
        out.extend_from_slice(&self.out_buf[start..end]);
        self.emitted_frames += produced;
        Ok(Some(pts))
    }

    /// Map an output frame index back onto the input timeline.
    fn pts_for_output_frame(&mut self, output_frame: u64) -> f64 {
        let input_pos = output_frame as f64 * self.src_rate as f64 / self.dst_rate as f64;
        while self.anchors.len() > 1 && (self.anchors[1].0 as f64) <= input_pos {
            self.anchors.pop_front();
        }
        match self.anchors.front() {
            Some(&(index, pts)) => pts + (input_pos - index as f64) * 1000.0 / self.src_rate as f64,
            None => input_pos * 1000.0 / self.src_rate as f64,
        }
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
        self.anchors.clear();
        self.input_frames = 0;
        self.emitted_frames = 0;
        self.delay_remaining = self.resampler.output_delay();
    }
}

/// Converts decoded frames into the internal format.
pub struct Normalizer {
    source: PcmFormat,
    target: PcmFormat,
    chunk_frames: usize,
    map: ChannelMap,
    resample: Option<ResampleStage>,
    scratch: Vec<f32>,
    last_pts: Option<(f64, f64)>,
}

impl Normalizer {
    /// Create a normalizer for `source -> target`; the target sample format is always `F32`.
    pub fn new(source: PcmFormat, target: PcmFormat, chunk_frames: usize) -> Result<Self> {
        let mut this = Self {
            source,
            target,
            chunk_frames: chunk_frames.max(1),
            map: ChannelMap::new(1, 1),
            resample: None,
            scratch: Vec::new(),
            last_pts: None,
        };
        this.configure(source, target)?;
        Ok(this)
    }

    /// (Re)build the conversion chain. Drops any resampler history.
    pub fn configure(&mut self, source: PcmFormat, target: PcmFormat) -> Result<()> {
        if source.sample_rate == 0 || source.channels == 0 {
            return Err(PlayerError::UnsupportedFormat(format!(
                "invalid source format {} Hz / {} ch",
                source.sample_rate, source.channels
            )));
        }
        if target.sample_rate == 0 || target.channels == 0 {
            return Err(PlayerError::Device(format!(
                "invalid output format {} Hz / {} ch",
                target.sample_rate, target.channels
            )));
        }
        let target = PcmFormat::new(target.sample_rate, target.channels, SampleFormat::F32);
        self.map = ChannelMap::new(source.channels, target.channels);
        self.resample = if source.sample_rate == target.sample_rate {
            None
        } else {
            Some(ResampleStage::new(
                source.sample_rate,
                target.sample_rate,
                target.channels,
                self.chunk_frames,
            )?)
        };
        tracing::info!(
            from_hz = source.sample_rate,
            to_hz = target.sample_rate,
            from_channels = source.channels,
            to_channels = target.channels,
            resampling = self.resample.is_some(),
            "normalizer configured"
        );
        self.source = source;
        self.target = target;
        Ok(())
    }

    pub fn source(&self) -> PcmFormat {
        self.source
    }

    pub fn target(&self) -> PcmFormat {
        self.target
    }

    pub fn is_resampling(&self) -> bool {
        self.resample.is_some()
    }

    /// Normalize one decoded frame.
    ///
    /// Returns `None` while the resampler is still collecting a full input chunk.
    pub fn process(&mut self, frame: DecodedFrame) -> Result<Option<NormalizedFrame>> {
        let mut out = Vec::new();
        let mut pts = None;

        if frame.sample_rate != self.source.sample_rate || frame.channels != self.source.channels
        {
            tracing::info!(
                rate_hz = frame.sample_rate,
                channels = frame.channels,
                "source format changed mid-stream"
            );
            if let Some(tail) = self.flush()? {
                pts = Some(tail.pts_ms);
                out = tail.samples;
            }
            let last_pts = self.last_pts;
            self.configure(frame.format(), self.target)?;
            self.last_pts = last_pts;
        }

        self.scratch.clear();
        frame.samples.extend_f32(&mut self.scratch);
        let mut remapped = Vec::with_capacity(frame.frames() * self.target.channels);
        self.map.apply(&self.scratch, &mut remapped);

        match self.resample.as_mut() {
            None => {
                pts = pts.or(Some(frame.pts_ms));
                out.extend_from_slice(&remapped);
            }
            Some(stage) => {
                stage.push(&remapped, frame.pts_ms);
                let chunk_pts = stage.drain_chunks(&mut out)?;
                pts = pts.or(chunk_pts);
            }
        }
        Ok(self.emit(out, pts))
    }

    /// Drain resampler history (end of stream or before reconfiguring).
    pub fn flush(&mut self) -> Result<Option<NormalizedFrame>> {
        let Some(stage) = self.resample.as_mut() else {
            return Ok(None);
        };
        let mut out = Vec::new();
        let pts = stage.finish(&mut out)?;
        stage.reset();
        Ok(self.emit(out, pts))
    }

    /// Discard resampler history and timestamp continuity (seek).
    pub fn reset(&mut self) {
        if let Some(stage) = self.resample.as_mut() {
            stage.reset();
        }
        self.last_pts = None;
    }

    fn emit(&mut self, samples: Vec<f32>, pts: Option<f64>) -> Option<NormalizedFrame> {
        if samples.is_empty() {
            return None;
        }
        let mut frame = NormalizedFrame {
            samples,
            sample_rate: self.target.sample_rate,
            channels: self.target.channels,
            pts_ms: pts.unwrap_or(0.0),
        };
        if let Some((last_start, last_end)) = self.last_pts {
            if frame.pts_ms <= last_start {
                frame.pts_ms = last_end.max(last_start + f64::EPSILON);
            }
        }
        self.last_pts = Some((frame.pts_ms, frame.pts_ms + frame.duration_ms()));
        Some(frame)
    }
}
