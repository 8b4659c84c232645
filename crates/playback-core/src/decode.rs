//! Demux/decode adapter.
//!
//! Uses Symphonia to:
//! - probe the input container/codec and pick an audio track
//! - decode packets of that track into PCM [`DecodedFrame`]s
//! - seek with decoder reset and sample-accurate trimming
//!
//! A [`DemuxDecoder`] is owned by exactly one thread (the playback worker).

use std::fs::File;
use std::path::PathBuf;

use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::{Error as SymphoniaError, SeekErrorKind};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo, Track};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use crate::error::{PlayerError, Result};

/// Where encoded audio comes from.
#[derive(Debug)]
pub enum SourceHandle {
    /// A local file path; the extension is used as a probe hint.
    Path(PathBuf),
    /// An already-open file (e.g. a descriptor handed over by the host).
    File { file: File, hint: Option<String> },
}

impl SourceHandle {
    /// Wrap a raw descriptor owned by the host.
    ///
    /// # Safety
    /// `fd` must be an open, readable, seekable descriptor whose ownership is transferred
    /// to the returned handle.
    #[cfg(unix)]
    pub unsafe fn from_raw_fd(fd: std::os::fd::RawFd, hint: Option<String>) -> Self {
        use std::os::fd::FromRawFd;
        let file = unsafe { File::from_raw_fd(fd) };
        SourceHandle::File { file, hint }
    }

    /// Human-readable label for status/logging.
    pub fn label(&self) -> String {
        match self {
            SourceHandle::Path(path) => path.display().to_string(),
            SourceHandle::File { hint, .. } => match hint {
                Some(ext) => format!("<descriptor>.{ext}"),
                None => "<descriptor>".to_string(),
            },
        }
    }

    fn into_media_source(self) -> Result<(Box<dyn MediaSource>, Hint, Option<String>)> {
        let mut hint = Hint::new();
        let (file, ext) = match self {
            SourceHandle::Path(path) => {
                let file = File::open(&path)?;
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase());
                (file, ext)
            }
            SourceHandle::File { file, hint } => (file, hint.map(|h| h.to_ascii_lowercase())),
        };
        if let Some(ext) = ext.as_deref() {
            hint.with_extension(ext);
        }
        let container = ext.map(|e| e.to_ascii_uppercase());
        Ok((Box::new(file), hint, container))
    }
}

/// Sample encoding of a PCM block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    I32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
        }
    }
}

/// Rate, channel count and sample encoding of a PCM stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: usize,
    pub sample_format: SampleFormat,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: usize, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }
}

/// Interleaved PCM samples in their decoded encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum PcmSamples {
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl PcmSamples {
    pub fn len(&self) -> usize {
        match self {
            PcmSamples::I16(v) => v.len(),
            PcmSamples::I32(v) => v.len(),
            PcmSamples::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_format(&self) -> SampleFormat {
        match self {
            PcmSamples::I16(_) => SampleFormat::I16,
            PcmSamples::I32(_) => SampleFormat::I32,
            PcmSamples::F32(_) => SampleFormat::F32,
        }
    }

    /// Append the samples to `out` as `f32` in `[-1.0, 1.0)`.
    pub fn extend_f32(&self, out: &mut Vec<f32>) {
        match self {
            PcmSamples::I16(v) => out.extend(v.iter().map(|&s| s as f32 / 32_768.0)),
            PcmSamples::I32(v) => out.extend(v.iter().map(|&s| s as f32 / 2_147_483_648.0)),
            PcmSamples::F32(v) => out.extend_from_slice(v),
        }
    }

    fn drop_leading(&mut self, samples: usize) {
        match self {
            PcmSamples::I16(v) => {
                v.drain(..samples.min(v.len()));
            }
            PcmSamples::I32(v) => {
                v.drain(..samples.min(v.len()));
            }
            PcmSamples::F32(v) => {
                v.drain(..samples.min(v.len()));
            }
        }
    }
}

/// A block of decoded PCM, moved from stage to stage.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    pub samples: PcmSamples,
    pub sample_rate: u32,
    pub channels: usize,
    /// Presentation timestamp of the first sample.
    pub pts_ms: f64,
}

impl DecodedFrame {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn byte_len(&self) -> usize {
        self.samples.len() * self.samples.sample_format().bytes_per_sample()
    }

    pub fn format(&self) -> PcmFormat {
        PcmFormat::new(self.sample_rate, self.channels, self.samples.sample_format())
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Metadata captured while probing the source.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    /// Index of the selected track in the container.
    pub stream_index: usize,
    /// Symphonia track id of the selected track.
    pub track_id: u32,
    /// Decoded PCM format (sample format is best-effort until the first frame).
    pub format: PcmFormat,
    /// Total duration, `None` when the container does not say.
    pub duration_ms: Option<u64>,
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Container/extension hint (best-effort).
    pub container: Option<String>,
}

/// Result of pulling the next frame.
#[derive(Debug)]
pub enum DecodeOutcome {
    Frame(DecodedFrame),
    EndOfStream,
}

/// Result of a seek request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekOutcome {
    /// The next frame starts at `position_ms`.
    Positioned { position_ms: u64 },
    /// The request lies at or past the end of the stream.
    BeyondEnd { end_ms: Option<u64> },
}

/// Anything the playback worker can pull PCM from.
pub trait FrameSource: Send {
    fn info(&self) -> &StreamInfo;

    fn next_frame(&mut self) -> Result<DecodeOutcome>;

    /// Reposition; frames returned afterwards start at the confirmed position.
    fn seek(&mut self, position_ms: u64) -> Result<SeekOutcome>;
}

/// Symphonia-backed [`FrameSource`].
pub struct DemuxDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    info: StreamInfo,
    time_base: Option<TimeBase>,
    max_retries: u32,
    frames_decoded: u64,
    trim_until_ts: Option<u64>,
    primed: Option<DecodedFrame>,
}

impl DemuxDecoder {
    /// Probe `source` and select `stream_index` (or the first audio track).
    pub fn open(
        source: SourceHandle,
        stream_index: Option<usize>,
        max_retries: u32,
    ) -> Result<Self> {
        let label = source.label();
        let (media, hint, container) = source.into_media_source()?;
        let mss = MediaSourceStream::new(media, Default::default());

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )
            .map_err(|e| match e {
                SymphoniaError::IoError(io) => PlayerError::Io(io),
                other => PlayerError::UnsupportedFormat(other.to_string()),
            })?;
        let format = probed.format;

        let (stream_index, track) = select_audio_track(format.tracks(), stream_index)?;
        let codec_params: CodecParameters = track.codec_params.clone();
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| PlayerError::UnsupportedFormat(e.to_string()))?;

        let info = StreamInfo {
            stream_index,
            track_id,
            format: PcmFormat::new(
                codec_params.sample_rate.unwrap_or(0),
                codec_params.channels.map(|c| c.count()).unwrap_or(0),
                sample_format_from_params(&codec_params),
            ),
            duration_ms: duration_ms_from_codec_params(&codec_params),
            codec: codec_name_from_params(&codec_params),
            bit_depth: codec_params
                .bits_per_sample
                .or(codec_params.bits_per_coded_sample)
                .and_then(|v| u16::try_from(v).ok()),
            container,
        };

        let mut this = Self {
            format,
            decoder,
            info,
            time_base: codec_params.time_base,
            max_retries,
            frames_decoded: 0,
            trim_until_ts: None,
            primed: None,
        };

        // Some codecs only reveal rate/layout once a packet is decoded.
        if this.info.format.sample_rate == 0 || this.info.format.channels == 0 {
            match this.next_frame()? {
                DecodeOutcome::Frame(frame) => {
                    this.info.format = frame.format();
                    this.primed = Some(frame);
                }
                DecodeOutcome::EndOfStream => {
                    return Err(PlayerError::UnsupportedFormat(
                        "stream ended before its format was known".to_string(),
                    ));
                }
            }
        }

        tracing::info!(
            source = %label,
            stream_index,
            rate_hz = this.info.format.sample_rate,
            channels = this.info.format.channels,
            codec = this.info.codec.as_deref().unwrap_or("?"),
            duration_ms = ?this.info.duration_ms,
            "source opened"
        );
        Ok(this)
    }

    /// Release the decoder and the underlying source.
    pub fn close(self) {
        tracing::debug!(track_id = self.info.track_id, "source closed");
    }

    fn ts_to_ms(&self, ts: u64) -> Option<f64> {
        let tb = self.time_base?;
        let t = tb.calc_time(ts);
        Some(t.seconds as f64 * 1000.0 + t.frac * 1000.0)
    }

    fn frames_to_ms(&self, frames: u64) -> f64 {
        let rate = self.info.format.sample_rate.max(1) as f64;
        frames as f64 * 1000.0 / rate
    }

    /// Frames at the start of the packet at `ts` that precede the seek target.
    fn frames_to_trim(&mut self, ts: u64) -> u64 {
        let Some(required) = self.trim_until_ts else {
            return 0;
        };
        if ts >= required {
            self.trim_until_ts = None;
            return 0;
        }
        let (Some(req_ms), Some(ts_ms)) = (self.ts_to_ms(required), self.ts_to_ms(ts)) else {
            self.trim_until_ts = None;
            return 0;
        };
        let rate = self.info.format.sample_rate as f64;
        ((req_ms - ts_ms) * rate / 1000.0).round().max(0.0) as u64
    }

    /// Recreate the decoder from the selected track's current codec parameters.
    ///
    /// Falls back to the first audio track when the track list no longer has ours.
    fn rebuild_decoder(&mut self) -> Result<()> {
        let (stream_index, track_id, codec_params) = {
            let tracks = self.format.tracks();
            let (index, track) = match tracks.iter().position(|t| t.id == self.info.track_id) {
                Some(index) => (index, &tracks[index]),
                None => select_audio_track(tracks, None)?,
            };
            (index, track.id, track.codec_params.clone())
        };

        self.decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| PlayerError::UnsupportedFormat(e.to_string()))?;
        if codec_params.time_base.is_some() {
            self.time_base = codec_params.time_base;
        }
        if track_id != self.info.track_id {
            tracing::info!(
                old_track_id = self.info.track_id,
                track_id,
                "selected track disappeared, switching"
            );
            self.info.track_id = track_id;
            self.info.stream_index = stream_index;
        }
        tracing::debug!(track_id, "decoder rebuilt");
        Ok(())
    }

    /// Swap the codec decoder for one built by `wrap`.
    #[cfg(test)]
    pub(crate) fn map_decoder(
        mut self,
        wrap: impl FnOnce(Box<dyn Decoder>) -> Box<dyn Decoder>,
    ) -> Self {
        self.decoder = wrap(self.decoder);
        self
    }

    fn register_failure(&self, failures: &mut u32, msg: &str) -> Result<()> {
        *failures += 1;
        tracing::debug!(failures = *failures, "skipping undecodable packet: {msg}");
        if *failures > self.max_retries {
            return Err(PlayerError::Decode(format!(
                "{msg} ({} consecutive failures)",
                *failures
            )));
        }
        Ok(())
    }
}

impl FrameSource for DemuxDecoder {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<DecodeOutcome> {
        if let Some(frame) = self.primed.take() {
            return Ok(DecodeOutcome::Frame(frame));
        }

        let mut failures = 0u32;
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(DecodeOutcome::EndOfStream);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.rebuild_decoder()?;
                    continue;
                }
                Err(SymphoniaError::DecodeError(msg)) => {
                    self.register_failure(&mut failures, msg)?;
                    continue;
                }
                Err(SymphoniaError::IoError(e)) => return Err(PlayerError::Io(e)),
                Err(e) => return Err(PlayerError::Decode(e.to_string())),
            };

            if packet.track_id() != self.info.track_id {
                continue;
            }

            let ts = packet.ts();
            let trim = self.frames_to_trim(ts);
            let pts_ms = self
                .ts_to_ms(ts)
                .unwrap_or_else(|| self.frames_to_ms(self.frames_decoded));

            let decoded = self
                .decoder
                .decode(&packet)
                .map(|buf| frame_from_buffer(buf, pts_ms));
            let mut frame = match decoded {
                Ok(frame) => frame,
                Err(SymphoniaError::DecodeError(msg)) => {
                    self.register_failure(&mut failures, msg)?;
                    continue;
                }
                Err(SymphoniaError::IoError(e)) => {
                    self.register_failure(&mut failures, &e.to_string())?;
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.rebuild_decoder()?;
                    continue;
                }
                Err(e) => return Err(PlayerError::Decode(e.to_string())),
            };

            self.frames_decoded += frame.frames() as u64;

            if trim > 0 {
                let trim = (trim as usize).min(frame.frames());
                frame.samples.drop_leading(trim * frame.channels);
                frame.pts_ms += trim as f64 * 1000.0 / frame.sample_rate.max(1) as f64;
            }
            if frame.samples.is_empty() {
                continue;
            }
            return Ok(DecodeOutcome::Frame(frame));
        }
    }

    fn seek(&mut self, position_ms: u64) -> Result<SeekOutcome> {
        self.primed = None;
        if let Some(total) = self.info.duration_ms {
            if position_ms >= total {
                return Ok(SeekOutcome::BeyondEnd {
                    end_ms: Some(total),
                });
            }
        }

        let time = Time::new(position_ms / 1000, (position_ms % 1000) as f64 / 1000.0);
        match self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.info.track_id),
            },
        ) {
            Ok(seeked) => {
                self.decoder.reset();
                self.trim_until_ts = (seeked.required_ts > seeked.actual_ts)
                    .then_some(seeked.required_ts);
                let confirmed_ms = self
                    .ts_to_ms(seeked.required_ts)
                    .unwrap_or(position_ms as f64);
                self.frames_decoded =
                    (confirmed_ms * self.info.format.sample_rate as f64 / 1000.0) as u64;
                tracing::debug!(
                    requested_ms = position_ms,
                    confirmed_ms,
                    "decoder repositioned"
                );
                Ok(SeekOutcome::Positioned {
                    position_ms: confirmed_ms.round() as u64,
                })
            }
            Err(SymphoniaError::SeekError(SeekErrorKind::OutOfRange)) => {
                Ok(SeekOutcome::BeyondEnd {
                    end_ms: self.info.duration_ms,
                })
            }
            Err(e) => Err(PlayerError::Decode(format!("seek failed: {e}"))),
        }
    }
}

/// Pick the requested track, or the first decodable audio track.
fn select_audio_track(tracks: &[Track], stream_index: Option<usize>) -> Result<(usize, &Track)> {
    match stream_index {
        Some(index) => tracks
            .get(index)
            .filter(|t| is_audio_track(t))
            .map(|t| (index, t))
            .ok_or(PlayerError::NoAudioStream),
        None => tracks
            .iter()
            .enumerate()
            .find(|(_, t)| is_audio_track(t))
            .ok_or(PlayerError::NoAudioStream),
    }
}

fn is_audio_track(track: &Track) -> bool {
    track.codec_params.codec != CODEC_TYPE_NULL
}

fn frame_from_buffer(decoded: AudioBufferRef<'_>, pts_ms: f64) -> DecodedFrame {
    let spec = *decoded.spec();
    let frames = decoded.frames() as u64;
    let samples = match sample_format_of(&decoded) {
        SampleFormat::I16 => {
            let mut buf = SampleBuffer::<i16>::new(frames, spec);
            buf.copy_interleaved_ref(decoded);
            PcmSamples::I16(buf.samples().to_vec())
        }
        SampleFormat::I32 => {
            let mut buf = SampleBuffer::<i32>::new(frames, spec);
            buf.copy_interleaved_ref(decoded);
            PcmSamples::I32(buf.samples().to_vec())
        }
        SampleFormat::F32 => {
            let mut buf = SampleBuffer::<f32>::new(frames, spec);
            buf.copy_interleaved_ref(decoded);
            PcmSamples::F32(buf.samples().to_vec())
        }
    };
    DecodedFrame {
        samples,
        sample_rate: spec.rate,
        channels: spec.channels.count(),
        pts_ms,
    }
}

fn sample_format_of(decoded: &AudioBufferRef<'_>) -> SampleFormat {
    match decoded {
        AudioBufferRef::U8(_)
        | AudioBufferRef::S8(_)
        | AudioBufferRef::U16(_)
        | AudioBufferRef::S16(_) => SampleFormat::I16,
        AudioBufferRef::F32(_) | AudioBufferRef::F64(_) => SampleFormat::F32,
        _ => SampleFormat::I32,
    }
}

fn sample_format_from_params(params: &CodecParameters) -> SampleFormat {
    use symphonia::core::sample::SampleFormat as Sf;
    match params.sample_format {
        Some(Sf::U8 | Sf::S8 | Sf::U16 | Sf::S16) => SampleFormat::I16,
        Some(Sf::F32 | Sf::F64) => SampleFormat::F32,
        Some(_) => SampleFormat::I32,
        None => match params.bits_per_sample {
            Some(bits) if bits <= 16 => SampleFormat::I16,
            Some(_) => SampleFormat::I32,
            None => SampleFormat::F32,
        },
    }
}

/// Best-effort duration in milliseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label used for status payloads.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FlakyDecoder, write_garbage, write_sine_wav};
    use symphonia::core::codecs::*;

    fn open_path(path: PathBuf) -> DemuxDecoder {
        DemuxDecoder::open(SourceHandle::Path(path), None, 4).unwrap()
    }

    fn drain(decoder: &mut DemuxDecoder) -> Vec<DecodedFrame> {
        let mut frames = Vec::new();
        while let DecodeOutcome::Frame(f) = decoder.next_frame().unwrap() {
            frames.push(f);
        }
        frames
    }

    #[test]
    fn duration_ms_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_ms_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2000));
    }

    #[test]
    fn codec_name_from_params_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("FLAC".to_string()));
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(codec_name_from_params(&params), Some("PCM_S16".to_string()));
        params.codec = CODEC_TYPE_NULL;
        assert!(codec_name_from_params(&params).is_none());
    }

    #[test]
    fn open_reports_stream_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 44_100, 2, 1000);
        let decoder = open_path(path);
        let info = decoder.info();
        assert_eq!(info.stream_index, 0);
        assert_eq!(info.format.sample_rate, 44_100);
        assert_eq!(info.format.channels, 2);
        assert_eq!(info.format.sample_format, SampleFormat::I16);
        assert_eq!(info.duration_ms, Some(1000));
        assert_eq!(info.codec.as_deref(), Some("PCM_S16"));
        assert_eq!(info.container.as_deref(), Some("WAV"));
    }

    #[test]
    fn decodes_every_frame_with_increasing_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 1, 500);
        let mut decoder = open_path(path);
        let frames = drain(&mut decoder);

        let total: usize = frames.iter().map(|f| f.frames()).sum();
        assert_eq!(total, 24_000);
        for pair in frames.windows(2) {
            assert!(pair[1].pts_ms > pair[0].pts_ms);
        }
        assert!(frames.iter().all(|f| f.byte_len() == f.samples.len() * 2));
        assert!(matches!(decoder.next_frame().unwrap(), DecodeOutcome::EndOfStream));
    }

    fn flaky(
        path: PathBuf,
        max_retries: u32,
        fail: fn(usize) -> Option<SymphoniaError>,
    ) -> DemuxDecoder {
        DemuxDecoder::open(SourceHandle::Path(path), None, max_retries)
            .unwrap()
            .map_decoder(|inner| Box::new(FlakyDecoder::new(inner, fail)))
    }

    #[test]
    fn corrupt_packets_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 1, 500);
        let mut decoder = flaky(path, 4, |call| {
            matches!(call, 1 | 2 | 5).then_some(SymphoniaError::DecodeError("corrupt packet"))
        });
        let frames = drain(&mut decoder);

        let total: usize = frames.iter().map(|f| f.frames()).sum();
        assert!(total > 0 && total < 24_000, "decoded {total} frames");
        assert!(matches!(decoder.next_frame().unwrap(), DecodeOutcome::EndOfStream));
    }

    #[test]
    fn too_many_consecutive_failures_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 1, 500);
        let mut decoder = flaky(path, 2, |call| {
            (call >= 1).then_some(SymphoniaError::DecodeError("corrupt packet"))
        });
        assert!(matches!(decoder.next_frame().unwrap(), DecodeOutcome::Frame(_)));
        let err = decoder.next_frame().err().unwrap();
        assert!(matches!(err, PlayerError::Decode(ref msg) if msg.contains("3 consecutive")));
    }

    #[test]
    fn reset_required_rebuilds_the_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 1, 500);
        // The wrapper would fail every packet after the reset; a rebuilt decoder does not.
        let mut decoder = flaky(path, 0, |call| match call {
            0 => None,
            1 => Some(SymphoniaError::ResetRequired),
            _ => Some(SymphoniaError::DecodeError("stale decoder state")),
        });
        let frames = drain(&mut decoder);

        let total: usize = frames.iter().map(|f| f.frames()).sum();
        assert!(total > 12_000 && total < 24_000, "decoded {total} frames");
        for pair in frames.windows(2) {
            assert!(pair[1].pts_ms > pair[0].pts_ms);
        }
        assert!(matches!(decoder.next_frame().unwrap(), DecodeOutcome::EndOfStream));
    }

    #[test]
    fn garbage_input_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_garbage(dir.path(), "noise.bin");
        let err = DemuxDecoder::open(SourceHandle::Path(path), None, 4).err().unwrap();
        assert!(matches!(err, PlayerError::UnsupportedFormat(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = DemuxDecoder::open(SourceHandle::Path("/nonexistent/a.wav".into()), None, 4)
            .err()
            .unwrap();
        assert!(matches!(err, PlayerError::Io(_)));
    }

    #[test]
    fn selecting_a_missing_stream_reports_no_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 100);
        let err = DemuxDecoder::open(SourceHandle::Path(path), Some(3), 4).err().unwrap();
        assert!(matches!(err, PlayerError::NoAudioStream));
    }

    #[test]
    fn opens_from_an_open_file_with_hint() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 22_050, 1, 200);
        let file = File::open(&path).unwrap();
        let source = SourceHandle::File {
            file,
            hint: Some("wav".to_string()),
        };
        assert_eq!(source.label(), "<descriptor>.wav");
        let decoder = DemuxDecoder::open(source, None, 4).unwrap();
        assert_eq!(decoder.info().format.sample_rate, 22_050);
    }

    #[test]
    fn seek_positions_next_frame_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 2000);
        let mut decoder = open_path(path);
        let _ = decoder.next_frame().unwrap();

        let outcome = decoder.seek(750).unwrap();
        assert_eq!(outcome, SeekOutcome::Positioned { position_ms: 750 });

        let DecodeOutcome::Frame(frame) = decoder.next_frame().unwrap() else {
            panic!("expected a frame after seek");
        };
        assert!((frame.pts_ms - 750.0).abs() < 1.0, "pts {}", frame.pts_ms);

        let rest: usize = drain(&mut decoder).iter().map(|f| f.frames()).sum();
        assert_eq!(rest + frame.frames(), 60_000);
    }

    #[test]
    fn seek_past_end_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sine_wav(dir.path(), "tone.wav", 48_000, 2, 300);
        let mut decoder = open_path(path);
        let outcome = decoder.seek(5_000).unwrap();
        assert_eq!(outcome, SeekOutcome::BeyondEnd { end_ms: Some(300) });
    }

    #[test]
    fn pcm_samples_convert_to_unit_range() {
        let mut out = Vec::new();
        PcmSamples::I16(vec![i16::MIN, 0, 16_384]).extend_f32(&mut out);
        PcmSamples::I32(vec![i32::MIN]).extend_f32(&mut out);
        assert_eq!(out, vec![-1.0, 0.0, 0.5, -1.0]);
    }
}
