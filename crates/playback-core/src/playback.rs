//! Output stage: negotiating and running the device stream.
//!
//! [`OutputBackend`] separates the worker from CPAL: the worker negotiates a format,
//! sizes its ring and normalizer for it, then hands a [`Renderer`] to the backend which
//! drives it from the device callback. [`CpalBackend`] is the production backend.

use cpal::traits::{DeviceTrait, StreamTrait};

use crate::config::PlaybackConfig;
use crate::decode::{PcmFormat, SampleFormat};
use crate::device;
use crate::error::{PlayerError, Result};
use crate::render::{DeviceErrorSink, Renderer};

/// What the worker would like from the output device.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputRequest {
    /// Device name substring; `None` for the default device.
    pub device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Low-latency callback size in frames, clamped by the device.
    pub buffer_frames: Option<u32>,
}

impl OutputRequest {
    pub fn from_config(cfg: &PlaybackConfig) -> Self {
        Self {
            device: cfg.device.clone(),
            sample_rate: cfg.target_sample_rate,
            channels: cfg.target_channels,
            buffer_frames: cfg.output_buffer_frames,
        }
    }
}

/// What the device actually agreed to.
#[derive(Clone, Debug, PartialEq)]
pub struct NegotiatedOutput {
    pub device: String,
    /// Internal format the renderer consumes (always `f32`).
    pub format: PcmFormat,
    /// Sample format of the device buffers.
    pub device_sample_format: String,
    pub buffer_frames: Option<u32>,
}

/// A running output stream; dropping it stops the callback.
pub trait OutputStream {}

impl OutputStream for cpal::Stream {}

/// Source of output streams for the playback worker.
pub trait OutputBackend: Send {
    /// Pick a device and format for `request`.
    fn negotiate(&mut self, request: &OutputRequest) -> Result<NegotiatedOutput>;

    /// Start a stream for the last negotiated output that renders through `renderer`.
    fn start(
        &mut self,
        output: &NegotiatedOutput,
        renderer: Renderer,
    ) -> Result<Box<dyn OutputStream>>;
}

/// CPAL-backed [`OutputBackend`].
#[derive(Default)]
pub struct CpalBackend {
    selected: Option<Selected>,
}

struct Selected {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
    buffer_size: Option<cpal::BufferSize>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputBackend for CpalBackend {
    fn negotiate(&mut self, request: &OutputRequest) -> Result<NegotiatedOutput> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, request.device.as_deref())?;
        let config = device::pick_output_config(
            &device,
            Some(request.sample_rate),
            Some(request.channels),
        )?;
        let buffer_size = device::pick_buffer_size(&config, request.buffer_frames);
        let name = device::device_name(&device);

        let output = NegotiatedOutput {
            device: name,
            format: PcmFormat::new(
                config.sample_rate(),
                config.channels() as usize,
                SampleFormat::F32,
            ),
            device_sample_format: format!("{:?}", config.sample_format()),
            buffer_frames: match buffer_size {
                Some(cpal::BufferSize::Fixed(frames)) => Some(frames),
                _ => None,
            },
        };
        if output.format.sample_rate != request.sample_rate
            || output.format.channels != request.channels as usize
        {
            tracing::info!(
                wanted_hz = request.sample_rate,
                wanted_channels = request.channels,
                rate_hz = output.format.sample_rate,
                channels = output.format.channels,
                "device fell back to nearest supported format"
            );
        }
        tracing::info!(
            device = %output.device,
            rate_hz = output.format.sample_rate,
            channels = output.format.channels,
            sample_format = %output.device_sample_format,
            buffer_frames = ?output.buffer_frames,
            "output negotiated"
        );

        self.selected = Some(Selected {
            device,
            config,
            buffer_size,
        });
        Ok(output)
    }

    fn start(
        &mut self,
        _output: &NegotiatedOutput,
        renderer: Renderer,
    ) -> Result<Box<dyn OutputStream>> {
        let selected = self
            .selected
            .take()
            .ok_or_else(|| PlayerError::Device("output started before negotiation".into()))?;
        let mut config: cpal::StreamConfig = selected.config.clone().into();
        if let Some(size) = selected.buffer_size {
            config.buffer_size = size;
        }
        let stream = build_output_stream(
            &selected.device,
            &config,
            selected.config.sample_format(),
            renderer,
        )?;
        stream.play()?;
        Ok(Box::new(stream))
    }
}

/// Build a CPAL output stream whose callback is driven by `renderer`.
///
/// `f32` devices are rendered in place; integer devices go through the renderer's
/// preallocated scratch buffer.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    renderer: Renderer,
) -> Result<cpal::Stream> {
    let sink = renderer.error_sink();
    match sample_format {
        cpal::SampleFormat::F32 => {
            let mut renderer = renderer;
            let stream = device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.render(data),
                error_callback(sink),
                None,
            )?;
            Ok(stream)
        }
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, renderer, sink),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, renderer, sink),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, renderer, sink),
        other => Err(PlayerError::Device(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut renderer: Renderer,
    sink: DeviceErrorSink,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| renderer.render_as(data),
        error_callback(sink),
        None,
    )?;
    Ok(stream)
}

fn error_callback(sink: DeviceErrorSink) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| sink.report(&err.to_string())
}
