//! Player runtime.
//!
//! Provides device enumeration and interactive local playback.

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvError, select};
use playback_core::{
    PlaybackEndReason, PlaybackState, PlayerEvent, SourceHandle, TransportController, device,
};

use crate::config::PlayConfig;

/// Commands typed on stdin while playing.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Input {
    TogglePause,
    Seek(u64),
    Volume(f32),
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;
    let arg = parts.next();
    match (cmd, arg) {
        ("p", None) => Some(Input::TogglePause),
        ("q", None) => Some(Input::Quit),
        ("s", Some(ms)) => ms.parse().ok().map(Input::Seek),
        ("v", Some(v)) => v.parse().ok().map(Input::Volume),
        _ => None,
    }
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    let devices = device::list_devices(&host)?;
    for d in devices {
        println!(
            "{}{}  [{}]  {}-{} Hz, up to {} ch",
            if d.is_default { "* " } else { "  " },
            d.name,
            d.id,
            d.min_rate,
            d.max_rate,
            d.max_channels
        );
    }
    Ok(())
}

/// Play a file until it ends, the user quits or Ctrl-C is pressed.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let player = TransportController::new(config.playback.clone())
        .context("start playback engine")?;
    player.set_volume(config.volume);

    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = quit_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;
    let mut input = spawn_stdin_reader();

    tracing::info!(path = %config.path.display(), "opening");
    player
        .open_stream(SourceHandle::Path(config.path.clone()), config.stream)
        .context("queue open")?;

    let mut start_at = config.seek_ms;
    loop {
        let mut stdin_closed = false;
        select! {
            recv(player.events()) -> event => {
                let Ok(event) = event else { bail!("playback worker exited") };
                match event {
                    PlayerEvent::Opened { source, stream, output, resampling } => {
                        tracing::info!(
                            source = %source,
                            codec = stream.codec.as_deref().unwrap_or("unknown"),
                            source_hz = stream.format.sample_rate,
                            source_channels = stream.format.channels,
                            device = %output.device,
                            output_hz = output.format.sample_rate,
                            output_channels = output.format.channels,
                            resampling,
                            "opened"
                        );
                        if let Some(ms) = start_at.take() {
                            player.seek(ms)?;
                        }
                        player.play()?;
                    }
                    PlayerEvent::Position { position_ms } => {
                        eprint!("\r{} / {}   ", format_ms(position_ms), player
                            .duration_ms()
                            .map(format_ms)
                            .unwrap_or_else(|| "--:--".into()));
                    }
                    PlayerEvent::StateChanged { from, to } => {
                        tracing::debug!(%from, %to, "state");
                    }
                    PlayerEvent::SeekCompleted { position_ms } => {
                        tracing::info!(position_ms, "seek completed");
                    }
                    PlayerEvent::Underrun => tracing::warn!("underrun"),
                    PlayerEvent::EndOfStream => tracing::debug!("decoder finished"),
                    PlayerEvent::Ended { reason } => {
                        eprintln!();
                        let status = player.status();
                        tracing::info!(
                            reason = ?reason,
                            underrun_events = status.underrun_events,
                            "playback ended"
                        );
                        if reason == PlaybackEndReason::Error {
                            bail!("playback ended with an error");
                        }
                        return Ok(());
                    }
                    PlayerEvent::Error { kind, message } => {
                        eprintln!();
                        bail!("playback failed ({kind:?}): {message}");
                    }
                }
            }
            recv(input) -> line => match read_line(line) {
                Line::Command(cmd) => handle_input(&player, cmd)?,
                Line::Ignored => {}
                Line::Closed => {
                    tracing::debug!("stdin closed");
                    stdin_closed = true;
                }
            },
            recv(quit_rx) -> _ => {
                tracing::info!("interrupted");
                player.close()?;
            }
        }
        if stdin_closed {
            input = crossbeam_channel::never();
        }
    }
}

/// Outcome of one stdin receive.
#[derive(Debug, PartialEq)]
enum Line {
    Command(Input),
    Ignored,
    /// The reader thread hit EOF; the channel must be retired from the loop.
    Closed,
}

fn read_line(line: Result<String, RecvError>) -> Line {
    match line {
        Ok(line) => parse_input(&line).map_or(Line::Ignored, Line::Command),
        Err(RecvError) => Line::Closed,
    }
}

fn handle_input(player: &TransportController, input: Input) -> Result<()> {
    match input {
        Input::TogglePause => {
            if player.state() == PlaybackState::Playing {
                player.pause()?;
            } else {
                player.play()?;
            }
        }
        Input::Seek(ms) => {
            if let Err(err) = player.seek(ms) {
                tracing::warn!(error = %err, "seek rejected");
            }
        }
        Input::Volume(v) => player.set_volume(v),
        Input::Quit => player.close()?,
    }
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn format_ms(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
