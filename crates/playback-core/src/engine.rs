//! Lock-free state shared by the control thread, the playback worker and the
//! real-time callback.
//!
//! The worker is the only writer of the playback state; the callback only touches
//! the counters it owns (consumed frames, underruns). Everything here is atomic so
//! no side ever waits on another.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use playback_types::PlaybackState;

const UNKNOWN: u64 = u64::MAX;

/// Notices pushed by the callback to the worker over a wait-free queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notice {
    /// The ring ran dry while playing; one per starvation episode.
    Underrun,
    /// End of stream was flagged and the ring is now empty.
    Drained,
}

/// Capacity of the callback → worker notice queue.
pub(crate) const NOTICE_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct EngineShared {
    state: AtomicU8,
    volume_bits: AtomicU32,
    output_rate: AtomicU32,
    consumed_frames: AtomicU64,
    position_base_ms: AtomicU64,
    duration_ms: AtomicU64,
    underrun_frames: AtomicU64,
    underrun_events: AtomicU64,
    /// Every decoded sample of the current source has been written to the ring.
    eos: AtomicBool,
    device_failed: AtomicBool,
    pending_seek_ms: AtomicU64,
    seek_queued: AtomicBool,
    opens_in_flight: AtomicU32,
}

impl EngineShared {
    pub fn new(volume: f32) -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Idle.as_u8()),
            volume_bits: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            output_rate: AtomicU32::new(0),
            consumed_frames: AtomicU64::new(0),
            position_base_ms: AtomicU64::new(0),
            duration_ms: AtomicU64::new(UNKNOWN),
            underrun_frames: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
            eos: AtomicBool::new(false),
            device_failed: AtomicBool::new(false),
            pending_seek_ms: AtomicU64::new(0),
            seek_queued: AtomicBool::new(false),
            opens_in_flight: AtomicU32::new(0),
        }
    }

    /// Authoritative playback state.
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// State as seen by the control surface: `Opening` while an open is queued.
    pub fn effective_state(&self) -> PlaybackState {
        if self.opens_in_flight.load(Ordering::Acquire) > 0 {
            PlaybackState::Opening
        } else {
            self.state()
        }
    }

    pub(crate) fn store_state(&self, state: PlaybackState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn begin_open(&self) {
        self.opens_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish_open(&self) {
        let _ = self
            .opens_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        let v = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 0.0 };
        self.volume_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate.load(Ordering::Relaxed)
    }

    pub(crate) fn set_output_rate(&self, rate: u32) {
        self.output_rate.store(rate, Ordering::Relaxed);
    }

    /// Frames the callback has taken from the ring since the last rebase.
    pub fn consumed_frames(&self) -> u64 {
        self.consumed_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn add_consumed(&self, frames: u64) {
        self.consumed_frames.fetch_add(frames, Ordering::Relaxed);
    }

    /// Restart the position clock at `position_ms`.
    pub(crate) fn rebase(&self, position_ms: u64) {
        self.position_base_ms.store(position_ms, Ordering::Relaxed);
        self.consumed_frames.store(0, Ordering::Relaxed);
    }

    /// `base + consumed × 1000 / rate`.
    pub fn position_ms(&self) -> u64 {
        let base = self.position_base_ms.load(Ordering::Relaxed);
        let rate = self.output_rate() as u64;
        if rate == 0 {
            return base;
        }
        base + self.consumed_frames().saturating_mul(1000) / rate
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match self.duration_ms.load(Ordering::Relaxed) {
            UNKNOWN => None,
            ms => Some(ms),
        }
    }

    pub(crate) fn set_duration_ms(&self, duration_ms: Option<u64>) {
        self.duration_ms
            .store(duration_ms.unwrap_or(UNKNOWN), Ordering::Relaxed);
    }

    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Relaxed)
    }

    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }

    pub(crate) fn record_underrun(&self, frames: u64, new_episode: bool) {
        self.underrun_frames.fetch_add(frames, Ordering::Relaxed);
        if new_episode {
            self.underrun_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn reset_counters(&self) {
        self.underrun_frames.store(0, Ordering::Relaxed);
        self.underrun_events.store(0, Ordering::Relaxed);
        self.rebase(0);
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    pub(crate) fn set_eos(&self, eos: bool) {
        self.eos.store(eos, Ordering::Release);
    }

    /// Called from the device error callback.
    pub(crate) fn flag_device_failure(&self) {
        self.device_failed.store(true, Ordering::Release);
    }

    pub(crate) fn take_device_failure(&self) -> bool {
        self.device_failed.swap(false, Ordering::AcqRel)
    }

    /// Record a seek target; returns `true` when no seek command is queued yet.
    pub(crate) fn request_seek(&self, position_ms: u64) -> bool {
        self.pending_seek_ms.store(position_ms, Ordering::Release);
        !self.seek_queued.swap(true, Ordering::AcqRel)
    }

    /// Claim the latest seek target.
    pub(crate) fn take_seek(&self) -> u64 {
        self.seek_queued.store(false, Ordering::Release);
        self.pending_seek_ms.load(Ordering::Acquire)
    }

    pub(crate) fn seek_pending(&self) -> Option<u64> {
        self.seek_queued
            .load(Ordering::Acquire)
            .then(|| self.pending_seek_ms.load(Ordering::Acquire))
    }

    pub(crate) fn pending_seek_target(&self) -> u64 {
        self.pending_seek_ms.load(Ordering::Acquire)
    }
}
