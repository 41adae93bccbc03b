//! Playback scheduler
//!
//! Inbound speech arrives as a sequence of short chunks. Each chunk is decoded
//! and registered with the output device at `max(next_start_time, now)`, after
//! which the clock advances by exactly the chunk's duration, so consecutive
//! chunks play back to back without gaps or overlap. An interruption stops
//! every tracked chunk and resets the clock so the next chunk starts against
//! the live device time.

use crate::device::{OutputDevice, PlaybackId};
use crate::error::{DecodeError, DeviceError};
use crate::pcm::{self, PlayableBuffer};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    /// The chunk is malformed; the session carries on without it.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Device time at which the next chunk should begin.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackClock {
    next_start_time: f64,
}

impl PlaybackClock {
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// Start time for a chunk scheduled at device time `now`.
    pub fn start_time(&self, now: f64) -> f64 {
        self.next_start_time.max(now)
    }

    fn advance(&mut self, start: f64, duration: f64) {
        self.next_start_time = start + duration;
    }

    pub fn reset(&mut self) {
        self.next_start_time = 0.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Scheduled,
    Playing,
    Ended,
    StoppedEarly,
}

/// One chunk registered with the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackHandle {
    pub id: PlaybackId,
    pub start: f64,
    pub duration: f64,
    state: ChunkState,
}

impl PlaybackHandle {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Final state for finished handles, otherwise derived from device time.
    pub fn state_at(&self, now: f64) -> ChunkState {
        match self.state {
            ChunkState::Scheduled if now >= self.start => ChunkState::Playing,
            state => state,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }
}

pub struct PlaybackScheduler {
    clock: PlaybackClock,
    handles: BTreeMap<PlaybackId, PlaybackHandle>,
    sample_rate: u32,
    channels: u16,
}

impl PlaybackScheduler {
    /// `sample_rate` applies to chunks that do not announce their own rate.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            clock: PlaybackClock::default(),
            handles: BTreeMap::new(),
            sample_rate,
            channels: 1,
        }
    }

    pub fn clock(&self) -> PlaybackClock {
        self.clock
    }

    pub fn tracked(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = &PlaybackHandle> {
        self.handles.values()
    }

    /// Decode a base64 chunk and schedule it.
    pub fn enqueue(
        &mut self,
        device: &mut dyn OutputDevice,
        data: &str,
        sample_rate: Option<u32>,
    ) -> Result<PlaybackHandle, PlaybackError> {
        let buffer = pcm::decode_base64(data, sample_rate.unwrap_or(self.sample_rate), self.channels)?;
        self.schedule(device, buffer)
    }

    /// Register a decoded buffer right after everything already scheduled.
    pub fn schedule(
        &mut self,
        device: &mut dyn OutputDevice,
        buffer: PlayableBuffer,
    ) -> Result<PlaybackHandle, PlaybackError> {
        if device.is_suspended() {
            debug!("Output suspended, resuming before scheduling");
            device.resume()?;
        }

        let duration = buffer.duration();
        let start = self.clock.start_time(device.current_time());
        let id = device.start(buffer, start)?;
        self.clock.advance(start, duration);

        let handle = PlaybackHandle {
            id,
            start,
            duration,
            state: ChunkState::Scheduled,
        };
        debug!("Scheduled chunk {} at {:.3}s for {:.3}s", id, start, duration);
        self.handles.insert(id, handle.clone());
        Ok(handle)
    }

    /// A chunk played to its natural end. Unknown ids are ignored.
    pub fn on_ended(&mut self, id: PlaybackId) -> Option<PlaybackHandle> {
        let mut handle = self.handles.remove(&id)?;
        handle.state = ChunkState::Ended;
        Some(handle)
    }

    /// Barge-in: cut off every tracked chunk and reset the clock.
    pub fn interrupt(&mut self, device: &mut dyn OutputDevice) -> Vec<PlaybackHandle> {
        let stopped: Vec<PlaybackHandle> = std::mem::take(&mut self.handles)
            .into_values()
            .map(|mut handle| {
                device.stop(handle.id);
                handle.state = ChunkState::StoppedEarly;
                handle
            })
            .collect();
        self.clock.reset();
        if !stopped.is_empty() {
            info!("Stopped {} queued chunk(s)", stopped.len());
        }
        stopped
    }

    /// Forget everything without touching a device, for when it is already gone.
    pub fn clear(&mut self) {
        self.handles.clear();
        self.clock.reset();
    }
}
