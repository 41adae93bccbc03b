//! Audio device seams
//!
//! The session controller only talks to these traits. The PulseAudio backend
//! implements them for real hardware; tests use in-memory fakes.

use crate::error::DeviceError;
use crate::pcm::{AudioFrame, PlayableBuffer};
use std::fmt;
use tokio::sync::mpsc;

/// Identifies one buffer registered with an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An acquired microphone.
pub trait InputDevice: Send {
    /// Start delivering frames of `frame_len` samples.
    ///
    /// Frames the receiver is too slow to take are dropped by the device.
    fn start(&mut self, frame_len: usize) -> Result<mpsc::Receiver<AudioFrame>, DeviceError>;

    /// Stop capturing and release the hardware. Safe to call repeatedly.
    fn stop(&mut self);

    fn name(&self) -> &str;
}

/// An opened audio output with its own monotonic clock.
pub trait OutputDevice: Send {
    /// Seconds elapsed on the device's time base.
    fn current_time(&self) -> f64;

    /// Suspended devices do not advance their clock or produce sound.
    fn is_suspended(&self) -> bool;

    fn resume(&mut self) -> Result<(), DeviceError>;

    /// Register `buffer` to begin at device time `at`.
    fn start(&mut self, buffer: PlayableBuffer, at: f64) -> Result<PlaybackId, DeviceError>;

    /// Cut a registered buffer off. Unknown ids are ignored.
    fn stop(&mut self, id: PlaybackId);

    /// Stop everything and release the device. Safe to call repeatedly.
    fn close(&mut self);
}

/// An output device plus the stream of buffers that finished on their own.
pub struct OutputStream {
    pub device: Box<dyn OutputDevice>,
    pub ended: mpsc::UnboundedReceiver<PlaybackId>,
}

/// Opens devices, once per connect cycle.
pub trait AudioBackend: Send {
    fn open_input(&mut self, sample_rate: u32) -> Result<Box<dyn InputDevice>, DeviceError>;

    fn open_output(&mut self, sample_rate: u32) -> Result<OutputStream, DeviceError>;
}
