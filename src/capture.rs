//! Capture pipeline: loudness meter, mute gate, encode and submit.

use crate::error::TransportError;
use crate::gemini::ClientMessage;
use crate::pcm::AudioFrame;
use crate::transport::TransportHandle;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Sent,
    Muted,
    /// The transport could not take the frame; it is gone for good.
    Dropped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub sent: u64,
    pub muted: u64,
    pub dropped: u64,
}

pub struct CapturePipeline {
    volume: watch::Sender<f32>,
    muted: watch::Sender<bool>,
    stats: CaptureStats,
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturePipeline {
    pub fn new() -> Self {
        let (volume, _) = watch::channel(0.0);
        let (muted, _) = watch::channel(false);
        Self {
            volume,
            muted,
            stats: CaptureStats::default(),
        }
    }

    /// Current loudness, updated on every tick.
    pub fn subscribe_volume(&self) -> watch::Receiver<f32> {
        self.volume.subscribe()
    }

    pub fn subscribe_muted(&self) -> watch::Receiver<bool> {
        self.muted.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.borrow()
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.muted.send_replace(muted) != muted {
            debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
        }
    }

    pub fn toggle_mute(&mut self) -> bool {
        let muted = !self.is_muted();
        self.set_muted(muted);
        muted
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Process one capture tick.
    pub fn on_frame(&mut self, frame: &AudioFrame, transport: &TransportHandle) -> CaptureOutcome {
        self.volume.send_replace(frame.rms());

        if self.is_muted() {
            self.stats.muted += 1;
            return CaptureOutcome::Muted;
        }

        match transport.send(ClientMessage::audio(frame.samples(), frame.sample_rate())) {
            Ok(()) => {
                self.stats.sent += 1;
                CaptureOutcome::Sent
            }
            Err(TransportError::NotReady | TransportError::Closed | TransportError::Congested) => {
                self.stats.dropped += 1;
                CaptureOutcome::Dropped
            }
            Err(e) => {
                warn!("Failed to send audio frame: {}", e);
                self.stats.dropped += 1;
                CaptureOutcome::Dropped
            }
        }
    }

    /// Back to the idle state: silent meter, unmuted, fresh counters.
    pub fn reset(&mut self) -> CaptureStats {
        self.volume.send_replace(0.0);
        self.muted.send_replace(false);
        std::mem::take(&mut self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcm::INPUT_SAMPLE_RATE;
    use crate::testing::FakeTransport;

    fn loud_frame() -> AudioFrame {
        AudioFrame::new(vec![0.5; 4096], INPUT_SAMPLE_RATE)
    }

    #[test]
    fn test_mute_gates_sends_but_not_volume() {
        let (transport, sent) = FakeTransport::new();
        let handle = TransportHandle::Ready(Box::new(transport));
        let mut capture = CapturePipeline::new();
        let volume = capture.subscribe_volume();

        capture.set_muted(true);
        for _ in 0..3 {
            assert_eq!(capture.on_frame(&loud_frame(), &handle), CaptureOutcome::Muted);
        }
        assert!(sent.lock().unwrap().is_empty());
        assert!((*volume.borrow() - 0.5).abs() < 1e-6);

        capture.set_muted(false);
        assert_eq!(capture.on_frame(&loud_frame(), &handle), CaptureOutcome::Sent);
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(
            capture.stats(),
            CaptureStats {
                sent: 1,
                muted: 3,
                dropped: 0
            }
        );
    }

    #[test]
    fn test_frames_dropped_until_ready() {
        let (transport, sent) = FakeTransport::new();
        let mut handle = TransportHandle::Pending(Box::new(transport));
        let mut capture = CapturePipeline::new();

        assert_eq!(capture.on_frame(&loud_frame(), &handle), CaptureOutcome::Dropped);
        handle.mark_ready();
        assert_eq!(capture.on_frame(&loud_frame(), &handle), CaptureOutcome::Sent);
        assert_eq!(sent.lock().unwrap().len(), 1);

        handle.close();
        assert_eq!(capture.on_frame(&loud_frame(), &handle), CaptureOutcome::Dropped);
        assert_eq!(capture.stats().dropped, 2);
    }

    #[test]
    fn test_congested_transport_drops_frames() {
        let (transport, sent) = FakeTransport::with_capacity(2);
        let handle = TransportHandle::Ready(Box::new(transport));
        let mut capture = CapturePipeline::new();

        let outcomes: Vec<CaptureOutcome> = (0..5).map(|_| capture.on_frame(&loud_frame(), &handle)).collect();
        assert_eq!(
            outcomes,
            vec![
                CaptureOutcome::Sent,
                CaptureOutcome::Sent,
                CaptureOutcome::Dropped,
                CaptureOutcome::Dropped,
                CaptureOutcome::Dropped,
            ]
        );
        assert_eq!(sent.lock().unwrap().len(), 2);
        assert_eq!(capture.stats().dropped, 3);
    }

    #[test]
    fn test_reset_unmutes_and_silences() {
        let mut capture = CapturePipeline::new();
        let volume = capture.subscribe_volume();
        let muted = capture.subscribe_muted();

        assert!(capture.toggle_mute());
        capture.on_frame(&loud_frame(), &TransportHandle::Absent);
        let stats = capture.reset();

        assert_eq!(stats.muted, 1);
        assert!(!*muted.borrow());
        assert_eq!(*volume.borrow(), 0.0);
        assert_eq!(capture.stats(), CaptureStats::default());
    }
}
