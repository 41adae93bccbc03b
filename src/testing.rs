//! In-memory devices and transport for unit tests.

use crate::config::GeminiConfig;
use crate::device::{AudioBackend, InputDevice, OutputDevice, OutputStream, PlaybackId};
use crate::error::{DeviceError, TransportError};
use crate::gemini::ClientMessage;
use crate::pcm::{AudioFrame, PlayableBuffer};
use crate::transport::{Connector, Transport, TransportEvent, TransportLink};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Records every message sent through it.
pub struct FakeTransport {
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    closed: Arc<AtomicUsize>,
    capacity: Option<usize>,
}

impl FakeTransport {
    pub fn new() -> (Self, Arc<Mutex<Vec<ClientMessage>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = Self {
            sent: sent.clone(),
            closed: Arc::new(AtomicUsize::new(0)),
            capacity: None,
        };
        (transport, sent)
    }

    /// A transport whose peer stops reading after `capacity` messages.
    pub fn with_capacity(capacity: usize) -> (Self, Arc<Mutex<Vec<ClientMessage>>>) {
        let (mut transport, sent) = Self::new();
        transport.capacity = Some(capacity);
        (transport, sent)
    }

    /// Number of times `close` was called.
    pub fn closed_flag(&self) -> Arc<AtomicUsize> {
        self.closed.clone()
    }
}

impl Transport for FakeTransport {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        let mut sent = self.sent.lock().unwrap();
        if self.capacity.is_some_and(|capacity| sent.len() >= capacity) {
            return Err(TransportError::Congested);
        }
        sent.push(message);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test-side view of the remote service.
#[derive(Clone, Default)]
pub struct FakeRemote {
    events: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
    closed: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    fail_open: Arc<AtomicBool>,
}

impl FakeRemote {
    /// Deliver an event to the most recently opened session.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the event sender, as a connection task does when it exits.
    pub fn hang_up(&self) {
        self.events.lock().unwrap().take();
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn audio_sent(&self) -> usize {
        self.sent().iter().filter(|m| m.kind() == "realtimeInput").count()
    }

    pub fn text_sent(&self) -> usize {
        self.sent().iter().filter(|m| m.kind() == "clientContent").count()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    remote: FakeRemote,
}

impl FakeConnector {
    pub fn new() -> (Self, FakeRemote) {
        let remote = FakeRemote::default();
        (
            Self {
                remote: remote.clone(),
            },
            remote,
        )
    }
}

impl Connector for FakeConnector {
    fn open(&mut self, _config: &GeminiConfig) -> Result<TransportLink, TransportError> {
        if self.remote.fail_open.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Setup("refused".to_string()));
        }
        self.remote.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::unbounded_channel();
        *self.remote.events.lock().unwrap() = Some(tx);
        Ok(TransportLink {
            transport: Box::new(FakeTransport {
                sent: self.remote.sent.clone(),
                closed: self.remote.closed.clone(),
                capacity: None,
            }),
            events,
        })
    }
}

/// What the fake output device has been asked to do.
#[derive(Debug, Default)]
pub struct OutputLog {
    pub time: f64,
    pub suspended: bool,
    pub started: Vec<(PlaybackId, f64, f64)>,
    pub stopped: Vec<PlaybackId>,
    pub resumes: usize,
    pub closes: usize,
    pub fail_start: bool,
}

pub struct FakeOutput {
    log: Arc<Mutex<OutputLog>>,
    next_id: u64,
}

impl FakeOutput {
    pub fn new() -> (Self, Arc<Mutex<OutputLog>>) {
        let log = Arc::new(Mutex::new(OutputLog::default()));
        (
            Self {
                log: log.clone(),
                next_id: 0,
            },
            log,
        )
    }
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        self.log.lock().unwrap().time
    }

    fn is_suspended(&self) -> bool {
        self.log.lock().unwrap().suspended
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        let mut log = self.log.lock().unwrap();
        log.suspended = false;
        log.resumes += 1;
        Ok(())
    }

    fn start(&mut self, buffer: PlayableBuffer, at: f64) -> Result<PlaybackId, DeviceError> {
        let mut log = self.log.lock().unwrap();
        if log.fail_start {
            return Err(DeviceError::Output("device lost".to_string()));
        }
        self.next_id += 1;
        let id = PlaybackId(self.next_id);
        log.started.push((id, at, buffer.duration()));
        Ok(id)
    }

    fn stop(&mut self, id: PlaybackId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
    }
}

struct FakeInput {
    devices: FakeDevices,
}

impl InputDevice for FakeInput {
    fn start(&mut self, frame_len: usize) -> Result<mpsc::Receiver<AudioFrame>, DeviceError> {
        let (tx, rx) = mpsc::channel(4);
        *self.devices.frames.lock().unwrap() = Some(tx);
        *self.devices.frame_len.lock().unwrap() = Some(frame_len);
        Ok(rx)
    }

    fn stop(&mut self) {
        self.devices.frames.lock().unwrap().take();
        self.devices.mic_stops.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "fake-mic"
    }
}

/// Shared state of every device a [`FakeBackend`] hands out.
#[derive(Clone, Default)]
pub struct FakeDevices {
    pub output: Arc<Mutex<OutputLog>>,
    frames: Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>,
    frame_len: Arc<Mutex<Option<usize>>>,
    ended: Arc<Mutex<Option<mpsc::UnboundedSender<PlaybackId>>>>,
    mic_opens: Arc<AtomicUsize>,
    mic_stops: Arc<AtomicUsize>,
    fail_input: Arc<AtomicBool>,
    gate: Arc<Mutex<Option<std_mpsc::Receiver<()>>>>,
}

impl FakeDevices {
    pub fn set_time(&self, time: f64) {
        self.output.lock().unwrap().time = time;
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.output.lock().unwrap().suspended = suspended;
    }

    pub fn started(&self) -> Vec<(PlaybackId, f64, f64)> {
        self.output.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        self.output.lock().unwrap().stopped.clone()
    }

    pub fn output_closes(&self) -> usize {
        self.output.lock().unwrap().closes
    }

    pub fn mic_opens(&self) -> usize {
        self.mic_opens.load(Ordering::SeqCst)
    }

    pub fn mic_stops(&self) -> usize {
        self.mic_stops.load(Ordering::SeqCst)
    }

    pub fn capturing(&self) -> bool {
        self.frames.lock().unwrap().is_some()
    }

    pub fn frame_len(&self) -> Option<usize> {
        *self.frame_len.lock().unwrap()
    }

    /// Make the next microphone open block until the returned sender fires or drops.
    pub fn hold_microphone(&self) -> std_mpsc::Sender<()> {
        let (tx, rx) = std_mpsc::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn deny_microphone(&self) {
        self.fail_input.store(true, Ordering::SeqCst);
    }

    /// Feed one capture tick. Returns false once capture has stopped.
    pub fn push_frame(&self, frame: AudioFrame) -> bool {
        match self.frames.lock().unwrap().as_ref() {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Report a buffer as played out.
    pub fn finish(&self, id: PlaybackId) -> bool {
        match self.ended.lock().unwrap().as_ref() {
            Some(tx) => tx.send(id).is_ok(),
            None => false,
        }
    }
}

pub struct FakeBackend {
    devices: FakeDevices,
}

impl FakeBackend {
    pub fn new() -> (Self, FakeDevices) {
        let devices = FakeDevices::default();
        (
            Self {
                devices: devices.clone(),
            },
            devices,
        )
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(&mut self, _sample_rate: u32) -> Result<Box<dyn InputDevice>, DeviceError> {
        let gate = self.devices.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.devices.fail_input.load(Ordering::SeqCst) {
            return Err(DeviceError::Microphone("permission denied".to_string()));
        }
        self.devices.mic_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeInput {
            devices: self.devices.clone(),
        }))
    }

    fn open_output(&mut self, _sample_rate: u32) -> Result<OutputStream, DeviceError> {
        let (tx, ended) = mpsc::unbounded_channel();
        *self.devices.ended.lock().unwrap() = Some(tx);
        Ok(OutputStream {
            device: Box::new(FakeOutput {
                log: self.devices.output.clone(),
                next_id: 0,
            }),
            ended,
        })
    }
}
