//! PulseAudio backend
//!
//! Capture and playback each run on a dedicated OS thread that owns its
//! `Simple` connection. The capture thread reads float frames and hands them
//! to the session loop; the playback thread pulls 20 ms blocks from the
//! [`Mixer`] and writes them to the server, which paces the device clock.

use crate::device::{AudioBackend, InputDevice, OutputDevice, OutputStream, PlaybackId};
use crate::error::DeviceError;
use crate::mixer::Mixer;
use crate::pcm::{AudioFrame, PlayableBuffer};
use libpulse_binding as pulse;
use libpulse_simple_binding::Simple;
use pulse::callbacks::ListResult;
use pulse::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use pulse::def::{BufferAttr, Retval};
use pulse::mainloop::standard::{IterateResult, Mainloop};
use pulse::proplist::Proplist;
use pulse::sample::{Format, Spec};
use pulse::stream::Direction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(2);
/// Frames buffered between the capture thread and the session loop.
const CAPTURE_QUEUE: usize = 4;
const BLOCK_MS: u32 = 20;

/// Represents a PulseAudio capture source
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of a playback sink rather than a microphone
    pub is_monitor: bool,
}

/// Opens PulseAudio capture and playback streams.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    input_device: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            input_device: None,
        }
    }

    /// Capture from a named source instead of the default microphone.
    pub fn with_input_device(mut self, device: Option<String>) -> Self {
        self.input_device = device;
        self
    }

    /// The configured source if PulseAudio knows it, otherwise the default.
    fn resolve_input_device(&self) -> Option<String> {
        let wanted = self.input_device.as_ref()?;
        match list_sources() {
            Ok(sources) if sources.iter().any(|s| &s.name == wanted) => Some(wanted.clone()),
            Ok(_) => {
                warn!("Input device {} not found, using default microphone", wanted);
                None
            }
            Err(e) => {
                warn!("Could not list sources ({}), trying {} anyway", e, wanted);
                Some(wanted.clone())
            }
        }
    }
}

impl AudioBackend for PulseBackend {
    fn open_input(&mut self, sample_rate: u32) -> Result<Box<dyn InputDevice>, DeviceError> {
        let device = self.resolve_input_device();
        let mic = PulseMicrophone::open(&self.app_name, device, sample_rate)?;
        Ok(Box::new(mic))
    }

    fn open_output(&mut self, sample_rate: u32) -> Result<OutputStream, DeviceError> {
        PulseOutput::open(&self.app_name, sample_rate)
    }
}

type StartRequest = (usize, mpsc::Sender<AudioFrame>);

/// Microphone capture through a PulseAudio record stream.
pub struct PulseMicrophone {
    name: String,
    start_tx: Option<std_mpsc::Sender<StartRequest>>,
    shutdown: Arc<AtomicBool>,
    _handle: Option<thread::JoinHandle<()>>,
}

impl PulseMicrophone {
    /// Connect the record stream. Frames flow only after [`InputDevice::start`].
    pub fn open(app_name: &str, device: Option<String>, sample_rate: u32) -> Result<Self, DeviceError> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (start_tx, start_rx) = std_mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let name = device.clone().unwrap_or_else(|| "default".to_string());
        let app_name = app_name.to_string();
        let shutdown_clone = shutdown.clone();
        let handle = thread::Builder::new()
            .name("pulse-capture".to_string())
            .spawn(move || {
                capture_thread(app_name, device, sample_rate, ready_tx, start_rx, shutdown_clone)
            })
            .map_err(|e| DeviceError::Microphone(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                info!("Microphone {} connected at {} Hz", name, sample_rate);
                Ok(Self {
                    name,
                    start_tx: Some(start_tx),
                    shutdown,
                    _handle: Some(handle),
                })
            }
            Ok(Err(msg)) => Err(DeviceError::Microphone(msg)),
            Err(_) => {
                shutdown.store(true, Ordering::Relaxed);
                Err(DeviceError::Microphone("timed out opening capture stream".to_string()))
            }
        }
    }
}

impl InputDevice for PulseMicrophone {
    fn start(&mut self, frame_len: usize) -> Result<mpsc::Receiver<AudioFrame>, DeviceError> {
        let start_tx = self.start_tx.take().ok_or(DeviceError::Closed)?;
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE);
        start_tx
            .send((frame_len, tx))
            .map_err(|_| DeviceError::Microphone("capture thread exited".to_string()))?;
        Ok(rx)
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Wakes a thread still waiting for start; a reading thread exits after its current frame.
        self.start_tx = None;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PulseMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    app_name: String,
    device: Option<String>,
    sample_rate: u32,
    ready_tx: std_mpsc::Sender<Result<(), String>>,
    start_rx: std_mpsc::Receiver<StartRequest>,
    shutdown: Arc<AtomicBool>,
) {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: sample_rate,
    };
    let simple = match Simple::new(
        None,
        &app_name,
        Direction::Record,
        device.as_deref(),
        "microphone",
        &spec,
        None,
        None,
    ) {
        Ok(simple) => {
            let _ = ready_tx.send(Ok(()));
            simple
        }
        Err(e) => {
            let _ = ready_tx.send(Err(format!("{e}")));
            return;
        }
    };

    let Ok((frame_len, frames_tx)) = start_rx.recv() else {
        debug!("Microphone released before capture started");
        return;
    };

    let mut bytes = vec![0u8; frame_len * 4];
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = simple.read(&mut bytes) {
            error!("Audio read error: {}", e);
            break;
        }
        let samples = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        match frames_tx.try_send(AudioFrame::new(samples, sample_rate)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Session loop lagging, dropping capture frame"),
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!("Capture thread exiting");
}

/// Playback through a PulseAudio stream fed by the mixer.
pub struct PulseOutput {
    mixer: Arc<Mutex<Mixer>>,
    next_id: u64,
    _handle: Option<thread::JoinHandle<()>>,
}

fn lock(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    match mixer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PulseOutput {
    /// Open a playback stream. It starts suspended: the clock holds at zero
    /// until the first `resume`.
    pub fn open(app_name: &str, sample_rate: u32) -> Result<OutputStream, DeviceError> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(sample_rate);
        mixer.set_suspended(true);
        let mixer = Arc::new(Mutex::new(mixer));

        let app_name = app_name.to_string();
        let mixer_clone = mixer.clone();
        let handle = thread::Builder::new()
            .name("pulse-playback".to_string())
            .spawn(move || playback_thread(app_name, sample_rate, mixer_clone, ended_tx, ready_tx))
            .map_err(|e| DeviceError::Output(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                info!("Playback stream connected at {} Hz", sample_rate);
                let output = PulseOutput {
                    mixer,
                    next_id: 0,
                    _handle: Some(handle),
                };
                Ok(OutputStream {
                    device: Box::new(output),
                    ended: ended_rx,
                })
            }
            Ok(Err(msg)) => Err(DeviceError::Output(msg)),
            Err(_) => {
                lock(&mixer).close();
                Err(DeviceError::Output("timed out opening playback stream".to_string()))
            }
        }
    }
}

impl OutputDevice for PulseOutput {
    fn current_time(&self) -> f64 {
        lock(&self.mixer).current_time()
    }

    fn is_suspended(&self) -> bool {
        lock(&self.mixer).is_suspended()
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        let mut mixer = lock(&self.mixer);
        if mixer.is_closed() {
            return Err(DeviceError::Closed);
        }
        mixer.set_suspended(false);
        Ok(())
    }

    fn start(&mut self, buffer: PlayableBuffer, at: f64) -> Result<PlaybackId, DeviceError> {
        let mut mixer = lock(&self.mixer);
        if mixer.is_closed() {
            return Err(DeviceError::Closed);
        }
        self.next_id += 1;
        let id = PlaybackId(self.next_id);
        mixer.add(id, buffer, at);
        Ok(id)
    }

    fn stop(&mut self, id: PlaybackId) {
        lock(&self.mixer).remove(id);
    }

    fn close(&mut self) {
        lock(&self.mixer).close();
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}

enum Step {
    Closed,
    Suspended,
    Rendered(Vec<PlaybackId>),
}

fn playback_thread(
    app_name: String,
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    ended_tx: mpsc::UnboundedSender<PlaybackId>,
    ready_tx: std_mpsc::Sender<Result<(), String>>,
) {
    let spec = Spec {
        format: Format::F32le,
        channels: 1,
        rate: sample_rate,
    };
    let block_frames = (sample_rate * BLOCK_MS / 1000).max(1) as usize;
    // Keep about 100ms queued in the server so the clock tracks what is audible.
    let attr = BufferAttr {
        maxlength: u32::MAX,
        tlength: (block_frames * 5 * 4) as u32,
        prebuf: u32::MAX,
        minreq: u32::MAX,
        fragsize: u32::MAX,
    };

    let simple = match Simple::new(
        None,
        &app_name,
        Direction::Playback,
        None,
        "speech",
        &spec,
        None,
        Some(&attr),
    ) {
        Ok(simple) => {
            let _ = ready_tx.send(Ok(()));
            simple
        }
        Err(e) => {
            let _ = ready_tx.send(Err(format!("{e}")));
            return;
        }
    };

    let mut block = vec![0.0f32; block_frames];
    let mut bytes = Vec::with_capacity(block_frames * 4);
    loop {
        let step = {
            let mut mixer = lock(&mixer);
            if mixer.is_closed() {
                Step::Closed
            } else if mixer.is_suspended() {
                Step::Suspended
            } else {
                Step::Rendered(mixer.render(&mut block))
            }
        };

        match step {
            Step::Closed => break,
            Step::Suspended => {
                thread::sleep(Duration::from_millis(BLOCK_MS as u64));
                continue;
            }
            Step::Rendered(finished) => {
                for id in finished {
                    let _ = ended_tx.send(id);
                }
            }
        }

        bytes.clear();
        for sample in &block {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        if let Err(e) = simple.write(&bytes) {
            error!("Audio write error: {}", e);
            lock(&mixer).close();
            break;
        }
    }

    let _ = simple.flush();
    debug!("Playback thread exiting");
}

/// List PulseAudio capture sources.
pub fn list_sources() -> Result<Vec<SourceInfo>, DeviceError> {
    let fail = |msg: &str| DeviceError::Microphone(msg.to_string());

    let mut proplist = Proplist::new().ok_or_else(|| fail("failed to create proplist"))?;
    proplist
        .set_str(pulse::proplist::properties::APPLICATION_NAME, "livetutor-device-lister")
        .map_err(|_| fail("failed to set application name"))?;

    let mut mainloop = Mainloop::new().ok_or_else(|| fail("failed to create mainloop"))?;
    let mut context = Context::new_with_proplist(&mainloop, "livetutor-context", &proplist)
        .ok_or_else(|| fail("failed to create context"))?;
    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| DeviceError::Microphone(format!("{e}")))?;

    let deadline = Instant::now() + LIST_TIMEOUT;
    loop {
        iterate(&mut mainloop, deadline)?;
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(fail("connection to PulseAudio failed"))
            }
            _ => {}
        }
    }

    let sources = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let sources_clone = sources.clone();
    let done_clone = done.clone();

    let introspector = context.introspect();
    let _op = introspector.get_source_info_list(move |result| match result {
        ListResult::Item(info) => {
            let is_monitor = info.monitor_of_sink.is_some()
                || info.name.as_ref().map(|n| n.contains("monitor")).unwrap_or(false);
            if let (Some(name), Some(description)) = (info.name.as_ref(), info.description.as_ref()) {
                if let Ok(mut sources) = sources_clone.lock() {
                    sources.push(SourceInfo {
                        name: name.to_string(),
                        description: description.to_string(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        is_monitor,
                    });
                }
            }
        }
        ListResult::End => done_clone.store(true, Ordering::SeqCst),
        ListResult::Error => {
            error!("Error listing audio sources");
            done_clone.store(true, Ordering::SeqCst);
        }
    });

    while !done.load(Ordering::SeqCst) {
        iterate(&mut mainloop, deadline)?;
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let result = match sources.lock() {
        Ok(sources) => Ok(sources.clone()),
        Err(_) => Err(fail("failed to access source list")),
    };
    result
}

/// One non-blocking mainloop pass, giving up once `deadline` has passed.
fn iterate(mainloop: &mut Mainloop, deadline: Instant) -> Result<(), DeviceError> {
    if Instant::now() >= deadline {
        return Err(DeviceError::Microphone("timed out listing audio sources".to_string()));
    }
    match mainloop.iterate(false) {
        IterateResult::Quit(_) | IterateResult::Err(_) => {
            Err(DeviceError::Microphone("mainloop iterate failed".to_string()))
        }
        IterateResult::Success(0) => {
            thread::sleep(Duration::from_millis(10));
            Ok(())
        }
        IterateResult::Success(_) => Ok(()),
    }
}
