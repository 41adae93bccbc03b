//! Session lifecycle controller
//!
//! One controller owns every resource of a voice session: the microphone,
//! the output device, the transport handle and the playback scheduler. A
//! single task runs [`SessionController::run`], which serializes UI commands,
//! capture ticks, transport events and playback completions onto one
//! `select!` loop, so handlers never race each other. Opening devices can
//! block on the audio server, so the loop does it on a blocking task and
//! keeps serving hang-ups and events in the meantime.
//!
//! ```text
//! Disconnected --start--> Connecting --Opened--> Connected
//!      ^                      |                     |
//!      |                      +----- failure -------+--> Error --dismiss--> Disconnected
//!      +--------------- hang up / Closed -----------+
//! ```

use crate::capture::{CaptureOutcome, CapturePipeline, CaptureStats};
use crate::config::SessionConfig;
use crate::device::{AudioBackend, InputDevice, OutputDevice, OutputStream, PlaybackId};
use crate::error::{DeviceError, SessionError, TransportError};
use crate::gemini::{ClientMessage, ServerEvent};
use crate::pcm::AudioFrame;
use crate::playback::{PlaybackError, PlaybackScheduler};
use crate::transcript::{Role, Transcript, TranscriptEvent};
use crate::transport::{Connector, TransportEvent, TransportHandle};
use std::future::Future;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

const TRANSCRIPT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Requests from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    SetMuted(bool),
    ToggleMute,
    HangUp,
    DismissError,
    /// Tear down and exit the run loop.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session controller has stopped")]
pub struct ControllerStopped;

/// Cloneable UI-side view of a running controller.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    volume: watch::Receiver<f32>,
    muted: watch::Receiver<bool>,
    last_error: watch::Receiver<Option<String>>,
    transcript: broadcast::Sender<TranscriptEvent>,
}

impl SessionHandle {
    pub fn send(&self, command: Command) -> Result<(), ControllerStopped> {
        self.commands.send(command).map_err(|_| ControllerStopped)
    }

    pub fn start(&self) -> Result<(), ControllerStopped> {
        self.send(Command::Start)
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), ControllerStopped> {
        self.send(Command::SetMuted(muted))
    }

    pub fn toggle_mute(&self) -> Result<(), ControllerStopped> {
        self.send(Command::ToggleMute)
    }

    pub fn hang_up(&self) -> Result<(), ControllerStopped> {
        self.send(Command::HangUp)
    }

    pub fn dismiss_error(&self) -> Result<(), ControllerStopped> {
        self.send(Command::DismissError)
    }

    pub fn shutdown(&self) -> Result<(), ControllerStopped> {
        self.send(Command::Shutdown)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn volume(&self) -> f32 {
        *self.volume.borrow()
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn watch_volume(&self) -> watch::Receiver<f32> {
        self.volume.clone()
    }

    pub fn watch_muted(&self) -> watch::Receiver<bool> {
        self.muted.clone()
    }

    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.transcript.subscribe()
    }
}

/// Devices opened for one connect cycle.
struct Devices {
    microphone: Box<dyn InputDevice>,
    output: OutputStream,
}

impl Devices {
    fn release(mut self) {
        self.microphone.stop();
        self.output.device.close();
    }
}

/// Open the microphone, then the output. May block on the audio server.
fn open_devices<B: AudioBackend>(
    backend: &mut B,
    input_rate: u32,
    output_rate: u32,
) -> Result<Devices, DeviceError> {
    let mut microphone = backend.open_input(input_rate)?;
    match backend.open_output(output_rate) {
        Ok(output) => Ok(Devices { microphone, output }),
        Err(e) => {
            microphone.stop();
            Err(e)
        }
    }
}

/// The backend travels with the blocking task and comes back with its result.
type Acquired<B> = (B, Result<Devices, DeviceError>);

struct Acquisition<B> {
    generation: u64,
    task: JoinHandle<Acquired<B>>,
}

enum LoopEvent<B> {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Frame(Option<AudioFrame>),
    Ended(Option<PlaybackId>),
    Acquired(Result<Acquired<B>, JoinError>),
}

pub struct SessionController<B, C> {
    config: SessionConfig,
    backend: Option<B>,
    acquiring: Option<Acquisition<B>>,
    /// Bumped on every teardown so devices opened for an abandoned start are released.
    generation: u64,
    connector: C,
    state: watch::Sender<ConnectionState>,
    last_error: watch::Sender<Option<String>>,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    transcript: Transcript,
    microphone: Option<Box<dyn InputDevice>>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    output: Option<Box<dyn OutputDevice>>,
    ended: Option<mpsc::UnboundedReceiver<PlaybackId>>,
    transport: TransportHandle,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    trigger_sent: bool,
}

impl<B: AudioBackend + 'static, C: Connector> SessionController<B, C> {
    pub fn new(config: SessionConfig, backend: B, connector: C) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (last_error, last_error_rx) = watch::channel(None);
        let capture = CapturePipeline::new();
        let transcript = Transcript::new(TRANSCRIPT_CAPACITY);

        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
            volume: capture.subscribe_volume(),
            muted: capture.subscribe_muted(),
            last_error: last_error_rx,
            transcript: transcript.sender(),
        };

        let controller = Self {
            playback: PlaybackScheduler::new(config.output_sample_rate),
            config,
            backend: Some(backend),
            acquiring: None,
            generation: 0,
            connector,
            state,
            last_error,
            commands: Some(command_rx),
            capture,
            transcript,
            microphone: None,
            frames: None,
            output: None,
            ended: None,
            transport: TransportHandle::Absent,
            events: None,
            trigger_sent: false,
        };
        (controller, handle)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    pub fn is_muted(&self) -> bool {
        self.capture.is_muted()
    }

    /// Process commands and device/transport events until shutdown.
    pub async fn run(mut self) {
        let Some(mut commands) = self.commands.take() else {
            warn!("Session controller is already running");
            return;
        };
        info!("Session controller started");

        loop {
            let event = tokio::select! {
                command = commands.recv() => LoopEvent::Command(command),
                event = or_pending(self.events.as_mut().map(|rx| rx.recv())) => LoopEvent::Transport(event),
                frame = or_pending(self.frames.as_mut().map(|rx| rx.recv())) => LoopEvent::Frame(frame),
                id = or_pending(self.ended.as_mut().map(|rx| rx.recv())) => LoopEvent::Ended(id),
                joined = or_pending(self.acquiring.as_mut().map(|a| &mut a.task)) => LoopEvent::Acquired(joined),
            };

            match event {
                LoopEvent::Command(None) | LoopEvent::Command(Some(Command::Shutdown)) => break,
                LoopEvent::Command(Some(Command::Start)) => self.start_in_background(),
                LoopEvent::Command(Some(command)) => self.handle_command(command),
                LoopEvent::Acquired(joined) => {
                    if let Some(acquisition) = self.acquiring.take() {
                        self.on_acquired(acquisition.generation, joined);
                    }
                }
                LoopEvent::Transport(Some(event)) => self.handle_transport_event(event),
                LoopEvent::Transport(None) => {
                    debug!("Transport event stream ended");
                    self.handle_transport_event(TransportEvent::Closed);
                }
                LoopEvent::Frame(Some(frame)) => {
                    self.handle_frame(frame);
                }
                LoopEvent::Frame(None) => {
                    self.frames = None;
                    self.fail(DeviceError::Microphone("capture stream ended".to_string()).into());
                }
                LoopEvent::Ended(Some(id)) => self.handle_playback_ended(id),
                LoopEvent::Ended(None) => {
                    self.ended = None;
                    if self.output.is_some() {
                        self.fail(DeviceError::Output("playback stream ended".to_string()).into());
                    }
                }
            }
        }

        self.hang_up();
        info!("Session controller stopped");
    }

    pub fn handle_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);
        match command {
            Command::Start => self.start(),
            Command::SetMuted(muted) => self.set_muted(muted),
            Command::ToggleMute => {
                self.capture.toggle_mute();
            }
            Command::HangUp => self.hang_up(),
            Command::DismissError => self.dismiss_error(),
            Command::Shutdown => self.hang_up(),
        }
    }

    /// Acquire devices and open the transport. Only valid from `Disconnected`.
    ///
    /// Opens the devices on the calling thread; [`run`](Self::run) does the
    /// same work on a blocking task.
    pub fn start(&mut self) {
        let Some(mut backend) = self.begin_start() else {
            return;
        };
        let result = open_devices(
            &mut backend,
            self.config.input_sample_rate,
            self.config.output_sample_rate,
        );
        self.backend = Some(backend);
        self.install(result);
    }

    fn start_in_background(&mut self) {
        let Some(mut backend) = self.begin_start() else {
            return;
        };
        let input_rate = self.config.input_sample_rate;
        let output_rate = self.config.output_sample_rate;
        let task = tokio::task::spawn_blocking(move || {
            let result = open_devices(&mut backend, input_rate, output_rate);
            (backend, result)
        });
        self.acquiring = Some(Acquisition {
            generation: self.generation,
            task,
        });
    }

    /// Enter `Connecting` and lend out the backend, or refuse the start.
    fn begin_start(&mut self) -> Option<B> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            warn!("Ignoring start while {:?}", state);
            return None;
        }
        let Some(backend) = self.backend.take() else {
            warn!("Ignoring start, devices from a cancelled start are still opening");
            return None;
        };

        info!("Starting voice session");
        self.transcript.clear();
        self.last_error.send_replace(None);
        self.set_state(ConnectionState::Connecting);
        Some(backend)
    }

    fn on_acquired(&mut self, generation: u64, joined: Result<Acquired<B>, JoinError>) {
        let current = generation == self.generation && self.state() == ConnectionState::Connecting;
        let (backend, result) = match joined {
            Ok(acquired) => acquired,
            Err(e) => {
                error!("Device acquisition task failed: {}", e);
                if current {
                    self.fail(DeviceError::Microphone("device acquisition task failed".to_string()).into());
                }
                return;
            }
        };
        self.backend = Some(backend);

        if !current {
            if let Ok(devices) = result {
                debug!("Releasing devices opened for an abandoned start");
                devices.release();
            }
            return;
        }
        self.install(result);
    }

    fn install(&mut self, devices: Result<Devices, DeviceError>) {
        if let Err(e) = self.connect(devices) {
            self.fail(e);
        }
    }

    fn connect(&mut self, devices: Result<Devices, DeviceError>) -> Result<(), SessionError> {
        let Devices { microphone, output } = devices?;
        info!("Microphone acquired: {}", microphone.name());
        self.microphone = Some(microphone);

        let OutputStream { device, ended } = output;
        let output = self.output.insert(device);
        self.ended = Some(ended);
        if output.is_suspended() {
            output.resume()?;
        }

        let link = self.connector.open(&self.config.gemini)?;
        self.transport = TransportHandle::Pending(link.transport);
        self.events = Some(link.events);
        Ok(())
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Message(event) => self.on_server_event(event),
            TransportEvent::Closed => {
                let state = self.state();
                self.teardown();
                if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
                    info!("Remote closed the session");
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            TransportEvent::Errored(reason) => self.fail(TransportError::Remote(reason).into()),
        }
    }

    fn on_opened(&mut self) {
        if self.state() != ConnectionState::Connecting || !self.transport.mark_ready() {
            warn!("Ignoring unexpected open in state {:?}", self.state());
            return;
        }

        if let Some(output) = self.output.as_mut() {
            if output.is_suspended() {
                if let Err(e) = output.resume() {
                    return self.fail(e.into());
                }
            }
        }

        let started = match self.microphone.as_mut() {
            Some(microphone) => microphone.start(self.config.frame_len),
            None => Err(DeviceError::Closed),
        };
        match started {
            Ok(frames) => self.frames = Some(frames),
            Err(e) => return self.fail(e.into()),
        }

        self.send_start_trigger();
        self.set_state(ConnectionState::Connected);
    }

    /// Prompt the agent to speak first. Sent once per connection.
    fn send_start_trigger(&mut self) {
        if self.trigger_sent {
            return;
        }
        self.trigger_sent = true;

        let trigger = &self.config.start_trigger;
        if let Some(text) = &trigger.text {
            if let Err(e) = self.transport.send(ClientMessage::text_turn(text)) {
                warn!("Failed to send start trigger text: {}", e);
            }
        }
        let rate = self.config.input_sample_rate;
        if let Some(samples) = trigger.silence_samples(rate) {
            if let Err(e) = self.transport.send(ClientMessage::audio(&vec![0.0; samples], rate)) {
                warn!("Failed to send start trigger audio: {}", e);
            }
        }
        debug!("Start trigger sent");
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Audio { data, sample_rate } => self.play_chunk(&data, sample_rate),
            ServerEvent::Interrupted => {
                info!("Interrupted by user speech");
                match self.output.as_mut() {
                    Some(output) => {
                        self.playback.interrupt(output.as_mut());
                    }
                    None => self.playback.clear(),
                }
            }
            ServerEvent::InputTranscription(text) => self.transcript.push_fragment(Role::User, &text),
            ServerEvent::OutputTranscription(text) => self.transcript.push_fragment(Role::Model, &text),
            ServerEvent::TurnComplete => {
                debug!("Model turn complete");
                self.transcript.complete_turn();
            }
            ServerEvent::GoAway { time_left } => {
                warn!("Server will disconnect soon (time left: {:?})", time_left);
            }
            ServerEvent::SetupComplete => {}
        }
    }

    fn play_chunk(&mut self, data: &str, sample_rate: Option<u32>) {
        let Some(output) = self.output.as_mut() else {
            debug!("Dropping audio chunk, no output device");
            return;
        };
        match self.playback.enqueue(output.as_mut(), data, sample_rate) {
            Ok(_) => {}
            Err(PlaybackError::Decode(e)) => warn!("Dropping malformed audio chunk: {}", e),
            Err(PlaybackError::Device(e)) => self.fail(e.into()),
        }
    }

    pub fn handle_frame(&mut self, frame: AudioFrame) -> Option<CaptureOutcome> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        Some(self.capture.on_frame(&frame, &self.transport))
    }

    pub fn handle_playback_ended(&mut self, id: PlaybackId) {
        if self.playback.on_ended(id).is_some() {
            debug!("Chunk {} finished", id);
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.capture.set_muted(muted);
    }

    /// User hangs up. A no-op when nothing is held.
    pub fn hang_up(&mut self) {
        self.teardown();
        if matches!(self.state(), ConnectionState::Connecting | ConnectionState::Connected) {
            info!("Session ended by user");
            self.set_state(ConnectionState::Disconnected);
        }
    }

    pub fn dismiss_error(&mut self) {
        if self.state() == ConnectionState::Error {
            self.last_error.send_replace(None);
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Release everything this session holds. Safe from any state, any number of times.
    pub fn teardown(&mut self) {
        self.generation += 1;
        self.frames = None;
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
            debug!("Microphone {} released", microphone.name());
        }

        match self.output.take() {
            Some(mut output) => {
                self.playback.interrupt(output.as_mut());
                output.close();
                debug!("Output device closed");
            }
            None => self.playback.clear(),
        }
        self.ended = None;

        self.transport.close();
        self.events = None;
        self.trigger_sent = false;

        let stats = self.capture.reset();
        if stats != CaptureStats::default() {
            info!(
                "Capture: {} frames sent, {} muted, {} dropped",
                stats.sent, stats.muted, stats.dropped
            );
        }
    }

    fn fail(&mut self, err: SessionError) {
        error!("Session failed: {}", err);
        self.teardown();
        self.last_error.send_replace(Some(err.to_string()));
        self.set_state(ConnectionState::Error);
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Session state: {:?} -> {:?}", previous, next);
        }
    }
}

/// Await `future` if there is one, otherwise never resolve.
async fn or_pending<F: Future>(future: Option<F>) -> F::Output {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}
