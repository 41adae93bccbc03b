//! Transport session to the remote conversational service
//!
//! The session controller treats the channel as an opaque handle: it can
//! `send` client messages and it receives a stream of [`TransportEvent`]s.
//! Exactly one `Opened` precedes everything else; `Closed` and `Errored` are
//! terminal.
//!
//! The handle has two phases. While `Pending` every send is rejected with
//! [`TransportError::NotReady`] and the caller drops the frame; live audio is
//! worthless once stale, so nothing is queued for replay after open. Once
//! `Ready`, the queue to the socket writer holds only a few messages and a
//! send into a full queue fails with [`TransportError::Congested`].

use crate::config::GeminiConfig;
use crate::error::TransportError;
use crate::gemini::{parse_server_message, ClientMessage, ServerEvent};
use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Messages waiting for the socket writer, about a second of capture audio.
const OUTBOUND_QUEUE: usize = 4;

/// Lifecycle and message events from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Message(ServerEvent),
    Closed,
    Errored(String),
}

/// Outbound half of an open channel.
pub trait Transport: Send {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError>;

    /// Close the channel. Safe to call repeatedly.
    fn close(&mut self);
}

/// A freshly opened channel and its event stream.
pub struct TransportLink {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transport sessions, once per connect cycle.
pub trait Connector: Send {
    fn open(&mut self, config: &GeminiConfig) -> Result<TransportLink, TransportError>;
}

/// Two-phase handle held by the session controller.
#[derive(Default)]
pub enum TransportHandle {
    #[default]
    Absent,
    Pending(Box<dyn Transport>),
    Ready(Box<dyn Transport>),
}

impl TransportHandle {
    pub fn is_ready(&self) -> bool {
        matches!(self, TransportHandle::Ready(_))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, TransportHandle::Absent)
    }

    /// Promote `Pending` to `Ready`. Returns false if there was nothing pending.
    pub fn mark_ready(&mut self) -> bool {
        match std::mem::take(self) {
            TransportHandle::Pending(transport) => {
                *self = TransportHandle::Ready(transport);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        match self {
            TransportHandle::Ready(transport) => transport.send(message),
            TransportHandle::Pending(_) => Err(TransportError::NotReady),
            TransportHandle::Absent => Err(TransportError::Closed),
        }
    }

    pub fn close(&mut self) {
        match std::mem::take(self) {
            TransportHandle::Pending(mut transport) | TransportHandle::Ready(mut transport) => {
                transport.close()
            }
            TransportHandle::Absent => {}
        }
    }
}

/// Connects to the Gemini Live websocket endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiConnector;

impl Connector for GeminiConnector {
    /// Spawns the connection task; must be called inside a tokio runtime.
    fn open(&mut self, config: &GeminiConfig) -> Result<TransportLink, TransportError> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let ready = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_connection(
            config.clone(),
            outbound_rx,
            event_tx,
            ready.clone(),
        ));

        Ok(TransportLink {
            transport: Box::new(GeminiTransport {
                outbound: Some(outbound_tx),
                ready,
                task: Some(task),
            }),
            events,
        })
    }
}

/// Websocket-backed transport. Messages are serialized by the connection task.
pub struct GeminiTransport {
    outbound: Option<mpsc::Sender<ClientMessage>>,
    ready: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Transport for GeminiTransport {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(TransportError::NotReady);
        }
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Congested,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&mut self) {
        let was_ready = self.ready.swap(false, Ordering::AcqRel);
        // Dropping the sender lets an open connection send a close frame and exit.
        self.outbound = None;
        if let Some(task) = self.task.take() {
            if !was_ready {
                task.abort();
            }
        }
    }
}

impl Drop for GeminiTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    config: GeminiConfig,
    outbound_rx: mpsc::Receiver<ClientMessage>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    ready: Arc<AtomicBool>,
) {
    let result = drive_connection(&config, outbound_rx, &event_tx, &ready).await;
    ready.store(false, Ordering::Release);

    let event = match result {
        Ok(()) => {
            info!("Gemini connection closed");
            TransportEvent::Closed
        }
        Err(e) => {
            error!("Gemini connection failed: {}", e);
            TransportEvent::Errored(e.to_string())
        }
    };
    // The receiver is gone if the session was already torn down.
    let _ = event_tx.send(event);
}

async fn drive_connection(
    config: &GeminiConfig,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ready: &AtomicBool,
) -> Result<(), TransportError> {
    info!("Connecting to Gemini Live API ({})", config.model);
    let (ws, resp) = connect_async(config.url.as_str()).await?;
    debug!("WebSocket connection response: {:?}", resp.status());

    let (mut sink, mut stream) = ws.split();

    let setup = ClientMessage::setup(config).to_json()?;
    sink.send(Message::text(setup)).await?;
    info!("Setup message sent, waiting for acknowledgment");

    tokio::time::timeout(config.setup_timeout, wait_for_setup(&mut stream))
        .await
        .map_err(|_| TransportError::Timeout)??;

    ready.store(true, Ordering::Release);
    info!("Gemini session setup complete");
    if event_tx.send(TransportEvent::Opened).is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => {
                    let json = message.to_json()?;
                    debug!("Sending {} ({} bytes)", message.kind(), json.len());
                    sink.send(Message::text(json)).await?;
                }
                None => {
                    debug!("Outbound channel dropped, closing websocket");
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(message)) => match inbound_events(message)? {
                    Inbound::Events(events) => {
                        for event in events {
                            if event == ServerEvent::SetupComplete {
                                continue;
                            }
                            if event_tx.send(TransportEvent::Message(event)).is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Inbound::Closed => return Ok(()),
                },
                Some(Err(e)) => return Err(TransportError::WebSocket(e)),
                None => return Ok(()),
            }
        }
    }
}

/// Read frames until the server acknowledges setup.
async fn wait_for_setup<S>(stream: &mut S) -> Result<(), TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match inbound_events(message?)? {
            Inbound::Events(events) => {
                if events.contains(&ServerEvent::SetupComplete) {
                    return Ok(());
                }
            }
            Inbound::Closed => {
                return Err(TransportError::Setup(
                    "connection closed before setup completed".to_string(),
                ))
            }
        }
    }
    Err(TransportError::Closed)
}

enum Inbound {
    Events(Vec<ServerEvent>),
    Closed,
}

/// Turn one websocket frame into server events. The service sends JSON in
/// both text and binary frames.
fn inbound_events(message: Message) -> Result<Inbound, TransportError> {
    let text = match &message {
        Message::Text(text) => text.as_str(),
        Message::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len());
                return Ok(Inbound::Events(Vec::new()));
            }
        },
        Message::Close(frame) => return close_outcome(frame.as_ref()),
        _ => return Ok(Inbound::Events(Vec::new())),
    };

    match parse_server_message(text) {
        Ok(events) => Ok(Inbound::Events(events.into_vec())),
        Err(e) => {
            warn!("{}", e);
            Ok(Inbound::Events(Vec::new()))
        }
    }
}

fn close_outcome(frame: Option<&CloseFrame>) -> Result<Inbound, TransportError> {
    match frame {
        Some(frame) if frame.code != CloseCode::Normal && frame.code != CloseCode::Away => {
            Err(TransportError::Remote(format!(
                "closed with {}: {}",
                frame.code,
                frame.reason.as_str()
            )))
        }
        _ => Ok(Inbound::Closed),
    }
}
