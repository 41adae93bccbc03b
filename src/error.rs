//! Error taxonomy for the voice session.
//!
//! Per-chunk faults (`DecodeError`, `ProtocolError`) are recoverable and only
//! ever logged. Device and transport failures are fatal for the session and
//! drive the controller into its `Error` state.

use tokio_tungstenite::tungstenite::Error as WsError;

/// A malformed inbound audio chunk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("PCM payload has odd length ({0} bytes)")]
    OddLength(usize),

    #[error("invalid base64 audio payload: {0}")]
    Base64(String),
}

/// Microphone or output device could not be acquired or has gone away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("microphone unavailable: {0}")]
    Microphone(String),

    #[error("output device unavailable: {0}")]
    Output(String),

    #[error("device closed")]
    Closed,
}

/// Failure of the streaming channel to the remote service.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not ready")]
    NotReady,

    #[error("connection closed")]
    Closed,

    /// The outbound queue is full because the socket is not keeping up.
    #[error("outbound queue full")]
    Congested,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timeout waiting for session setup")]
    Timeout,

    #[error("session setup failed: {0}")]
    Setup(String),

    #[error("remote error: {0}")]
    Remote(String),
}

/// An inbound message whose shape we do not understand.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unexpected server message: {0}")]
pub struct ProtocolError(pub String);

/// Configuration problems detected at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,
}

/// Anything that can end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    DeviceAcquisition(#[from] DeviceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    /// Whether this error should tear the session down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceAcquisition(_) | Self::Transport(_))
    }
}
