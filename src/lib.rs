//! livetutor - realtime voice conversation with a Gemini Live tutor
//!
//! Microphone audio is captured, encoded as 16-bit PCM and streamed over a
//! websocket; synthesized speech comes back in chunks and is scheduled for
//! gapless playback, with barge-in when the user talks over the model.

#![forbid(unsafe_code)]

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod gemini;
pub mod mixer;
pub mod pcm;
pub mod playback;
#[cfg(feature = "pulse")]
pub mod pulse;
pub mod session;
pub mod transcript;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{GeminiConfig, SessionConfig, StartTrigger};
pub use error::SessionError;
pub use session::{Command, ConnectionState, SessionController, SessionHandle};
pub use transport::GeminiConnector;
