//! Gemini Live API wire messages
//!
//! Client messages serialize to the `{"setup": ...}` / `{"realtimeInput": ...}`
//! / `{"clientContent": ...}` envelopes the websocket endpoint expects. Server
//! messages are classified into [`ServerEvent`]s; shapes we do not recognise
//! are reported as a [`ProtocolError`] and ignored by callers.

use crate::config::GeminiConfig;
use crate::error::ProtocolError;
use crate::pcm::{encode_base64, pcm_mime_type};
use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::warn;

/// Generation configuration for setup.
#[derive(Debug, Serialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Empty marker object enabling a transcription stream.
#[derive(Debug, Serialize, Default, Clone, PartialEq)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// Session setup message.
#[derive(Debug, Serialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

/// Turn-based text content.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// Inline media payload.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input.
#[derive(Debug, Serialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Setup message for an audio-only conversation.
    pub fn setup(config: &GeminiConfig) -> Self {
        let transcription = config.transcribe.then(AudioTranscriptionConfig::default);
        ClientMessage::Setup(Setup {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: config.voice_name.as_ref().map(|voice_name| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.clone(),
                        },
                    },
                }),
            }),
            system_instruction: config.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part { text: text.clone() }],
            }),
            input_audio_transcription: transcription.clone(),
            output_audio_transcription: transcription,
        })
    }

    /// Realtime audio input from float samples captured at `sample_rate`.
    pub fn audio(samples: &[f32], sample_rate: u32) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                data: encode_base64(samples),
                mime_type: pcm_mime_type(sample_rate),
            }),
            text: None,
        })
    }

    /// A complete user text turn.
    pub fn text_turn(text: &str) -> Self {
        ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: text.to_string(),
                }],
            }],
            turn_complete: true,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Setup(_) => "setup",
            ClientMessage::ClientContent(_) => "clientContent",
            ClientMessage::RealtimeInput(_) => "realtimeInput",
        }
    }
}

/// Something the server told us.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// Base64 PCM of synthesized speech.
    Audio {
        data: String,
        sample_rate: Option<u32>,
    },
    /// The user barged in; drop whatever is still queued for playback.
    Interrupted,
    InputTranscription(String),
    OutputTranscription(String),
    TurnComplete,
    /// Server will disconnect soon
    GoAway { time_left: Option<String> },
}

pub type ServerEvents = SmallVec<[ServerEvent; 4]>;

/// Top-level keys that are valid but carry nothing we act on.
const IGNORED_KEYS: &[&str] = &[
    "usageMetadata",
    "sessionResumptionUpdate",
    "toolCall",
    "toolCallCancellation",
];

/// Parse `rate=N` out of an `audio/pcm;rate=N` MIME type.
pub fn pcm_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Classify one text frame from the server.
pub fn parse_server_message(text: &str) -> Result<ServerEvents, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError(format!("invalid JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| ProtocolError("message is not a JSON object".to_string()))?;

    let mut events = ServerEvents::new();
    let mut recognised = false;

    if object.contains_key("setupComplete") {
        recognised = true;
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = object.get("serverContent") {
        recognised = true;
        server_content_events(content, &mut events);
    }

    if let Some(go_away) = object.get("goAway") {
        recognised = true;
        events.push(ServerEvent::GoAway {
            time_left: go_away
                .get("timeLeft")
                .and_then(|t| t.as_str())
                .map(str::to_string),
        });
    }

    if !recognised && !object.keys().any(|k| IGNORED_KEYS.contains(&k.as_str())) {
        let keys: Vec<&str> = object.keys().map(String::as_str).collect();
        return Err(ProtocolError(format!("unrecognised keys {:?}", keys)));
    }

    Ok(events)
}

/// Events carried by a `serverContent` payload, in the order they must be
/// applied: transcriptions, audio, then interruption and turn completion.
fn server_content_events(content: &Value, events: &mut ServerEvents) {
    if let Some(text) = transcription_text(content, "inputTranscription") {
        events.push(ServerEvent::InputTranscription(text));
    }
    if let Some(text) = transcription_text(content, "outputTranscription") {
        events.push(ServerEvent::OutputTranscription(text));
    }

    if let Some(model_turn) = content.get("modelTurn") {
        match model_turn.get("parts").and_then(|p| p.as_array()) {
            Some(parts) => {
                for part in parts {
                    let Some(inline_data) = part.get("inlineData") else {
                        continue;
                    };
                    let mime_type = inline_data.get("mimeType").and_then(|m| m.as_str());
                    if let Some(mime) = mime_type {
                        if !mime.starts_with("audio/pcm") {
                            warn!("Ignoring inline data of type {}", mime);
                            continue;
                        }
                    }
                    match inline_data.get("data").and_then(|d| d.as_str()) {
                        Some(data) if !data.is_empty() => events.push(ServerEvent::Audio {
                            data: data.to_string(),
                            sample_rate: mime_type.and_then(pcm_rate_from_mime),
                        }),
                        Some(_) => {}
                        None => warn!("Received inline data without data field"),
                    }
                }
            }
            None => warn!("Received model turn without parts array"),
        }
    }

    if flag(content, "interrupted") {
        events.push(ServerEvent::Interrupted);
    }
    if flag(content, "turnComplete") {
        events.push(ServerEvent::TurnComplete);
    }
}

fn transcription_text(content: &Value, key: &str) -> Option<String> {
    content
        .get(key)?
        .get("text")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn flag(content: &Value, key: &str) -> bool {
    content.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}
