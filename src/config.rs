//! Session configuration

use crate::error::ConfigError;
use crate::pcm::{FRAME_LEN, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use std::time::Duration;

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const TUTOR_INSTRUCTION: &str = "You are Alex, a professional and energetic English language teacher.
Your goal is to conduct an interactive speaking lesson with the user.

You must ALWAYS SPEAK FIRST immediately after the connection is established.
Do not wait for the user to say something.
Start by introducing yourself enthusiastically and asking the user a simple question (e.g., \"Hi! I'm Alex. What is your name?\").

Rules for interaction:
1. Always ask a follow-up question after the user answers.
2. If the user makes a mistake, gently correct them.
3. Keep your responses concise (1-3 sentences).";

/// Configuration for the Live API connection
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub url: String,
    pub model: String,
    pub voice_name: Option<String>,
    pub system_instruction: Option<String>,
    /// Ask the service for input and output transcriptions.
    pub transcribe: bool,
    pub setup_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: Some("Puck".to_string()),
            system_instruction: Some(TUTOR_INSTRUCTION.to_string()),
            transcribe: true,
            setup_timeout: Duration::from_secs(10),
        }
    }
}

impl GeminiConfig {
    /// Default configuration pointed at the public endpoint with `api_key`.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_ENDPOINT, api_key),
            ..Default::default()
        }
    }
}

/// What to send right after the channel opens so the agent speaks first.
///
/// The service gives no guarantee either mechanism works on its own, so both
/// are optional and the default sends both.
#[derive(Debug, Clone, PartialEq)]
pub struct StartTrigger {
    pub text: Option<String>,
    pub silence: Option<Duration>,
}

impl Default for StartTrigger {
    fn default() -> Self {
        Self {
            text: Some("Hello teacher, please introduce yourself and start the lesson.".to_string()),
            silence: Some(Duration::from_secs(1)),
        }
    }
}

impl StartTrigger {
    /// Send nothing; wait for the user to speak.
    pub fn disabled() -> Self {
        Self {
            text: None,
            silence: None,
        }
    }

    /// Number of silent samples to send at `sample_rate`.
    pub fn silence_samples(&self, sample_rate: u32) -> Option<usize> {
        self.silence
            .map(|d| (d.as_secs_f64() * sample_rate as f64).round() as usize)
            .filter(|n| *n > 0)
    }
}

/// Configuration for the whole voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_len: usize,
    /// Capture source name; `None` uses the default microphone.
    pub input_device: Option<String>,
    pub start_trigger: StartTrigger,
    pub gemini: GeminiConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            frame_len: FRAME_LEN,
            input_device: None,
            start_trigger: StartTrigger::default(),
            gemini: GeminiConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Build from `GEMINI_API_KEY` and the optional `LIVETUTOR_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("GEMINI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let mut gemini = GeminiConfig::from_api_key(api_key.trim());
        if let Some(model) = lookup("LIVETUTOR_MODEL") {
            gemini.model = if model.starts_with("models/") {
                model
            } else {
                format!("models/{}", model)
            };
        }
        if let Some(voice) = lookup("LIVETUTOR_VOICE") {
            gemini.voice_name = Some(voice);
        }

        Ok(Self {
            input_device: lookup("LIVETUTOR_INPUT_DEVICE"),
            gemini,
            ..Default::default()
        })
    }
}
