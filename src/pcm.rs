//! PCM codec
//!
//! Converts between floating point samples and 16-bit little-endian PCM, and
//! wraps the PCM bytes in base64 for the JSON transport.

use crate::error::DecodeError;
use base64::engine::general_purpose;
use base64::Engine;
use std::sync::Arc;

/// Microphone capture rate expected by the Live API.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Rate of synthesized speech coming back from the Live API.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per capture tick.
pub const FRAME_LEN: usize = 4096;

/// One capture tick of mono float samples in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A frame of digital silence.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square loudness of the frame.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// MIME type announcing this frame's format to the remote service.
    pub fn mime_type(&self) -> String {
        pcm_mime_type(self.sample_rate)
    }
}

/// Decoded audio ready to hand to an output device.
///
/// Samples are interleaved when `channels > 1`. The buffer keeps the rate the
/// audio was produced at; resampling is the device's business.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl PlayableBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Arc::from(samples.into_boxed_slice()),
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Mono value of frame `index`, averaging channels.
    pub fn frame_value(&self, index: usize) -> f32 {
        let channels = self.channels as usize;
        let start = index * channels;
        match self.samples.get(start..start + channels) {
            Some(frame) => frame.iter().sum::<f32>() / channels as f32,
            None => 0.0,
        }
    }
}

/// `audio/pcm;rate=N`
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Encode float samples as 16-bit little-endian PCM.
///
/// Out-of-range input is clamped, never wrapped.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    out
}

fn quantize(sample: f32) -> i16 {
    // NaN maps to silence
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Decode 16-bit little-endian PCM into a playable buffer at `sample_rate`.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<PlayableBuffer, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect();
    Ok(PlayableBuffer::new(samples, sample_rate, channels))
}

/// Encode samples straight to the base64 text used on the wire.
pub fn encode_base64(samples: &[f32]) -> String {
    general_purpose::STANDARD.encode(encode(samples))
}

/// Decode a base64 PCM payload as received from the remote service.
pub fn decode_base64(data: &str, sample_rate: u32, channels: u16) -> Result<PlayableBuffer, DecodeError> {
    let bytes = general_purpose::STANDARD
        .decode(data)
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    decode(&bytes, sample_rate, channels)
}

/// Root-mean-square of a block of samples. Empty input is silent.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
