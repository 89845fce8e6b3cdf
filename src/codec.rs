//! JSON wire format of the live API
//!
//! Outbound messages are built from typed structs so the key names and
//! nesting are fixed at compile time. Inbound text is parsed leniently:
//! anything that does not fit the expected shapes becomes
//! [`InboundEvent::Unrecognized`] instead of an error.

use crate::audio::{AudioChunk, AudioFormat, SampleFormat, REMOTE_SAMPLE_RATE};
use crate::error::SessionError;
use crate::events::{InboundEvent, OutboundMessage, ServerContent, SetupParams};
use base64::engine::general_purpose;
use base64::Engine;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;
use tracing::{debug, warn};

pub const AUDIO_PCM_MIME: &str = "audio/pcm";
pub const IMAGE_JPEG_MIME: &str = "image/jpeg";

/// Error produced while encoding an outbound message
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Json(e) => SessionError::Serialization(e),
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(WireSetup),
    RealtimeInput(RealtimeInput),
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub realtime_input_config: RealtimeInputConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub automatic_activity_detection: AutomaticActivityDetection,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AutomaticActivityDetection {
    pub disabled: bool,
}

/// A chunk of realtime input (audio or video)
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct RealtimeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
}

/// Base64 payload with its MIME type
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl From<&SetupParams> for WireSetup {
    fn from(params: &SetupParams) -> Self {
        Self {
            model: params.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: params
                    .response_modalities
                    .iter()
                    .map(|m| m.as_str().to_string())
                    .collect(),
                speech_config: params.voice_name.as_ref().map(|voice| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: params.system_instruction.clone(),
                }],
            },
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: AutomaticActivityDetection { disabled: false },
            },
        }
    }
}

/// MIME type announcing a PCM chunk, e.g. `audio/pcm;rate=16000`.
pub fn audio_mime_type(format: &AudioFormat) -> String {
    format!("{};rate={}", AUDIO_PCM_MIME, format.sample_rate_hz)
}

/// Serialize one outbound message to its JSON text frame.
pub fn encode(message: &OutboundMessage) -> Result<String, CodecError> {
    let wire = match message {
        OutboundMessage::Setup(params) => ClientMessage::Setup(params.into()),
        OutboundMessage::Audio(chunk) => ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                mime_type: audio_mime_type(&chunk.format()),
                data: general_purpose::STANDARD.encode(chunk.data()),
            }),
            video: None,
        }),
        OutboundMessage::VideoFrame(jpeg) => ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            video: Some(Blob {
                mime_type: IMAGE_JPEG_MIME.to_string(),
                data: general_purpose::STANDARD.encode(jpeg),
            }),
        }),
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Top level of a server message. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEnvelope {
    #[serde(default, deserialize_with = "key_present")]
    setup_complete: bool,
    #[serde(default)]
    server_content: Option<WireServerContent>,
    #[serde(default, deserialize_with = "key_present")]
    go_away: bool,
}

/// Marker keys count when present, whatever their value (even `null`).
fn key_present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    IgnoredAny::deserialize(deserializer).map(|_| true)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServerContent {
    #[serde(default)]
    interrupted: Option<bool>,
    #[serde(default)]
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

/// Parse one text frame from the server. Never fails.
pub fn decode(text: &str) -> InboundEvent {
    let envelope: ServerEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Unrecognized server message: {}", e);
            return InboundEvent::Unrecognized;
        }
    };

    if envelope.setup_complete {
        return InboundEvent::SetupComplete;
    }
    if let Some(content) = envelope.server_content {
        return InboundEvent::ServerContent(server_content(content));
    }
    if envelope.go_away {
        return InboundEvent::GoAway;
    }
    InboundEvent::Unrecognized
}

fn server_content(wire: WireServerContent) -> ServerContent {
    let mut audio_chunks = SmallVec::new();
    let parts = wire.model_turn.map(|turn| turn.parts).unwrap_or_default();

    for inline in parts.into_iter().filter_map(|part| part.inline_data) {
        let Some(rate) = pcm_rate(&inline.mime_type) else {
            continue;
        };
        match general_purpose::STANDARD.decode(inline.data.as_bytes()) {
            Ok(bytes) => {
                let format = AudioFormat::new(rate, 1, SampleFormat::I16);
                audio_chunks.push(AudioChunk::new(bytes, format));
            }
            Err(e) => warn!("Skipping audio part with invalid base64: {}", e),
        }
    }

    ServerContent {
        interrupted: wire.interrupted,
        audio_chunks,
        turn_complete: wire.turn_complete,
    }
}

/// Sample rate of a PCM MIME type, or `None` if the type is not PCM audio.
/// A missing or unparsable `rate=` parameter means the default output rate.
fn pcm_rate(mime_type: &str) -> Option<u32> {
    let mut params = mime_type.split(';').map(str::trim);
    let essence = params.next()?;
    if !essence.starts_with(AUDIO_PCM_MIME) {
        return None;
    }

    let rate = params
        .filter_map(|param| param.strip_prefix("rate="))
        .find_map(|value| value.trim().parse::<u32>().ok())
        .filter(|&rate| rate > 0)
        .unwrap_or(REMOTE_SAMPLE_RATE);
    Some(rate)
}
