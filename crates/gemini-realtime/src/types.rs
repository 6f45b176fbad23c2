//! Gemini Live wire messages.

use base64::Engine;
use bytes::Bytes;
use rehearse_core::generic_types::{
    ClientEvent, FunctionDeclaration, Sensitivity, ServerEvent, VadConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(BidiGenerateContentRealtimeInput),
    ClientContent(BidiGenerateContentClientContent),
    ToolResponse(BidiGenerateContentToolResponse),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
    pub realtime_input_config: RealtimeInputConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Presence alone switches transcription on.
#[derive(Debug, Default, Serialize)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub automatic_activity_detection: AutomaticActivityDetection,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticActivityDetection {
    pub disabled: bool,
    pub start_of_speech_sensitivity: StartSensitivity,
    pub end_of_speech_sensitivity: EndSensitivity,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl From<&VadConfig> for AutomaticActivityDetection {
    fn from(vad: &VadConfig) -> Self {
        Self {
            disabled: vad.disabled,
            start_of_speech_sensitivity: match vad.start_sensitivity {
                Sensitivity::High => StartSensitivity::High,
                Sensitivity::Low => StartSensitivity::Low,
            },
            end_of_speech_sensitivity: match vad.end_sensitivity {
                Sensitivity::High => EndSensitivity::High,
                Sensitivity::Low => EndSensitivity::Low,
            },
            prefix_padding_ms: vad.prefix_padding_ms,
            silence_duration_ms: vad.silence_duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub enum StartSensitivity {
    #[serde(rename = "START_SENSITIVITY_HIGH")]
    High,
    #[serde(rename = "START_SENSITIVITY_LOW")]
    Low,
}

#[derive(Debug, Serialize)]
pub enum EndSensitivity {
    #[serde(rename = "END_SENSITIVITY_HIGH")]
    High,
    #[serde(rename = "END_SENSITIVITY_LOW")]
    Low,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part { text: text.into() }],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentRealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl From<ClientEvent> for ClientMessage {
    fn from(event: ClientEvent) -> Self {
        match event {
            ClientEvent::Audio(pcm) => ClientMessage::RealtimeInput(BidiGenerateContentRealtimeInput {
                audio: Blob {
                    mime_type: INPUT_AUDIO_MIME.to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(&pcm),
                },
            }),
            ClientEvent::TextTurn {
                text,
                turn_complete,
            } => ClientMessage::ClientContent(BidiGenerateContentClientContent {
                turns: vec![Content::text(Some("user"), text)],
                turn_complete,
            }),
            ClientEvent::FunctionResponse { id, name, response } => {
                ClientMessage::ToolResponse(BidiGenerateContentToolResponse {
                    function_responses: vec![FunctionResponse { id, name, response }],
                })
            }
        }
    }
}

// --- Server side ---

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<LiveServerContent>,
    #[serde(default)]
    pub tool_call: Option<LiveToolCall>,
    #[serde(default)]
    pub go_away: Option<Value>,
    #[serde(default)]
    pub error: Option<ServerError>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct LiveServerContent {
    #[serde(default)]
    pub model_turn: Option<ServerContentTurn>,
    #[serde(default)]
    pub input_transcription: Option<ServerTranscription>,
    #[serde(default)]
    pub output_transcription: Option<ServerTranscription>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
}

#[derive(Deserialize, Debug)]
pub struct ServerContentTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<ServerBlob>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerBlob {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Deserialize, Debug)]
pub struct ServerTranscription {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LiveToolCall {
    #[serde(default)]
    pub function_calls: Vec<LiveFunctionCall>,
}

#[derive(Deserialize, Debug)]
pub struct LiveFunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

#[derive(Deserialize, Debug)]
pub struct ServerError {
    #[serde(default)]
    pub message: String,
}

impl ServerMessage {
    /// Flattens one frame into engine events. A frame can carry several at
    /// once, e.g. audio together with a transcription fragment.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(transcription) = content.input_transcription {
                if !transcription.text.is_empty() {
                    events.push(ServerEvent::InputTranscription(transcription.text));
                }
            }
            if let Some(transcription) = content.output_transcription {
                if !transcription.text.is_empty() {
                    events.push(ServerEvent::OutputTranscription(transcription.text));
                }
            }
            if let Some(model_turn) = content.model_turn {
                for part in model_turn.parts {
                    if let Some(blob) = part.inline_data {
                        match base64::engine::general_purpose::STANDARD.decode(&blob.data) {
                            Ok(pcm) => events.push(ServerEvent::Audio(Bytes::from(pcm))),
                            Err(e) => warn!(
                                error = %e,
                                mime_type = ?blob.mime_type,
                                "Dropping undecodable audio part"
                            ),
                        }
                    } else if let Some(text) = part.text {
                        // Audio sessions report speech through outputTranscription.
                        debug!(len = text.len(), "Ignoring text part of model turn");
                    }
                }
            }
            if content.interrupted == Some(true) {
                events.push(ServerEvent::Interrupted);
            }
            if content.turn_complete == Some(true) {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(tool_call) = self.tool_call {
            for call in tool_call.function_calls {
                events.push(ServerEvent::FunctionCall {
                    id: call.id.unwrap_or_default(),
                    name: call.name,
                    args: call.args.unwrap_or(Value::Object(Default::default())),
                });
            }
        }

        if self.go_away.is_some() {
            events.push(ServerEvent::GoAway);
        }

        if let Some(error) = self.error {
            events.push(ServerEvent::Error(error.message));
        }

        events
    }
}
