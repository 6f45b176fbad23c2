use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A function the remote peer may call during the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sensitivity {
    #[default]
    High,
    Low,
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    pub disabled: bool,
    pub start_sensitivity: Sensitivity,
    pub end_sensitivity: Sensitivity,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            start_sensitivity: Sensitivity::High,
            end_sensitivity: Sensitivity::Low,
            prefix_padding_ms: 100,
            silence_duration_ms: 700,
        }
    }
}

/// Configuration for opening a real-time session with any provider.
#[derive(Debug, Clone, Default)]
pub struct SessionSetup {
    pub instructions: String,
    pub function_declarations: Vec<FunctionDeclaration>,
    /// Ask the peer to transcribe the trainee's speech.
    pub input_transcription: bool,
    /// Ask the peer to transcribe its own speech.
    pub output_transcription: bool,
    pub vad: VadConfig,
}

/// Messages the engine sends to the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// One frame of PCM16 little-endian mono audio at the input rate.
    Audio(Bytes),
    /// A complete text turn from the trainee.
    TextTurn { text: String, turn_complete: bool },
    /// The result of a function call the peer requested.
    FunctionResponse {
        id: String,
        name: String,
        response: Value,
    },
}

/// Events any real-time provider can emit back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    /// A chunk of PCM16 little-endian mono audio at the output rate.
    Audio(Bytes),
    /// A fragment of the transcript of the AI's speech.
    OutputTranscription(String),
    /// A fragment of the transcript of the trainee's speech.
    InputTranscription(String),
    /// The peer detected that the trainee started talking over it.
    Interrupted,
    /// The peer finished generating its turn.
    TurnComplete,
    FunctionCall {
        id: String,
        name: String,
        args: Value,
    },
    /// The peer will close the stream soon.
    GoAway,
    Error(String),
    /// The connection was closed.
    Closed { reason: Option<String> },
}
