//! WebSocket connector for the Gemini Live API.
//!
//! `open` performs the whole handshake (connect, send setup, wait for
//! `setupComplete`) before handing back a [`Connection`]. After that a single
//! transport task pumps engine events out and server frames in until either
//! side goes away.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rehearse_core::connection::{Connection, RealtimeConnector};
use rehearse_core::error::{VoiceError, VoiceResult};
use rehearse_core::generic_types::{ClientEvent, ServerEvent, SessionSetup};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, warn};

use crate::types::{
    AudioTranscriptionConfig, BidiGenerateContentSetup, ClientMessage, Content,
    GenerationConfig, PrebuiltVoiceConfig, RealtimeInputConfig, ResponseModality, ServerMessage,
    SpeechConfig, Tool, VoiceConfig,
};

pub const GEMINI_LIVE_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct GeminiConnector {
    api_key: String,
    endpoint: String,
    model: String,
    voice: Option<String>,
    handshake_timeout: Duration,
}

impl GeminiConnector {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: GEMINI_LIVE_WS_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.model = if model.starts_with("models/") {
            model
        } else {
            format!("models/{model}")
        };
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Builds the first message of the stream from the generic setup.
    pub fn setup_message(&self, setup: &SessionSetup) -> ClientMessage {
        let tools = if setup.function_declarations.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: setup.function_declarations.clone(),
            }]
        };
        ClientMessage::Setup(BidiGenerateContentSetup {
            model: self.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: self.voice.as_ref().map(|voice| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: (!setup.instructions.is_empty())
                .then(|| Content::text(None, setup.instructions.clone())),
            tools,
            input_audio_transcription: setup
                .input_transcription
                .then(AudioTranscriptionConfig::default),
            output_audio_transcription: setup
                .output_transcription
                .then(AudioTranscriptionConfig::default),
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: (&setup.vad).into(),
            },
        })
    }
}

#[async_trait]
impl RealtimeConnector for GeminiConnector {
    async fn open(&self, setup: SessionSetup) -> VoiceResult<Connection> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        info!(model = %self.model, "Connecting to Gemini Live");

        let (mut ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| VoiceError::HandshakeFailed(format!("connect failed: {e}")))?;

        let payload = serde_json::to_string(&self.setup_message(&setup))
            .map_err(|e| VoiceError::HandshakeFailed(format!("setup encoding failed: {e}")))?;
        ws_stream
            .send(WsMessage::Text(payload.into()))
            .await
            .map_err(|e| VoiceError::HandshakeFailed(format!("setup send failed: {e}")))?;

        match tokio::time::timeout(self.handshake_timeout, await_setup_complete(&mut ws_stream))
            .await
        {
            Ok(Ok(())) => info!("Gemini Live setup complete. Ready to stream."),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoiceError::HandshakeFailed(format!(
                    "setupComplete not received within {:?}",
                    self.handshake_timeout
                )));
            }
        }

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(run_transport(ws_stream, out_rx, in_tx));
        Ok(Connection::new(out_tx, in_rx, Some(task)))
    }
}

/// JSON payload of a frame. Gemini sends JSON in binary frames as well as
/// text frames.
fn frame_text(msg: &WsMessage) -> Option<&str> {
    match msg {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

fn close_reason(msg: &WsMessage) -> Option<String> {
    match msg {
        WsMessage::Close(Some(frame)) => Some(format!(
            "{} {}",
            u16::from(frame.code),
            frame.reason.as_str()
        )),
        _ => None,
    }
}

async fn await_setup_complete<S>(ws: &mut WebSocketStream<S>) -> VoiceResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = ws.next().await {
        let msg = frame.map_err(|e| {
            VoiceError::HandshakeFailed(format!("websocket error before setup completed: {e}"))
        })?;
        if msg.is_close() {
            let reason = close_reason(&msg).unwrap_or_else(|| "no reason".to_string());
            return Err(VoiceError::HandshakeFailed(format!(
                "closed before setup completed: {reason}"
            )));
        }
        let Some(text) = frame_text(&msg) else {
            debug!("Ignoring non-JSON frame during setup");
            continue;
        };
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(server_msg) => {
                if server_msg.setup_complete.is_some() {
                    return Ok(());
                }
                if let Some(error) = server_msg.error {
                    return Err(VoiceError::HandshakeFailed(error.message));
                }
                debug!("Ignoring message received before setupComplete");
            }
            Err(e) => warn!(error = %e, "Unparseable frame during Gemini setup"),
        }
    }
    Err(VoiceError::HandshakeFailed(
        "stream ended before setup completed".to_string(),
    ))
}

/// Pumps events both ways until the engine drops its sender, the server
/// closes, or the socket fails. Always finishes with `ServerEvent::Closed`.
async fn run_transport<S>(
    ws_stream: WebSocketStream<S>,
    mut outbound: mpsc::Receiver<ClientEvent>,
    inbound: mpsc::Sender<ServerEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut gemini_tx, mut gemini_rx) = ws_stream.split();
    let mut audio_frames: u64 = 0;

    let reason = loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else {
                    let _ = gemini_tx.send(WsMessage::Close(None)).await;
                    break None;
                };
                if matches!(event, ClientEvent::Audio(_)) {
                    audio_frames += 1;
                    if audio_frames % 50 == 0 {
                        debug!(frames = audio_frames, "Streaming microphone audio to Gemini");
                    }
                }
                let payload = match serde_json::to_string(&ClientMessage::from(event)) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable client event");
                        continue;
                    }
                };
                if let Err(e) = gemini_tx.send(WsMessage::Text(payload.into())).await {
                    break Some(format!("send failed: {e}"));
                }
            }
            frame = gemini_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("stream ended".to_string()),
                };
                if msg.is_close() {
                    break close_reason(&msg);
                }
                let Some(text) = frame_text(&msg) else {
                    continue;
                };
                match serde_json::from_str::<ServerMessage>(text) {
                    Ok(server_msg) => {
                        for event in server_msg.into_events() {
                            if inbound.send(event).await.is_err() {
                                debug!("Engine stopped listening; ending Gemini transport");
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Unparseable frame from Gemini"),
                }
            }
        }
    };

    info!(reason = ?reason, "Gemini Live connection closed");
    let _ = inbound.send(ServerEvent::Closed { reason }).await;
}
