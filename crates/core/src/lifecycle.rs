//! Session lifecycle.
//!
//! [`SessionManager`] owns the one live voice session of the process. Its
//! lock is held across setup, so concurrent `start` calls are serialized:
//! a call for the running session id gets the existing handle, a call for a
//! different id waits for the old session to be torn down completely
//! before any new device or connection is opened.

use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::assessment::trigger_assessment_declaration;
use crate::capture::CapturePipeline;
use crate::config::EngineConfig;
use crate::connection::RealtimeConnector;
use crate::device::AudioBackend;
use crate::engine::{Command, Engine, EngineParts};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{EventBus, UiEvent};
use crate::generic_types::{SessionSetup, VadConfig};
use crate::persistence::PersistenceApi;
use crate::turn::VoiceSnapshot;

const CAPTURE_QUEUE: usize = 64;

const OPENER: &str = "The trainee has joined. Begin the roleplay now: greet them in character \
                      and open the conversation.";

const RESUME_INSTRUCTIONS: &str = "This conversation is being resumed after a reconnect. \
                                   Continue from where it left off and do not greet the \
                                   trainee again.";

/// Imperative handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    bus: EventBus,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.bus.subscribe()
    }

    pub fn voice_state(&self) -> VoiceSnapshot {
        self.bus.state()
    }

    pub fn watch_voice_state(&self) -> watch::Receiver<VoiceSnapshot> {
        self.bus.watch_state()
    }

    pub fn toggle_mic(&self) {
        let _ = self.commands.send(Command::ToggleMic);
    }

    pub fn submit_assessment_answer(&self, option_id: impl Into<String>) {
        let _ = self.commands.send(Command::SubmitAnswer(option_id.into()));
    }

    /// Asks the session to tear down. Returns immediately.
    pub fn end_session(&self) {
        let _ = self.commands.send(Command::End);
    }

    pub fn is_live(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Resolves once the session task has stopped, for whatever reason.
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

struct ActiveSession {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

impl ActiveSession {
    async fn shutdown(self) {
        let session_id = self.handle.session_id.clone();
        self.handle.end_session();
        if let Err(e) = self.task.await {
            warn!(%session_id, error = %e, "voice session task failed");
        }
    }
}

pub struct SessionManager {
    connector: Arc<dyn RealtimeConnector>,
    backend: Arc<dyn AudioBackend>,
    persistence: Arc<dyn PersistenceApi>,
    config: EngineConfig,
    instructions: String,
    vad: VadConfig,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        backend: Arc<dyn AudioBackend>,
        persistence: Arc<dyn PersistenceApi>,
        config: EngineConfig,
        instructions: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            backend,
            persistence,
            config,
            instructions: instructions.into(),
            vad: VadConfig::default(),
            active: Mutex::new(None),
        }
    }

    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    /// Starts (or rejoins) the session `session_id`.
    #[instrument(name = "session_start", skip_all, fields(session_id = %session_id, prior_turns_exist = prior_turns_exist))]
    pub async fn start(
        &self,
        session_id: &str,
        prior_turns_exist: bool,
    ) -> VoiceResult<SessionHandle> {
        let mut active = self.active.lock().await;

        if let Some(session) = active.as_ref() {
            if &*session.handle.session_id == session_id && !session.task.is_finished() {
                debug!("reusing live session");
                return Ok(session.handle.clone());
            }
        }
        if let Some(previous) = active.take() {
            info!(previous = %previous.handle.session_id, "tearing down previous session");
            previous.shutdown().await;
        }

        let session = self.open(session_id, prior_turns_exist).await?;
        let handle = session.handle.clone();
        *active = Some(session);
        Ok(handle)
    }

    /// Tears down the live session, if any. Safe to call repeatedly.
    pub async fn end(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            info!(session_id = %previous.handle.session_id, "ending session");
            previous.shutdown().await;
        }
    }

    /// Handle of the live session, if one is running.
    pub async fn current(&self) -> Option<SessionHandle> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|session| !session.task.is_finished())
            .map(|session| session.handle.clone())
    }

    fn session_setup(&self, prior_turns_exist: bool) -> SessionSetup {
        let instructions = if prior_turns_exist {
            format!("{}\n\n{}", self.instructions.trim_end(), RESUME_INSTRUCTIONS)
        } else {
            self.instructions.clone()
        };
        SessionSetup {
            instructions,
            function_declarations: vec![trigger_assessment_declaration()],
            input_transcription: true,
            output_transcription: true,
            vad: self.vad.clone(),
        }
    }

    async fn open(&self, session_id: &str, prior_turns_exist: bool) -> VoiceResult<ActiveSession> {
        // Device opens can block for seconds; keep them off the runtime threads.
        let backend = self.backend.clone();
        let output_rate = self.config.output_sample_rate;
        let mut output = tokio::task::spawn_blocking(move || backend.open_output(output_rate))
            .await
            .map_err(|e| VoiceError::DeviceUnavailable(format!("speaker open task failed: {e}")))??;

        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_QUEUE);
        let mut capture = CapturePipeline::new(
            self.backend.clone(),
            self.config.input_sample_rate,
            self.config.capture_frame_samples,
            capture_tx,
        );
        if let Err(e) = capture.open().await {
            output.close();
            return Err(e);
        }

        let connection = match self.connector.open(self.session_setup(prior_turns_exist)).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "voice service handshake failed");
                capture.close();
                output.close();
                return Err(e);
            }
        };

        let bus = EventBus::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(EngineParts {
            session_id: session_id.to_string(),
            config: self.config.clone(),
            connection,
            output,
            capture,
            capture_rx,
            commands: command_rx,
            persistence: self.persistence.clone(),
            bus: bus.clone(),
            opener: (!prior_turns_exist).then(|| OPENER.to_string()),
        });

        let span = info_span!("voice_session", %session_id);
        let task = tokio::spawn(engine.run().instrument(span));

        Ok(ActiveSession {
            handle: SessionHandle {
                session_id: Arc::from(session_id),
                commands: command_tx,
                bus,
            },
            task,
        })
    }
}
