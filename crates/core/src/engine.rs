//! The per-session engine task.
//!
//! All session state lives on one task. Commands from the UI, peer events,
//! microphone frames, finished background work and expired deadlines are
//! handled one at a time from a single `select!` loop, so ordering between
//! them is exactly the order in which they are dequeued.

use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::Speaker;
use crate::assessment::{
    AssessmentChannel, AssessmentRecord, TRIGGER_ASSESSMENT_FUNCTION, TriggerRejected,
    TriggerSource,
};
use crate::audio_utils::silence_pcm16;
use crate::capture::CapturePipeline;
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::device::{CaptureEvent, InputStream, OutputDevice};
use crate::error::VoiceResult;
use crate::events::{EventBus, UiEvent};
use crate::generic_types::{ClientEvent, ServerEvent};
use crate::interruption::{InterruptionDecision, InterruptionManager};
use crate::persistence::{
    AssessmentAnswerPayload, ContextTurn, GenerateAssessmentRequest, PersistenceApi, TurnPayload,
};
use crate::playback::PlaybackScheduler;
use crate::timer::Timers;
use crate::transcript::{CompletedUtterance, TranscriptAccumulator};
use crate::turn::{TurnEvent, TurnMachine, TurnState};

const LOG_EVERY: u64 = 50;

/// Requests from a [`crate::lifecycle::SessionHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    ToggleMic,
    SubmitAnswer(String),
    End,
}

/// Results of work the engine spawned off its own task.
enum Internal {
    AssessmentFetched(VoiceResult<AssessmentRecord>),
    CaptureReopened(VoiceResult<Box<dyn InputStream>>),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum EngineTimer {
    PlaybackTick { generation: u64 },
    Settle { generation: u64 },
    SendAnswer,
    ResumeCapture,
    ReplyWatchdog,
}

/// Everything a session needs, already opened.
pub(crate) struct EngineParts {
    pub session_id: String,
    pub config: EngineConfig,
    pub connection: Connection,
    pub output: Box<dyn OutputDevice>,
    pub capture: CapturePipeline,
    pub capture_rx: mpsc::Receiver<CaptureEvent>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub persistence: Arc<dyn PersistenceApi>,
    pub bus: EventBus,
    /// Text turn sent right after connecting, for sessions with no history.
    pub opener: Option<String>,
}

pub(crate) struct Engine {
    session_id: Arc<str>,
    config: EngineConfig,
    conn: Connection,
    output: Box<dyn OutputDevice>,
    capture: CapturePipeline,
    capture_rx: mpsc::Receiver<CaptureEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    persistence: Arc<dyn PersistenceApi>,
    bus: EventBus,
    opener: Option<String>,

    turn: TurnMachine,
    playback: PlaybackScheduler,
    transcripts: TranscriptAccumulator,
    interruptions: InterruptionManager,
    assessments: AssessmentChannel,
    timers: Timers<EngineTimer>,
    history: VecDeque<ContextTurn>,
    pending_answer: Option<String>,
    ai_speaking_since: Option<Instant>,
    audio_chunks: u64,
    frames_sent: u64,
}

impl Engine {
    pub(crate) fn new(parts: EngineParts) -> Self {
        let config = parts.config;
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            session_id: Arc::from(parts.session_id),
            playback: PlaybackScheduler::new(
                config.output_sample_rate,
                config.playback_lookahead,
                config.stop_fade,
                config.interruption_fade,
            ),
            transcripts: TranscriptAccumulator::new(config.transcript_quiet_period),
            interruptions: InterruptionManager::new(&config),
            assessments: AssessmentChannel::new(config.assessment_cooldown),
            conn: parts.connection,
            output: parts.output,
            capture: parts.capture,
            capture_rx: parts.capture_rx,
            commands: parts.commands,
            internal_tx,
            internal_rx,
            persistence: parts.persistence,
            bus: parts.bus,
            opener: parts.opener,
            turn: TurnMachine::new(),
            timers: Timers::new(),
            history: VecDeque::with_capacity(config.history_len),
            pending_answer: None,
            ai_speaking_since: None,
            audio_chunks: 0,
            frames_sent: 0,
            config,
        }
    }

    pub(crate) async fn run(mut self) {
        self.transition(TurnEvent::Connected);
        self.publish_state();
        if let Some(opener) = self.opener.take() {
            self.send(ClientEvent::TextTurn {
                text: opener,
                turn_complete: true,
            });
        }
        info!("voice session live");

        loop {
            let deadline = earliest(self.timers.next_deadline(), self.transcripts.next_deadline());
            let wake = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::End) | None => {
                        info!("session end requested");
                        break;
                    }
                    Some(command) => self.on_command(command),
                },
                event = self.conn.recv() => match event {
                    Some(event) => {
                        if !self.on_server_event(event) {
                            break;
                        }
                    }
                    None => {
                        warn!("voice transport stopped unexpectedly");
                        self.bus.emit(UiEvent::SessionError {
                            message: "The connection to the voice service was lost.".to_string(),
                        });
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                Some(event) = self.capture_rx.recv() => self.on_capture(event),
                _ = wake => self.on_deadline(),
            }

            self.publish_state();
        }

        self.shutdown().await;
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::ToggleMic => {
                let muted = self.turn.toggle_user_mute();
                info!(muted, "microphone toggled");
            }
            Command::SubmitAnswer(option_id) => self.submit_answer(option_id),
            Command::End => {}
        }
    }

    /// Returns false when the session cannot continue.
    fn on_server_event(&mut self, event: ServerEvent) -> bool {
        let now = Instant::now();
        match event {
            ServerEvent::SetupComplete => debug!("duplicate setup confirmation"),
            ServerEvent::Audio(chunk) => self.on_audio(chunk),
            ServerEvent::OutputTranscription(fragment) => {
                self.on_fragment(Speaker::Ai, &fragment, now)
            }
            ServerEvent::InputTranscription(fragment) => {
                self.on_fragment(Speaker::User, &fragment, now)
            }
            ServerEvent::Interrupted => self.on_interrupted(now),
            ServerEvent::TurnComplete => debug!("peer turn complete"),
            ServerEvent::FunctionCall { id, name, args } => self.on_function_call(id, name, args),
            ServerEvent::GoAway => warn!("voice service announced it will close the stream"),
            ServerEvent::Error(message) => {
                warn!(%message, "voice service reported an error");
                self.bus.emit(UiEvent::SessionError { message });
            }
            ServerEvent::Closed { reason } => {
                info!(?reason, "voice service closed the stream");
                if let Some(reason) = reason {
                    self.bus.emit(UiEvent::SessionError {
                        message: format!("The voice service closed the session: {}", reason),
                    });
                }
                return false;
            }
        }
        true
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::AssessmentFetched(result) => self.on_assessment_fetched(result),
            Internal::CaptureReopened(result) => {
                if let Err(e) = self.capture.finish_reattach(result) {
                    self.on_capture_lost(e.to_string());
                }
            }
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        for utterance in self.transcripts.poll(now) {
            self.on_utterance(utterance);
        }
        for timer in self.timers.take_expired(now) {
            self.on_timer(timer, now);
        }
    }

    fn on_timer(&mut self, timer: EngineTimer, now: Instant) {
        match timer {
            EngineTimer::PlaybackTick { generation } => {
                if generation == self.playback.generation() {
                    self.pump_playback();
                } else {
                    trace!(generation, "stale playback tick");
                }
            }
            EngineTimer::Settle { generation } => {
                if generation != self.playback.generation()
                    || self.playback.is_active(self.output.current_time())
                {
                    return;
                }
                if self.turn.state() == TurnState::AiSpeaking {
                    self.transition(TurnEvent::PlaybackSettled);
                    self.ai_speaking_since = None;
                }
            }
            EngineTimer::SendAnswer => self.send_pending_answer(now),
            EngineTimer::ResumeCapture => {
                if self.assessment_on_screen() {
                    return;
                }
                if let Some(open) = self.capture.begin_reattach() {
                    let tx = self.internal_tx.clone();
                    tokio::task::spawn_blocking(move || {
                        let _ = tx.send(Internal::CaptureReopened(open()));
                    });
                }
            }
            EngineTimer::ReplyWatchdog => {
                if self.turn.state() == TurnState::AiSpeaking
                    && !self.playback.is_active(self.output.current_time())
                {
                    warn!("no spoken reply after assessment answer; returning to listening");
                    self.transition(TurnEvent::ReplyTimedOut);
                    self.ai_speaking_since = None;
                }
            }
        }
    }

    fn on_audio(&mut self, chunk: Bytes) {
        self.audio_chunks += 1;
        if self.audio_chunks % LOG_EVERY == 0 {
            info!(chunks = self.audio_chunks, "received AI audio");
        }
        self.playback.enqueue(chunk);
        self.pump_playback();
    }

    fn pump_playback(&mut self) {
        let report = match self.playback.pump(self.output.as_mut()) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "output device rejected audio; dropping playback");
                self.playback.stop_all(false, self.output.as_mut());
                self.timers.cancel_where(|t| {
                    matches!(t, EngineTimer::PlaybackTick { .. } | EngineTimer::Settle { .. })
                });
                if self.turn.state() == TurnState::AiSpeaking {
                    self.transition(TurnEvent::PlaybackSettled);
                }
                self.ai_speaking_since = None;
                return;
            }
        };

        let now = Instant::now();
        let generation = self.playback.generation();
        if report.scheduled > 0 {
            self.timers.cancel_where(|t| {
                matches!(t, EngineTimer::Settle { .. } | EngineTimer::ReplyWatchdog)
            });
            match self.turn.state() {
                TurnState::Listening => {
                    self.ai_speaking_since = Some(now);
                    self.transition(TurnEvent::AiAudioStarted);
                }
                TurnState::AiSpeaking => {
                    self.ai_speaking_since.get_or_insert(now);
                }
                // Audio still plays while an assessment is shown; the state stays put.
                _ => {}
            }
        }
        if report.active {
            self.timers.arm_if_idle(
                EngineTimer::PlaybackTick { generation },
                now + self.config.playback_tick,
            );
        }
        if report.drained {
            self.timers
                .arm(EngineTimer::Settle { generation }, now + self.config.settle_delay);
        }
    }

    fn on_fragment(&mut self, speaker: Speaker, fragment: &str, now: Instant) {
        let text = self.transcripts.on_fragment(speaker, fragment, now);
        self.bus.emit(UiEvent::MessageStream {
            speaker,
            text,
            is_complete: false,
        });
    }

    fn on_interrupted(&mut self, now: Instant) {
        let playing = self.playback.is_active(self.output.current_time());
        match self.interruptions.on_peer_signal(now, playing) {
            InterruptionDecision::BargeIn => self.barge_in(),
            InterruptionDecision::Resync => {
                debug!("sending silence frame to resynchronize turn-taking");
                let frame = silence_pcm16(self.config.silence_frame_samples());
                self.send(ClientEvent::Audio(frame));
            }
            InterruptionDecision::Ignored => {}
        }
    }

    fn barge_in(&mut self) {
        let report = self.playback.stop_all(true, self.output.as_mut());
        self.timers.cancel_where(|t| {
            matches!(t, EngineTimer::PlaybackTick { .. } | EngineTimer::Settle { .. })
        });
        info!(
            dropped_chunks = report.dropped_chunks,
            generation = report.generation,
            "trainee barged in; AI playback stopped"
        );
        if let Some(utterance) = self.transcripts.flush(Speaker::Ai, true) {
            self.on_utterance(utterance);
        }
        if matches!(self.turn.state(), TurnState::AiSpeaking | TurnState::Listening) {
            self.transition(TurnEvent::Interrupted);
        }
        self.ai_speaking_since = None;
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame(frame) => {
                if self.turn.state() == TurnState::AiSpeaking
                    && self.playback.is_active(self.output.current_time())
                    && self.interruptions.observe_frame(&frame, Instant::now(), self.ai_speaking_since)
                        == InterruptionDecision::BargeIn
                {
                    info!("local energy detector flagged a barge-in");
                    self.barge_in();
                }

                let Some(bytes) = self.capture.process(&frame, self.turn.mic_open()) else {
                    return;
                };
                match self.conn.send(ClientEvent::Audio(bytes)) {
                    Ok(()) => {
                        self.frames_sent += 1;
                        if self.frames_sent % LOG_EVERY == 0 {
                            info!(frames = self.frames_sent, "sent microphone audio");
                        }
                    }
                    Err(e) => debug!(error = %e, "dropped microphone frame"),
                }
            }
            CaptureEvent::Lost(reason) => self.on_capture_lost(reason),
        }
    }

    fn on_capture_lost(&mut self, reason: String) {
        self.capture.on_lost(reason.clone());
        self.turn.set_capture_available(false);
        self.bus.emit(UiEvent::CaptureLost { reason });
    }

    fn on_utterance(&mut self, utterance: CompletedUtterance) {
        let trigger = self.assessments.scan(utterance.speaker, &utterance.text);
        self.record_utterance(utterance);
        if let Some(source) = trigger {
            info!(?source, "assessment phrase detected");
            self.trigger_assessment(source);
        }
    }

    /// Publishes, remembers and persists a completed utterance.
    fn record_utterance(&mut self, utterance: CompletedUtterance) {
        let CompletedUtterance {
            speaker,
            text,
            metrics,
        } = utterance;
        debug!(%speaker, words = metrics.word_count, interrupted = metrics.interrupted, "utterance complete");

        self.bus.emit(UiEvent::MessageStream {
            speaker,
            text: text.clone(),
            is_complete: true,
        });
        self.bus.emit(UiEvent::TurnComplete {
            speaker,
            message: text.clone(),
            metrics: Some(metrics.clone()),
        });

        if self.history.len() == self.config.history_len {
            self.history.pop_front();
        }
        self.history.push_back(ContextTurn {
            speaker,
            message: text.clone(),
        });

        let api = self.persistence.clone();
        let session_id = self.session_id.clone();
        let payload = TurnPayload {
            speaker,
            message: text,
            metrics: Some(metrics),
            spoken_at: chrono::Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = api.save_turn(&session_id, &payload).await {
                warn!(error = %e, %speaker, "failed to save turn");
            }
        });
    }

    fn on_function_call(&mut self, id: String, name: String, args: Value) {
        if name != TRIGGER_ASSESSMENT_FUNCTION {
            warn!(%name, "peer called an unknown function");
            self.send(ClientEvent::FunctionResponse {
                id,
                name,
                response: json!({ "status": "error", "message": "unknown function" }),
            });
            return;
        }
        let topic = args
            .get("topic")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.trigger_assessment(TriggerSource::FunctionCall { call_id: id, topic });
    }

    fn trigger_assessment(&mut self, source: TriggerSource) {
        // An answer still waiting to go out counts as the active assessment.
        let claimed = if self.pending_answer.is_some() {
            Err(TriggerRejected::AlreadyActive)
        } else {
            self.assessments.request(source.clone(), Instant::now())
        };
        if let Err(rejected) = claimed {
            info!(reason = rejected.reason(), "assessment trigger rejected");
            self.acknowledge(
                &source,
                json!({ "status": "rejected", "reason": rejected.reason() }),
            );
            return;
        }

        let api = self.persistence.clone();
        let session_id = self.session_id.clone();
        let tx = self.internal_tx.clone();
        let request = GenerateAssessmentRequest {
            context: self.history.iter().cloned().collect(),
            topic: source.topic().map(str::to_string),
        };
        tokio::spawn(async move {
            let result = match api.fetch_assessment(&session_id).await {
                Ok(Some(record)) => Ok(record),
                Ok(None) => api.generate_assessment(&session_id, &request).await,
                Err(e) => {
                    warn!(error = %e, "fetching assessment failed; generating one instead");
                    api.generate_assessment(&session_id, &request).await
                }
            };
            let _ = tx.send(Internal::AssessmentFetched(result));
        });
    }

    fn on_assessment_fetched(&mut self, result: VoiceResult<AssessmentRecord>) {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "could not obtain an assessment");
                if let Some(source) = self.assessments.fetch_failed() {
                    self.acknowledge(
                        &source,
                        json!({ "status": "error", "message": e.to_string() }),
                    );
                }
                return;
            }
        };

        let Some(source) = self.assessments.show(record.clone()) else {
            debug!("discarding assessment for an abandoned request");
            return;
        };
        info!(assessment_id = %record.id, "showing assessment");
        self.timers.cancel(&EngineTimer::ResumeCapture);
        self.capture.detach();
        self.transition(TurnEvent::AssessmentShown);
        self.ai_speaking_since = None;
        self.acknowledge(
            &source,
            json!({ "status": "shown", "question": record.question }),
        );
        self.bus.emit(UiEvent::AssessmentChanged {
            record: Some(record),
        });
    }

    fn acknowledge(&mut self, source: &TriggerSource, response: Value) {
        if let TriggerSource::FunctionCall { call_id, .. } = source {
            self.send(ClientEvent::FunctionResponse {
                id: call_id.clone(),
                name: TRIGGER_ASSESSMENT_FUNCTION.to_string(),
                response,
            });
        }
    }

    fn submit_answer(&mut self, option_id: String) {
        let now = Instant::now();
        let submission = match self.assessments.submit(&option_id) {
            Ok(submission) => submission,
            Err(e) => {
                warn!(error = %e, %option_id, "ignoring assessment answer");
                return;
            }
        };
        info!(
            assessment_id = %submission.record.id,
            is_correct = submission.is_correct,
            "assessment answered"
        );
        self.interruptions.note_submission(now);
        self.bus.emit(UiEvent::AssessmentChanged { record: None });

        let api = self.persistence.clone();
        let session_id = self.session_id.clone();
        let answer = AssessmentAnswerPayload {
            assessment_id: submission.record.id.clone(),
            option_id: submission.option_id.clone(),
            is_correct: submission.is_correct,
            answered_at: chrono::Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = api.save_assessment_answer(&session_id, &answer).await {
                warn!(error = %e, "failed to save assessment answer");
            }
        });

        // The peer only waits for a spoken reply to a turn sent without live audio.
        self.capture.detach();
        self.pending_answer = Some(submission.statement);
        self.timers
            .arm(EngineTimer::SendAnswer, now + self.config.submission_settle);
    }

    fn send_pending_answer(&mut self, now: Instant) {
        let Some(text) = self.pending_answer.take() else {
            return;
        };
        self.send(ClientEvent::TextTurn {
            text,
            turn_complete: true,
        });
        if self.assessments.active().is_some() {
            return;
        }
        self.timers.cancel_where(|t| matches!(t, EngineTimer::Settle { .. }));
        self.transition(TurnEvent::AnswerSubmitted);
        self.ai_speaking_since = Some(now);
        self.timers
            .arm(EngineTimer::ResumeCapture, now + self.config.capture_resume_delay);
        self.timers
            .arm(EngineTimer::ReplyWatchdog, now + self.config.reply_timeout);
    }

    fn assessment_on_screen(&self) -> bool {
        self.assessments.active().is_some() || self.turn.state() == TurnState::AssessmentActive
    }

    fn send(&self, event: ClientEvent) {
        if !self.conn.is_open() {
            debug!("voice service stream already closed; dropping message");
            return;
        }
        if let Err(e) = self.conn.send(event) {
            warn!(error = %e, "dropped message to voice service");
        }
    }

    fn transition(&mut self, event: TurnEvent) {
        let from = self.turn.state();
        match self.turn.apply(event) {
            Ok(to) if to != from => debug!(%from, %to, ?event, "turn state changed"),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "ignored turn event"),
        }
    }

    fn publish_state(&self) {
        self.bus.publish_state(self.turn.snapshot());
    }

    async fn shutdown(&mut self) {
        self.playback.stop_all(false, self.output.as_mut());
        for utterance in self.transcripts.flush_all() {
            self.record_utterance(utterance);
        }
        self.timers.clear();
        self.pending_answer = None;
        if self.assessments.active().is_some() {
            self.bus.emit(UiEvent::AssessmentChanged { record: None });
        }
        self.assessments.clear();

        self.capture.close();
        self.output.close();
        self.conn.close().await;

        self.transition(TurnEvent::Disconnected);
        self.publish_state();
        let capture = self.capture.stats();
        info!(
            audio_chunks = self.audio_chunks,
            frames_sent = self.frames_sent,
            frames_dropped = capture.dropped,
            "voice session closed"
        );
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
