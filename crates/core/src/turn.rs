//! Turn-taking state machine.
//!
//! The single authoritative record of who may speak. Every other component
//! reports what happened as a [`TurnEvent`]; only [`TurnMachine::apply`]
//! changes the state.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    Listening,
    AiSpeaking,
    AssessmentActive,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::AiSpeaking => "ai_speaking",
            TurnState::AssessmentActive => "assessment_active",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// The peer confirmed setup.
    Connected,
    /// AI audio was scheduled on the output device.
    AiAudioStarted,
    /// The playback queue drained and the settle delay passed.
    PlaybackSettled,
    /// A genuine barge-in stopped AI playback.
    Interrupted,
    AssessmentShown,
    AnswerSubmitted,
    /// No AI reply arrived after an answer was sent.
    ReplyTimedOut,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid turn transition: {event:?} in state {state}")]
pub struct InvalidTransition {
    pub state: TurnState,
    pub event: TurnEvent,
}

/// Read-only view handed to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoiceSnapshot {
    pub listening: bool,
    pub speaking: bool,
    pub connected: bool,
    pub mic_muted: bool,
    /// False after the microphone was lost mid-session.
    pub capture_available: bool,
}

#[derive(Debug, Clone)]
pub struct TurnMachine {
    state: TurnState,
    user_muted: bool,
    capture_available: bool,
}

impl Default for TurnMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnMachine {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            user_muted: false,
            capture_available: true,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Applies `event`, returning the new state. Invalid events leave the
    /// state untouched.
    pub fn apply(&mut self, event: TurnEvent) -> Result<TurnState, InvalidTransition> {
        use TurnEvent::*;
        use TurnState::*;

        let next = match (self.state, event) {
            (_, Disconnected) => Idle,
            (Idle, Connected) => Listening,
            (Listening | AiSpeaking, AiAudioStarted) => AiSpeaking,
            (AiSpeaking, PlaybackSettled | Interrupted | ReplyTimedOut) => Listening,
            // Barge-in can race the settle delay; the trainee already holds the floor.
            (Listening, Interrupted) => Listening,
            (Listening | AiSpeaking, AssessmentShown) => AssessmentActive,
            (AssessmentActive, AnswerSubmitted) => AiSpeaking,
            (state, event) => return Err(InvalidTransition { state, event }),
        };
        self.state = next;
        Ok(next)
    }

    /// Flips the trainee's own mute. Returns the new mute flag.
    pub fn toggle_user_mute(&mut self) -> bool {
        self.user_muted = !self.user_muted;
        self.user_muted
    }

    pub fn set_capture_available(&mut self, available: bool) {
        self.capture_available = available;
    }

    /// Microphone audio may reach the peer only while listening.
    pub fn mic_open(&self) -> bool {
        self.state == TurnState::Listening && !self.user_muted && self.capture_available
    }

    pub fn snapshot(&self) -> VoiceSnapshot {
        VoiceSnapshot {
            listening: self.mic_open(),
            speaking: self.state == TurnState::AiSpeaking,
            connected: self.state != TurnState::Idle,
            mic_muted: !self.mic_open(),
            capture_available: self.capture_available,
        }
    }
}
