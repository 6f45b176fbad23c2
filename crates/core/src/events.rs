//! Typed events for the UI layer.
//!
//! The engine publishes discrete events on a broadcast channel and the
//! current voice state on a watch channel. Subscribers never reach into the
//! engine; a slow subscriber only loses its own backlog.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::Speaker;
use crate::assessment::AssessmentRecord;
use crate::transcript::UtteranceMetrics;
use crate::turn::VoiceSnapshot;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    TurnComplete {
        speaker: Speaker,
        message: String,
        metrics: Option<UtteranceMetrics>,
    },
    /// Streaming transcript text; `is_complete` marks the final version.
    MessageStream {
        speaker: Speaker,
        text: String,
        is_complete: bool,
    },
    /// The shown assessment changed; `None` clears it.
    AssessmentChanged { record: Option<AssessmentRecord> },
    VoiceState { state: VoiceSnapshot },
    /// The microphone went away; the session continues without it.
    CaptureLost { reason: String },
    SessionError { message: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<UiEvent>,
    state: watch::Sender<VoiceSnapshot>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(VoiceSnapshot::default());
        Self { events, state }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: UiEvent) {
        let _ = self.events.send(event);
    }

    /// Publishes the voice state if it changed. Returns whether it did.
    pub fn publish_state(&self, snapshot: VoiceSnapshot) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        if changed {
            self.emit(UiEvent::VoiceState { state: snapshot });
        }
        changed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<VoiceSnapshot> {
        self.state.subscribe()
    }

    pub fn state(&self) -> VoiceSnapshot {
        *self.state.borrow()
    }
}
