//! Line-oriented terminal front end.

use rehearse_core::Speaker;
use rehearse_core::assessment::AssessmentRecord;
use rehearse_core::events::UiEvent;
use rehearse_core::transcript::UtteranceMetrics;
use rehearse_core::turn::VoiceSnapshot;

pub const HELP: &str = "Commands: m = mute/unmute microphone, 1-9 = answer the open question, q = end session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ToggleMic,
    Answer(String),
    Quit,
}

/// Parses one stdin line. Digits pick an option of the open assessment by
/// position; anything unrecognized yields `None`.
pub fn parse_command(line: &str, assessment: Option<&AssessmentRecord>) -> Option<Command> {
    match line.trim().to_ascii_lowercase().as_str() {
        "m" | "mute" => Some(Command::ToggleMic),
        "q" | "quit" | "exit" => Some(Command::Quit),
        input => {
            let position: usize = input.parse().ok()?;
            let option = assessment?.options.get(position.checked_sub(1)?)?;
            Some(Command::Answer(option.id.clone()))
        }
    }
}

fn speaker_label(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::User => "you",
        Speaker::Ai => "partner",
    }
}

fn describe_metrics(metrics: &UtteranceMetrics) -> String {
    let mut parts = vec![format!("{} words", metrics.word_count)];
    if let Some(wpm) = metrics.words_per_minute {
        parts.push(format!("{wpm:.0} wpm"));
    }
    if metrics.filler_words > 0 {
        parts.push(format!("{} filler", metrics.filler_words));
    }
    if metrics.interrupted {
        parts.push("interrupted".to_string());
    }
    parts.join(", ")
}

fn describe_state(state: &VoiceSnapshot) -> String {
    if !state.connected {
        return "disconnected".to_string();
    }
    let mic = if !state.capture_available {
        "mic unavailable"
    } else if state.mic_muted {
        "mic muted"
    } else if state.listening {
        "listening"
    } else {
        "mic paused"
    };
    if state.speaking {
        format!("partner speaking, {mic}")
    } else {
        mic.to_string()
    }
}

/// Turns engine events into printable lines and remembers the open
/// question so numbered answers can be resolved.
#[derive(Debug, Default)]
pub struct View {
    assessment: Option<AssessmentRecord>,
}

impl View {
    pub fn assessment(&self) -> Option<&AssessmentRecord> {
        self.assessment.as_ref()
    }

    pub fn render(&mut self, event: &UiEvent) -> Vec<String> {
        match event {
            UiEvent::TurnComplete {
                speaker,
                message,
                metrics,
            } => {
                let mut line = format!("[{}] {}", speaker_label(*speaker), message);
                if let (Speaker::User, Some(metrics)) = (speaker, metrics) {
                    line.push_str(&format!("  ({})", describe_metrics(metrics)));
                }
                vec![line]
            }
            UiEvent::MessageStream {
                speaker,
                text,
                is_complete: false,
            } => vec![format!("  {}: {}...", speaker_label(*speaker), text)],
            // the matching TurnComplete prints the final text
            UiEvent::MessageStream { .. } => Vec::new(),
            UiEvent::AssessmentChanged {
                record: Some(record),
            } => {
                let mut lines = vec![format!("? {}", record.question)];
                for (position, option) in record.options.iter().enumerate() {
                    lines.push(format!("  {}) {}", position + 1, option.text));
                }
                if let Some(limit) = record.time_limit_secs {
                    lines.push(format!("  ({limit}s to answer)"));
                }
                self.assessment = Some(record.clone());
                lines
            }
            UiEvent::AssessmentChanged { record: None } => match self.assessment.take() {
                Some(_) => vec!["(question closed)".to_string()],
                None => Vec::new(),
            },
            UiEvent::VoiceState { state } => vec![format!("-- {}", describe_state(state))],
            UiEvent::CaptureLost { reason } => vec![format!(
                "! microphone lost ({reason}); the partner can still be heard"
            )],
            UiEvent::SessionError { message } => vec![format!("! {message}")],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rehearse_core::assessment::AssessmentOption;

    fn record() -> AssessmentRecord {
        AssessmentRecord {
            id: "q1".to_string(),
            question: "What should you do first?".to_string(),
            options: vec![
                AssessmentOption {
                    id: "a".to_string(),
                    text: "Acknowledge their frustration".to_string(),
                },
                AssessmentOption {
                    id: "b".to_string(),
                    text: "Offer a discount".to_string(),
                },
            ],
            correct_option_id: "a".to_string(),
            explanation: None,
            time_limit_secs: Some(30),
        }
    }

    #[test]
    fn test_parse_command() {
        let record = record();
        assert_eq!(parse_command(" M ", None), Some(Command::ToggleMic));
        assert_eq!(parse_command("q", None), Some(Command::Quit));
        assert_eq!(
            parse_command("2", Some(&record)),
            Some(Command::Answer("b".to_string()))
        );
        assert_eq!(parse_command("2", None), None);
        assert_eq!(parse_command("0", Some(&record)), None);
        assert_eq!(parse_command("3", Some(&record)), None);
        assert_eq!(parse_command("hello", Some(&record)), None);
    }

    #[test]
    fn test_view_tracks_open_question() {
        let mut view = View::default();
        let lines = view.render(&UiEvent::AssessmentChanged {
            record: Some(record()),
        });
        assert_eq!(
            lines,
            vec![
                "? What should you do first?",
                "  1) Acknowledge their frustration",
                "  2) Offer a discount",
                "  (30s to answer)",
            ]
        );
        assert_eq!(view.assessment().map(|r| r.id.as_str()), Some("q1"));

        assert_eq!(
            view.render(&UiEvent::AssessmentChanged { record: None }),
            vec!["(question closed)"]
        );
        assert!(view.assessment().is_none());
        assert!(view.render(&UiEvent::AssessmentChanged { record: None }).is_empty());
    }

    #[test]
    fn test_view_renders_turns_and_state() {
        let mut view = View::default();
        let metrics = UtteranceMetrics {
            word_count: 12,
            duration_ms: 4000,
            words_per_minute: Some(180.0),
            filler_words: 1,
            interrupted: true,
        };
        assert_eq!(
            view.render(&UiEvent::TurnComplete {
                speaker: Speaker::User,
                message: "Um I understand.".to_string(),
                metrics: Some(metrics),
            }),
            vec!["[you] Um I understand.  (12 words, 180 wpm, 1 filler, interrupted)"]
        );
        assert!(
            view.render(&UiEvent::MessageStream {
                speaker: Speaker::Ai,
                text: "Hello".to_string(),
                is_complete: true,
            })
            .is_empty()
        );

        let state = VoiceSnapshot {
            listening: false,
            speaking: true,
            connected: true,
            mic_muted: false,
            capture_available: true,
        };
        assert_eq!(
            view.render(&UiEvent::VoiceState { state }),
            vec!["-- partner speaking, mic paused"]
        );
        assert_eq!(
            view.render(&UiEvent::VoiceState {
                state: VoiceSnapshot::default()
            }),
            vec!["-- disconnected"]
        );
    }
}
