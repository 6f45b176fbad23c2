//! In-conversation knowledge checks.
//!
//! An assessment can be requested by the peer through a function call, or
//! locally when a completed utterance contains a trigger phrase. Both paths
//! share one cooldown and one "already active" guard. The channel only
//! tracks the lifecycle of a record; fetching and sending happen in the
//! engine.

use aho_corasick::{AhoCorasick, MatchKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Speaker;
use crate::generic_types::FunctionDeclaration;

pub const TRIGGER_ASSESSMENT_FUNCTION: &str = "trigger_assessment";

const USER_REQUEST_PHRASES: &[&str] = &[
    "quiz me",
    "test me",
    "ask me a question",
    "check my knowledge",
    "check my understanding",
    "give me a question",
];

const AI_INTENT_PHRASES: &[&str] = &[
    "quick knowledge check",
    "let's check your understanding",
    "let me check your understanding",
    "here's a question for you",
    "let me ask you a question",
    "time for a quick quiz",
];

/// Declaration advertised to the peer at session setup.
pub fn trigger_assessment_declaration() -> FunctionDeclaration {
    FunctionDeclaration {
        name: TRIGGER_ASSESSMENT_FUNCTION.to_string(),
        description: "Show the trainee a short multiple-choice knowledge check about the \
                      material covered so far. Call this when a natural pause makes a \
                      check appropriate."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "topic": {
                    "type": "string",
                    "description": "Optional topic the question should focus on."
                }
            }
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentOption {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub id: String,
    pub question: String,
    pub options: Vec<AssessmentOption>,
    pub correct_option_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<u32>,
}

impl AssessmentRecord {
    pub fn option(&self, id: &str) -> Option<&AssessmentOption> {
        self.options.iter().find(|option| option.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    FunctionCall {
        call_id: String,
        topic: Option<String>,
    },
    /// The trainee asked to be quizzed.
    UserRequest,
    /// The AI announced a knowledge check without calling the function.
    AiIntent,
}

impl TriggerSource {
    pub fn topic(&self) -> Option<&str> {
        match self {
            TriggerSource::FunctionCall { topic, .. } => topic.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TriggerRejected {
    #[error("an assessment is already active")]
    AlreadyActive,
    #[error("assessment cooldown has not elapsed")]
    Cooldown,
}

impl TriggerRejected {
    /// Reason reported back to the peer.
    pub fn reason(&self) -> &'static str {
        match self {
            TriggerRejected::AlreadyActive => "already_active",
            TriggerRejected::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("no assessment is being shown")]
    NoActiveAssessment,
    #[error("the selected option does not exist")]
    UnknownOption,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub record: AssessmentRecord,
    pub option_id: String,
    pub is_correct: bool,
    /// The single turn sent to the peer.
    pub statement: String,
}

/// Finds trigger phrases in completed utterances.
#[derive(Debug)]
pub struct KeywordScanner {
    user: Option<AhoCorasick>,
    ai: Option<AhoCorasick>,
}

impl Default for KeywordScanner {
    fn default() -> Self {
        Self::new(USER_REQUEST_PHRASES, AI_INTENT_PHRASES)
    }
}

impl KeywordScanner {
    pub fn new(user_phrases: &[&str], ai_phrases: &[&str]) -> Self {
        Self {
            user: build_matcher(user_phrases),
            ai: build_matcher(ai_phrases),
        }
    }

    pub fn scan(&self, speaker: Speaker, text: &str) -> Option<TriggerSource> {
        let (matcher, source) = match speaker {
            Speaker::User => (self.user.as_ref(), TriggerSource::UserRequest),
            Speaker::Ai => (self.ai.as_ref(), TriggerSource::AiIntent),
        };
        // Transcripts use typographic apostrophes inconsistently.
        let text = text.replace('\u{2019}', "'");
        matcher?.find(text.as_str()).map(|m| {
            debug!(%speaker, phrase_index = m.pattern().as_usize(), "assessment phrase matched");
            source
        })
    }
}

fn build_matcher(phrases: &[&str]) -> Option<AhoCorasick> {
    if phrases.is_empty() {
        return None;
    }
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostFirst)
        .build(phrases)
        .inspect_err(|e| warn!(error = %e, "failed to build assessment phrase matcher"))
        .ok()
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    Fetching(TriggerSource),
    Showing(AssessmentRecord),
}

#[derive(Debug)]
pub struct AssessmentChannel {
    cooldown: Duration,
    last_trigger: Option<Instant>,
    phase: Phase,
    scanner: KeywordScanner,
}

impl AssessmentChannel {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_trigger: None,
            phase: Phase::Idle,
            scanner: KeywordScanner::default(),
        }
    }

    /// Claims the channel for a new assessment.
    pub fn request(&mut self, source: TriggerSource, now: Instant) -> Result<(), TriggerRejected> {
        if self.phase != Phase::Idle {
            return Err(TriggerRejected::AlreadyActive);
        }
        if self
            .last_trigger
            .is_some_and(|at| now.duration_since(at) < self.cooldown)
        {
            return Err(TriggerRejected::Cooldown);
        }
        self.last_trigger = Some(now);
        self.phase = Phase::Fetching(source);
        Ok(())
    }

    /// Releases the channel after a failed fetch. Returns the source that
    /// asked for it.
    pub fn fetch_failed(&mut self) -> Option<TriggerSource> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Fetching(source) => Some(source),
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// Shows a fetched record. Returns the source that asked for it, or
    /// `None` if the request was abandoned in the meantime.
    pub fn show(&mut self, record: AssessmentRecord) -> Option<TriggerSource> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Fetching(source) => {
                self.phase = Phase::Showing(record);
                Some(source)
            }
            other => {
                self.phase = other;
                None
            }
        }
    }

    pub fn active(&self) -> Option<&AssessmentRecord> {
        match &self.phase {
            Phase::Showing(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Answers the shown record and clears it. Cooldown bookkeeping is kept.
    pub fn submit(&mut self, option_id: &str) -> Result<Submission, SubmitError> {
        let record = match &self.phase {
            Phase::Showing(record) => record,
            _ => return Err(SubmitError::NoActiveAssessment),
        };
        let selected = record.option(option_id).ok_or(SubmitError::UnknownOption)?;
        let is_correct = selected.id == record.correct_option_id;
        let statement = compose_answer_statement(record, selected, is_correct);
        let record = record.clone();

        self.phase = Phase::Idle;
        Ok(Submission {
            record,
            option_id: option_id.to_string(),
            is_correct,
            statement,
        })
    }

    pub fn scan(&self, speaker: Speaker, text: &str) -> Option<TriggerSource> {
        if self.is_busy() {
            return None;
        }
        self.scanner.scan(speaker, text)
    }

    pub fn clear(&mut self) {
        self.phase = Phase::Idle;
    }
}

/// The natural-language turn describing an answer to the peer.
pub fn compose_answer_statement(
    record: &AssessmentRecord,
    selected: &AssessmentOption,
    is_correct: bool,
) -> String {
    let mut statement = format!(
        "I answered the knowledge check question \"{}\" by choosing \"{}\". ",
        record.question, selected.text
    );
    if is_correct {
        statement.push_str("That answer is correct.");
    } else {
        match record.option(&record.correct_option_id) {
            Some(correct) => statement.push_str(&format!(
                "That answer is incorrect; the correct answer is \"{}\".",
                correct.text
            )),
            None => statement.push_str("That answer is incorrect."),
        }
    }
    if let Some(explanation) = record.explanation.as_deref().filter(|e| !e.trim().is_empty()) {
        statement.push_str(&format!(" Explanation: {}", explanation.trim()));
    }
    statement.push_str(" Please respond to my answer out loud and then continue the roleplay.");
    statement
}

#[cfg(test)]
pub(crate) fn sample_record() -> AssessmentRecord {
    AssessmentRecord {
        id: "a-1".to_string(),
        question: "What should you do first when a customer is upset?".to_string(),
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
        explanation: Some("Acknowledging feelings de-escalates the conversation.".to_string()),
        time_limit_secs: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn call(id: &str) -> TriggerSource {
        TriggerSource::FunctionCall {
            call_id: id.to_string(),
            topic: None,
        }
    }

    #[test]
    fn test_request_rejected_while_active_until_cleared() {
        let t0 = Instant::now();
        let mut channel = AssessmentChannel::new(ms(10_000));

        channel.request(call("1"), t0).unwrap();
        assert_eq!(
            channel.request(TriggerSource::UserRequest, t0 + ms(20_000)),
            Err(TriggerRejected::AlreadyActive)
        );

        assert_eq!(channel.show(sample_record()), Some(call("1")));
        assert!(channel.active().is_some());
        assert_eq!(
            channel.request(call("2"), t0 + ms(30_000)),
            Err(TriggerRejected::AlreadyActive)
        );

        channel.submit("a").unwrap();
        assert!(channel.active().is_none());
        assert!(channel.request(call("3"), t0 + ms(42_000)).is_ok());
    }

    #[test]
    fn test_cooldown_shared_by_all_sources() {
        let t0 = Instant::now();
        let mut channel = AssessmentChannel::new(ms(10_000));

        channel.request(TriggerSource::UserRequest, t0).unwrap();
        assert_eq!(channel.fetch_failed(), Some(TriggerSource::UserRequest));
        assert!(!channel.is_busy());

        assert_eq!(
            channel.request(call("1"), t0 + ms(5_000)),
            Err(TriggerRejected::Cooldown)
        );
        assert!(channel.request(TriggerSource::AiIntent, t0 + ms(10_000)).is_ok());
    }

    #[test]
    fn test_show_without_request_is_discarded() {
        let mut channel = AssessmentChannel::new(ms(10_000));
        assert!(channel.show(sample_record()).is_none());
        assert!(channel.active().is_none());
    }

    #[test]
    fn test_submit_composes_statement() {
        let t0 = Instant::now();
        let mut channel = AssessmentChannel::new(ms(10_000));
        channel.request(TriggerSource::UserRequest, t0).unwrap();
        channel.show(sample_record());

        assert_eq!(channel.submit("z"), Err(SubmitError::UnknownOption));
        assert!(channel.active().is_some());

        let submission = channel.submit("b").unwrap();
        assert!(!submission.is_correct);
        assert!(submission.statement.contains("\"Offer a discount\""));
        assert!(submission.statement.contains("the correct answer is \"Acknowledge their frustration\""));
        assert!(submission.statement.contains("Explanation: Acknowledging feelings"));

        assert_eq!(
            channel.submit("a"),
            Err(SubmitError::NoActiveAssessment)
        );
    }

    #[test]
    fn test_correct_statement() {
        let record = sample_record();
        let statement = compose_answer_statement(&record, &record.options[0], true);
        assert!(statement.contains("That answer is correct."));
        assert!(!statement.contains("incorrect"));
    }

    #[test]
    fn test_keyword_scan() {
        let channel = AssessmentChannel::new(ms(10_000));
        assert_eq!(
            channel.scan(Speaker::User, "Could you Quiz Me on that?"),
            Some(TriggerSource::UserRequest)
        );
        assert_eq!(
            channel.scan(Speaker::Ai, "Great. Let\u{2019}s check your understanding."),
            Some(TriggerSource::AiIntent)
        );
        // phrases are per speaker
        assert_eq!(channel.scan(Speaker::Ai, "quiz me"), None);
        assert_eq!(channel.scan(Speaker::User, "I'm not sure what you mean"), None);
    }

    #[test]
    fn test_scan_suppressed_while_busy() {
        let t0 = Instant::now();
        let mut channel = AssessmentChannel::new(ms(10_000));
        channel.request(TriggerSource::AiIntent, t0).unwrap();
        assert_eq!(channel.scan(Speaker::User, "quiz me"), None);
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(sample_record()).unwrap();
        assert_eq!(json["correct_option_id"], "a");
        assert!(json.get("time_limit_secs").is_none());
        let parsed: AssessmentRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, sample_record());
    }
}
