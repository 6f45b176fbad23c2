//! Per-speaker transcript debouncing.
//!
//! The peer streams transcripts as small fragments. Fragments for one speaker
//! accumulate until that speaker has been quiet for the configured period,
//! then the buffer is emitted as one completed utterance.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::Speaker;
use crate::timer::Timers;
use serde::{Deserialize, Serialize};

const FILLER_WORDS: &[&str] = &["um", "uh", "erm", "er", "hmm", "uhm"];

/// Delivery statistics of one utterance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UtteranceMetrics {
    pub word_count: usize,
    pub duration_ms: u64,
    /// Absent for utterances shorter than a second.
    pub words_per_minute: Option<f64>,
    pub filler_words: usize,
    pub interrupted: bool,
}

impl UtteranceMetrics {
    pub fn compute(text: &str, duration: Duration, interrupted: bool) -> Self {
        let words: Vec<&str> = text.split_whitespace().collect();
        let filler_words = words
            .iter()
            .map(|word| {
                word.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|word| FILLER_WORDS.contains(&word.as_str()))
            .count();
        let words_per_minute = if duration >= Duration::from_secs(1) {
            Some(words.len() as f64 * 60.0 / duration.as_secs_f64())
        } else {
            None
        };
        Self {
            word_count: words.len(),
            duration_ms: duration.as_millis() as u64,
            words_per_minute,
            filler_words,
            interrupted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedUtterance {
    pub speaker: Speaker,
    pub text: String,
    pub metrics: UtteranceMetrics,
}

#[derive(Debug)]
struct UtteranceBuffer {
    text: String,
    started_at: Instant,
    last_fragment_at: Instant,
}

#[derive(Debug)]
pub struct TranscriptAccumulator {
    quiet_period: Duration,
    buffers: HashMap<Speaker, UtteranceBuffer>,
    timers: Timers<Speaker>,
}

impl TranscriptAccumulator {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            buffers: HashMap::new(),
            timers: Timers::new(),
        }
    }

    /// Appends a fragment and restarts the speaker's quiet timer. Returns the
    /// accumulated text so far, for streaming display.
    pub fn on_fragment(&mut self, speaker: Speaker, fragment: &str, now: Instant) -> String {
        let buffer = self.buffers.entry(speaker).or_insert_with(|| UtteranceBuffer {
            text: String::new(),
            started_at: now,
            last_fragment_at: now,
        });
        buffer.text.push_str(fragment);
        buffer.last_fragment_at = now;
        self.timers.arm(speaker, now + self.quiet_period);
        normalize(&buffer.text)
    }

    /// Completes every utterance whose quiet period has passed.
    pub fn poll(&mut self, now: Instant) -> Vec<CompletedUtterance> {
        self.timers
            .take_expired(now)
            .into_iter()
            .filter_map(|speaker| self.complete(speaker, false))
            .collect()
    }

    /// Completes `speaker`'s utterance immediately.
    pub fn flush(&mut self, speaker: Speaker, interrupted: bool) -> Option<CompletedUtterance> {
        self.timers.cancel(&speaker);
        self.complete(speaker, interrupted)
    }

    pub fn flush_all(&mut self) -> Vec<CompletedUtterance> {
        [Speaker::User, Speaker::Ai]
            .into_iter()
            .filter_map(|speaker| self.flush(speaker, false))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn pending(&self, speaker: Speaker) -> Option<String> {
        self.buffers.get(&speaker).map(|buffer| normalize(&buffer.text))
    }

    fn complete(&mut self, speaker: Speaker, interrupted: bool) -> Option<CompletedUtterance> {
        let buffer = self.buffers.remove(&speaker)?;
        let text = normalize(&buffer.text);
        if text.is_empty() {
            return None;
        }
        let duration = buffer.last_fragment_at.duration_since(buffer.started_at);
        let metrics = UtteranceMetrics::compute(&text, duration, interrupted);
        Some(CompletedUtterance {
            speaker,
            text,
            metrics,
        })
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const QUIET: Duration = Duration::from_millis(1500);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_fragments_within_quiet_period_form_one_utterance() {
        let t0 = Instant::now();
        let mut acc = TranscriptAccumulator::new(QUIET);

        assert_eq!(acc.on_fragment(Speaker::Ai, "Hel", t0), "Hel");
        assert_eq!(acc.on_fragment(Speaker::Ai, "lo the", t0 + ms(400)), "Hello the");
        assert_eq!(acc.on_fragment(Speaker::Ai, "re", t0 + ms(900)), "Hello there");

        // quiet timer restarted by the last fragment
        assert!(acc.poll(t0 + ms(1500)).is_empty());
        assert_eq!(acc.next_deadline(), Some(t0 + ms(2400)));

        let done = acc.poll(t0 + ms(2400));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].speaker, Speaker::Ai);
        assert_eq!(done[0].text, "Hello there");
        assert!(!done[0].metrics.interrupted);
        assert!(acc.pending(Speaker::Ai).is_none());
    }

    #[test]
    fn test_gap_longer_than_quiet_period_splits_utterances() {
        let t0 = Instant::now();
        let mut acc = TranscriptAccumulator::new(QUIET);

        acc.on_fragment(Speaker::Ai, "Hel", t0);
        let first = acc.poll(t0 + ms(1600));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].text, "Hel");

        acc.on_fragment(Speaker::Ai, "lo the", t0 + ms(1700));
        acc.on_fragment(Speaker::Ai, "re", t0 + ms(1800));
        let second = acc.poll(t0 + ms(3300));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].text, "lo there");
    }

    #[test]
    fn test_speakers_are_independent() {
        let t0 = Instant::now();
        let mut acc = TranscriptAccumulator::new(QUIET);

        acc.on_fragment(Speaker::User, "I think", t0);
        acc.on_fragment(Speaker::Ai, "Go on", t0 + ms(1000));

        let done = acc.poll(t0 + ms(1500));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].speaker, Speaker::User);
        assert_eq!(acc.pending(Speaker::Ai).as_deref(), Some("Go on"));
    }

    #[test]
    fn test_flush_marks_interrupted_and_cancels_timer() {
        let t0 = Instant::now();
        let mut acc = TranscriptAccumulator::new(QUIET);

        acc.on_fragment(Speaker::Ai, "Let me tell you about ", t0);
        let flushed = acc.flush(Speaker::Ai, true).unwrap();
        assert_eq!(flushed.text, "Let me tell you about");
        assert!(flushed.metrics.interrupted);
        assert!(acc.next_deadline().is_none());
        assert!(acc.poll(t0 + ms(5000)).is_empty());
        assert!(acc.flush(Speaker::Ai, true).is_none());
    }

    #[test]
    fn test_whitespace_only_buffer_is_not_emitted() {
        let t0 = Instant::now();
        let mut acc = TranscriptAccumulator::new(QUIET);
        acc.on_fragment(Speaker::User, "  ", t0);
        assert!(acc.poll(t0 + QUIET).is_empty());
    }

    #[test]
    fn test_metrics() {
        let metrics = UtteranceMetrics::compute("Um, I think, uh, we should", ms(3000), false);
        assert_eq!(metrics.word_count, 6);
        assert_eq!(metrics.filler_words, 2);
        assert_eq!(metrics.duration_ms, 3000);
        assert_abs_diff_eq!(metrics.words_per_minute.unwrap(), 120.0, epsilon = 1e-9);

        let short = UtteranceMetrics::compute("Yes", ms(200), false);
        assert!(short.words_per_minute.is_none());
    }
}
