//! Engine tuning.
//!
//! Every timing constant the engine depends on lives in [`EngineConfig`].
//! Defaults are tuned for conversational use; a handful can be overridden
//! from the environment with `REHEARSE_*` variables.

use std::time::Duration;

use crate::audio_utils::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Local energy-based barge-in detection.
///
/// Off by default: it fires on background noise and speaker bleed far too
/// often, and the peer's own interruption signal is authoritative.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalDetectorConfig {
    pub enabled: bool,
    /// RMS level (0.0 - 1.0) a frame must reach to count as speech.
    pub rms_threshold: f32,
    /// Consecutive over-threshold frames required to trigger.
    pub consecutive_frames: u32,
    /// The AI must have been speaking at least this long.
    pub min_ai_speaking: Duration,
    /// Minimum gap between two triggers.
    pub cooldown: Duration,
}

impl Default for LocalDetectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rms_threshold: 0.04,
            consecutive_frames: 6,
            min_ai_speaking: Duration::from_millis(800),
            cooldown: Duration::from_millis(2000),
        }
    }
}

/// Holds all timing and sizing parameters of a voice session.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Microphone audio sent to the peer (PCM16 mono).
    pub input_sample_rate: u32,
    /// AI speech received from the peer (PCM16 mono).
    pub output_sample_rate: u32,
    /// Samples per captured frame; each frame is forwarded on its own.
    pub capture_frame_samples: usize,
    /// Quiet period after which a speaker's utterance is complete.
    pub transcript_quiet_period: Duration,
    /// How far ahead of the device clock audio may be scheduled.
    pub playback_lookahead: Duration,
    /// Period of the scheduling loop while audio is pending or playing.
    pub playback_tick: Duration,
    /// Delay between the playback queue draining and returning to listening.
    pub settle_delay: Duration,
    /// Fade applied when playback is stopped for teardown.
    pub stop_fade: Duration,
    /// Fade applied when the trainee barges in.
    pub interruption_fade: Duration,
    /// Minimum gap between two assessment triggers.
    pub assessment_cooldown: Duration,
    /// Window after an answer submission during which interruption signals
    /// are never treated as barge-in.
    pub post_submission_quiet: Duration,
    /// Minimum gap between two resync silence frames.
    pub resync_cooldown: Duration,
    /// Length of the silence frame sent to resync the peer's turn-taking.
    pub silence_frame: Duration,
    /// Delay between disconnecting capture and sending the answer turn.
    pub submission_settle: Duration,
    /// Delay between sending the answer turn and reconnecting capture.
    pub capture_resume_delay: Duration,
    /// How long to wait for the AI's spoken reply after an answer.
    pub reply_timeout: Duration,
    /// Completed turns kept as context for assessment generation.
    pub history_len: usize,
    pub local_detector: LocalDetectorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            capture_frame_samples: 512,
            transcript_quiet_period: Duration::from_millis(1500),
            playback_lookahead: Duration::from_millis(600),
            playback_tick: Duration::from_millis(50),
            settle_delay: Duration::from_millis(300),
            stop_fade: Duration::from_millis(80),
            interruption_fade: Duration::from_millis(15),
            assessment_cooldown: Duration::from_secs(10),
            post_submission_quiet: Duration::from_secs(4),
            resync_cooldown: Duration::from_millis(1000),
            silence_frame: Duration::from_millis(100),
            submission_settle: Duration::from_millis(200),
            capture_resume_delay: Duration::from_millis(600),
            reply_timeout: Duration::from_secs(8),
            history_len: 12,
            local_detector: LocalDetectorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads the defaults and applies any `REHEARSE_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.transcript_quiet_period =
            env_millis("REHEARSE_TRANSCRIPT_QUIET_MS", config.transcript_quiet_period)?;
        config.playback_lookahead =
            env_millis("REHEARSE_PLAYBACK_LOOKAHEAD_MS", config.playback_lookahead)?;
        config.assessment_cooldown =
            env_millis("REHEARSE_ASSESSMENT_COOLDOWN_MS", config.assessment_cooldown)?;
        config.post_submission_quiet = env_millis(
            "REHEARSE_POST_SUBMISSION_QUIET_MS",
            config.post_submission_quiet,
        )?;

        if let Ok(value) = std::env::var("REHEARSE_LOCAL_INTERRUPTION") {
            config.local_detector.enabled = parse_bool(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "REHEARSE_LOCAL_INTERRUPTION".to_string(),
                    format!("'{}' is not a boolean", value),
                )
            })?;
        }

        Ok(config)
    }

    /// Number of samples in the resync silence frame.
    pub fn silence_frame_samples(&self) -> usize {
        (self.silence_frame.as_secs_f64() * self.input_sample_rate as f64).round() as usize
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
