//! Interruption handling.
//!
//! Decides what an interruption signal means for both sides' view of whose
//! turn it is. A signal while AI audio is playing is a barge-in. A signal
//! while nothing is playing is spurious; the peer may still be waiting on
//! input, so it gets a short silence frame to resynchronize instead of being
//! ignored outright.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::audio_utils::rms;
use crate::config::{EngineConfig, LocalDetectorConfig};
use crate::error::VoiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionDecision {
    /// Stop playback and hand the floor to the trainee.
    BargeIn,
    /// Nothing is playing; send a silence frame to the peer.
    Resync,
    Ignored,
}

/// Local barge-in detection from microphone energy.
#[derive(Debug)]
pub struct EnergyDetector {
    config: LocalDetectorConfig,
    over_threshold: u32,
    last_trigger: Option<Instant>,
}

impl EnergyDetector {
    pub fn new(config: LocalDetectorConfig) -> Self {
        Self {
            config,
            over_threshold: 0,
            last_trigger: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Feeds one raw microphone frame. Returns true when the trainee appears
    /// to be talking over the AI.
    pub fn observe(
        &mut self,
        frame: &[f32],
        now: Instant,
        ai_speaking_since: Option<Instant>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Some(since) = ai_speaking_since else {
            self.over_threshold = 0;
            return false;
        };
        if rms(frame) < self.config.rms_threshold {
            self.over_threshold = 0;
            return false;
        }
        self.over_threshold += 1;

        if self.over_threshold < self.config.consecutive_frames
            || now.duration_since(since) < self.config.min_ai_speaking
        {
            return false;
        }
        if let Some(last) = self.last_trigger {
            if now.duration_since(last) < self.config.cooldown {
                return false;
            }
        }
        self.over_threshold = 0;
        self.last_trigger = Some(now);
        true
    }
}

#[derive(Debug)]
pub struct InterruptionManager {
    post_submission_quiet: Duration,
    resync_cooldown: Duration,
    last_submission: Option<Instant>,
    last_resync: Option<Instant>,
    detector: EnergyDetector,
}

impl InterruptionManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            post_submission_quiet: config.post_submission_quiet,
            resync_cooldown: config.resync_cooldown,
            last_submission: None,
            last_resync: None,
            detector: EnergyDetector::new(config.local_detector.clone()),
        }
    }

    /// Opens the post-submission window.
    pub fn note_submission(&mut self, now: Instant) {
        self.last_submission = Some(now);
    }

    pub fn in_post_submission_window(&self, now: Instant) -> bool {
        self.last_submission
            .is_some_and(|at| now.duration_since(at) < self.post_submission_quiet)
    }

    /// Classifies an interruption signal from the peer. `playing` is whether
    /// any AI audio is still scheduled or queued.
    pub fn on_peer_signal(&mut self, now: Instant, playing: bool) -> InterruptionDecision {
        if playing {
            if self.in_post_submission_window(now) {
                debug!("interruption suppressed inside post-submission window");
                return InterruptionDecision::Ignored;
            }
            return InterruptionDecision::BargeIn;
        }

        debug!(error = %VoiceError::SpuriousInterruption, "resolving spurious interruption");
        if self
            .last_resync
            .is_some_and(|at| now.duration_since(at) < self.resync_cooldown)
        {
            return InterruptionDecision::Ignored;
        }
        self.last_resync = Some(now);
        InterruptionDecision::Resync
    }

    /// Runs the local detector over a raw microphone frame.
    pub fn observe_frame(
        &mut self,
        frame: &[f32],
        now: Instant,
        ai_speaking_since: Option<Instant>,
    ) -> InterruptionDecision {
        if !self.detector.observe(frame, now, ai_speaking_since) {
            return InterruptionDecision::Ignored;
        }
        if self.in_post_submission_window(now) {
            return InterruptionDecision::Ignored;
        }
        InterruptionDecision::BargeIn
    }
}
