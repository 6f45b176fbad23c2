//! Error taxonomy for the voice engine.
//!
//! Startup failures (`DeviceUnavailable`, `HandshakeFailed`) bubble up as a
//! single reported failure. Everything else is contained where it happens:
//! dropped sends and failed persistence calls are logged and the
//! conversation carries on.

use thiserror::Error;

/// Result type alias for voice engine operations.
pub type VoiceResult<T> = Result<T, VoiceError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
    /// Microphone or speaker could not be opened, or permission was denied.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The voice service rejected the stream or never confirmed setup.
    #[error("Voice service handshake failed: {0}")]
    HandshakeFailed(String),
    /// A single outbound message could not be queued.
    #[error("Send to voice service failed: {0}")]
    TransientSendFailure(String),
    /// A persistence API call failed.
    #[error("Persistence call failed: {0}")]
    PersistenceFailure(String),
    /// An interruption signal arrived while nothing was playing.
    #[error("Interruption signal received while no audio was playing")]
    SpuriousInterruption,
}

impl VoiceError {
    /// Whether this error aborts `start` for the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::DeviceUnavailable(_) | VoiceError::HandshakeFailed(_)
        )
    }

    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, VoiceError::SpuriousInterruption)
    }

    /// Human-readable advice shown alongside a fatal startup failure.
    pub fn retry_guidance(&self) -> Option<&'static str> {
        if !self.is_retryable() {
            return None;
        }
        match self {
            VoiceError::DeviceUnavailable(_) => Some(
                "Check that a microphone and speaker are connected and that microphone access is allowed, then start the session again.",
            ),
            VoiceError::HandshakeFailed(_) => Some(
                "The voice service could not be reached. Check your network connection and try again in a moment.",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_error_display() {
        let err = VoiceError::DeviceUnavailable("no input device".to_string());
        assert_eq!(format!("{}", err), "Audio device unavailable: no input device");

        let err = VoiceError::HandshakeFailed("timeout".to_string());
        assert_eq!(
            format!("{}", err),
            "Voice service handshake failed: timeout"
        );
    }

    #[test]
    fn test_fatal_errors_carry_guidance() {
        for err in [
            VoiceError::DeviceUnavailable("x".into()),
            VoiceError::HandshakeFailed("x".into()),
        ] {
            assert!(err.is_fatal());
            assert!(err.is_retryable());
            assert!(err.retry_guidance().is_some());
        }
    }

    #[test]
    fn test_contained_errors_are_not_fatal() {
        for err in [
            VoiceError::TransientSendFailure("full".into()),
            VoiceError::PersistenceFailure("500".into()),
            VoiceError::SpuriousInterruption,
        ] {
            assert!(!err.is_fatal());
            assert!(err.retry_guidance().is_none());
        }
        assert!(!VoiceError::SpuriousInterruption.is_retryable());
    }
}
