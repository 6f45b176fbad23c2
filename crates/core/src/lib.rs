//! Rehearse Core
//!
//! The real-time voice conversation engine behind a roleplay-training session.
//! A session streams trainee microphone audio to a remote conversational AI,
//! plays the AI's synthesized speech back gaplessly, keeps both sides'
//! turn-taking views in sync under interruption, and runs in-conversation
//! knowledge checks through a function-call side channel.
//!
//! Devices, the remote peer and the persistence API are reached through the
//! traits in [`device`], [`connection`] and [`persistence`]; the runnable
//! client wires concrete implementations into a [`lifecycle::SessionManager`].

pub mod assessment;
pub mod audio_utils;
pub mod capture;
pub mod config;
pub mod connection;
pub mod device;
mod engine;
pub mod error;
pub mod events;
pub mod generic_types;
pub mod interruption;
pub mod lifecycle;
pub mod persistence;
pub mod playback;
pub mod timer;
pub mod transcript;
pub mod turn;

#[cfg(test)]
mod testing;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::{VoiceError, VoiceResult};

/// One of the two parties in a roleplay conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The trainee at the microphone.
    User,
    /// The AI roleplay partner.
    Ai,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Ai => write!(f, "ai"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_serialization() {
        assert_eq!(serde_json::to_string(&Speaker::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&Speaker::Ai).unwrap(), "\"ai\"");
        let parsed: Speaker = serde_json::from_str("\"ai\"").unwrap();
        assert_eq!(parsed, Speaker::Ai);
    }

    #[test]
    fn test_speaker_display() {
        assert_eq!(Speaker::User.to_string(), "user");
        assert_eq!(Speaker::Ai.to_string(), "ai");
    }
}
