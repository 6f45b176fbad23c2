//! Gemini Live provider for the rehearse voice engine.
//!
//! [`GeminiConnector`] implements [`rehearse_core::connection::RealtimeConnector`]
//! over the Gemini Live bidirectional WebSocket. The wire types in [`types`]
//! are private to this crate's protocol; the engine only sees the generic
//! client and server events.

pub mod client;
pub mod types;

pub use client::GeminiConnector;
