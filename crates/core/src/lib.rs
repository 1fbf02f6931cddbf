//! Core traits and types for the voice pipeline
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame and speech segment types
//! - Error types
//! - Session event types
//! - Collaborator traits (synthesis, recognition, intent classification)

pub mod audio;
pub mod error;
pub mod events;
pub mod services;

pub use audio::{AudioFrame, Channels, SampleRate, SpeechSegment};
pub use error::{Error, Result};
pub use events::{RouteCommand, TtsState, VoiceEvent};
pub use services::{
    ClassifyContext, IntentClassifier, IntentDecision, IntentLabel, RecognizedUtterance,
    Recognizer, Synthesizer,
};
