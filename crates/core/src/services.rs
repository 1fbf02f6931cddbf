//! Collaborator traits
//!
//! The external speech engines are injected into each session rather than
//! reached through process-global state: constructors take
//! `Arc<dyn Synthesizer>` etc., so tests swap in mocks and production wires
//! whatever transport it has.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Recognized user speech as returned by the recognizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizedUtterance {
    /// Transcribed text
    pub text: String,
    /// Overall confidence (0.0 - 1.0)
    pub confidence: f32,
    /// Optional per-character confidences
    #[serde(default)]
    pub char_confidences: Vec<f32>,
    /// Optional emotion tag from the recognizer
    #[serde(default)]
    pub emotion: Option<String>,
    /// Opaque reference to the source audio
    #[serde(default)]
    pub audio_ref: Option<String>,
}

impl RecognizedUtterance {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            char_confidences: Vec::new(),
            emotion: None,
            audio_ref: None,
        }
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.emotion = Some(emotion.into());
        self
    }

    pub fn with_audio_ref(mut self, audio_ref: impl Into<String>) -> Self {
        self.audio_ref = Some(audio_ref.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Intent classification labels for speech arriving during playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentLabel {
    /// Stop the reply and answer now
    Interrupt,
    /// Drop the utterance (backchannel, noise)
    Ignore,
    /// Hold the utterance until the reply finishes
    Wait,
}

/// Classifier verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDecision {
    pub label: IntentLabel,
    /// Confidence score (0.0 - 1.0)
    pub score: f32,
}

/// Conversational context handed to the classifier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifyContext {
    /// Last full user utterance
    pub last_user_text: String,
    /// Reply text spoken so far in the current turn
    pub reply_so_far: String,
    /// The sentence currently audible
    pub current_sentence: String,
}

/// Text-to-speech engine producing an Ogg-encapsulated Opus byte stream
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize one sentence. Bytes arrive on the returned channel in
    /// stream order; the channel closing marks end of stream.
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        emotion: Option<&str>,
    ) -> Result<mpsc::Receiver<Vec<u8>>>;
}

/// Speech-to-text engine
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Recognize a complete utterance from wav bytes
    async fn recognize(&self, wav: &[u8]) -> Result<RecognizedUtterance>;
}

/// Intent classifier deciding how user speech interacts with playback
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str, context: &ClassifyContext) -> Result<IntentDecision>;
}
