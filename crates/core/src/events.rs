//! Session event types
//!
//! Every externally observable state change of a session is a [`VoiceEvent`]
//! on the session's broadcast bus. Consumers (transports, analytics) are
//! agnostic of which component produced an event; ordering is guaranteed
//! only relative to the producing component.

use crate::audio::{AudioFrame, SpeechSegment};
use crate::services::RecognizedUtterance;

/// Playback status states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsState {
    /// Reply playback started
    Start,
    /// Reply playback stopped (finished or interrupted)
    Stop,
    /// A sentence began playing
    SentenceStart,
    /// A sentence finished playing
    SentenceEnd,
}

/// A routing directive parsed out of reply text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCommand {
    /// Agent to hand the conversation to
    pub target_agent: String,
    /// User query to forward
    pub user_query: String,
    /// Transition text spoken before the handoff (may be empty)
    pub text: String,
}

/// Events emitted by a voice session
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// A complete speech segment was detected
    SpeechAudio { segment: SpeechSegment },
    /// The current utterance ended (emitted even when the segment was
    /// discarded as too short, so downstream never stalls)
    SpeechEnded,
    /// Recognized user text, already gated by the interrupt controller
    RecognizedText { utterance: RecognizedUtterance },
    /// Playback status change
    TtsStatus { state: TtsState, text: String },
    /// One paced outgoing audio frame
    AudioStream { frame: AudioFrame },
    /// Immediate-stop was triggered by a user interrupt
    InterruptSignal,
    /// User text forwarded for reply generation
    RoutedUserText { utterance: RecognizedUtterance },
    /// A reply sentence ready for synthesis
    SentenceStream { text: String },
    /// A routing directive extracted from reply text
    RouteCommand(RouteCommand),
}
