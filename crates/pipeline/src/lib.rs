//! Session-level voice pipeline
//!
//! The pieces of one conversational voice session:
//! - [`SpeechSegmenter`]: live Opus packets in, complete speech segments out
//! - [`BargeInController`]: gates recognized text against active playback
//! - [`AudioPlaybackScheduler`]: paced real-time frame emission per sentence
//! - [`SentenceSegmenter`]: incremental reply text into sentences and tags
//! - [`VoiceSession`]: wires the above to the injected speech engines

pub mod barge_in;
pub mod playback;
pub mod segmenter;
pub mod session;
pub mod text_segmenter;

pub use barge_in::{BargeInController, ControllerAction};
pub use playback::AudioPlaybackScheduler;
pub use segmenter::{SegmenterEvent, SileroVad, SpeechSegmenter, VadModel};
pub use session::VoiceSession;
pub use text_segmenter::{parse_route_tag, SentenceSegmenter, TextUnit};

use thiserror::Error;

/// Pipeline-layer errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Codec(#[from] voiceloop_codec::CodecError),

    #[error(transparent)]
    Core(#[from] voiceloop_core::Error),

    /// Voice-activity model construction or inference failed
    #[error("vad model error: {0}")]
    Vad(String),

    /// Session channel closed before shutdown was requested
    #[error("session channel closed")]
    ChannelClosed,
}

impl From<PipelineError> for voiceloop_core::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Codec(e) => e.into(),
            PipelineError::Core(e) => e,
            PipelineError::Vad(m) => voiceloop_core::Error::ResourceInit(m),
            PipelineError::ChannelClosed => voiceloop_core::Error::ChannelClosed,
        }
    }
}
