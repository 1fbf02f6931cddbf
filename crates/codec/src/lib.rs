//! Compressed-audio handling for the voice pipeline
//!
//! Three layers, leaves first:
//! - [`OpusCodec`]: decode/encode single Opus packets for one fixed format
//! - [`OggOpusParser`]: incremental Ogg page parsing into header/tags/audio units
//! - [`OpusRepackager`]: re-chunk arbitrary-duration packets into fixed frames

pub mod ogg;
pub mod opus;
pub mod repackager;

pub use ogg::{AudioPacket, OggOpusParser, OggUnit, OpusIdHeader, OpusTags, OpusToc};
pub use opus::OpusCodec;
pub use repackager::OpusRepackager;

use thiserror::Error;

/// Codec-layer errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Codec construction failed; fatal to the session
    #[error("codec init failed: {0}")]
    Init(String),

    /// A single packet failed to decode; skip it and continue
    #[error("packet decode failed: {0}")]
    Decode(String),

    /// Re-encoding a batch failed; aborts the current flush
    #[error("encode failed: {0}")]
    Encode(String),

    /// Format outside what the codec supports
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

impl From<CodecError> for voiceloop_core::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Init(m) | CodecError::UnsupportedFormat(m) => {
                voiceloop_core::Error::ResourceInit(m)
            }
            CodecError::Decode(m) => voiceloop_core::Error::Decode(m),
            CodecError::Encode(m) => voiceloop_core::Error::Encode(m),
        }
    }
}
