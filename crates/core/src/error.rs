//! Error types shared across the voice pipeline

use thiserror::Error;

/// Result alias using the core error
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the voice pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Per-packet decode failure; recoverable, caller skips the packet
    #[error("decode error: {0}")]
    Decode(String),

    /// Encode failure; aborts the current flush only
    #[error("encode error: {0}")]
    Encode(String),

    /// Intent classifier call failed or timed out; caller defaults to wait
    #[error("classifier failure: {0}")]
    Classifier(String),

    /// Codec or model construction failed; fatal to the session
    #[error("resource init failure: {0}")]
    ResourceInit(String),

    /// External synthesis call failed
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// External recognition call failed
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Internal channel closed while the session was running
    #[error("channel closed")]
    ChannelClosed,

    /// Configuration rejected
    #[error("config error: {0}")]
    Config(String),
}
