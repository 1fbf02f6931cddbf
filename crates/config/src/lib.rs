//! Configuration for the voice pipeline
//!
//! Layered loading (defaults, optional file, `VOICELOOP__` environment
//! variables) with validation at startup.

mod settings;

pub use settings::{
    AudioSettings, InterruptSettings, SegmenterMode, Settings, VadSettings,
    LEGAL_FRAME_DURATIONS_MS,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
