//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ConfigError;

/// Frame durations that keep Opus packets frame-aligned, in milliseconds
pub const LEGAL_FRAME_DURATIONS_MS: [f32; 6] = [2.5, 5.0, 10.0, 20.0, 40.0, 60.0];

/// Main application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Audio format and framing
    #[serde(default)]
    pub audio: AudioSettings,

    /// Speech segmentation / endpointing
    #[serde(default)]
    pub vad: VadSettings,

    /// Barge-in / interrupt policy
    #[serde(default)]
    pub interrupt: InterruptSettings,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from an optional file plus `VOICELOOP__` env overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix("VOICELOOP").separator("__"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LEGAL_FRAME_DURATIONS_MS
            .iter()
            .any(|&d| (d - self.audio.frame_duration_ms).abs() < f32::EPSILON)
        {
            return Err(ConfigError::InvalidValue {
                field: "audio.frame_duration_ms".to_string(),
                message: format!(
                    "must be one of {:?} ms, got {}",
                    LEGAL_FRAME_DURATIONS_MS, self.audio.frame_duration_ms
                ),
            });
        }

        if !matches!(self.audio.sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(ConfigError::InvalidValue {
                field: "audio.sample_rate".to_string(),
                message: format!("unsupported Opus sample rate: {}", self.audio.sample_rate),
            });
        }

        if !matches!(self.audio.channels, 1 | 2) {
            return Err(ConfigError::InvalidValue {
                field: "audio.channels".to_string(),
                message: format!("channel count must be 1 or 2, got {}", self.audio.channels),
            });
        }

        if self.vad.min_speech_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "vad.min_speech_ms".to_string(),
                message: "minimum speech duration must be positive".to_string(),
            });
        }

        if self.vad.max_speech_ms <= self.vad.min_speech_ms as u64 {
            return Err(ConfigError::InvalidValue {
                field: "vad.max_speech_ms".to_string(),
                message: "speech ceiling must exceed the minimum speech duration".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(ConfigError::InvalidValue {
                field: "vad.threshold".to_string(),
                message: format!("threshold must be within 0.0-1.0, got {}", self.vad.threshold),
            });
        }

        if self.interrupt.max_queue_len == 0 {
            return Err(ConfigError::InvalidValue {
                field: "interrupt.max_queue_len".to_string(),
                message: "pending queue must hold at least one utterance".to_string(),
            });
        }

        if self.interrupt.classifier_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "interrupt.classifier_timeout_ms".to_string(),
                message: "classifier timeout must be explicit and positive".to_string(),
            });
        }

        Ok(())
    }
}

/// Speech segmenter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmenterMode {
    /// Explicit end-of-utterance marker packets
    Manual,
    /// Neural voice-activity endpointing
    Auto,
}

impl Default for SegmenterMode {
    fn default() -> Self {
        SegmenterMode::Auto
    }
}

/// Audio format and framing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Session sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Channel count (1 = mono, 2 = stereo)
    #[serde(default = "default_channels")]
    pub channels: u8,

    /// Target duration of repackaged outgoing frames (ms)
    #[serde(default = "default_frame_duration")]
    pub frame_duration_ms: f32,

    /// Jitter buffer depth before a sentence starts playing (ms)
    #[serde(default = "default_buffer_time")]
    pub buffer_time_ms: u64,
}

fn default_sample_rate() -> u32 {
    16000
}
fn default_channels() -> u8 {
    1
}
fn default_frame_duration() -> f32 {
    60.0
}
fn default_buffer_time() -> u64 {
    240
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration_ms: default_frame_duration(),
            buffer_time_ms: default_buffer_time(),
        }
    }
}

/// Speech segmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Endpointing mode
    #[serde(default)]
    pub mode: SegmenterMode,

    /// Speech probability threshold (0.0 - 1.0)
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,

    /// Contiguous speech required to open a segment (ms)
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,

    /// Contiguous silence required to close a segment (ms)
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u32,

    /// Hard ceiling on one segment (ms); reaching it ends the segment
    #[serde(default = "default_max_speech_ms")]
    pub max_speech_ms: u64,

    /// Silence padded onto both segment edges for naturalness (ms)
    #[serde(default = "default_speech_pad_ms")]
    pub speech_pad_ms: u32,
}

fn default_vad_threshold() -> f32 {
    0.5
}
fn default_min_speech_ms() -> u32 {
    250
}
fn default_min_silence_ms() -> u32 {
    500
}
fn default_max_speech_ms() -> u64 {
    30_000
}
fn default_speech_pad_ms() -> u32 {
    30
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            mode: SegmenterMode::default(),
            threshold: default_vad_threshold(),
            min_speech_ms: default_min_speech_ms(),
            min_silence_ms: default_min_silence_ms(),
            max_speech_ms: default_max_speech_ms(),
            speech_pad_ms: default_speech_pad_ms(),
        }
    }
}

/// Barge-in / interrupt policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptSettings {
    /// Enable interrupt handling during playback
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum recognizer confidence for a classified utterance
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Bound on the deferred-utterance queue
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,

    /// Deferred utterances older than this are discarded on drain (ms)
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Minimum spacing between delivered interrupts (ms)
    #[serde(default = "default_min_interrupt_interval_ms")]
    pub min_interrupt_interval_ms: u64,

    /// Explicit timeout on the external classifier call (ms)
    #[serde(default = "default_classifier_timeout_ms")]
    pub classifier_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_min_confidence() -> f32 {
    0.4
}
fn default_max_queue_len() -> usize {
    3
}
fn default_queue_timeout_ms() -> u64 {
    10_000
}
fn default_min_interrupt_interval_ms() -> u64 {
    800
}
fn default_classifier_timeout_ms() -> u64 {
    2_000
}

impl Default for InterruptSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            min_confidence: default_min_confidence(),
            max_queue_len: default_max_queue_len(),
            queue_timeout_ms: default_queue_timeout_ms(),
            min_interrupt_interval_ms: default_min_interrupt_interval_ms(),
            classifier_timeout_ms: default_classifier_timeout_ms(),
        }
    }
}
