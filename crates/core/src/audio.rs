//! Audio frame and speech segment types

use serde::{Deserialize, Serialize};

/// Supported sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz8000,
    Hz12000,
    Hz16000,
    Hz24000,
    Hz48000,
}

impl SampleRate {
    /// Sample rate in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz12000 => 12000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz48000 => 48000,
        }
    }

    /// Build from a raw Hz value
    pub fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            8000 => Some(SampleRate::Hz8000),
            12000 => Some(SampleRate::Hz12000),
            16000 => Some(SampleRate::Hz16000),
            24000 => Some(SampleRate::Hz24000),
            48000 => Some(SampleRate::Hz48000),
            _ => None,
        }
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        SampleRate::Hz16000
    }
}

/// Channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channels {
    Mono,
    Stereo,
}

impl Channels {
    pub fn count(&self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }

    pub fn from_count(count: u8) -> Option<Self> {
        match count {
            1 => Some(Channels::Mono),
            2 => Some(Channels::Stereo),
            _ => None,
        }
    }
}

impl Default for Channels {
    fn default() -> Self {
        Channels::Mono
    }
}

/// A single compressed audio frame
///
/// The payload is an opaque Opus packet. Frames are immutable once produced
/// and move between producer and consumer queues by value.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Compressed payload (one Opus packet)
    pub payload: Vec<u8>,
    /// Declared duration of the packet in milliseconds
    pub duration_ms: f32,
    /// Sample rate of the encoded audio
    pub sample_rate: SampleRate,
    /// Channel layout
    pub channels: Channels,
    /// Whether silence was appended to reach the frame duration
    pub is_padded: bool,
}

impl AudioFrame {
    /// Create a new frame
    pub fn new(
        payload: Vec<u8>,
        duration_ms: f32,
        sample_rate: SampleRate,
        channels: Channels,
    ) -> Self {
        Self {
            payload,
            duration_ms,
            sample_rate,
            channels,
            is_padded: false,
        }
    }

    /// Mark the frame as silence-padded
    pub fn padded(mut self) -> Self {
        self.is_padded = true;
        self
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for the empty end-of-utterance marker packet
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A contiguous run of uncompressed speech
///
/// Created only by the speech segmenter on endpoint detection and consumed
/// once by the recognizer; never mutated after creation.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Interleaved 16-bit PCM samples
    pub samples: Vec<i16>,
    /// Sample rate of the PCM
    pub sample_rate: SampleRate,
    /// Channel layout
    pub channels: Channels,
}

impl SpeechSegment {
    pub fn new(samples: Vec<i16>, sample_rate: SampleRate, channels: Channels) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Duration derived from sample count
    pub fn duration_ms(&self) -> f32 {
        let per_channel = self.samples.len() / self.channels.count();
        per_channel as f32 * 1000.0 / self.sample_rate.as_hz() as f32
    }

    /// Serialize as a minimal mono/stereo 16-bit WAV byte buffer
    ///
    /// The recognizer boundary takes wav bytes; this keeps that encoding in
    /// one place.
    pub fn to_wav_bytes(&self) -> Vec<u8> {
        let sample_rate = self.sample_rate.as_hz();
        let channels = self.channels.count() as u16;
        let data_len = (self.samples.len() * 2) as u32;
        let byte_rate = sample_rate * channels as u32 * 2;
        let block_align = channels * 2;

        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}
