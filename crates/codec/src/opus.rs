//! Opus packet codec
//!
//! Thin wrapper around libopus binding both directions to one fixed sample
//! rate and channel count. Instances are session-exclusive: callers hold
//! `&mut` access, there is no internal locking.

use audiopus::{
    coder::{Decoder, Encoder},
    packet::Packet,
    Application, Channels as OpusChannels, MutSignals, SampleRate as OpusSampleRate,
};

use voiceloop_core::{Channels, SampleRate};

use crate::CodecError;

/// Opus decode/encode pair for one fixed audio format
pub struct OpusCodec {
    encoder: Encoder,
    decoder: Decoder,
    sample_rate: SampleRate,
    channels: Channels,
}

impl OpusCodec {
    /// Create a codec bound to the given format
    ///
    /// Construction failure is fatal to the session that requested it.
    pub fn new(sample_rate: SampleRate, channels: Channels) -> Result<Self, CodecError> {
        let opus_rate = to_opus_rate(sample_rate);
        let opus_channels = to_opus_channels(channels);

        let encoder = Encoder::new(opus_rate, opus_channels, Application::Voip)
            .map_err(|e| CodecError::Init(format!("encoder: {}", e)))?;
        let decoder = Decoder::new(opus_rate, opus_channels)
            .map_err(|e| CodecError::Init(format!("decoder: {}", e)))?;

        Ok(Self {
            encoder,
            decoder,
            sample_rate,
            channels,
        })
    }

    /// Decode one packet to interleaved 16-bit PCM
    ///
    /// A malformed packet yields a per-call error and leaves the codec
    /// usable; the caller skips the packet and continues.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        // 120ms is the largest legal Opus packet
        let max_samples =
            self.sample_rate.as_hz() as usize * 120 / 1000 * self.channels.count();
        let mut output = vec![0i16; max_samples];

        let packet = Packet::try_from(packet)
            .map_err(|e| CodecError::Decode(format!("invalid packet: {}", e)))?;
        let signals = MutSignals::try_from(&mut output[..])
            .map_err(|e| CodecError::Decode(format!("signal buffer: {}", e)))?;

        let decoded = self
            .decoder
            .decode(Some(packet), signals, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        output.truncate(decoded * self.channels.count());
        Ok(output)
    }

    /// Encode interleaved 16-bit PCM into a single packet
    ///
    /// The sample count must correspond to a legal Opus frame duration for
    /// the bound sample rate; anything else is rejected by the encoder.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let mut output = vec![0u8; 4000]; // max Opus packet size

        let encoded = self
            .encoder
            .encode(pcm, &mut output)
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        output.truncate(encoded);
        Ok(output)
    }

    /// Duration of a PCM slice at the bound format, in milliseconds
    pub fn pcm_duration_ms(&self, pcm: &[i16]) -> f32 {
        let per_channel = pcm.len() / self.channels.count();
        per_channel as f32 * 1000.0 / self.sample_rate.as_hz() as f32
    }

    /// Sample count for a duration at the bound format (interleaved)
    pub fn samples_for_ms(&self, duration_ms: f32) -> usize {
        (self.sample_rate.as_hz() as f32 * duration_ms / 1000.0).round() as usize
            * self.channels.count()
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }
}

fn to_opus_rate(rate: SampleRate) -> OpusSampleRate {
    match rate {
        SampleRate::Hz8000 => OpusSampleRate::Hz8000,
        SampleRate::Hz12000 => OpusSampleRate::Hz12000,
        SampleRate::Hz16000 => OpusSampleRate::Hz16000,
        SampleRate::Hz24000 => OpusSampleRate::Hz24000,
        SampleRate::Hz48000 => OpusSampleRate::Hz48000,
    }
}

fn to_opus_channels(channels: Channels) -> OpusChannels {
    match channels {
        Channels::Mono => OpusChannels::Mono,
        Channels::Stereo => OpusChannels::Stereo,
    }
}
