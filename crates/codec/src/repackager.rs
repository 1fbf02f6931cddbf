//! Fixed-duration Opus frame repackaging
//!
//! Synthesis engines emit packets of whatever duration they like (commonly
//! 20ms). The playback path wants uniform frames at the session's target
//! duration. [`OpusRepackager`] buffers incoming packets, and once the
//! buffered duration reaches the target it decodes the batch, concatenates
//! the PCM and re-encodes it as one packet. [`OpusRepackager::finalize`]
//! pads the tail with silence to land exactly on the target.

use tracing::warn;

use voiceloop_core::AudioFrame;

use crate::{opus::OpusCodec, CodecError};

/// How far past the target a batch may stretch before a packet is deferred
const OVERSHOOT_FACTOR: f32 = 1.2;

struct PendingPacket {
    payload: Vec<u8>,
    duration_ms: f32,
}

/// Re-chunks arbitrary-duration Opus packets into fixed-duration frames
pub struct OpusRepackager {
    codec: OpusCodec,
    target_ms: f32,
    pending: Vec<PendingPacket>,
    pending_ms: f32,
}

impl OpusRepackager {
    /// Create a repackager flushing at `target_ms`
    ///
    /// The target must be a legal Opus frame duration or every flush would
    /// fail at the encoder.
    pub fn new(codec: OpusCodec, target_ms: f32) -> Result<Self, CodecError> {
        const LEGAL: [f32; 6] = [2.5, 5.0, 10.0, 20.0, 40.0, 60.0];
        if !LEGAL.iter().any(|&d| (d - target_ms).abs() < f32::EPSILON) {
            return Err(CodecError::UnsupportedFormat(format!(
                "target frame duration {}ms is not a legal Opus frame",
                target_ms
            )));
        }

        Ok(Self {
            codec,
            target_ms,
            pending: Vec::new(),
            pending_ms: 0.0,
        })
    }

    pub fn target_ms(&self) -> f32 {
        self.target_ms
    }

    /// Buffered duration not yet flushed, in milliseconds
    pub fn pending_ms(&self) -> f32 {
        self.pending_ms
    }

    /// Add one packet with its declared duration
    ///
    /// Returns a repackaged frame once buffered duration reaches the target.
    /// A packet that would stretch the batch past 1.2x the target stays
    /// buffered for the next batch, unless it is the only packet buffered,
    /// in which case it flushes alone.
    pub fn add(
        &mut self,
        payload: Vec<u8>,
        duration_ms: f32,
    ) -> Result<Option<AudioFrame>, CodecError> {
        self.pending.push(PendingPacket {
            payload,
            duration_ms,
        });
        self.pending_ms += duration_ms;

        if self.pending_ms < self.target_ms {
            return Ok(None);
        }

        // Split the buffer: take packets until the target is reached, but
        // defer any packet that would stretch the batch past the overshoot
        // bound.
        let limit = self.target_ms * OVERSHOOT_FACTOR;
        let mut batch_ms = 0.0f32;
        let mut split = 0;
        for packet in &self.pending {
            if batch_ms >= self.target_ms || batch_ms + packet.duration_ms > limit {
                break;
            }
            batch_ms += packet.duration_ms;
            split += 1;
        }
        // A lone packet past the overshoot bound still flushes; an empty
        // batch would reach the encoder with zero samples and lose the
        // packet outright.
        if split == 0 {
            batch_ms = self.pending[0].duration_ms;
            split = 1;
        }

        let rest = self.pending.split_off(split);
        let batch = std::mem::replace(&mut self.pending, rest);
        self.pending_ms -= batch_ms;

        match self.flush_batch(batch) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                // Do not keep retrying data that will fail again
                self.pending.clear();
                self.pending_ms = 0.0;
                Err(e)
            }
        }
    }

    /// Flush whatever remains, padding with silence up to the target
    ///
    /// Returns `None` when nothing is buffered. The returned frame always
    /// has `duration_ms == target` and carries `is_padded = true` when
    /// silence was appended.
    pub fn finalize(&mut self) -> Result<Option<AudioFrame>, CodecError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let batch = std::mem::take(&mut self.pending);
        self.pending_ms = 0.0;

        let mut pcm = self.decode_batch(batch);
        let target_samples = self.codec.samples_for_ms(self.target_ms);
        let padded = pcm.len() < target_samples;
        if padded {
            pcm.resize(target_samples, 0);
        }

        let frame = self.encode_frame(pcm)?;
        Ok(Some(if padded { frame.padded() } else { frame }))
    }

    /// Decode, concatenate and re-encode one batch
    fn flush_batch(&mut self, batch: Vec<PendingPacket>) -> Result<AudioFrame, CodecError> {
        let pcm = self.decode_batch(batch);
        self.encode_frame(pcm)
    }

    fn decode_batch(&mut self, batch: Vec<PendingPacket>) -> Vec<i16> {
        let mut pcm = Vec::new();
        for packet in batch {
            match self.codec.decode(&packet.payload) {
                Ok(samples) => pcm.extend(samples),
                Err(e) => {
                    // One bad packet costs its own audio only
                    warn!(duration_ms = packet.duration_ms, "dropping packet: {}", e);
                }
            }
        }
        pcm
    }

    fn encode_frame(&mut self, pcm: Vec<i16>) -> Result<AudioFrame, CodecError> {
        let duration_ms = self.codec.pcm_duration_ms(&pcm);
        let payload = self.codec.encode(&pcm)?;
        Ok(AudioFrame::new(
            payload,
            duration_ms,
            self.codec.sample_rate(),
            self.codec.channels(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voiceloop_core::{Channels, SampleRate};

    fn make() -> OpusRepackager {
        let codec = OpusCodec::new(SampleRate::Hz16000, Channels::Mono).unwrap();
        OpusRepackager::new(codec, 60.0).unwrap()
    }

    /// Encode one 20ms packet of low-level tone at 16kHz mono
    fn packet_20ms() -> Vec<u8> {
        let mut codec = OpusCodec::new(SampleRate::Hz16000, Channels::Mono).unwrap();
        let pcm: Vec<i16> = (0..320).map(|i| ((i as f32 * 0.2).sin() * 8000.0) as i16).collect();
        codec.encode(&pcm).unwrap()
    }

    #[test]
    fn test_illegal_target_rejected() {
        let codec = OpusCodec::new(SampleRate::Hz16000, Channels::Mono).unwrap();
        assert!(OpusRepackager::new(codec, 30.0).is_err());
    }

    #[test]
    fn test_five_packets_flush_and_padded_tail() {
        let mut repackager = make();
        let packet = packet_20ms();

        // 100ms of 20ms packets with a 60ms target: the third add crosses
        // the target and flushes one 60ms frame.
        let mut flushed = Vec::new();
        for _ in 0..5 {
            if let Some(frame) = repackager.add(packet.clone(), 20.0).unwrap() {
                flushed.push(frame);
            }
        }
        assert_eq!(flushed.len(), 1);
        assert!((flushed[0].duration_ms - 60.0).abs() < 0.01);
        assert!(!flushed[0].is_padded);

        // 40ms remain; finalize pads to exactly 60ms
        let tail = repackager.finalize().unwrap().unwrap();
        assert!((tail.duration_ms - 60.0).abs() < 0.01);
        assert!(tail.is_padded);

        // Nothing left afterwards
        assert!(repackager.finalize().unwrap().is_none());
    }

    #[test]
    fn test_overshoot_deferred() {
        let mut repackager = make();
        let packet = packet_20ms();

        // 40ms buffered, then a 40ms packet arrives: total 80ms crosses the
        // target, but including the new packet would stretch the batch to
        // 80ms > 72ms, so it is deferred and the 40ms batch flushes alone.
        assert!(repackager.add(packet.clone(), 20.0).unwrap().is_none());
        assert!(repackager.add(packet.clone(), 20.0).unwrap().is_none());

        let mut codec = OpusCodec::new(SampleRate::Hz16000, Channels::Mono).unwrap();
        let pcm_40: Vec<i16> = (0..640).map(|i| ((i as f32 * 0.2).sin() * 8000.0) as i16).collect();
        let packet_40 = codec.encode(&pcm_40).unwrap();

        let frame = repackager.add(packet_40, 40.0).unwrap();
        // Batch selection stops at the 40ms packet (40 + 40 > 72), flushing
        // the first two packets; the 40ms packet stays pending.
        let frame = frame.expect("buffer reached target, must flush");
        assert!((frame.duration_ms - 40.0).abs() < 1.0);
        assert!((repackager.pending_ms() - 40.0).abs() < 0.01);
    }

    #[test]
    fn test_oversized_packet_flushes_alone() {
        let codec = OpusCodec::new(SampleRate::Hz16000, Channels::Mono).unwrap();
        let mut repackager = OpusRepackager::new(codec, 20.0).unwrap();

        let mut codec = OpusCodec::new(SampleRate::Hz16000, Channels::Mono).unwrap();
        let pcm_40: Vec<i16> = (0..640).map(|i| ((i as f32 * 0.2).sin() * 8000.0) as i16).collect();
        let packet_40 = codec.encode(&pcm_40).unwrap();

        // A single 40ms packet against a 20ms target exceeds the 24ms
        // overshoot bound on its own; it must flush by itself, not be
        // destroyed by an empty-batch encode failure.
        let frame = repackager
            .add(packet_40, 40.0)
            .unwrap()
            .expect("oversized packet must flush");
        assert!((frame.duration_ms - 40.0).abs() < 1.0);
        assert!(repackager.pending_ms().abs() < 0.01);
    }

    #[test]
    fn test_bad_packet_dropped_not_fatal() {
        let mut repackager = make();
        let packet = packet_20ms();

        repackager.add(packet.clone(), 20.0).unwrap();
        repackager.add(vec![0xFF; 3], 20.0).unwrap();
        let frame = repackager.add(packet.clone(), 20.0).unwrap().unwrap();

        // The garbage packet's 20ms of audio is simply missing
        assert!((frame.duration_ms - 40.0).abs() < 1.0);
    }

    #[test]
    fn test_finalize_empty_returns_none() {
        let mut repackager = make();
        assert!(repackager.finalize().unwrap().is_none());
    }
}
