//! Speech endpointing over a live Opus packet stream
//!
//! Two modes per session:
//! - manual: the sender marks end-of-utterance with an empty packet
//! - automatic: a neural voice-activity model scores fixed windows of
//!   decoded PCM and a two-state machine decides segment boundaries
//!
//! Either way the output is the same: complete [`SpeechSegment`]s ready for
//! recognition, plus an end-of-utterance notification so downstream never
//! waits on a segment that was dropped as too short.

use std::collections::VecDeque;

use tracing::{debug, error, warn};
use voice_activity_detector::VoiceActivityDetector;

use voiceloop_codec::OpusCodec;
use voiceloop_config::{SegmenterMode, VadSettings};
use voiceloop_core::SpeechSegment;

use crate::PipelineError;

/// Window length used for voice-activity scoring, in milliseconds
const VAD_WINDOW_MS: u32 = 32;

/// Per-window speech probability model
///
/// Implementations hold mutable inference state; instances are
/// session-exclusive like the codec.
pub trait VadModel: Send {
    /// Speech probability (0.0 - 1.0) for one window of mono PCM
    fn predict(&mut self, window: &[i16]) -> Result<f32, PipelineError>;

    /// Window length in mono samples
    fn window_size(&self) -> usize;
}

/// Silero-based voice-activity model
pub struct SileroVad {
    detector: VoiceActivityDetector,
    chunk_size: usize,
}

impl SileroVad {
    /// Load the model for one sample rate
    ///
    /// Model load failure is fatal to the session that requested automatic
    /// endpointing.
    pub fn new(sample_rate_hz: u32) -> Result<Self, PipelineError> {
        let chunk_size = (sample_rate_hz * VAD_WINDOW_MS / 1000) as usize;
        let detector = VoiceActivityDetector::builder()
            .sample_rate(sample_rate_hz as i64)
            .chunk_size(chunk_size)
            .build()
            .map_err(|e| PipelineError::Vad(e.to_string()))?;
        Ok(Self {
            detector,
            chunk_size,
        })
    }
}

impl VadModel for SileroVad {
    fn predict(&mut self, window: &[i16]) -> Result<f32, PipelineError> {
        Ok(self.detector.predict(window.iter().copied()))
    }

    fn window_size(&self) -> usize {
        self.chunk_size
    }
}

/// Output of one segmenter step
#[derive(Debug)]
pub enum SegmenterEvent {
    /// A complete speech segment
    Segment(SpeechSegment),
    /// The utterance ended; emitted even when the segment was discarded
    UtteranceEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Silence,
    Speaking,
}

/// Turns a live Opus packet stream into complete speech segments
pub struct SpeechSegmenter {
    codec: OpusCodec,
    mode: SegmenterMode,
    settings: VadSettings,

    // manual mode accumulation
    pcm: Vec<i16>,

    // automatic mode
    vad: Option<Box<dyn VadModel>>,
    /// Interleaved samples not yet forming a full window
    staging: Vec<i16>,
    state: VadState,
    /// Ring of recent silence windows kept as leading pad
    prebuf: VecDeque<Vec<i16>>,
    /// Windows of the speech run observed while still in `Silence`
    candidate: Vec<Vec<i16>>,
    /// The active segment's windows while `Speaking`
    active: Vec<Vec<i16>>,
    speech_run: usize,
    silence_run: usize,
    /// Model became unavailable; session fails closed
    failed: bool,
}

impl SpeechSegmenter {
    /// Marker-packet endpointing
    pub fn manual(codec: OpusCodec, settings: VadSettings) -> Self {
        Self::build(codec, SegmenterMode::Manual, settings, None)
    }

    /// Neural endpointing with the given model
    pub fn automatic(codec: OpusCodec, settings: VadSettings, model: Box<dyn VadModel>) -> Self {
        Self::build(codec, SegmenterMode::Auto, settings, Some(model))
    }

    fn build(
        codec: OpusCodec,
        mode: SegmenterMode,
        settings: VadSettings,
        vad: Option<Box<dyn VadModel>>,
    ) -> Self {
        Self {
            codec,
            mode,
            settings,
            pcm: Vec::new(),
            vad,
            staging: Vec::new(),
            state: VadState::Silence,
            prebuf: VecDeque::new(),
            candidate: Vec::new(),
            active: Vec::new(),
            speech_run: 0,
            silence_run: 0,
            failed: false,
        }
    }

    pub fn mode(&self) -> SegmenterMode {
        self.mode
    }

    /// Process one incoming packet
    ///
    /// An empty packet is the manual end-of-utterance marker. Decode errors
    /// skip the packet; a model error disables the segmenter for the rest
    /// of the session.
    pub fn push_packet(&mut self, packet: &[u8]) -> Vec<SegmenterEvent> {
        if self.failed {
            return Vec::new();
        }

        match self.mode {
            SegmenterMode::Manual => self.push_manual(packet),
            SegmenterMode::Auto => self.push_auto(packet),
        }
    }

    fn push_manual(&mut self, packet: &[u8]) -> Vec<SegmenterEvent> {
        if packet.is_empty() {
            let pcm = std::mem::take(&mut self.pcm);
            let mut events = Vec::new();
            let duration_ms = self.codec.pcm_duration_ms(&pcm);
            if duration_ms >= self.settings.min_speech_ms as f32 {
                events.push(SegmenterEvent::Segment(self.segment(pcm)));
            } else {
                debug!(duration_ms, "utterance below minimum, discarded");
            }
            // Always notify, or downstream stalls waiting for a segment
            events.push(SegmenterEvent::UtteranceEnded);
            return events;
        }

        match self.codec.decode(packet) {
            Ok(samples) => self.pcm.extend(samples),
            Err(e) => warn!("skipping packet: {}", e),
        }
        Vec::new()
    }

    fn push_auto(&mut self, packet: &[u8]) -> Vec<SegmenterEvent> {
        if packet.is_empty() {
            return Vec::new();
        }

        match self.codec.decode(packet) {
            Ok(samples) => self.staging.extend(samples),
            Err(e) => {
                warn!("skipping packet: {}", e);
                return Vec::new();
            }
        }

        let window_samples = match &self.vad {
            Some(model) => model.window_size() * self.codec.channels().count(),
            None => {
                self.fail_closed("no model configured for automatic endpointing");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        while self.staging.len() >= window_samples {
            let window: Vec<i16> = self.staging.drain(..window_samples).collect();
            let mono = self.downmix(&window);

            let prob = match self.vad.as_mut().and_then(|m| m.predict(&mono).ok()) {
                Some(p) => p,
                None => {
                    self.fail_closed("voice-activity model unavailable");
                    return events;
                }
            };

            if let Some(event) = self.step(window, prob) {
                events.push(SegmenterEvent::Segment(event));
                events.push(SegmenterEvent::UtteranceEnded);
            }
        }
        events
    }

    /// Advance the two-state machine by one scored window
    fn step(&mut self, window: Vec<i16>, prob: f32) -> Option<SpeechSegment> {
        let is_speech = prob >= self.settings.threshold;

        match self.state {
            VadState::Silence => {
                if is_speech {
                    self.candidate.push(window);
                    self.speech_run += 1;
                    if self.speech_run >= self.min_speech_windows() {
                        // Segment opens with the leading pad plus the run
                        self.active = self.prebuf.drain(..).chain(self.candidate.drain(..)).collect();
                        self.state = VadState::Speaking;
                        self.silence_run = 0;
                    }
                } else {
                    // A broken run goes back into the pad ring
                    self.speech_run = 0;
                    for w in self.candidate.drain(..) {
                        self.prebuf.push_back(w);
                    }
                    self.prebuf.push_back(window);
                    while self.prebuf.len() > self.pad_windows() {
                        self.prebuf.pop_front();
                    }
                }
                None
            }
            VadState::Speaking => {
                self.active.push(window);
                if is_speech {
                    self.silence_run = 0;
                } else {
                    self.silence_run += 1;
                    if self.silence_run >= self.min_silence_windows() {
                        // Trim trailing silence beyond the pad
                        let trim = self.silence_run.saturating_sub(self.pad_windows());
                        let keep = self.active.len() - trim;
                        self.active.truncate(keep);
                        return self.close_segment();
                    }
                }

                if self.active.len() >= self.max_speech_windows() {
                    // Ceiling reached, not an error
                    debug!("segment reached the speech ceiling, forcing endpoint");
                    return self.close_segment();
                }
                None
            }
        }
    }

    fn close_segment(&mut self) -> Option<SpeechSegment> {
        let windows = std::mem::take(&mut self.active);
        self.state = VadState::Silence;
        self.speech_run = 0;
        self.silence_run = 0;
        self.prebuf.clear();

        let mut pcm: Vec<i16> = windows.into_iter().flatten().collect();
        let duration_ms = self.codec.pcm_duration_ms(&pcm);
        if duration_ms < self.settings.min_speech_ms as f32 {
            debug!(duration_ms, "segment below minimum, dropped");
            return None;
        }

        let max_samples = self
            .codec
            .samples_for_ms(self.settings.max_speech_ms as f32);
        if pcm.len() > max_samples {
            pcm.truncate(max_samples);
        }

        Some(self.segment(pcm))
    }

    fn segment(&self, pcm: Vec<i16>) -> SpeechSegment {
        SpeechSegment::new(pcm, self.codec.sample_rate(), self.codec.channels())
    }

    fn downmix(&self, interleaved: &[i16]) -> Vec<i16> {
        let channels = self.codec.channels().count();
        if channels == 1 {
            return interleaved.to_vec();
        }
        interleaved
            .chunks_exact(channels)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
            .collect()
    }

    fn fail_closed(&mut self, reason: &str) {
        // Logged once, then the session emits nothing further
        error!("segmenter disabled for this session: {}", reason);
        self.failed = true;
    }

    fn window_ms(&self) -> f32 {
        let size = self.vad.as_ref().map(|m| m.window_size()).unwrap_or(1);
        size as f32 * 1000.0 / self.codec.sample_rate().as_hz() as f32
    }

    fn min_speech_windows(&self) -> usize {
        ((self.settings.min_speech_ms as f32 / self.window_ms()).ceil() as usize).max(1)
    }

    fn min_silence_windows(&self) -> usize {
        ((self.settings.min_silence_ms as f32 / self.window_ms()).ceil() as usize).max(1)
    }

    fn pad_windows(&self) -> usize {
        (self.settings.speech_pad_ms as f32 / self.window_ms()).round() as usize
    }

    fn max_speech_windows(&self) -> usize {
        (self.settings.max_speech_ms as f32 / self.window_ms()).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voiceloop_core::{Channels, SampleRate};

    fn codec() -> OpusCodec {
        OpusCodec::new(SampleRate::Hz16000, Channels::Mono).unwrap()
    }

    /// One 20ms packet of audible tone
    fn voiced_packet() -> Vec<u8> {
        let pcm: Vec<i16> = (0..320)
            .map(|i| ((i as f32 * 0.3).sin() * 10000.0) as i16)
            .collect();
        codec().encode(&pcm).unwrap()
    }

    /// Model scripted by window index; default probability after the script
    /// runs out is 0.0
    struct ScriptedVad {
        probs: std::collections::VecDeque<f32>,
        fail: bool,
    }

    impl ScriptedVad {
        fn speech_then_silence(speech_windows: usize) -> Box<Self> {
            Box::new(Self {
                probs: (0..speech_windows).map(|_| 0.9).collect(),
                fail: false,
            })
        }

        fn failing() -> Box<Self> {
            Box::new(Self {
                probs: Default::default(),
                fail: true,
            })
        }
    }

    impl VadModel for ScriptedVad {
        fn predict(&mut self, _window: &[i16]) -> Result<f32, PipelineError> {
            if self.fail {
                return Err(PipelineError::Vad("model gone".into()));
            }
            Ok(self.probs.pop_front().unwrap_or(0.0))
        }

        fn window_size(&self) -> usize {
            512
        }
    }

    fn default_vad_settings() -> VadSettings {
        VadSettings {
            mode: SegmenterMode::Auto,
            threshold: 0.5,
            min_speech_ms: 250,
            min_silence_ms: 500,
            max_speech_ms: 30_000,
            speech_pad_ms: 30,
        }
    }

    #[test]
    fn test_manual_segment_then_marker() {
        let mut settings = default_vad_settings();
        settings.mode = SegmenterMode::Manual;
        let mut seg = SpeechSegmenter::manual(codec(), settings);

        // 1 second of voiced packets, then the empty marker
        let packet = voiced_packet();
        for _ in 0..50 {
            assert!(seg.push_packet(&packet).is_empty());
        }
        let events = seg.push_packet(&[]);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SegmenterEvent::Segment(_)));
        assert!(matches!(events[1], SegmenterEvent::UtteranceEnded));

        if let SegmenterEvent::Segment(s) = &events[0] {
            assert_eq!(s.samples.len(), 50 * 320);
        }
    }

    #[test]
    fn test_manual_short_utterance_discarded_but_notified() {
        let mut settings = default_vad_settings();
        settings.mode = SegmenterMode::Manual;
        let mut seg = SpeechSegmenter::manual(codec(), settings);

        // 100ms < 250ms minimum
        let packet = voiced_packet();
        for _ in 0..5 {
            seg.push_packet(&packet);
        }
        let events = seg.push_packet(&[]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SegmenterEvent::UtteranceEnded));
    }

    #[test]
    fn test_auto_endpointing_trims_trailing_silence() {
        // 31 speech windows (992ms), then scripted silence
        let mut seg = SpeechSegmenter::automatic(
            codec(),
            default_vad_settings(),
            ScriptedVad::speech_then_silence(31),
        );

        // 80 packets of 20ms = 25600 samples = 50 full windows
        let packet = voiced_packet();
        let mut events = Vec::new();
        for _ in 0..80 {
            events.extend(seg.push_packet(&packet));
        }

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], SegmenterEvent::UtteranceEnded));
        match &events[0] {
            SegmenterEvent::Segment(s) => {
                // 31 speech windows + 1 pad window of trailing silence
                assert_eq!(s.samples.len(), 32 * 512);
            }
            other => panic!("expected segment, got {:?}", other),
        }
    }

    #[test]
    fn test_auto_short_burst_never_opens_segment() {
        // 3 speech windows (96ms) < 250ms minimum speech run
        let mut seg = SpeechSegmenter::automatic(
            codec(),
            default_vad_settings(),
            ScriptedVad::speech_then_silence(3),
        );

        let packet = voiced_packet();
        let mut events = Vec::new();
        for _ in 0..80 {
            events.extend(seg.push_packet(&packet));
        }
        assert!(events.is_empty());
    }

    #[test]
    fn test_model_failure_fails_closed() {
        let mut seg =
            SpeechSegmenter::automatic(codec(), default_vad_settings(), ScriptedVad::failing());

        let packet = voiced_packet();
        for _ in 0..10 {
            assert!(seg.push_packet(&packet).is_empty());
        }
    }
}
