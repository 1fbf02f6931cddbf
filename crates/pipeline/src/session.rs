//! One conversational voice session
//!
//! [`VoiceSession`] wires the pipeline together: incoming Opus packets run
//! through the speech segmenter and recognizer into the barge-in
//! controller; reply text runs through the sentence segmenter, synthesis,
//! the Ogg parser and repackager into the playback scheduler. Everything
//! observable leaves on one broadcast bus.
//!
//! Two tasks per session, each the single consumer of its own queue:
//! - the control task owns the speech segmenter and the controller
//! - the reply task owns the sentence segmenter and the synthesis path
//! plus the playback consumer spawned by the scheduler itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voiceloop_codec::{OggOpusParser, OggUnit, OpusCodec, OpusRepackager};
use voiceloop_config::{SegmenterMode, Settings};
use voiceloop_core::{
    Channels, Error, IntentClassifier, Recognizer, Result, SampleRate, Synthesizer, TtsState,
    VoiceEvent,
};

use crate::barge_in::{BargeInController, ControllerAction};
use crate::playback::AudioPlaybackScheduler;
use crate::segmenter::{SegmenterEvent, SileroVad, SpeechSegmenter};
use crate::text_segmenter::{parse_route_tag, SentenceSegmenter, TextUnit};

const EVENT_BUS_CAPACITY: usize = 256;

enum ReplyInput {
    Text(String),
    Done,
}

/// A live voice session
pub struct VoiceSession {
    id: Uuid,
    events: broadcast::Sender<VoiceEvent>,
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    reply_tx: mpsc::UnboundedSender<ReplyInput>,
    scheduler: Arc<AudioPlaybackScheduler>,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceSession {
    /// Build and start a session
    ///
    /// Codec and model construction failures are fatal here; a session
    /// never starts degraded.
    pub fn start(
        settings: &Settings,
        voice: impl Into<String>,
        synthesizer: Arc<dyn Synthesizer>,
        recognizer: Arc<dyn Recognizer>,
        classifier: Arc<dyn IntentClassifier>,
    ) -> Result<Self> {
        settings.validate().map_err(|e| Error::Config(e.to_string()))?;

        let sample_rate = SampleRate::from_hz(settings.audio.sample_rate)
            .ok_or_else(|| Error::Config(format!("sample rate {}", settings.audio.sample_rate)))?;
        let channels = Channels::from_count(settings.audio.channels)
            .ok_or_else(|| Error::Config(format!("channels {}", settings.audio.channels)))?;

        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let scheduler = Arc::new(AudioPlaybackScheduler::new(
            settings.audio.frame_duration_ms,
            settings.audio.buffer_time_ms,
            events.clone(),
        ));

        let input_codec = OpusCodec::new(sample_rate, channels).map_err(Error::from)?;
        let segmenter = match settings.vad.mode {
            SegmenterMode::Manual => SpeechSegmenter::manual(input_codec, settings.vad.clone()),
            SegmenterMode::Auto => {
                let model = SileroVad::new(settings.audio.sample_rate).map_err(Error::from)?;
                SpeechSegmenter::automatic(input_codec, settings.vad.clone(), Box::new(model))
            }
        };
        let controller = BargeInController::new(settings.interrupt.clone(), classifier);

        let id = Uuid::new_v4();
        info!(session = %id, mode = ?settings.vad.mode, "voice session started");

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let control = ControlTask {
            audio_rx,
            segmenter,
            recognizer,
            controller,
            scheduler: scheduler.clone(),
            events: events.clone(),
            bus: events.subscribe(),
        };
        let reply = ReplyTask {
            reply_rx,
            synthesizer,
            scheduler: scheduler.clone(),
            events: events.clone(),
            sample_rate,
            channels,
            frame_duration_ms: settings.audio.frame_duration_ms,
            voice: voice.into(),
        };

        let tasks = vec![tokio::spawn(control.run()), tokio::spawn(reply.run())];

        Ok(Self {
            id,
            events,
            audio_tx,
            reply_tx,
            scheduler,
            tasks,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Subscribe to the session's event bus
    pub fn events(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub fn is_playing(&self) -> bool {
        self.scheduler.is_playing()
    }

    /// Feed one incoming Opus packet; empty marks end-of-utterance in
    /// manual mode
    pub fn push_audio(&self, packet: Vec<u8>) -> Result<()> {
        self.audio_tx
            .send(packet)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Feed a piece of incremental reply text
    pub fn push_reply_text(&self, text: impl Into<String>) -> Result<()> {
        self.reply_tx
            .send(ReplyInput::Text(text.into()))
            .map_err(|_| Error::ChannelClosed)
    }

    /// The reply for the current turn is complete
    pub fn end_reply(&self) -> Result<()> {
        self.reply_tx
            .send(ReplyInput::Done)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Stop playback immediately without tearing the session down
    pub fn interrupt(&self) {
        self.scheduler.interrupt();
    }

    /// Tear the session down; safe to call more than once
    pub async fn shutdown(&mut self) {
        self.scheduler.interrupt();
        self.scheduler.shutdown().await;
        // Closing the input queues ends both tasks
        let (closed_tx, _) = mpsc::unbounded_channel();
        let (closed_reply_tx, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.audio_tx, closed_tx));
        drop(std::mem::replace(&mut self.reply_tx, closed_reply_tx));
        for task in self.tasks.drain(..) {
            if timeout(Duration::from_secs(1), task).await.is_err() {
                warn!(session = %self.id, "session task did not stop in time");
            }
        }
        info!(session = %self.id, "voice session closed");
    }
}

/// Consumes incoming audio and gates recognized text
struct ControlTask {
    audio_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    segmenter: SpeechSegmenter,
    recognizer: Arc<dyn Recognizer>,
    controller: BargeInController,
    scheduler: Arc<AudioPlaybackScheduler>,
    events: broadcast::Sender<VoiceEvent>,
    bus: broadcast::Receiver<VoiceEvent>,
}

impl ControlTask {
    async fn run(mut self) {
        loop {
            // Status events first: the controller must know the playback
            // state before it gates any recognized text.
            tokio::select! {
                biased;
                event = self.bus.recv() => {
                    match event {
                        Ok(VoiceEvent::TtsStatus { state, text }) => self.on_tts_status(state, text),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "controller lagged behind the event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                packet = self.audio_rx.recv() => {
                    match packet {
                        Some(packet) => self.on_packet(&packet).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn on_packet(&mut self, packet: &[u8]) {
        for event in self.segmenter.push_packet(packet) {
            match event {
                SegmenterEvent::Segment(segment) => {
                    let wav = segment.to_wav_bytes();
                    let _ = self.events.send(VoiceEvent::SpeechAudio { segment });
                    match self.recognizer.recognize(&wav).await {
                        Ok(utterance) => {
                            let actions = self.controller.on_recognized(utterance).await;
                            self.apply(actions);
                        }
                        Err(e) => warn!("recognition failed: {}", e),
                    }
                }
                SegmenterEvent::UtteranceEnded => {
                    let _ = self.events.send(VoiceEvent::SpeechEnded);
                }
            }
        }
    }

    fn on_tts_status(&mut self, state: TtsState, text: String) {
        match state {
            TtsState::Start => self.controller.on_playback_started(),
            TtsState::Stop => {
                if let Some(action) = self.controller.on_playback_stopped() {
                    self.apply(vec![action]);
                }
            }
            TtsState::SentenceStart => self.controller.on_sentence_started(&text),
            TtsState::SentenceEnd => {}
        }
    }

    fn apply(&self, actions: Vec<ControllerAction>) {
        for action in actions {
            match action {
                ControllerAction::Interrupt => {
                    self.scheduler.interrupt();
                    let _ = self.events.send(VoiceEvent::InterruptSignal);
                }
                ControllerAction::Forward(utterance) => {
                    let _ = self.events.send(VoiceEvent::RecognizedText {
                        utterance: utterance.clone(),
                    });
                    let _ = self.events.send(VoiceEvent::RoutedUserText { utterance });
                }
            }
        }
    }
}

/// Turn lifecycle as the reply task sees it
enum TurnState {
    Idle,
    /// Playback opened; pinned to the scheduler epoch it started under
    Open(u64),
    /// Barge-in killed the turn; its remaining text is discarded
    Interrupted,
}

/// Consumes reply text and drives synthesis into the scheduler
struct ReplyTask {
    reply_rx: mpsc::UnboundedReceiver<ReplyInput>,
    synthesizer: Arc<dyn Synthesizer>,
    scheduler: Arc<AudioPlaybackScheduler>,
    events: broadcast::Sender<VoiceEvent>,
    sample_rate: SampleRate,
    channels: Channels,
    frame_duration_ms: f32,
    voice: String,
}

impl ReplyTask {
    async fn run(mut self) {
        let mut segmenter = SentenceSegmenter::new();
        let mut state = TurnState::Idle;

        while let Some(input) = self.reply_rx.recv().await {
            let done = matches!(&input, ReplyInput::Done);
            let discarding = self.check_interrupt(&mut state, &mut segmenter);

            let units = match input {
                ReplyInput::Text(text) if !discarding => segmenter.push(&text),
                ReplyInput::Done if !discarding => segmenter.finish(),
                _ => Vec::new(),
            };

            for unit in units {
                if self.check_interrupt(&mut state, &mut segmenter) {
                    break;
                }
                match unit {
                    TextUnit::Tag(tag) => match parse_route_tag(&tag) {
                        Some(route) => {
                            if !route.text.is_empty() {
                                self.speak(&route.text, &mut state).await;
                            }
                            let _ = self.events.send(VoiceEvent::RouteCommand(route));
                        }
                        // Non-route tags are inline synthesis markup
                        None => self.speak(&tag, &mut state).await,
                    },
                    TextUnit::Sentence(text) => self.speak(&text, &mut state).await,
                }
            }

            if done {
                if !self.check_interrupt(&mut state, &mut segmenter) {
                    if let TurnState::Open(_) = state {
                        self.scheduler.stop();
                    }
                }
                state = TurnState::Idle;
            }
        }
    }

    /// Notice a barge-in against the open turn
    ///
    /// An epoch mismatch with the scheduler means the turn was interrupted:
    /// buffered text is dropped and everything up to the turn's end is
    /// discarded, so later sentences never resume after the stop.
    fn check_interrupt(&self, state: &mut TurnState, segmenter: &mut SentenceSegmenter) -> bool {
        if let TurnState::Open(epoch) = *state {
            if self.scheduler.epoch() != epoch {
                *segmenter = SentenceSegmenter::new();
                *state = TurnState::Interrupted;
            }
        }
        matches!(state, TurnState::Interrupted)
    }

    /// Synthesize one sentence into paced frames
    ///
    /// The first sentence of a turn opens playback and pins the turn to the
    /// epoch the scheduler stamped on the start command. The sentence-end
    /// mark is sent on every path, including synthesis failure, so the
    /// playback consumer never waits forever.
    async fn speak(&self, text: &str, state: &mut TurnState) {
        if matches!(state, TurnState::Idle) {
            *state = TurnState::Open(self.scheduler.start());
        }
        let TurnState::Open(epoch) = *state else {
            return;
        };
        let _ = self.events.send(VoiceEvent::SentenceStream {
            text: text.to_string(),
        });
        self.scheduler.sentence_start(text);

        match self.synthesizer.synthesize(text, &self.voice, None).await {
            Ok(stream) => self.pump_audio(stream, epoch).await,
            Err(e) => warn!("synthesis failed: {}", e),
        }

        self.scheduler.sentence_end();
    }

    async fn pump_audio(&self, mut stream: mpsc::Receiver<Vec<u8>>, epoch: u64) {
        let codec = match OpusCodec::new(self.sample_rate, self.channels) {
            Ok(codec) => codec,
            Err(e) => {
                warn!("sentence codec init failed: {}", e);
                return;
            }
        };
        let mut repackager = match OpusRepackager::new(codec, self.frame_duration_ms) {
            Ok(repackager) => repackager,
            Err(e) => {
                warn!("repackager init failed: {}", e);
                return;
            }
        };
        let mut parser = OggOpusParser::new();

        while let Some(bytes) = stream.recv().await {
            if self.scheduler.epoch() != epoch {
                debug!("sentence interrupted, dropping the rest of its audio");
                return;
            }
            for unit in parser.push(&bytes) {
                let packet = match unit {
                    OggUnit::Audio(packet) => packet,
                    OggUnit::Header(header) => {
                        debug!(channels = header.channels, "synthesis stream header");
                        continue;
                    }
                    OggUnit::Tags(_) | OggUnit::StreamEnd => continue,
                };
                let duration_ms = packet.duration_ms();
                if duration_ms <= 0.0 {
                    warn!("audio packet with unreadable duration, skipped");
                    continue;
                }
                match repackager.add(packet.payload, duration_ms) {
                    Ok(Some(frame)) => self.scheduler.push_frames(vec![frame]),
                    Ok(None) => {}
                    Err(e) => warn!("frame flush failed: {}", e),
                }
            }
        }

        if self.scheduler.epoch() != epoch {
            return;
        }
        match repackager.finalize() {
            Ok(Some(frame)) => self.scheduler.push_frames(vec![frame]),
            Ok(None) => {}
            Err(e) => warn!("final flush failed: {}", e),
        }
    }
}
